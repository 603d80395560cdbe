// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder-facing types shared by all codecs.
//!
//! The actual decoding machinery lives in [`stateless`]; this module defines what goes in and
//! out of it: the configuration passed at start, the input buffers, the decoded frames handed
//! back to the client, and the error taxonomy.

pub mod dpb;
pub mod format;
pub mod output;
pub mod stateless;
pub mod surface_pool;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::MacroblockError;
use crate::backend::MacroblockErrorKind;
use crate::decoder::stateless::avc::secure::SecureSidecar;
use crate::Resolution;
use crate::SurfaceHandle;

/// Maximum number of error ranges carried by an [`ErrorReport`].
pub const MAX_ERROR_RANGES: usize = 32;

/// Decoder configuration, fixed for the lifetime of a started decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Nominal coded resolution of the stream. External surfaces are assumed to be of this size.
    pub resolution: Resolution,
    /// Disables reordering: every decoded frame is output in decode order.
    pub low_delay: bool,
    /// Uses the platform maximum reorder window instead of the codec-derived one, so the stream
    /// can change resolution without changing the output behavior.
    pub adaptive: bool,
    /// Surfaces provided by the consumer. If empty, the decoder allocates its own.
    pub external_surfaces: Vec<SurfaceHandle>,
    /// Lower bound on the number of internally allocated surfaces.
    pub min_surfaces: Option<usize>,
    /// Attaches the cropped NV12 content of each decoded frame to its output.
    pub raw_output: bool,
    /// Queries the backend for macroblock errors when a frame is output.
    pub error_report: bool,
    /// Outputs the last reference picture again for each skipped picture. Otherwise skipped
    /// pictures produce no output and the consumer keeps displaying the previous frame.
    pub repeat_skipped_frames: bool,
}

/// Flags attached to an input buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// The buffer ends a complete frame.
    pub has_complete_frame: bool,
    /// The payload is encrypted and described by a [`SecureSidecar`].
    pub is_secure: bool,
    /// The frame must be decoded but the client does not intend to display it.
    pub want_decode_only: bool,
    /// The buffer starts at a sync point of the stream.
    pub is_sync_frame: bool,
}

/// One coded access unit submitted to [`decode`](stateless::StatelessDecoder::decode).
#[derive(Debug, Clone, Copy)]
pub struct InputBuffer<'a> {
    pub timestamp: u64,
    pub data: &'a [u8],
    pub flags: BufferFlags,
    /// Clear description of the units of an encrypted payload.
    pub sidecar: Option<&'a SecureSidecar>,
}

impl<'a> InputBuffer<'a> {
    pub fn new(timestamp: u64, data: &'a [u8]) -> Self {
        Self {
            timestamp,
            data,
            flags: Default::default(),
            sidecar: None,
        }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sidecar(mut self, sidecar: &'a SecureSidecar) -> Self {
        self.sidecar = Some(sidecar);
        self.flags.is_secure = true;
        self
    }
}

/// Location of the next coded picture when an input buffer holds more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedFrame {
    /// Offset in the input buffer where the remaining data starts.
    pub offset: usize,
    /// Timestamp to use when submitting the remaining data.
    pub timestamp: u64,
}

/// Non-error outcome of a decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Success,
    /// The buffer was consumed without producing a frame.
    FrameDropped,
    /// Only the first picture of the buffer was consumed. The caller must submit the rest of
    /// the buffer again, starting at the returned offset.
    MultipleFrames(PackedFrame),
}

/// Error returned by the decoder.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no surface available, return decoded frames and retry")]
    NoSurface,
    #[error("a reference picture is missing")]
    NoReference,
    #[error("stream format changed, the decoder must be reconfigured")]
    FormatChanged,
    #[error("sequence or picture parameters not received yet")]
    NoConfig,
    #[error("decoder is not started")]
    NotStarted,
    #[error("invalid configuration: {0}")]
    BadConfig(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("parser failure: {0:#}")]
    ParserFailure(anyhow::Error),
    #[error("driver failure: {0}")]
    DriverFailure(#[from] BackendError),
    #[error("memory allocation failed: {0}")]
    MemoryFailure(String),
    #[error("decoder failure: {0}")]
    Fail(String),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Flags attached to an output frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputFlags {
    /// Last frame of a drain.
    pub eos: bool,
    /// Decoded for reference purposes only, not meant for display.
    pub decode_only: bool,
    /// First frame decoded after the stream resolution changed.
    pub resolution_change: bool,
    /// Only one field of the frame was decoded.
    pub single_field: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A reference picture was missing and a substitute was used.
    ReferenceMissing,
    Macroblock(MacroblockErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRange {
    pub kind: ErrorKind,
    pub start_mb: u32,
    pub end_mb: u32,
}

/// Recoverable errors that affected a decoded frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    ranges: Vec<ErrorRange>,
}

impl ErrorReport {
    /// Records that a reference was missing. Only counted once per frame.
    pub fn record_missing_reference(&mut self) {
        if !self.has_missing_reference() {
            self.push(ErrorRange {
                kind: ErrorKind::ReferenceMissing,
                start_mb: 0,
                end_mb: 0,
            });
        }
    }

    pub fn has_missing_reference(&self) -> bool {
        self.ranges
            .iter()
            .any(|r| r.kind == ErrorKind::ReferenceMissing)
    }

    pub fn extend_macroblock_errors(&mut self, errors: &[MacroblockError]) {
        for e in errors {
            self.push(ErrorRange {
                kind: ErrorKind::Macroblock(e.kind),
                start_mb: e.start_mb,
                end_mb: e.end_mb,
            });
        }
    }

    fn push(&mut self, range: ErrorRange) {
        if self.ranges.len() < MAX_ERROR_RANGES {
            self.ranges.push(range);
        }
    }

    pub fn ranges(&self) -> &[ErrorRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// A decoded frame, ready for display.
///
/// The surface stays owned by the consumer until it is handed back with
/// [`signal_render_done`](stateless::StatelessDecoder::signal_render_done).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub surface: SurfaceHandle,
    pub timestamp: u64,
    pub poc: i32,
    pub flags: OutputFlags,
    pub errors: ErrorReport,
    pub display_resolution: Resolution,
    /// Cropped NV12 content, if raw output was requested.
    pub raw: Option<Vec<u8>>,
}
