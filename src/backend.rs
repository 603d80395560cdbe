// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the acceleration device.
//!
//! A backend is a provider of hardware-accelerated decoding, typically a VA-API style device
//! that accepts a target surface, a series of parameter and slice-data buffers, and then
//! decodes the picture asynchronously. The decoder treats it as a black box and only drives it
//! through the [`HwBackend`] trait.

#[cfg(test)]
pub(crate) mod dummy;

use thiserror::Error;

use crate::Resolution;
use crate::SurfaceHandle;

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// Decoding profile the hardware context is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    H264High,
    H264ConstrainedBaseline,
    Mpeg4Simple,
    Mpeg4AdvancedSimple,
    H263Baseline,
    Vp8,
    Vc1Simple,
    Vc1Main,
    Vc1Advanced,
}

/// Whether the hardware has finished writing into a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Ready,
    Pending,
}

/// Role a reference surface plays in the prediction of the picture being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceRole {
    /// Entry of an H.264 decoded picture buffer, identified by its picture order count.
    Dpb { poc: i32 },
    /// Past reference for P and B pictures.
    Forward,
    /// Future reference for B pictures.
    Backward,
    Last,
    Golden,
    AltRef,
    /// Surface receiving the in-loop filtered picture of range-mapped VC-1 streams.
    InLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub role: ReferenceRole,
    pub surface: SurfaceHandle,
}

/// One command submitted between [`HwBackend::begin_picture`] and [`HwBackend::end_picture`].
///
/// Parameter payloads are the codec-specific structures produced by the parser; the decoder
/// forwards them untouched, together with the reference surfaces it resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderCommand<'a> {
    PictureParameters {
        params: &'a [u8],
        references: &'a [Reference],
    },
    IqMatrix(&'a [u8]),
    BitPlane(&'a [u8]),
    Probability(&'a [u8]),
    SliceParameters {
        params: &'a [u8],
        ref_list0: &'a [SurfaceHandle],
        ref_list1: &'a [SurfaceHandle],
    },
    SliceData(&'a [u8]),
    /// Encrypted slice data, with the clear slice header describing it.
    ProtectedSliceData { header: &'a [u8], data: &'a [u8] },
}

/// Kind of a decoding error reported for a range of macroblocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroblockErrorKind {
    /// Reconstruction failed for the range.
    Decode,
    /// The range was concealed by the hardware.
    Concealed,
}

/// Range of macroblocks, in raster order, that the hardware reported as erroneous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroblockError {
    pub kind: MacroblockErrorKind,
    pub start_mb: u32,
    pub end_mb: u32,
}

/// Raw NV12 content of a surface, as mapped from the hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawImage {
    pub data: Vec<u8>,
    /// Stride of the luma and chroma planes.
    pub strides: [usize; 2],
    /// Offset of the luma and chroma planes in `data`.
    pub offsets: [usize; 2],
}

/// Command contract of the acceleration device.
///
/// All methods are called from the decoding thread and may block.
pub trait HwBackend {
    /// Creates `count` decode-target surfaces of `resolution`.
    ///
    /// If `external` is not empty, the surfaces must wrap these consumer-provided handles and
    /// the returned list must contain them in the same order.
    fn create_surfaces(
        &mut self,
        resolution: Resolution,
        count: usize,
        external: &[SurfaceHandle],
    ) -> BackendResult<Vec<SurfaceHandle>>;

    /// Creates the decoding context for `profile`, targeting `surfaces`.
    fn create_context(
        &mut self,
        profile: Profile,
        resolution: Resolution,
        surfaces: &[SurfaceHandle],
    ) -> BackendResult<()>;

    /// Destroys the context and every surface created so far.
    fn destroy(&mut self);

    fn begin_picture(&mut self, target: SurfaceHandle) -> BackendResult<()>;

    fn render(&mut self, command: RenderCommand) -> BackendResult<()>;

    /// Submits the picture started by the last call to `begin_picture`.
    fn end_picture(&mut self) -> BackendResult<()>;

    fn query_render_status(&mut self, surface: SurfaceHandle) -> BackendResult<RenderStatus>;

    /// Waits until all pending work on `surface` is completed.
    fn sync(&mut self, surface: SurfaceHandle) -> BackendResult<()>;

    /// Maps `surface` and returns its NV12 content.
    fn read_back(&mut self, surface: SurfaceHandle) -> BackendResult<RawImage>;

    /// Returns the macroblock ranges that failed to decode into `surface`.
    fn query_errors(&mut self, _surface: SurfaceHandle) -> BackendResult<Vec<MacroblockError>> {
        Ok(Vec::new())
    }
}
