// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed VP8 frame syntax.

use enumn::N;

use crate::Resolution;

#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    KeyFrame = 0,
    InterFrame = 1,
    Skipped = 2,
}

/// Buffer copied into the golden frame before it is (optionally) refreshed.
#[derive(N, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GoldenCopy {
    #[default]
    None = 0,
    FromLast = 1,
    FromAltRef = 2,
}

/// Buffer copied into the alternate reference frame before it is (optionally) refreshed.
#[derive(N, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AltRefCopy {
    #[default]
    None = 0,
    FromLast = 1,
    FromGolden = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    pub show_frame: bool,
    pub refresh_last: bool,
    pub refresh_golden_frame: bool,
    pub refresh_alternate_frame: bool,
    pub copy_buffer_to_golden: GoldenCopy,
    pub copy_buffer_to_alternate: AltRefCopy,
    /// Offset and size of the compressed partitions in the parsed buffer.
    pub offset: usize,
    pub size: usize,
    pub picture_params: Vec<u8>,
    pub probability: Vec<u8>,
    pub iq_matrix: Vec<u8>,
    pub slice_params: Vec<u8>,
}

impl Frame {
    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }

    pub fn is_reference(&self) -> bool {
        matches!(
            self.frame_type,
            FrameType::KeyFrame | FrameType::InterFrame
        )
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            frame_type: FrameType::KeyFrame,
            width: 0,
            height: 0,
            show_frame: true,
            refresh_last: true,
            refresh_golden_frame: false,
            refresh_alternate_frame: false,
            copy_buffer_to_golden: Default::default(),
            copy_buffer_to_alternate: Default::default(),
            offset: 0,
            size: 0,
            picture_params: Vec::new(),
            probability: Vec::new(),
            iq_matrix: Vec::new(),
            slice_params: Vec::new(),
        }
    }
}
