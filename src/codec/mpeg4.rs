// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed MPEG-4 part 2 (and H.263 short header) syntax.

use enumn::N;

use crate::backend::Profile;
use crate::Resolution;

#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VopCodingType {
    I = 0,
    P = 1,
    B = 2,
    /// Sprite, treated as a P picture for display purposes.
    S = 3,
}

/// Video object layer fields that matter to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoObjectLayer {
    pub width: u32,
    pub height: u32,
    pub profile_and_level_indication: u8,
    pub short_video_header: bool,
    pub interlaced: bool,
    pub quant_type: bool,
    pub video_full_range: bool,
}

impl VideoObjectLayer {
    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }

    pub fn profile(&self) -> Profile {
        if self.short_video_header {
            Profile::H263Baseline
        } else if (self.profile_and_level_indication & 0xf8) == 0xf0 {
            Profile::Mpeg4AdvancedSimple
        } else {
            Profile::Mpeg4Simple
        }
    }
}

/// One video packet of a VOP, with the VOP header fields it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VopPacket {
    pub vop_coding_type: u8,
    /// `false` for N-VOPs, which carry no picture data.
    pub vop_coded: bool,
    /// Set on the first packet of a VOP.
    pub new_picture: bool,
    pub vop_width: u32,
    pub vop_height: u32,
    pub vop_time_increment: u32,
    pub vop_time_increment_resolution: u32,
    pub sprite_warping_points: u8,
    pub offset: usize,
    pub size: usize,
    /// Picture parameters, forwarded to the backend as is.
    pub picture_params: Vec<u8>,
    /// Slice parameters, forwarded to the backend as is.
    pub slice_params: Vec<u8>,
}

impl VopPacket {
    pub fn coding_type(&self) -> Option<VopCodingType> {
        VopCodingType::n(self.vop_coding_type)
    }
}

/// Everything the parser extracted from one input buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unit {
    pub layer: VideoObjectLayer,
    pub iq_matrix: Vec<u8>,
    pub packets: Vec<VopPacket>,
}
