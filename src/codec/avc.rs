// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed H.264 syntax, as handed to the AVC state machine.

use enumn::N;

use crate::Crop;
use crate::Resolution;

/// `profile_idc` of the baseline profile.
pub const PROFILE_BASELINE: u8 = 66;

/// Maximum number of entries in a reference picture list.
pub const MAX_REF_LIST_SIZE: usize = 32;

/// Maximum number of frames in the decoded picture buffer.
pub const MAX_DPB_FRAMES: usize = 16;

#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

impl NaluType {
    /// Extracts the type from the first byte of a NAL unit.
    pub fn from_header_byte(byte: u8) -> Option<Self> {
        Self::n(byte & 0x1f)
    }

    pub fn is_slice(&self) -> bool {
        matches!(
            self,
            Self::Slice | Self::SliceDpa | Self::SliceDpb | Self::SliceDpc | Self::SliceIdr
        )
    }

    /// SEI, SPS and PPS: the units whose payload must be parsed in the clear.
    pub fn is_header(&self) -> bool {
        matches!(self, Self::Sei | Self::Sps | Self::Pps)
    }
}

#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Interprets `slice_type`, which can be offset by 5 to signal that all slices of the
    /// picture share the same type.
    pub fn from_raw(slice_type: u8) -> Option<Self> {
        Self::n(slice_type % 5)
    }
}

/// Fields of the active SPS that matter to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub pic_width_in_mbs: u32,
    pub pic_height_in_mbs: u32,
    pub num_ref_frames: u32,
    pub crop: Crop,
    pub sar_width: u16,
    pub sar_height: u16,
    pub video_full_range_flag: bool,
    pub matrix_coefficients: u8,
    pub bit_rate: u32,
}

impl SequenceInfo {
    pub fn coded_resolution(&self) -> Resolution {
        Resolution::from((
            self.pic_width_in_mbs.saturating_mul(16),
            self.pic_height_in_mbs.saturating_mul(16),
        ))
    }

    pub fn is_constrained_baseline(&self) -> bool {
        (self.profile_idc == PROFILE_BASELINE || self.constraint_set0_flag)
            && self.constraint_set1_flag
    }

    /// Number of frames the decoded picture buffer must hold for this sequence, plus one for the
    /// picture being decoded.
    pub fn dpb_size(&self) -> usize {
        // MaxDpbMbs-derived sizes, in units of 1024 bytes.
        const MAX_DPB_PER_LEVEL: [(u8, f32); 16] = [
            (9, 148.5),
            (10, 148.5),
            (11, 337.5),
            (12, 891.0),
            (13, 891.0),
            (20, 891.0),
            (21, 1782.0),
            (22, 3037.5),
            (30, 3037.5),
            (31, 6750.0),
            (32, 7680.0),
            (40, 12288.0),
            (41, 12288.0),
            (42, 13056.0),
            (50, 41400.0),
            (51, 69120.0),
        ];

        let frame_mbs = self.pic_width_in_mbs as f32 * self.pic_height_in_mbs as f32;
        let mut size = MAX_DPB_PER_LEVEL
            .iter()
            .find(|(level, _)| *level == self.level_idc)
            .filter(|_| frame_mbs > 0.0)
            .map(|(_, max_dpb)| (max_dpb * 1024.0 / (frame_mbs * 384.0)) as usize)
            .unwrap_or(0)
            .min(MAX_DPB_FRAMES);

        if size == 0 {
            log::warn!("invalid DPB size for level {}, using 3", self.level_idc);
            size = 3;
        }

        size = size.max(self.num_ref_frames as usize);

        size + 1
    }
}

/// A picture as referred to by the picture and slice parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PictureRef {
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub frame_idx: u32,
    pub top_field: bool,
    pub bottom_field: bool,
    pub short_term_reference: bool,
    pub long_term_reference: bool,
    /// Unused entry of a reference list.
    pub invalid: bool,
}

impl PictureRef {
    /// Picture order count of the field or frame this refers to.
    pub fn poc(&self) -> i32 {
        if self.bottom_field {
            self.bottom_field_order_cnt
        } else {
            self.top_field_order_cnt
        }
    }

    pub fn is_reference(&self) -> bool {
        self.short_term_reference || self.long_term_reference
    }

    pub fn is_field(&self) -> bool {
        self.top_field || self.bottom_field
    }

    /// Whether `poc` designates either field of this picture.
    pub fn matches_poc(&self, poc: i32) -> bool {
        self.top_field_order_cnt == poc || self.bottom_field_order_cnt == poc
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Slice {
    pub first_mb_in_slice: u32,
    pub slice_type: u8,
    /// Position of the slice NAL unit in the parsed buffer.
    pub offset: usize,
    pub size: usize,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list0: Vec<PictureRef>,
    pub ref_pic_list1: Vec<PictureRef>,
    /// Slice parameters, forwarded to the backend as is.
    pub params: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Picture {
    pub current: PictureRef,
    /// Reference frames declared by the picture parameters.
    pub reference_frames: Vec<PictureRef>,
    /// Picture parameters, forwarded to the backend as is.
    pub params: Vec<u8>,
    pub slices: Vec<Slice>,
}

/// Everything the parser extracted from one input buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessUnit {
    pub has_sps: bool,
    pub has_pps: bool,
    pub new_sps: bool,
    pub new_pps: bool,
    pub sequence: SequenceInfo,
    pub iq_matrix: Vec<u8>,
    pub pictures: Vec<Picture>,
}

impl AccessUnit {
    /// Whether the pictures of this unit cover a single field only.
    pub fn is_single_field(&self) -> bool {
        let top = self.pictures.iter().any(|p| p.current.top_field);
        let bottom = self.pictures.iter().any(|p| p.current.bottom_field);

        top != bottom
    }
}
