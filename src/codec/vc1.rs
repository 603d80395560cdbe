// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed VC-1 / WMV syntax.

use enumn::N;

use crate::backend::Profile;
use crate::Resolution;

#[derive(N, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureType {
    I = 0,
    P = 1,
    B = 2,
    Bi = 3,
    Skipped = 4,
}

/// Sequence-level fields that matter to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceLayer {
    /// 0 simple, 1 main, 3 advanced.
    pub profile: u8,
    pub width: u32,
    pub height: u32,
    pub range_mapy_flag: bool,
    pub range_mapuv_flag: bool,
    pub rangered: bool,
}

impl SequenceLayer {
    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }

    pub fn va_profile(&self) -> Profile {
        match self.profile {
            0 => Profile::Vc1Simple,
            1 => Profile::Vc1Main,
            _ => Profile::Vc1Advanced,
        }
    }

    /// Whether decoded pictures go through range mapping after in-loop filtering.
    pub fn is_range_mapped(&self) -> bool {
        self.range_mapy_flag || self.range_mapuv_flag || self.rangered
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceData {
    pub offset: usize,
    pub size: usize,
    pub params: Vec<u8>,
}

/// One frame or field picture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Picture {
    pub picture_type: u8,
    pub is_first_field: bool,
    pub reference_distance_flag: bool,
    pub reference_distance: u8,
    /// Two reference fields are used by this P field.
    pub num_reference_pictures: bool,
    /// The second closest I/P field is used for prediction.
    pub reference_field_pic_indicator: bool,
    pub picture_params: Vec<u8>,
    pub bitplanes: Option<Vec<u8>>,
    pub slices: Vec<SliceData>,
}

impl Picture {
    pub fn kind(&self) -> Option<PictureType> {
        PictureType::n(self.picture_type)
    }
}

/// Everything the parser extracted from one input buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unit {
    pub sequence: SequenceLayer,
    pub pictures: Vec<Picture>,
}
