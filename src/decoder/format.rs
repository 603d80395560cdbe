// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream format as seen by the consumer, and detection of changes that require new surfaces.

use log::info;

use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::Crop;
use crate::Resolution;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorMatrix {
    #[default]
    Unspecified,
    Bt601,
    Bt709,
}

impl ColorMatrix {
    /// Maps the `matrix_coefficients` value of the stream's video usability information.
    pub fn from_coefficients(matrix_coefficients: u8) -> Self {
        match matrix_coefficients {
            1 => Self::Bt709,
            5 | 6 => Self::Bt601,
            _ => Self::Unspecified,
        }
    }
}

/// Format of the decoded stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatInfo {
    /// Coded size of the pictures, aligned to whole macroblocks.
    pub coded: Resolution,
    /// Size of the allocated surfaces.
    pub surface: Resolution,
    pub crop: Crop,
    pub aspect_ratio: (u32, u32),
    pub video_full_range: bool,
    pub color_matrix: ColorMatrix,
    /// Bit rate signaled by the stream, in bits per second. Only H.264 sequences carry one,
    /// it is 0 for the other codecs.
    pub bitrate: u32,
    /// Number of surfaces the consumer must provide to decode this stream.
    pub buffers_needed: usize,
}

impl FormatInfo {
    /// Visible area of the pictures.
    pub fn display(&self) -> Resolution {
        self.crop.apply(self.coded)
    }
}

/// Follows the stream format across sequence changes.
#[derive(Debug, Default)]
pub struct FormatTracker {
    info: FormatInfo,
    /// Number of consumer-provided surfaces, which cannot grow without the consumer's help.
    provided_surfaces: Option<usize>,
    size_changed: bool,
    valid: bool,
}

impl FormatTracker {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn info(&self) -> &FormatInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut FormatInfo {
        &mut self.info
    }

    /// Whether a stream format has been seen.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Records the size of the stream's pictures. The padding added to reach whole macroblocks
    /// is cropped. Returns whether the coded size differs from the previous one.
    pub fn set_coded_size(&mut self, size: Resolution) -> DecodeResult<bool> {
        let coded = size.checked_mb_aligned().ok_or_else(|| {
            DecodeError::InvalidData(format!(
                "picture size {}x{} out of range",
                size.width, size.height
            ))
        })?;
        let changed = self.valid && coded != self.info.coded;

        self.info.crop = Crop {
            right: coded.width - size.width,
            bottom: coded.height - size.height,
            ..Default::default()
        };

        if changed {
            info!(
                "stream size changed from {}x{} to {}x{}",
                self.info.coded.width, self.info.coded.height, coded.width, coded.height
            );
            self.size_changed = true;
        }
        self.info.coded = coded;
        self.valid = true;

        Ok(changed)
    }

    /// Records the surfaces that have been allocated for the stream. `provided` is the number of
    /// surfaces the consumer handed over, if the decoder does not own them.
    pub fn set_allocation(&mut self, surface: Resolution, provided: Option<usize>) {
        self.info.surface = surface;
        self.provided_surfaces = provided;
    }

    /// Whether the current stream no longer fits in the allocated surfaces. A stream that got
    /// smaller keeps using them.
    pub fn needs_reallocation(&self) -> bool {
        !self.info.surface.can_contain(self.info.coded)
            || self
                .provided_surfaces
                .map_or(false, |count| self.info.buffers_needed > count)
    }

    /// Returns whether the size changed since the last call.
    pub fn take_size_changed(&mut self) -> bool {
        std::mem::take(&mut self.size_changed)
    }

    pub fn mark_size_changed(&mut self) {
        self.size_changed = true;
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(surface: (u32, u32), count: usize) -> FormatTracker {
        let mut tracker = FormatTracker::new();
        tracker.set_coded_size(Resolution::from(surface)).unwrap();
        tracker.set_allocation(Resolution::from(surface), Some(count));
        tracker.info_mut().buffers_needed = count;
        tracker
    }

    #[test]
    fn shrink_keeps_surfaces() {
        let mut tracker = tracker((1920, 1088), 8);

        assert!(tracker.set_coded_size(Resolution::from((1280, 720))).unwrap());
        assert!(!tracker.needs_reallocation());
        assert!(tracker.take_size_changed());
        assert!(!tracker.take_size_changed());
    }

    #[test]
    fn growth_needs_new_surfaces() {
        let mut tracker = tracker((1280, 720), 8);

        assert!(tracker.set_coded_size(Resolution::from((1920, 1080))).unwrap());
        assert_eq!(tracker.info().coded, Resolution::from((1920, 1088)));
        assert_eq!(tracker.info().display(), Resolution::from((1920, 1080)));
        assert!(tracker.needs_reallocation());
    }

    #[test]
    fn more_buffers_needs_new_surfaces() {
        let mut tracker = tracker((1280, 720), 8);

        assert!(!tracker.set_coded_size(Resolution::from((1280, 720))).unwrap());
        tracker.info_mut().buffers_needed = 9;
        assert!(tracker.needs_reallocation());
    }

    #[test]
    fn owned_surfaces_ignore_buffer_count() {
        let mut tracker = FormatTracker::new();
        tracker.set_coded_size(Resolution::from((1280, 720))).unwrap();
        tracker.set_allocation(Resolution::from((1280, 720)), None);

        tracker.info_mut().buffers_needed = 30;
        assert!(!tracker.needs_reallocation());
    }

    #[test]
    fn first_size_is_not_a_change() {
        let mut tracker = FormatTracker::new();

        assert!(!tracker.set_coded_size(Resolution::from((352, 288))).unwrap());
        assert!(!tracker.take_size_changed());
    }

    #[test]
    fn unalignable_size_is_rejected() {
        let mut tracker = tracker((1280, 720), 8);

        assert!(matches!(
            tracker.set_coded_size(Resolution::from((u32::MAX - 3, 720))),
            Err(DecodeError::InvalidData(_))
        ));
        assert_eq!(tracker.info().coded, Resolution::from((1280, 720)));
        assert!(!tracker.take_size_changed());
    }

    #[test]
    fn color_matrix() {
        assert_eq!(ColorMatrix::from_coefficients(1), ColorMatrix::Bt709);
        assert_eq!(ColorMatrix::from_coefficients(6), ColorMatrix::Bt601);
        assert_eq!(ColorMatrix::from_coefficients(2), ColorMatrix::Unspecified);
    }
}
