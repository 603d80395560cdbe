// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control plane for hardware-accelerated video decoders.
//!
//! This crate drives a "begin/render/end picture" style acceleration device from structured,
//! already-parsed bitstream syntax. It owns the pool of decode-target surfaces, the reference
//! bookkeeping needed for inter prediction and the ordering of decoded pictures for display,
//! while the parser and the device itself are provided by the user through the
//! [`codec::Parser`] and [`backend::HwBackend`] traits.

pub mod backend;
pub mod codec;
pub mod decoder;

/// Opaque identifier of a hardware surface, as understood by the backend and the consumer of
/// decoded frames.
pub type SurfaceHandle = u32;

/// Timestamp value used for frames that have not been given one yet.
pub const INVALID_TIMESTAMP: u64 = u64::MAX;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` is large enough to hold a picture of resolution `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Returns `self` with both dimensions rounded up to the next multiple of 16.
    pub fn mb_aligned(&self) -> Self {
        Self {
            width: align_mb(self.width),
            height: align_mb(self.height),
        }
    }

    /// Same as [`Resolution::mb_aligned`], or `None` if a dimension cannot be aligned.
    pub fn checked_mb_aligned(&self) -> Option<Self> {
        Some(Self {
            width: checked_align_mb(self.width)?,
            height: checked_align_mb(self.height)?,
        })
    }

    pub fn width_in_mbs(&self) -> u32 {
        align_mb(self.width) / 16
    }

    pub fn height_in_mbs(&self) -> u32 {
        align_mb(self.height) / 16
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Rounds `value` up to a whole number of 16-pixel macroblocks. Values past the last whole
/// macroblock representable in a `u32` saturate to it.
pub fn align_mb(value: u32) -> u32 {
    checked_align_mb(value).unwrap_or(u32::MAX & !15)
}

/// Rounds `value` up to a whole number of 16-pixel macroblocks, if the result fits in a `u32`.
pub fn checked_align_mb(value: u32) -> Option<u32> {
    value.checked_add(15).map(|v| v & !15)
}

/// Number of pixels to remove from each edge of a coded picture to obtain the display area.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Crop {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Crop {
    /// Returns the resolution left visible after cropping `coded`.
    pub fn apply(&self, coded: Resolution) -> Resolution {
        Resolution {
            width: coded
                .width
                .saturating_sub(self.left)
                .saturating_sub(self.right),
            height: coded
                .height
                .saturating_sub(self.top)
                .saturating_sub(self.bottom),
        }
    }
}

/// Copies the area of `src` starting at (`x`, `y`) into `dst` as NV12, removing any extra
/// padding.
///
/// `strides` and `offsets` describe the luma and chroma planes of `src`. `x` and `y` must be
/// even so the chroma samples stay aligned.
#[allow(clippy::too_many_arguments)]
pub fn nv12_copy(
    src: &[u8],
    mut dst: &mut [u8],
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    strides: [usize; 2],
    offsets: [usize; 2],
) {
    let mut src_y = &src[offsets[0] + y * strides[0] + x..];

    // Copy luma
    for _ in 0..height {
        dst[..width].copy_from_slice(&src_y[..width]);
        dst = &mut dst[width..];
        src_y = &src_y[strides[0].min(src_y.len())..];
    }

    // Align width and height to 2 for UV plane.
    let width = if width % 2 == 1 { width + 1 } else { width };
    let height = if height % 2 == 1 { height + 1 } else { height };

    // 1 sample per 4 pixels, but we have two components per line.
    let height = height / 2;

    let mut src_uv = &src[offsets[1] + (y / 2) * strides[1] + x..];

    // Copy chroma
    for _ in 0..height {
        dst[..width].copy_from_slice(&src_uv[..width]);
        dst = &mut dst[width..];
        src_uv = &src_uv[strides[1].min(src_uv.len())..];
    }
}

/// Returns the size required to store an NV12 frame of size `width`x`height`, without any
/// padding. This is the minimum size of the destination buffer passed to `nv12_copy`.
pub fn nv12_frame_size(width: usize, height: usize) -> usize {
    let y_size = width * height;
    // U and V planes need to be aligned to 2.
    let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

    y_size + uv_size
}
