// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 state machine.
//!
//! Frames are identified by picture order count: references are resolved through a
//! [`Dpb`](crate::decoder::dpb::Dpb) and frames are output by increasing POC. A frame can span
//! several input buffers (one per field, or a picture split over several buffers), and a buffer
//! can hold more than one frame, in which case the caller is asked to submit the rest again.

pub mod secure;

use std::borrow::Cow;

use anyhow::anyhow;
use log::debug;
use log::error;
use log::warn;

use crate::backend::HwBackend;
use crate::backend::Profile;
use crate::backend::Reference;
use crate::backend::ReferenceRole;
use crate::backend::RenderCommand;
use crate::codec::avc::AccessUnit;
use crate::codec::avc::PictureRef;
use crate::codec::avc::SequenceInfo;
use crate::codec::avc::SliceType;
use crate::codec::avc::MAX_REF_LIST_SIZE;
use crate::codec::avc::PROFILE_BASELINE;
use crate::codec::Parser;
use crate::decoder::dpb::Dpb;
use crate::decoder::format::ColorMatrix;
use crate::decoder::output::OutputMethod;
use crate::decoder::output::OUTPUT_WINDOW_SIZE;
use crate::decoder::stateless::avc::secure::SecureSliceAdapter;
use crate::decoder::stateless::slice_bytes;
use crate::decoder::stateless::DecoderCore;
use crate::decoder::stateless::FrameState;
use crate::decoder::stateless::FrameStateMachine;
use crate::decoder::stateless::ReferenceLists;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StreamRequirements;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::DecodeStatus;
use crate::decoder::DecoderConfig;
use crate::decoder::InputBuffer;
use crate::decoder::PackedFrame;

/// Surfaces allocated on top of the DPB for the output queue and the consumer.
const AVC_EXTRA_SURFACES: usize = 11;
/// Surface limit of the hardware for 1088-line streams.
const MAX_SURFACES_1088: usize = 19;
/// Surfaces held by the consumer's display queue.
const CONSUMER_SURFACES: usize = 2;
/// Surfaces needed by the display to cycle buffers.
const DISPLAY_CYCLING_SURFACES: usize = 2;

/// Fields covered by one or more pictures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Fields {
    top: bool,
    bottom: bool,
}

impl Fields {
    fn of(picture: &PictureRef) -> Self {
        Self {
            top: picture.top_field,
            bottom: picture.bottom_field,
        }
    }

    fn union(self, other: Self) -> Self {
        Self {
            top: self.top || other.top,
            bottom: self.bottom || other.bottom,
        }
    }

    fn is_pair(&self) -> bool {
        self.top && self.bottom
    }
}

/// H.264 state machine.
#[derive(Debug, Default)]
pub struct Avc {
    dpb: Dpb,
    /// Fields decoded since the last frame boundary, to pair the second field with its frame.
    last_fields: Fields,
    secure: SecureSliceAdapter,
}

impl Avc {
    pub fn new() -> Self {
        Default::default()
    }

    /// Reorder window for `sequence`.
    fn window(config: &DecoderConfig, sequence: &SequenceInfo) -> usize {
        if config.adaptive {
            OUTPUT_WINDOW_SIZE
        } else {
            sequence.dpb_size().min(OUTPUT_WINDOW_SIZE)
        }
    }

    /// Number of surfaces a consumer must provide to decode `sequence`.
    fn buffers_needed(window: usize, sequence: &SequenceInfo) -> usize {
        window
            + CONSUMER_SURFACES
            + sequence.num_ref_frames as usize
            + DISPLAY_CYCLING_SURFACES
            + 1
    }

    fn begin_frame<B: HwBackend>(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &AccessUnit,
    ) -> DecodeResult<DecodeStatus> {
        let Some(picture) = unit.pictures.first() else {
            return Err(DecodeError::Fail("no picture to begin".into()));
        };

        let index = core.acquire(input, picture.current.is_reference())?;
        let slot = core.pool.slot_mut(index);
        slot.poc = picture.current.poc();
        slot.flags.single_field = unit.is_single_field();

        self.continue_frame(core, input, unit)
    }

    fn continue_frame<B: HwBackend>(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &AccessUnit,
    ) -> DecodeResult<DecodeStatus> {
        let current = core.acquired()?;

        for (index, picture) in unit.pictures.iter().enumerate() {
            if index > 0 && !picture.current.is_field() {
                // A second frame in the same buffer.
                let last_slice = unit.pictures[index - 1].slices.last().ok_or_else(|| {
                    DecodeError::ParserFailure(anyhow!("picture {} has no slice", index - 1))
                })?;
                let packed = PackedFrame {
                    offset: last_slice.offset + last_slice.size,
                    timestamp: core.current_timestamp,
                };
                debug!("packed frame, remaining data at offset {}", packed.offset);

                return Ok(DecodeStatus::MultipleFrames(packed));
            }

            if picture.slices.is_empty() {
                return Err(DecodeError::ParserFailure(anyhow!(
                    "picture {} has no slice",
                    index
                )));
            }

            for slice in 0..picture.slices.len() {
                if let Err(e) = self.decode_slice(core, input, unit, index, slice) {
                    error!("failed to decode slice {} of picture {}: {}", slice, index, e);
                    if let Err(e) = core.end_frame(true) {
                        warn!("error while dropping the frame: {}", e);
                    }
                    // The picture cannot be used as a reference anymore.
                    if picture.current.is_reference() {
                        self.dpb
                            .remove(&mut core.pool, picture.current.poc(), current);
                    }

                    return Err(e);
                }
            }
        }

        Ok(DecodeStatus::Success)
    }

    /// Starts a new picture of the frame in progress.
    fn begin_picture<B: HwBackend>(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &AccessUnit,
        picture: usize,
    ) -> DecodeResult<()> {
        let pic = &unit.pictures[picture];
        let current = core.acquired()?;

        if core.is_decoding_frame() {
            // Second field: the first one is complete.
            if core.frame_state() == FrameState::FrameOpen {
                core.end_picture()?;
            }
            // The frame is displayed at the POC of its first field in display order.
            let slot = core.pool.slot_mut(current);
            slot.poc = slot.poc.min(pic.current.poc());
        }

        self.dpb.update(
            &mut core.pool,
            &pic.current,
            &pic.reference_frames,
            current,
            core.last_reference,
        )?;

        let references: Vec<_> = pic
            .reference_frames
            .iter()
            .filter(|r| !r.invalid)
            .filter_map(|r| {
                self.dpb.find(r).map(|slot| Reference {
                    role: ReferenceRole::Dpb { poc: r.poc() },
                    surface: core.surface(slot),
                })
            })
            .collect();

        core.begin_picture()?;
        core.render(RenderCommand::PictureParameters {
            params: &pic.params,
            references: &references,
        })?;
        core.render(RenderCommand::IqMatrix(&unit.iq_matrix))
    }
}

impl<B: HwBackend> StatelessDecoder<Avc, B> {
    /// Creates a new H.264 decoder using the given `parser` and `backend`.
    pub fn new_avc(parser: Box<dyn Parser<Unit = AccessUnit>>, backend: B) -> Self {
        Self::new(Avc::new(), parser, backend)
    }
}

impl<B: HwBackend> FrameStateMachine<B> for Avc {
    type Unit = AccessUnit;

    fn clear_data<'a>(&mut self, input: &InputBuffer<'a>) -> DecodeResult<Option<Cow<'a, [u8]>>> {
        if !input.flags.is_secure {
            self.secure.clear();
            return Ok(Some(Cow::Borrowed(input.data)));
        }

        let sidecar = input
            .sidecar
            .ok_or_else(|| DecodeError::InvalidData("secure buffer without sidecar".into()))?;

        Ok(self
            .secure
            .prepare(sidecar, input.data.len())?
            .map(Cow::Owned))
    }

    fn stream_requirements(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &AccessUnit,
    ) -> DecodeResult<Option<StreamRequirements>> {
        if !unit.has_sps || !unit.has_pps {
            debug!("SPS or PPS not available yet");
            return Ok(None);
        }

        let sequence = &unit.sequence;
        let coded = sequence.coded_resolution();
        if coded.is_empty() {
            warn!("SPS without picture size");
            return Ok(None);
        }

        self.update_format_info(core, unit)?;

        let dpb_size = sequence.dpb_size();
        let mut surfaces = dpb_size + AVC_EXTRA_SURFACES;
        if coded.height == 1088 && surfaces > MAX_SURFACES_1088 {
            surfaces = MAX_SURFACES_1088;
        }

        let profile = if sequence.is_constrained_baseline() {
            Profile::H264ConstrainedBaseline
        } else {
            Profile::H264High
        };

        // Adaptive playback keeps the same output behavior across resolution changes.
        let low_delay = if core.config.adaptive {
            false
        } else {
            core.config.low_delay || sequence.profile_idc == PROFILE_BASELINE
        };

        let window = Self::window(&core.config, sequence);
        debug!("DPB size {}, reorder window {}", dpb_size, window);

        Ok(Some(StreamRequirements {
            profile,
            coded,
            surfaces,
            extra_surfaces: 0,
            window,
            method: OutputMethod::ByPictureOrder,
            low_delay: Some(low_delay),
            manage_references: false,
            buffers_needed: Some(Self::buffers_needed(window, sequence)),
        }))
    }

    fn update_format_info(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &AccessUnit,
    ) -> DecodeResult<()> {
        let sequence = &unit.sequence;
        let coded = sequence.coded_resolution();
        if coded.is_empty() {
            return Ok(());
        }

        core.format.set_coded_size(coded)?;
        let window = Self::window(&core.config, sequence);

        let info = core.format.info_mut();
        info.crop = sequence.crop;
        info.aspect_ratio = (sequence.sar_width as u32, sequence.sar_height as u32);
        info.video_full_range = sequence.video_full_range_flag;
        info.color_matrix = ColorMatrix::from_coefficients(sequence.matrix_coefficients);
        info.bitrate = sequence.bit_rate;
        info.buffers_needed = Self::buffers_needed(window, sequence);
        debug!("buffers needed: {}", info.buffers_needed);

        core.check_format()
    }

    fn is_new_frame(&mut self, core: &DecoderCore<B>, input: &InputBuffer, unit: &AccessUnit) -> bool {
        let Some(picture) = unit.pictures.first() else {
            return true;
        };
        let Some(slice) = picture.slices.first() else {
            return true;
        };
        let in_frame = core.pool.acquired().is_some();

        if slice.first_mb_in_slice != 0 {
            // Continuation of a partial frame, unless the first slice got lost.
            if core.current_timestamp != input.timestamp {
                warn!("first slice of the frame at {} is missing", input.timestamp);
                return true;
            }
            return !in_frame;
        }

        let fields = Fields::of(&picture.current);
        if fields.is_pair() {
            warn!("picture covers both fields");
        }

        if in_frame && self.last_fields.union(fields).is_pair() {
            debug!("opposite field of the frame in progress");
            self.last_fields = Default::default();
            return false;
        }

        self.last_fields = unit
            .pictures
            .iter()
            .fold(Fields::default(), |f, p| f.union(Fields::of(&p.current)));
        if self.last_fields.is_pair() {
            // Both fields are in this buffer.
            self.last_fields = Default::default();
        }

        true
    }

    fn set_reference(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &AccessUnit,
        picture: usize,
        slice: usize,
    ) -> DecodeResult<ReferenceLists> {
        let params = &unit.pictures[picture].slices[slice];
        let slice_type = SliceType::from_raw(params.slice_type).ok_or_else(|| {
            DecodeError::ParserFailure(anyhow!("invalid slice type {}", params.slice_type))
        })?;
        let num_lists = match slice_type {
            SliceType::I | SliceType::Si => 0,
            SliceType::P | SliceType::Sp => 1,
            SliceType::B => 2,
        };

        let current = core.acquired()?;
        let lists = [
            (params.num_ref_idx_l0_active_minus1, &params.ref_pic_list0),
            (params.num_ref_idx_l1_active_minus1, &params.ref_pic_list1),
        ];
        let mut resolved = [Vec::new(), Vec::new()];

        for (list, (active_minus1, entries)) in lists.into_iter().enumerate().take(num_lists) {
            let active_minus1 = active_minus1 as usize;
            if active_minus1 >= MAX_REF_LIST_SIZE {
                return Err(DecodeError::ParserFailure(anyhow!(
                    "invalid num_ref_idx_l{}_active_minus1 {}",
                    list,
                    active_minus1
                )));
            }

            // Unused entries are skipped, the ones after them still count.
            for reference in entries.iter().take(active_minus1 + 1).filter(|r| !r.invalid) {
                let slot = match self.dpb.find(reference) {
                    Some(slot) => slot,
                    None => {
                        core.pool.slot_mut(current).errors.record_missing_reference();
                        match core.last_reference {
                            Some(last) => {
                                warn!(
                                    "reference with POC {} missing, using last reference",
                                    reference.poc()
                                );
                                last
                            }
                            None => {
                                error!("reference with POC {} missing", reference.poc());
                                return Err(DecodeError::NoReference);
                            }
                        }
                    }
                };
                resolved[list].push(core.surface(slot));
            }
        }

        let [list0, list1] = resolved;
        Ok(ReferenceLists {
            picture: Vec::new(),
            list0,
            list1,
        })
    }

    fn decode_slice(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &AccessUnit,
        picture: usize,
        slice: usize,
    ) -> DecodeResult<()> {
        let params = &unit.pictures[picture].slices[slice];

        if params.first_mb_in_slice == 0 || core.frame_state() != FrameState::FrameOpen {
            if params.first_mb_in_slice != 0 {
                warn!("first slice of the picture is lost");
            }
            self.begin_picture(core, unit, picture)?;
        }

        let lists = self.set_reference(core, unit, picture, slice)?;
        core.render(RenderCommand::SliceParameters {
            params: &params.params,
            ref_list0: &lists.list0,
            ref_list1: &lists.list1,
        })?;

        if self.secure.is_active() {
            let protected = self.secure.next_slice()?;
            let data = slice_bytes(input.data, protected.offset, protected.length)?;
            core.render(RenderCommand::ProtectedSliceData {
                header: &protected.header,
                data,
            })
        } else {
            let data = slice_bytes(input.data, params.offset, params.size)?;
            core.render(RenderCommand::SliceData(data))
        }
    }

    fn decode_unit(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &AccessUnit,
    ) -> DecodeResult<DecodeStatus> {
        if !unit.has_sps || !unit.has_pps {
            return Err(DecodeError::NoConfig);
        }

        if unit.new_sps || unit.new_pps {
            self.update_format_info(core, unit)?;
        }

        if unit.pictures.first().map_or(true, |p| p.slices.is_empty()) {
            debug!("no slice to decode");
            return Ok(DecodeStatus::Success);
        }

        let new_frame = self.is_new_frame(core, input, unit);
        core.current_timestamp = input.timestamp;

        let status = if new_frame {
            core.end_frame(false)?;
            self.begin_frame(core, input, unit)?
        } else {
            if unit.pictures.iter().any(|p| p.current.is_field()) {
                let current = core.acquired()?;
                core.pool.slot_mut(current).flags.single_field = false;
            }
            self.continue_frame(core, input, unit)?
        };

        // Secure buffers always hold a whole frame.
        if core.output.low_delay() || self.secure.is_active() {
            core.end_frame(false)?;
        }

        Ok(status)
    }

    fn flush(&mut self, core: &mut DecoderCore<B>) {
        self.dpb.invalidate(&mut core.pool);
        self.last_fields = Default::default();
        self.secure.clear();
    }
}
