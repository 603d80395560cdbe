// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VC-1 and WMV state machine.
//!
//! Every input buffer holds one frame, made of one frame picture or two field pictures. Each
//! picture is submitted on its own and the frame is complete at the end of the decode call.

use anyhow::anyhow;
use log::debug;

use crate::backend::HwBackend;
use crate::backend::Reference;
use crate::backend::ReferenceRole;
use crate::backend::RenderCommand;
use crate::codec::vc1::PictureType;
use crate::codec::vc1::Unit;
use crate::codec::Parser;
use crate::decoder::output::OutputMethod;
use crate::decoder::output::OUTPUT_WINDOW_SIZE;
use crate::decoder::stateless::slice_bytes;
use crate::decoder::stateless::DecoderCore;
use crate::decoder::stateless::FrameStateMachine;
use crate::decoder::stateless::ReferenceLists;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StreamRequirements;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::DecodeStatus;
use crate::decoder::InputBuffer;

const VC1_SURFACES: usize = 10;
/// In-loop filtered pictures of range-mapped streams: current, last and forward.
const VC1_INLOOP_SURFACES: usize = 3;

/// Which extra surface receives the in-loop filtered picture, for range-mapped streams.
///
/// The hardware range-maps the output picture, so the unmapped pictures that later pictures
/// predict from are kept in surfaces of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InLoopSurfaces {
    current: usize,
    last: usize,
    forward: usize,
}

impl Default for InLoopSurfaces {
    fn default() -> Self {
        Self {
            current: 0,
            last: 1,
            forward: 2,
        }
    }
}

impl InLoopSurfaces {
    /// Moves on after a picture of type `kind` has been decoded into `current`.
    fn rotate(&mut self, kind: PictureType) {
        let decoded = self.current;
        match kind {
            PictureType::I | PictureType::P => {
                self.current = self.last;
                self.last = decoded;
            }
            PictureType::B | PictureType::Bi => {
                self.current = self.forward;
                self.forward = decoded;
            }
            PictureType::Skipped => (),
        }
    }
}

/// VC-1 state machine.
#[derive(Debug, Default)]
pub struct Vc1 {
    range_mapped: bool,
    inloop: InLoopSurfaces,
}

impl Vc1 {
    pub fn new() -> Self {
        Default::default()
    }

    fn picture_type(unit: &Unit, picture: usize) -> DecodeResult<PictureType> {
        let pic = &unit.pictures[picture];
        pic.kind().ok_or_else(|| {
            DecodeError::ParserFailure(anyhow!("invalid picture type {}", pic.picture_type))
        })
    }

    /// Submits picture `picture` of `unit` into the acquired surface.
    fn decode_picture<B: HwBackend>(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &Unit,
        picture: usize,
    ) -> DecodeResult<()> {
        let pic = &unit.pictures[picture];
        let mut references = self.set_reference(core, unit, picture, 0)?.picture;

        if self.range_mapped {
            let surface = core
                .extra_surfaces
                .get(self.inloop.current)
                .copied()
                .ok_or_else(|| DecodeError::Fail("no in-loop surface allocated".into()))?;
            references.push(Reference {
                role: ReferenceRole::InLoop,
                surface,
            });
        }

        core.begin_picture()?;
        core.render(RenderCommand::PictureParameters {
            params: &pic.picture_params,
            references: &references,
        })?;
        if let Some(bitplanes) = &pic.bitplanes {
            core.render(RenderCommand::BitPlane(bitplanes))?;
        }
        for slice in 0..pic.slices.len() {
            self.decode_slice(core, input, unit, picture, slice)?;
        }
        core.end_picture()
    }
}

impl<B: HwBackend> StatelessDecoder<Vc1, B> {
    /// Creates a new VC-1 decoder using the given `parser` and `backend`.
    pub fn new_vc1(parser: Box<dyn Parser<Unit = Unit>>, backend: B) -> Self {
        Self::new(Vc1::new(), parser, backend)
    }
}

impl<B: HwBackend> FrameStateMachine<B> for Vc1 {
    type Unit = Unit;

    fn stream_requirements(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &Unit,
    ) -> DecodeResult<Option<StreamRequirements>> {
        let sequence = &unit.sequence;
        let coded = if sequence.resolution().is_empty() {
            core.config.resolution
        } else {
            sequence.resolution()
        };
        if coded.is_empty() {
            debug!("sequence size unknown yet");
            return Ok(None);
        }

        core.format.set_coded_size(coded)?;
        self.update_format_info(core, unit)?;

        Ok(Some(StreamRequirements {
            profile: sequence.va_profile(),
            coded,
            surfaces: VC1_SURFACES,
            extra_surfaces: VC1_INLOOP_SURFACES,
            window: OUTPUT_WINDOW_SIZE,
            method: OutputMethod::ByCodingType,
            low_delay: None,
            manage_references: true,
            buffers_needed: None,
        }))
    }

    fn update_format_info(&mut self, core: &mut DecoderCore<B>, unit: &Unit) -> DecodeResult<()> {
        let size = unit.sequence.resolution();
        if size.is_empty() {
            return Ok(());
        }

        core.format.set_coded_size(size)?;
        // Range mapping happens before output.
        core.format.info_mut().video_full_range = true;
        core.check_format()
    }

    fn is_new_frame(&mut self, _: &DecoderCore<B>, _: &InputBuffer, _: &Unit) -> bool {
        true
    }

    fn set_reference(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &Unit,
        picture: usize,
        _: usize,
    ) -> DecodeResult<ReferenceLists> {
        let pic = &unit.pictures[picture];
        let current = core.surface(core.acquired()?);
        let reference = |role, surface| Reference { role, surface };

        let references = match Self::picture_type(unit, picture)? {
            PictureType::I => vec![
                reference(ReferenceRole::Forward, current),
                reference(ReferenceRole::Backward, current),
            ],
            PictureType::P => {
                if pic.reference_distance_flag && pic.reference_distance != 0 {
                    debug!(
                        "P picture at reference distance {} not supported",
                        pic.reference_distance
                    );
                    return Err(DecodeError::NoReference);
                }

                // The second field predicts from the first one, unless it needs an older field.
                let forward = if picture == 1
                    && !pic.num_reference_pictures
                    && !pic.reference_field_pic_indicator
                {
                    current
                } else {
                    let last = core.last_reference.ok_or(DecodeError::NoReference)?;
                    core.surface(last)
                };

                vec![reference(ReferenceRole::Forward, forward)]
            }
            PictureType::B => {
                let (Some(forward), Some(backward)) =
                    (core.forward_reference, core.last_reference)
                else {
                    return Err(DecodeError::NoReference);
                };

                vec![
                    reference(ReferenceRole::Forward, core.surface(forward)),
                    reference(ReferenceRole::Backward, core.surface(backward)),
                ]
            }
            PictureType::Bi | PictureType::Skipped => Vec::new(),
        };

        Ok(ReferenceLists {
            picture: references,
            ..Default::default()
        })
    }

    fn decode_slice(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &Unit,
        picture: usize,
        slice: usize,
    ) -> DecodeResult<()> {
        let slice = &unit.pictures[picture].slices[slice];

        core.render(RenderCommand::SliceParameters {
            params: &slice.params,
            ref_list0: &[],
            ref_list1: &[],
        })?;
        let data = slice_bytes(input.data, slice.offset, slice.size)?;
        core.render(RenderCommand::SliceData(data))
    }

    fn decode_unit(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &Unit,
    ) -> DecodeResult<DecodeStatus> {
        self.update_format_info(core, unit)?;
        core.current_timestamp = input.timestamp;

        if unit.pictures.is_empty() {
            debug!("no picture in buffer");
            return Ok(DecodeStatus::Success);
        }

        let kind = Self::picture_type(unit, 0)?;
        if kind == PictureType::Skipped {
            debug!("skipped picture at {}", input.timestamp);
            core.repeat_last_reference(input)?;
            return Ok(DecodeStatus::Success);
        }

        self.range_mapped = unit.sequence.is_range_mapped();
        core.acquire(input, matches!(kind, PictureType::I | PictureType::P))?;

        // Any other picture would be another frame.
        let num_pictures = unit.pictures.len().min(2);
        for picture in 0..num_pictures {
            if let Err(e) = self.decode_picture(core, input, unit, picture) {
                core.end_frame(true)?;
                return Err(e);
            }
        }

        if self.range_mapped {
            self.inloop.rotate(kind);
        }
        core.end_frame(false)?;

        Ok(DecodeStatus::Success)
    }

    fn flush(&mut self, _: &mut DecoderCore<B>) {
        self.range_mapped = false;
        self.inloop = Default::default();
    }
}
