// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MPEG-4 part 2 and H.263 state machine.
//!
//! Frames are delimited by timestamps: a buffer carrying a new timestamp completes the frame in
//! progress. References are the last two reference VOPs, tracked by the
//! [`DecoderCore`]. Some muxers store a P VOP and the following B VOP in the same buffer; such
//! packed frames are split by asking the caller to submit the B VOP again, and the N-VOP that
//! follows later only carries the display timestamp of the P VOP.

use anyhow::anyhow;
use log::debug;
use log::warn;

use crate::backend::HwBackend;
use crate::backend::Reference;
use crate::backend::ReferenceRole;
use crate::backend::RenderCommand;
use crate::codec::mpeg4::Unit;
use crate::codec::mpeg4::VopCodingType;
use crate::codec::mpeg4::VopPacket;
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
use crate::decoder::PackedFrame;

const MPEG4_SURFACES: usize = 10;

/// Frame duration assumed when the stream does not say, in microseconds.
const DEFAULT_FRAME_DURATION: u64 = 30_000;

/// Duration between two `vop_time_increment` values, in microseconds.
fn time_increment(from: u32, to: u32, resolution: u32) -> u64 {
    if resolution == 0 {
        return DEFAULT_FRAME_DURATION;
    }

    let ticks = (to as i64 - from as i64).rem_euclid(resolution as i64) as u64;
    ticks * 1_000_000 / resolution as u64
}

/// MPEG-4 part 2 state machine.
#[derive(Debug, Default)]
pub struct Mpeg4 {
    /// `vop_time_increment` of the last reference VOP.
    last_time_increment: u32,
    /// The P VOP of a packed frame has been output and awaits its timestamp from an N-VOP.
    expecting_nvop: bool,
    /// The IQ matrix has not been sent for the picture in progress yet.
    send_iq_matrix: bool,
    /// H.263 streams are decoded even when references are missing.
    short_header: bool,
    /// The buffer being decoded starts at a sync point.
    sync_frame: bool,
}

impl Mpeg4 {
    pub fn new() -> Self {
        Default::default()
    }

    fn coding_type(packet: &VopPacket) -> DecodeResult<VopCodingType> {
        packet.coding_type().ok_or_else(|| {
            DecodeError::ParserFailure(anyhow!("invalid VOP coding type {}", packet.vop_coding_type))
        })
    }

    fn begin_frame<B: HwBackend>(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &Unit,
    ) -> DecodeResult<DecodeStatus> {
        let Some(packet) = unit.packets.first() else {
            return Ok(DecodeStatus::Success);
        };
        let coding_type = Self::coding_type(packet)?;

        // In a packed frame the reference VOP is followed by a B VOP, e.g. I P {P B} B N P.
        if self.expecting_nvop && packet.vop_coded && coding_type != VopCodingType::B {
            warn!("{:?} VOP while waiting for the N-VOP of a packed frame", coding_type);
            self.expecting_nvop = false;
        }

        if !packet.vop_coded {
            self.not_coded(core, input)?;
            if unit.packets.len() > 1 {
                warn!("ignoring {} packets after an N-VOP", unit.packets.len() - 1);
            }
            return Ok(DecodeStatus::Success);
        }

        // Check the references before taking a surface.
        self.set_reference(core, unit, 0, 0)?;

        self.continue_frame(core, input, unit)
    }

    /// Handles an N-VOP, which is either the placeholder of a packed frame or a skipped frame.
    fn not_coded<B: HwBackend>(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
    ) -> DecodeResult<()> {
        let Some(last) = core.last_reference else {
            warn!("N-VOP without reference, flushing");
            core.flush();
            self.flush(core);
            return Ok(());
        };

        if self.expecting_nvop {
            // The P VOP of the packed frame is displayed at this N-VOP's time.
            debug!("N-VOP completing packed frame at {}", core.current_timestamp);
            core.pool.slot_mut(last).timestamp = core.current_timestamp;
            self.expecting_nvop = false;
        } else {
            debug!("skipped VOP at {}", core.current_timestamp);
            core.repeat_last_reference(input)?;
        }

        Ok(())
    }

    fn continue_frame<B: HwBackend>(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &Unit,
    ) -> DecodeResult<DecodeStatus> {
        for (index, packet) in unit.packets.iter().enumerate() {
            let coding_type = Self::coding_type(packet)?;

            if coding_type == VopCodingType::S && packet.sprite_warping_points > 1 {
                warn!(
                    "{} sprite warping points, only one is supported",
                    packet.sprite_warping_points
                );
            }
            if !packet.vop_coded {
                return Err(DecodeError::Fail("N-VOP inside a frame".into()));
            }

            if packet.new_picture || core.pool.acquired().is_none() {
                if !packet.new_picture {
                    warn!("first packet of the VOP is lost");
                }

                if core.pool.acquired().is_some() {
                    if index == 0 {
                        // New picture with the same timestamp as the previous buffer.
                        core.end_frame(false)?;
                    } else {
                        return self.split_packed_frame(core, unit, index);
                    }
                }

                core.acquire(input, coding_type != VopCodingType::B)?;
                if coding_type != VopCodingType::B {
                    self.last_time_increment = packet.vop_time_increment;
                }
                core.begin_picture()?;
                self.send_iq_matrix = true;
            }

            self.decode_slice(core, input, unit, index, 0)?;
        }

        Ok(DecodeStatus::Success)
    }

    /// Completes the frame in progress when packet `index` starts a second VOP in the buffer,
    /// and tells the caller where the rest of the buffer starts.
    fn split_packed_frame<B: HwBackend>(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &Unit,
        index: usize,
    ) -> DecodeResult<DecodeStatus> {
        let packet = &unit.packets[index];
        let previous = &unit.packets[index - 1];
        let coding_type = Self::coding_type(packet)?;

        let timestamp = if coding_type == VopCodingType::B {
            // The buffer timestamp belongs to the B VOP, the reference VOP is displayed after it.
            let increment = time_increment(
                packet.vop_time_increment,
                self.last_time_increment,
                packet.vop_time_increment_resolution,
            );
            let current = core.acquired()?;
            let slot = core.pool.slot_mut(current);
            slot.timestamp = slot.timestamp.saturating_add(increment);

            let packed_timestamp = core.current_timestamp;
            core.current_timestamp = slot.timestamp;
            packed_timestamp
        } else {
            let increment = time_increment(
                self.last_time_increment,
                packet.vop_time_increment,
                packet.vop_time_increment_resolution,
            );
            core.current_timestamp.saturating_add(increment)
        };

        core.end_frame(false)?;
        self.expecting_nvop = coding_type == VopCodingType::B;

        let packed = PackedFrame {
            offset: previous.offset + previous.size,
            timestamp,
        };
        debug!(
            "packed frame, {:?} VOP at offset {} with timestamp {}",
            coding_type, packed.offset, packed.timestamp
        );

        Ok(DecodeStatus::MultipleFrames(packed))
    }
}

impl<B: HwBackend> StatelessDecoder<Mpeg4, B> {
    /// Creates a new MPEG-4 part 2 or H.263 decoder using the given `parser` and `backend`.
    pub fn new_mpeg4(parser: Box<dyn Parser<Unit = Unit>>, backend: B) -> Self {
        Self::new(Mpeg4::new(), parser, backend)
    }
}

impl<B: HwBackend> FrameStateMachine<B> for Mpeg4 {
    type Unit = Unit;

    fn stream_requirements(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &Unit,
    ) -> DecodeResult<Option<StreamRequirements>> {
        let layer = &unit.layer;
        let coded = if layer.resolution().is_empty() {
            core.config.resolution
        } else {
            layer.resolution()
        };
        if coded.is_empty() {
            debug!("video object layer size unknown yet");
            return Ok(None);
        }

        core.format.set_coded_size(coded)?;
        self.update_format_info(core, unit)?;

        Ok(Some(StreamRequirements {
            profile: layer.profile(),
            coded,
            surfaces: MPEG4_SURFACES,
            extra_surfaces: 0,
            window: OUTPUT_WINDOW_SIZE,
            method: OutputMethod::ByCodingType,
            low_delay: None,
            manage_references: true,
            buffers_needed: None,
        }))
    }

    fn update_format_info(&mut self, core: &mut DecoderCore<B>, unit: &Unit) -> DecodeResult<()> {
        let layer = &unit.layer;
        self.short_header = layer.short_video_header;

        if layer.resolution().is_empty() {
            return Ok(());
        }

        core.format.set_coded_size(layer.resolution())?;
        core.format.info_mut().video_full_range = layer.video_full_range;
        core.check_format()
    }

    fn is_new_frame(&mut self, core: &DecoderCore<B>, input: &InputBuffer, _: &Unit) -> bool {
        core.current_timestamp != input.timestamp
    }

    fn set_reference(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &Unit,
        picture: usize,
        _: usize,
    ) -> DecodeResult<ReferenceLists> {
        let packet = &unit.packets[picture];
        let coding_type = Self::coding_type(packet)?;
        let reference = |role, slot| Reference {
            role,
            surface: core.surface(slot),
        };

        let mut lists = ReferenceLists::default();
        match coding_type {
            VopCodingType::I => (),
            VopCodingType::P | VopCodingType::S => match core.last_reference {
                Some(last) => lists.picture.push(reference(ReferenceRole::Forward, last)),
                None if self.sync_frame || self.short_header => {
                    debug!("no reference for {:?} VOP, decoding anyway", coding_type)
                }
                None => return Err(DecodeError::NoReference),
            },
            VopCodingType::B => {
                let (forward, backward) = (core.forward_reference, core.last_reference);
                if (forward.is_none() || backward.is_none()) && !self.short_header {
                    return Err(DecodeError::NoReference);
                }
                if let Some(forward) = forward {
                    lists.picture.push(reference(ReferenceRole::Forward, forward));
                }
                if let Some(backward) = backward {
                    lists.picture.push(reference(ReferenceRole::Backward, backward));
                }
            }
        }

        Ok(lists)
    }

    fn decode_slice(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &Unit,
        picture: usize,
        slice: usize,
    ) -> DecodeResult<()> {
        let packet = &unit.packets[picture];
        let references = self.set_reference(core, unit, picture, slice)?;

        // Every video packet repeats the picture parameters.
        core.render(RenderCommand::PictureParameters {
            params: &packet.picture_params,
            references: &references.picture,
        })?;
        if unit.layer.quant_type && self.send_iq_matrix {
            core.render(RenderCommand::IqMatrix(&unit.iq_matrix))?;
            self.send_iq_matrix = false;
        }
        core.render(RenderCommand::SliceParameters {
            params: &packet.slice_params,
            ref_list0: &[],
            ref_list1: &[],
        })?;

        let data = slice_bytes(input.data, packet.offset, packet.size)?;
        core.render(RenderCommand::SliceData(data))
    }

    fn decode_unit(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &Unit,
    ) -> DecodeResult<DecodeStatus> {
        self.sync_frame = input.flags.is_sync_frame;
        self.update_format_info(core, unit)?;

        let Some(first) = unit.packets.first() else {
            debug!("no VOP in buffer");
            return Ok(DecodeStatus::Success);
        };
        if first.vop_width == 0 || first.vop_height == 0 {
            return Err(DecodeError::ParserFailure(anyhow!(
                "invalid VOP size {}x{}",
                first.vop_width,
                first.vop_height
            )));
        }

        let new_frame = self.is_new_frame(core, input, unit);
        core.current_timestamp = input.timestamp;

        let result = if new_frame {
            core.end_frame(false)?;
            self.begin_frame(core, input, unit)
        } else {
            self.continue_frame(core, input, unit)
        };

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                if let Err(e) = core.end_frame(true) {
                    warn!("error while dropping the frame: {}", e);
                }
                return Err(e);
            }
        };

        if input.flags.has_complete_frame {
            core.end_frame(false)?;
        }

        Ok(status)
    }

    fn flush(&mut self, _: &mut DecoderCore<B>) {
        self.last_time_increment = 0;
        self.expecting_nvop = false;
        self.send_iq_matrix = false;
    }
}
