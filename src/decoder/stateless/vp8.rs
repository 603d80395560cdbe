// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;

use crate::backend::HwBackend;
use crate::backend::Profile;
use crate::backend::Reference;
use crate::backend::ReferenceRole;
use crate::backend::RenderCommand;
use crate::codec::vp8::AltRefCopy;
use crate::codec::vp8::Frame;
use crate::codec::vp8::FrameType;
use crate::codec::vp8::GoldenCopy;
use crate::codec::Parser;
use crate::decoder::output::OutputMethod;
use crate::decoder::output::OUTPUT_WINDOW_SIZE;
use crate::decoder::stateless::slice_bytes;
use crate::decoder::stateless::DecoderCore;
use crate::decoder::stateless::FrameStateMachine;
use crate::decoder::stateless::ReferenceLists;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StreamRequirements;
use crate::decoder::surface_pool::SlotIndex;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::DecodeStatus;
use crate::decoder::InputBuffer;

/// Surfaces cycling through the decoder and the display.
const VP8_SURFACES: usize = 9;
/// Last, golden and alternate reference frames.
const VP8_REFERENCES: usize = 3;

const LAST: usize = 0;
const GOLDEN: usize = 1;
const ALT_REF: usize = 2;

/// VP8 state machine. Each input buffer holds exactly one frame.
#[derive(Debug, Default)]
pub struct Vp8 {
    /// Slots of the last, golden and alternate reference frames.
    references: [Option<SlotIndex>; VP8_REFERENCES],
}

impl Vp8 {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replace a reference frame with `slot`.
    fn replace_reference(reference: &mut Option<SlotIndex>, slot: Option<SlotIndex>) {
        if slot.is_some() {
            *reference = slot;
        }
    }

    /// Updates the reference frames after `frame` has been decoded into `decoded`, and moves the
    /// reference pins accordingly.
    fn update_references<B: HwBackend>(
        &mut self,
        core: &mut DecoderCore<B>,
        frame: &Frame,
        decoded: SlotIndex,
    ) {
        let previous = self.references;

        if frame.frame_type == FrameType::KeyFrame {
            self.references = [Some(decoded); VP8_REFERENCES];
        } else {
            // Buffer copies read the references as they were before this frame.
            if frame.refresh_golden_frame {
                Self::replace_reference(&mut self.references[GOLDEN], Some(decoded));
            } else {
                match frame.copy_buffer_to_golden {
                    GoldenCopy::None => (),
                    GoldenCopy::FromLast => {
                        Self::replace_reference(&mut self.references[GOLDEN], previous[LAST])
                    }
                    GoldenCopy::FromAltRef => {
                        Self::replace_reference(&mut self.references[GOLDEN], previous[ALT_REF])
                    }
                }
            }

            if frame.refresh_alternate_frame {
                Self::replace_reference(&mut self.references[ALT_REF], Some(decoded));
            } else {
                match frame.copy_buffer_to_alternate {
                    AltRefCopy::None => (),
                    AltRefCopy::FromLast => {
                        Self::replace_reference(&mut self.references[ALT_REF], previous[LAST])
                    }
                    AltRefCopy::FromGolden => {
                        Self::replace_reference(&mut self.references[ALT_REF], previous[GOLDEN])
                    }
                }
            }

            if frame.refresh_last {
                Self::replace_reference(&mut self.references[LAST], Some(decoded));
            }
        }

        for slot in previous.iter().flatten() {
            core.pool.set_as_reference(*slot, false);
        }
        for slot in self.references.iter().flatten() {
            core.pool.set_as_reference(*slot, true);
        }
    }
}

impl<B: HwBackend> StatelessDecoder<Vp8, B> {
    /// Creates a new VP8 decoder using the given `parser` and `backend`.
    pub fn new_vp8(parser: Box<dyn Parser<Unit = Frame>>, backend: B) -> Self {
        Self::new(Vp8::new(), parser, backend)
    }
}

impl<B: HwBackend> FrameStateMachine<B> for Vp8 {
    type Unit = Frame;

    fn stream_requirements(
        &mut self,
        core: &mut DecoderCore<B>,
        frame: &Frame,
    ) -> DecodeResult<Option<StreamRequirements>> {
        // Inter frames cannot be decoded before the first key frame anyway.
        if frame.frame_type != FrameType::KeyFrame {
            return Ok(None);
        }

        let coded = if frame.resolution().is_empty() {
            core.config.resolution
        } else {
            frame.resolution()
        };
        core.format.set_coded_size(coded)?;

        Ok(Some(StreamRequirements {
            profile: Profile::Vp8,
            coded,
            surfaces: VP8_SURFACES + VP8_REFERENCES,
            extra_surfaces: 0,
            window: OUTPUT_WINDOW_SIZE,
            method: OutputMethod::ByCodingType,
            // Frames are never reordered.
            low_delay: Some(true),
            manage_references: false,
            buffers_needed: None,
        }))
    }

    fn update_format_info(&mut self, core: &mut DecoderCore<B>, frame: &Frame) -> DecodeResult<()> {
        if frame.frame_type != FrameType::KeyFrame || frame.resolution().is_empty() {
            return Ok(());
        }

        core.format.set_coded_size(frame.resolution())?;
        core.check_format()
    }

    fn is_new_frame(&mut self, _: &DecoderCore<B>, _: &InputBuffer, _: &Frame) -> bool {
        true
    }

    fn set_reference(
        &mut self,
        core: &mut DecoderCore<B>,
        frame: &Frame,
        _: usize,
        _: usize,
    ) -> DecodeResult<ReferenceLists> {
        if frame.frame_type == FrameType::KeyFrame {
            return Ok(Default::default());
        }

        let roles = [ReferenceRole::Last, ReferenceRole::Golden, ReferenceRole::AltRef];
        let mut lists = ReferenceLists::default();
        for (role, slot) in roles.into_iter().zip(self.references) {
            let Some(slot) = slot else {
                let current = core.acquired()?;
                core.pool.slot_mut(current).errors.record_missing_reference();
                debug!("{:?} reference missing for inter frame", role);
                return Err(DecodeError::NoReference);
            };
            lists.picture.push(Reference {
                role,
                surface: core.surface(slot),
            });
        }

        Ok(lists)
    }

    fn decode_slice(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        frame: &Frame,
        picture: usize,
        slice: usize,
    ) -> DecodeResult<()> {
        let references = self.set_reference(core, frame, picture, slice)?;
        let data = slice_bytes(input.data, frame.offset, frame.size)?;

        core.begin_picture()?;
        core.render(RenderCommand::PictureParameters {
            params: &frame.picture_params,
            references: &references.picture,
        })?;
        core.render(RenderCommand::Probability(&frame.probability))?;
        core.render(RenderCommand::IqMatrix(&frame.iq_matrix))?;
        core.render(RenderCommand::SliceParameters {
            params: &frame.slice_params,
            ref_list0: &[],
            ref_list1: &[],
        })?;
        core.render(RenderCommand::SliceData(data))?;
        core.end_picture()
    }

    fn decode_unit(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        frame: &Frame,
    ) -> DecodeResult<DecodeStatus> {
        self.update_format_info(core, frame)?;

        core.current_timestamp = input.timestamp;
        if frame.frame_type == FrameType::Skipped {
            debug!("skipped frame at {}", input.timestamp);
            core.repeat_last_reference(input)?;
            return Ok(DecodeStatus::Success);
        }

        core.show_frame = frame.show_frame;
        let decoded = core.acquire(input, frame.is_reference())?;

        if let Err(e) = self.decode_slice(core, input, frame, 0, 0) {
            core.end_frame(true)?;
            return Err(e);
        }

        self.update_references(core, frame, decoded);
        core.end_frame(false)?;

        Ok(DecodeStatus::Success)
    }

    fn flush(&mut self, core: &mut DecoderCore<B>) {
        for slot in self.references.iter().flatten() {
            core.pool.set_as_reference(*slot, false);
        }
        self.references = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::Backend;
    use crate::backend::dummy::Call;
    use crate::codec::scripted::Script;
    use crate::codec::scripted::ScriptedParser;
    use crate::decoder::stateless::tests::collect_ready;
    use crate::decoder::stateless::tests::drain;
    use crate::decoder::stateless::tests::init_logger;
    use crate::decoder::DecoderConfig;
    use crate::Resolution;

    const DATA: [u8; 8] = [0x30, 0x01, 0x00, 0x9d, 0x01, 0x2a, 0x40, 0x00];

    fn key_frame(width: u32, height: u32) -> Frame {
        Frame {
            frame_type: FrameType::KeyFrame,
            width,
            height,
            size: DATA.len(),
            ..Default::default()
        }
    }

    fn inter_frame() -> Frame {
        Frame {
            frame_type: FrameType::InterFrame,
            size: DATA.len(),
            ..Default::default()
        }
    }

    fn decoder() -> (StatelessDecoder<Vp8, Backend>, Script<Frame>) {
        init_logger();
        let (parser, script) = ScriptedParser::new();
        let mut decoder = StatelessDecoder::new_vp8(Box::new(parser), Backend::new());
        decoder.start(DecoderConfig::default()).unwrap();
        (decoder, script)
    }

    fn decode(decoder: &mut StatelessDecoder<Vp8, Backend>, timestamp: u64) -> DecodeStatus {
        decoder
            .decode(&InputBuffer::new(timestamp, &DATA))
            .unwrap()
    }

    fn reference_surfaces(decoder: &StatelessDecoder<Vp8, Backend>) -> Vec<u32> {
        decoder
            .machine
            .references
            .iter()
            .map(|s| s.map(|s| decoder.core.surface(s)).unwrap_or(0))
            .collect()
    }

    #[test]
    fn inter_frames_use_three_references() {
        let (mut decoder, script) = decoder();

        script.push(key_frame(176, 144));
        script.push(inter_frame());
        decode(&mut decoder, 0);
        decode(&mut decoder, 1);

        let targets = decoder.backend().decoded_targets();
        let key = targets[0];
        let references = decoder
            .backend()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::PictureParameters(refs) => Some(refs.clone()),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(
            references,
            vec![
                Reference {
                    role: ReferenceRole::Last,
                    surface: key
                },
                Reference {
                    role: ReferenceRole::Golden,
                    surface: key
                },
                Reference {
                    role: ReferenceRole::AltRef,
                    surface: key
                },
            ]
        );

        // The inter frame refreshed the last reference only.
        assert_eq!(reference_surfaces(&decoder), vec![targets[1], key, key]);
    }

    #[test]
    fn buffer_copies_use_previous_references() {
        let (mut decoder, script) = decoder();

        script.push(key_frame(176, 144));
        script.push(inter_frame());
        script.push(Frame {
            refresh_last: false,
            refresh_alternate_frame: true,
            copy_buffer_to_golden: GoldenCopy::FromLast,
            ..inter_frame()
        });
        for timestamp in 0..3 {
            decode(&mut decoder, timestamp);
        }

        let targets = decoder.backend().decoded_targets();
        assert_eq!(
            reference_surfaces(&decoder),
            vec![targets[1], targets[1], targets[2]]
        );

        // The key frame is not referenced anymore and can be reused once displayed.
        let key_slot = (0..decoder.core.pool.len())
            .find(|i| decoder.core.surface(*i) == targets[0])
            .unwrap();
        assert!(!decoder.core.pool.slot(key_slot).as_reference);
    }

    #[test]
    fn hidden_frame_is_not_output() {
        let (mut decoder, script) = decoder();

        script.push(key_frame(176, 144));
        script.push(Frame {
            show_frame: false,
            refresh_last: false,
            refresh_alternate_frame: true,
            ..inter_frame()
        });
        script.push(inter_frame());
        for timestamp in 0..3 {
            decode(&mut decoder, timestamp);
        }

        let timestamps: Vec<_> = drain(&mut decoder).iter().map(|f| f.timestamp).collect();
        assert_eq!(timestamps, vec![0, 2]);
        assert_eq!(reference_surfaces(&decoder)[ALT_REF], decoder.backend().decoded_targets()[1]);
    }

    #[test]
    fn skipped_frame_is_a_noop() {
        let (mut decoder, script) = decoder();

        script.push(key_frame(176, 144));
        script.push(Frame {
            frame_type: FrameType::Skipped,
            ..Default::default()
        });
        decode(&mut decoder, 0);
        assert_eq!(decode(&mut decoder, 1), DecodeStatus::Success);

        assert_eq!(decoder.backend().decoded_targets().len(), 1);
        assert_eq!(drain(&mut decoder).len(), 1);
    }

    #[test]
    fn frames_are_output_in_decode_order() {
        let (mut decoder, script) = decoder();

        script.push(key_frame(176, 144));
        decode(&mut decoder, 10);
        let mut timestamps: Vec<_> = collect_ready(&mut decoder)
            .iter()
            .map(|f| f.timestamp)
            .collect();

        for timestamp in 11..30 {
            script.push(inter_frame());
            decode(&mut decoder, timestamp);
            timestamps.extend(collect_ready(&mut decoder).iter().map(|f| f.timestamp));
        }

        assert_eq!(timestamps, (10..30).collect::<Vec<_>>());
    }

    #[test]
    fn waits_for_key_frame() {
        let (mut decoder, script) = decoder();

        script.push(inter_frame());
        assert_eq!(decode(&mut decoder, 0), DecodeStatus::Success);
        assert!(decoder.backend().calls.is_empty());

        script.push(key_frame(176, 144));
        decode(&mut decoder, 1);
        assert_eq!(decoder.backend().decoded_targets().len(), 1);
    }

    #[test]
    fn larger_key_frame_changes_format() {
        let (mut decoder, script) = decoder();

        script.push(key_frame(176, 144));
        script.push(inter_frame());
        decode(&mut decoder, 0);
        decode(&mut decoder, 1);

        // Smaller key frames keep using the surfaces.
        script.push(key_frame(160, 128));
        decode(&mut decoder, 2);

        script.push(key_frame(352, 288));
        assert!(matches!(
            decoder.decode(&InputBuffer::new(3, &DATA)),
            Err(DecodeError::FormatChanged)
        ));
        assert_eq!(decoder.format_info().coded, Resolution::from((352, 288)));
        assert!(decoder.core.output.is_empty());
        assert_eq!(decoder.machine.references, [None; VP8_REFERENCES]);
        assert!((0..decoder.core.pool.len()).all(|i| !decoder.core.pool.slot(i).as_reference));
    }

    #[test]
    fn truncated_frame_releases_surface() {
        let (mut decoder, script) = decoder();

        script.push(key_frame(176, 144));
        script.push(Frame {
            offset: 4,
            ..inter_frame()
        });
        decode(&mut decoder, 0);
        assert!(matches!(
            decoder.decode(&InputBuffer::new(1, &DATA)),
            Err(DecodeError::InvalidData(_))
        ));

        assert_eq!(decoder.core.pool.acquired(), None);
        assert!(!decoder.core.is_decoding_frame());
        assert_eq!(drain(&mut decoder).len(), 1);
    }
}
