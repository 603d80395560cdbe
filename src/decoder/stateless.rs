// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the backend API targeted by these decoders. The decoders themselves do
//! hold the decoding state so the backend doesn't need to.
//!
//! The [`StatelessDecoder`] struct is the basis of all stateless decoders. It is created by
//! combining a codec state machine with a [parser](crate::codec::Parser) and a
//! [backend](crate::backend), after which input buffers can be submitted through the
//! [`StatelessDecoder::decode`] method and decoded frames retrieved with
//! [`StatelessDecoder::get_output`].
//!
//! Everything that does not depend on the codec (surfaces, output ordering, frame lifecycle,
//! format tracking) lives in [`DecoderCore`], which the codec state machines drive.

pub mod avc;
pub mod mpeg4;
pub mod vc1;
pub mod vp8;

use std::borrow::Cow;

use log::debug;
use log::info;
use log::warn;

use crate::backend::BackendError;
use crate::backend::HwBackend;
use crate::backend::Profile;
use crate::backend::RawImage;
use crate::backend::Reference;
use crate::backend::RenderCommand;
use crate::codec::Parser;
use crate::decoder::format::FormatInfo;
use crate::decoder::format::FormatTracker;
use crate::decoder::output::OutputMethod;
use crate::decoder::output::OutputQueue;
use crate::decoder::surface_pool::RenderDoneSignal;
use crate::decoder::surface_pool::SlotIndex;
use crate::decoder::surface_pool::SurfacePool;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::DecodeStatus;
use crate::decoder::DecoderConfig;
use crate::decoder::InputBuffer;
use crate::decoder::OutputFlags;
use crate::decoder::OutputFrame;
use crate::nv12_copy;
use crate::nv12_frame_size;
use crate::Resolution;
use crate::SurfaceHandle;
use crate::INVALID_TIMESTAMP;

/// What a stream needs from the hardware, derived from its first decodable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequirements {
    pub profile: Profile,
    /// Size of the pictures of the stream.
    pub coded: Resolution,
    /// Number of decode-target surfaces to allocate.
    pub surfaces: usize,
    /// Surfaces used internally by the hardware and never output.
    pub extra_surfaces: usize,
    /// Reorder window of the output queue.
    pub window: usize,
    pub method: OutputMethod,
    /// Overrides the low delay setting of the configuration.
    pub low_delay: Option<bool>,
    /// Whether the decoder pins the last two reference frames itself.
    pub manage_references: bool,
    /// Number of surfaces the consumer must provide, if the codec knows better than `surfaces`.
    pub buffers_needed: Option<usize>,
}

/// References resolved for one picture or slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceLists {
    /// References passed along the picture parameters.
    pub picture: Vec<Reference>,
    /// Per-slice reference lists.
    pub list0: Vec<SurfaceHandle>,
    pub list1: Vec<SurfaceHandle>,
}

/// Progress of the frame being decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameState {
    /// No picture submitted to the backend.
    #[default]
    Idle,
    /// A picture has been started on the acquired surface and accepts render commands.
    FrameOpen,
    /// All pictures of the frame have been submitted, waiting to be output or dropped.
    FrameClosing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum DecodingState {
    /// Not started, or stopped.
    #[default]
    Stopped,
    /// Decoder will ignore all input until format and resolution information passes by.
    AwaitingStreamInfo,
    /// Decoder is currently decoding input.
    Decoding,
}

/// Codec-independent decoding state, driven by a [`FrameStateMachine`].
pub struct DecoderCore<B: HwBackend> {
    backend: B,
    config: DecoderConfig,
    pool: SurfacePool,
    output: OutputQueue,
    format: FormatTracker,
    frame_state: FrameState,
    /// Last reference frame that has been completed.
    last_reference: Option<SlotIndex>,
    /// Reference frame completed before `last_reference`, for codecs with managed references.
    forward_reference: Option<SlotIndex>,
    manage_references: bool,
    /// Whether the frame being decoded is meant to be displayed.
    show_frame: bool,
    /// Timestamp of the input buffer being decoded.
    current_timestamp: u64,
    extra_surfaces: Vec<SurfaceHandle>,
    configured: bool,
    /// Nothing happened since the last flush.
    flushed: bool,
}

impl<B: HwBackend> DecoderCore<B> {
    fn new(backend: B) -> Self {
        Self {
            backend,
            config: Default::default(),
            pool: SurfacePool::new(),
            output: OutputQueue::new(),
            format: FormatTracker::new(),
            frame_state: FrameState::Idle,
            last_reference: None,
            forward_reference: None,
            manage_references: false,
            show_frame: true,
            current_timestamp: INVALID_TIMESTAMP,
            extra_surfaces: Vec::new(),
            configured: false,
            flushed: true,
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn format_info(&self) -> &FormatInfo {
        self.format.info()
    }

    pub fn frame_state(&self) -> FrameState {
        self.frame_state
    }

    /// Whether a frame has been started and not output or dropped yet.
    pub fn is_decoding_frame(&self) -> bool {
        self.frame_state != FrameState::Idle
    }

    fn acquired(&self) -> DecodeResult<SlotIndex> {
        self.pool
            .acquired()
            .ok_or_else(|| DecodeError::Fail("no surface acquired".into()))
    }

    fn surface(&self, slot: SlotIndex) -> SurfaceHandle {
        self.pool.slot(slot).surface
    }

    /// Allocates the surfaces and creates the hardware context for a stream.
    fn setup(&mut self, requirements: &StreamRequirements) -> DecodeResult<()> {
        let external = !self.config.external_surfaces.is_empty();

        if !self.format.is_valid() {
            self.format.set_coded_size(requirements.coded)?;
        }
        let coded = self.format.info().coded;

        let mut surface_resolution = self.config.resolution.mb_aligned();
        let count = if external {
            self.config.external_surfaces.len()
        } else {
            surface_resolution = Resolution {
                width: surface_resolution.width.max(coded.width),
                height: surface_resolution.height.max(coded.height),
            };
            match self.config.min_surfaces {
                Some(min) if min > requirements.surfaces => {
                    info!("using {} surfaces instead of {}", min, requirements.surfaces);
                    min
                }
                _ => requirements.surfaces,
            }
        };

        let buffers_needed = requirements.buffers_needed.unwrap_or(count);
        self.format.info_mut().buffers_needed = buffers_needed;
        self.format
            .set_allocation(surface_resolution, external.then_some(count));

        // Consumer surfaces cannot be reallocated here: let the consumer know they don't fit.
        if external && self.format.needs_reallocation() {
            info!(
                "stream needs {} surfaces of {}x{}, {} of {}x{} provided",
                buffers_needed,
                coded.width,
                coded.height,
                count,
                surface_resolution.width,
                surface_resolution.height
            );
            return Err(DecodeError::FormatChanged);
        }

        let surfaces = self
            .backend
            .create_surfaces(surface_resolution, count, &self.config.external_surfaces)
            .map_err(allocation_error)?;

        let extra = if requirements.extra_surfaces > 0 {
            match self.backend.create_surfaces(
                surface_resolution,
                requirements.extra_surfaces,
                &[],
            ) {
                Ok(extra) => extra,
                Err(e) => {
                    self.backend.destroy();
                    return Err(allocation_error(e));
                }
            }
        } else {
            Vec::new()
        };

        let all_surfaces: Vec<_> = surfaces.iter().chain(extra.iter()).copied().collect();
        if let Err(e) =
            self.backend
                .create_context(requirements.profile, surface_resolution, &all_surfaces)
        {
            self.backend.destroy();
            return Err(e.into());
        }

        self.pool.initialize(&surfaces, external);
        self.extra_surfaces = extra;

        let low_delay = requirements.low_delay.unwrap_or(self.config.low_delay);
        self.output
            .configure(requirements.method, requirements.window, low_delay);
        self.manage_references = requirements.manage_references;
        self.configured = true;

        info!(
            "configured {:?} with {} surfaces of {}x{} (low delay: {})",
            requirements.profile,
            count,
            surface_resolution.width,
            surface_resolution.height,
            low_delay
        );

        Ok(())
    }

    /// Acquires a surface for a new frame and stamps it with the current timestamp. The first
    /// frame acquired after a size change carries the `resolution_change` flag.
    fn acquire(&mut self, input: &InputBuffer, reference: bool) -> DecodeResult<SlotIndex> {
        let index = self.pool.acquire(&mut self.backend)?;
        let timestamp = self.current_timestamp;

        let resolution_change = self.format.take_size_changed();
        let slot = self.pool.slot_mut(index);
        slot.timestamp = timestamp;
        slot.reference_frame = reference;
        slot.flags.decode_only = input.flags.want_decode_only;
        slot.flags.resolution_change = resolution_change;

        Ok(index)
    }

    /// Starts a picture on the acquired surface.
    fn begin_picture(&mut self) -> DecodeResult<()> {
        let surface = self.surface(self.acquired()?);
        self.backend.begin_picture(surface)?;
        self.frame_state = FrameState::FrameOpen;
        Ok(())
    }

    fn render(&mut self, command: RenderCommand) -> DecodeResult<()> {
        Ok(self.backend.render(command)?)
    }

    /// Submits the current picture. The frame stays in progress, e.g. for the second field.
    fn end_picture(&mut self) -> DecodeResult<()> {
        if self.frame_state != FrameState::FrameOpen {
            return Err(DecodeError::Fail("no picture in progress".into()));
        }
        self.frame_state = FrameState::FrameClosing;
        Ok(self.backend.end_picture()?)
    }

    /// Completes the frame in progress, if any, and queues it for output. If `drop` is set the
    /// frame is abandoned instead and its surface released.
    fn end_frame(&mut self, drop: bool) -> DecodeResult<()> {
        if self.frame_state == FrameState::Idle {
            if self.pool.acquired().is_some() {
                warn!("releasing surface acquired for a frame that was never started");
                self.pool.release();
            }
            return Ok(());
        }

        if self.frame_state == FrameState::FrameOpen {
            if let Err(e) = self.end_picture() {
                self.abandon_frame();
                return Err(e);
            }
        }

        if drop {
            self.abandon_frame();
            Ok(())
        } else {
            self.output_frame()
        }
    }

    fn abandon_frame(&mut self) {
        if let Some(index) = self.pool.acquired() {
            // The next frame reports the size change instead.
            if self.pool.slot(index).flags.resolution_change {
                self.format.mark_size_changed();
            }
            if self.frame_state == FrameState::FrameClosing {
                if let Err(e) = self.backend.sync(self.surface(index)) {
                    warn!("failed to sync abandoned surface: {}", e);
                }
            }
            debug!("dropping frame decoded into slot {}", index);
        }
        self.pool.release();
        self.frame_state = FrameState::Idle;
    }

    /// Completes the acquired surface, updating the reference bookkeeping, and queues it if it
    /// is to be shown.
    fn output_frame(&mut self) -> DecodeResult<()> {
        let index = self.acquired()?;

        if self.pool.slot(index).reference_frame {
            if self.manage_references {
                if let Some(forward) = self.forward_reference {
                    self.pool.set_as_reference(forward, false);
                }
                self.forward_reference = self.last_reference;
                self.pool.set_as_reference(index, true);
            }
            self.last_reference = Some(index);
        }

        if let Some(index) = self.pool.finish_acquired(self.show_frame) {
            self.output.push(index);
        }
        self.frame_state = FrameState::Idle;

        Ok(())
    }

    /// Queues the last reference picture for display again, at the current timestamp, if
    /// skipped pictures are to be repeated.
    ///
    /// The repeat takes a slot of its own that presents the surface of the reference. That
    /// surface is not reused until the consumer has returned both.
    fn repeat_last_reference(&mut self, input: &InputBuffer) -> DecodeResult<()> {
        if !self.config.repeat_skipped_frames {
            return Ok(());
        }
        let Some(last) = self.last_reference else {
            debug!("no reference picture to repeat");
            return Ok(());
        };

        let index = self.acquire(input, true)?;
        let (surface, poc) = {
            let reference = self.pool.slot(last);
            (reference.surface, reference.poc)
        };
        self.pool.slot_mut(index).poc = poc;
        self.pool.set_display_surface(index, surface);
        debug!("repeating surface {:#x} in slot {}", surface, index);

        if let Some(index) = self.pool.finish_acquired(true) {
            self.output.push(index);
        }

        Ok(())
    }

    /// Drops the frame in progress and every frame waiting for output.
    fn discard_output(&mut self) {
        if let Err(e) = self.end_frame(true) {
            warn!("error while dropping frame in progress: {}", e);
        }

        for index in self.output.take_all() {
            if self.pool.slot(index).flags.resolution_change {
                self.format.mark_size_changed();
            }
            self.pool.set_render_done(index, true);
        }
    }

    /// Returns [`DecodeError::FormatChanged`] if the stream does not fit the allocated surfaces
    /// anymore, after dropping everything that was pending.
    fn check_format(&mut self) -> DecodeResult<()> {
        if !self.configured || !self.format.needs_reallocation() {
            return Ok(());
        }

        let info = self.format.info();
        info!(
            "stream of {}x{} needing {} surfaces does not fit allocated surfaces of {}x{}",
            info.coded.width,
            info.coded.height,
            info.buffers_needed,
            info.surface.width,
            info.surface.height
        );
        self.discard_output();
        self.pool.reset();
        self.last_reference = None;
        self.forward_reference = None;

        Err(DecodeError::FormatChanged)
    }

    /// Forgets everything about the frames decoded so far, keeping the configuration.
    fn flush(&mut self) {
        self.discard_output();
        self.pool.advance_cursor();
        self.pool.reset();
        self.output.reset_order();
        self.last_reference = None;
        self.forward_reference = None;
        self.current_timestamp = INVALID_TIMESTAMP;
        self.show_frame = true;
    }

    fn stop(&mut self) {
        self.discard_output();
        if self.configured {
            self.backend.destroy();
        }
        self.pool.clear();
        self.output = OutputQueue::new();
        self.format.reset();
        self.last_reference = None;
        self.forward_reference = None;
        self.extra_surfaces.clear();
        self.current_timestamp = INVALID_TIMESTAMP;
        self.show_frame = true;
        self.configured = false;
        self.flushed = true;
    }

    fn get_output(&mut self, draining: bool) -> DecodeResult<Option<OutputFrame>> {
        if draining {
            if let Err(e) = self.end_frame(false) {
                warn!("failed to complete the last frame: {}", e);
            }
        }

        let Some(index) = self.output.pop(&self.pool, draining) else {
            return Ok(None);
        };
        let eos = draining && self.output.is_empty();
        let surface = self.pool.slot(index).display_surface;

        if self.pool.is_external() || self.config.raw_output || self.config.error_report {
            if let Err(e) = self.backend.sync(surface) {
                warn!("failed to sync surface {:#x}: {}", surface, e);
            }
        }

        let mut errors = std::mem::take(&mut self.pool.slot_mut(index).errors);
        if self.config.error_report {
            match self.backend.query_errors(surface) {
                Ok(mb_errors) => errors.extend_macroblock_errors(&mb_errors),
                Err(e) => warn!("failed to query decoding errors: {}", e),
            }
        }

        let raw = if self.config.raw_output {
            match self.read_raw(surface) {
                Ok(raw) => {
                    // The content has been copied, the surface can be reused right away.
                    self.pool.set_render_done(index, true);
                    Some(raw)
                }
                Err(e) => {
                    // The frame is still handed out so its surface comes back with render done.
                    warn!("failed to read back surface {:#x}: {}", surface, e);
                    None
                }
            }
        } else {
            None
        };

        let slot = self.pool.slot(index);
        Ok(Some(OutputFrame {
            surface: slot.display_surface,
            timestamp: slot.timestamp,
            poc: slot.poc,
            flags: OutputFlags { eos, ..slot.flags },
            errors,
            display_resolution: self.format.info().display(),
            raw,
        }))
    }

    /// Reads the visible area of `surface` as tightly packed NV12.
    fn read_raw(&mut self, surface: SurfaceHandle) -> DecodeResult<Vec<u8>> {
        let image = self.backend.read_back(surface)?;
        let info = self.format.info();
        let display = info.display();
        let (x, y) = (info.crop.left as usize, info.crop.top as usize);
        let (width, height) = (display.width as usize, display.height as usize);

        if !raw_image_fits(&image, x, y, width, height) {
            return Err(DecodeError::MemoryFailure(format!(
                "mapped image of {} bytes too small for {}x{} frame",
                image.data.len(),
                width,
                height
            )));
        }

        let mut raw = vec![0u8; nv12_frame_size(width, height)];
        if width > 0 && height > 0 {
            nv12_copy(
                &image.data,
                &mut raw,
                x,
                y,
                width,
                height,
                image.strides,
                image.offsets,
            );
        }

        Ok(raw)
    }
}

/// Returns the `size` bytes of `data` starting at `offset`.
fn slice_bytes(data: &[u8], offset: usize, size: usize) -> DecodeResult<&[u8]> {
    offset
        .checked_add(size)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| {
            DecodeError::InvalidData(format!(
                "slice at {}+{} exceeds buffer of {} bytes",
                offset,
                size,
                data.len()
            ))
        })
}

fn allocation_error(error: BackendError) -> DecodeError {
    match error {
        BackendError::OutOfResources => {
            DecodeError::MemoryFailure("cannot allocate decode surfaces".into())
        }
        e => DecodeError::DriverFailure(e),
    }
}

/// Whether the area to copy lies within the planes of `image`.
fn raw_image_fits(image: &RawImage, x: usize, y: usize, width: usize, height: usize) -> bool {
    if width == 0 || height == 0 {
        return true;
    }

    let chroma_width = width + width % 2;
    let chroma_height = (height + 1) / 2;
    let luma_end = image.offsets[0] + (y + height - 1) * image.strides[0] + x + width;
    let chroma_end =
        image.offsets[1] + (y / 2 + chroma_height - 1) * image.strides[1] + x + chroma_width;

    width <= image.strides[0]
        && chroma_width <= image.strides[1]
        && luma_end <= image.data.len()
        && chroma_end <= image.data.len()
}

/// Codec-specific part of a decoder.
///
/// A state machine turns parsed units into pictures submitted to the backend, using the
/// [`DecoderCore`] for everything that is shared between codecs.
pub trait FrameStateMachine<B: HwBackend> {
    /// Parsed unit consumed by the state machine.
    type Unit;

    /// Returns the bytes to hand to the parser for `input`, or `None` if the buffer must be
    /// dropped.
    fn clear_data<'a>(&mut self, input: &InputBuffer<'a>) -> DecodeResult<Option<Cow<'a, [u8]>>> {
        Ok(Some(Cow::Borrowed(input.data)))
    }

    /// Derives the hardware requirements of the stream from `unit`. Returns `None` if `unit`
    /// does not carry enough information yet.
    fn stream_requirements(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &Self::Unit,
    ) -> DecodeResult<Option<StreamRequirements>>;

    /// Records the stream format carried by `unit`. Returns [`DecodeError::FormatChanged`] if
    /// the stream does not fit the allocated surfaces anymore.
    fn update_format_info(&mut self, core: &mut DecoderCore<B>, unit: &Self::Unit)
        -> DecodeResult<()>;

    /// Whether `unit` starts a new frame rather than continuing the one in progress.
    fn is_new_frame(&mut self, core: &DecoderCore<B>, input: &InputBuffer, unit: &Self::Unit)
        -> bool;

    /// Resolves the references of slice `slice` of picture `picture` of `unit`.
    fn set_reference(
        &mut self,
        core: &mut DecoderCore<B>,
        unit: &Self::Unit,
        picture: usize,
        slice: usize,
    ) -> DecodeResult<ReferenceLists>;

    /// Submits slice `slice` of picture `picture` of `unit`.
    fn decode_slice(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &Self::Unit,
        picture: usize,
        slice: usize,
    ) -> DecodeResult<()>;

    /// Decodes everything `unit` contains.
    fn decode_unit(
        &mut self,
        core: &mut DecoderCore<B>,
        input: &InputBuffer,
        unit: &Self::Unit,
    ) -> DecodeResult<DecodeStatus>;

    /// Forgets all codec state tied to the frames decoded so far.
    fn flush(&mut self, core: &mut DecoderCore<B>);
}

/// A decoder combining a codec state machine `M`, a parser and a backend `B`.
///
/// This struct manages the high-level decoder lifecycle, while the codec-specific logic is left
/// to `M`.
pub struct StatelessDecoder<M, B>
where
    M: FrameStateMachine<B>,
    B: HwBackend,
{
    core: DecoderCore<B>,
    machine: M,
    parser: Box<dyn Parser<Unit = M::Unit>>,
    state: DecodingState,
}

impl<M, B> StatelessDecoder<M, B>
where
    M: FrameStateMachine<B>,
    B: HwBackend,
{
    pub fn new(machine: M, parser: Box<dyn Parser<Unit = M::Unit>>, backend: B) -> Self {
        Self {
            core: DecoderCore::new(backend),
            machine,
            parser,
            state: Default::default(),
        }
    }

    /// Starts the decoder with `config`. Surfaces are allocated once the stream parameters are
    /// known.
    pub fn start(&mut self, config: DecoderConfig) -> DecodeResult<()> {
        if self.state != DecodingState::Stopped {
            return Err(DecodeError::BadConfig("decoder already started".into()));
        }

        let handles = &config.external_surfaces;
        if let Some((i, handle)) = handles
            .iter()
            .enumerate()
            .find(|(i, h)| handles[..*i].contains(*h))
        {
            return Err(DecodeError::BadConfig(format!(
                "external surface {:#x} provided twice (index {})",
                handle, i
            )));
        }
        if config.min_surfaces == Some(0) {
            return Err(DecodeError::BadConfig(
                "minimum surface count must be positive".into(),
            ));
        }

        debug!("starting decoder with {:?}", config);
        self.core.config = config;
        self.state = DecodingState::AwaitingStreamInfo;

        Ok(())
    }

    /// Decodes one input buffer.
    pub fn decode(&mut self, input: &InputBuffer) -> DecodeResult<DecodeStatus> {
        if self.state == DecodingState::Stopped {
            return Err(DecodeError::NotStarted);
        }

        let Some(data) = self.machine.clear_data(input)? else {
            return Ok(DecodeStatus::FrameDropped);
        };
        let unit = self
            .parser
            .parse(&data)
            .map_err(DecodeError::ParserFailure)?;

        if self.state == DecodingState::AwaitingStreamInfo {
            let Some(requirements) = self.machine.stream_requirements(&mut self.core, &unit)?
            else {
                debug!("waiting for stream parameters, ignoring input");
                return Ok(DecodeStatus::Success);
            };

            self.core.setup(&requirements)?;
            self.state = DecodingState::Decoding;
        }

        self.core.flushed = false;
        let result = self.machine.decode_unit(&mut self.core, input, &unit);
        if let Err(DecodeError::FormatChanged) = result {
            self.machine.flush(&mut self.core);
        }

        result
    }

    /// Returns the next frame to display, if any.
    ///
    /// With `draining` set, the frame in progress is completed and frames are returned without
    /// waiting for the reorder window to fill up. The last frame of a drain carries the EOS flag.
    pub fn get_output(&mut self, draining: bool) -> DecodeResult<Option<OutputFrame>> {
        if self.state != DecodingState::Decoding {
            return Ok(None);
        }

        self.core.get_output(draining)
    }

    /// Drops every pending frame and reference, e.g. before a seek. Does nothing if nothing was
    /// decoded since the last flush.
    pub fn flush(&mut self) {
        if self.state != DecodingState::Decoding || self.core.flushed {
            return;
        }

        debug!("flushing decoder");
        self.core.flush();
        self.machine.flush(&mut self.core);
        self.parser.flush();
        self.core.flushed = true;
    }

    /// Stops the decoder and releases all hardware resources. The decoder can be started again.
    pub fn stop(&mut self) {
        if self.state == DecodingState::Stopped {
            return;
        }

        debug!("stopping decoder");
        self.machine.flush(&mut self.core);
        self.core.stop();
        self.state = DecodingState::Stopped;
    }

    /// Returns `surface` to the decoder after the consumer is done displaying it.
    pub fn signal_render_done(&self, surface: SurfaceHandle) -> DecodeResult<()> {
        self.core.pool.render_done_signal().signal(surface)
    }

    /// Returns a handle that can signal render-done from another thread.
    pub fn render_done_signal(&self) -> RenderDoneSignal {
        self.core.pool.render_done_signal()
    }

    pub fn format_info(&self) -> &FormatInfo {
        self.core.format_info()
    }

    pub fn backend(&self) -> &B {
        &self.core.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.core.backend
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::dummy::Backend;
    use crate::backend::dummy::Call;
    use crate::codec::scripted::Script;
    use crate::codec::scripted::ScriptedParser;
    use crate::codec::vp8::Frame;
    use crate::codec::vp8::FrameType;
    use crate::decoder::stateless::vp8::Vp8;

    pub(crate) fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Returns every frame the decoder can output.
    pub(crate) fn drain<M, B>(decoder: &mut StatelessDecoder<M, B>) -> Vec<OutputFrame>
    where
        M: FrameStateMachine<B>,
        B: HwBackend,
    {
        std::iter::from_fn(|| decoder.get_output(true).unwrap()).collect()
    }

    /// Returns the frames that can be output without draining, handing them back right away.
    pub(crate) fn collect_ready<M, B>(decoder: &mut StatelessDecoder<M, B>) -> Vec<OutputFrame>
    where
        M: FrameStateMachine<B>,
        B: HwBackend,
    {
        let frames: Vec<_> = std::iter::from_fn(|| decoder.get_output(false).unwrap()).collect();
        for frame in &frames {
            decoder.signal_render_done(frame.surface).unwrap();
        }
        frames
    }

    fn key_frame(width: u32, height: u32) -> Frame {
        Frame {
            frame_type: FrameType::KeyFrame,
            width,
            height,
            refresh_golden_frame: true,
            refresh_alternate_frame: true,
            size: 4,
            ..Default::default()
        }
    }

    fn inter_frame() -> Frame {
        Frame {
            frame_type: FrameType::InterFrame,
            width: 64,
            height: 48,
            size: 4,
            ..Default::default()
        }
    }

    fn decoder(config: DecoderConfig) -> (StatelessDecoder<Vp8, Backend>, Script<Frame>) {
        init_logger();
        let (parser, script) = ScriptedParser::new();
        let mut decoder = StatelessDecoder::new(Vp8::new(), Box::new(parser), Backend::new());
        decoder.start(config).unwrap();
        (decoder, script)
    }

    const DATA: [u8; 4] = [0x10, 0x02, 0x00, 0x9d];

    #[test]
    fn decode_before_start() {
        let (parser, _script) = ScriptedParser::<Frame>::new();
        let mut decoder = StatelessDecoder::new(Vp8::new(), Box::new(parser), Backend::new());

        assert!(matches!(
            decoder.decode(&InputBuffer::new(0, &DATA)),
            Err(DecodeError::NotStarted)
        ));
        assert!(decoder.get_output(true).unwrap().is_none());
    }

    #[test]
    fn start_rejects_duplicate_surfaces() {
        let (parser, _script) = ScriptedParser::<Frame>::new();
        let mut decoder = StatelessDecoder::new(Vp8::new(), Box::new(parser), Backend::new());

        let config = DecoderConfig {
            external_surfaces: vec![1, 2, 1],
            ..Default::default()
        };
        assert!(matches!(
            decoder.start(config),
            Err(DecodeError::BadConfig(_))
        ));
        decoder.start(Default::default()).unwrap();
        assert!(matches!(
            decoder.start(Default::default()),
            Err(DecodeError::BadConfig(_))
        ));
    }

    #[test]
    fn parser_failure_skips_unit() {
        let (mut decoder, script) = decoder(Default::default());

        script.push(key_frame(64, 48));
        script.push_error();
        script.push(inter_frame());

        decoder.decode(&InputBuffer::new(0, &DATA)).unwrap();
        assert!(matches!(
            decoder.decode(&InputBuffer::new(1, &DATA)),
            Err(DecodeError::ParserFailure(_))
        ));
        decoder.decode(&InputBuffer::new(2, &DATA)).unwrap();

        let timestamps: Vec<_> = drain(&mut decoder).iter().map(|f| f.timestamp).collect();
        assert_eq!(timestamps, vec![0, 2]);
    }

    #[test]
    fn flush_twice_is_noop() {
        let (mut decoder, script) = decoder(Default::default());

        script.push(key_frame(64, 48));
        decoder.decode(&InputBuffer::new(0, &DATA)).unwrap();

        decoder.flush();
        let calls = decoder.backend().calls.len();
        let cursor_probe = decoder.core.pool.acquire(&mut Backend::new()).unwrap();
        decoder.core.pool.release();

        decoder.flush();
        assert_eq!(script.flushes(), 1);
        assert_eq!(decoder.backend().calls.len(), calls);
        assert_eq!(decoder.core.pool.acquire(&mut Backend::new()).unwrap(), cursor_probe);
        decoder.core.pool.release();
        assert!(decoder.get_output(true).unwrap().is_none());
    }

    #[test]
    fn flush_drops_pending_frames() {
        let (mut decoder, script) = decoder(DecoderConfig {
            low_delay: true,
            ..Default::default()
        });

        script.push(key_frame(64, 48));
        script.push(inter_frame());
        decoder.decode(&InputBuffer::new(0, &DATA)).unwrap();
        decoder.decode(&InputBuffer::new(1, &DATA)).unwrap();

        decoder.flush();
        assert!(decoder.get_output(true).unwrap().is_none());

        // All surfaces are available again.
        let num_surfaces = decoder.core.pool.len();
        for i in 0..num_surfaces {
            assert!(decoder.core.pool.is_render_done(i));
            assert!(!decoder.core.pool.slot(i).as_reference);
        }

        // Inter frames need a key frame after a flush.
        script.push(inter_frame());
        assert!(matches!(
            decoder.decode(&InputBuffer::new(2, &DATA)),
            Err(DecodeError::NoReference)
        ));
    }

    #[test]
    fn render_done_before_start_is_replayed() {
        let handles = vec![0x40, 0x41, 0x42, 0x43];
        let (parser, script) = ScriptedParser::new();
        let mut decoder = StatelessDecoder::new(Vp8::new(), Box::new(parser), Backend::new());
        let signal = decoder.render_done_signal();

        std::thread::spawn(move || signal.signal(0x42).unwrap())
            .join()
            .unwrap();

        decoder
            .start(DecoderConfig {
                resolution: Resolution::from((64, 48)),
                external_surfaces: handles,
                ..Default::default()
            })
            .unwrap();

        script.push(key_frame(64, 48));
        decoder.decode(&InputBuffer::new(0, &DATA)).unwrap();
        assert_eq!(decoder.backend().decoded_targets(), vec![0x42]);

        // No other surface has been returned by the consumer.
        script.push(inter_frame());
        assert!(matches!(
            decoder.decode(&InputBuffer::new(1, &DATA)),
            Err(DecodeError::NoSurface)
        ));
    }

    #[test]
    fn too_few_external_surfaces() {
        let (mut decoder, script) = decoder(DecoderConfig {
            resolution: Resolution::from((320, 240)),
            external_surfaces: vec![1, 2, 3],
            min_surfaces: Some(8),
            ..Default::default()
        });

        script.push(key_frame(640, 480));
        assert!(matches!(
            decoder.decode(&InputBuffer::new(0, &DATA)),
            Err(DecodeError::FormatChanged)
        ));
        assert_eq!(decoder.format_info().coded, Resolution::from((640, 480)));
        assert_eq!(decoder.backend().count(|c| matches!(c, Call::CreateSurfaces(_))), 0);

        decoder.stop();
        decoder
            .start(DecoderConfig {
                resolution: Resolution::from((640, 480)),
                external_surfaces: vec![1, 2, 3],
                ..Default::default()
            })
            .unwrap();
        script.push(key_frame(640, 480));
        decoder.decode(&InputBuffer::new(0, &DATA)).unwrap();
        assert_eq!(decoder.backend().surfaces(), &[1, 2, 3]);
    }

    #[test]
    fn out_of_memory() {
        let (mut decoder, script) = decoder(Default::default());
        decoder.backend_mut().out_of_memory = true;

        script.push(key_frame(64, 48));
        assert!(matches!(
            decoder.decode(&InputBuffer::new(0, &DATA)),
            Err(DecodeError::MemoryFailure(_))
        ));

        decoder.backend_mut().out_of_memory = false;
        script.push(key_frame(64, 48));
        assert_eq!(
            decoder.decode(&InputBuffer::new(0, &DATA)).unwrap(),
            DecodeStatus::Success
        );
    }

    #[test]
    fn min_surfaces_is_honored() {
        let (mut decoder, script) = decoder(DecoderConfig {
            min_surfaces: Some(20),
            ..Default::default()
        });

        script.push(key_frame(64, 48));
        decoder.decode(&InputBuffer::new(0, &DATA)).unwrap();
        assert_eq!(decoder.core.pool.len(), 20);
    }

    #[test]
    fn oversized_picture_is_rejected() {
        let (mut decoder, script) = decoder(Default::default());

        script.push(key_frame(u32::MAX - 1, 48));
        assert!(matches!(
            decoder.decode(&InputBuffer::new(0, &DATA)),
            Err(DecodeError::InvalidData(_))
        ));
        assert!(decoder.backend().calls.is_empty());

        // The stream can still start with a sane key frame.
        script.push(key_frame(64, 48));
        decoder.decode(&InputBuffer::new(1, &DATA)).unwrap();
        assert_eq!(drain(&mut decoder).len(), 1);
    }

    #[test]
    fn raw_output_is_cropped() {
        let (mut decoder, script) = decoder(DecoderConfig {
            raw_output: true,
            ..Default::default()
        });

        // 60x44 is padded to 64x48 surfaces.
        script.push(key_frame(60, 44));
        decoder.decode(&InputBuffer::new(0, &DATA)).unwrap();

        let frame = decoder.get_output(true).unwrap().unwrap();
        assert!(frame.flags.eos);
        assert_eq!(frame.display_resolution, Resolution::from((60, 44)));

        let raw = frame.raw.unwrap();
        let expected = vec![Backend::fill_byte(frame.surface); nv12_frame_size(60, 44)];
        assert_eq!(
            format!("{:08x}", crc32fast::hash(&raw)),
            format!("{:08x}", crc32fast::hash(&expected))
        );

        // Raw output returns the surface right away.
        let slot = (0..decoder.core.pool.len())
            .find(|i| decoder.core.pool.slot(*i).surface == frame.surface)
            .unwrap();
        assert!(decoder.core.pool.is_render_done(slot));
    }

    #[test]
    fn failed_read_back_still_outputs_frame() {
        let (mut decoder, script) = decoder(DecoderConfig {
            raw_output: true,
            ..Default::default()
        });

        script.push(key_frame(64, 48));
        decoder.decode(&InputBuffer::new(7, &DATA)).unwrap();
        decoder.backend_mut().failing_read_back = true;

        let frame = decoder.get_output(true).unwrap().unwrap();
        assert_eq!(frame.timestamp, 7);
        assert!(frame.flags.eos);
        assert_eq!(frame.raw, None);
        assert!(decoder.get_output(true).unwrap().is_none());

        // Without a copy the consumer owns the surface until it hands it back.
        let slot = (0..decoder.core.pool.len())
            .find(|i| decoder.core.pool.slot(*i).surface == frame.surface)
            .unwrap();
        assert!(!decoder.core.pool.is_render_done(slot));
        decoder.signal_render_done(frame.surface).unwrap();
        assert!(decoder.core.pool.is_render_done(slot));
    }

    #[test]
    fn error_report_collects_macroblock_errors() {
        let (mut decoder, script) = decoder(DecoderConfig {
            error_report: true,
            ..Default::default()
        });

        script.push(key_frame(64, 48));
        decoder.decode(&InputBuffer::new(0, &DATA)).unwrap();
        let target = decoder.backend().decoded_targets()[0];
        decoder.backend_mut().errors.insert(
            target,
            vec![crate::backend::MacroblockError {
                kind: crate::backend::MacroblockErrorKind::Concealed,
                start_mb: 3,
                end_mb: 7,
            }],
        );

        let frame = decoder.get_output(true).unwrap().unwrap();
        assert_eq!(frame.errors.ranges().len(), 1);
        assert_eq!(frame.errors.ranges()[0].start_mb, 3);
        assert!(decoder
            .backend()
            .calls
            .contains(&Call::Sync(frame.surface)));
    }

    #[test]
    fn driver_failure_releases_surface() {
        let (mut decoder, script) = decoder(Default::default());

        script.push(key_frame(64, 48));
        decoder.backend_mut().failing_end_pictures = 1;
        assert!(matches!(
            decoder.decode(&InputBuffer::new(0, &DATA)),
            Err(DecodeError::DriverFailure(_))
        ));
        assert!(decoder.get_output(true).unwrap().is_none());

        script.push(key_frame(64, 48));
        decoder.decode(&InputBuffer::new(1, &DATA)).unwrap();
        let frames = drain(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp, 1);
    }

    #[test]
    fn stop_releases_everything() {
        let (mut decoder, script) = decoder(Default::default());

        script.push(key_frame(64, 48));
        decoder.decode(&InputBuffer::new(0, &DATA)).unwrap();
        decoder.stop();

        assert!(decoder.backend().calls.contains(&Call::Destroy));
        assert!(decoder.core.pool.is_empty());
        assert!(matches!(
            decoder.decode(&InputBuffer::new(1, &DATA)),
            Err(DecodeError::NotStarted)
        ));
    }
}
