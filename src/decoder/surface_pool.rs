// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pool of decode-target surfaces.
//!
//! A surface can be handed to the hardware only if nothing else still needs it: it must not be
//! pinned as a reference, the consumer must have returned it after display, and the hardware
//! must be done writing into it. The consumer-side "render done" flags live behind a mutex so
//! they can be signaled from another thread through a [`RenderDoneSignal`]; everything else is
//! only touched by the decoding thread.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use log::debug;
use log::warn;

use crate::backend::HwBackend;
use crate::backend::RenderStatus;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::ErrorReport;
use crate::decoder::OutputFlags;
use crate::SurfaceHandle;
use crate::INVALID_TIMESTAMP;

/// Index of a slot in the [`SurfacePool`].
pub type SlotIndex = usize;

/// Picture order count of a slot that holds no picture.
pub const POC_INVALID: i32 = i32::MAX;

/// Number of render-done notifications that can be recorded before the pool is initialized.
pub const MAX_PENDING_RENDER_DONE: usize = 64;

/// Decoding state attached to one surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSlot {
    pub surface: SurfaceHandle,
    /// Surface presented to the consumer for this slot.
    pub display_surface: SurfaceHandle,
    pub poc: i32,
    pub timestamp: u64,
    /// The picture decoded into this slot can be used for prediction.
    pub reference_frame: bool,
    /// The slot is pinned by reference bookkeeping and cannot be reused.
    pub as_reference: bool,
    /// The hardware has finished writing into the surface.
    pub driver_render_done: bool,
    pub flags: OutputFlags,
    pub errors: ErrorReport,
}

impl SurfaceSlot {
    fn new(surface: SurfaceHandle) -> Self {
        Self {
            surface,
            display_surface: surface,
            poc: POC_INVALID,
            timestamp: INVALID_TIMESTAMP,
            reference_frame: false,
            as_reference: false,
            driver_render_done: true,
            flags: Default::default(),
            errors: Default::default(),
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.surface);
    }
}

/// Consumer-side state of the surfaces, shared with [`RenderDoneSignal`]s.
#[derive(Debug, Default)]
struct RenderTracker {
    initialized: bool,
    /// Surface each slot presents to the consumer, which is the handle it signals back.
    displayed: Vec<SurfaceHandle>,
    done: Vec<bool>,
    /// Notifications received before the surfaces were known.
    pending: Vec<SurfaceHandle>,
}

impl RenderTracker {
    fn signal(&mut self, handle: SurfaceHandle) -> DecodeResult<()> {
        if !self.initialized {
            if self.pending.len() >= MAX_PENDING_RENDER_DONE {
                return Err(DecodeError::InvalidData(format!(
                    "too many render-done notifications before initialization (surface {:#x})",
                    handle
                )));
            }
            self.pending.push(handle);
            return Ok(());
        }

        // A repeated picture is presented by several slots, each returned once.
        let presenting: Vec<_> = self
            .displayed
            .iter()
            .enumerate()
            .filter(|(_, h)| **h == handle)
            .map(|(i, _)| i)
            .collect();
        match presenting.iter().find(|i| !self.done[**i]).or(presenting.first()) {
            Some(&index) => self.done[index] = true,
            None => debug!("render done for unknown surface {:#x}, ignoring", handle),
        }

        Ok(())
    }
}

/// Thread-safe handle allowing the consumer to return displayed surfaces to the decoder.
#[derive(Debug, Clone)]
pub struct RenderDoneSignal(Arc<Mutex<RenderTracker>>);

impl RenderDoneSignal {
    /// Tells the decoder that the consumer is done with `handle`.
    ///
    /// Notifications received before the decoder has allocated its surfaces are kept and applied
    /// once the surfaces are known.
    pub fn signal(&self, handle: SurfaceHandle) -> DecodeResult<()> {
        lock(&self.0).signal(handle)
    }
}

fn lock(tracker: &Mutex<RenderTracker>) -> MutexGuard<'_, RenderTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed set of surfaces, reused in round-robin order.
#[derive(Debug, Default)]
pub struct SurfacePool {
    slots: Vec<SurfaceSlot>,
    tracker: Arc<Mutex<RenderTracker>>,
    external: bool,
    /// Slot where the next acquisition scan starts.
    cursor: usize,
    acquired: Option<SlotIndex>,
}

impl SurfacePool {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn render_done_signal(&self) -> RenderDoneSignal {
        RenderDoneSignal(Arc::clone(&self.tracker))
    }

    /// Takes ownership of `surfaces`.
    ///
    /// Internal surfaces start available. External surfaces belong to the consumer until it
    /// signals them, which may already have happened before this call.
    pub fn initialize(&mut self, surfaces: &[SurfaceHandle], external: bool) {
        self.slots = surfaces.iter().copied().map(SurfaceSlot::new).collect();
        self.external = external;
        self.cursor = 0;
        self.acquired = None;

        let mut tracker = lock(&self.tracker);
        let mut pending = std::mem::take(&mut tracker.pending);
        tracker.displayed = surfaces.to_vec();
        tracker.done = surfaces
            .iter()
            .map(|handle| match pending.iter().position(|p| p == handle) {
                Some(index) => {
                    pending.swap_remove(index);
                    true
                }
                None => !external,
            })
            .collect();
        tracker.initialized = true;

        if !pending.is_empty() {
            debug!(
                "dropping {} render-done notifications for unknown surfaces",
                pending.len()
            );
        }
    }

    /// Forgets all surfaces. Notifications received from now on are recorded as pending.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.cursor = 0;
        self.acquired = None;

        let mut tracker = lock(&self.tracker);
        *tracker = Default::default();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn slot(&self, index: SlotIndex) -> &SurfaceSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: SlotIndex) -> &mut SurfaceSlot {
        &mut self.slots[index]
    }

    pub fn acquired(&self) -> Option<SlotIndex> {
        self.acquired
    }

    pub fn is_render_done(&self, index: SlotIndex) -> bool {
        lock(&self.tracker).done[index]
    }

    pub fn set_render_done(&mut self, index: SlotIndex, done: bool) {
        lock(&self.tracker).done[index] = done;
    }

    pub fn set_as_reference(&mut self, index: SlotIndex, pinned: bool) {
        self.slots[index].as_reference = pinned;
    }

    /// Makes slot `index` present `surface` instead of its own surface.
    pub fn set_display_surface(&mut self, index: SlotIndex, surface: SurfaceHandle) {
        self.slots[index].display_surface = surface;
        lock(&self.tracker).displayed[index] = surface;
    }

    /// Whether the slot could be reused, ignoring the hardware status.
    fn is_free(&self, tracker: &RenderTracker, index: SlotIndex) -> bool {
        let slot = &self.slots[index];
        !slot.as_reference && tracker.done[index]
    }

    /// Whether another slot still displays the surface of `index`.
    fn is_displayed_elsewhere(&self, tracker: &RenderTracker, index: SlotIndex) -> bool {
        let surface = self.slots[index].surface;
        tracker
            .displayed
            .iter()
            .enumerate()
            .any(|(i, displayed)| i != index && *displayed == surface && !tracker.done[i])
    }

    /// Finds a surface to decode the next picture into.
    ///
    /// The scan starts at the slot following the last output and wraps around once. Returns
    /// [`DecodeError::NoSurface`] if every surface is still in use.
    pub fn acquire<B: HwBackend>(&mut self, backend: &mut B) -> DecodeResult<SlotIndex> {
        if self.acquired.is_some() {
            return Err(DecodeError::Fail("a surface is already acquired".into()));
        }
        if self.slots.is_empty() {
            return Err(DecodeError::Fail("surface pool is not initialized".into()));
        }

        let num_slots = self.slots.len();
        for step in 0..num_slots {
            let index = (self.cursor + step) % num_slots;

            if !self.is_free(&lock(&self.tracker), index) {
                continue;
            }

            // Only consumer-provided surfaces can still be read by the hardware on their way to
            // display.
            if self.external {
                let status = backend.query_render_status(self.slots[index].surface)?;
                self.slots[index].driver_render_done = status == RenderStatus::Ready;
                if !self.slots[index].driver_render_done {
                    continue;
                }
            }

            {
                let mut tracker = lock(&self.tracker);
                if !self.is_free(&tracker, index) {
                    continue;
                }
                if self.is_displayed_elsewhere(&tracker, index) {
                    debug!("surface of slot {} is still displayed by another slot", index);
                    continue;
                }
                tracker.done[index] = false;
                tracker.displayed[index] = self.slots[index].surface;
            }

            self.cursor = index;
            let slot = &mut self.slots[index];
            slot.reset();
            self.acquired = Some(index);

            return Ok(index);
        }

        Err(DecodeError::NoSurface)
    }

    /// Gives the acquired surface back without outputting it.
    pub fn release(&mut self) {
        if let Some(index) = self.acquired.take() {
            self.slots[index].as_reference = false;
            self.slots[index].driver_render_done = true;
            lock(&self.tracker).done[index] = true;
        }
    }

    /// Completes the acquired surface. If `show` is true the surface now belongs to the consumer
    /// and its slot is returned so it can be queued for output.
    pub fn finish_acquired(&mut self, show: bool) -> Option<SlotIndex> {
        let index = self.acquired.take()?;
        lock(&self.tracker).done[index] = !show;
        self.advance_cursor();

        if show {
            Some(index)
        } else {
            None
        }
    }

    pub fn advance_cursor(&mut self) {
        if !self.slots.is_empty() {
            self.cursor = (self.cursor + 1) % self.slots.len();
        }
    }

    /// Unpins every slot and forgets the pictures they held. Render-done flags are left as is
    /// since the consumer may still hold some surfaces.
    pub fn reset(&mut self) {
        self.acquired = None;
        for slot in &mut self.slots {
            slot.reset();
        }
    }
}
