// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Display ordering of decoded frames.

use std::collections::VecDeque;

use crate::decoder::surface_pool::SlotIndex;
use crate::decoder::surface_pool::SurfacePool;

/// Maximum number of frames kept for reordering.
pub const OUTPUT_WINDOW_SIZE: usize = 8;

/// How the display order of the queued frames is decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMethod {
    /// Reference frames are delayed by one reference frame, non-reference frames go out as soon
    /// as they are decoded. Suited to I/P/B streams with at most one B picture run.
    #[default]
    ByCodingType,
    /// Frames go out in increasing picture order count, within a bounded window.
    ByPictureOrder,
}

/// Decoded frames waiting to be output, in decode order.
#[derive(Debug)]
pub struct OutputQueue {
    queue: VecDeque<SlotIndex>,
    method: OutputMethod,
    low_delay: bool,
    window: usize,
    next_output_poc: i32,
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self {
            queue: Default::default(),
            method: Default::default(),
            low_delay: false,
            window: OUTPUT_WINDOW_SIZE,
            next_output_poc: i32::MIN,
        }
    }
}

impl OutputQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the ordering policy. `window` is capped to [`OUTPUT_WINDOW_SIZE`].
    pub fn configure(&mut self, method: OutputMethod, window: usize, low_delay: bool) {
        self.method = method;
        self.window = window.clamp(1, OUTPUT_WINDOW_SIZE);
        self.low_delay = low_delay;
    }

    pub fn method(&self) -> OutputMethod {
        self.method
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn low_delay(&self) -> bool {
        self.low_delay
    }

    pub fn push(&mut self, slot: SlotIndex) {
        self.queue.push_back(slot);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotIndex> + '_ {
        self.queue.iter().copied()
    }

    /// Empties the queue and returns the slots it held.
    pub fn take_all(&mut self) -> Vec<SlotIndex> {
        self.queue.drain(..).collect()
    }

    /// Restarts the picture order tracking, e.g. after a seek.
    pub fn reset_order(&mut self) {
        self.next_output_poc = i32::MIN;
    }

    /// Removes and returns the next frame to display, if it can be decided yet.
    ///
    /// When `draining`, no more frames will come and a frame is returned as long as the queue is
    /// not empty.
    pub fn pop(&mut self, pool: &SurfacePool, draining: bool) -> Option<SlotIndex> {
        if self.queue.is_empty() {
            return None;
        }

        let position = if self.low_delay {
            Some(0)
        } else {
            match self.method {
                OutputMethod::ByCodingType => self.find_by_coding_type(pool, draining),
                OutputMethod::ByPictureOrder => self.find_by_picture_order(pool, draining),
            }
        }?;

        self.queue.remove(position)
    }

    fn find_by_coding_type(&self, pool: &SurfacePool, draining: bool) -> Option<usize> {
        let mut references = 0;

        for (position, slot) in self.queue.iter().enumerate() {
            if pool.slot(*slot).reference_frame {
                references += 1;
                // The head is necessarily a reference frame.
                if references > 1 {
                    return Some(0);
                }
            } else {
                return Some(position);
            }
        }

        draining.then_some(0)
    }

    fn find_by_picture_order(&mut self, pool: &SurfacePool, draining: bool) -> Option<usize> {
        let mut restarted = false;

        'scan: loop {
            let mut lowest: Option<(usize, i32)> = None;

            for (count, slot) in self.queue.iter().enumerate().map(|(i, s)| (i + 1, *s)) {
                let poc = pool.slot(slot).poc;

                // POC 0 starts a new sequence: whatever was selected so far must go first.
                if poc == 0 {
                    match lowest {
                        Some((position, selected)) => {
                            self.next_output_poc = selected.saturating_add(1);
                            return Some(position);
                        }
                        None => self.next_output_poc = i32::MIN,
                    }
                }

                if poc >= self.next_output_poc && lowest.map_or(true, |(_, l)| poc < l) {
                    lowest = Some((count - 1, poc));
                }

                let expected = lowest.map_or(false, |(_, l)| l == self.next_output_poc);
                if expected || count == self.window {
                    match lowest {
                        Some((position, selected)) => {
                            self.next_output_poc = selected.saturating_add(1);
                            return Some(position);
                        }
                        // Every queued POC is below the expected one: the stream jumped back
                        // without an IDR, start over from the lowest one.
                        None if !restarted => {
                            self.next_output_poc = i32::MIN;
                            restarted = true;
                            continue 'scan;
                        }
                        None => break 'scan,
                    }
                }
            }

            break;
        }

        if !draining {
            return None;
        }

        let (position, poc) = self
            .queue
            .iter()
            .enumerate()
            .map(|(i, s)| (i, pool.slot(*s).poc))
            .min_by_key(|(_, poc)| *poc)?;
        self.next_output_poc = poc.saturating_add(1);

        Some(position)
    }
}
