// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parser replaying pre-built units, so the decoders can be tested without a bitstream.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use anyhow::anyhow;

use crate::codec::Parser;

/// Returns the queued units in order, one per `parse` call.
///
/// The queue is shared so tests can keep feeding units after the parser has been handed to a
/// decoder.
pub(crate) struct ScriptedParser<U> {
    units: Rc<RefCell<VecDeque<anyhow::Result<U>>>>,
    flushes: Rc<RefCell<usize>>,
}

/// Test-side handle to the queue of a [`ScriptedParser`].
#[derive(Clone)]
pub(crate) struct Script<U> {
    units: Rc<RefCell<VecDeque<anyhow::Result<U>>>>,
    flushes: Rc<RefCell<usize>>,
}

impl<U> Script<U> {
    pub(crate) fn push(&self, unit: U) {
        self.units.borrow_mut().push_back(Ok(unit));
    }

    pub(crate) fn push_error(&self) {
        self.units
            .borrow_mut()
            .push_back(Err(anyhow!("scripted parser failure")));
    }

    pub(crate) fn flushes(&self) -> usize {
        *self.flushes.borrow()
    }
}

impl<U> ScriptedParser<U> {
    pub(crate) fn new() -> (Self, Script<U>) {
        let units = Rc::new(RefCell::new(VecDeque::new()));
        let flushes = Rc::new(RefCell::new(0));

        (
            Self {
                units: Rc::clone(&units),
                flushes: Rc::clone(&flushes),
            },
            Script { units, flushes },
        )
    }
}

impl<U> Parser for ScriptedParser<U> {
    type Unit = U;

    fn parse(&mut self, _: &[u8]) -> anyhow::Result<U> {
        self.units
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("no more scripted units")))
    }

    fn flush(&mut self) {
        *self.flushes.borrow_mut() += 1;
    }
}
