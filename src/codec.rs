// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsed syntax of the supported codecs, and the parser seam that produces it.
//!
//! Bitstream parsing itself is out of the scope of this crate: a [`Parser`] is handed to the
//! decoder when it is built, and turns each input buffer into the structured units defined in
//! the codec modules below.

pub mod avc;
pub mod mpeg4;
#[cfg(test)]
pub(crate) mod scripted;
pub mod vc1;
pub mod vp8;

/// Turns the bytes of one input buffer into a codec-specific parsed unit.
pub trait Parser {
    /// Structured syntax for one input buffer.
    type Unit;

    /// Parses `data`, which holds one or more complete syntax units of the stream.
    fn parse(&mut self, data: &[u8]) -> anyhow::Result<Self::Unit>;

    /// Forgets any state carried between buffers, e.g. after a seek.
    fn flush(&mut self) {}
}

impl<P: Parser + ?Sized> Parser for Box<P> {
    type Unit = P::Unit;

    fn parse(&mut self, data: &[u8]) -> anyhow::Result<Self::Unit> {
        (**self).parse(data)
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}
