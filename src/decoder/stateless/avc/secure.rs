// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Support for encrypted H.264 streams.
//!
//! The payload of a secure buffer cannot be read by the decoder. It comes with a
//! [`SecureSidecar`] describing each NAL unit in the clear, from which the adapter rebuilds a
//! byte stream the parser can work on: parameter sets and SEI are passed as is, and slices are
//! represented by their clear header only. The encrypted slice data is then submitted to the
//! backend along with that header.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use log::debug;
use log::warn;

use crate::codec::avc::NaluType;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;

const START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// Serialized size of a [`SecureNalu`] without its header bytes.
const NALU_RECORD_SIZE: usize = 13;

/// Clear description of one NAL unit of an encrypted payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecureNalu {
    /// First byte of the NAL unit, including `nal_ref_idc`.
    pub nal_type: u8,
    /// Position of the unit in the encrypted payload.
    pub offset: u32,
    pub length: u32,
    /// Clear content of the unit: the whole unit for parameter sets and SEI, the slice header
    /// for slices.
    pub header: Vec<u8>,
}

/// Description of the NAL units of an encrypted frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecureSidecar {
    /// Size of the encrypted frame.
    pub frame_length: u32,
    pub nalus: Vec<SecureNalu>,
}

impl SecureSidecar {
    /// Reads a sidecar from its little-endian serialized form.
    pub fn parse(mut data: &[u8]) -> DecodeResult<Self> {
        let truncated = || DecodeError::InvalidData("truncated secure sidecar".into());

        if data.remaining() < 8 {
            return Err(truncated());
        }
        let frame_length = data.get_u32_le();
        let count = data.get_u32_le() as usize;

        // Every record takes at least NALU_RECORD_SIZE bytes.
        if count > data.remaining() / NALU_RECORD_SIZE {
            return Err(DecodeError::InvalidData(format!(
                "secure sidecar announces {} units in {} bytes",
                count,
                data.remaining()
            )));
        }

        let mut nalus = Vec::with_capacity(count);
        for _ in 0..count {
            if data.remaining() < NALU_RECORD_SIZE {
                return Err(truncated());
            }
            let nal_type = data.get_u8();
            let offset = data.get_u32_le();
            let length = data.get_u32_le();
            let header_len = data.get_u32_le() as usize;
            if data.remaining() < header_len {
                return Err(truncated());
            }
            let header = data[..header_len].to_vec();
            data.advance(header_len);

            nalus.push(SecureNalu {
                nal_type,
                offset,
                length,
                header,
            });
        }

        if data.has_remaining() {
            debug!("ignoring {} trailing sidecar bytes", data.remaining());
        }

        Ok(Self {
            frame_length,
            nalus,
        })
    }

    /// Serializes the sidecar in the form read by [`SecureSidecar::parse`].
    pub fn to_bytes(&self) -> Bytes {
        let size = 8 + self
            .nalus
            .iter()
            .map(|n| NALU_RECORD_SIZE + n.header.len())
            .sum::<usize>();
        let mut buf = BytesMut::with_capacity(size);

        buf.put_u32_le(self.frame_length);
        buf.put_u32_le(self.nalus.len() as u32);
        for nalu in &self.nalus {
            buf.put_u8(nalu.nal_type);
            buf.put_u32_le(nalu.offset);
            buf.put_u32_le(nalu.length);
            buf.put_u32_le(nalu.header.len() as u32);
            buf.put_slice(&nalu.header);
        }

        buf.freeze()
    }
}

/// Encrypted slice, as submitted to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedSlice {
    pub header: Vec<u8>,
    pub offset: usize,
    pub length: usize,
}

/// Turns secure buffers into parser input and hands out their encrypted slices in order.
#[derive(Debug, Default)]
pub struct SecureSliceAdapter {
    slices: Vec<ProtectedSlice>,
    cursor: usize,
    active: bool,
}

impl SecureSliceAdapter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether the buffer being decoded is a secure one.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Prepares the decoding of a secure payload of `payload_len` bytes described by
    /// `sidecar`. Returns the clear byte stream to parse, or `None` if the frame contains units
    /// that cannot be handled and must be dropped.
    pub fn prepare(
        &mut self,
        sidecar: &SecureSidecar,
        payload_len: usize,
    ) -> DecodeResult<Option<Vec<u8>>> {
        self.clear();

        let frame_length = sidecar.frame_length as usize;
        if frame_length > payload_len {
            return Err(DecodeError::InvalidData(format!(
                "secure frame of {} bytes in a payload of {} bytes",
                frame_length, payload_len
            )));
        }

        let mut clear = Vec::new();
        for nalu in &sidecar.nalus {
            let nal_type = NaluType::from_header_byte(nalu.nal_type);

            match nal_type {
                Some(t) if t.is_slice() => {
                    if nalu.header.is_empty() {
                        return Err(DecodeError::InvalidData(
                            "secure slice without clear header".into(),
                        ));
                    }
                    let (offset, length) = (nalu.offset as usize, nalu.length as usize);
                    if offset.saturating_add(length) > frame_length {
                        return Err(DecodeError::InvalidData(format!(
                            "secure slice at {}+{} exceeds frame of {} bytes",
                            offset, length, frame_length
                        )));
                    }

                    self.slices.push(ProtectedSlice {
                        header: nalu.header.clone(),
                        offset,
                        length,
                    });
                }
                Some(t) if t.is_header() => (),
                _ => {
                    warn!("dropping secure frame with NAL unit type {:#x}", nalu.nal_type);
                    self.clear();
                    return Ok(None);
                }
            }

            clear.extend_from_slice(&START_CODE);
            clear.extend_from_slice(&nalu.header);
        }

        if clear.is_empty() {
            return Err(DecodeError::InvalidData("empty secure frame".into()));
        }

        self.active = true;
        Ok(Some(clear))
    }

    /// Returns the next encrypted slice of the frame.
    pub fn next_slice(&mut self) -> DecodeResult<&ProtectedSlice> {
        let slice = self.slices.get(self.cursor).ok_or_else(|| {
            DecodeError::InvalidData("more slices parsed than described by the sidecar".into())
        })?;
        self.cursor += 1;

        Ok(slice)
    }

    pub fn clear(&mut self) {
        self.slices.clear();
        self.cursor = 0;
        self.active = false;
    }
}
