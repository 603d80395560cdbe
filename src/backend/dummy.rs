// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! Every call is recorded so tests can check what the decoder submitted, and a few knobs allow
//! tests to simulate a busy or failing device.

use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::anyhow;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::HwBackend;
use crate::backend::MacroblockError;
use crate::backend::Profile;
use crate::backend::RawImage;
use crate::backend::Reference;
use crate::backend::RenderCommand;
use crate::backend::RenderStatus;
use crate::Resolution;
use crate::SurfaceHandle;

/// First handle given to internally allocated surfaces.
pub(crate) const FIRST_SURFACE: SurfaceHandle = 0x100;

/// Owned copy of a call made to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CreateSurfaces(usize),
    CreateContext(Profile),
    Destroy,
    Begin(SurfaceHandle),
    PictureParameters(Vec<Reference>),
    IqMatrix,
    BitPlane,
    Probability,
    SliceParameters {
        ref_list0: Vec<SurfaceHandle>,
        ref_list1: Vec<SurfaceHandle>,
    },
    SliceData(Vec<u8>),
    ProtectedSliceData { header: Vec<u8>, data: Vec<u8> },
    End,
    Sync(SurfaceHandle),
}

/// Dummy backend that can be used for any codec.
#[derive(Default)]
pub(crate) struct Backend {
    pub calls: Vec<Call>,
    /// Surfaces for which rendering is reported as still in progress.
    pub pending: HashSet<SurfaceHandle>,
    /// Number of upcoming `end_picture` calls that will fail.
    pub failing_end_pictures: usize,
    /// Makes `create_surfaces` fail.
    pub out_of_memory: bool,
    /// Makes `read_back` fail.
    pub failing_read_back: bool,
    pub errors: HashMap<SurfaceHandle, Vec<MacroblockError>>,
    resolution: Resolution,
    surfaces: Vec<SurfaceHandle>,
    in_picture: Option<SurfaceHandle>,
}

impl Backend {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn surfaces(&self) -> &[SurfaceHandle] {
        &self.surfaces
    }

    /// Returns the surfaces passed to `begin_picture`, in call order.
    pub(crate) fn decoded_targets(&self) -> Vec<SurfaceHandle> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Begin(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    /// Byte used to fill the planes of `surface` on read back.
    pub(crate) fn fill_byte(surface: SurfaceHandle) -> u8 {
        (surface & 0xff) as u8
    }
}

impl HwBackend for Backend {
    fn create_surfaces(
        &mut self,
        resolution: Resolution,
        count: usize,
        external: &[SurfaceHandle],
    ) -> BackendResult<Vec<SurfaceHandle>> {
        if self.out_of_memory {
            return Err(BackendError::OutOfResources);
        }

        self.calls.push(Call::CreateSurfaces(count));
        self.resolution = resolution;
        let first = FIRST_SURFACE + self.surfaces.len() as u32;
        let created: Vec<_> = if external.is_empty() {
            (0..count as u32).map(|i| first + i).collect()
        } else {
            external.to_vec()
        };
        self.surfaces.extend_from_slice(&created);

        Ok(created)
    }

    fn create_context(
        &mut self,
        profile: Profile,
        _: Resolution,
        _: &[SurfaceHandle],
    ) -> BackendResult<()> {
        self.calls.push(Call::CreateContext(profile));
        Ok(())
    }

    fn destroy(&mut self) {
        self.calls.push(Call::Destroy);
        self.surfaces.clear();
        self.in_picture = None;
    }

    fn begin_picture(&mut self, target: SurfaceHandle) -> BackendResult<()> {
        if !self.surfaces.contains(&target) {
            return Err(anyhow!("unknown target surface {:#x}", target).into());
        }
        self.calls.push(Call::Begin(target));
        self.in_picture = Some(target);
        Ok(())
    }

    fn render(&mut self, command: RenderCommand) -> BackendResult<()> {
        if self.in_picture.is_none() {
            return Err(anyhow!("render called outside of a picture").into());
        }

        let call = match command {
            RenderCommand::PictureParameters { references, .. } => {
                Call::PictureParameters(references.to_vec())
            }
            RenderCommand::IqMatrix(_) => Call::IqMatrix,
            RenderCommand::BitPlane(_) => Call::BitPlane,
            RenderCommand::Probability(_) => Call::Probability,
            RenderCommand::SliceParameters {
                ref_list0,
                ref_list1,
                ..
            } => Call::SliceParameters {
                ref_list0: ref_list0.to_vec(),
                ref_list1: ref_list1.to_vec(),
            },
            RenderCommand::SliceData(data) => Call::SliceData(data.to_vec()),
            RenderCommand::ProtectedSliceData { header, data } => Call::ProtectedSliceData {
                header: header.to_vec(),
                data: data.to_vec(),
            },
        };
        self.calls.push(call);

        Ok(())
    }

    fn end_picture(&mut self) -> BackendResult<()> {
        if self.in_picture.take().is_none() {
            return Err(anyhow!("end_picture called outside of a picture").into());
        }
        if self.failing_end_pictures > 0 {
            self.failing_end_pictures -= 1;
            return Err(anyhow!("simulated device failure").into());
        }
        self.calls.push(Call::End);
        Ok(())
    }

    fn query_render_status(&mut self, surface: SurfaceHandle) -> BackendResult<RenderStatus> {
        Ok(if self.pending.contains(&surface) {
            RenderStatus::Pending
        } else {
            RenderStatus::Ready
        })
    }

    fn sync(&mut self, surface: SurfaceHandle) -> BackendResult<()> {
        self.calls.push(Call::Sync(surface));
        self.pending.remove(&surface);
        Ok(())
    }

    fn read_back(&mut self, surface: SurfaceHandle) -> BackendResult<RawImage> {
        if self.failing_read_back {
            return Err(anyhow!("cannot map surface {:#x}", surface).into());
        }

        // Padded NV12 layout: 16 extra bytes per line and 16 extra lines.
        let stride = self.resolution.width as usize + 16;
        let luma_lines = self.resolution.height as usize + 16;
        let chroma_lines = luma_lines / 2;

        Ok(RawImage {
            data: vec![Self::fill_byte(surface); stride * (luma_lines + chroma_lines)],
            strides: [stride, stride],
            offsets: [0, stride * luma_lines],
        })
    }

    fn query_errors(&mut self, surface: SurfaceHandle) -> BackendResult<Vec<MacroblockError>> {
        Ok(self.errors.get(&surface).cloned().unwrap_or_default())
    }
}
