// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded picture buffer bookkeeping for codecs that identify references by picture order
//! count.
//!
//! Two tables are kept: the active one describes the references of the last picture, and the
//! other is rebuilt for each new picture from the references its parameters declare. Slots in
//! the active table are pinned in the [`SurfacePool`] so they are not reused while they can
//! still be referenced.

use log::debug;
use log::warn;

use crate::codec::avc::PictureRef;
use crate::codec::avc::MAX_DPB_FRAMES;
use crate::decoder::surface_pool::SlotIndex;
use crate::decoder::surface_pool::SurfacePool;
use crate::decoder::surface_pool::POC_INVALID;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;

/// Reference frames plus the picture being decoded.
const DPB_ENTRIES: usize = MAX_DPB_FRAMES + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpbEntry {
    pub poc: i32,
    pub slot: Option<SlotIndex>,
}

impl Default for DpbEntry {
    fn default() -> Self {
        Self {
            poc: POC_INVALID,
            slot: None,
        }
    }
}

impl DpbEntry {
    fn is_valid(&self) -> bool {
        self.poc != POC_INVALID && self.slot.is_some()
    }
}

#[derive(Debug, Default)]
pub struct Dpb {
    tables: [[DpbEntry; DPB_ENTRIES]; 2],
    active: usize,
}

impl Dpb {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the valid entries of the active table.
    pub fn entries(&self) -> impl Iterator<Item = &DpbEntry> {
        self.tables[self.active].iter().filter(|e| e.is_valid())
    }

    /// Returns the slot of the latest entry of the active table holding either field of
    /// `picture`.
    pub fn find(&self, picture: &PictureRef) -> Option<SlotIndex> {
        Self::find_in(&self.tables[self.active], picture)
    }

    fn find_in(table: &[DpbEntry], picture: &PictureRef) -> Option<SlotIndex> {
        // Both fields of a frame share the same slot, so the latest match is the right one.
        table
            .iter()
            .rev()
            .filter(|e| e.is_valid())
            .find(|e| picture.matches_poc(e.poc))
            .and_then(|e| e.slot)
    }

    fn pin(table: &[DpbEntry], pool: &mut SurfacePool, pinned: bool) {
        for slot in table.iter().filter_map(|e| e.slot) {
            pool.set_as_reference(slot, pinned);
        }
    }

    /// Rebuilds the DPB for the picture being decoded into `current_slot`.
    ///
    /// Every valid entry of `references` is looked up in the active table. References that
    /// cannot be found are substituted by the current picture if the POC matches it, or by
    /// `last_reference`, and recorded in the error report of the current slot. If no substitute
    /// exists, the active table is left untouched and [`DecodeError::NoReference`] is returned.
    pub fn update(
        &mut self,
        pool: &mut SurfacePool,
        current: &PictureRef,
        references: &[PictureRef],
        current_slot: SlotIndex,
        last_reference: Option<SlotIndex>,
    ) -> DecodeResult<()> {
        let active = self.active;
        let next = active ^ 1;

        Self::pin(&self.tables[active], pool, false);

        let mut table = [DpbEntry::default(); DPB_ENTRIES];
        let mut len = 0;

        for reference in references.iter().filter(|r| !r.invalid) {
            if len >= MAX_DPB_FRAMES {
                warn!("more than {} references declared, ignoring the rest", MAX_DPB_FRAMES);
                break;
            }

            let poc = reference.poc();
            let slot = match Self::find_in(&self.tables[active], reference) {
                Some(slot) => slot,
                None => {
                    pool.slot_mut(current_slot).errors.record_missing_reference();

                    if current.matches_poc(poc) {
                        current_slot
                    } else if let Some(last) = last_reference {
                        warn!("reference with POC {} not found, using last reference", poc);
                        last
                    } else {
                        Self::pin(&self.tables[active], pool, true);
                        warn!("reference with POC {} not found and no substitute", poc);
                        return Err(DecodeError::NoReference);
                    }
                }
            };

            table[len] = DpbEntry {
                poc,
                slot: Some(slot),
            };
            len += 1;
        }

        if current.is_reference() && len < DPB_ENTRIES {
            table[len] = DpbEntry {
                poc: current.poc(),
                slot: Some(current_slot),
            };
        }

        // The new table owns the pins from now on.
        Self::pin(&table, pool, true);
        self.tables[active] = Default::default();
        self.tables[next] = table;
        self.active = next;

        Ok(())
    }

    /// Removes the entry of `slot` holding `poc`, e.g. after a picture failed to decode.
    pub fn remove(&mut self, pool: &mut SurfacePool, poc: i32, slot: SlotIndex) {
        let table = &mut self.tables[self.active];
        if let Some(entry) = table
            .iter_mut()
            .find(|e| e.poc == poc && e.slot == Some(slot))
        {
            debug!("removing POC {} from the DPB", poc);
            *entry = Default::default();
            if !table.iter().any(|e| e.slot == Some(slot)) {
                pool.set_as_reference(slot, false);
            }
        }
    }

    /// Drops every reference.
    pub fn invalidate(&mut self, pool: &mut SurfacePool) {
        for table in &self.tables {
            Self::pin(table, pool, false);
        }
        self.tables = Default::default();
        self.active = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::Backend;
    use crate::backend::HwBackend;
    use crate::Resolution;

    fn pool(count: usize) -> (SurfacePool, Backend) {
        let mut backend = Backend::new();
        let surfaces = backend
            .create_surfaces(Resolution::from((64, 64)), count, &[])
            .unwrap();
        let mut pool = SurfacePool::new();
        pool.initialize(&surfaces, false);
        (pool, backend)
    }

    fn frame(poc: i32) -> PictureRef {
        PictureRef {
            top_field_order_cnt: poc,
            bottom_field_order_cnt: poc,
            short_term_reference: true,
            ..Default::default()
        }
    }

    /// Decodes `current` into a freshly acquired slot and completes it.
    fn decode(
        dpb: &mut Dpb,
        pool: &mut SurfacePool,
        backend: &mut Backend,
        current: PictureRef,
        refs: &[PictureRef],
    ) -> DecodeResult<SlotIndex> {
        let slot = pool.acquire(backend)?;
        if let Err(e) = dpb.update(pool, &current, refs, slot, None) {
            pool.release();
            return Err(e);
        }
        pool.finish_acquired(false);
        Ok(slot)
    }

    #[test]
    fn only_active_references_are_pinned() {
        let (mut pool, mut backend) = pool(4);
        let mut dpb = Dpb::new();

        let i0 = decode(&mut dpb, &mut pool, &mut backend, frame(0), &[]).unwrap();
        let p4 = decode(&mut dpb, &mut pool, &mut backend, frame(4), &[frame(0)]).unwrap();
        assert!(pool.slot(i0).as_reference);
        assert!(pool.slot(p4).as_reference);

        // P8 only references P4, so I0 can be reused.
        let p8 = decode(&mut dpb, &mut pool, &mut backend, frame(8), &[frame(4)]).unwrap();
        assert!(!pool.slot(i0).as_reference);
        assert!(pool.slot(p4).as_reference);
        assert!(pool.slot(p8).as_reference);

        let pinned: Vec<_> = (0..pool.len())
            .filter(|i| pool.slot(*i).as_reference)
            .collect();
        let active: Vec<_> = dpb.entries().filter_map(|e| e.slot).collect();
        assert_eq!(pinned, active);
    }

    #[test]
    fn missing_reference_without_substitute() {
        let (mut pool, mut backend) = pool(4);
        let mut dpb = Dpb::new();

        let i0 = decode(&mut dpb, &mut pool, &mut backend, frame(0), &[]).unwrap();
        let result = decode(&mut dpb, &mut pool, &mut backend, frame(8), &[frame(4)]);

        assert!(matches!(result, Err(DecodeError::NoReference)));
        // The previous table is still in place.
        assert!(pool.slot(i0).as_reference);
        assert_eq!(dpb.find(&frame(0)), Some(i0));
        // The failed slot can be acquired again.
        assert_eq!(pool.acquire(&mut backend).unwrap(), 1);
    }

    #[test]
    fn missing_reference_uses_last_reference() {
        let (mut pool, mut backend) = pool(4);
        let mut dpb = Dpb::new();

        let i0 = decode(&mut dpb, &mut pool, &mut backend, frame(0), &[]).unwrap();
        let slot = pool.acquire(&mut backend).unwrap();
        dpb.update(&mut pool, &frame(8), &[frame(4)], slot, Some(i0))
            .unwrap();

        assert_eq!(dpb.find(&frame(4)), Some(i0));
        assert!(pool.slot(slot).errors.has_missing_reference());
    }

    #[test]
    fn field_pair_resolves_to_latest_entry() {
        let (mut pool, mut backend) = pool(4);
        let mut dpb = Dpb::new();

        // Both fields of the frame share a slot and end up in the DPB with their own POC.
        let top = PictureRef {
            top_field_order_cnt: 0,
            bottom_field_order_cnt: 1,
            top_field: true,
            short_term_reference: true,
            ..Default::default()
        };
        let bottom = PictureRef {
            bottom_field: true,
            top_field: false,
            ..top
        };
        let slot = pool.acquire(&mut backend).unwrap();
        dpb.update(&mut pool, &top, &[], slot, None).unwrap();
        dpb.update(&mut pool, &bottom, &[top], slot, None).unwrap();
        pool.finish_acquired(false);

        let p = decode(&mut dpb, &mut pool, &mut backend, frame(4), &[top, bottom]).unwrap();
        assert_eq!(dpb.find(&top), Some(slot));
        assert_eq!(dpb.find(&bottom), Some(slot));
        assert_eq!(dpb.find(&frame(4)), Some(p));
    }

    #[test]
    fn reference_to_current_picture() {
        let (mut pool, mut backend) = pool(2);
        let mut dpb = Dpb::new();

        // Second field referencing the first one, which is not in the DPB yet.
        let current = PictureRef {
            top_field_order_cnt: 2,
            bottom_field_order_cnt: 3,
            bottom_field: true,
            short_term_reference: true,
            ..Default::default()
        };
        let first_field = PictureRef {
            bottom_field: false,
            top_field: true,
            ..current
        };
        let slot = pool.acquire(&mut backend).unwrap();
        dpb.update(&mut pool, &current, &[first_field], slot, None)
            .unwrap();

        assert_eq!(dpb.find(&first_field), Some(slot));
    }

    #[test]
    fn remove_and_invalidate() {
        let (mut pool, mut backend) = pool(4);
        let mut dpb = Dpb::new();

        let i0 = decode(&mut dpb, &mut pool, &mut backend, frame(0), &[]).unwrap();
        let p4 = decode(&mut dpb, &mut pool, &mut backend, frame(4), &[frame(0)]).unwrap();

        dpb.remove(&mut pool, 4, p4);
        assert!(!pool.slot(p4).as_reference);
        assert_eq!(dpb.find(&frame(4)), None);

        dpb.invalidate(&mut pool);
        assert!(!pool.slot(i0).as_reference);
        assert!(dpb.is_empty());
    }
}
