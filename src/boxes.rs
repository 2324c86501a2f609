//! Box pass: bucket atoms by grid box
//!
//! The pass runs in four steps on the host engines, mirroring the compute
//! passes of the kernel-dispatch engine:
//!
//! 1. reset the per-box counters
//! 2. count own atoms per box
//! 3. exclusive prefix sum of the counts (box write offsets)
//! 4. scatter atoms into a second arena ordered by box
//!
//! After the scatter, the atoms of box `b` occupy slots
//! `begin + offsets[b] .. begin + offsets[b] + counts[b]`.

use std::ops::Range;

use crate::atom::{AtomSet, AxesMut};
use crate::domain::Domain;
use crate::error::SotlResult;

/// Exclusive prefix sum of `counts` into `offsets`, returning the total.
///
/// `offsets` must be at least one longer than `counts`; the slot after the
/// last box receives the total.
pub fn exclusive_scan(counts: &[u32], offsets: &mut [u32]) -> u32 {
    let mut acc = 0u32;
    for (slot, &count) in offsets.iter_mut().zip(counts) {
        *slot = acc;
        acc += count;
    }
    offsets[counts.len()] = acc;
    acc
}

/// Box id of every own atom of `atoms`, in slot order
pub fn box_ids(atoms: &AtomSet, domain: &Domain) -> SotlResult<Vec<u32>> {
    let pos = atoms.positions();
    (atoms.begin()..atoms.end())
        .map(|i| {
            let [x, y, z] = pos.get(i);
            AtomSet::try_box_id_of(domain, x, y, z).map(|id| id as u32)
        })
        .collect()
}

/// Per-box counts and offsets for one domain
#[derive(Debug, Clone)]
pub struct BoxIndex {
    counts: Vec<u32>,
    offsets: Vec<u32>,
    cursor: Vec<u32>,
    sorted_boxes: Vec<u32>,
    total_boxes: usize,
    base: usize,
}

impl BoxIndex {
    /// Allocate buffers for `domain`
    pub fn new(domain: &Domain) -> SotlResult<Self> {
        let len = domain.box_buffer_len();
        let mut counts = Vec::new();
        counts.try_reserve_exact(len)?;
        counts.resize(len, 0);
        Ok(Self {
            offsets: counts.clone(),
            cursor: counts.clone(),
            counts,
            sorted_boxes: Vec::new(),
            total_boxes: domain.total_boxes(),
            base: 0,
        })
    }

    /// Zero every counter
    pub fn reset(&mut self) {
        self.counts.fill(0);
    }

    /// Histogram precomputed box ids into the counters
    pub fn count(&mut self, ids: &[u32]) {
        for &id in ids {
            self.counts[id as usize] += 1;
        }
    }

    /// Replace the counters with an externally reduced histogram
    pub fn load_counts(&mut self, counts: &[u32]) {
        self.counts[..counts.len()].copy_from_slice(counts);
        self.counts[counts.len()..].fill(0);
    }

    /// Compute box write offsets from the counters
    pub fn scan(&mut self) -> u32 {
        exclusive_scan(&self.counts[..self.total_boxes], &mut self.offsets)
    }

    /// Scatter own atoms of `atoms` into `back_pos`/`back_vel` grouped by box.
    ///
    /// Ghost slots are copied unchanged. `ids` must be the box ids the
    /// counters were built from.
    pub fn scatter(
        &mut self,
        ids: &[u32],
        atoms: &AtomSet,
        back_pos: &mut [f32],
        back_vel: &mut [f32],
    ) {
        let stride = atoms.stride();
        let base = atoms.begin();
        self.base = base;
        self.cursor.copy_from_slice(&self.offsets);
        self.sorted_boxes.clear();
        self.sorted_boxes.resize(ids.len(), 0);

        let pos = atoms.positions();
        let vel = atoms.velocities();
        let mut dst_pos = AxesMut::from_arena(back_pos, stride);
        let mut dst_vel = AxesMut::from_arena(back_vel, stride);

        for (k, &id) in ids.iter().enumerate() {
            let slot = self.cursor[id as usize];
            self.cursor[id as usize] += 1;
            let src = base + k;
            let dst = base + slot as usize;
            dst_pos.set(dst, pos.get(src));
            dst_vel.set(dst, vel.get(src));
            self.sorted_boxes[slot as usize] = id;
        }

        for ghost in (0..atoms.begin()).chain(atoms.end()..atoms.active_end()) {
            dst_pos.set(ghost, pos.get(ghost));
            dst_vel.set(ghost, vel.get(ghost));
        }
    }

    /// Box of a slot in the sorted arena
    pub fn box_of_slot(&self, slot: usize) -> usize {
        self.sorted_boxes[slot - self.base] as usize
    }

    /// Slots of one box in the sorted arena
    pub fn box_slots(&self, id: usize) -> Range<usize> {
        let start = self.base + self.offsets[id] as usize;
        start..start + self.counts[id] as usize
    }

    /// Visit the slot ranges of `id` and of its in-grid neighbours
    pub fn for_each_neighbor(&self, domain: &Domain, id: usize, mut f: impl FnMut(Range<usize>)) {
        let [nx, ny, nz] = domain.boxes();
        let plane = nx * ny;
        let (bz, rest) = (id / plane, id % plane);
        let (by, bx) = (rest / nx, rest % nx);
        for z in bz.saturating_sub(1)..=(bz + 1).min(nz - 1) {
            for y in by.saturating_sub(1)..=(by + 1).min(ny - 1) {
                for x in bx.saturating_sub(1)..=(bx + 1).min(nx - 1) {
                    f(self.box_slots(x + y * nx + z * plane));
                }
            }
        }
    }

    /// Counters of the last pass, one per box
    pub fn counts(&self) -> &[u32] {
        &self.counts[..self.total_boxes]
    }

    /// Offsets of the last scan, one per box plus the total
    pub fn offsets(&self) -> &[u32] {
        &self.offsets[..=self.total_boxes]
    }
}
