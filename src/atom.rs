//! Struct-of-arrays atom storage
//!
//! An [`AtomSet`] keeps positions and velocities in two arenas. Each arena is
//! three axis blocks of `stride` slots laid out back to back (`x` block, then
//! `y`, then `z`), which is also the layout uploaded to device buffers.
//!
//! Inside a block the slots are ordered as
//! `[ghosts below | own atoms | ghosts above | unused]`, so own atoms live in
//! `[ghost_min, ghost_min + natoms)`.

use crate::domain::{Domain, SubDomain};
use crate::error::{SotlError, SotlResult};
use crate::params::{GHOST_FRACTION, round_up};

/// Read-only view of the three axis blocks of one arena
#[derive(Debug, Clone, Copy)]
pub struct Axes<'a> {
    pub x: &'a [f32],
    pub y: &'a [f32],
    pub z: &'a [f32],
}

impl<'a> Axes<'a> {
    /// View a whole arena of `stride` slots per axis
    pub fn from_arena(buf: &'a [f32], stride: usize) -> Self {
        let (x, rest) = buf.split_at(stride);
        let (y, z) = rest.split_at(stride);
        Self { x, y, z }
    }

    /// Coordinates of slot `i`
    #[inline]
    pub fn get(&self, i: usize) -> [f32; 3] {
        [self.x[i], self.y[i], self.z[i]]
    }
}

/// Mutable view of the three axis blocks of one arena
#[derive(Debug)]
pub struct AxesMut<'a> {
    pub x: &'a mut [f32],
    pub y: &'a mut [f32],
    pub z: &'a mut [f32],
}

impl<'a> AxesMut<'a> {
    pub fn from_arena(buf: &'a mut [f32], stride: usize) -> Self {
        let (x, rest) = buf.split_at_mut(stride);
        let (y, z) = rest.split_at_mut(stride);
        Self { x, y, z }
    }

    #[inline]
    pub fn get(&self, i: usize) -> [f32; 3] {
        [self.x[i], self.y[i], self.z[i]]
    }

    #[inline]
    pub fn set(&mut self, i: usize, v: [f32; 3]) {
        self.x[i] = v[0];
        self.y[i] = v[1];
        self.z[i] = v[2];
    }

    /// Reborrow as a read-only view
    pub fn as_axes(&self) -> Axes<'_> {
        Axes {
            x: self.x,
            y: self.y,
            z: self.z,
        }
    }
}

/// Positions and velocities of a set of atoms
#[derive(Debug, Clone, PartialEq)]
pub struct AtomSet {
    natoms: usize,
    current: usize,
    offset: usize,
    ghost_margin: usize,
    ghost_min: usize,
    ghost_max: usize,
    pos: Vec<f32>,
    vel: Vec<f32>,
}

fn alloc_arena(len: usize) -> SotlResult<Vec<f32>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0.0);
    Ok(buf)
}

impl AtomSet {
    /// Create an empty set declared for `natoms` atoms.
    ///
    /// `max_capacity` is rounded up to [`crate::params::ALIGN`]. When `multi`
    /// is set a ghost margin of 5% of `natoms` (rounded the same way) is
    /// reserved on each side.
    pub fn init(natoms: usize, max_capacity: usize, multi: bool) -> SotlResult<Self> {
        if max_capacity < natoms {
            return Err(SotlError::InvalidValue(format!(
                "capacity {max_capacity} is smaller than the requested {natoms} atoms"
            )));
        }
        let offset = round_up(max_capacity);
        let ghost_margin = if multi {
            round_up((natoms as f64 * GHOST_FRACTION) as usize)
        } else {
            0
        };
        let stride = offset + 2 * ghost_margin;
        Ok(Self {
            natoms,
            current: 0,
            offset,
            ghost_margin,
            ghost_min: 0,
            ghost_max: 0,
            pos: alloc_arena(3 * stride)?,
            vel: alloc_arena(3 * stride)?,
        })
    }

    /// Create a single back end set holding exactly `natoms` atoms
    pub fn new(natoms: usize) -> SotlResult<Self> {
        Self::init(natoms, natoms, false)
    }

    /// Copy the atoms of a sub-domain, and the ghosts around it, out of `self`.
    ///
    /// `self` must be the z-sorted parent the sub-domain was split from.
    pub fn view(&self, sub: &SubDomain) -> SotlResult<AtomSet> {
        let range = sub.range;
        let (gmin, gmax) = (sub.ghost_min, sub.ghost_max);
        if range.start < gmin || range.end() + gmax > self.natoms {
            return Err(SotlError::InvalidValue(format!(
                "view [{}, {}) with ghosts {gmin}/{gmax} exceeds the {} parent atoms",
                range.start,
                range.end(),
                self.natoms
            )));
        }

        let margin = round_up(self.ghost_margin.max(gmin).max(gmax));
        let offset = round_up(range.len);
        let stride = offset + 2 * margin;
        let mut set = Self {
            natoms: range.len,
            current: range.len,
            offset,
            ghost_margin: margin,
            ghost_min: gmin,
            ghost_max: gmax,
            pos: alloc_arena(3 * stride)?,
            vel: alloc_arena(3 * stride)?,
        };

        let src_begin = self.begin() + range.start - gmin;
        let count = gmin + range.len + gmax;
        for axis in 0..3 {
            let src = axis * self.stride() + src_begin;
            let dst = axis * stride;
            set.pos[dst..dst + count].copy_from_slice(&self.pos[src..src + count]);
            set.vel[dst..dst + count].copy_from_slice(&self.vel[src..src + count]);
        }
        Ok(set)
    }

    /// Logical number of own atoms
    pub fn natoms(&self) -> usize {
        self.natoms
    }

    /// Number of atoms added so far
    pub fn current(&self) -> usize {
        self.current
    }

    /// Allocated own-atom capacity (aligned)
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Slots reserved for ghosts on each side
    pub fn ghost_margin(&self) -> usize {
        self.ghost_margin
    }

    pub fn ghost_min(&self) -> usize {
        self.ghost_min
    }

    pub fn ghost_max(&self) -> usize {
        self.ghost_max
    }

    /// Slots per axis block
    pub fn stride(&self) -> usize {
        self.offset + 2 * self.ghost_margin
    }

    /// First own slot
    pub fn begin(&self) -> usize {
        self.ghost_min
    }

    /// One past the last own slot
    pub fn end(&self) -> usize {
        self.ghost_min + self.natoms
    }

    /// One past the last slot holding an atom (own or ghost)
    pub fn active_end(&self) -> usize {
        self.end() + self.ghost_max
    }

    /// Every atom has been added
    pub fn is_full(&self) -> bool {
        self.current == self.natoms
    }

    /// Bytes of one arena (positions or velocities), all three axes
    pub fn position_buffer_bytes(&self) -> usize {
        std::mem::size_of::<f32>() * self.stride() * 3
    }

    /// Bytes of the ghost margin on one side, all three axes
    pub fn border_bytes(&self) -> usize {
        std::mem::size_of::<f32>() * self.ghost_margin * 3
    }

    /// Append one atom
    pub fn add(&mut self, pos: [f32; 3], vel: [f32; 3]) -> SotlResult<()> {
        if self.current >= self.natoms {
            return Err(SotlError::BufferFull {
                capacity: self.natoms,
            });
        }
        let i = self.begin() + self.current;
        self.set_position(i, pos);
        self.set_velocity(i, vel);
        self.current += 1;
        Ok(())
    }

    /// Position of slot `i`
    pub fn position(&self, i: usize) -> [f32; 3] {
        self.positions().get(i)
    }

    /// Velocity of slot `i`
    pub fn velocity(&self, i: usize) -> [f32; 3] {
        self.velocities().get(i)
    }

    pub fn set_position(&mut self, i: usize, p: [f32; 3]) {
        self.positions_mut().set(i, p);
    }

    pub fn set_velocity(&mut self, i: usize, v: [f32; 3]) {
        self.velocities_mut().set(i, v);
    }

    pub fn positions(&self) -> Axes<'_> {
        Axes::from_arena(&self.pos, self.stride())
    }

    pub fn velocities(&self) -> Axes<'_> {
        Axes::from_arena(&self.vel, self.stride())
    }

    pub fn positions_mut(&mut self) -> AxesMut<'_> {
        let stride = self.stride();
        AxesMut::from_arena(&mut self.pos, stride)
    }

    pub fn velocities_mut(&mut self) -> AxesMut<'_> {
        let stride = self.stride();
        AxesMut::from_arena(&mut self.vel, stride)
    }

    /// Positions and velocities borrowed together
    pub fn split_mut(&mut self) -> (AxesMut<'_>, AxesMut<'_>) {
        let stride = self.stride();
        (
            AxesMut::from_arena(&mut self.pos, stride),
            AxesMut::from_arena(&mut self.vel, stride),
        )
    }

    /// Whole position arena, in upload layout
    pub fn position_arena(&self) -> &[f32] {
        &self.pos
    }

    /// Whole velocity arena, in upload layout
    pub fn velocity_arena(&self) -> &[f32] {
        &self.vel
    }

    pub fn position_arena_mut(&mut self) -> &mut [f32] {
        &mut self.pos
    }

    pub fn velocity_arena_mut(&mut self) -> &mut [f32] {
        &mut self.vel
    }

    /// Exchange the position arena with a same-sized back buffer
    pub fn swap_positions(&mut self, back: &mut Vec<f32>) {
        debug_assert_eq!(back.len(), self.pos.len());
        std::mem::swap(&mut self.pos, back);
    }

    /// Exchange the velocity arena with a same-sized back buffer
    pub fn swap_velocities(&mut self, back: &mut Vec<f32>) {
        debug_assert_eq!(back.len(), self.vel.len());
        std::mem::swap(&mut self.vel, back);
    }

    fn swap_atoms(&mut self, a: usize, b: usize) {
        let stride = self.stride();
        for axis in 0..3 {
            self.pos.swap(axis * stride + a, axis * stride + b);
            self.vel.swap(axis * stride + a, axis * stride + b);
        }
    }

    fn z(&self, i: usize) -> f32 {
        self.pos[2 * self.stride() + i]
    }

    fn sift_down(&mut self, base: usize, start: usize, end: usize) {
        let mut root = start;
        while 2 * root + 1 <= end {
            let mut child = 2 * root + 1;
            if child < end && self.z(base + child) < self.z(base + child + 1) {
                child += 1;
            }
            if self.z(base + root) < self.z(base + child) {
                self.swap_atoms(base + root, base + child);
                root = child;
            } else {
                return;
            }
        }
    }

    /// Heap-sort own atoms by increasing z, moving velocities along
    pub fn sort_by_z(&mut self) {
        let n = self.natoms;
        if n < 2 {
            return;
        }
        let base = self.begin();
        for start in (0..n / 2).rev() {
            self.sift_down(base, start, n - 1);
        }
        for end in (1..n).rev() {
            self.swap_atoms(base, base + end);
            self.sift_down(base, 0, end - 1);
        }
    }

    /// Box holding point `(x, y, z)` of `domain`.
    ///
    /// # Panics
    ///
    /// Panics when the point is not finite or lies outside the padded grid.
    /// Step engines go through [`AtomSet::try_box_id_of`] instead.
    pub fn box_id_of(domain: &Domain, x: f32, y: f32, z: f32) -> usize {
        match domain.box_of(x, y, z) {
            Some(id) => id,
            None => panic!("atom at {}", off_grid(domain, x, y, z)),
        }
    }

    /// Box holding point `(x, y, z)`, failing with
    /// [`SotlError::OutsideGrid`] when the atom escaped the padded grid
    pub fn try_box_id_of(domain: &Domain, x: f32, y: f32, z: f32) -> SotlResult<usize> {
        domain
            .box_of(x, y, z)
            .ok_or_else(|| SotlError::OutsideGrid(off_grid(domain, x, y, z)))
    }

    /// Number of own atoms in every box of `domain`
    pub fn count_per_box(&self, domain: &Domain) -> SotlResult<Vec<u32>> {
        let mut counts = vec![0u32; domain.total_boxes()];
        let pos = self.positions();
        for i in self.begin()..self.end() {
            let [x, y, z] = pos.get(i);
            counts[Self::try_box_id_of(domain, x, y, z)?] += 1;
        }
        Ok(counts)
    }
}

fn off_grid(domain: &Domain, x: f32, y: f32, z: f32) -> String {
    let [bx, by, bz] = domain.box_coords(x, y, z);
    let [nx, ny, nz] = domain.boxes();
    format!("({x}, {y}, {z}) maps to box ({bx}, {by}, {bz}) outside the {nx}x{ny}x{nz} grid")
}
