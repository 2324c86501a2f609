//! Simulation box geometry and its uniform box grid
//!
//! The grid is built so that every neighbour of an atom within the cutoff
//! radius sits in the atom's own box or one of the 26 around it. One extra
//! layer of boxes surrounds the interior on every side to host ghost atoms.

use tracing::debug;

use crate::atom::AtomSet;
use crate::error::{SotlError, SotlResult};
use crate::params::{ATOM_RADIUS, SCAN_WG_SIZE, SUBCELL, align_up};

/// Contiguous run of atoms inside a parent arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtomRange {
    pub start: usize,
    pub len: usize,
}

impl AtomRange {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Axis-aligned simulation box with its grid
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    requested_min: [f32; 3],
    requested_max: [f32; 3],
    min_ext: [f32; 3],
    max_ext: [f32; 3],
    min_border: [f32; 3],
    max_border: [f32; 3],
    boxes: [usize; 3],
    total_boxes: usize,
    box_size: f64,
    inv_box_size: f32,
}

/// One slab of a split domain
#[derive(Debug, Clone, PartialEq)]
pub struct SubDomain {
    /// Position of the slab along z, from the bottom
    pub index: usize,
    /// Geometry restricted to the slab
    pub domain: Domain,
    /// Own atoms inside the parent's z-sorted arena
    pub range: AtomRange,
    /// Atoms of the plane just below the slab
    pub ghost_min: usize,
    /// Atoms of the plane just above the slab
    pub ghost_max: usize,
}

impl Domain {
    /// Build the grid for the box `[min, max]` with boxes sized by `cutoff`
    pub fn init(min: [f32; 3], max: [f32; 3], cutoff: f64) -> SotlResult<Self> {
        if !(cutoff.is_finite() && cutoff > 0.0) {
            return Err(SotlError::InvalidValue(format!(
                "cutoff radius must be positive, got {cutoff}"
            )));
        }
        for axis in 0..3 {
            if !(min[axis].is_finite() && max[axis].is_finite()) || max[axis] <= min[axis] {
                return Err(SotlError::InvalidValue(format!(
                    "domain bounds on axis {} are empty: [{}, {}]",
                    "xyz".as_bytes()[axis] as char,
                    min[axis],
                    max[axis]
                )));
            }
        }

        let box_size = cutoff / SUBCELL as f64;
        let mut dom = Self {
            requested_min: min,
            requested_max: max,
            min_ext: [0.0; 3],
            max_ext: [0.0; 3],
            min_border: [0.0; 3],
            max_border: [0.0; 3],
            boxes: [0; 3],
            total_boxes: 1,
            box_size,
            inv_box_size: (1.0 / box_size) as f32,
        };

        for axis in 0..3 {
            let lo = min[axis] - ATOM_RADIUS;
            let hi = max[axis] + ATOM_RADIUS;
            let interior = ((hi as f64 - lo as f64) / box_size).ceil() as usize;
            dom.min_ext[axis] = lo;
            dom.max_ext[axis] = dom.plane_height(lo, interior);
            dom.boxes[axis] = interior + 2 * SUBCELL;
            dom.total_boxes *= dom.boxes[axis];
        }
        dom.refresh_borders();

        debug!(
            boxes = ?dom.boxes,
            total = dom.total_boxes,
            box_size = dom.box_size,
            "domain grid built"
        );
        Ok(dom)
    }

    fn plane_height(&self, base: f32, planes: usize) -> f32 {
        (base as f64 + planes as f64 * self.box_size) as f32
    }

    fn refresh_borders(&mut self) {
        let pad = self.box_size * SUBCELL as f64;
        for axis in 0..3 {
            self.min_border[axis] = (self.min_ext[axis] as f64 - pad) as f32;
            self.max_border[axis] = (self.max_ext[axis] as f64 + pad) as f32;
        }
    }

    /// Bounds as given to [`Domain::init`]
    pub fn requested_min(&self) -> [f32; 3] {
        self.requested_min
    }

    pub fn requested_max(&self) -> [f32; 3] {
        self.requested_max
    }

    /// Lower corner of the interior (bounds padded by the atom radius)
    pub fn min_ext(&self) -> [f32; 3] {
        self.min_ext
    }

    /// Upper corner of the interior, snapped to a whole number of boxes
    pub fn max_ext(&self) -> [f32; 3] {
        self.max_ext
    }

    /// Lower corner of the padded grid
    pub fn min_border(&self) -> [f32; 3] {
        self.min_border
    }

    /// Upper corner of the padded grid
    pub fn max_border(&self) -> [f32; 3] {
        self.max_border
    }

    /// Boxes per axis, padding included
    pub fn boxes(&self) -> [usize; 3] {
        self.boxes
    }

    pub fn total_boxes(&self) -> usize {
        self.total_boxes
    }

    pub fn box_size(&self) -> f32 {
        self.box_size as f32
    }

    pub fn inv_box_size(&self) -> f32 {
        self.inv_box_size
    }

    /// Boxes in one z plane
    pub fn plane_boxes(&self) -> usize {
        self.boxes[0] * self.boxes[1]
    }

    /// Slots of a box count/offset buffer: one per box plus the total,
    /// padded for the scan workgroups
    pub fn box_buffer_len(&self) -> usize {
        align_up(self.total_boxes + 1, 2 * SCAN_WG_SIZE)
    }

    /// Unclamped grid coordinates of a point
    #[inline]
    pub fn box_coords(&self, x: f32, y: f32, z: f32) -> [i64; 3] {
        let inv = self.inv_box_size;
        [
            ((x - self.min_border[0]) * inv).floor() as i64,
            ((y - self.min_border[1]) * inv).floor() as i64,
            ((z - self.min_border[2]) * inv).floor() as i64,
        ]
    }

    /// Box holding `(x, y, z)`, or `None` when the point is not finite or
    /// lies outside the padded grid
    #[inline]
    pub fn box_of(&self, x: f32, y: f32, z: f32) -> Option<usize> {
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return None;
        }
        let [bx, by, bz] = self.box_coords(x, y, z);
        let [nx, ny, nz] = self.boxes;
        let inside = (0..nx as i64).contains(&bx)
            && (0..ny as i64).contains(&by)
            && (0..nz as i64).contains(&bz);
        inside.then(|| bx as usize + by as usize * nx + bz as usize * nx * ny)
    }

    /// Own atoms of `atoms` in every z plane of the grid
    pub fn z_plane_counts(&self, atoms: &AtomSet) -> SotlResult<Vec<u32>> {
        Ok(Self::planes_from_boxes(
            &atoms.count_per_box(self)?,
            self.plane_boxes(),
        ))
    }

    /// Fold a per-box histogram into per-plane totals
    pub fn planes_from_boxes(counts: &[u32], plane_boxes: usize) -> Vec<u32> {
        counts
            .chunks(plane_boxes)
            .map(|plane| plane.iter().sum())
            .collect()
    }

    fn find_z_cuts(&self, z_planes: &[u32], natoms: usize, n: usize) -> Vec<usize> {
        let per_domain = (natoms / n) as u64;
        let mut cuts = Vec::with_capacity(n - 1);
        let mut acc = 0u64;
        for (z, &count) in z_planes.iter().enumerate() {
            acc += count as u64;
            if acc < per_domain {
                continue;
            }
            cuts.push(z + 1);
            acc = 0;
            if cuts.len() == n - 1 {
                break;
            }
        }
        // Not enough planes to honour every cut: trailing slabs stay empty
        cuts.resize(n - 1, self.boxes[2] - 1);
        cuts
    }

    /// Split the domain into `n` z slabs balanced by atom count.
    ///
    /// `atoms` must be sorted by z so that every slab is a contiguous range.
    pub fn split(&self, atoms: &AtomSet, n: usize) -> SotlResult<Vec<SubDomain>> {
        let natoms = atoms.natoms();
        if n == 0 || n > natoms.max(1) {
            return Err(SotlError::InvalidValue(format!(
                "cannot split {natoms} atoms into {n} sub-domains"
            )));
        }
        if n == 1 {
            return Ok(vec![SubDomain {
                index: 0,
                domain: self.clone(),
                range: AtomRange::new(0, natoms),
                ghost_min: 0,
                ghost_max: 0,
            }]);
        }

        let z_planes = self.z_plane_counts(atoms)?;
        for (z, count) in z_planes.iter().enumerate() {
            debug!(z, count, "atoms per z plane");
        }
        let cuts = self.find_z_cuts(&z_planes, natoms, n);
        debug!(?cuts, "z cuts");

        let top = self.boxes[2] - 1;
        let mut subs = Vec::with_capacity(n);
        let mut start = 0usize;
        for i in 0..n {
            // first and last interior planes owned, in parent plane indices
            let lo = if i == 0 { SUBCELL } else { cuts[i - 1] };
            let hi = if i == n - 1 { top - SUBCELL } else { cuts[i] - 1 };
            let planes = (hi + 1).saturating_sub(lo);

            // the bottom slab also owns the (empty) lower padding plane
            let first = if i == 0 { 0 } else { lo };
            let len = if i == n - 1 {
                natoms - start
            } else if hi < first {
                0
            } else {
                z_planes[first..=hi].iter().map(|&c| c as usize).sum()
            };

            let mut domain = self.clone();
            domain.min_ext[2] = self.plane_height(self.min_ext[2], lo - SUBCELL);
            domain.max_ext[2] = self.plane_height(self.min_ext[2], lo - SUBCELL + planes);
            domain.boxes[2] = planes + 2 * SUBCELL;
            domain.total_boxes = domain.boxes.iter().product();
            domain.refresh_borders();

            let ghost_min = if i == 0 { 0 } else { z_planes[lo - 1] as usize };
            let ghost_max = if i == n - 1 { 0 } else { z_planes[hi + 1] as usize };

            debug!(
                index = i,
                start,
                len,
                ghost_min,
                ghost_max,
                z_min = domain.min_ext[2],
                z_max = domain.max_ext[2],
                "sub-domain"
            );
            subs.push(SubDomain {
                index: i,
                domain,
                range: AtomRange::new(start, len),
                ghost_min,
                ghost_max,
            });
            start += len;
        }
        Ok(subs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::DEFAULT_LJ_CUTOFF;

    fn filled(points: &[[f32; 3]]) -> AtomSet {
        let mut set = AtomSet::new(points.len()).unwrap();
        for p in points {
            set.add(*p, [0.0; 3]).unwrap();
        }
        set
    }

    fn column(n: usize, height: f32) -> AtomSet {
        let points: Vec<[f32; 3]> = (0..n)
            .map(|i| [0.5, 0.5, height * i as f32 / n as f32])
            .collect();
        let mut set = filled(&points);
        set.sort_by_z();
        set
    }

    #[test]
    fn init_rejects_empty_bounds() {
        let err = Domain::init([0.0, 0.0, 0.0], [1.0, 0.0, 1.0], 0.6).unwrap_err();
        assert_eq!(err.code(), -30);
        assert!(Domain::init([0.0; 3], [1.0; 3], 0.0).is_err());
    }

    #[test]
    fn grid_covers_and_pads_the_box() {
        for (min, max) in [
            ([0.0f32; 3], [1.0f32; 3]),
            ([-3.0, 2.0, 0.5], [7.25, 2.1, 9.0]),
            ([0.0; 3], [0.01, 100.0, 0.3]),
        ] {
            let d = Domain::init(min, max, DEFAULT_LJ_CUTOFF).unwrap();
            for axis in 0..3 {
                let span = max[axis] - min[axis];
                assert!(d.boxes()[axis] as f32 * d.box_size() >= span);
                assert!(d.boxes()[axis] >= 2 * SUBCELL + 1);
                assert!(d.min_ext()[axis] <= min[axis] - ATOM_RADIUS + 1e-6);
                assert!(d.max_ext()[axis] >= max[axis] + ATOM_RADIUS - 1e-5);
                assert!(d.min_border()[axis] < d.min_ext()[axis]);
                assert!(d.max_border()[axis] > d.max_ext()[axis]);
            }
            assert_eq!(d.total_boxes(), d.boxes().iter().product::<usize>());
        }
    }

    #[test]
    fn box_buffer_is_padded_for_scan() {
        let d = Domain::init([0.0; 3], [2.0; 3], 0.6).unwrap();
        assert_eq!(d.box_buffer_len() % (2 * SCAN_WG_SIZE), 0);
        assert!(d.box_buffer_len() > d.total_boxes());
    }

    #[test]
    fn split_one_returns_the_parent() {
        let atoms = column(10, 3.0);
        let d = Domain::init([0.0; 3], [1.0, 1.0, 3.0], 0.6).unwrap();
        let subs = d.split(&atoms, 1).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].domain, d);
        assert_eq!(subs[0].range, AtomRange::new(0, 10));
    }

    #[test]
    fn split_rejects_bad_counts() {
        let atoms = column(3, 3.0);
        let d = Domain::init([0.0; 3], [1.0, 1.0, 3.0], 0.6).unwrap();
        assert!(d.split(&atoms, 0).is_err());
        assert!(d.split(&atoms, 4).is_err());
    }

    #[test]
    fn split_counts_sum_to_natoms() {
        let natoms = 40;
        let atoms = column(natoms, 6.0);
        let d = Domain::init([0.0; 3], [1.0, 1.0, 6.0], 0.6).unwrap();
        for n in 1..=natoms {
            let subs = d.split(&atoms, n).unwrap();
            assert_eq!(subs.len(), n);
            let total: usize = subs.iter().map(|s| s.range.len).sum();
            assert_eq!(total, natoms, "n = {n}");
            for pair in subs.windows(2) {
                assert_eq!(pair[0].range.end(), pair[1].range.start);
                assert_eq!(pair[0].domain.max_ext()[2], pair[1].domain.min_ext()[2]);
            }
        }
    }

    #[test]
    fn split_balances_and_records_ghosts() {
        let atoms = column(60, 6.0);
        let d = Domain::init([0.0; 3], [1.0, 1.0, 6.0], 0.6).unwrap();
        let subs = d.split(&atoms, 3).unwrap();
        let planes = d.z_plane_counts(&atoms).unwrap();

        assert_eq!(subs[0].ghost_min, 0);
        assert_eq!(subs[2].ghost_max, 0);
        assert!(subs[0].ghost_max > 0);
        assert!(subs[1].ghost_min > 0);
        assert!(subs[0].range.len >= 20);
        assert!(subs[1].range.len >= 20);

        // slab geometry stitches back into the parent along z
        assert_eq!(subs[0].domain.min_ext()[2], d.min_ext()[2]);
        assert_eq!(subs[2].domain.max_ext()[2], d.max_ext()[2]);
        let interior: usize = subs.iter().map(|s| s.domain.boxes()[2] - 2).sum();
        assert_eq!(interior, d.boxes()[2] - 2);

        // ghosts are whole neighbouring planes
        assert!(planes.contains(&(subs[0].ghost_max as u32)));
        assert!(planes.contains(&(subs[1].ghost_min as u32)));
    }

    #[test]
    fn sub_domain_views_see_their_own_atoms() {
        let atoms = column(60, 6.0);
        let d = Domain::init([0.0; 3], [1.0, 1.0, 6.0], 0.6).unwrap();
        for sub in d.split(&atoms, 3).unwrap() {
            let view = atoms.view(&sub).unwrap();
            assert_eq!(view.natoms(), sub.range.len);
            assert_eq!(view.begin(), sub.ghost_min);
            for i in view.begin()..view.end() {
                let z = view.position(i)[2];
                assert!(z >= sub.domain.min_ext()[2] - 1e-5);
                assert!(z <= sub.domain.max_ext()[2] + 1e-5);
            }
            if sub.ghost_min > 0 {
                assert_eq!(view.position(0), atoms.position(sub.range.start - sub.ghost_min));
            }
        }
    }

    #[test]
    fn box_of_rejects_points_off_the_grid() {
        let d = Domain::init([0.0; 3], [2.0; 3], 0.6).unwrap();
        assert!(d.box_of(1.0, 1.0, 1.0).is_some());
        assert_eq!(d.box_of(d.min_border()[0], d.min_border()[1], d.min_border()[2]), Some(0));
        assert_eq!(d.box_of(100.0, 1.0, 1.0), None);
        assert_eq!(d.box_of(1.0, -5.0, 1.0), None);
        assert_eq!(d.box_of(f32::NAN, 1.0, 1.0), None);
        assert_eq!(d.box_of(1.0, f32::INFINITY, 1.0), None);
    }

    #[test]
    fn split_fails_on_atoms_outside_the_grid() {
        let d = Domain::init([0.0; 3], [1.0; 3], 0.6).unwrap();
        let atoms = filled(&[[0.5; 3], [0.5, 0.5, 40.0]]);
        let err = d.split(&atoms, 2).unwrap_err();
        assert!(matches!(err, SotlError::OutsideGrid(_)));
    }
}
