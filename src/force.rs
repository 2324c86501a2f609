//! Per-atom physics shared by every step engine
//!
//! Each function computes the new state of a single atom from read-only
//! inputs and never touches another atom's slot. The sequential and fork-join
//! engines call these directly and the WGSL kernels mirror them operation for
//! operation, which keeps the three back ends numerically aligned.

use std::ops::Range;

use crate::atom::Axes;
use crate::boxes::BoxIndex;
use crate::domain::Domain;
use crate::params::{ATOM_RADIUS, SimParams};

/// Lennard-Jones law in single precision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceLaw {
    pub sigma2: f32,
    pub epsilon: f32,
    pub cutoff2: f32,
    pub delta_t: f32,
}

impl ForceLaw {
    pub fn new(params: &SimParams) -> Self {
        Self {
            sigma2: (params.lj_sigma * params.lj_sigma) as f32,
            epsilon: params.lj_epsilon as f32,
            cutoff2: (params.lj_cutoff * params.lj_cutoff) as f32,
            delta_t: params.delta_t as f32,
        }
    }

    /// Force intensity over distance for a squared separation `r2`.
    ///
    /// Multiplying by the separation vector gives the force on the first atom.
    #[inline]
    pub fn lennard_jones(&self, r2: f32) -> f32 {
        let rr2 = 1.0 / r2;
        let s = self.sigma2 * rr2;
        let r6 = s * s * s;
        24.0 * self.epsilon * rr2 * (2.0 * r6 * r6 - r6)
    }

    #[inline]
    fn accumulate(&self, acc: &mut [f32; 3], pi: [f32; 3], pj: [f32; 3]) {
        let dx = pi[0] - pj[0];
        let dy = pi[1] - pj[1];
        let dz = pi[2] - pj[2];
        let r2 = dx * dx + dy * dy + dz * dz;
        if r2 < self.cutoff2 && r2 > 0.0 {
            let f = self.lennard_jones(r2);
            acc[0] += f * dx;
            acc[1] += f * dy;
            acc[2] += f * dz;
        }
    }

    /// Force on atom `i` from every other atom in `active`
    pub fn all_pairs(&self, i: usize, pos: Axes<'_>, active: Range<usize>) -> [f32; 3] {
        let pi = pos.get(i);
        let mut acc = [0.0f32; 3];
        for j in active {
            if j != i {
                self.accumulate(&mut acc, pi, pos.get(j));
            }
        }
        acc
    }

    /// Force on atom `i` from own atoms in the 27 surrounding boxes and from
    /// every ghost atom.
    ///
    /// `pos` must be the box-sorted arena produced by [`BoxIndex::scatter`].
    pub fn boxed(
        &self,
        i: usize,
        pos: Axes<'_>,
        index: &BoxIndex,
        domain: &Domain,
        ghosts: [Range<usize>; 2],
    ) -> [f32; 3] {
        let pi = pos.get(i);
        let mut acc = [0.0f32; 3];
        index.for_each_neighbor(domain, index.box_of_slot(i), |slots| {
            for j in slots {
                if j != i {
                    self.accumulate(&mut acc, pi, pos.get(j));
                }
            }
        });
        for range in ghosts {
            for j in range {
                self.accumulate(&mut acc, pi, pos.get(j));
            }
        }
        acc
    }

    /// Force on atom `i` from the own atoms of `sorted` within the cutoff
    /// along z, and from every ghost atom.
    ///
    /// Own atoms must be in increasing z order, as left by
    /// [`crate::atom::AtomSet::sort_by_z`]. The scan walks away from `i` in
    /// both directions and stops at the first atom farther than the cutoff
    /// along z.
    pub fn z_window(
        &self,
        i: usize,
        pos: Axes<'_>,
        sorted: Range<usize>,
        ghosts: [Range<usize>; 2],
    ) -> [f32; 3] {
        let pi = pos.get(i);
        let in_reach = |j: &usize| {
            let dz = pi[2] - pos.z[*j];
            dz * dz <= self.cutoff2
        };
        let mut acc = [0.0f32; 3];
        for j in (sorted.start..i).rev().take_while(in_reach) {
            self.accumulate(&mut acc, pi, pos.get(j));
        }
        for j in (i + 1..sorted.end).take_while(in_reach) {
            self.accumulate(&mut acc, pi, pos.get(j));
        }
        for range in ghosts {
            for j in range {
                self.accumulate(&mut acc, pi, pos.get(j));
            }
        }
        acc
    }

    /// Velocity after adding `force` over one time step
    #[inline]
    pub fn kick(&self, v: [f32; 3], force: [f32; 3]) -> [f32; 3] {
        [
            v[0] + force[0] * self.delta_t,
            v[1] + force[1] * self.delta_t,
            v[2] + force[2] * self.delta_t,
        ]
    }

    /// Position after moving with `v` for one time step
    #[inline]
    pub fn drift(&self, p: [f32; 3], v: [f32; 3]) -> [f32; 3] {
        [
            p[0] + v[0] * self.delta_t,
            p[1] + v[1] * self.delta_t,
            p[2] + v[2] * self.delta_t,
        ]
    }
}

/// Velocity of atom `i` after elastic bounces against touching atoms.
///
/// `vel` is a snapshot taken before the stage; only atoms closer than two
/// radii and still approaching exchange their normal velocity component.
pub fn collide(i: usize, pos: Axes<'_>, vel: Axes<'_>, active: Range<usize>) -> [f32; 3] {
    let contact2 = (2.0 * ATOM_RADIUS) * (2.0 * ATOM_RADIUS);
    let pi = pos.get(i);
    let vi = vel.get(i);
    let mut out = vi;
    for j in active {
        if j == i {
            continue;
        }
        let pj = pos.get(j);
        let d = [pi[0] - pj[0], pi[1] - pj[1], pi[2] - pj[2]];
        let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
        if r2 >= contact2 || r2 == 0.0 {
            continue;
        }
        let vj = vel.get(j);
        let dv = [vi[0] - vj[0], vi[1] - vj[1], vi[2] - vj[2]];
        let approach = dv[0] * d[0] + dv[1] * d[1] + dv[2] * d[2];
        if approach < 0.0 {
            let k = approach / r2;
            out[0] -= k * d[0];
            out[1] -= k * d[1];
            out[2] -= k * d[2];
        }
    }
    out
}

/// Clamp one coordinate into `[min, max]`, flipping its velocity on contact
#[inline]
pub fn reflect(p: f32, v: f32, min: f32, max: f32) -> (f32, f32) {
    if p < min {
        (min, -v)
    } else if p > max {
        (max, -v)
    } else {
        (p, v)
    }
}

/// Reflect a whole atom against the domain interior
#[inline]
pub fn reflect_atom(p: [f32; 3], v: [f32; 3], min: [f32; 3], max: [f32; 3]) -> ([f32; 3], [f32; 3]) {
    let mut np = p;
    let mut nv = v;
    for axis in 0..3 {
        (np[axis], nv[axis]) = reflect(p[axis], v[axis], min[axis], max[axis]);
    }
    (np, nv)
}
