//! Fork-join engine on the rayon thread pool
//!
//! Every stage is one parallel loop over own atoms. A task reads shared
//! arenas freely but writes only the slot of its own atom, so no stage needs
//! atomics. The box histogram is reduced from per-task partial counts and the
//! scatter stays sequential.

use std::ops::Range;

use rayon::prelude::*;
use tracing::info_span;

use crate::atom::{AtomSet, AxesMut};
use crate::domain::Domain;
use crate::error::SotlResult;
use crate::force::{self, ForceLaw};

use super::host::{HostState, not_allocated};
use super::{Boundary, EngineKind, ForceMode, StepEngine, StepFlags};

/// Parallel loops over own atoms
#[derive(Debug, Default)]
pub struct ForkJoinEngine {
    state: Option<HostState>,
}

impl ForkJoinEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Replace `axes[i]` with `f(i, axes[i])` for every `i` in `own`, in parallel
fn par_update<F>(axes: AxesMut<'_>, own: Range<usize>, f: F)
where
    F: Fn(usize, [f32; 3]) -> [f32; 3] + Sync,
{
    let AxesMut { x, y, z } = axes;
    let begin = own.start;
    x[own.clone()]
        .par_iter_mut()
        .zip(y[own.clone()].par_iter_mut())
        .zip(z[own].par_iter_mut())
        .enumerate()
        .for_each(|(k, ((x, y), z))| {
            let [nx, ny, nz] = f(begin + k, [*x, *y, *z]);
            *x = nx;
            *y = ny;
            *z = nz;
        });
}

fn gravity(atoms: &mut AtomSet, accel: [f32; 3], dt: f32) {
    let _s = info_span!("gravity").entered();
    let own = atoms.begin()..atoms.end();
    par_update(atoms.velocities_mut(), own, |_, v| {
        [v[0] + accel[0] * dt, v[1] + accel[1] * dt, v[2] + accel[2] * dt]
    });
}

fn all_pairs(atoms: &mut AtomSet, law: &ForceLaw) {
    let _s = info_span!("all_pairs", natoms = atoms.natoms()).entered();
    let own = atoms.begin()..atoms.end();
    let active = atoms.active_end();
    let (pos, vel) = atoms.split_mut();
    let pos = pos.as_axes();
    par_update(vel, own, |i, v| law.kick(v, law.all_pairs(i, pos, 0..active)));
}

fn box_pass(atoms: &mut AtomSet, domain: &Domain, state: &mut HostState) -> SotlResult<()> {
    let _s = info_span!("box_pass", total_boxes = domain.total_boxes()).entered();
    let pos = atoms.positions();
    state.ids = (atoms.begin()..atoms.end())
        .into_par_iter()
        .map(|i| {
            let [x, y, z] = pos.get(i);
            AtomSet::try_box_id_of(domain, x, y, z).map(|id| id as u32)
        })
        .collect::<SotlResult<Vec<u32>>>()?;

    let total = domain.total_boxes();
    let counts = state
        .ids
        .par_iter()
        .fold(
            || vec![0u32; total],
            |mut acc, &id| {
                acc[id as usize] += 1;
                acc
            },
        )
        .reduce(
            || vec![0u32; total],
            |mut a, b| {
                for (lhs, rhs) in a.iter_mut().zip(b) {
                    *lhs += rhs;
                }
                a
            },
        );
    state.index.load_counts(&counts);
    state.scatter_and_flip(atoms);
    Ok(())
}

fn boxed(atoms: &mut AtomSet, domain: &Domain, state: &mut HostState) -> SotlResult<()> {
    box_pass(atoms, domain, state)?;

    let _s = info_span!("boxed_force", natoms = atoms.natoms()).entered();
    let (begin, end, active) = (atoms.begin(), atoms.end(), atoms.active_end());
    let law = state.law;
    let index = &state.index;
    let (pos, vel) = atoms.split_mut();
    let pos = pos.as_axes();
    par_update(vel, begin..end, |i, v| {
        law.kick(v, law.boxed(i, pos, index, domain, [0..begin, end..active]))
    });
    Ok(())
}

fn z_sorted(atoms: &mut AtomSet, law: &ForceLaw) {
    let _s = info_span!("z_sorted_force", natoms = atoms.natoms()).entered();
    atoms.sort_by_z();
    let (begin, end, active) = (atoms.begin(), atoms.end(), atoms.active_end());
    let (pos, vel) = atoms.split_mut();
    let pos = pos.as_axes();
    par_update(vel, begin..end, |i, v| {
        law.kick(v, law.z_window(i, pos, begin..end, [0..begin, end..active]))
    });
}

fn collide(atoms: &mut AtomSet, state: &mut HostState) {
    let _s = info_span!("collision").entered();
    let own = atoms.begin()..atoms.end();
    let active = atoms.active_end();
    let stride = atoms.stride();
    let back = state.velocity_snapshot(atoms);
    let (pos, vel) = (atoms.positions(), atoms.velocities());
    par_update(AxesMut::from_arena(back, stride), own, |i, _| {
        force::collide(i, pos, vel, 0..active)
    });
    state.buffers.flip_velocities(atoms);
}

fn reflect(atoms: &mut AtomSet, domain: &Domain) {
    let _s = info_span!("borders").entered();
    let (min, max) = (domain.min_ext(), domain.max_ext());
    let own = atoms.begin()..atoms.end();
    let (pos, vel) = atoms.split_mut();
    let (AxesMut { x, y, z }, AxesMut { x: vx, y: vy, z: vz }) = (pos, vel);
    x[own.clone()]
        .par_iter_mut()
        .zip(y[own.clone()].par_iter_mut())
        .zip(z[own.clone()].par_iter_mut())
        .zip(vx[own.clone()].par_iter_mut())
        .zip(vy[own.clone()].par_iter_mut())
        .zip(vz[own].par_iter_mut())
        .for_each(|(((((x, y), z), vx), vy), vz)| {
            let (p, v) = force::reflect_atom([*x, *y, *z], [*vx, *vy, *vz], min, max);
            (*x, *y, *z) = (p[0], p[1], p[2]);
            (*vx, *vy, *vz) = (v[0], v[1], v[2]);
        });
}

fn integrate(atoms: &mut AtomSet, law: &ForceLaw) {
    let _s = info_span!("integrate").entered();
    let own = atoms.begin()..atoms.end();
    let (pos, vel) = atoms.split_mut();
    let vel = vel.as_axes();
    par_update(pos, own, |i, p| law.drift(p, vel.get(i)));
}

impl StepEngine for ForkJoinEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::ForkJoin
    }

    fn name(&self) -> String {
        format!("fork-join ({} threads)", rayon::current_num_threads())
    }

    fn allocate(&mut self, atoms: &AtomSet, domain: &Domain, law: ForceLaw) -> SotlResult<()> {
        self.state = Some(HostState::new(atoms, domain, law)?);
        Ok(())
    }

    fn step(&mut self, atoms: &mut AtomSet, domain: &Domain, flags: &StepFlags) -> SotlResult<()> {
        flags.validate()?;
        let state = self.state.as_mut().ok_or_else(not_allocated)?;
        let law = state.law;

        if let Some(g) = flags.gravity {
            gravity(atoms, g.acceleration(), law.delta_t);
        }
        match flags.force {
            ForceMode::Off => {}
            ForceMode::AllPairs => all_pairs(atoms, &law),
            ForceMode::Boxed => boxed(atoms, domain, state)?,
            ForceMode::ZSorted => z_sorted(atoms, &law),
        }
        if flags.collision {
            collide(atoms, state);
        }
        if flags.borders == Some(Boundary::Reflect) {
            reflect(atoms, domain);
        }
        integrate(atoms, &law);
        Ok(())
    }

    fn box_counts(&mut self) -> SotlResult<Option<Vec<u32>>> {
        let state = self.state.as_ref().ok_or_else(not_allocated)?;
        Ok(state.boxed.then(|| state.index.counts().to_vec()))
    }
}
