//! Single-threaded reference engine

use crate::atom::{AtomSet, AxesMut};
use crate::boxes::box_ids;
use crate::domain::Domain;
use crate::error::SotlResult;
use crate::force::{self, ForceLaw};

use super::host::{HostState, not_allocated};
use super::{Boundary, EngineKind, ForceMode, StepEngine, StepFlags};

/// Plain loops over own atoms, the ground truth for the other engines
#[derive(Debug, Default)]
pub struct SeqEngine {
    state: Option<HostState>,
}

impl SeqEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn gravity(atoms: &mut AtomSet, accel: [f32; 3], dt: f32) {
    let (begin, end) = (atoms.begin(), atoms.end());
    let mut vel = atoms.velocities_mut();
    for i in begin..end {
        let v = vel.get(i);
        vel.set(
            i,
            [v[0] + accel[0] * dt, v[1] + accel[1] * dt, v[2] + accel[2] * dt],
        );
    }
}

fn all_pairs(atoms: &mut AtomSet, law: &ForceLaw) {
    let (begin, end, active) = (atoms.begin(), atoms.end(), atoms.active_end());
    let (pos, mut vel) = atoms.split_mut();
    let pos = pos.as_axes();
    for i in begin..end {
        let f = law.all_pairs(i, pos, 0..active);
        vel.set(i, law.kick(vel.get(i), f));
    }
}

fn boxed(atoms: &mut AtomSet, domain: &Domain, state: &mut HostState) -> SotlResult<()> {
    state.ids = box_ids(atoms, domain)?;
    state.index.reset();
    state.index.count(&state.ids);
    state.scatter_and_flip(atoms);

    let (begin, end, active) = (atoms.begin(), atoms.end(), atoms.active_end());
    let law = state.law;
    let index = &state.index;
    let (pos, mut vel) = atoms.split_mut();
    let pos = pos.as_axes();
    for i in begin..end {
        let f = law.boxed(i, pos, index, domain, [0..begin, end..active]);
        vel.set(i, law.kick(vel.get(i), f));
    }
    Ok(())
}

fn z_sorted(atoms: &mut AtomSet, law: &ForceLaw) {
    atoms.sort_by_z();
    let (begin, end, active) = (atoms.begin(), atoms.end(), atoms.active_end());
    let (pos, mut vel) = atoms.split_mut();
    let pos = pos.as_axes();
    for i in begin..end {
        let f = law.z_window(i, pos, begin..end, [0..begin, end..active]);
        vel.set(i, law.kick(vel.get(i), f));
    }
}

fn collide(atoms: &mut AtomSet, state: &mut HostState) {
    let (begin, end, active) = (atoms.begin(), atoms.end(), atoms.active_end());
    let stride = atoms.stride();
    let back = state.velocity_snapshot(atoms);
    let mut out = AxesMut::from_arena(back, stride);
    let (pos, vel) = (atoms.positions(), atoms.velocities());
    for i in begin..end {
        out.set(i, force::collide(i, pos, vel, 0..active));
    }
    state.buffers.flip_velocities(atoms);
}

fn reflect(atoms: &mut AtomSet, domain: &Domain) {
    let (min, max) = (domain.min_ext(), domain.max_ext());
    let (begin, end) = (atoms.begin(), atoms.end());
    let (mut pos, mut vel) = atoms.split_mut();
    for i in begin..end {
        let (p, v) = force::reflect_atom(pos.get(i), vel.get(i), min, max);
        pos.set(i, p);
        vel.set(i, v);
    }
}

fn integrate(atoms: &mut AtomSet, law: &ForceLaw) {
    let (begin, end) = (atoms.begin(), atoms.end());
    let (mut pos, vel) = atoms.split_mut();
    for i in begin..end {
        pos.set(i, law.drift(pos.get(i), vel.get(i)));
    }
}

impl StepEngine for SeqEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Sequential
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SotlError;
    use crate::params::SimParams;

    #[test]
    fn step_before_allocate_is_rejected() {
        let mut atoms = AtomSet::new(1).unwrap();
        atoms.add([0.5; 3], [0.0; 3]).unwrap();
        let domain = Domain::init([0.0; 3], [1.0; 3], 0.6).unwrap();
        let err = SeqEngine::new()
            .step(&mut atoms, &domain, &StepFlags::default())
            .unwrap_err();
        assert!(matches!(err, SotlError::InvalidState { .. }));
    }

    #[test]
    fn box_counts_follow_the_last_box_pass() {
        let domain = Domain::init([0.0; 3], [2.0; 3], 0.6).unwrap();
        let mut atoms = AtomSet::new(3).unwrap();
        atoms.add([0.1, 0.1, 0.1], [0.0; 3]).unwrap();
        atoms.add([0.15, 0.1, 0.1], [0.0; 3]).unwrap();
        atoms.add([1.9, 1.9, 1.9], [0.0; 3]).unwrap();
        let before = atoms.count_per_box(&domain).unwrap();

        let mut engine = SeqEngine::new();
        engine
            .allocate(&atoms, &domain, ForceLaw::new(&SimParams::default()))
            .unwrap();
        assert_eq!(engine.box_counts().unwrap(), None);

        engine
            .step(&mut atoms, &domain, &StepFlags::force_only(ForceMode::Boxed))
            .unwrap();
        assert_eq!(engine.box_counts().unwrap(), Some(before));
    }

    #[test]
    fn ghosts_push_but_never_move() {
        // own atom in the middle, one ghost on each side
        let domain = Domain::init([0.0; 3], [3.0; 3], 0.6).unwrap();
        let mut parent = AtomSet::new(3).unwrap();
        parent.add([1.5, 1.5, 1.25], [0.0; 3]).unwrap();
        parent.add([1.5, 1.5, 1.5], [0.0; 3]).unwrap();
        parent.add([1.5, 1.5, 1.75], [0.0; 3]).unwrap();
        let sub = crate::domain::SubDomain {
            index: 1,
            domain: domain.clone(),
            range: crate::domain::AtomRange::new(1, 1),
            ghost_min: 1,
            ghost_max: 1,
        };
        let atoms = parent.view(&sub).unwrap();

        for mode in [ForceMode::AllPairs, ForceMode::Boxed, ForceMode::ZSorted] {
            let mut run = atoms.clone();
            let mut engine = SeqEngine::new();
            engine
                .allocate(&run, &domain, ForceLaw::new(&SimParams::default()))
                .unwrap();
            engine
                .step(&mut run, &domain, &StepFlags::force_only(mode))
                .unwrap();
            assert_eq!(run.position(0), [1.5, 1.5, 1.25]);
            assert_eq!(run.position(2), [1.5, 1.5, 1.75]);
            // symmetric ghosts cancel along z
            assert_eq!(run.velocity(1)[2], 0.0);
        }
    }
}
