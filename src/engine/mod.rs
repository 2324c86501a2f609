//! Step engines: one simulation step, three scheduling models
//!
//! Every engine runs the same ordered stages on the own atoms of an
//! [`AtomSet`]:
//!
//! 1. **Gravity**: constant acceleration against the view normal
//! 2. **Force**: Lennard-Jones, all pairs, through the box grid or over a
//!    window of atoms sorted by z
//! 3. **Collision**: elastic bounce between touching atoms
//! 4. **Borders**: reflection on the domain walls
//! 5. **Integration**: `p += v * dt`, always on
//!
//! The engines differ only in how the per-atom work is scheduled:
//! [`SeqEngine`] loops on one thread, [`ForkJoinEngine`] uses rayon parallel
//! iterators, and the kernel-dispatch engine (`gpu` feature) records one
//! compute pass per stage.

mod fork_join;
mod host;
mod seq;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::atom::AtomSet;
use crate::domain::Domain;
use crate::error::{SotlError, SotlResult};
use crate::force::ForceLaw;
use crate::params::DEFAULT_GRAVITY;

pub use fork_join::ForkJoinEngine;
pub use seq::SeqEngine;

#[cfg(feature = "gpu")]
pub use crate::gpu::KernelEngine;

/// Scheduling model of a back end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// One compute pass per stage on a wgpu device
    Kernel,
    /// rayon parallel loops over atoms
    ForkJoin,
    /// Single-threaded reference
    Sequential,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::Kernel => "kernel",
            EngineKind::ForkJoin => "fork-join",
            EngineKind::Sequential => "sequential",
        };
        f.write_str(name)
    }
}

/// Force algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForceMode {
    Off,
    /// O(n²) scan of every atom pair
    AllPairs,
    /// Neighbour search through the box grid
    #[default]
    Boxed,
    /// Own atoms sorted by z, each scanning neighbours until the z gap
    /// exceeds the cutoff
    ZSorted,
}

/// Behaviour at the domain walls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Boundary {
    #[default]
    Reflect,
    /// Wrap-around; accepted in configs but rejected when stepping
    Periodic,
}

/// Gravity as a view normal and a magnitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gravity {
    pub normal: [f32; 3],
    pub magnitude: f32,
}

impl Default for Gravity {
    fn default() -> Self {
        Self {
            normal: [0.0, 1.0, 0.0],
            magnitude: DEFAULT_GRAVITY,
        }
    }
}

impl Gravity {
    /// Acceleration added to velocities each step
    pub fn acceleration(&self) -> [f32; 3] {
        self.normal.map(|n| -n * self.magnitude)
    }
}

/// Stage toggles for one step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepFlags {
    pub gravity: Option<Gravity>,
    pub force: ForceMode,
    pub collision: bool,
    pub borders: Option<Boundary>,
}

impl Default for StepFlags {
    fn default() -> Self {
        Self {
            gravity: Some(Gravity::default()),
            force: ForceMode::Boxed,
            collision: false,
            borders: Some(Boundary::Reflect),
        }
    }
}

impl StepFlags {
    /// Only the force stage (and integration)
    pub fn force_only(force: ForceMode) -> Self {
        Self {
            gravity: None,
            force,
            collision: false,
            borders: None,
        }
    }

    /// Reject stage combinations no engine implements
    pub fn validate(&self) -> SotlResult<()> {
        if self.borders == Some(Boundary::Periodic) {
            return Err(SotlError::NotImplemented(
                "periodic boundaries; use reflecting borders".to_string(),
            ));
        }
        Ok(())
    }
}

/// One back end's implementation of a simulation step.
///
/// Host engines keep `atoms` authoritative after every call. Device engines
/// keep the state resident and only refresh `atoms` on [`StepEngine::read_back`].
pub trait StepEngine {
    fn kind(&self) -> EngineKind;

    /// Human-readable device name
    fn name(&self) -> String {
        self.kind().to_string()
    }

    /// Size working buffers for `atoms` on `domain`
    fn allocate(&mut self, atoms: &AtomSet, domain: &Domain, law: ForceLaw) -> SotlResult<()>;

    /// Upload the current state of `atoms`
    fn write(&mut self, _atoms: &AtomSet) -> SotlResult<()> {
        Ok(())
    }

    /// Advance one step
    fn step(&mut self, atoms: &mut AtomSet, domain: &Domain, flags: &StepFlags) -> SotlResult<()>;

    /// Copy positions and velocities back into `atoms`
    fn read_back(&mut self, _atoms: &mut AtomSet) -> SotlResult<()> {
        Ok(())
    }

    /// Per-box counts of the last box pass, if one ran
    fn box_counts(&mut self) -> SotlResult<Option<Vec<u32>>>;
}

/// Back buffers for stages that read and write the same quantity.
///
/// Flipping swaps the back buffer with the atom set's arena, so the atom set
/// always exposes the current side.
#[derive(Debug, Default)]
pub struct PingPong {
    pos: Vec<f32>,
    vel: Vec<f32>,
    pos_index: usize,
    vel_index: usize,
}

impl PingPong {
    pub fn new(atoms: &AtomSet) -> SotlResult<Self> {
        let mut pos = Vec::new();
        pos.try_reserve_exact(atoms.position_arena().len())?;
        pos.resize(atoms.position_arena().len(), 0.0);
        let mut vel = Vec::new();
        vel.try_reserve_exact(atoms.velocity_arena().len())?;
        vel.resize(atoms.velocity_arena().len(), 0.0);
        Ok(Self {
            pos,
            vel,
            pos_index: 0,
            vel_index: 0,
        })
    }

    /// Back position and velocity arenas
    pub fn back_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.pos, &mut self.vel)
    }

    pub fn back_velocities_mut(&mut self) -> &mut [f32] {
        &mut self.vel
    }

    pub fn flip_positions(&mut self, atoms: &mut AtomSet) {
        atoms.swap_positions(&mut self.pos);
        self.pos_index ^= 1;
    }

    pub fn flip_velocities(&mut self, atoms: &mut AtomSet) {
        atoms.swap_velocities(&mut self.vel);
        self.vel_index ^= 1;
    }

    /// Which side (0 or 1) currently holds positions and velocities
    pub fn indices(&self) -> (usize, usize) {
        (self.pos_index, self.vel_index)
    }
}

/// Build a host engine of `kind`
pub fn host_engine(kind: EngineKind) -> SotlResult<Box<dyn StepEngine>> {
    match kind {
        EngineKind::Sequential => Ok(Box::new(SeqEngine::new())),
        EngineKind::ForkJoin => Ok(Box::new(ForkJoinEngine::new())),
        EngineKind::Kernel => Err(SotlError::InvalidDeviceType(
            "kernel engines need an adapter, not a host thread".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::force;
    use crate::params::{ATOM_RADIUS, SimParams};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn engines() -> Vec<Box<dyn StepEngine>> {
        vec![Box::new(SeqEngine::new()), Box::new(ForkJoinEngine::new())]
    }

    fn law() -> ForceLaw {
        ForceLaw::new(&SimParams::default())
    }

    /// Random atoms at least `min_gap` apart inside `[0, side]^3`
    fn random_atoms(n: usize, side: f32, min_gap: f32, seed: u64) -> AtomSet {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut points: Vec<[f32; 3]> = Vec::with_capacity(n);
        while points.len() < n {
            let p = [
                rng.gen_range(0.0..side),
                rng.gen_range(0.0..side),
                rng.gen_range(0.0..side),
            ];
            let clear = points.iter().all(|q| {
                let d = [p[0] - q[0], p[1] - q[1], p[2] - q[2]];
                d[0] * d[0] + d[1] * d[1] + d[2] * d[2] >= min_gap * min_gap
            });
            if clear {
                points.push(p);
            }
        }
        let mut atoms = AtomSet::new(n).unwrap();
        for p in points {
            atoms.add(p, [0.0; 3]).unwrap();
        }
        atoms
    }

    fn run_one(
        engine: &mut dyn StepEngine,
        atoms: &AtomSet,
        domain: &Domain,
        flags: &StepFlags,
    ) -> AtomSet {
        let mut atoms = atoms.clone();
        engine.allocate(&atoms, domain, law()).unwrap();
        engine.write(&atoms).unwrap();
        engine.step(&mut atoms, domain, flags).unwrap();
        engine.read_back(&mut atoms).unwrap();
        atoms
    }

    /// Velocity of the atom that started at `start`, found through `p - v`
    fn velocity_of(atoms: &AtomSet, start: [f32; 3]) -> [f32; 3] {
        (atoms.begin()..atoms.end())
            .map(|i| (atoms.position(i), atoms.velocity(i)))
            .min_by(|(pa, va), (pb, vb)| {
                let da = dist2([pa[0] - va[0], pa[1] - va[1], pa[2] - va[2]], start);
                let db = dist2([pb[0] - vb[0], pb[1] - vb[1], pb[2] - vb[2]], start);
                da.total_cmp(&db)
            })
            .map(|(_, v)| v)
            .unwrap()
    }

    fn dist2(a: [f32; 3], b: [f32; 3]) -> f32 {
        (0..3).map(|k| (a[k] - b[k]).powi(2)).sum()
    }

    fn assert_close(a: [f32; 3], b: [f32; 3], rel: f32) {
        for k in 0..3 {
            let scale = a[k].abs().max(b[k].abs());
            assert!(
                (a[k] - b[k]).abs() <= rel * scale + 1e-6,
                "{a:?} vs {b:?} differ beyond {rel}"
            );
        }
    }

    #[test]
    fn periodic_borders_are_rejected() {
        let flags = StepFlags {
            borders: Some(Boundary::Periodic),
            ..StepFlags::default()
        };
        assert_eq!(flags.validate().unwrap_err().code(), -99);
    }

    #[test]
    fn gravity_points_against_the_normal() {
        let g = Gravity::default();
        assert_eq!(g.acceleration(), [-0.0, -DEFAULT_GRAVITY, -0.0]);
    }

    #[test]
    fn host_engine_refuses_kernel_kind() {
        assert!(host_engine(EngineKind::Kernel).is_err());
        assert_eq!(
            host_engine(EngineKind::ForkJoin).unwrap().kind(),
            EngineKind::ForkJoin
        );
    }

    #[test]
    fn boxed_force_matches_all_pairs() {
        let sigma = SimParams::default().lj_sigma as f32;
        let side = 10.0 * sigma;
        let atoms = random_atoms(500, side, 0.9 * sigma, 7);
        let domain = Domain::init([0.0; 3], [side; 3], SimParams::default().lj_cutoff).unwrap();

        let mut reference = SeqEngine::new();
        let pairs = run_one(
            &mut reference,
            &atoms,
            &domain,
            &StepFlags::force_only(ForceMode::AllPairs),
        );

        for mut engine in engines() {
            let boxed = run_one(
                engine.as_mut(),
                &atoms,
                &domain,
                &StepFlags::force_only(ForceMode::Boxed),
            );
            for i in atoms.begin()..atoms.end() {
                let start = atoms.position(i);
                assert_close(velocity_of(&boxed, start), pairs.velocity(i), 1e-4);
            }
        }
    }

    #[test]
    fn z_sorted_force_matches_all_pairs() {
        let sigma = SimParams::default().lj_sigma as f32;
        let side = 10.0 * sigma;
        let atoms = random_atoms(500, side, 0.9 * sigma, 13);
        let domain = Domain::init([0.0; 3], [side; 3], SimParams::default().lj_cutoff).unwrap();

        let pairs = run_one(
            &mut SeqEngine::new(),
            &atoms,
            &domain,
            &StepFlags::force_only(ForceMode::AllPairs),
        );

        for mut engine in engines() {
            let sorted = run_one(
                engine.as_mut(),
                &atoms,
                &domain,
                &StepFlags::force_only(ForceMode::ZSorted),
            );
            // z before the drift, recovered through p - v
            let z0 = |i: usize| sorted.position(i)[2] - sorted.velocity(i)[2];
            for i in sorted.begin() + 1..sorted.end() {
                assert!(z0(i - 1) <= z0(i) + 1e-5, "atoms {} and {i} out of z order", i - 1);
            }
            for i in atoms.begin()..atoms.end() {
                let start = atoms.position(i);
                assert_close(velocity_of(&sorted, start), pairs.velocity(i), 1e-4);
            }
        }
    }

    #[test]
    fn engines_agree_on_a_full_step() {
        let sigma = SimParams::default().lj_sigma as f32;
        let side = 6.0 * sigma;
        let mut atoms = random_atoms(120, side, 0.9 * sigma, 11);
        let mut rng = StdRng::seed_from_u64(3);
        for i in atoms.begin()..atoms.end() {
            let v = [
                rng.gen_range(-0.05..0.05),
                rng.gen_range(-0.05..0.05),
                rng.gen_range(-0.05..0.05),
            ];
            atoms.set_velocity(i, v);
        }
        let domain = Domain::init([0.0; 3], [side; 3], SimParams::default().lj_cutoff).unwrap();
        let flags = StepFlags {
            force: ForceMode::AllPairs,
            collision: true,
            ..StepFlags::default()
        };

        let seq = run_one(&mut SeqEngine::new(), &atoms, &domain, &flags);
        let par = run_one(&mut ForkJoinEngine::new(), &atoms, &domain, &flags);
        for i in atoms.begin()..atoms.end() {
            assert_close(seq.position(i), par.position(i), 1e-6);
            assert_close(seq.velocity(i), par.velocity(i), 1e-6);
        }
    }

    #[test]
    fn border_reflection_flips_then_integration_moves_back() {
        let domain = Domain::init([0.0; 3], [2.0; 3], 0.6).unwrap();
        let (min, max) = (domain.min_ext(), domain.max_ext());

        // border pass alone: clamped onto the wall, velocity flipped
        let (p, v) = force::reflect_atom([max[0] + 1e-3, 1.0, 1.0], [0.05, 0.0, 0.0], min, max);
        assert_eq!(p, [max[0], 1.0, 1.0]);
        assert_eq!(v, [-0.05, 0.0, 0.0]);

        let flags = StepFlags {
            gravity: None,
            force: ForceMode::Off,
            collision: false,
            borders: Some(Boundary::Reflect),
        };
        for mut engine in engines() {
            let mut atoms = AtomSet::new(1).unwrap();
            atoms.add([max[0] + 1e-3, 1.0, 1.0], [0.05, 0.0, 0.0]).unwrap();
            let atoms = run_one(engine.as_mut(), &atoms, &domain, &flags);
            let [x, ..] = atoms.position(0);
            let [vx, ..] = atoms.velocity(0);
            assert!(vx < 0.0);
            // full step: the clamped atom then drifts back inside
            assert!((x - (max[0] + vx)).abs() < 1e-6);
            assert!(x < max[0]);
        }
    }

    #[test]
    fn close_pair_repels() {
        let cutoff = SimParams::default().lj_cutoff as f32;
        let domain = Domain::init([0.0; 3], [3.0; 3], cutoff as f64).unwrap();
        let before = 0.5 * cutoff;
        for mode in [ForceMode::AllPairs, ForceMode::Boxed, ForceMode::ZSorted] {
            for mut engine in engines() {
                let mut atoms = AtomSet::new(2).unwrap();
                atoms.add([1.5, 1.5, 1.5], [0.0; 3]).unwrap();
                atoms.add([1.5 + before, 1.5, 1.5], [0.0; 3]).unwrap();
                let atoms = run_one(engine.as_mut(), &atoms, &domain, &StepFlags::force_only(mode));
                let after = (atoms.position(1)[0] - atoms.position(0)[0]).abs();
                assert!(after > before, "{mode:?}: {after} <= {before}");
            }
        }
    }

    #[test]
    fn collision_keeps_atoms_apart() {
        let domain = Domain::init([0.0; 3], [3.0; 3], 0.6).unwrap();
        let flags = StepFlags {
            gravity: None,
            force: ForceMode::Off,
            collision: true,
            borders: None,
        };
        for mut engine in engines() {
            let mut atoms = AtomSet::new(2).unwrap();
            atoms.add([1.0, 1.0, 1.0], [0.01, 0.0, 0.0]).unwrap();
            atoms.add([1.0 + 1.5 * ATOM_RADIUS, 1.0, 1.0], [-0.01, 0.0, 0.0]).unwrap();
            let atoms = run_one(engine.as_mut(), &atoms, &domain, &flags);
            assert!(atoms.velocity(0)[0] < 0.0);
            assert!(atoms.velocity(1)[0] > 0.0);
        }
    }

    #[test]
    fn gravity_accelerates_every_own_atom() {
        let domain = Domain::init([0.0; 3], [3.0; 3], 0.6).unwrap();
        let flags = StepFlags {
            gravity: Some(Gravity::default()),
            force: ForceMode::Off,
            collision: false,
            borders: None,
        };
        for mut engine in engines() {
            let mut atoms = AtomSet::new(3).unwrap();
            for k in 0..3 {
                atoms.add([0.5 + k as f32, 1.5, 1.5], [0.0; 3]).unwrap();
            }
            let atoms = run_one(engine.as_mut(), &atoms, &domain, &flags);
            for i in 0..3 {
                assert_eq!(atoms.velocity(i)[1], -DEFAULT_GRAVITY);
                assert_eq!(atoms.position(i)[1], 1.5 - DEFAULT_GRAVITY);
            }
        }
    }
}
