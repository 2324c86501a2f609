//! Simulation context: the global domain, its back ends and the run loop
//!
//! A run goes through three phases:
//!
//! 1. **Building**: atoms are added, parameters set and back ends attached
//! 2. **Distributed**: every back end owns its share of the atoms and steps
//! 3. **Finalized**: after [`SimulationContext::shutdown`], nothing runs
//!
//! With more than one back end the domain is cut into z slabs balanced by atom
//! count. Each back end receives its slab's atoms plus a copy of the atoms of
//! the neighbouring planes (ghosts). Ghosts are frozen at distribution time:
//! they push on own atoms but are never moved, and own atoms reflect on the
//! slab walls. Every `ghost_refresh` iterations the context recounts how many
//! atoms each neighbour would now have to share and logs it.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::atom::AtomSet;
use crate::config::RunConfig;
use crate::device::{Backend, DeviceSelection, open_engine};
use crate::domain::Domain;
use crate::engine::StepEngine;
use crate::error::{SotlError, SotlResult};
use crate::force::ForceLaw;
use crate::io::{AtomConfig, save_config};
use crate::params::{Parameter, SimParams, SUBCELL};
use crate::report::RunReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Building,
    Distributed,
    Finalized,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Building => "building",
            Phase::Distributed => "distributed",
            Phase::Finalized => "finalized",
        }
    }
}

/// Ghost bookkeeping of one back end after a recount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GhostCount {
    pub index: usize,
    /// Ghosts held below the slab since distribution
    pub held_min: usize,
    pub held_max: usize,
    /// Atoms the neighbours currently have in the adjacent planes
    pub needed_min: usize,
    pub needed_max: usize,
}

impl GhostCount {
    pub fn is_stale(&self) -> bool {
        self.held_min != self.needed_min || self.held_max != self.needed_max
    }
}

/// Owns the atoms, the domain and every back end of a run
#[derive(Debug)]
pub struct SimulationContext {
    config: RunConfig,
    domain: Domain,
    atoms: AtomSet,
    backends: Vec<Backend>,
    phase: Phase,
    ghosts: Vec<GhostCount>,
    iterations: usize,
    elapsed: Duration,
}

impl SimulationContext {
    /// Empty context for `natoms` atoms inside `[min, max]`
    pub fn init(natoms: usize, min: [f32; 3], max: [f32; 3]) -> SotlResult<Self> {
        let config = RunConfig::default();
        let domain = Domain::init(min, max, config.params.lj_cutoff)?;
        let atoms = AtomSet::new(natoms)?;
        info!(natoms, ?min, ?max, "simulation context created");
        Ok(Self {
            config,
            domain,
            atoms,
            backends: Vec::new(),
            phase: Phase::Building,
            ghosts: Vec::new(),
            iterations: 0,
            elapsed: Duration::ZERO,
        })
    }

    fn expect(&self, phase: Phase) -> SotlResult<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(SotlError::InvalidState {
                expected: phase.as_str(),
                found: self.phase.as_str(),
            })
        }
    }

    /// Replace parameters and stage toggles
    pub fn configure(&mut self, config: RunConfig) -> SotlResult<()> {
        self.expect(Phase::Building)?;
        config.validate()?;
        self.config = config;
        self.rebuild_domain()
    }

    /// Resize the grid for the current cutoff
    fn rebuild_domain(&mut self) -> SotlResult<()> {
        self.domain = Domain::init(
            self.domain.requested_min(),
            self.domain.requested_max(),
            self.config.params.lj_cutoff,
        )?;
        Ok(())
    }

    /// Set one named parameter (`delta-t`, `lj-sigma`, `lj-epsilon`, `lj-cutoff`)
    pub fn set_parameter(&mut self, name: &str, value: f64) -> SotlResult<()> {
        self.expect(Phase::Building)?;
        let param: Parameter = name.parse()?;
        self.config.params.set(param, value)?;
        debug!(%param, value, "parameter set");
        if param == Parameter::LjCutoff {
            self.rebuild_domain()?;
        }
        Ok(())
    }

    pub fn params(&self) -> &SimParams {
        &self.config.params
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Geometry of the whole simulation box
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn natoms(&self) -> usize {
        self.atoms.natoms()
    }

    pub fn add_atom(&mut self, pos: [f32; 3], vel: [f32; 3]) -> SotlResult<()> {
        self.expect(Phase::Building)?;
        self.atoms.add(pos, vel)
    }

    /// Staging set, for bulk fills before distribution
    pub fn atoms_mut(&mut self) -> SotlResult<&mut AtomSet> {
        self.expect(Phase::Building)?;
        Ok(&mut self.atoms)
    }

    /// Attach one back end, returning its index
    pub fn add_backend(&mut self, device: &str, engine: Box<dyn StepEngine>) -> SotlResult<usize> {
        self.expect(Phase::Building)?;
        let index = self.backends.len();
        self.backends.push(Backend::new(index, device, engine));
        Ok(index)
    }

    /// Attach a back end for every selected device
    pub fn add_selection(&mut self, selection: &DeviceSelection) -> SotlResult<()> {
        for (device, kind) in selection.selected() {
            let engine = open_engine(device, kind)?;
            self.add_backend(&device.name, engine)?;
        }
        Ok(())
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Previous and next back end, wrapping around
    pub fn neighbors(&self, index: usize) -> (usize, usize) {
        let n = self.backends.len().max(1);
        ((index + n - 1) % n, (index + 1) % n)
    }

    /// Hand every back end its share of the atoms and upload them
    pub fn distribute_across_backends(&mut self) -> SotlResult<()> {
        self.expect(Phase::Building)?;
        if self.backends.is_empty() {
            return Err(SotlError::InvalidState {
                expected: "at least one back end",
                found: "none",
            });
        }
        if !self.atoms.is_full() {
            return Err(SotlError::InvalidValue(format!(
                "only {} of {} atoms were added",
                self.atoms.current(),
                self.atoms.natoms()
            )));
        }
        self.config.step_flags().validate()?;

        let law = ForceLaw::new(&self.config.params);

        let n = self.backends.len();
        if n == 1 {
            self.backends[0].allocate(self.atoms.clone(), self.domain.clone(), law)?;
        } else {
            let natoms = self.atoms.natoms();
            let mut parent = AtomSet::init(natoms, natoms, true)?;
            for i in self.atoms.begin()..self.atoms.end() {
                parent.add(self.atoms.position(i), self.atoms.velocity(i))?;
            }
            parent.sort_by_z();
            let subs = self.domain.split(&parent, n)?;
            for (backend, sub) in self.backends.iter_mut().zip(&subs) {
                let view = parent.view(sub)?;
                backend.allocate(view, sub.domain.clone(), law)?;
            }
        }
        for backend in &mut self.backends {
            backend.distribute()?;
        }

        self.phase = Phase::Distributed;
        info!(
            backends = n,
            natoms = self.atoms.natoms(),
            boxes = ?self.domain.boxes(),
            "atoms distributed across back ends"
        );
        Ok(())
    }

    /// Advance every back end `n` steps
    pub fn run_iterations(&mut self, n: usize) -> SotlResult<()> {
        self.expect(Phase::Distributed)?;
        let flags = self.config.step_flags();
        let multi = self.backends.len() > 1;
        let start = Instant::now();

        for _ in 0..n {
            let tick = Instant::now();
            for backend in &mut self.backends {
                if let Err(err) = backend.step(&flags) {
                    error!(
                        backend = backend.index(),
                        iteration = self.iterations,
                        %err,
                        "step failed, stopping the run"
                    );
                    return Err(err);
                }
            }
            self.iterations += 1;
            if multi && self.iterations % self.config.ghost_refresh == 0 {
                self.recount_ghosts()?;
            }
            debug!(
                target: "sotl::perf",
                iteration = self.iterations,
                us = tick.elapsed().as_micros() as u64,
                "iteration"
            );
        }

        let elapsed = start.elapsed();
        self.elapsed += elapsed;
        let report = RunReport::new(self.backend_names(), self.natoms(), n, elapsed);
        info!(
            target: "sotl::perf",
            iterations = n,
            us_per_iteration = report.us_per_iteration,
            matoms_per_sec = report.matoms_per_sec,
            "run finished"
        );
        Ok(())
    }

    /// Per-plane atom counts of back end `index`, from its last box pass or
    /// from a read-back when none ran
    fn plane_counts(&mut self, index: usize) -> SotlResult<Vec<u32>> {
        let backend = &mut self.backends[index];
        let plane_boxes = backend.domain()?.plane_boxes();
        if let Some(counts) = backend.box_counts()? {
            return Ok(Domain::planes_from_boxes(&counts, plane_boxes));
        }
        backend.read_back()?;
        backend.domain()?.z_plane_counts(backend.atoms()?)
    }

    fn recount_ghosts(&mut self) -> SotlResult<()> {
        let n = self.backends.len();
        let mut planes = Vec::with_capacity(n);
        for index in 0..n {
            let counts = self.plane_counts(index)?;
            let len = counts.len();
            debug!(
                index,
                bottom = ?&counts[..3.min(len)],
                top = ?&counts[len.saturating_sub(3)..],
                "edge planes"
            );
            planes.push(counts);
        }

        // first and last planes owned by a slab, skipping the padding layer
        let first_owned = |p: &[u32]| p.get(SUBCELL).copied().unwrap_or(0) as usize;
        let last_owned = |p: &[u32]| {
            p.len()
                .checked_sub(1 + SUBCELL)
                .and_then(|i| p.get(i))
                .copied()
                .unwrap_or(0) as usize
        };

        self.ghosts.clear();
        for index in 0..n {
            let (prev, next) = self.neighbors(index);
            let atoms = self.backends[index].atoms()?;
            let count = GhostCount {
                index,
                held_min: atoms.ghost_min(),
                held_max: atoms.ghost_max(),
                needed_min: if index == 0 { 0 } else { last_owned(&planes[prev]) },
                needed_max: if index == n - 1 { 0 } else { first_owned(&planes[next]) },
            };
            if count.is_stale() {
                debug!(?count, "ghost counts moved since distribution");
            }
            self.ghosts.push(count);
        }
        let stale = self.ghosts.iter().filter(|g| g.is_stale()).count();
        info!(iteration = self.iterations, stale, "ghosts recounted");
        Ok(())
    }

    /// Result of the last ghost recount
    pub fn ghost_counts(&self) -> &[GhostCount] {
        &self.ghosts
    }

    fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(Backend::name).collect()
    }

    /// Current state of every atom, under the requested bounds
    pub fn snapshot(&mut self) -> SotlResult<AtomConfig> {
        match self.phase {
            Phase::Building => Ok(AtomConfig::from_atoms(&self.domain, [&self.atoms])),
            Phase::Distributed => {
                for backend in &mut self.backends {
                    backend.read_back()?;
                }
                let sets = self
                    .backends
                    .iter()
                    .map(Backend::atoms)
                    .collect::<SotlResult<Vec<_>>>()?;
                Ok(AtomConfig::from_atoms(&self.domain, sets))
            }
            Phase::Finalized => Err(SotlError::InvalidState {
                expected: "distributed",
                found: self.phase.as_str(),
            }),
        }
    }

    /// Current positions of every own atom
    pub fn positions(&mut self) -> SotlResult<Vec<[f32; 3]>> {
        Ok(self.snapshot()?.atoms.iter().map(|a| a.pos).collect())
    }

    /// Write every atom to a config file
    pub fn dump_positions(&mut self, path: &Path) -> SotlResult<()> {
        let config = self.snapshot()?;
        save_config(path, &config)
    }

    /// Timing of every iteration run so far
    pub fn report(&self) -> RunReport {
        RunReport::new(
            self.backend_names(),
            self.natoms(),
            self.iterations,
            self.elapsed,
        )
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Release every back end
    pub fn shutdown(&mut self) -> SotlResult<()> {
        if self.phase == Phase::Finalized {
            return Err(SotlError::InvalidState {
                expected: "not finalized",
                found: self.phase.as_str(),
            });
        }
        if self.phase == Phase::Building && !self.backends.is_empty() {
            warn!("shutting down back ends that never received atoms");
        }
        for backend in &mut self.backends {
            backend.finalize()?;
        }
        self.phase = Phase::Finalized;
        info!(iterations = self.iterations, "simulation finished");
        Ok(())
    }
}
