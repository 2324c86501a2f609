//! Command-line interface of the `sotl` binary

use std::path::PathBuf;

use clap::Parser;
use tracing::warn;

use crate::config::RunConfig;
use crate::device::{DeviceSelection, TypeFilter};
use crate::engine::ForceMode;
use crate::error::SotlResult;

/// Lennard-Jones molecular dynamics on interchangeable compute back ends.
#[derive(Parser, Debug)]
#[command(name = "sotl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Atom config file, read when --natoms is not given
    #[arg(default_value = "conf/default.conf")]
    pub config: PathBuf,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    pub verbose: bool,

    /// Print the device table and exit
    #[arg(short, long)]
    pub list_devices: bool,

    /// Run the sequential engine over CPU device #N (combines with -O on
    /// the same device)
    #[arg(short = 's', long = "seq", value_name = "N")]
    pub seq: Vec<usize>,

    /// Run the fork-join engine over CPU device #N (combines with -s on
    /// the same device)
    #[arg(short = 'O', long = "omp", value_name = "N")]
    pub omp: Vec<usize>,

    /// Dispatch kernels on device #N
    #[arg(short = 'd', long = "device", value_name = "N")]
    pub device: Vec<usize>,

    /// Dispatch kernels on every device
    #[arg(short, long)]
    pub all: bool,

    /// Dispatch kernels on every GPU
    #[arg(short, long)]
    pub gpu: bool,

    /// Dispatch kernels on every CPU adapter
    #[arg(short, long)]
    pub cpu: bool,

    /// Dump atoms to the dump path at shutdown
    #[arg(short, long)]
    pub file_dump: bool,

    /// Where --file-dump writes
    #[arg(long, default_value = "dump.conf")]
    pub dump_path: PathBuf,

    /// Place atoms randomly instead of on a lattice
    #[arg(short = 'R', long)]
    pub random_atoms: bool,

    /// Number of iterations
    #[arg(short = 'i', long = "nb-iter", default_value_t = 1, allow_negative_numbers = true)]
    pub nb_iter: i64,

    /// Generate this many atoms (suffix k or m for thousands or millions)
    #[arg(short = 'n', long, value_parser = parse_natoms)]
    pub natoms: Option<usize>,

    /// YAML run configuration
    #[arg(long, value_name = "YAML")]
    pub params: Option<PathBuf>,

    /// O(n²) force instead of the box grid
    #[arg(long)]
    pub all_pairs: bool,

    /// Sort atoms by z and scan a cutoff-wide window (host engines only)
    #[arg(long, conflicts_with = "all_pairs")]
    pub z_sorted: bool,

    /// Let atoms cross the domain walls
    #[arg(long)]
    pub no_borders: bool,

    /// Bounce touching atoms off each other
    #[arg(long)]
    pub collisions: bool,

    #[arg(long)]
    pub no_gravity: bool,

    /// Write a JSON timing report
    #[arg(long, value_name = "JSON")]
    pub report: Option<PathBuf>,

    /// Seed for random placement and synthesized velocities
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Parse an atom count with an optional `k` or `m` suffix
pub fn parse_natoms(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, scale) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 1_000),
        Some((i, 'm' | 'M')) => (&s[..i], 1_000_000),
        _ => (s, 1),
    };
    let n: usize = digits
        .parse()
        .map_err(|_| format!("'{s}' is not an atom count"))?;
    n.checked_mul(scale)
        .ok_or_else(|| format!("'{s}' atoms do not fit in memory"))
}

impl Cli {
    /// Iterations to run, at least one
    pub fn iterations(&self) -> usize {
        if self.nb_iter <= 0 {
            warn!(
                nb_iter = self.nb_iter,
                "invalid number of iterations, running 1"
            );
            1
        } else {
            self.nb_iter as usize
        }
    }

    /// YAML configuration with the command-line toggles applied on top
    pub fn run_config(&self) -> SotlResult<RunConfig> {
        let mut config = match &self.params {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if self.all_pairs {
            config.force = ForceMode::AllPairs;
        }
        if self.z_sorted {
            config.force = ForceMode::ZSorted;
        }
        if self.no_borders {
            config.borders = None;
        }
        if self.collisions {
            config.collision = true;
        }
        if self.no_gravity {
            config.gravity = None;
        }
        Ok(config)
    }

    /// Apply the device flags to `selection`, falling back to one
    /// sequential back end
    pub fn select(&self, mut selection: DeviceSelection) -> SotlResult<DeviceSelection> {
        if self.all {
            selection.add_by_type(TypeFilter::All)?;
        }
        if self.gpu {
            selection.add_by_type(TypeFilter::Gpu)?;
        }
        if self.cpu {
            selection.add_by_type(TypeFilter::Cpu)?;
        }
        for &id in &self.device {
            selection.add_kernel(id)?;
        }
        for &id in &self.seq {
            selection.add_sequential(id)?;
        }
        for &id in &self.omp {
            selection.add_fork_join(id)?;
        }
        selection.or_default()
    }
}
