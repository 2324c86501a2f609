//! Physical constants and tunable simulation parameters
//!
//! Lengths are in lattice units where an atom has radius `ATOM_RADIUS`.
//! Time is measured in steps scaled by `delta_t`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SotlError, SotlResult};

// =============================================================================
// Default Constants
// =============================================================================

/// Alignment (in slots) of every per-axis atom array
pub const ALIGN: usize = 64;

/// Workgroup size of the prefix-sum pass; box buffers are padded to twice this
pub const SCAN_WG_SIZE: usize = 256;

/// Radius of one atom
pub const ATOM_RADIUS: f32 = 0.2;

/// Edge of one FCC lattice cell
pub const LATTICE_TILE: f32 = ATOM_RADIUS * 4.0;

/// Number of boxes per cutoff radius; also the padding layer width in boxes
pub const SUBCELL: usize = 1;

/// Fraction of the atom count reserved on each side for ghost atoms
pub const GHOST_FRACTION: f64 = 0.05;

/// Default gravity magnitude (applied against the view normal)
pub const DEFAULT_GRAVITY: f32 = 0.005;

/// Default integration time step
pub const DEFAULT_DELTA_T: f64 = 1.0;

/// Default Lennard-Jones sigma (equilibrium distance)
pub const DEFAULT_LJ_SIGMA: f64 = 0.5039684201;

/// Default Lennard-Jones epsilon (well depth)
pub const DEFAULT_LJ_EPSILON: f64 = 0.001;

/// Default cutoff radius: 1.2 sigma
pub const DEFAULT_LJ_CUTOFF: f64 = 1.2 * DEFAULT_LJ_SIGMA;

/// Round `n` up to the next multiple of `align` (a power of two)
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Round `n` up to `ALIGN`
pub const fn round_up(n: usize) -> usize {
    align_up(n, ALIGN)
}

/// Names accepted by [`SimParams::set`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    DeltaT,
    LjSigma,
    LjEpsilon,
    LjCutoff,
}

impl FromStr for Parameter {
    type Err = SotlError;

    fn from_str(s: &str) -> SotlResult<Self> {
        // deltaT, delta-t and DELTA_T all name the same parameter
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "deltat" | "mddeltat" => Ok(Parameter::DeltaT),
            "ljsigma" => Ok(Parameter::LjSigma),
            "ljepsilon" => Ok(Parameter::LjEpsilon),
            "ljcutoff" | "ljrcut" => Ok(Parameter::LjCutoff),
            _ => Err(SotlError::InvalidParameter(format!(
                "unknown parameter '{s}'"
            ))),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Parameter::DeltaT => "delta-t",
            Parameter::LjSigma => "lj-sigma",
            Parameter::LjEpsilon => "lj-epsilon",
            Parameter::LjCutoff => "lj-cutoff",
        };
        f.write_str(name)
    }
}

/// Molecular dynamics and Lennard-Jones parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimParams {
    /// Integration time step
    pub delta_t: f64,
    /// Lennard-Jones sigma
    pub lj_sigma: f64,
    /// Lennard-Jones epsilon
    pub lj_epsilon: f64,
    /// Distance beyond which the pair force is zero
    pub lj_cutoff: f64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            delta_t: DEFAULT_DELTA_T,
            lj_sigma: DEFAULT_LJ_SIGMA,
            lj_epsilon: DEFAULT_LJ_EPSILON,
            lj_cutoff: DEFAULT_LJ_CUTOFF,
        }
    }
}

impl SimParams {
    /// Set one parameter; values must be finite and strictly positive
    pub fn set(&mut self, param: Parameter, value: f64) -> SotlResult<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(SotlError::InvalidParameter(format!(
                "{param} must be a positive number, got {value}"
            )));
        }
        match param {
            Parameter::DeltaT => self.delta_t = value,
            Parameter::LjSigma => self.lj_sigma = value,
            Parameter::LjEpsilon => self.lj_epsilon = value,
            Parameter::LjCutoff => self.lj_cutoff = value,
        }
        Ok(())
    }

    /// Read one parameter back
    pub fn get(&self, param: Parameter) -> f64 {
        match param {
            Parameter::DeltaT => self.delta_t,
            Parameter::LjSigma => self.lj_sigma,
            Parameter::LjEpsilon => self.lj_epsilon,
            Parameter::LjCutoff => self.lj_cutoff,
        }
    }

    /// Check every field, used after deserializing
    pub fn validate(&self) -> SotlResult<()> {
        for param in [
            Parameter::DeltaT,
            Parameter::LjSigma,
            Parameter::LjEpsilon,
            Parameter::LjCutoff,
        ] {
            let value = self.get(param);
            if !value.is_finite() || value <= 0.0 {
                return Err(SotlError::InvalidParameter(format!(
                    "{param} must be a positive number, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Edge of one grid box
    pub fn box_size(&self) -> f64 {
        self.lj_cutoff / SUBCELL as f64
    }
}
