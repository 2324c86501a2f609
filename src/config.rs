//! Run configuration loaded from YAML
//!
//! Every field is optional in the file; missing ones take their defaults.
//!
//! ```yaml
//! params:
//!   delta_t: 1.0
//!   lj_epsilon: 0.002
//! force: all-pairs
//! gravity:
//!   normal: [0.0, 0.0, 1.0]
//!   magnitude: 0.01
//! collision: true
//! ghost_refresh: 5
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::{Boundary, ForceMode, Gravity, StepFlags};
use crate::error::{SotlError, SotlResult};
use crate::params::SimParams;

/// Default number of iterations between two ghost recounts
pub const DEFAULT_GHOST_REFRESH: usize = 10;

/// Physics parameters and stage toggles for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub params: SimParams,
    pub force: ForceMode,
    /// `null` turns reflection off
    pub borders: Option<Boundary>,
    /// `null` turns gravity off
    pub gravity: Option<Gravity>,
    pub collision: bool,
    /// Iterations between ghost recounts of multi back end runs
    pub ghost_refresh: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        let flags = StepFlags::default();
        Self {
            params: SimParams::default(),
            force: flags.force,
            borders: flags.borders,
            gravity: flags.gravity,
            collision: flags.collision,
            ghost_refresh: DEFAULT_GHOST_REFRESH,
        }
    }
}

impl RunConfig {
    pub fn from_yaml(text: &str) -> SotlResult<Self> {
        let config: RunConfig = serde_yaml::from_str(text).map_err(|e| SotlError::Parse {
            line: e.location().map_or(0, |l| l.line()),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> SotlResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> SotlResult<()> {
        self.params.validate()?;
        if self.ghost_refresh == 0 {
            return Err(SotlError::InvalidParameter(
                "ghost_refresh must be at least 1".to_string(),
            ));
        }
        if let Some(g) = self.gravity {
            if !(g.magnitude.is_finite() && g.normal.iter().all(|n| n.is_finite())) {
                return Err(SotlError::InvalidParameter(format!(
                    "gravity must be finite, got {g:?}"
                )));
            }
        }
        Ok(())
    }

    /// Stage toggles every back end steps with
    pub fn step_flags(&self) -> StepFlags {
        StepFlags {
            gravity: self.gravity,
            force: self.force,
            collision: self.collision,
            borders: self.borders,
        }
    }
}
