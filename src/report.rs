//! Timing summary of a run, written as JSON

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SotlError, SotlResult};

/// What ran and how fast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Device name of every back end, in distribution order
    pub backends: Vec<String>,
    pub natoms: usize,
    pub iterations: usize,
    pub elapsed_us: u64,
    pub us_per_iteration: f64,
    /// Million atom updates per second
    pub matoms_per_sec: f64,
}

impl RunReport {
    pub fn new(backends: Vec<String>, natoms: usize, iterations: usize, elapsed: Duration) -> Self {
        let elapsed_us = elapsed.as_micros() as u64;
        let us_per_iteration = if iterations == 0 {
            0.0
        } else {
            elapsed_us as f64 / iterations as f64
        };
        let matoms_per_sec = if us_per_iteration > 0.0 {
            natoms as f64 / us_per_iteration
        } else {
            0.0
        };
        Self {
            backends,
            natoms,
            iterations,
            elapsed_us,
            us_per_iteration,
            matoms_per_sec,
        }
    }

    pub fn to_json(&self) -> SotlResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| SotlError::Io(e.into()))
    }

    pub fn save(&self, path: &Path) -> SotlResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
