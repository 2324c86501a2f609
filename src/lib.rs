//! sotl - spatially-partitioned Lennard-Jones molecular dynamics.
//!
//! Atoms live in a struct-of-arrays [`atom::AtomSet`] inside a box-gridded
//! [`domain::Domain`]. A [`context::SimulationContext`] spreads them across
//! one or more back ends, each stepping its share with one of the
//! [`engine::StepEngine`] implementations.

pub mod atom;
pub mod boxes;
pub mod cli;
pub mod config;
pub mod context;
pub mod device;
pub mod domain;
pub mod engine;
pub mod error;
pub mod force;
pub mod generator;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod io;
pub mod params;
pub mod report;
