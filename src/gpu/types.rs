//! Uniform block shared by every step kernel
//!
//! Scalars only, so the WGSL struct has no vec3 padding rules to mirror.

use bytemuck::{Pod, Zeroable};

use crate::atom::AtomSet;
use crate::domain::Domain;
use crate::force::ForceLaw;
use crate::params::ATOM_RADIUS;

/// Threads per workgroup of every kernel
pub const WORKGROUP_SIZE: u32 = 256;

/// Step parameters as uploaded to binding 8.
///
/// Layout matches the `Uniforms` struct of [`super::shaders::TYPES`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct StepUniforms {
    pub begin: u32,
    pub end: u32,
    pub active_end: u32,
    pub stride: u32,

    pub boxes: [u32; 3],
    pub total_boxes: u32,

    pub min_border: [f32; 3],
    pub inv_box: f32,

    pub min_ext: [f32; 3],
    pub dt: f32,

    pub max_ext: [f32; 3],
    pub sigma2: f32,

    /// Gravity acceleration, zero when the stage is off
    pub gravity: [f32; 3],
    pub epsilon: f32,

    pub cutoff2: f32,
    pub radius: f32,
    pub _padding: [f32; 2],
}

impl StepUniforms {
    pub fn new(atoms: &AtomSet, domain: &Domain, law: &ForceLaw) -> Self {
        let [bx, by, bz] = domain.boxes();
        Self {
            begin: atoms.begin() as u32,
            end: atoms.end() as u32,
            active_end: atoms.active_end() as u32,
            stride: atoms.stride() as u32,
            boxes: [bx as u32, by as u32, bz as u32],
            total_boxes: domain.total_boxes() as u32,
            min_border: domain.min_border(),
            inv_box: domain.inv_box_size(),
            min_ext: domain.min_ext(),
            dt: law.delta_t,
            max_ext: domain.max_ext(),
            sigma2: law.sigma2,
            gravity: [0.0; 3],
            epsilon: law.epsilon,
            cutoff2: law.cutoff2,
            radius: ATOM_RADIUS,
            _padding: [0.0; 2],
        }
    }

    /// Own atoms handled by one-thread-per-atom kernels
    pub fn own_atoms(&self) -> u32 {
        self.end - self.begin
    }
}
