//! Working state shared by the host engines

use crate::atom::AtomSet;
use crate::boxes::BoxIndex;
use crate::domain::Domain;
use crate::error::{SotlError, SotlResult};
use crate::force::ForceLaw;

use super::PingPong;

/// Buffers a host engine owns after `allocate`
#[derive(Debug)]
pub(crate) struct HostState {
    pub law: ForceLaw,
    pub buffers: PingPong,
    pub index: BoxIndex,
    /// Box id of every own atom, refreshed by each box pass
    pub ids: Vec<u32>,
    pub boxed: bool,
}

impl HostState {
    pub fn new(atoms: &AtomSet, domain: &Domain, law: ForceLaw) -> SotlResult<Self> {
        let mut ids = Vec::new();
        ids.try_reserve_exact(atoms.natoms())?;
        Ok(Self {
            law,
            buffers: PingPong::new(atoms)?,
            index: BoxIndex::new(domain)?,
            ids,
            boxed: false,
        })
    }

    /// Scan the loaded counters, scatter own atoms by box into the back
    /// arenas and flip both of them
    pub fn scatter_and_flip(&mut self, atoms: &mut AtomSet) {
        self.index.scan();
        let (back_pos, back_vel) = self.buffers.back_mut();
        self.index.scatter(&self.ids, atoms, back_pos, back_vel);
        self.buffers.flip_positions(atoms);
        self.buffers.flip_velocities(atoms);
        self.boxed = true;
    }

    /// Back velocity arena primed with the current velocities
    pub fn velocity_snapshot(&mut self, atoms: &AtomSet) -> &mut [f32] {
        let back = self.buffers.back_velocities_mut();
        back.copy_from_slice(atoms.velocity_arena());
        back
    }
}

pub(crate) fn not_allocated() -> SotlError {
    SotlError::InvalidState {
        expected: "buffers allocated",
        found: "created",
    }
}
