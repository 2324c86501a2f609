//! Device discovery, back end selection and the per back end lifecycle
//!
//! The device table lists every wgpu adapter (with the `gpu` feature) and
//! always ends with at least one CPU entry: when no adapter is a CPU, a host
//! device is appended so the sequential and fork-join engines have somewhere
//! to run. Host devices cannot dispatch kernels.

use std::fmt;

use tracing::{debug, info};

use crate::atom::AtomSet;
use crate::domain::Domain;
use crate::engine::{EngineKind, StepEngine, StepFlags, host_engine};
use crate::error::{SotlError, SotlResult};
use crate::force::ForceLaw;

/// Broad class of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
        };
        f.write_str(name)
    }
}

/// One row of the device table
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: usize,
    pub name: String,
    pub platform: String,
    pub device_type: DeviceType,
    /// Whether kernel-dispatch engines can run on it
    pub dispatchable: bool,
}

/// Name of the device appended when no adapter is a CPU
pub const HOST_DEVICE_NAME: &str = "Host CPU";

/// Every device of the platform, in id order
pub fn discover() -> Vec<DeviceInfo> {
    #[allow(unused_mut)]
    let mut devices: Vec<DeviceInfo> = Vec::new();

    #[cfg(feature = "gpu")]
    devices.extend(crate::gpu::list_adapters().into_iter().map(|a| DeviceInfo {
        id: a.index,
        name: a.name,
        platform: a.backend,
        device_type: if a.is_cpu {
            DeviceType::Cpu
        } else {
            DeviceType::Gpu
        },
        dispatchable: true,
    }));

    with_host_device(devices)
}

fn with_host_device(mut devices: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    if !devices.iter().any(|d| d.device_type == DeviceType::Cpu) {
        devices.push(DeviceInfo {
            id: devices.len(),
            name: HOST_DEVICE_NAME.to_string(),
            platform: "host".to_string(),
            device_type: DeviceType::Cpu,
            dispatchable: false,
        });
    }
    devices
}

/// Device classes accepted by [`DeviceSelection::add_by_type`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFilter {
    All,
    Gpu,
    Cpu,
}

/// Devices picked for a run with the engines that will drive them.
///
/// A device carries each engine kind at most once, so one CPU can run both
/// host engines side by side, each over its own share of the atoms.
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    devices: Vec<DeviceInfo>,
    picks: Vec<(usize, EngineKind)>,
}

impl DeviceSelection {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            picks: Vec::new(),
        }
    }

    pub fn discover() -> Self {
        Self::new(discover())
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    fn device(&self, id: usize) -> SotlResult<&DeviceInfo> {
        self.devices.get(id).ok_or_else(|| {
            SotlError::InvalidDevice(format!(
                "no device #{id}, {} available",
                self.devices.len()
            ))
        })
    }

    fn pick(&mut self, id: usize, kind: EngineKind) {
        if !self.picks.contains(&(id, kind)) {
            self.picks.push((id, kind));
        }
    }

    /// Run kernels on every dispatchable device of class `filter`
    pub fn add_by_type(&mut self, filter: TypeFilter) -> SotlResult<()> {
        let ids: Vec<usize> = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, device)| {
                let matches = match filter {
                    TypeFilter::All => true,
                    TypeFilter::Gpu => device.device_type == DeviceType::Gpu,
                    TypeFilter::Cpu => device.device_type == DeviceType::Cpu,
                };
                matches && device.dispatchable
            })
            .map(|(id, _)| id)
            .collect();
        if ids.is_empty() {
            return Err(SotlError::DeviceNotFound(format!(
                "no {filter:?} device can dispatch kernels"
            )));
        }
        for id in ids {
            self.pick(id, EngineKind::Kernel);
        }
        Ok(())
    }

    /// Run kernels on device `id`
    pub fn add_kernel(&mut self, id: usize) -> SotlResult<()> {
        let device = self.device(id)?;
        if !device.dispatchable {
            return Err(SotlError::InvalidDeviceType(format!(
                "{} cannot dispatch kernels",
                device.name
            )));
        }
        self.pick(id, EngineKind::Kernel);
        Ok(())
    }

    /// Run the sequential engine over CPU device `id`
    pub fn add_sequential(&mut self, id: usize) -> SotlResult<()> {
        self.add_host(id, EngineKind::Sequential)
    }

    /// Run the fork-join engine over CPU device `id`
    pub fn add_fork_join(&mut self, id: usize) -> SotlResult<()> {
        self.add_host(id, EngineKind::ForkJoin)
    }

    fn add_host(&mut self, id: usize, kind: EngineKind) -> SotlResult<()> {
        let device = self.device(id)?;
        if device.device_type != DeviceType::Cpu {
            return Err(SotlError::InvalidDeviceType(format!(
                "{kind} engines need a CPU device, #{id} is a {}",
                device.device_type
            )));
        }
        self.pick(id, kind);
        Ok(())
    }

    /// Selected devices with their engines, in id order and then in the
    /// order they were added
    pub fn selected(&self) -> Vec<(&DeviceInfo, EngineKind)> {
        let mut picks = self.picks.clone();
        picks.sort_by_key(|&(id, _)| id);
        picks
            .into_iter()
            .filter_map(|(id, kind)| self.devices.get(id).map(|d| (d, kind)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.picks.is_empty()
    }

    /// Fall back to the sequential engine on the first CPU device
    pub fn or_default(mut self) -> SotlResult<Self> {
        if self.is_empty() {
            let id = self
                .devices
                .iter()
                .position(|d| d.device_type == DeviceType::Cpu)
                .ok_or_else(|| SotlError::DeviceNotFound("no CPU device".to_string()))?;
            self.add_sequential(id)?;
        }
        Ok(self)
    }

    /// Human-readable device table
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for d in &self.devices {
            let engines = match (d.device_type, d.dispatchable) {
                (DeviceType::Cpu, true) => "kernel, fork-join, sequential",
                (DeviceType::Cpu, false) => "fork-join, sequential",
                (DeviceType::Gpu, _) => "kernel",
            };
            out.push_str(&format!(
                "#{}: {} [{}] ({}; {})\n",
                d.id, d.name, d.platform, d.device_type, engines
            ));
        }
        out
    }
}

/// Build the engine for one selected device
pub fn open_engine(device: &DeviceInfo, kind: EngineKind) -> SotlResult<Box<dyn StepEngine>> {
    match kind {
        #[cfg(feature = "gpu")]
        EngineKind::Kernel => Ok(Box::new(crate::gpu::KernelEngine::new(device.id)?)),
        #[cfg(not(feature = "gpu"))]
        EngineKind::Kernel => Err(SotlError::DeviceNotFound(format!(
            "{} needs the gpu feature",
            device.name
        ))),
        host => host_engine(host),
    }
}

/// Lifecycle of one back end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Created,
    BuffersAllocated,
    Distributed,
    Stepping,
    Finalized,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Created => "created",
            BackendState::BuffersAllocated => "buffers allocated",
            BackendState::Distributed => "distributed",
            BackendState::Stepping => "stepping",
            BackendState::Finalized => "finalized",
        }
    }
}

/// Atoms and geometry a back end owns once buffers are allocated
#[derive(Debug)]
struct Workload {
    atoms: AtomSet,
    domain: Domain,
}

/// One engine driving one share of the atoms
pub struct Backend {
    index: usize,
    device: String,
    engine: Box<dyn StepEngine>,
    state: BackendState,
    workload: Option<Workload>,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("index", &self.index)
            .field("device", &self.device)
            .field("engine", &self.engine.kind())
            .field("state", &self.state)
            .finish()
    }
}

impl Backend {
    pub fn new(index: usize, device: impl Into<String>, engine: Box<dyn StepEngine>) -> Self {
        Self {
            index,
            device: device.into(),
            engine,
            state: BackendState::Created,
            workload: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn kind(&self) -> EngineKind {
        self.engine.kind()
    }

    /// Engine name and the device it runs on
    pub fn name(&self) -> String {
        format!("{} on {}", self.engine.name(), self.device)
    }

    fn expect(&self, expected: &'static str, ok: &[BackendState]) -> SotlResult<()> {
        if ok.contains(&self.state) {
            Ok(())
        } else {
            Err(SotlError::InvalidState {
                expected,
                found: self.state.as_str(),
            })
        }
    }

    fn workload(&self) -> SotlResult<&Workload> {
        self.workload.as_ref().ok_or(SotlError::InvalidState {
            expected: "buffers allocated",
            found: self.state.as_str(),
        })
    }

    /// Take ownership of `atoms` on `domain` and size the engine buffers
    pub fn allocate(&mut self, atoms: AtomSet, domain: Domain, law: ForceLaw) -> SotlResult<()> {
        self.expect("created", &[BackendState::Created])?;
        self.engine.allocate(&atoms, &domain, law)?;
        debug!(
            index = self.index,
            natoms = atoms.natoms(),
            ghosts = atoms.ghost_min() + atoms.ghost_max(),
            bytes = atoms.position_buffer_bytes() * 2,
            "back end buffers allocated"
        );
        self.workload = Some(Workload { atoms, domain });
        self.state = BackendState::BuffersAllocated;
        Ok(())
    }

    /// Upload the owned atoms to the engine
    pub fn distribute(&mut self) -> SotlResult<()> {
        self.expect("buffers allocated", &[BackendState::BuffersAllocated])?;
        let work = self.workload.as_ref().ok_or(SotlError::InvalidState {
            expected: "buffers allocated",
            found: "created",
        })?;
        self.engine.write(&work.atoms)?;
        info!(index = self.index, backend = %self.name(), natoms = work.atoms.natoms(), "atoms distributed");
        self.state = BackendState::Distributed;
        Ok(())
    }

    pub fn step(&mut self, flags: &StepFlags) -> SotlResult<()> {
        self.expect(
            "distributed",
            &[BackendState::Distributed, BackendState::Stepping],
        )?;
        let work = self.workload.as_mut().ok_or(SotlError::InvalidState {
            expected: "buffers allocated",
            found: "created",
        })?;
        self.engine.step(&mut work.atoms, &work.domain, flags)?;
        self.state = BackendState::Stepping;
        Ok(())
    }

    /// Refresh the owned atoms from the engine
    pub fn read_back(&mut self) -> SotlResult<()> {
        self.expect(
            "distributed",
            &[BackendState::Distributed, BackendState::Stepping],
        )?;
        let work = self.workload.as_mut().ok_or(SotlError::InvalidState {
            expected: "buffers allocated",
            found: "created",
        })?;
        self.engine.read_back(&mut work.atoms)
    }

    /// Per-box counts of the last box pass
    pub fn box_counts(&mut self) -> SotlResult<Option<Vec<u32>>> {
        self.expect("stepping", &[BackendState::Stepping])?;
        self.engine.box_counts()
    }

    /// Owned atoms as of the last read-back
    pub fn atoms(&self) -> SotlResult<&AtomSet> {
        Ok(&self.workload()?.atoms)
    }

    pub fn domain(&self) -> SotlResult<&Domain> {
        Ok(&self.workload()?.domain)
    }

    pub fn finalize(&mut self) -> SotlResult<()> {
        if self.state == BackendState::Finalized {
            return Err(SotlError::InvalidState {
                expected: "not finalized",
                found: self.state.as_str(),
            });
        }
        self.workload = None;
        self.state = BackendState::Finalized;
        debug!(index = self.index, "back end finalized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ForceMode, SeqEngine};
    use crate::params::SimParams;

    fn table() -> Vec<DeviceInfo> {
        vec![
            DeviceInfo {
                id: 0,
                name: "Discrete".into(),
                platform: "Vulkan".into(),
                device_type: DeviceType::Gpu,
                dispatchable: true,
            },
            DeviceInfo {
                id: 1,
                name: "llvmpipe".into(),
                platform: "Vulkan".into(),
                device_type: DeviceType::Cpu,
                dispatchable: true,
            },
        ]
    }

    #[test]
    fn host_device_is_appended_without_a_cpu_adapter() {
        let devices = with_host_device(table()[..1].to_vec());
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].id, 1);
        assert_eq!(devices[1].name, HOST_DEVICE_NAME);
        assert!(!devices[1].dispatchable);

        assert_eq!(with_host_device(table()).len(), 2);
        assert!(discover().iter().any(|d| d.device_type == DeviceType::Cpu));
    }

    #[test]
    fn selection_checks_ids_and_types() {
        let mut sel = DeviceSelection::new(table());
        assert!(sel.is_empty());
        assert_eq!(sel.add_sequential(2).unwrap_err().code(), -32);
        assert_eq!(sel.add_fork_join(0).unwrap_err().code(), -33);
        sel.add_fork_join(1).unwrap();
        sel.add_kernel(0).unwrap();
        let picked: Vec<_> = sel.selected().into_iter().map(|(d, k)| (d.id, k)).collect();
        assert_eq!(
            picked,
            vec![(0, EngineKind::Kernel), (1, EngineKind::ForkJoin)]
        );
    }

    #[test]
    fn one_cpu_runs_both_host_engines() {
        let mut sel = DeviceSelection::new(with_host_device(vec![]));
        sel.add_fork_join(0).unwrap();
        sel.add_sequential(0).unwrap();
        sel.add_sequential(0).unwrap();
        let picked: Vec<_> = sel.selected().into_iter().map(|(d, k)| (d.id, k)).collect();
        assert_eq!(
            picked,
            vec![(0, EngineKind::ForkJoin), (0, EngineKind::Sequential)]
        );
    }

    #[test]
    fn host_devices_cannot_dispatch() {
        let mut sel = DeviceSelection::new(with_host_device(vec![]));
        assert_eq!(sel.add_kernel(0).unwrap_err().code(), -33);
        assert_eq!(sel.add_by_type(TypeFilter::All).unwrap_err().code(), -34);
        let sel = sel.or_default().unwrap();
        assert_eq!(sel.selected()[0].1, EngineKind::Sequential);
    }

    #[test]
    fn type_filters_select_matching_devices() {
        let mut sel = DeviceSelection::new(table());
        sel.add_by_type(TypeFilter::Cpu).unwrap();
        assert_eq!(sel.selected().len(), 1);
        assert_eq!(sel.selected()[0].0.id, 1);
        sel.add_by_type(TypeFilter::All).unwrap();
        assert_eq!(sel.selected().len(), 2);
    }

    #[test]
    fn listing_names_every_device() {
        let sel = DeviceSelection::new(with_host_device(table()[..1].to_vec()));
        insta::assert_snapshot!(sel.listing(), @r"
        #0: Discrete [Vulkan] (GPU; kernel)
        #1: Host CPU [host] (CPU; fork-join, sequential)
        ");
    }

    fn allocated() -> Backend {
        let domain = Domain::init([0.0; 3], [2.0; 3], 0.6).unwrap();
        let mut atoms = AtomSet::new(2).unwrap();
        atoms.add([0.5, 0.5, 0.5], [0.0; 3]).unwrap();
        atoms.add([1.5, 1.5, 1.5], [0.0; 3]).unwrap();
        let mut backend = Backend::new(0, HOST_DEVICE_NAME, Box::new(SeqEngine::new()));
        backend
            .allocate(atoms, domain, ForceLaw::new(&SimParams::default()))
            .unwrap();
        backend
    }

    #[test]
    fn lifecycle_runs_in_order() {
        let mut backend = allocated();
        assert_eq!(backend.state(), BackendState::BuffersAllocated);
        let flags = StepFlags::force_only(ForceMode::Boxed);
        let err = backend.step(&flags).unwrap_err();
        assert!(matches!(
            err,
            SotlError::InvalidState {
                expected: "distributed",
                found: "buffers allocated"
            }
        ));
        assert!(backend.box_counts().is_err());

        backend.distribute().unwrap();
        backend.step(&flags).unwrap();
        assert_eq!(backend.state(), BackendState::Stepping);
        assert_eq!(backend.box_counts().unwrap().unwrap().iter().sum::<u32>(), 2);
        backend.read_back().unwrap();
        assert_eq!(backend.atoms().unwrap().natoms(), 2);
        assert_eq!(backend.name(), "sequential on Host CPU");

        backend.finalize().unwrap();
        assert!(backend.step(&flags).is_err());
        assert!(backend.atoms().is_err());
        assert!(backend.finalize().is_err());
    }

    #[test]
    fn allocate_only_once() {
        let mut backend = allocated();
        let domain = Domain::init([0.0; 3], [2.0; 3], 0.6).unwrap();
        let err = backend
            .allocate(
                AtomSet::new(1).unwrap(),
                domain,
                ForceLaw::new(&SimParams::default()),
            )
            .unwrap_err();
        assert_eq!(err.code(), -30);
    }
}
