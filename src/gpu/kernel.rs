//! Kernel-dispatch step engine on a wgpu device
//!
//! Atom state stays resident on the device between steps. Each stage is one
//! compute pass recorded into a single encoder per step; passes in one
//! encoder execute in order with full barriers between them.

use wgpu::util::DeviceExt;

use super::shaders::step_shader;
use super::types::{StepUniforms, WORKGROUP_SIZE};
use crate::atom::AtomSet;
use crate::domain::Domain;
use crate::engine::{Boundary, EngineKind, ForceMode, StepEngine, StepFlags};
use crate::error::{SotlError, SotlResult};
use crate::force::ForceLaw;

/// Name and type of one adapter
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterSummary {
    pub index: usize,
    pub name: String,
    pub backend: String,
    pub is_cpu: bool,
}

fn instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

/// Every adapter the platform exposes, in selection order
pub fn list_adapters() -> Vec<AdapterSummary> {
    instance()
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .enumerate()
        .map(|(index, adapter)| {
            let info = adapter.get_info();
            AdapterSummary {
                index,
                name: info.name,
                backend: format!("{:?}", info.backend),
                is_cpu: info.device_type == wgpu::DeviceType::Cpu,
            }
        })
        .collect()
}

/// Whether any adapter is present
pub fn gpu_available() -> bool {
    !instance()
        .enumerate_adapters(wgpu::Backends::all())
        .is_empty()
}

struct Kernels {
    gravity: wgpu::ComputePipeline,
    clear_boxes: wgpu::ComputePipeline,
    count_boxes: wgpu::ComputePipeline,
    scan_boxes: wgpu::ComputePipeline,
    scatter_boxes: wgpu::ComputePipeline,
    force_all_pairs: wgpu::ComputePipeline,
    force_boxed: wgpu::ComputePipeline,
    collision: wgpu::ComputePipeline,
    border: wgpu::ComputePipeline,
    integrate: wgpu::ComputePipeline,
}

impl Kernels {
    fn new(device: &wgpu::Device, layout: &wgpu::BindGroupLayout) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Step Kernels"),
            source: wgpu::ShaderSource::Wgsl(step_shader().into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Step Pipeline Layout"),
            bind_group_layouts: &[layout],
            push_constant_ranges: &[],
        });
        let pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        Self {
            gravity: pipeline("gravity"),
            clear_boxes: pipeline("clear_boxes"),
            count_boxes: pipeline("count_boxes"),
            scan_boxes: pipeline("scan_boxes"),
            scatter_boxes: pipeline("scatter_boxes"),
            force_all_pairs: pipeline("force_all_pairs"),
            force_boxed: pipeline("force_boxed"),
            collision: pipeline("collision"),
            border: pipeline("border"),
            integrate: pipeline("integrate"),
        }
    }
}

/// Device buffers sized for one atom set and domain
struct DeviceBuffers {
    pos: [wgpu::Buffer; 2],
    vel: [wgpu::Buffer; 2],
    counts: wgpu::Buffer,
    status: wgpu::Buffer,
    uniform_buffer: wgpu::Buffer,
    staging: wgpu::Buffer,
    /// Indexed by `[position side][velocity side]`
    bind_groups: [[wgpu::BindGroup; 2]; 2],
    // Kept alive to maintain GPU resources referenced by the bind groups
    _offsets: wgpu::Buffer,
    _cursor: wgpu::Buffer,
    uniforms: StepUniforms,
    pos_index: usize,
    vel_index: usize,
    boxed: bool,
}

impl DeviceBuffers {
    /// Bind group exposing the current sides at bindings 0 and 1
    fn current(&self) -> &wgpu::BindGroup {
        &self.bind_groups[self.pos_index][self.vel_index]
    }
}

/// Step engine recording one compute pass per stage
pub struct KernelEngine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    layout: wgpu::BindGroupLayout,
    kernels: Kernels,
    buffers: Option<DeviceBuffers>,
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn map_error(e: impl std::fmt::Display) -> SotlError {
    SotlError::InvalidDevice(format!("device read-back failed: {e}"))
}

impl KernelEngine {
    /// Open adapter `index` of [`list_adapters`]
    pub fn new(index: usize) -> SotlResult<Self> {
        pollster::block_on(Self::open(index))
    }

    async fn open(index: usize) -> SotlResult<Self> {
        let adapter = instance()
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .nth(index)
            .ok_or_else(|| SotlError::DeviceNotFound(format!("no adapter with index {index}")))?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Step Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None, // trace path
            )
            .await
            .map_err(|e| SotlError::DeviceNotFound(format!("{adapter_name}: {e}")))?;

        let mut entries: Vec<_> = (0..8).map(storage_entry).collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 8,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Step Bind Group Layout"),
            entries: &entries,
        });
        let kernels = Kernels::new(&device, &layout);

        Ok(Self {
            device,
            queue,
            adapter_name,
            layout,
            kernels,
            buffers: None,
        })
    }

    fn storage(&self, label: &str, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    fn buffers(&self) -> SotlResult<&DeviceBuffers> {
        self.buffers.as_ref().ok_or(SotlError::InvalidState {
            expected: "buffers allocated",
            found: "created",
        })
    }

    /// Copy the first `len` elements of `src` through the staging buffer
    fn read_buffer<T: bytemuck::Pod>(&self, src: &wgpu::Buffer, len: usize) -> SotlResult<Vec<T>> {
        let buffers = self.buffers()?;
        let bytes = (len * std::mem::size_of::<T>()) as u64;
        let padded = bytes.next_multiple_of(wgpu::MAP_ALIGNMENT);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Read-back Encoder"),
            });
        encoder.copy_buffer_to_buffer(src, 0, &buffers.staging, 0, padded);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffers.staging.slice(..padded);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv().map_err(map_error)?.map_err(map_error)?;

        let data = slice.get_mapped_range();
        let out = bytemuck::cast_slice::<u8, T>(&data)[..len].to_vec();
        drop(data);
        buffers.staging.unmap();
        Ok(out)
    }

    /// Abort when a count pass saw an atom outside the padded grid
    fn check_status(&self) -> SotlResult<()> {
        let buffers = self.buffers()?;
        let status: Vec<u32> = self.read_buffer(&buffers.status, 1)?;
        if status[0] != 0 {
            return Err(SotlError::OutsideGrid(format!(
                "a box pass on {} found an atom off the grid",
                self.adapter_name
            )));
        }
        Ok(())
    }
}

fn dispatch(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    invocations: u32,
) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(label),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind_group, &[]);
    pass.dispatch_workgroups(invocations.div_ceil(WORKGROUP_SIZE).max(1), 1, 1);
}

impl StepEngine for KernelEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Kernel
    }

    fn name(&self) -> String {
        self.adapter_name.clone()
    }

    fn allocate(&mut self, atoms: &AtomSet, domain: &Domain, law: ForceLaw) -> SotlResult<()> {
        let arena_bytes = atoms.position_buffer_bytes() as u64;
        let box_bytes = (domain.box_buffer_len() * std::mem::size_of::<u32>()) as u64;

        let pos = [
            self.storage("Positions A", arena_bytes),
            self.storage("Positions B", arena_bytes),
        ];
        let vel = [
            self.storage("Velocities A", arena_bytes),
            self.storage("Velocities B", arena_bytes),
        ];
        let counts = self.storage("Box Counts", box_bytes);
        let offsets = self.storage("Box Offsets", box_bytes);
        let cursor = self.storage("Box Cursor", box_bytes);
        let status = self.storage("Status", 16);

        let uniforms = StepUniforms::new(atoms, domain, &law);
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Uniform Buffer"),
                contents: bytemuck::bytes_of(&uniforms),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: arena_bytes.max(box_bytes),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = |p: usize, v: usize| {
            let buffers = [
                &pos[p],
                &vel[v],
                &pos[1 - p],
                &vel[1 - v],
                &counts,
                &offsets,
                &cursor,
                &status,
                &uniform_buffer,
            ];
            let entries: Vec<_> = buffers
                .iter()
                .enumerate()
                .map(|(binding, buffer)| wgpu::BindGroupEntry {
                    binding: binding as u32,
                    resource: buffer.as_entire_binding(),
                })
                .collect();
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Step Bind Group"),
                layout: &self.layout,
                entries: &entries,
            })
        };
        let bind_groups = [
            [bind_group(0, 0), bind_group(0, 1)],
            [bind_group(1, 0), bind_group(1, 1)],
        ];

        self.buffers = Some(DeviceBuffers {
            pos,
            vel,
            counts,
            status,
            uniform_buffer,
            staging,
            bind_groups,
            _offsets: offsets,
            _cursor: cursor,
            uniforms,
            pos_index: 0,
            vel_index: 0,
            boxed: false,
        });
        Ok(())
    }

    fn write(&mut self, atoms: &AtomSet) -> SotlResult<()> {
        let buffers = self.buffers.as_mut().ok_or(SotlError::InvalidState {
            expected: "buffers allocated",
            found: "created",
        })?;
        buffers.pos_index = 0;
        buffers.vel_index = 0;
        self.queue.write_buffer(
            &buffers.pos[0],
            0,
            bytemuck::cast_slice(atoms.position_arena()),
        );
        self.queue.write_buffer(
            &buffers.vel[0],
            0,
            bytemuck::cast_slice(atoms.velocity_arena()),
        );
        self.queue
            .write_buffer(&buffers.status, 0, bytemuck::bytes_of(&[0u32; 4]));
        Ok(())
    }

    fn step(&mut self, _atoms: &mut AtomSet, _domain: &Domain, flags: &StepFlags) -> SotlResult<()> {
        flags.validate()?;
        let kernels = &self.kernels;
        let buffers = self.buffers.as_mut().ok_or(SotlError::InvalidState {
            expected: "buffers allocated",
            found: "created",
        })?;

        buffers.uniforms.gravity = flags
            .gravity
            .map(|g| g.acceleration())
            .unwrap_or([0.0; 3]);
        self.queue.write_buffer(
            &buffers.uniform_buffer,
            0,
            bytemuck::bytes_of(&buffers.uniforms),
        );

        let own = buffers.uniforms.own_atoms();
        let active = buffers.uniforms.active_end;
        let total_boxes = buffers.uniforms.total_boxes;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Step Encoder"),
            });

        if flags.gravity.is_some() {
            dispatch(&mut encoder, "Gravity Pass", &kernels.gravity, buffers.current(), own);
        }
        match flags.force {
            ForceMode::Off => {}
            ForceMode::AllPairs => {
                let bind_group = buffers.current();
                dispatch(&mut encoder, "All-Pairs Force Pass", &kernels.force_all_pairs, bind_group, own);
            }
            ForceMode::Boxed => {
                let bind_group = buffers.current();
                dispatch(&mut encoder, "Clear Boxes Pass", &kernels.clear_boxes, bind_group, total_boxes);
                dispatch(&mut encoder, "Count Boxes Pass", &kernels.count_boxes, bind_group, own);
                dispatch(&mut encoder, "Scan Boxes Pass", &kernels.scan_boxes, bind_group, 1);
                dispatch(&mut encoder, "Scatter Boxes Pass", &kernels.scatter_boxes, bind_group, active);
                buffers.pos_index ^= 1;
                buffers.vel_index ^= 1;
                buffers.boxed = true;
                let bind_group = buffers.current();
                dispatch(&mut encoder, "Boxed Force Pass", &kernels.force_boxed, bind_group, own);
            }
            ForceMode::ZSorted => {
                return Err(SotlError::NotImplemented(
                    "z-sorted force on kernel engines; use boxed or all-pairs".to_string(),
                ));
            }
        }
        if flags.collision {
            dispatch(&mut encoder, "Collision Pass", &kernels.collision, buffers.current(), active);
            buffers.vel_index ^= 1;
        }
        if flags.borders == Some(Boundary::Reflect) {
            dispatch(&mut encoder, "Border Pass", &kernels.border, buffers.current(), own);
        }
        dispatch(&mut encoder, "Integration Pass", &kernels.integrate, buffers.current(), own);

        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn read_back(&mut self, atoms: &mut AtomSet) -> SotlResult<()> {
        self.check_status()?;
        let buffers = self.buffers()?;
        let len = atoms.position_arena().len();
        let pos: Vec<f32> = self.read_buffer(&buffers.pos[buffers.pos_index], len)?;
        let vel: Vec<f32> = self.read_buffer(&buffers.vel[buffers.vel_index], len)?;
        atoms.position_arena_mut().copy_from_slice(&pos);
        atoms.velocity_arena_mut().copy_from_slice(&vel);
        Ok(())
    }

    fn box_counts(&mut self) -> SotlResult<Option<Vec<u32>>> {
        let buffers = self.buffers()?;
        if !buffers.boxed {
            return Ok(None);
        }
        let total = buffers.uniforms.total_boxes as usize;
        Ok(Some(self.read_buffer(&buffers.counts, total)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SeqEngine;
    use crate::params::SimParams;

    fn lattice(n_side: usize, spacing: f32) -> AtomSet {
        let mut atoms = AtomSet::new(n_side * n_side * n_side).unwrap();
        for k in 0..n_side {
            for j in 0..n_side {
                for i in 0..n_side {
                    let jitter = ((i * 7 + j * 3 + k) % 5) as f32 * 0.01;
                    atoms
                        .add(
                            [
                                0.3 + i as f32 * spacing + jitter,
                                0.3 + j as f32 * spacing,
                                0.3 + k as f32 * spacing - jitter,
                            ],
                            [0.0; 3],
                        )
                        .unwrap();
                }
            }
        }
        atoms
    }

    #[test]
    fn kernel_step_matches_sequential() {
        if !gpu_available() {
            eprintln!("no adapter, skipping");
            return;
        }
        let atoms = lattice(6, 0.5);
        let domain = Domain::init([0.0; 3], [3.5; 3], SimParams::default().lj_cutoff).unwrap();
        let law = ForceLaw::new(&SimParams::default());
        let flags = StepFlags {
            force: ForceMode::AllPairs,
            ..StepFlags::default()
        };

        let mut expected = atoms.clone();
        let mut seq = SeqEngine::new();
        seq.allocate(&expected, &domain, law).unwrap();
        seq.step(&mut expected, &domain, &flags).unwrap();

        let mut engine = KernelEngine::new(0).unwrap();
        let mut got = atoms.clone();
        engine.allocate(&got, &domain, law).unwrap();
        engine.write(&got).unwrap();
        engine.step(&mut got, &domain, &flags).unwrap();
        engine.read_back(&mut got).unwrap();

        for i in got.begin()..got.end() {
            for k in 0..3 {
                let (a, b) = (got.position(i)[k], expected.position(i)[k]);
                assert!((a - b).abs() <= 1e-4 * a.abs().max(1.0), "slot {i}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn kernel_box_counts_match_host_histogram() {
        if !gpu_available() {
            eprintln!("no adapter, skipping");
            return;
        }
        let mut atoms = lattice(5, 0.6);
        let domain = Domain::init([0.0; 3], [3.5; 3], SimParams::default().lj_cutoff).unwrap();
        let expected = atoms.count_per_box(&domain).unwrap();

        let mut engine = KernelEngine::new(0).unwrap();
        engine
            .allocate(&atoms, &domain, ForceLaw::new(&SimParams::default()))
            .unwrap();
        engine.write(&atoms).unwrap();
        assert_eq!(engine.box_counts().unwrap(), None);
        engine
            .step(&mut atoms, &domain, &StepFlags::force_only(ForceMode::Boxed))
            .unwrap();
        assert_eq!(engine.box_counts().unwrap(), Some(expected));
    }
}
