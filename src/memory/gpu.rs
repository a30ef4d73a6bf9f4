//! WebGPU-backed accelerator memory.
//!
//! Each region is a GPU storage buffer plus a mappable staging buffer used
//! for blocking readback.

use std::any::Any;
use std::sync::{mpsc, Arc};

use tracing::{info, instrument};
use wgpu::*;

use crate::error::AcceleratorError;
use crate::memory::accelerator::{check_len, Accelerator, DeviceRegion};

pub struct WgpuAccelerator {
    name: String,
    device: Arc<Device>,
    queue: Arc<Queue>,
}

impl WgpuAccelerator {
    /// Pick a high-performance adapter and open a device on it
    #[instrument]
    pub fn new() -> Result<Self, AcceleratorError> {
        info!("Initializing WebGPU accelerator");

        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(AcceleratorError::Unavailable)?;

        let name = adapter.get_info().name;
        info!("GPU: {}", name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &DeviceDescriptor {
                label: Some("depthcast accelerator"),
                required_features: Features::empty(),
                required_limits: Limits::downlevel_defaults(),
                memory_hints: MemoryHints::MemoryUsage,
            },
            None,
        ))
        .map_err(|e| AcceleratorError::Transfer(e.to_string()))?;

        Ok(Self::from_device(name, Arc::new(device), Arc::new(queue)))
    }

    /// Share an existing device, e.g. the one a reconstruction pipeline uses
    pub fn from_device(name: String, device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self {
            name,
            device,
            queue,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }
}

impl Accelerator for WgpuAccelerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, len: usize) -> Result<Box<dyn DeviceRegion>, AcceleratorError> {
        let padded = align_to_copy(len);
        if padded > self.device.limits().max_buffer_size {
            return Err(AcceleratorError::OutOfMemory { requested: len });
        }

        // Allocation failures surface asynchronously through error scopes.
        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        self.device.push_error_scope(ErrorFilter::Validation);

        let storage = self.device.create_buffer(&BufferDescriptor {
            label: Some("depth storage"),
            size: padded,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&BufferDescriptor {
            label: Some("depth readback"),
            size: padded,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        if oom.is_some() {
            return Err(AcceleratorError::OutOfMemory { requested: len });
        }
        if let Some(e) = validation {
            return Err(AcceleratorError::Transfer(e.to_string()));
        }

        Ok(Box::new(WgpuRegion {
            len,
            device: self.device.clone(),
            queue: self.queue.clone(),
            storage,
            staging,
        }))
    }
}

pub struct WgpuRegion {
    len: usize,
    device: Arc<Device>,
    queue: Arc<Queue>,
    storage: Buffer,
    staging: Buffer,
}

impl WgpuRegion {
    /// Storage buffer holding the depth samples, for binding in compute passes
    pub fn buffer(&self) -> &Buffer {
        &self.storage
    }
}

impl DeviceRegion for WgpuRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn upload(&mut self, bytes: &[u8]) -> Result<(), AcceleratorError> {
        check_len(self.len, bytes.len())?;

        // write_buffer wants a multiple of COPY_BUFFER_ALIGNMENT.
        if bytes.len() as u64 % COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(&self.storage, 0, bytes);
        } else {
            let mut padded = bytes.to_vec();
            padded.resize(align_to_copy(bytes.len()) as usize, 0);
            self.queue.write_buffer(&self.storage, 0, &padded);
        }
        self.queue.submit(std::iter::empty());
        let _ = self.device.poll(Maintain::Wait);
        Ok(())
    }

    fn download(&self, out: &mut [u8]) -> Result<(), AcceleratorError> {
        check_len(self.len, out.len())?;

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("depth readback"),
            });
        encoder.copy_buffer_to_buffer(&self.storage, 0, &self.staging, 0, self.storage.size());
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = self.staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(Maintain::Wait);

        rx.recv()
            .map_err(|e| AcceleratorError::Transfer(format!("map callback dropped: {}", e)))?
            .map_err(|e| AcceleratorError::Transfer(format!("buffer map failed: {:?}", e)))?;

        {
            let mapped = slice.get_mapped_range();
            out.copy_from_slice(&mapped[..self.len]);
        }
        self.staging.unmap();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn align_to_copy(len: usize) -> u64 {
    let len = len as u64;
    len.div_ceil(COPY_BUFFER_ALIGNMENT) * COPY_BUFFER_ALIGNMENT
}
