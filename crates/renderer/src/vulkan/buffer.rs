//! Vertex and index buffers.
//!
//! A [`RenderBuffer`] holds `capacity` elements of `stride` bytes. How its
//! memory is laid out depends on [`Volatility`]:
//!
//! - `Static` and `StaticReadWrite` buffers live in device-local memory.
//!   Writes go to a staging buffer that is copied over at the start of the
//!   next frame the buffer is drawn in.
//! - `PerFrame` buffers are host-visible and hold one region per frame slot.
//!   Writes are kept on the CPU and copied into the current slot's region
//!   when the buffer is drawn, so a region is never written while the GPU
//!   may still read it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use tracing::debug;
use vkframe_rhi::buffer::{Buffer, BufferUsage};
use vkframe_rhi::device::Device;

use super::VulkanBackend;
use crate::MAX_FRAMES_IN_FLIGHT;
use crate::error::{RenderError, RenderResult};
use crate::garbage::GarbageQueue;
use crate::render_state::{BufferUpload, FrameRenderState};
use crate::resource::{BufferBinding, GeometryBuffer, RenderResource};

/// How often the contents of a buffer change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Volatility {
    /// Written rarely, read by vertex input only.
    Static,
    /// Rewritten every frame.
    PerFrame,
    /// Written rarely, also readable and writable by shaders.
    StaticReadWrite,
}

/// Vertex or index input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeometryKind {
    Vertex,
    Index,
}

impl GeometryKind {
    fn name(self) -> &'static str {
        match self {
            GeometryKind::Vertex => "vertex",
            GeometryKind::Index => "index",
        }
    }
}

fn buffer_usage(kind: GeometryKind, volatility: Volatility) -> BufferUsage {
    match (volatility, kind) {
        (Volatility::Static, GeometryKind::Vertex) => BufferUsage::Vertex,
        (Volatility::Static, GeometryKind::Index) => BufferUsage::Index,
        (Volatility::PerFrame, _) => BufferUsage::DynamicGeometry,
        (Volatility::StaticReadWrite, _) => BufferUsage::VertexStorage,
    }
}

fn index_type_for_stride(stride: u32) -> Option<vk::IndexType> {
    match stride {
        2 => Some(vk::IndexType::UINT16),
        4 => Some(vk::IndexType::UINT32),
        _ => None,
    }
}

/// Number of elements in `data`, checked against stride and capacity.
fn element_count(data: &[u8], stride: u32, capacity: u32) -> RenderResult<u32> {
    let stride = stride as usize;
    if data.len() % stride != 0 {
        return Err(RenderError::InvalidData(format!(
            "{} bytes is not a multiple of the {}-byte stride",
            data.len(),
            stride
        )));
    }
    let count = data.len() / stride;
    if count > capacity as usize {
        return Err(RenderError::InvalidData(format!(
            "{} elements exceed the capacity of {}",
            count, capacity
        )));
    }
    Ok(count as u32)
}

struct BufferState {
    buffer: Arc<Buffer>,
    len: u32,
    /// Static: pending copy source.
    staging: Option<Arc<Buffer>>,
    /// Static: set once a copy into `buffer` was queued.
    uploaded: bool,
    /// PerFrame: latest contents.
    contents: Vec<u8>,
    version: u64,
    written: [u64; MAX_FRAMES_IN_FLIGHT],
}

/// Vertex or index buffer drawn by the frame scheduler.
pub struct RenderBuffer {
    device: Arc<Device>,
    garbage: GarbageQueue<VulkanBackend>,
    kind: GeometryKind,
    volatility: Volatility,
    stride: u32,
    capacity: u32,
    index_type: vk::IndexType,
    state: Mutex<BufferState>,
}

impl RenderBuffer {
    /// Creates an empty buffer of `capacity` elements of `stride` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero stride or capacity, an index stride other
    /// than 2 or 4, or if the buffer cannot be allocated.
    pub fn new(
        device: Arc<Device>,
        garbage: GarbageQueue<VulkanBackend>,
        kind: GeometryKind,
        volatility: Volatility,
        stride: u32,
        capacity: u32,
    ) -> RenderResult<Self> {
        if stride == 0 || capacity == 0 {
            return Err(RenderError::InvalidData(format!(
                "{} buffer needs a non-zero stride and capacity",
                kind.name()
            )));
        }
        let index_type = match kind {
            GeometryKind::Vertex => vk::IndexType::UINT32,
            GeometryKind::Index => index_type_for_stride(stride).ok_or_else(|| {
                RenderError::InvalidData(format!("Unsupported index stride {}", stride))
            })?,
        };

        let region = stride as vk::DeviceSize * capacity as vk::DeviceSize;
        let size = match volatility {
            Volatility::PerFrame => region * MAX_FRAMES_IN_FLIGHT as vk::DeviceSize,
            Volatility::Static | Volatility::StaticReadWrite => region,
        };
        let buffer = Buffer::new(
            Arc::clone(&device),
            buffer_usage(kind, volatility),
            size,
        )?;

        debug!(
            "Created {:?} {} buffer: {} x {} bytes",
            volatility,
            kind.name(),
            capacity,
            stride
        );

        Ok(Self {
            device,
            garbage,
            kind,
            volatility,
            stride,
            capacity,
            index_type,
            state: Mutex::new(BufferState {
                buffer: Arc::new(buffer),
                len: 0,
                staging: None,
                uploaded: false,
                contents: Vec::new(),
                version: 0,
                written: [0; MAX_FRAMES_IN_FLIGHT],
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Vertex or index.
    pub fn kind(&self) -> GeometryKind {
        self.kind
    }

    /// Update pattern.
    pub fn volatility(&self) -> Volatility {
        self.volatility
    }

    /// Bytes per element.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Maximum number of elements.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn region_size(&self) -> vk::DeviceSize {
        self.stride as vk::DeviceSize * self.capacity as vk::DeviceSize
    }

    /// Replaces the contents with `data`, a whole number of elements.
    ///
    /// The new contents are visible to draws recorded in the next frame the
    /// buffer takes part in.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not fit or a staging buffer cannot be
    /// allocated.
    pub fn write(&self, data: &[u8]) -> RenderResult<()> {
        let len = element_count(data, self.stride, self.capacity)?;
        let mut state = self.lock();

        match self.volatility {
            Volatility::PerFrame => {
                state.contents.clear();
                state.contents.extend_from_slice(data);
                state.version += 1;
            }
            Volatility::Static | Volatility::StaticReadWrite => {
                if state.uploaded {
                    // Frames in flight may still read the old buffer
                    let fresh = Buffer::new(
                        Arc::clone(&self.device),
                        buffer_usage(self.kind, self.volatility),
                        self.region_size(),
                    )?;
                    let old = std::mem::replace(&mut state.buffer, Arc::new(fresh));
                    self.garbage.dispose("render buffer", move |_| drop(old));
                    state.uploaded = false;
                }
                state.staging = if data.is_empty() {
                    None
                } else {
                    Some(Arc::new(Buffer::new_with_data(
                        Arc::clone(&self.device),
                        BufferUsage::Staging,
                        data,
                    )?))
                };
            }
        }

        state.len = len;
        Ok(())
    }
}

impl RenderResource for RenderBuffer {
    fn on_render(&self, render_state: &mut FrameRenderState) -> RenderResult<()> {
        let mut state = self.lock();

        match self.volatility {
            Volatility::PerFrame => {
                let slot = render_state.slot();
                if state.written[slot] != state.version {
                    let offset = slot as vk::DeviceSize * self.region_size();
                    state.buffer.write_data(offset, &state.contents)?;
                    state.written[slot] = state.version;
                }
            }
            Volatility::Static | Volatility::StaticReadWrite => {
                if let Some(staging) = state.staging.take() {
                    render_state.push_buffer_upload(BufferUpload {
                        src: staging.handle(),
                        dst: state.buffer.handle(),
                        region: vk::BufferCopy {
                            src_offset: 0,
                            dst_offset: 0,
                            size: staging.size(),
                        },
                    });
                    self.garbage
                        .dispose("staging buffer", move |_| drop(staging));
                    state.uploaded = true;
                }
            }
        }
        Ok(())
    }
}

impl GeometryBuffer for RenderBuffer {
    fn binding(&self, slot: usize) -> BufferBinding {
        let offset = match self.volatility {
            Volatility::PerFrame => slot as vk::DeviceSize * self.region_size(),
            Volatility::Static | Volatility::StaticReadWrite => 0,
        };
        BufferBinding {
            buffer: self.lock().buffer.handle(),
            offset,
        }
    }

    fn len(&self) -> u32 {
        self.lock().len
    }

    fn index_type(&self) -> vk::IndexType {
        self.index_type
    }
}

impl Drop for RenderBuffer {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let buffer = Arc::clone(&state.buffer);
        self.garbage.dispose("render buffer", move |_| drop(buffer));
    }
}
