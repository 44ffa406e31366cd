//! wgpu backend for the simulation
//!
//! This module provides `WgpuContext`, which owns the device, queue, the shared
//! full-screen quad and (when a window is attached) the presentation surface.

use std::sync::{Arc, mpsc::channel};

use wgpu::{
    BufferDescriptor, BufferUsages, CommandEncoderDescriptor, Device, ErrorFilter, Extent3d,
    Instance, Queue, Surface, SurfaceConfiguration, TexelCopyBufferInfo, TexelCopyBufferLayout,
    TexelCopyTextureInfo, Texture, TextureDescriptor, TextureFormat, TextureUsages, TextureView,
    TextureViewDescriptor,
    util::{BufferInitDescriptor, DeviceExt},
};
use winit::window::Window;

use crate::{
    error::SimError,
    sim::{GraphicsContext, PixelState, StateFrame},
};

pub mod kernel;

/// Texel format of the state images: one `PixelState` per texel
pub const STATE_FORMAT: TextureFormat = TextureFormat::Rgba32Float;

const PIXEL_BYTES: u32 = std::mem::size_of::<PixelState>() as u32;

/// Usages every state image needs: sampled by one kernel, rendered into by
/// another, uploaded to and read back
pub const STATE_USAGES: TextureUsages = TextureUsages::RENDER_ATTACHMENT
    .union(TextureUsages::TEXTURE_BINDING)
    .union(TextureUsages::COPY_SRC)
    .union(TextureUsages::COPY_DST);

/// Full-screen quad as a triangle strip
const QUAD_VERTICES: [[f32; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [-1.0, 1.0], [1.0, 1.0]];

/// A state image in device memory together with the view used both to
/// sample it and to render into it
pub struct GpuImage {
    texture: Texture,
    view: TextureView,
    width: u32,
    height: u32,
}

impl GpuImage {
    fn extent(&self) -> Extent3d {
        Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }

    fn copy_info(&self) -> TexelCopyTextureInfo<'_> {
        TexelCopyTextureInfo {
            texture: &self.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        }
    }
}

/// The swapchain texture for one displayed frame
pub struct SurfaceFrame {
    texture: wgpu::SurfaceTexture,
    view: TextureView,
}

struct Presentation {
    surface: Surface<'static>,
    config: SurfaceConfiguration,
    window: Arc<Window>,
}

pub struct WgpuContext {
    #[allow(dead_code)]
    instance: Instance, // Keep instance alive for the lifetime of the surface
    device: Device,
    queue: Queue,
    quad: wgpu::Buffer,
    state_usages: TextureUsages,
    presentation: Option<Presentation>,
}

impl WgpuContext {
    /// Create a context that presents to `window`
    pub async fn new(window: Arc<Window>) -> Result<Self, anyhow::Error> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());

        // Create surface first to find compatible adapter
        let surface = instance.create_surface(window.clone())?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: Some(&surface),
            })
            .await?;
        log::info!("Using adapter: {:?}", adapter.get_info());

        let (device, queue) = Self::request_device(&adapter).await?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| anyhow::anyhow!("surface is not compatible with the adapter"))?;
        let config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        Ok(Self::assemble(
            instance,
            &adapter,
            device,
            queue,
            Some(Presentation {
                surface,
                config,
                window,
            }),
        ))
    }

    /// Create a context without a presentation surface, for offscreen use
    pub async fn headless() -> Result<Self, anyhow::Error> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await?;
        let (device, queue) = Self::request_device(&adapter).await?;
        Ok(Self::assemble(instance, &adapter, device, queue, None))
    }

    async fn request_device(adapter: &wgpu::Adapter) -> Result<(Device, Queue), anyhow::Error> {
        let pair = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("statesim device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await?;
        Ok(pair)
    }

    fn assemble(
        instance: Instance,
        adapter: &wgpu::Adapter,
        device: Device,
        queue: Queue,
        presentation: Option<Presentation>,
    ) -> Self {
        let state_usages = adapter
            .get_texture_format_features(STATE_FORMAT)
            .allowed_usages;
        let quad = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("full-screen quad"),
            contents: bytemuck::cast_slice(&QUAD_VERTICES),
            usage: BufferUsages::VERTEX,
        });
        Self {
            instance,
            device,
            queue,
            quad,
            state_usages,
            presentation,
        }
    }

    /// Format of the visible surface, if there is one
    pub fn surface_format(&self) -> Option<TextureFormat> {
        self.presentation.as_ref().map(|p| p.config.format)
    }

    /// Reconfigure the presentation surface after the window changed size.
    /// The state images keep their size.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if let Some(p) = self.presentation.as_mut() {
            p.config.width = width;
            p.config.height = height;
            p.surface.configure(&self.device, &p.config);
        }
    }

    /// Whether the adapter can both sample and render into [`STATE_FORMAT`]
    pub fn supports_state_images(&self) -> bool {
        self.state_usages.contains(STATE_USAGES)
    }

    pub fn request_redraw(&self) {
        if let Some(p) = &self.presentation {
            p.window.request_redraw();
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> &Queue {
        &self.queue
    }

    pub(crate) fn quad(&self) -> &wgpu::Buffer {
        &self.quad
    }

    /// Runs `f` inside out-of-memory and validation error scopes and returns
    /// the first error either scope caught.
    pub(crate) fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        self.device.push_error_scope(ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(out_of_memory))
    }
}

impl GraphicsContext for WgpuContext {
    type Image = GpuImage;
    type Surface = SurfaceFrame;

    fn create_state_image(
        &self,
        label: &str,
        width: u32,
        height: u32,
    ) -> Result<GpuImage, SimError> {
        let usage = STATE_USAGES;
        let allocation_error = |reason: String| SimError::Allocation {
            width,
            height,
            reason,
        };
        if !self.supports_state_images() {
            return Err(allocation_error(format!(
                "{STATE_FORMAT:?} does not support {usage:?} on this adapter"
            )));
        }
        let max = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(allocation_error(format!(
                "size must be between 1 and {max} per side"
            )));
        }

        let (texture, error) = self.scoped(|| {
            self.device.create_texture(&TextureDescriptor {
                label: Some(label),
                size: Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: STATE_FORMAT,
                usage,
                view_formats: &[],
            })
        });
        if let Some(e) = error {
            return Err(allocation_error(e.to_string()));
        }
        let view = texture.create_view(&TextureViewDescriptor::default());
        Ok(GpuImage {
            texture,
            view,
            width,
            height,
        })
    }

    fn write_image(&self, image: &mut GpuImage, pixels: &[PixelState]) -> Result<(), SimError> {
        let expected = image.width as usize * image.height as usize;
        if pixels.len() != expected {
            return Err(SimError::device(
                "state upload",
                format!("expected {expected} pixels, got {}", pixels.len()),
            ));
        }
        let ((), error) = self.scoped(|| {
            self.queue.write_texture(
                image.copy_info(),
                bytemuck::cast_slice(pixels),
                TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(image.width * PIXEL_BYTES),
                    rows_per_image: Some(image.height),
                },
                image.extent(),
            )
        });
        match error {
            Some(e) => Err(SimError::device("state upload", e)),
            None => Ok(()),
        }
    }

    fn read_image(&self, image: &GpuImage) -> Result<StateFrame, SimError> {
        // Rows in the staging buffer must be padded to the copy alignment
        let row_bytes = image.width * PIXEL_BYTES;
        let padded_row_bytes = row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let (staging, error) = self.scoped(|| {
            let staging = self.device.create_buffer(&BufferDescriptor {
                label: Some("state readback buffer"),
                size: padded_row_bytes as u64 * image.height as u64,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&CommandEncoderDescriptor {
                    label: Some("readback encoder"),
                });
            encoder.copy_texture_to_buffer(
                image.copy_info(),
                TexelCopyBufferInfo {
                    buffer: &staging,
                    layout: TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(padded_row_bytes),
                        rows_per_image: Some(image.height),
                    },
                },
                image.extent(),
            );
            self.queue.submit(std::iter::once(encoder.finish()));
            staging
        });
        if let Some(e) = error {
            return Err(SimError::device("readback", e));
        }

        let (tx, rx) = channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| SimError::device("readback", e))?;
        rx.recv()
            .map_err(|e| SimError::device("readback", e))?
            .map_err(|e| SimError::device("readback", e))?;

        let mut pixels = Vec::with_capacity(image.width as usize * image.height as usize);
        {
            let view = staging.slice(..).get_mapped_range();
            for row in view.chunks_exact(padded_row_bytes as usize) {
                pixels.extend(
                    row[..row_bytes as usize]
                        .chunks_exact(PIXEL_BYTES as usize)
                        .map(bytemuck::pod_read_unaligned::<PixelState>),
                );
            }
        }
        staging.unmap();

        Ok(StateFrame {
            width: image.width,
            height: image.height,
            pixels,
        })
    }

    fn acquire_surface(&self) -> Result<SurfaceFrame, SimError> {
        let presentation = self
            .presentation
            .as_ref()
            .ok_or_else(|| SimError::device("surface acquire", "no presentation surface"))?;
        let texture = presentation
            .surface
            .get_current_texture()
            .map_err(|e| SimError::device("surface acquire", e))?;
        let view = texture
            .texture
            .create_view(&TextureViewDescriptor::default());
        Ok(SurfaceFrame { texture, view })
    }

    fn present(&self, surface: SurfaceFrame) {
        if let Some(p) = &self.presentation {
            p.window.pre_present_notify();
        }
        surface.texture.present();
    }
}
