//! Host-fed media textures: audio analysis, webcam, and video frames.
//!
//! The engine never captures media itself; the host pushes decoded frames
//! and audio analysis data here, and channel resolution binds the backing
//! textures. Channels referencing media that has not produced data yet fall
//! back to the shared placeholder.

use std::collections::HashMap;

use crate::context::GpuContext;

pub const AUDIO_TEXTURE_WIDTH: u32 = 512;
/// Row 0 holds the frequency spectrum, row 1 the waveform.
pub const AUDIO_TEXTURE_HEIGHT: u32 = 2;

#[derive(Debug)]
pub struct MediaTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    ready: bool,
}

impl MediaTexture {
    fn new(device: &wgpu::Device, label: &str, width: u32, height: u32, format: wgpu::TextureFormat) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
            ready: false,
        }
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn resolution(&self) -> [f32; 4] {
        [self.width as f32, self.height as f32, 1.0, 0.0]
    }

    fn write(&mut self, queue: &wgpu::Queue, data: &[u8], bytes_per_pixel: u32) {
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.width * bytes_per_pixel),
                rows_per_image: Some(self.height),
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        self.ready = true;
    }
}

/// Owns every media texture the host can feed.
#[derive(Debug)]
pub struct MediaHub {
    audio: MediaTexture,
    webcam: Option<MediaTexture>,
    videos: HashMap<String, MediaTexture>,
}

impl MediaHub {
    pub fn new(device: &wgpu::Device) -> Self {
        Self {
            audio: MediaTexture::new(
                device,
                "media-audio",
                AUDIO_TEXTURE_WIDTH,
                AUDIO_TEXTURE_HEIGHT,
                wgpu::TextureFormat::R8Unorm,
            ),
            webcam: None,
            videos: HashMap::new(),
        }
    }

    /// Uploads one frame of audio analysis. Both slices must have exactly
    /// [`AUDIO_TEXTURE_WIDTH`] bins; anything else is rejected with a
    /// warning.
    pub fn push_audio(&mut self, queue: &wgpu::Queue, spectrum: &[u8], waveform: &[u8]) {
        let width = AUDIO_TEXTURE_WIDTH as usize;
        if spectrum.len() != width || waveform.len() != width {
            tracing::warn!(
                spectrum = spectrum.len(),
                waveform = waveform.len(),
                expected = width,
                "audio data has the wrong bin count, frame dropped"
            );
            return;
        }
        let mut rows = Vec::with_capacity(width * 2);
        rows.extend_from_slice(spectrum);
        rows.extend_from_slice(waveform);
        self.audio.write(queue, &rows, 1);
    }

    /// Uploads one RGBA webcam frame, recreating the texture when the frame
    /// size changes.
    pub fn push_webcam_frame(
        &mut self,
        gpu: &GpuContext,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) {
        if rgba.len() != (width * height * 4) as usize {
            tracing::warn!(
                len = rgba.len(),
                width,
                height,
                "webcam frame size mismatch, frame dropped"
            );
            return;
        }
        let recreate = self
            .webcam
            .as_ref()
            .map(|t| t.width != width || t.height != height)
            .unwrap_or(true);
        if recreate {
            self.webcam = Some(MediaTexture::new(
                &gpu.device,
                "media-webcam",
                width,
                height,
                wgpu::TextureFormat::Rgba8Unorm,
            ));
        }
        if let Some(webcam) = &mut self.webcam {
            webcam.write(&gpu.queue, rgba, 4);
        }
    }

    /// Uploads one RGBA frame of the named video stream.
    pub fn push_video_frame(
        &mut self,
        gpu: &GpuContext,
        name: &str,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) {
        if rgba.len() != (width * height * 4) as usize {
            tracing::warn!(
                name,
                len = rgba.len(),
                width,
                height,
                "video frame size mismatch, frame dropped"
            );
            return;
        }
        let recreate = self
            .videos
            .get(name)
            .map(|t| t.width != width || t.height != height)
            .unwrap_or(true);
        if recreate {
            self.videos.insert(
                name.to_string(),
                MediaTexture::new(
                    &gpu.device,
                    &format!("media-video-{name}"),
                    width,
                    height,
                    wgpu::TextureFormat::Rgba8Unorm,
                ),
            );
        }
        if let Some(video) = self.videos.get_mut(name) {
            video.write(&gpu.queue, rgba, 4);
        }
    }

    pub fn audio(&self) -> &MediaTexture {
        &self.audio
    }

    pub fn webcam(&self) -> Option<&MediaTexture> {
        self.webcam.as_ref().filter(|t| t.ready)
    }

    pub fn video(&self, name: &str) -> Option<&MediaTexture> {
        self.videos.get(name).filter(|t| t.ready)
    }
}
