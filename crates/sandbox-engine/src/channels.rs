//! Channel sources and their backing textures.
//!
//! Everything a pass can sample that is not another pass lives here: the
//! shared black placeholder, the keyboard lookup texture, images decoded
//! from disk, and host-scriptable textures. Resolution never fails; a
//! source whose resource is missing or still loading binds the placeholder
//! so the render loop keeps producing frames.

use std::collections::HashMap;
use std::path::PathBuf;

use crossbeam_channel::{Receiver, TryRecvError};
use wgpu::util::DeviceExt;

use sandbox_project::{
    ChannelSource, ExternalTextureDecl, TextureFilter, TextureKind, TextureWrap,
};

use crate::context::GpuContext;
use crate::media::MediaHub;

pub const KEYBOARD_TEXTURE_WIDTH: u32 = 256;
pub const KEYBOARD_TEXTURE_HEIGHT: u32 = 3;

/// A channel resolved to concrete bindings for one frame.
///
/// `resolution` is the vec4 written into `iChannelResolution`; unbound
/// channels report zero so shaders can probe for them.
pub struct ResolvedChannel<'a> {
    pub view: &'a wgpu::TextureView,
    pub sampler: &'a wgpu::Sampler,
    pub resolution: [f32; 4],
}

/// CPU mirror of the keyboard lookup texture.
///
/// Row 0 tracks held keys, row 1 keys pressed since the previous frame,
/// row 2 per-key toggle state.
#[derive(Debug, Clone)]
pub struct KeyState {
    rows: [[u8; KEYBOARD_TEXTURE_WIDTH as usize]; KEYBOARD_TEXTURE_HEIGHT as usize],
}

impl KeyState {
    fn new() -> Self {
        Self {
            rows: [[0; KEYBOARD_TEXTURE_WIDTH as usize]; KEYBOARD_TEXTURE_HEIGHT as usize],
        }
    }

    fn press(&mut self, code: u8) {
        let index = code as usize;
        // Key repeat while held must not re-fire the press row or toggle.
        if self.rows[0][index] == 0 {
            self.rows[1][index] = 255;
            self.rows[2][index] ^= 255;
        }
        self.rows[0][index] = 255;
    }

    fn release(&mut self, code: u8) {
        self.rows[0][code as usize] = 0;
    }

    /// Returns true when any key was in the pressed row, meaning the
    /// cleared row still needs one more upload.
    fn clear_pressed(&mut self) -> bool {
        let had_pressed = self.rows[1].iter().any(|&v| v != 0);
        self.rows[1] = [0; KEYBOARD_TEXTURE_WIDTH as usize];
        had_pressed
    }

    fn held(&self, code: u8) -> bool {
        self.rows[0][code as usize] != 0
    }

    fn texels(&self) -> Vec<u8> {
        let mut texels =
            vec![0u8; (KEYBOARD_TEXTURE_WIDTH * KEYBOARD_TEXTURE_HEIGHT * 4) as usize];
        for (row_index, row) in self.rows.iter().enumerate() {
            for (column, &value) in row.iter().enumerate() {
                let base = (row_index * KEYBOARD_TEXTURE_WIDTH as usize + column) * 4;
                texels[base..base + 4].fill(value);
            }
        }
        texels
    }
}

/// Keyboard state plus the 256x3 texture shaders sample through the
/// generated `keyDown`/`keyToggle` helpers.
#[derive(Debug)]
pub struct KeyboardTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    state: KeyState,
    dirty: bool,
}

impl KeyboardTexture {
    fn new(device: &wgpu::Device) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("keyboard"),
            size: wgpu::Extent3d {
                width: KEYBOARD_TEXTURE_WIDTH,
                height: KEYBOARD_TEXTURE_HEIGHT,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            state: KeyState::new(),
            dirty: true,
        }
    }

    pub fn key_down(&mut self, code: u8) {
        self.state.press(code);
        self.dirty = true;
    }

    pub fn key_up(&mut self, code: u8) {
        self.state.release(code);
        self.dirty = true;
    }

    /// Uploads pending state and clears the pressed-this-frame row for the
    /// next frame.
    pub fn end_frame(&mut self, queue: &wgpu::Queue) {
        if !self.dirty {
            return;
        }
        let texels = self.state.texels();
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &texels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(KEYBOARD_TEXTURE_WIDTH * 4),
                rows_per_image: Some(KEYBOARD_TEXTURE_HEIGHT),
            },
            wgpu::Extent3d {
                width: KEYBOARD_TEXTURE_WIDTH,
                height: KEYBOARD_TEXTURE_HEIGHT,
                depth_or_array_layers: 1,
            },
        );
        self.dirty = self.state.clear_pressed();
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }
}

struct DecodedImage {
    name: String,
    result: Result<(u32, u32, Vec<u8>), String>,
}

#[derive(Debug)]
struct ExternalTexture {
    view: Option<wgpu::TextureView>,
    resolution: [f32; 4],
    filter: TextureFilter,
    wrap: TextureWrap,
    kind: TextureKind,
}

#[derive(Debug)]
struct ScriptTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
}

/// Owns every non-pass channel resource and resolves channel sources to
/// concrete views each frame.
#[derive(Debug)]
pub struct ChannelBank {
    placeholder_view: wgpu::TextureView,
    samplers: HashMap<(TextureFilter, TextureWrap), wgpu::Sampler>,
    keyboard: KeyboardTexture,
    externals: HashMap<String, ExternalTexture>,
    scripts: HashMap<String, ScriptTexture>,
    // Dropping the receiver on disposal lets in-flight decodes finish into
    // a closed channel and vanish.
    decoded: Option<Receiver<DecodedImage>>,
}

impl ChannelBank {
    pub fn new(gpu: &GpuContext, textures: &[ExternalTextureDecl]) -> Self {
        let placeholder = gpu.device.create_texture_with_data(
            &gpu.queue,
            &wgpu::TextureDescriptor {
                label: Some("channel-placeholder"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            &[0, 0, 0, 255],
        );

        let mut samplers = HashMap::new();
        for filter in [TextureFilter::Linear, TextureFilter::Nearest] {
            for wrap in [TextureWrap::Clamp, TextureWrap::Repeat] {
                samplers.insert((filter, wrap), create_sampler(&gpu.device, filter, wrap));
            }
        }

        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut externals = HashMap::new();
        for decl in textures {
            externals.insert(
                decl.name.clone(),
                ExternalTexture {
                    view: None,
                    // Declared textures report 1x1 until the decode lands.
                    resolution: [1.0, 1.0, 1.0, 0.0],
                    filter: decl.filter,
                    wrap: decl.wrap,
                    kind: decl.kind,
                },
            );
            let name = decl.name.clone();
            let path = PathBuf::from(&decl.path);
            let sender = sender.clone();
            // Decode off-thread; the render loop polls for completions.
            std::thread::spawn(move || {
                let result = image::open(&path)
                    .map(|img| {
                        let rgba = img.to_rgba8();
                        let (width, height) = rgba.dimensions();
                        (width, height, rgba.into_raw())
                    })
                    .map_err(|err| err.to_string());
                let _ = sender.send(DecodedImage { name, result });
            });
        }

        Self {
            placeholder_view: placeholder.create_view(&wgpu::TextureViewDescriptor::default()),
            samplers,
            keyboard: KeyboardTexture::new(&gpu.device),
            externals,
            scripts: HashMap::new(),
            decoded: Some(receiver),
        }
    }

    /// Drains finished image decodes into GPU textures. Returns true when
    /// any channel's backing changed, so callers can rebind.
    pub fn poll_decodes(&mut self, gpu: &GpuContext) -> bool {
        let Some(receiver) = &self.decoded else {
            return false;
        };
        let mut changed = false;
        loop {
            match receiver.try_recv() {
                Ok(DecodedImage { name, result }) => {
                    let Some(entry) = self.externals.get_mut(&name) else {
                        continue;
                    };
                    match result {
                        Ok((width, height, rgba)) => {
                            let texture = gpu.device.create_texture_with_data(
                                &gpu.queue,
                                &wgpu::TextureDescriptor {
                                    label: Some(&format!("texture-{name}")),
                                    size: wgpu::Extent3d {
                                        width,
                                        height,
                                        depth_or_array_layers: 1,
                                    },
                                    mip_level_count: 1,
                                    sample_count: 1,
                                    dimension: wgpu::TextureDimension::D2,
                                    format: wgpu::TextureFormat::Rgba8Unorm,
                                    usage: wgpu::TextureUsages::TEXTURE_BINDING,
                                    view_formats: &[],
                                },
                                wgpu::util::TextureDataOrder::LayerMajor,
                                &rgba,
                            );
                            entry.view =
                                Some(texture.create_view(&wgpu::TextureViewDescriptor::default()));
                            entry.resolution = [width as f32, height as f32, 1.0, 0.0];
                            changed = true;
                            tracing::debug!(name, width, height, "external texture ready");
                        }
                        Err(message) => {
                            tracing::warn!(name, %message, "failed to decode texture, using placeholder");
                        }
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        changed
    }

    /// Creates or updates a host-scriptable RGBA8 texture.
    pub fn update_script_texture(
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
                "script texture data size mismatch, update dropped"
            );
            return;
        }
        self.write_script_texture(gpu, name, width, height, wgpu::TextureFormat::Rgba8Unorm, rgba);
    }

    /// Float variant of [`update_script_texture`](Self::update_script_texture)
    /// for full-precision data.
    pub fn update_script_texture_float(
        &mut self,
        gpu: &GpuContext,
        name: &str,
        width: u32,
        height: u32,
        rgba: &[f32],
    ) {
        if rgba.len() != (width * height * 4) as usize {
            tracing::warn!(
                name,
                len = rgba.len(),
                width,
                height,
                "script texture data size mismatch, update dropped"
            );
            return;
        }
        self.write_script_texture(
            gpu,
            name,
            width,
            height,
            wgpu::TextureFormat::Rgba32Float,
            bytemuck::cast_slice(rgba),
        );
    }

    fn write_script_texture(
        &mut self,
        gpu: &GpuContext,
        name: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        bytes: &[u8],
    ) {
        // Same-size same-format updates reuse the texture.
        let recreate = self
            .scripts
            .get(name)
            .map(|t| t.width != width || t.height != height || t.format != format)
            .unwrap_or(true);
        if recreate {
            let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&format!("script-{name}")),
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
            self.scripts.insert(
                name.to_string(),
                ScriptTexture {
                    texture,
                    view,
                    width,
                    height,
                    format,
                },
            );
        }
        let script = &self.scripts[name];
        let bytes_per_pixel = (bytes.len() / (width as usize * height as usize)) as u32;
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &script.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * bytes_per_pixel),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    pub fn keyboard_mut(&mut self) -> &mut KeyboardTexture {
        &mut self.keyboard
    }

    pub fn keyboard(&self) -> &KeyboardTexture {
        &self.keyboard
    }

    /// Whether a declared external texture should get the cubemap direction
    /// rewrite.
    pub fn is_equirect(&self, name: &str) -> bool {
        self.externals
            .get(name)
            .map(|t| t.kind == TextureKind::Equirect)
            .unwrap_or(false)
    }

    /// The black fallback binding. Resolution reads zero so shaders can
    /// distinguish an unbound channel from real 1x1 content.
    pub fn placeholder(&self) -> ResolvedChannel<'_> {
        ResolvedChannel {
            view: &self.placeholder_view,
            sampler: self.default_sampler(),
            resolution: [0.0; 4],
        }
    }

    fn default_sampler(&self) -> &wgpu::Sampler {
        &self.samplers[&(TextureFilter::Linear, TextureWrap::Clamp)]
    }

    /// Resolves a non-buffer channel source. Buffer sources are wired by
    /// the pass graph, which owns the ping-pong targets.
    pub fn resolve<'a>(
        &'a self,
        media: &'a MediaHub,
        source: &ChannelSource,
    ) -> ResolvedChannel<'a> {
        match source {
            ChannelSource::None | ChannelSource::Buffer { .. } => self.placeholder(),
            ChannelSource::Texture { name } => match self.externals.get(name) {
                Some(ExternalTexture {
                    view: Some(view),
                    resolution,
                    filter,
                    wrap,
                    ..
                }) => ResolvedChannel {
                    view,
                    sampler: &self.samplers[&(*filter, *wrap)],
                    resolution: *resolution,
                },
                // Declared but still decoding: black content, 1x1 reported.
                Some(ExternalTexture { resolution, .. }) => ResolvedChannel {
                    view: &self.placeholder_view,
                    sampler: self.default_sampler(),
                    resolution: *resolution,
                },
                None => self.placeholder(),
            },
            ChannelSource::Keyboard => ResolvedChannel {
                view: self.keyboard.view(),
                sampler: &self.samplers[&(TextureFilter::Nearest, TextureWrap::Clamp)],
                resolution: [
                    KEYBOARD_TEXTURE_WIDTH as f32,
                    KEYBOARD_TEXTURE_HEIGHT as f32,
                    1.0,
                    0.0,
                ],
            },
            ChannelSource::Audio => ResolvedChannel {
                view: media.audio().view(),
                sampler: self.default_sampler(),
                resolution: media.audio().resolution(),
            },
            ChannelSource::Webcam => match media.webcam() {
                Some(webcam) => ResolvedChannel {
                    view: webcam.view(),
                    sampler: self.default_sampler(),
                    resolution: webcam.resolution(),
                },
                None => self.placeholder(),
            },
            ChannelSource::Video { src } => match media.video(src) {
                Some(video) => ResolvedChannel {
                    view: video.view(),
                    sampler: self.default_sampler(),
                    resolution: video.resolution(),
                },
                None => self.placeholder(),
            },
            ChannelSource::Script { name } => match self.scripts.get(name) {
                Some(script) => ResolvedChannel {
                    view: &script.view,
                    sampler: self.default_sampler(),
                    resolution: [script.width as f32, script.height as f32, 1.0, 0.0],
                },
                None => self.placeholder(),
            },
        }
    }

    /// Severs the decode channel so late completions go nowhere.
    pub fn dispose(&mut self) {
        self.decoded = None;
    }
}

fn create_sampler(
    device: &wgpu::Device,
    filter: TextureFilter,
    wrap: TextureWrap,
) -> wgpu::Sampler {
    let filter_mode = match filter {
        TextureFilter::Linear => wgpu::FilterMode::Linear,
        TextureFilter::Nearest => wgpu::FilterMode::Nearest,
    };
    let address_mode = match wrap {
        TextureWrap::Clamp => wgpu::AddressMode::ClampToEdge,
        TextureWrap::Repeat => wgpu::AddressMode::Repeat,
    };
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("channel-sampler"),
        address_mode_u: address_mode,
        address_mode_v: address_mode,
        address_mode_w: address_mode,
        mag_filter: filter_mode,
        min_filter: filter_mode,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_flips_once_per_press() {
        let mut state = KeyState::new();
        state.press(65);
        assert!(state.held(65));
        assert_eq!(state.rows[1][65], 255);
        assert_eq!(state.rows[2][65], 255);

        // Key repeat while held does not re-toggle.
        state.press(65);
        assert_eq!(state.rows[2][65], 255);

        state.release(65);
        state.press(65);
        assert_eq!(state.rows[2][65], 0);
    }

    #[test]
    fn pressed_row_clears_once() {
        let mut state = KeyState::new();
        state.press(32);
        assert!(state.clear_pressed());
        assert!(!state.clear_pressed());
        assert!(state.held(32));
    }

    #[test]
    fn texels_replicate_rows_across_components() {
        let mut state = KeyState::new();
        state.press(3);
        let texels = state.texels();
        let base = 3 * 4;
        assert_eq!(&texels[base..base + 4], &[255; 4]);
        let row1_base = (KEYBOARD_TEXTURE_WIDTH as usize + 3) * 4;
        assert_eq!(&texels[row1_base..row1_base + 4], &[255; 4]);
    }
}
