//! The pass graph: per-pass pipelines, ping-pong targets, and the frame
//! loop.
//!
//! Buffer passes render before the image pass every frame. Each pass owns a
//! pair of float render targets; during a frame every pass draws into its
//! write target while readers sample the other one, and all pairs swap once
//! the frame's submission is recorded. A pass sampling itself therefore
//! always sees its own previous frame, and a pass sampling another buffer
//! sees that buffer's previous frame unless the channel opts into the
//! current one.

use std::collections::{BTreeMap, HashMap};

use bytemuck::{Pod, Zeroable};
use chrono::{Datelike, Timelike};
use thiserror::Error;
use wgpu::util::DeviceExt;

use sandbox_project::{
    ChannelSource, PassConfig, PassName, Project, CHANNEL_SLOTS,
};

use crate::channels::{ChannelBank, ResolvedChannel};
use crate::compile::{build_pass_pipeline, create_vertex_module, PassError};
use crate::context::{GpuContext, PASS_TEXTURE_FORMAT};
use crate::media::MediaHub;
use crate::pack::padded_byte_size;
use crate::source::{
    build, ChannelMode, NamedInput, SourceMap, SourceRequest, UboDecl, UBO_BINDING_BASE,
};
use crate::store::{UniformStore, UniformValue};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("project must declare an Image pass")]
    MissingImagePass,

    #[error("no pass named '{0}' is configured")]
    UnknownPass(PassName),

    #[error("{0}")]
    Capability(String),

    #[error("pixel readback failed: {0}")]
    Readback(String),

    #[error(transparent)]
    Compile(#[from] PassError),

    #[error(transparent)]
    Gpu(#[from] anyhow::Error),
}

/// Per-frame built-in uniform data, laid out to match the generated
/// `FrameParams` std140 block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameParams {
    resolution: [f32; 4],
    time: f32,
    time_delta: f32,
    frame: i32,
    frame_rate: f32,
    mouse: [f32; 4],
    date: [f32; 4],
    mouse_pressed: f32,
    touch_count: f32,
    pinch: f32,
    pinch_delta: f32,
    pinch_center: [f32; 2],
    _pad0: [f32; 2],
    touches: [[f32; 4]; 3],
    channel_resolution: [[f32; 4]; 4],
}

const FRAME_PARAMS_SIZE: u64 = std::mem::size_of::<FrameParams>() as u64;

/// Pointer-style input state fed by the host between frames.
#[derive(Debug, Clone, Copy)]
struct InputState {
    mouse: [f32; 4],
    mouse_pressed: bool,
    touches: [[f32; 4]; 3],
    touch_count: u32,
    pinch: f32,
    pinch_delta: f32,
    pinch_center: [f32; 2],
}

impl Default for InputState {
    fn default() -> Self {
        Self {
            mouse: [0.0; 4],
            mouse_pressed: false,
            touches: [[0.0; 4]; 3],
            touch_count: 0,
            pinch: 0.0,
            pinch_delta: 0.0,
            pinch_center: [0.0; 2],
        }
    }
}

/// Mouse and size state of one peer view, for multi-view cross-wiring.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerState {
    pub mouse: [f32; 4],
    pub resolution: [f32; 3],
    pub mouse_pressed: bool,
}

#[derive(Debug)]
struct PingPong {
    textures: [wgpu::Texture; 2],
    views: [wgpu::TextureView; 2],
    write: usize,
}

impl PingPong {
    fn new(device: &wgpu::Device, label: &str, width: u32, height: u32) -> Self {
        let make = |slot: usize| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&format!("{label}-{slot}")),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: PASS_TEXTURE_FORMAT,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            })
        };
        let textures = [make(0), make(1)];
        let views = [
            textures[0].create_view(&wgpu::TextureViewDescriptor::default()),
            textures[1].create_view(&wgpu::TextureViewDescriptor::default()),
        ];
        Self {
            textures,
            views,
            write: 0,
        }
    }

    fn write_view(&self) -> &wgpu::TextureView {
        &self.views[self.write]
    }

    /// The previous frame's completed output.
    fn read_view(&self) -> &wgpu::TextureView {
        &self.views[1 - self.write]
    }

    fn read_texture(&self) -> &wgpu::Texture {
        &self.textures[1 - self.write]
    }

    fn swap(&mut self) {
        self.write = 1 - self.write;
    }
}

#[derive(Debug)]
struct PassRuntime {
    name: PassName,
    config: PassConfig,
    mode: ChannelMode,
    map: SourceMap,
    pipeline: Option<wgpu::RenderPipeline>,
    targets: PingPong,
    error: Option<PassError>,
}

impl PassRuntime {
    fn channel_sources(&self) -> Vec<ChannelSource> {
        if self.config.uses_named_samplers() {
            self.config
                .named_samplers
                .iter()
                .map(|sampler| sampler.source.clone())
                .collect()
        } else {
            self.config.channels.to_vec()
        }
    }
}

/// Owns the whole render state for one project.
#[derive(Debug)]
pub struct Engine {
    gpu: GpuContext,
    project: Project,
    width: u32,
    height: u32,
    store: UniformStore,
    bank: ChannelBank,
    media: MediaHub,
    input: InputState,
    peers: Vec<PeerState>,

    vertex_module: wgpu::ShaderModule,
    group0_layout: wgpu::BindGroupLayout,
    group0: wgpu::BindGroup,
    channel_layouts: HashMap<usize, wgpu::BindGroupLayout>,
    frame_buffer: wgpu::Buffer,
    custom_buffer: Option<wgpu::Buffer>,
    peer_buffer: Option<wgpu::Buffer>,
    ubo_buffers: BTreeMap<String, wgpu::Buffer>,

    passes: BTreeMap<PassName, PassRuntime>,

    prev_time: Option<f32>,
    time: f32,
    time_delta: f32,
    frame: i32,
    frame_rate: f32,
    disposed: bool,
}

impl Engine {
    /// Builds the full pass graph for `project` at the given target size.
    ///
    /// Structural problems (no image pass) fail before any GPU work.
    /// Shader compilation failures do not fail construction; they are
    /// recorded per pass and the failing pass is skipped until a recompile
    /// succeeds.
    pub fn new(project: Project, width: u32, height: u32) -> Result<Self, EngineError> {
        let issues = project.validate();
        if issues
            .iter()
            .any(|issue| issue.contains("must declare an Image pass"))
        {
            return Err(EngineError::MissingImagePass);
        }
        for issue in &issues {
            tracing::warn!(issue, "project configuration issue");
        }

        let gpu = GpuContext::new()?;
        let store = UniformStore::from_decls(&project.uniforms);
        let bank = ChannelBank::new(&gpu, &project.textures);
        let media = MediaHub::new(&gpu.device);

        let ubo_limit = gpu.device.limits().max_uniform_buffers_per_shader_stage as usize;
        let ubo_count = store.arrays().count();
        if UBO_BINDING_BASE as usize + ubo_count > ubo_limit {
            return Err(EngineError::Capability(format!(
                "project declares {ubo_count} array uniforms but the device supports at most {} uniform buffers per stage",
                ubo_limit
            )));
        }

        let vertex_module = create_vertex_module(&gpu.device);

        let frame_buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame-params"),
            size: FRAME_PARAMS_SIZE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let custom_buffer = (!store.layout().is_empty()).then(|| {
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("custom-params"),
                size: (store.layout().size_floats() * 4) as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        let peer_buffer = (!project.views.is_empty()).then(|| {
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("view-peers"),
                size: (project.views.len() * 2 * 16) as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        let ubo_buffers: BTreeMap<String, wgpu::Buffer> = store
            .arrays()
            .map(|(name, array)| {
                let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("uniform-array-{name}")),
                    size: padded_byte_size(array.element_type(), array.capacity()),
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                (name.to_string(), buffer)
            })
            .collect();

        let group0_layout = create_group0_layout(
            &gpu.device,
            custom_buffer.is_some(),
            peer_buffer.is_some(),
            ubo_buffers.len(),
        );
        let group0 = create_group0(
            &gpu.device,
            &group0_layout,
            &frame_buffer,
            custom_buffer.as_ref(),
            peer_buffer.as_ref(),
            &ubo_buffers,
        );

        let mut engine = Self {
            peers: vec![PeerState::default(); project.views.len()],
            gpu,
            project,
            width,
            height,
            store,
            bank,
            media,
            input: InputState::default(),
            vertex_module,
            group0_layout,
            group0,
            channel_layouts: HashMap::new(),
            frame_buffer,
            custom_buffer,
            peer_buffer,
            ubo_buffers,
            passes: BTreeMap::new(),
            prev_time: None,
            time: 0.0,
            time_delta: 0.0,
            frame: 0,
            frame_rate: 0.0,
            disposed: false,
        };

        let configs: Vec<(PassName, PassConfig)> = engine
            .project
            .passes
            .iter()
            .map(|(name, config)| (*name, config.clone()))
            .collect();
        for (name, config) in configs {
            let runtime = engine.build_pass(name, config);
            engine.passes.insert(name, runtime);
        }
        Ok(engine)
    }

    fn build_pass(&mut self, name: PassName, config: PassConfig) -> PassRuntime {
        let mode = self.channel_mode(&config);
        for (slot, source) in config.channels.iter().enumerate() {
            if let ChannelSource::Buffer {
                name: target,
                use_current: true,
            } = source
            {
                if *target == name {
                    tracing::warn!(
                        pass = %name,
                        slot,
                        "a pass cannot sample its own current-frame output; using the previous frame"
                    );
                }
            }
        }

        let assembled = self.assemble_source(&config, &mode);
        let pair_count = match &mode {
            ChannelMode::Indexed { .. } => CHANNEL_SLOTS,
            ChannelMode::Named(inputs) => inputs.len(),
        };
        let group1_layout = self.channel_layout(pair_count);
        let pipeline_layout = self
            .gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{name}-layout")),
                bind_group_layouts: &[&self.group0_layout, &group1_layout],
                push_constant_ranges: &[],
            });

        let (pipeline, error) = match build_pass_pipeline(
            &self.gpu.device,
            name.label(),
            &pipeline_layout,
            &self.vertex_module,
            &assembled.text,
            &assembled.map,
            PASS_TEXTURE_FORMAT,
        ) {
            Ok(pipeline) => (Some(pipeline), None),
            Err(error) => {
                tracing::warn!(pass = %name, %error, "shader compilation failed");
                (None, Some(error))
            }
        };

        PassRuntime {
            name,
            config,
            mode,
            map: assembled.map,
            pipeline,
            targets: PingPong::new(&self.gpu.device, name.label(), self.width, self.height),
            error,
        }
    }

    fn channel_mode(&self, config: &PassConfig) -> ChannelMode {
        if config.uses_named_samplers() {
            ChannelMode::Named(
                config
                    .named_samplers
                    .iter()
                    .enumerate()
                    .map(|(slot, sampler)| NamedInput {
                        name: sampler.name.clone(),
                        slot,
                        cubemap: self.source_is_equirect(&sampler.source),
                    })
                    .collect(),
            )
        } else {
            let mut cubemap = [false; CHANNEL_SLOTS];
            for (slot, source) in config.channels.iter().enumerate() {
                cubemap[slot] = self.source_is_equirect(source);
            }
            ChannelMode::Indexed { cubemap }
        }
    }

    fn source_is_equirect(&self, source: &ChannelSource) -> bool {
        matches!(source, ChannelSource::Texture { name } if self.bank.is_equirect(name))
    }

    fn assemble_source(&self, config: &PassConfig, mode: &ChannelMode) -> crate::source::BuiltSource {
        let ubos: Vec<UboDecl> = self
            .store
            .arrays()
            .enumerate()
            .map(|(index, (name, array))| UboDecl {
                name: name.to_string(),
                ty: array.element_type(),
                count: array.capacity(),
                binding: UBO_BINDING_BASE + index as u32,
            })
            .collect();
        build(&SourceRequest {
            user_source: &config.source,
            common: self.project.common.as_deref(),
            mode,
            scalars: self.store.layout(),
            ubos: &ubos,
            peers: &self.project.views,
        })
    }

    fn channel_layout(&mut self, pairs: usize) -> wgpu::BindGroupLayout {
        if let Some(layout) = self.channel_layouts.get(&pairs) {
            return layout.clone();
        }
        let mut entries = Vec::with_capacity(pairs * 2);
        for pair in 0..pairs {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: (pair * 2) as u32,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: (pair * 2 + 1) as u32,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }
        let layout = self
            .gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("channel-layout"),
                entries: &entries,
            });
        self.channel_layouts.insert(pairs, layout.clone());
        layout
    }

    /// Renders one frame at the caller-supplied playback time: buffer
    /// passes in order, then the image pass.
    ///
    /// Never fails; a pass without a working pipeline is skipped and its
    /// target keeps its previous content.
    pub fn step(&mut self, time_seconds: f32) {
        if self.disposed {
            tracing::warn!("step called on a disposed engine");
            return;
        }

        self.bank.poll_decodes(&self.gpu);
        self.advance_clock(time_seconds);
        self.upload_uniforms();
        self.bank.keyboard_mut().end_frame(&self.gpu.queue);

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame"),
            });

        let order: Vec<PassName> = self.passes.keys().copied().collect();
        let mut completed: Vec<PassName> = Vec::new();
        for name in order {
            if self.encode_pass(&mut encoder, name, &completed) {
                completed.push(name);
            }
        }

        self.gpu.queue.submit(Some(encoder.finish()));

        // Only executed passes swap; a skipped pass keeps presenting its
        // last completed frame.
        for name in &completed {
            if let Some(pass) = self.passes.get_mut(name) {
                pass.targets.swap();
            }
        }
        self.store.clear_dirty();
        self.frame += 1;
    }

    /// Returns false when the pass has no working pipeline and was skipped.
    fn encode_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        name: PassName,
        completed: &[PassName],
    ) -> bool {
        let Some(pass) = self.passes.get(&name) else {
            return false;
        };
        if pass.pipeline.is_none() {
            return false;
        }

        let sources = pass.channel_sources();
        let mut resolutions = [[0.0f32; 4]; CHANNEL_SLOTS];
        let mut entries: Vec<(u32, ResolvedChannel<'_>)> = Vec::new();
        for (slot, source) in sources.iter().enumerate().take(CHANNEL_SLOTS) {
            let resolved = self.resolve_channel(name, source, completed);
            resolutions[slot] = resolved.resolution;
            entries.push((slot as u32, resolved));
        }
        // Indexed mode binds all four pairs; pad unused slots with the
        // placeholder so the bind group matches its layout.
        let pair_count = match &pass.mode {
            ChannelMode::Indexed { .. } => CHANNEL_SLOTS,
            ChannelMode::Named(inputs) => inputs.len(),
        };
        while entries.len() < pair_count {
            entries.push((entries.len() as u32, self.bank.placeholder()));
        }

        let mut bind_entries = Vec::with_capacity(pair_count * 2);
        for (slot, resolved) in &entries {
            bind_entries.push(wgpu::BindGroupEntry {
                binding: slot * 2,
                resource: wgpu::BindingResource::TextureView(resolved.view),
            });
            bind_entries.push(wgpu::BindGroupEntry {
                binding: slot * 2 + 1,
                resource: wgpu::BindingResource::Sampler(resolved.sampler),
            });
        }
        let layout = self.channel_layouts[&pair_count].clone();
        let group1 = self
            .gpu
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("{name}-channels")),
                layout: &layout,
                entries: &bind_entries,
            });

        let params = self.frame_params(resolutions);
        let staging = self
            .gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{name}-frame-staging")),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::COPY_SRC,
            });
        encoder.copy_buffer_to_buffer(&staging, 0, &self.frame_buffer, 0, FRAME_PARAMS_SIZE);

        let pass = &self.passes[&name];
        let Some(pipeline) = pass.pipeline.as_ref() else {
            return false;
        };
        let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(name.label()),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: pass.targets.write_view(),
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        rpass.set_pipeline(pipeline);
        rpass.set_bind_group(0, &self.group0, &[]);
        rpass.set_bind_group(1, &group1, &[]);
        rpass.draw(0..3, 0..1);
        true
    }

    fn resolve_channel<'a>(
        &'a self,
        pass: PassName,
        source: &ChannelSource,
        completed: &[PassName],
    ) -> ResolvedChannel<'a> {
        if let ChannelSource::Buffer { name, use_current } = source {
            let Some(producer) = self.passes.get(name) else {
                return self.bank.placeholder();
            };
            // Self-sampling always reads the previous frame; the write
            // target cannot also be bound for sampling.
            let view = if *use_current && *name != pass && completed.contains(name) {
                producer.targets.write_view()
            } else {
                producer.targets.read_view()
            };
            return ResolvedChannel {
                view,
                sampler: self.bank.placeholder().sampler,
                resolution: [self.width as f32, self.height as f32, 1.0, 0.0],
            };
        }
        self.bank.resolve(&self.media, source)
    }

    fn frame_params(&self, channel_resolution: [[f32; 4]; CHANNEL_SLOTS]) -> FrameParams {
        let now = chrono::Local::now();
        let seconds = now.num_seconds_from_midnight() as f32
            + now.nanosecond() as f32 / 1_000_000_000.0;
        FrameParams {
            resolution: [self.width as f32, self.height as f32, 1.0, 0.0],
            time: self.time,
            time_delta: self.time_delta,
            frame: self.frame,
            frame_rate: self.frame_rate,
            mouse: self.input.mouse,
            date: [
                now.year() as f32,
                now.month0() as f32,
                now.day() as f32,
                seconds,
            ],
            mouse_pressed: if self.input.mouse_pressed { 1.0 } else { 0.0 },
            touch_count: self.input.touch_count as f32,
            pinch: self.input.pinch,
            pinch_delta: self.input.pinch_delta,
            pinch_center: self.input.pinch_center,
            _pad0: [0.0; 2],
            touches: self.input.touches,
            channel_resolution,
        }
    }

    fn advance_clock(&mut self, time_seconds: f32) {
        let delta = self
            .prev_time
            .map(|prev| (time_seconds - prev).max(0.0))
            .unwrap_or(0.0);
        self.time_delta = delta;
        self.frame_rate = frame_rate_from_delta(delta);
        self.time = time_seconds;
        self.prev_time = Some(time_seconds);
    }

    fn upload_uniforms(&mut self) {
        if self.store.scalars_dirty() {
            if let Some(buffer) = &self.custom_buffer {
                self.gpu
                    .queue
                    .write_buffer(buffer, 0, self.store.scalar_bytes());
            }
        }
        for (name, buffer) in &self.ubo_buffers {
            if self.store.array_dirty(name) {
                if let Some(array) = self.store.array(name) {
                    self.gpu.queue.write_buffer(buffer, 0, array.padded_bytes());
                }
            }
        }
        if let Some(buffer) = &self.peer_buffer {
            let mut data = Vec::with_capacity(self.peers.len() * 8);
            for peer in &self.peers {
                data.extend_from_slice(&peer.mouse);
            }
            for peer in &self.peers {
                data.extend_from_slice(&[
                    peer.resolution[0],
                    peer.resolution[1],
                    peer.resolution[2],
                    if peer.mouse_pressed { 1.0 } else { 0.0 },
                ]);
            }
            self.gpu
                .queue
                .write_buffer(buffer, 0, bytemuck::cast_slice(&data));
        }
    }

    /// Replaces one pass's fragment source and rebuilds its pipeline.
    ///
    /// On failure the previous pipeline keeps rendering and the error is
    /// recorded; ping-pong content is preserved either way.
    pub fn recompile_pass(&mut self, name: PassName, source: &str) -> Result<(), EngineError> {
        if !self.passes.contains_key(&name) {
            return Err(EngineError::UnknownPass(name));
        }
        let mut config = self.passes[&name].config.clone();
        config.source = source.to_string();
        let mode = self.channel_mode(&config);
        let assembled = self.assemble_source(&config, &mode);

        let result = self.compile_for(name, &mode, &assembled);
        let Some(pass) = self.passes.get_mut(&name) else {
            return Err(EngineError::UnknownPass(name));
        };
        match result {
            Ok(pipeline) => {
                pass.config = config;
                pass.mode = mode;
                pass.map = assembled.map;
                pass.pipeline = Some(pipeline);
                pass.error = None;
                self.project.passes.insert(name, pass.config.clone());
                // The rebuilt pipeline must see current uniform data on its
                // first frame.
                self.store.mark_all_dirty();
                Ok(())
            }
            Err(error) => {
                pass.error = Some(error.clone());
                Err(EngineError::Compile(error))
            }
        }
    }

    /// Replaces the shared common source.
    ///
    /// All pass pipelines are rebuilt against the new common before any of
    /// them is committed; if any pass fails, nothing changes and every
    /// failure is returned.
    pub fn recompile_common(&mut self, common: Option<String>) -> Result<(), Vec<PassError>> {
        let previous = self.project.common.clone();
        self.project.common = common;

        let mut staged: Vec<(PassName, SourceMap, wgpu::RenderPipeline)> = Vec::new();
        let mut failures = Vec::new();
        let order: Vec<PassName> = self.passes.keys().copied().collect();
        for name in order {
            let config = self.passes[&name].config.clone();
            let mode = self.channel_mode(&config);
            let assembled = self.assemble_source(&config, &mode);
            match self.compile_for(name, &mode, &assembled) {
                Ok(pipeline) => staged.push((name, assembled.map, pipeline)),
                Err(error) => failures.push(error),
            }
        }

        if !failures.is_empty() {
            self.project.common = previous;
            return Err(failures);
        }
        for (name, map, pipeline) in staged {
            if let Some(pass) = self.passes.get_mut(&name) {
                pass.map = map;
                pass.pipeline = Some(pipeline);
                pass.error = None;
            }
        }
        self.store.mark_all_dirty();
        Ok(())
    }

    fn compile_for(
        &mut self,
        name: PassName,
        mode: &ChannelMode,
        assembled: &crate::source::BuiltSource,
    ) -> Result<wgpu::RenderPipeline, PassError> {
        let pair_count = match mode {
            ChannelMode::Indexed { .. } => CHANNEL_SLOTS,
            ChannelMode::Named(inputs) => inputs.len(),
        };
        let group1_layout = self.channel_layout(pair_count);
        let pipeline_layout = self
            .gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{name}-layout")),
                bind_group_layouts: &[&self.group0_layout, &group1_layout],
                push_constant_ranges: &[],
            });
        build_pass_pipeline(
            &self.gpu.device,
            name.label(),
            &pipeline_layout,
            &self.vertex_module,
            &assembled.text,
            &assembled.map,
            PASS_TEXTURE_FORMAT,
        )
    }

    /// Recreates every pass target at the new size. Buffer contents reset
    /// to black; time and frame counters keep running.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            tracing::warn!(width, height, "ignoring resize to an empty target");
            return;
        }
        self.width = width;
        self.height = height;
        for pass in self.passes.values_mut() {
            pass.targets = PingPong::new(&self.gpu.device, pass.name.label(), width, height);
        }
    }

    /// Rewinds time and the frame counter and clears every buffer target.
    pub fn reset(&mut self) {
        self.time = 0.0;
        self.frame = 0;
        self.frame_rate = 0.0;
        self.time_delta = 0.0;
        self.prev_time = None;
        for pass in self.passes.values_mut() {
            pass.targets = PingPong::new(
                &self.gpu.device,
                pass.name.label(),
                self.width,
                self.height,
            );
        }
    }

    /// Reads a region of a pass's last completed frame as tightly packed
    /// RGBA8.
    ///
    /// The region origin is bottom-left, matching `fragCoord`, and output
    /// rows are ordered bottom-up.
    pub fn read_pixels(
        &self,
        pass: PassName,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, EngineError> {
        let runtime = self
            .passes
            .get(&pass)
            .ok_or(EngineError::UnknownPass(pass))?;
        if width == 0
            || height == 0
            || x.checked_add(width).map_or(true, |right| right > self.width)
            || y.checked_add(height).map_or(true, |top| top > self.height)
        {
            return Err(EngineError::Readback(format!(
                "region {width}x{height}+{x}+{y} outside the {}x{} target",
                self.width, self.height
            )));
        }

        let bytes_per_pixel = 16u32; // four f32 components
        let unpadded = width * bytes_per_pixel;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let readback = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: (padded * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: runtime.targets.read_texture(),
                mip_level: 0,
                // Texture row 0 is the top of the frame.
                origin: wgpu::Origin3d {
                    x,
                    y: self.height - y - height,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.gpu.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = crossbeam_channel::bounded(1);
        readback
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        self.gpu
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| EngineError::Readback(err.to_string()))?;
        receiver
            .recv()
            .map_err(|err| EngineError::Readback(err.to_string()))?
            .map_err(|err| EngineError::Readback(err.to_string()))?;

        let data = readback.slice(..).get_mapped_range();
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for row in (0..height).rev() {
            let start = (row * padded) as usize;
            let row_floats: &[f32] =
                bytemuck::cast_slice(&data[start..start + unpadded as usize]);
            for &value in row_floats {
                pixels.push((value.clamp(0.0, 1.0) * 255.0).round() as u8);
            }
        }
        drop(data);
        readback.unmap();
        Ok(pixels)
    }

    pub fn set_uniform(&mut self, name: &str, value: UniformValue) {
        self.store.set_uniform(name, value);
    }

    pub fn get_uniform(&self, name: &str) -> Option<UniformValue> {
        self.store.get_uniform(name)
    }

    pub fn set_uniforms<'a>(&mut self, values: impl IntoIterator<Item = (&'a str, UniformValue)>) {
        for (name, value) in values {
            self.store.set_uniform(name, value);
        }
    }

    pub fn set_array(&mut self, name: &str, data: &[f32]) {
        self.store.set_array(name, data);
    }

    pub fn get_array(&self, name: &str) -> Option<&[f32]> {
        self.store.get_array(name)
    }

    /// Restores one uniform to its manifest default.
    pub fn reset_uniform(&mut self, name: &str) {
        self.store.reset_uniform(name);
    }

    pub fn reset_uniforms(&mut self) {
        self.store.reset_to_defaults();
    }

    /// ShaderToy mouse semantics: xy is the current position while the
    /// button is down, zw the position of the last click.
    pub fn set_mouse(&mut self, x: f32, y: f32, click_x: f32, click_y: f32, pressed: bool) {
        self.input.mouse = [x, y, click_x, click_y];
        self.input.mouse_pressed = pressed;
    }

    pub fn set_touches(&mut self, touches: &[[f32; 4]]) {
        let count = touches.len().min(3);
        self.input.touches = [[0.0; 4]; 3];
        self.input.touches[..count].copy_from_slice(&touches[..count]);
        self.input.touch_count = count as u32;
    }

    pub fn set_pinch(&mut self, pinch: f32, delta: f32, center: [f32; 2]) {
        self.input.pinch = pinch;
        self.input.pinch_delta = delta;
        self.input.pinch_center = center;
    }

    /// Updates a peer view's state for multi-view cross-wiring.
    pub fn set_peer(&mut self, view: &str, state: PeerState) {
        match self.project.views.iter().position(|name| name == view) {
            Some(index) => self.peers[index] = state,
            None => tracing::warn!(view, "unknown peer view"),
        }
    }

    pub fn key_down(&mut self, code: u8) {
        self.bank.keyboard_mut().key_down(code);
    }

    pub fn key_up(&mut self, code: u8) {
        self.bank.keyboard_mut().key_up(code);
    }

    pub fn push_audio(&mut self, spectrum: &[u8], waveform: &[u8]) {
        self.media.push_audio(&self.gpu.queue, spectrum, waveform);
    }

    pub fn push_webcam_frame(&mut self, width: u32, height: u32, rgba: &[u8]) {
        self.media.push_webcam_frame(&self.gpu, width, height, rgba);
    }

    pub fn push_video_frame(&mut self, name: &str, width: u32, height: u32, rgba: &[u8]) {
        self.media.push_video_frame(&self.gpu, name, width, height, rgba);
    }

    /// Creates or updates a script texture addressable through
    /// `script`-type channel sources.
    pub fn update_texture(&mut self, name: &str, width: u32, height: u32, rgba: &[u8]) {
        self.bank
            .update_script_texture(&self.gpu, name, width, height, rgba);
    }

    /// Full-precision variant of [`update_texture`](Self::update_texture).
    pub fn update_texture_float(&mut self, name: &str, width: u32, height: u32, rgba: &[f32]) {
        self.bank
            .update_script_texture_float(&self.gpu, name, width, height, rgba);
    }

    /// Line map of a pass's most recently compiled source, for translating
    /// externally reported line numbers.
    pub fn source_map(&self, pass: PassName) -> Option<SourceMap> {
        self.passes.get(&pass).map(|runtime| runtime.map)
    }

    pub fn has_errors(&self) -> bool {
        self.passes.values().any(|pass| pass.error.is_some())
    }

    /// Current compilation failures, one entry per failing pass.
    pub fn compilation_errors(&self) -> Vec<&PassError> {
        self.passes
            .values()
            .filter_map(|pass| pass.error.as_ref())
            .collect()
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Stops feeding work to the GPU. Subsequent `step` calls are no-ops;
    /// in-flight texture decodes complete into a closed channel.
    pub fn dispose(&mut self) {
        self.disposed = true;
        self.bank.dispose();
    }
}

/// `iFrameRate` for one frame: the instantaneous rate, with 60 standing in
/// when no time has passed (first frame, repeated timestamps).
fn frame_rate_from_delta(delta: f32) -> f32 {
    if delta > 0.0 {
        1.0 / delta
    } else {
        60.0
    }
}

fn create_group0_layout(
    device: &wgpu::Device,
    has_custom: bool,
    has_peers: bool,
    ubo_count: usize,
) -> wgpu::BindGroupLayout {
    let uniform_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    let mut entries = vec![uniform_entry(0)];
    if has_custom {
        entries.push(uniform_entry(1));
    }
    if has_peers {
        entries.push(uniform_entry(2));
    }
    for index in 0..ubo_count {
        entries.push(uniform_entry(UBO_BINDING_BASE + index as u32));
    }
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("pass-uniforms"),
        entries: &entries,
    })
}

fn create_group0(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    frame: &wgpu::Buffer,
    custom: Option<&wgpu::Buffer>,
    peers: Option<&wgpu::Buffer>,
    ubos: &BTreeMap<String, wgpu::Buffer>,
) -> wgpu::BindGroup {
    let mut entries = vec![wgpu::BindGroupEntry {
        binding: 0,
        resource: frame.as_entire_binding(),
    }];
    if let Some(custom) = custom {
        entries.push(wgpu::BindGroupEntry {
            binding: 1,
            resource: custom.as_entire_binding(),
        });
    }
    if let Some(peers) = peers {
        entries.push(wgpu::BindGroupEntry {
            binding: 2,
            resource: peers.as_entire_binding(),
        });
    }
    for (index, buffer) in ubos.values().enumerate() {
        entries.push(wgpu::BindGroupEntry {
            binding: UBO_BINDING_BASE + index as u32,
            resource: buffer.as_entire_binding(),
        });
    }
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("pass-uniforms"),
        layout,
        entries: &entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_params_matches_std140_block_size() {
        assert_eq!(std::mem::size_of::<FrameParams>(), 208);
        assert_eq!(std::mem::size_of::<FrameParams>() % 16, 0);
    }

    #[test]
    fn frame_rate_falls_back_to_sixty_on_zero_delta() {
        assert_eq!(frame_rate_from_delta(0.0), 60.0);
        assert_eq!(frame_rate_from_delta(0.25), 4.0);
    }

    #[test]
    fn missing_image_pass_fails_before_gpu_work() {
        let err = Engine::new(Project::default(), 64, 64).unwrap_err();
        assert!(matches!(err, EngineError::MissingImagePass));
    }
}
