//! Shader compilation: GLSL validation, module creation, and pipeline
//! assembly.
//!
//! Fragment sources are run through naga's GLSL frontend before anything is
//! handed to the device, so syntax and type errors surface as structured
//! diagnostics with line numbers mapped back to the user's files. Pipeline
//! creation is additionally wrapped in a validation error scope to catch
//! what the frontend pass cannot (interface mismatches, limit violations).

use wgpu::naga;

use crate::source::{MappedLine, SourceMap};

/// Fullscreen triangle; three vertices cover the viewport without an index
/// or vertex buffer.
const VERTEX_SHADER: &str = r"#version 450
layout(location = 0) out vec2 v_uv;

const vec2 POSITIONS[3] = vec2[3](
    vec2(-1.0, -1.0),
    vec2(3.0, -1.0),
    vec2(-1.0, 3.0)
);

void main() {
    vec2 pos = POSITIONS[gl_VertexIndex];
    v_uv = pos * 0.5 + 0.5;
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

/// One compiler message, located in the file the user edits when possible.
#[derive(Debug, Clone)]
pub struct GlslDiagnostic {
    /// 1-based line in the assembled source, when the compiler reported one.
    pub assembled_line: Option<u32>,
    /// The assembled line translated through the pass's source map.
    pub origin: Option<MappedLine>,
    pub message: String,
}

impl GlslDiagnostic {
    fn new(message: String, assembled_line: Option<u32>, map: &SourceMap) -> Self {
        Self {
            assembled_line,
            origin: assembled_line.map(|line| map.translate(line)),
            message,
        }
    }
}

impl std::fmt::Display for GlslDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.origin {
            Some(MappedLine::User(line)) => write!(f, "line {line}: {}", self.message),
            Some(MappedLine::Common(line)) => write!(f, "common line {line}: {}", self.message),
            Some(MappedLine::Preamble(line)) => {
                write!(f, "generated line {line}: {}", self.message)
            }
            None => write!(f, "{}", self.message),
        }
    }
}

/// Compilation failure for one pass.
#[derive(Debug, Clone)]
pub struct PassError {
    pub pass: String,
    pub diagnostics: Vec<GlslDiagnostic>,
}

impl PassError {
    pub fn summary(&self) -> String {
        self.diagnostics
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Display for PassError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shader compilation failed for {}: {}", self.pass, self.summary())
    }
}

impl std::error::Error for PassError {}

/// Parses and validates a fragment source without touching the GPU.
pub fn validate_fragment(source: &str, map: &SourceMap) -> Result<(), Vec<GlslDiagnostic>> {
    let mut frontend = naga::front::glsl::Frontend::default();
    let options = naga::front::glsl::Options::from(naga::ShaderStage::Fragment);
    let module = match frontend.parse(&options, source) {
        Ok(module) => module,
        Err(errors) => {
            let diagnostics = errors
                .errors
                .iter()
                .map(|error| {
                    let line = error.meta.location(source).line_number;
                    GlslDiagnostic::new(format!("{:?}", error.kind), Some(line), map)
                })
                .collect();
            return Err(diagnostics);
        }
    };

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    if let Err(error) = validator.validate(&module) {
        let line = error.location(source).map(|loc| loc.line_number);
        return Err(vec![GlslDiagnostic::new(
            format!("{:?}", error.as_inner()),
            line,
            map,
        )]);
    }
    Ok(())
}

pub fn create_vertex_module(device: &wgpu::Device) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("pass-vertex"),
        source: wgpu::ShaderSource::Glsl {
            shader: VERTEX_SHADER.into(),
            stage: naga::ShaderStage::Vertex,
            defines: &[],
        },
    })
}

fn create_fragment_module(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Glsl {
            shader: source.into(),
            stage: naga::ShaderStage::Fragment,
            defines: &[],
        },
    })
}

/// Builds the render pipeline for one pass, reporting any device-side
/// validation failure as a [`PassError`].
///
/// The frontend check in [`validate_fragment`] runs first so that source
/// errors come back with mapped line numbers; the error scope here catches
/// the remainder.
pub fn build_pass_pipeline(
    device: &wgpu::Device,
    pass: &str,
    layout: &wgpu::PipelineLayout,
    vertex_module: &wgpu::ShaderModule,
    fragment_source: &str,
    map: &SourceMap,
    format: wgpu::TextureFormat,
) -> Result<wgpu::RenderPipeline, PassError> {
    validate_fragment(fragment_source, map).map_err(|diagnostics| PassError {
        pass: pass.to_string(),
        diagnostics,
    })?;

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let fragment_module = create_fragment_module(device, pass, fragment_source);
    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(pass),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: vertex_module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[],
        },
        fragment: Some(wgpu::FragmentState {
            module: &fragment_module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    });

    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        return Err(PassError {
            pass: pass.to_string(),
            diagnostics: vec![GlslDiagnostic::new(error.to_string(), None, map)],
        });
    }
    Ok(pipeline)
}
