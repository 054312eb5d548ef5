//! Headless multi-pass shader rendering on wgpu.
//!
//! A [`Project`](sandbox_project::Project) describes up to four buffer
//! passes plus a final image pass, each a ShaderToy-style `mainImage`
//! fragment. The engine wraps every pass source with generated uniform and
//! channel declarations, compiles it through naga's GLSL frontend, and
//! renders the graph into float ping-pong targets:
//!
//! ```text
//! Project ──> source builder ──> naga validate ──> render pipelines
//!                                                        │
//! host inputs (mouse, keys, media, uniforms) ──> step() ─┤ BufferA..D
//!                                                        └─> Image ──> read_pixels()
//! ```
//!
//! Failures degrade instead of stopping the loop: channels whose resource
//! is missing sample a black placeholder, and a pass whose shader fails to
//! compile keeps its previous pipeline (or is skipped) while diagnostics
//! are reported with line numbers mapped back to the edited source.

mod channels;
mod compile;
mod context;
mod engine;
mod media;
mod pack;
mod source;
mod store;

pub use channels::{
    ChannelBank, KeyboardTexture, ResolvedChannel, KEYBOARD_TEXTURE_HEIGHT,
    KEYBOARD_TEXTURE_WIDTH,
};
pub use compile::{GlslDiagnostic, PassError};
pub use context::{GpuContext, PASS_TEXTURE_FORMAT};
pub use engine::{Engine, EngineError, PeerState};
pub use media::{MediaHub, MediaTexture, AUDIO_TEXTURE_HEIGHT, AUDIO_TEXTURE_WIDTH};
pub use pack::{
    component_count, padded_byte_size, padded_components_per_element, repack_tight_to_padded,
    Std140Layout, Std140Member,
};
pub use source::{MappedLine, SourceMap};
pub use store::{ArrayUniform, UniformStore, UniformValue};
