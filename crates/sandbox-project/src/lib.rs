//! Project model for the Shader Sandbox pass-graph engine.
//!
//! A [`Project`] describes what to render: up to four buffer passes plus the
//! final image pass, the channel sources each pass reads, a manifest of
//! custom uniforms (scalar and array-backed), external textures, and the
//! peer-view names used by multi-view projects. The engine consumes the
//! structure as-is; this crate only models and validates it.
//!
//! Projects are either built in memory (tests, embedding applications) or
//! loaded from a directory containing a `project.json` manifest plus the GLSL
//! files it references (see [`load_dir`]).

mod loader;
mod model;

pub use loader::{load_dir, LoadError, ManifestPass, ProjectManifest};
pub use model::{
    ChannelSource, DefaultValue, ElementType, ExternalTextureDecl, NamedSampler, PassConfig,
    PassName, Project, ScalarType, TextureFilter, TextureKind, TextureWrap, UniformDecl,
    CHANNEL_SLOTS,
};
