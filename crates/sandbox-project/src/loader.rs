//! Loads a project directory into an in-memory [`Project`].
//!
//! The on-disk layout is a `project.json` manifest whose passes reference
//! GLSL files relative to the project root, plus an optional shared source
//! file. Loading inlines every referenced file so the engine never touches
//! the filesystem again (external texture paths stay as paths; images decode
//! asynchronously at engine initialization).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    deserialize_channels, ChannelSource, ExternalTextureDecl, NamedSampler, PassConfig, PassName,
    Project, UniformDecl, CHANNEL_SLOTS,
};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("manifest not found at {0}")]
    ManifestMissing(PathBuf),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(#[from] serde_json::Error),

    #[error("project validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// On-disk manifest; pass and common sources are file references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectManifest {
    #[serde(default)]
    pub passes: BTreeMap<PassName, ManifestPass>,
    #[serde(default)]
    pub common: Option<PathBuf>,
    #[serde(default)]
    pub uniforms: BTreeMap<String, UniformDecl>,
    #[serde(default)]
    pub textures: Vec<ExternalTextureDecl>,
    #[serde(default)]
    pub views: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPass {
    pub source: PathBuf,
    #[serde(default, deserialize_with = "deserialize_channels")]
    pub channels: [ChannelSource; CHANNEL_SLOTS],
    #[serde(default)]
    pub named_samplers: Vec<NamedSampler>,
}

/// Reads `project.json` from `root`, inlines referenced GLSL files, and
/// validates the result.
pub fn load_dir(root: impl AsRef<Path>) -> Result<Project, LoadError> {
    let root = root.as_ref();
    let manifest_path = root.join("project.json");
    if !manifest_path.exists() {
        return Err(LoadError::ManifestMissing(manifest_path));
    }

    let raw = fs::read_to_string(&manifest_path)?;
    let manifest: ProjectManifest = serde_json::from_str(&raw)?;

    let mut passes = BTreeMap::new();
    for (name, pass) in manifest.passes {
        let source = fs::read_to_string(root.join(&pass.source))?;
        passes.insert(
            name,
            PassConfig {
                source,
                channels: pass.channels,
                named_samplers: pass.named_samplers,
            },
        );
    }

    let common = match manifest.common {
        Some(path) => Some(fs::read_to_string(root.join(path))?),
        None => None,
    };

    // Texture paths become absolute so the engine can decode them from any
    // working directory.
    let textures = manifest
        .textures
        .into_iter()
        .map(|mut decl| {
            let path = Path::new(&decl.path);
            if path.is_relative() {
                decl.path = root.join(path).to_string_lossy().into_owned();
            }
            decl
        })
        .collect();

    let project = Project {
        passes,
        common,
        uniforms: manifest.uniforms,
        textures,
        views: manifest.views,
    };

    let issues = project.validate();
    if issues
        .iter()
        .any(|issue| issue.contains("must declare an Image pass"))
    {
        return Err(LoadError::Validation(issues));
    }
    for issue in &issues {
        tracing::warn!(issue, "project configuration issue");
    }

    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_demo(dir: &Path, manifest: &str) {
        fs::write(dir.join("project.json"), manifest).expect("write manifest");
        fs::write(
            dir.join("image.frag"),
            "void mainImage(out vec4 c, in vec2 f) { c = vec4(1.0); }",
        )
        .expect("write shader");
    }

    #[test]
    fn loads_single_pass_project() {
        let temp = tempfile::tempdir().unwrap();
        write_demo(
            temp.path(),
            r#"{"passes":{"Image":{"source":"image.frag"}}}"#,
        );

        let project = load_dir(temp.path()).expect("load project");
        assert!(project.passes[&PassName::Image]
            .source
            .contains("mainImage"));
        assert!(project.common.is_none());
    }

    #[test]
    fn inlines_common_source() {
        let temp = tempfile::tempdir().unwrap();
        write_demo(
            temp.path(),
            r#"{"passes":{"Image":{"source":"image.frag"}},"common":"common.glsl"}"#,
        );
        fs::write(temp.path().join("common.glsl"), "float shared_fn() { return 1.0; }").unwrap();

        let project = load_dir(temp.path()).expect("load project");
        assert!(project.common.as_deref().unwrap().contains("shared_fn"));
    }

    #[test]
    fn missing_image_pass_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("project.json"), r#"{"passes":{}}"#).unwrap();
        let err = load_dir(temp.path()).unwrap_err();
        assert!(matches!(err, LoadError::Validation(_)));
    }
}
