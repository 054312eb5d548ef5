use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Every pass exposes exactly four channel slots (`iChannel0-3`).
pub const CHANNEL_SLOTS: usize = 4;

/// The fixed set of pass slots, in execution order.
///
/// Buffer passes run before the image pass so that `buffer` channel reads
/// always observe a completed prior frame; the derived `Ord` keeps map
/// iteration in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PassName {
    BufferA,
    BufferB,
    BufferC,
    BufferD,
    Image,
}

impl PassName {
    /// All pass slots in execution order.
    pub const ALL: [PassName; 5] = [
        PassName::BufferA,
        PassName::BufferB,
        PassName::BufferC,
        PassName::BufferD,
        PassName::Image,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PassName::BufferA => "BufferA",
            PassName::BufferB => "BufferB",
            PassName::BufferC => "BufferC",
            PassName::BufferD => "BufferD",
            PassName::Image => "Image",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|pass| pass.label() == input)
    }
}

impl std::fmt::Display for PassName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Describes where a channel's texture comes from.
///
/// A closed tagged union; the channel resolver matches it exhaustively and
/// every missing resource degrades to a black placeholder at resolve time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelSource {
    #[default]
    None,
    Buffer {
        name: PassName,
        #[serde(default)]
        use_current: bool,
    },
    Texture {
        name: String,
    },
    Keyboard,
    Audio,
    Webcam,
    Video {
        src: String,
    },
    Script {
        name: String,
    },
}

/// Binds a channel slot to a GLSL sampler name instead of `iChannelN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSampler {
    pub name: String,
    pub source: ChannelSource,
}

/// One pass of the project: its fragment source plus channel wiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassConfig {
    /// ShaderToy-style fragment body declaring `mainImage`.
    pub source: String,
    /// Indexed channel slots, used when `named_samplers` is empty.
    #[serde(default, deserialize_with = "deserialize_channels")]
    pub channels: [ChannelSource; CHANNEL_SLOTS],
    /// Named-sampler inputs; non-empty switches the pass to named mode.
    #[serde(default)]
    pub named_samplers: Vec<NamedSampler>,
}

impl PassConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            channels: Default::default(),
            named_samplers: Vec::new(),
        }
    }

    pub fn with_channel(mut self, slot: usize, source: ChannelSource) -> Self {
        if slot < CHANNEL_SLOTS {
            self.channels[slot] = source;
        }
        self
    }

    pub fn uses_named_samplers(&self) -> bool {
        !self.named_samplers.is_empty()
    }
}

/// GLSL type of a scalar/vector custom uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Float,
    Int,
    Bool,
    Vec2,
    Vec3,
    Vec4,
}

impl ScalarType {
    pub fn glsl_name(&self) -> &'static str {
        match self {
            ScalarType::Float => "float",
            ScalarType::Int => "int",
            ScalarType::Bool => "bool",
            ScalarType::Vec2 => "vec2",
            ScalarType::Vec3 => "vec3",
            ScalarType::Vec4 => "vec4",
        }
    }

    /// Number of components carried by a value of this type.
    pub fn components(&self) -> usize {
        match self {
            ScalarType::Float | ScalarType::Int | ScalarType::Bool => 1,
            ScalarType::Vec2 => 2,
            ScalarType::Vec3 => 3,
            ScalarType::Vec4 => 4,
        }
    }
}

/// Element type of an array-backed (UBO) uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Mat3,
    Mat4,
}

impl ElementType {
    pub fn glsl_name(&self) -> &'static str {
        match self {
            ElementType::Float => "float",
            ElementType::Vec2 => "vec2",
            ElementType::Vec3 => "vec3",
            ElementType::Vec4 => "vec4",
            ElementType::Mat3 => "mat3",
            ElementType::Mat4 => "mat4",
        }
    }
}

/// Default value of a scalar uniform as written in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Number(f64),
    Bool(bool),
    Vector(Vec<f32>),
}

/// A declared custom uniform.
///
/// The discriminant is an explicit `kind` field rather than inferred from
/// the presence of a `count` property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UniformDecl {
    Scalar {
        #[serde(rename = "type")]
        ty: ScalarType,
        #[serde(default)]
        default: Option<DefaultValue>,
        #[serde(default)]
        range: Option<[f32; 2]>,
    },
    Array {
        #[serde(rename = "type")]
        ty: ElementType,
        count: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextureFilter {
    #[default]
    Linear,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextureWrap {
    #[default]
    Clamp,
    Repeat,
}

/// How a declared texture should be interpreted by shaders sampling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextureKind {
    #[default]
    Image,
    /// Equirectangular panorama; channels bound to it are cubemap-flagged
    /// and `texture(iChannelN, dir)` calls get the direction-to-UV rewrite.
    Equirect,
}

/// An external texture referenced by name from channel sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTextureDecl {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub filter: TextureFilter,
    #[serde(default)]
    pub wrap: TextureWrap,
    #[serde(default)]
    pub kind: TextureKind,
}

/// Complete description of what to render.
///
/// Created once at load, mutated only through the engine's explicit
/// recompilation and set-uniform operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Project {
    #[serde(default)]
    pub passes: BTreeMap<PassName, PassConfig>,
    /// Shared source prepended to every pass.
    #[serde(default)]
    pub common: Option<String>,
    /// Custom uniform manifest. Iteration order (name order) fixes the
    /// member order of the generated uniform block.
    #[serde(default)]
    pub uniforms: BTreeMap<String, UniformDecl>,
    #[serde(default)]
    pub textures: Vec<ExternalTextureDecl>,
    /// Peer view names for multi-view projects.
    #[serde(default)]
    pub views: Vec<String>,
}

impl Project {
    /// Convenience constructor for a single-pass project.
    pub fn single_image(source: impl Into<String>) -> Self {
        let mut passes = BTreeMap::new();
        passes.insert(PassName::Image, PassConfig::new(source));
        Self {
            passes,
            ..Default::default()
        }
    }

    pub fn texture(&self, name: &str) -> Option<&ExternalTextureDecl> {
        self.textures.iter().find(|decl| decl.name == name)
    }

    /// Collects human-readable configuration issues.
    ///
    /// A missing image pass is the only structurally fatal condition; the
    /// engine treats everything else as a warning and degrades at resolve
    /// time (missing buffer references sample black).
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.passes.contains_key(&PassName::Image) {
            issues.push("project must declare an Image pass".to_string());
        }
        for (name, pass) in &self.passes {
            for (slot, channel) in pass.channels.iter().enumerate() {
                self.check_channel(&mut issues, name, &format!("channel {slot}"), channel);
            }
            let mut seen = Vec::new();
            for sampler in &pass.named_samplers {
                if !is_identifier(&sampler.name) {
                    issues.push(format!(
                        "pass '{name}' sampler '{}' is not a valid GLSL identifier",
                        sampler.name
                    ));
                }
                if seen.contains(&sampler.name.as_str()) {
                    issues.push(format!(
                        "pass '{name}' declares sampler '{}' more than once",
                        sampler.name
                    ));
                }
                seen.push(sampler.name.as_str());
                self.check_channel(
                    &mut issues,
                    name,
                    &format!("sampler '{}'", sampler.name),
                    &sampler.source,
                );
            }
            if pass.named_samplers.len() > CHANNEL_SLOTS {
                issues.push(format!(
                    "pass '{name}' declares {} named samplers, more than the {CHANNEL_SLOTS} available slots",
                    pass.named_samplers.len()
                ));
            }
        }
        for (name, decl) in &self.uniforms {
            if !is_identifier(name) {
                issues.push(format!("uniform '{name}' is not a valid GLSL identifier"));
            }
            if let UniformDecl::Array { count, .. } = decl {
                if *count == 0 {
                    issues.push(format!("array uniform '{name}' declares zero elements"));
                }
            }
        }
        let mut texture_names = Vec::new();
        for decl in &self.textures {
            if texture_names.contains(&decl.name.as_str()) {
                issues.push(format!("texture '{}' declared more than once", decl.name));
            }
            texture_names.push(decl.name.as_str());
        }
        issues
    }

    fn check_channel(
        &self,
        issues: &mut Vec<String>,
        pass: &PassName,
        slot: &str,
        channel: &ChannelSource,
    ) {
        match channel {
            ChannelSource::Buffer { name, .. } => {
                if !self.passes.contains_key(name) {
                    issues.push(format!(
                        "pass '{pass}' {slot} references buffer '{name}' which is not configured"
                    ));
                }
            }
            ChannelSource::Texture { name } => {
                if self.texture(name).is_none() {
                    issues.push(format!(
                        "pass '{pass}' {slot} references texture '{name}' which is not declared"
                    ));
                }
            }
            _ => {}
        }
    }
}

/// Accepts channel lists shorter than [`CHANNEL_SLOTS`], padding the tail
/// with `None` so manifests only spell out the slots they use.
pub(crate) fn deserialize_channels<'de, D>(
    deserializer: D,
) -> Result<[ChannelSource; CHANNEL_SLOTS], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let list = Vec::<ChannelSource>::deserialize(deserializer)?;
    if list.len() > CHANNEL_SLOTS {
        return Err(serde::de::Error::custom(format!(
            "a pass supports at most {CHANNEL_SLOTS} channels, got {}",
            list.len()
        )));
    }
    let mut slots: [ChannelSource; CHANNEL_SLOTS] = Default::default();
    for (slot, source) in list.into_iter().enumerate() {
        slots[slot] = source;
    }
    Ok(slots)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_image_pass() {
        let project = Project::default();
        assert!(project
            .validate()
            .iter()
            .any(|issue| issue.contains("Image pass")));
    }

    #[test]
    fn validate_flags_unconfigured_buffer_reference() {
        let project = Project {
            passes: BTreeMap::from([(
                PassName::Image,
                PassConfig::new("void mainImage(out vec4 c, in vec2 f) { c = vec4(0.0); }")
                    .with_channel(
                        0,
                        ChannelSource::Buffer {
                            name: PassName::BufferA,
                            use_current: false,
                        },
                    ),
            )]),
            ..Default::default()
        };
        let issues = project.validate();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("BufferA"));
    }

    #[test]
    fn channel_source_roundtrips_through_json() {
        let source = ChannelSource::Buffer {
            name: PassName::BufferB,
            use_current: true,
        };
        let json = serde_json::to_string(&source).unwrap();
        assert_eq!(serde_json::from_str::<ChannelSource>(&json).unwrap(), source);

        let bare: ChannelSource = serde_json::from_str(r#"{"type":"keyboard"}"#).unwrap();
        assert_eq!(bare, ChannelSource::Keyboard);
    }

    #[test]
    fn short_channel_lists_pad_with_none() {
        let pass: PassConfig = serde_json::from_str(
            r#"{"source":"c = vec4(0.0);","channels":[{"type":"keyboard"}]}"#,
        )
        .unwrap();
        assert_eq!(pass.channels[0], ChannelSource::Keyboard);
        assert_eq!(pass.channels[1], ChannelSource::None);
        assert_eq!(pass.channels[3], ChannelSource::None);

        let err = serde_json::from_str::<PassConfig>(
            r#"{"source":"","channels":[{"type":"none"},{"type":"none"},{"type":"none"},{"type":"none"},{"type":"none"}]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn uniform_decl_discriminates_scalar_and_array() {
        let scalar: UniformDecl =
            serde_json::from_str(r#"{"kind":"scalar","type":"vec3","default":[1.0,0.5,0.0]}"#)
                .unwrap();
        assert!(matches!(
            scalar,
            UniformDecl::Scalar {
                ty: ScalarType::Vec3,
                ..
            }
        ));

        let array: UniformDecl =
            serde_json::from_str(r#"{"kind":"array","type":"mat3","count":8}"#).unwrap();
        assert!(matches!(
            array,
            UniformDecl::Array {
                ty: ElementType::Mat3,
                count: 8
            }
        ));
    }

    #[test]
    fn pass_order_follows_execution_order() {
        let mut passes = BTreeMap::new();
        passes.insert(PassName::Image, PassConfig::new(""));
        passes.insert(PassName::BufferB, PassConfig::new(""));
        passes.insert(PassName::BufferA, PassConfig::new(""));
        let order: Vec<PassName> = passes.keys().copied().collect();
        assert_eq!(
            order,
            vec![PassName::BufferA, PassName::BufferB, PassName::Image]
        );
    }
}
