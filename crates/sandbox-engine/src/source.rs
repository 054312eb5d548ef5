//! Assembles complete fragment shader source from a user fragment body.
//!
//! User shaders are ShaderToy-style `mainImage` fragments. The builder wraps
//! them with a generated prologue (built-in uniform block, channel sampler
//! pairs, custom uniform block, array uniform blocks) and an epilogue that
//! remaps `gl_FragCoord` to a bottom-left origin and dispatches `mainImage`.
//! Built-in names are aliased onto underscore-prefixed block members with
//! `#define`, which keeps user identifiers out of the block's namespace and
//! sidesteps macro recursion.
//!
//! The builder also produces a [`SourceMap`] so compiler diagnostics against
//! the assembled text can be translated back to the file the user edited.

use sandbox_project::{ElementType, ScalarType, CHANNEL_SLOTS};

use crate::pack::Std140Layout;

const COMMON_MARKER: &str = "//__sandbox_common__";
const USER_MARKER: &str = "//__sandbox_user__";

/// Bind group 0 binding of the first array-uniform block.
pub const UBO_BINDING_BASE: u32 = 3;

/// Line-mapping record for translating compiler error line numbers.
///
/// All lines are 1-based in the assembled text; `common_start_line == 0`
/// means the project has no common section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceMap {
    pub common_start_line: u32,
    pub common_lines: u32,
    pub user_start_line: u32,
    pub user_lines: u32,
}

/// A line of the assembled shader mapped back to its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedLine {
    /// Generated prologue/epilogue; the number is the assembled line.
    Preamble(u32),
    /// 1-based line in the shared common source.
    Common(u32),
    /// 1-based line in the user's pass source.
    User(u32),
}

impl SourceMap {
    pub fn translate(&self, assembled_line: u32) -> MappedLine {
        if self.common_start_line > 0
            && assembled_line >= self.common_start_line
            && assembled_line < self.common_start_line + self.common_lines
        {
            return MappedLine::Common(assembled_line - self.common_start_line + 1);
        }
        if self.user_start_line > 0 && assembled_line >= self.user_start_line {
            let line = assembled_line - self.user_start_line + 1;
            return MappedLine::User(line.min(self.user_lines.max(1)));
        }
        MappedLine::Preamble(assembled_line)
    }
}

/// An array-backed uniform to declare as a std140 block.
#[derive(Debug, Clone)]
pub struct UboDecl {
    pub name: String,
    pub ty: ElementType,
    pub count: u32,
    pub binding: u32,
}

/// A named-sampler input occupying one of the pass's channel slots.
#[derive(Debug, Clone)]
pub struct NamedInput {
    pub name: String,
    pub slot: usize,
    pub cubemap: bool,
}

/// Channel declaration scheme for one pass.
#[derive(Debug, Clone)]
pub enum ChannelMode {
    /// Classic `iChannel0..3` with an `iChannelResolution[4]` alias.
    Indexed { cubemap: [bool; CHANNEL_SLOTS] },
    /// One `sampler2D <name>` + `<name>_resolution` pair per input.
    Named(Vec<NamedInput>),
}

/// Everything the builder needs to assemble one pass's source.
pub struct SourceRequest<'a> {
    pub user_source: &'a str,
    pub common: Option<&'a str>,
    pub mode: &'a ChannelMode,
    /// Scalar custom uniforms plus per-UBO `<name>_count` members, in block
    /// member order.
    pub scalars: &'a Std140Layout,
    pub ubos: &'a [UboDecl],
    /// Peer view names for multi-view cross-wiring; empty when single-view.
    pub peers: &'a [String],
}

pub struct BuiltSource {
    pub text: String,
    pub map: SourceMap,
}

/// Assembles the final compilable shader text plus its line map.
pub fn build(req: &SourceRequest<'_>) -> BuiltSource {
    let mut text = String::with_capacity(4096 + req.user_source.len());

    text.push_str(PRELUDE);

    if let Some(common) = req.common {
        text.push_str(COMMON_MARKER);
        text.push('\n');
        push_sanitized(&mut text, common);
    }

    emit_frame_block(&mut text, req.mode);
    emit_channels(&mut text, req.mode);
    if !req.peers.is_empty() {
        emit_peer_block(&mut text, req.peers);
    }
    for ubo in req.ubos {
        emit_ubo_block(&mut text, ubo);
    }
    if !req.scalars.is_empty() {
        emit_custom_block(&mut text, req.scalars);
    }
    if let ChannelMode::Named(inputs) = req.mode {
        if inputs.iter().any(|input| input.name == "keyboard") {
            text.push_str(KEYBOARD_HELPERS);
        }
    }

    text.push_str(USER_MARKER);
    text.push('\n');
    let mut user = String::with_capacity(req.user_source.len());
    push_sanitized(&mut user, req.user_source);
    let user = apply_cubemap_rewrites(user, req.mode);
    text.push_str(&user);

    text.push_str(EPILOGUE);

    let map = compute_map(&text, req);
    BuiltSource { text, map }
}

/// Fixed prologue: version, stage IO, the equirectangular helper used by
/// cubemap-flagged channels, and the `gl_FragCoord` remap alias.
const PRELUDE: &str = r"#version 450
layout(location = 0) in vec2 _sb_uv;
layout(location = 0) out vec4 _sb_out_color;

vec2 _st_dirToEquirect(vec3 dir) {
    float u = atan(dir.z, dir.x) / 6.28318530718 + 0.5;
    float v = asin(clamp(dir.y, -1.0, 1.0)) / 3.14159265359 + 0.5;
    return vec2(u, v);
}

vec4 _sb_frag_coord;
#define gl_FragCoord _sb_frag_coord
";

/// Epilogue: capture the hardware fragment coordinate, flip to ShaderToy's
/// bottom-left origin, and delegate to `mainImage`.
const EPILOGUE: &str = r"void main() {
    #undef gl_FragCoord
    vec2 _sb_builtin_fc = vec2(gl_FragCoord.x, gl_FragCoord.y);
    #define gl_FragCoord _sb_frag_coord
    vec2 fragCoord = vec2(_sb_builtin_fc.x, _sb_frame._resolution.y - _sb_builtin_fc.y);
    _sb_frag_coord = vec4(fragCoord, 0.0, 1.0);
    vec4 color = vec4(0.0);
    mainImage(color, fragCoord);
    _sb_out_color = color;
}
";

/// Key helper snippet injected when a named sampler called `keyboard` is
/// configured. Rows of the 256x3 lookup texture: 0 = held, 1 = pressed this
/// frame, 2 = toggled.
const KEYBOARD_HELPERS: &str = r"const int KEY_BACKSPACE = 8;
const int KEY_TAB = 9;
const int KEY_ENTER = 13;
const int KEY_SHIFT = 16;
const int KEY_CTRL = 17;
const int KEY_ALT = 18;
const int KEY_ESC = 27;
const int KEY_SPACE = 32;
const int KEY_LEFT = 37;
const int KEY_UP = 38;
const int KEY_RIGHT = 39;
const int KEY_DOWN = 40;
const int KEY_A = 65;
const int KEY_D = 68;
const int KEY_S = 83;
const int KEY_W = 87;

float keyDown(int code) {
    return texture(keyboard, vec2((float(code) + 0.5) / 256.0, 0.5 / 3.0)).x;
}
float keyToggle(int code) {
    return texture(keyboard, vec2((float(code) + 0.5) / 256.0, 2.5 / 3.0)).x;
}
bool isKeyDown(int code) { return keyDown(code) > 0.5; }
bool isKeyToggled(int code) { return keyToggle(code) > 0.5; }
";

fn emit_frame_block(text: &mut String, mode: &ChannelMode) {
    text.push_str(
        r"layout(std140, set = 0, binding = 0) uniform FrameParams {
    vec4 _resolution;
    float _time;
    float _time_delta;
    int _frame;
    float _frame_rate;
    vec4 _mouse;
    vec4 _date;
    float _mouse_pressed;
    float _touch_count;
    float _pinch;
    float _pinch_delta;
    vec2 _pinch_center;
    vec2 _pad0;
    vec4 _touches[3];
    vec4 _channel_resolution[4];
} _sb_frame;

#define iResolution _sb_frame._resolution.xyz
#define iTime _sb_frame._time
#define iTimeDelta _sb_frame._time_delta
#define iFrame _sb_frame._frame
#define iFrameRate _sb_frame._frame_rate
#define iMouse _sb_frame._mouse
#define iDate _sb_frame._date
#define iMousePressed (_sb_frame._mouse_pressed > 0.5)
#define iTouchCount int(_sb_frame._touch_count)
#define iTouch0 _sb_frame._touches[0]
#define iTouch1 _sb_frame._touches[1]
#define iTouch2 _sb_frame._touches[2]
#define iPinch _sb_frame._pinch
#define iPinchDelta _sb_frame._pinch_delta
#define iPinchCenter _sb_frame._pinch_center
",
    );
    if matches!(mode, ChannelMode::Indexed { .. }) {
        text.push_str("#define iChannelResolution _sb_frame._channel_resolution\n");
    }
    text.push('\n');
}

fn emit_channels(text: &mut String, mode: &ChannelMode) {
    match mode {
        ChannelMode::Indexed { .. } => {
            for slot in 0..CHANNEL_SLOTS {
                text.push_str(&format!(
                    "layout(set = 1, binding = {}) uniform texture2D _sb_channel{slot}_tex;\n\
                     layout(set = 1, binding = {}) uniform sampler _sb_channel{slot}_smp;\n",
                    slot * 2,
                    slot * 2 + 1,
                ));
            }
            for slot in 0..CHANNEL_SLOTS {
                text.push_str(&format!(
                    "#define iChannel{slot} sampler2D(_sb_channel{slot}_tex, _sb_channel{slot}_smp)\n"
                ));
            }
        }
        ChannelMode::Named(inputs) => {
            for (index, input) in inputs.iter().enumerate() {
                text.push_str(&format!(
                    "layout(set = 1, binding = {}) uniform texture2D _sb_named_{name}_tex;\n\
                     layout(set = 1, binding = {}) uniform sampler _sb_named_{name}_smp;\n",
                    index * 2,
                    index * 2 + 1,
                    name = input.name,
                ));
            }
            for input in inputs {
                text.push_str(&format!(
                    "#define {name} sampler2D(_sb_named_{name}_tex, _sb_named_{name}_smp)\n\
                     #define {name}_resolution (_sb_frame._channel_resolution[{slot}].xy)\n",
                    name = input.name,
                    slot = input.slot,
                ));
            }
        }
    }
    text.push('\n');
}

fn emit_peer_block(text: &mut String, peers: &[String]) {
    text.push_str(&format!(
        "layout(std140, set = 0, binding = 2) uniform ViewPeers {{\n    \
         vec4 _peer_mouse[{count}];\n    \
         vec4 _peer_meta[{count}];\n\
         }} _sb_peers;\n",
        count = peers.len(),
    ));
    for (index, peer) in peers.iter().enumerate() {
        text.push_str(&format!(
            "#define iMouse_{peer} _sb_peers._peer_mouse[{index}]\n\
             #define iResolution_{peer} _sb_peers._peer_meta[{index}].xyz\n\
             #define iMousePressed_{peer} (_sb_peers._peer_meta[{index}].w > 0.5)\n"
        ));
    }
    text.push('\n');
}

fn emit_ubo_block(text: &mut String, ubo: &UboDecl) {
    text.push_str(&format!(
        "layout(std140, set = 0, binding = {binding}) uniform _ub_{name} {{\n    \
         {ty} _{name}[{count}];\n\
         }} _sb_ub_{name};\n\
         #define {name} _sb_ub_{name}._{name}\n\n",
        binding = ubo.binding,
        name = ubo.name,
        ty = ubo.ty.glsl_name(),
        count = ubo.count,
    ));
}

fn emit_custom_block(text: &mut String, layout: &Std140Layout) {
    text.push_str("layout(std140, set = 0, binding = 1) uniform CustomParams {\n");
    for member in layout.members() {
        let glsl_ty = match member.ty {
            // Ints and bools are carried as floats and cast in the alias.
            ScalarType::Float | ScalarType::Int | ScalarType::Bool => "float",
            ScalarType::Vec2 => "vec2",
            ScalarType::Vec3 => "vec3",
            ScalarType::Vec4 => "vec4",
        };
        text.push_str(&format!("    {glsl_ty} _{};\n", member.name));
    }
    text.push_str("} _sb_custom;\n");
    for member in layout.members() {
        let alias = match member.ty {
            ScalarType::Int => format!("int(_sb_custom._{})", member.name),
            ScalarType::Bool => format!("(_sb_custom._{} > 0.5)", member.name),
            _ => format!("_sb_custom._{}", member.name),
        };
        text.push_str(&format!("#define {} {alias}\n", member.name));
    }
    text.push('\n');
}

/// Copies `source` line-by-line, blanking `#version` directives and
/// redundant declarations of built-in uniforms so the generated prologue
/// stays the single source of truth. Blanked lines are kept empty rather
/// than removed so the line map stays exact.
fn push_sanitized(text: &mut String, source: &str) {
    const BUILTIN_NAMES: [&str; 12] = [
        "iResolution",
        "iTimeDelta",
        "iTime",
        "iFrameRate",
        "iFrame",
        "iMouse",
        "iDate",
        "iChannelResolution",
        "iTouchCount",
        "iPinch",
        "iSampleRate",
        "iChannel",
    ];
    for line in source.lines() {
        let trimmed = line.trim_start();
        let skip = trimmed.starts_with("#version")
            || (trimmed.starts_with("uniform ")
                && BUILTIN_NAMES.iter().any(|name| trimmed.contains(name)));
        if !skip {
            text.push_str(line);
        }
        text.push('\n');
    }
}

fn apply_cubemap_rewrites(mut user: String, mode: &ChannelMode) -> String {
    match mode {
        ChannelMode::Indexed { cubemap } => {
            for (slot, flagged) in cubemap.iter().enumerate() {
                if *flagged {
                    user = rewrite_texture_calls(&user, &format!("iChannel{slot}"));
                }
            }
        }
        ChannelMode::Named(inputs) => {
            for input in inputs {
                if input.cubemap {
                    user = rewrite_texture_calls(&user, &input.name);
                }
            }
        }
    }
    user
}

/// Rewrites `texture(<sampler>, <expr>)` to route `<expr>` through the
/// equirectangular helper.
///
/// Deliberately narrow: only the exact direct call form is rewritten, and
/// an argument containing its own parentheses is left untouched.
fn rewrite_texture_calls(source: &str, sampler: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let bytes = source.as_bytes();
    let mut cursor = 0usize;

    while let Some(found) = source[cursor..].find("texture") {
        let start = cursor + found;
        out.push_str(&source[cursor..start]);
        cursor = start;

        // Must be a standalone identifier.
        let standalone = start == 0 || {
            let prev = bytes[start - 1] as char;
            !(prev.is_ascii_alphanumeric() || prev == '_')
        };
        let after_ident = start + "texture".len();

        let rewritten = standalone
            .then(|| try_rewrite_call(source, after_ident, sampler))
            .flatten();
        match rewritten {
            Some((replacement, end)) => {
                out.push_str(&replacement);
                cursor = end;
            }
            None => {
                out.push_str("texture");
                cursor = after_ident;
            }
        }
    }
    out.push_str(&source[cursor..]);
    out
}

/// Attempts to match `( <ws> <sampler> <ws> , <expr> )` starting at `pos`
/// and returns the rewritten call text plus the index one past the closing
/// parenthesis.
fn try_rewrite_call(source: &str, pos: usize, sampler: &str) -> Option<(String, usize)> {
    let rest = &source[pos..];
    let open = rest.find(|c: char| !c.is_whitespace())?;
    if rest[open..].chars().next()? != '(' {
        return None;
    }
    let inner = &rest[open + 1..];
    let name_start = inner.find(|c: char| !c.is_whitespace())?;
    let after_name = &inner[name_start..];
    if !after_name.starts_with(sampler) {
        return None;
    }
    let boundary = after_name[sampler.len()..].chars().next()?;
    if boundary.is_ascii_alphanumeric() || boundary == '_' {
        return None;
    }
    let after_sampler = &after_name[sampler.len()..];
    let comma = after_sampler.find(|c: char| !c.is_whitespace())?;
    if after_sampler[comma..].chars().next()? != ',' {
        return None;
    }
    let expr_region = &after_sampler[comma + 1..];
    let close = expr_region.find(')')?;
    let expr = &expr_region[..close];
    if expr.contains('(') {
        return None;
    }

    let replacement = format!("texture({sampler}, _st_dirToEquirect({}))", expr.trim());
    let consumed = pos
        + open
        + 1
        + name_start
        + sampler.len()
        + comma
        + 1
        + close
        + 1;
    Some((replacement, consumed))
}

fn compute_map(text: &str, req: &SourceRequest<'_>) -> SourceMap {
    let mut map = SourceMap {
        common_lines: req
            .common
            .map(|common| common.lines().count() as u32)
            .unwrap_or(0),
        user_lines: req.user_source.lines().count() as u32,
        ..Default::default()
    };
    for (index, line) in text.lines().enumerate() {
        if line == COMMON_MARKER {
            map.common_start_line = index as u32 + 2;
        } else if line == USER_MARKER {
            map.user_start_line = index as u32 + 2;
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(1.0);\n}";

    fn indexed() -> ChannelMode {
        ChannelMode::Indexed {
            cubemap: [false; CHANNEL_SLOTS],
        }
    }

    fn minimal_request<'a>(mode: &'a ChannelMode, layout: &'a Std140Layout) -> SourceRequest<'a> {
        SourceRequest {
            user_source: USER,
            common: None,
            mode,
            scalars: layout,
            ubos: &[],
            peers: &[],
        }
    }

    #[test]
    fn emits_builtin_declarations_and_wrapper() {
        let mode = indexed();
        let layout = Std140Layout::default();
        let built = build(&minimal_request(&mode, &layout));
        assert!(built.text.contains("#define iResolution"));
        assert!(built.text.contains("#define iChannel0"));
        assert!(built.text.contains("#define iPinchCenter"));
        assert!(built.text.contains("mainImage(color, fragCoord)"));
        assert!(built.text.starts_with("#version 450"));
    }

    #[test]
    fn line_map_without_common() {
        let mode = indexed();
        let layout = Std140Layout::default();
        let built = build(&minimal_request(&mode, &layout));
        assert_eq!(built.map.common_start_line, 0);
        assert_eq!(built.map.common_lines, 0);
        assert!(built.map.user_start_line > 0);
        assert_eq!(
            built.map.translate(built.map.user_start_line + 1),
            MappedLine::User(2)
        );
        assert_eq!(built.map.translate(1), MappedLine::Preamble(1));
    }

    #[test]
    fn line_map_with_common() {
        let mode = indexed();
        let layout = Std140Layout::default();
        let mut req = minimal_request(&mode, &layout);
        req.common = Some("float shared_a() { return 1.0; }\nfloat shared_b() { return 2.0; }");
        let built = build(&req);
        assert_eq!(built.map.common_lines, 2);
        assert!(built.map.common_start_line > 0);
        assert_eq!(
            built.map.translate(built.map.common_start_line),
            MappedLine::Common(1)
        );
        assert_eq!(
            built.map.translate(built.map.common_start_line + 1),
            MappedLine::Common(2)
        );
        // The line right after the common section belongs to the preamble.
        assert!(matches!(
            built.map.translate(built.map.common_start_line + 2),
            MappedLine::Preamble(_)
        ));
    }

    #[test]
    fn assembled_line_of_user_code_matches_map() {
        let mode = indexed();
        let layout = Std140Layout::default();
        let built = build(&minimal_request(&mode, &layout));
        let lines: Vec<&str> = built.text.lines().collect();
        let assembled = lines[built.map.user_start_line as usize - 1];
        assert!(assembled.contains("void mainImage"));
    }

    #[test]
    fn emits_ubo_block_with_count_alias() {
        let mode = indexed();
        let layout = Std140Layout::new([("lights_count".to_string(), ScalarType::Int)]);
        let ubos = vec![UboDecl {
            name: "lights".to_string(),
            ty: ElementType::Vec4,
            count: 16,
            binding: UBO_BINDING_BASE,
        }];
        let mut req = minimal_request(&mode, &layout);
        req.ubos = &ubos;
        let built = build(&req);
        assert!(built
            .text
            .contains("layout(std140, set = 0, binding = 3) uniform _ub_lights"));
        assert!(built.text.contains("vec4 _lights[16];"));
        assert!(built.text.contains("#define lights _sb_ub_lights._lights"));
        assert!(built
            .text
            .contains("#define lights_count int(_sb_custom._lights_count)"));
    }

    #[test]
    fn named_mode_emits_resolution_aliases_and_keyboard_helpers() {
        let mode = ChannelMode::Named(vec![
            NamedInput {
                name: "feedback".to_string(),
                slot: 0,
                cubemap: false,
            },
            NamedInput {
                name: "keyboard".to_string(),
                slot: 1,
                cubemap: false,
            },
        ]);
        let layout = Std140Layout::default();
        let built = build(&minimal_request(&mode, &layout));
        assert!(built.text.contains("#define feedback sampler2D("));
        assert!(built
            .text
            .contains("#define feedback_resolution (_sb_frame._channel_resolution[0].xy)"));
        assert!(built.text.contains("float keyDown(int code)"));
        assert!(!built.text.contains("#define iChannel0"));
    }

    #[test]
    fn cubemap_rewrite_wraps_direct_calls_only() {
        let rewritten = rewrite_texture_calls(
            "vec4 a = texture(iChannel0, dir); vec4 b = texture(iChannel1, dir);",
            "iChannel0",
        );
        assert!(rewritten.contains("texture(iChannel0, _st_dirToEquirect(dir))"));
        assert!(rewritten.contains("texture(iChannel1, dir)"));
    }

    #[test]
    fn cubemap_rewrite_preserves_nested_paren_restriction() {
        let source = "vec4 a = texture(iChannel0, normalize(dir));";
        assert_eq!(rewrite_texture_calls(source, "iChannel0"), source);
    }

    #[test]
    fn cubemap_rewrite_ignores_identifier_suffixes() {
        let source = "vec4 a = mytexture(iChannel0, dir);";
        assert_eq!(rewrite_texture_calls(source, "iChannel0"), source);
    }

    #[test]
    fn sanitizer_blanks_but_keeps_lines() {
        let mode = indexed();
        let layout = Std140Layout::default();
        let mut req = minimal_request(&mode, &layout);
        let source = "#version 300 es\nuniform float iTime;\nvoid mainImage(out vec4 c, in vec2 f) { c = vec4(iTime); }";
        req.user_source = source;
        let built = build(&req);
        assert!(!built.text.contains("#version 300 es"));
        assert!(!built.text.contains("uniform float iTime"));
        assert_eq!(built.map.user_lines, 3);
        let lines: Vec<&str> = built.text.lines().collect();
        // Blanked lines keep their place so the third user line still maps.
        assert!(lines[built.map.user_start_line as usize + 1].contains("mainImage"));
    }
}
