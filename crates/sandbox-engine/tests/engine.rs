//! End-to-end render tests.
//!
//! These need a real adapter; environments without one (or without
//! filterable float textures) skip instead of failing so the suite stays
//! green on headless CI runners.

use sandbox_engine::{Engine, EngineError, UniformValue};
use sandbox_project::{
    ChannelSource, DefaultValue, ElementType, PassConfig, PassName, Project, ScalarType,
    UniformDecl,
};

const WIDTH: u32 = 8;
const HEIGHT: u32 = 8;

fn engine_or_skip(project: Project) -> Option<Engine> {
    match Engine::new(project, WIDTH, HEIGHT) {
        Ok(engine) => Some(engine),
        Err(EngineError::MissingImagePass) => panic!("project under test lost its image pass"),
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
    }
}

/// Steps one frame at a fixed 60 fps cadence.
fn advance(engine: &mut Engine) {
    let time = engine.time() + 1.0 / 60.0;
    engine.step(time);
}

fn image_pixels(engine: &Engine) -> Vec<u8> {
    engine
        .read_pixels(PassName::Image, 0, 0, WIDTH, HEIGHT)
        .expect("readback")
}

fn center_pixel(pixels: &[u8]) -> [u8; 4] {
    let index = ((HEIGHT / 2 * WIDTH + WIDTH / 2) * 4) as usize;
    [
        pixels[index],
        pixels[index + 1],
        pixels[index + 2],
        pixels[index + 3],
    ]
}

fn assert_close(actual: u8, expected: u8) {
    assert!(
        actual.abs_diff(expected) <= 2,
        "pixel component {actual} not within tolerance of {expected}"
    );
}

#[test]
fn brightness_uniform_drives_output() {
    let mut project = Project::single_image(
        "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(vec3(brightness), 1.0);\n}",
    );
    project.uniforms.insert(
        "brightness".to_string(),
        UniformDecl::Scalar {
            ty: ScalarType::Float,
            default: Some(DefaultValue::Number(1.0)),
            range: None,
        },
    );
    let Some(mut engine) = engine_or_skip(project) else {
        return;
    };

    advance(&mut engine);
    let pixels = image_pixels(&engine);
    assert_eq!(pixels.len(), (WIDTH * HEIGHT * 4) as usize);
    assert_close(center_pixel(&pixels)[0], 255);

    engine.set_uniform("brightness", UniformValue::Float(0.5));
    advance(&mut engine);
    let [r, g, b, a] = center_pixel(&image_pixels(&engine));
    assert_close(r, 128);
    assert_close(g, 128);
    assert_close(b, 128);
    assert_eq!(a, 255);
}

#[test]
fn single_pixel_region_readback() {
    let Some(mut engine) = engine_or_skip(Project::single_image(
        "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(1.0);\n}",
    )) else {
        return;
    };
    advance(&mut engine);
    let pixel = engine
        .read_pixels(PassName::Image, 0, 0, 1, 1)
        .expect("readback");
    assert_eq!(pixel, vec![255, 255, 255, 255]);

    let err = engine
        .read_pixels(PassName::Image, WIDTH, 0, 1, 1)
        .expect_err("out-of-bounds region");
    assert!(matches!(err, EngineError::Readback(_)));
}

#[test]
fn missing_buffer_reference_samples_black() {
    let project = Project {
        passes: [(
            PassName::Image,
            PassConfig::new(
                "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = texture(iChannel0, fragCoord / iResolution.xy);\n}",
            )
            .with_channel(
                0,
                ChannelSource::Buffer {
                    name: PassName::BufferA,
                    use_current: false,
                },
            ),
        )]
        .into(),
        ..Default::default()
    };
    // Construction must survive the dangling reference.
    let Some(mut engine) = engine_or_skip(project) else {
        return;
    };
    advance(&mut engine);
    let [r, g, b, a] = center_pixel(&image_pixels(&engine));
    assert_eq!([r, g, b], [0, 0, 0]);
    assert_eq!(a, 255);
}

#[test]
fn unbound_channel_reports_zero_resolution() {
    // The dangling buffer reference binds black; iChannelResolution must
    // read zero so shaders can detect the unbound slot.
    let project = Project {
        passes: [(
            PassName::Image,
            PassConfig::new(
                "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(iChannelResolution[0].xyz, 1.0);\n}",
            )
            .with_channel(
                0,
                ChannelSource::Buffer {
                    name: PassName::BufferA,
                    use_current: false,
                },
            ),
        )]
        .into(),
        ..Default::default()
    };
    let Some(mut engine) = engine_or_skip(project) else {
        return;
    };
    advance(&mut engine);
    let [r, g, b, a] = center_pixel(&image_pixels(&engine));
    assert_eq!([r, g, b], [0, 0, 0]);
    assert_eq!(a, 255);
}

#[test]
fn broken_producer_keeps_readers_black_every_frame() {
    let project = Project {
        passes: [
            (PassName::BufferA, PassConfig::new("this is not glsl")),
            (
                PassName::Image,
                PassConfig::new(
                    "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(texture(iChannel0, fragCoord / iResolution.xy).rgb, 1.0);\n}",
                )
                .with_channel(
                    0,
                    ChannelSource::Buffer {
                        name: PassName::BufferA,
                        use_current: false,
                    },
                ),
            ),
        ]
        .into(),
        ..Default::default()
    };
    let Some(mut engine) = engine_or_skip(project) else {
        return;
    };
    assert!(engine.has_errors());

    // The skipped pass must present the same (black) content on every
    // frame, not alternate between its two targets.
    for _ in 0..3 {
        advance(&mut engine);
        let [r, g, b, a] = center_pixel(&image_pixels(&engine));
        assert_eq!([r, g, b], [0, 0, 0]);
        assert_eq!(a, 255);
    }
}

fn feedback_project(use_current: bool) -> Project {
    Project {
        passes: [
            (
                PassName::BufferA,
                PassConfig::new(
                    "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    float prev = texture(iChannel0, fragCoord / iResolution.xy).r;\n    fragColor = vec4(prev + 0.1, 0.0, 0.0, 1.0);\n}",
                )
                .with_channel(
                    0,
                    ChannelSource::Buffer {
                        name: PassName::BufferA,
                        use_current: false,
                    },
                ),
            ),
            (
                PassName::Image,
                PassConfig::new(
                    "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(texture(iChannel0, fragCoord / iResolution.xy).r, 0.0, 0.0, 1.0);\n}",
                )
                .with_channel(
                    0,
                    ChannelSource::Buffer {
                        name: PassName::BufferA,
                        use_current,
                    },
                ),
            ),
        ]
        .into(),
        ..Default::default()
    }
}

#[test]
fn self_feedback_accumulates_one_step_per_frame() {
    let Some(mut engine) = engine_or_skip(feedback_project(false)) else {
        return;
    };
    // The image pass trails the accumulator by one frame: frame 3 writes
    // 0.3 into BufferA while the image still samples frame 2's 0.2.
    advance(&mut engine);
    advance(&mut engine);
    advance(&mut engine);
    assert_close(center_pixel(&image_pixels(&engine))[0], 51);

    // BufferA itself already holds 0.3.
    let buffer = engine
        .read_pixels(PassName::BufferA, 0, 0, WIDTH, HEIGHT)
        .expect("readback");
    assert_close(center_pixel(&buffer)[0], 77);
}

#[test]
fn use_current_reads_same_frame_output() {
    let Some(mut engine) = engine_or_skip(feedback_project(true)) else {
        return;
    };
    advance(&mut engine);
    // With use_current the image sees BufferA's 0.1 immediately.
    assert_close(center_pixel(&image_pixels(&engine))[0], 26);
}

#[test]
fn recompile_failure_keeps_previous_pipeline() {
    let Some(mut engine) = engine_or_skip(Project::single_image(
        "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(1.0, 0.0, 0.0, 1.0);\n}",
    )) else {
        return;
    };
    advance(&mut engine);

    let err = engine
        .recompile_pass(
            PassName::Image,
            "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(1.0\n}",
        )
        .expect_err("broken shader must not compile");
    assert!(matches!(err, EngineError::Compile(_)));
    assert!(engine.has_errors());

    // The old pipeline keeps rendering.
    advance(&mut engine);
    let [r, g, b, _] = center_pixel(&image_pixels(&engine));
    assert_close(r, 255);
    assert_eq!([g, b], [0, 0]);

    // A good recompile clears the recorded error.
    engine
        .recompile_pass(
            PassName::Image,
            "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(0.0, 1.0, 0.0, 1.0);\n}",
        )
        .expect("valid shader");
    assert!(!engine.has_errors());
    advance(&mut engine);
    assert_close(center_pixel(&image_pixels(&engine))[1], 255);
}

#[test]
fn recompile_preserves_feedback_content() {
    let Some(mut engine) = engine_or_skip(feedback_project(false)) else {
        return;
    };
    advance(&mut engine);
    advance(&mut engine);

    // Same accumulator source; the recompile must keep the 0.2 already in
    // the buffer rather than restarting from black.
    engine
        .recompile_pass(
            PassName::BufferA,
            "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    float prev = texture(iChannel0, fragCoord / iResolution.xy).r;\n    fragColor = vec4(prev + 0.1, 0.0, 0.0, 1.0);\n}",
        )
        .expect("valid shader");
    advance(&mut engine);
    let buffer = engine
        .read_pixels(PassName::BufferA, 0, 0, WIDTH, HEIGHT)
        .expect("readback");
    assert_close(center_pixel(&buffer)[0], 77);
}

#[test]
fn common_recompile_is_all_or_nothing() {
    let mut project = Project::single_image(
        "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(vec3(shared_level()), 1.0);\n}",
    );
    project.common = Some("float shared_level() { return 0.25; }".to_string());
    let Some(mut engine) = engine_or_skip(project) else {
        return;
    };
    advance(&mut engine);
    assert_close(center_pixel(&image_pixels(&engine))[0], 64);

    // Removing the helper breaks the image pass, so nothing may change.
    let failures = engine
        .recompile_common(Some("float unrelated() { return 0.0; }".to_string()))
        .expect_err("common without shared_level must fail");
    assert!(!failures.is_empty());

    advance(&mut engine);
    assert_close(center_pixel(&image_pixels(&engine))[0], 64);

    engine
        .recompile_common(Some("float shared_level() { return 0.75; }".to_string()))
        .expect("valid common");
    advance(&mut engine);
    assert_close(center_pixel(&image_pixels(&engine))[0], 191);
}

#[test]
fn array_uniform_reaches_shader() {
    let mut project = Project::single_image(
        "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(lights[0] * float(lights_count) / 2.0, 1.0);\n}",
    );
    project.uniforms.insert(
        "lights".to_string(),
        UniformDecl::Array {
            ty: ElementType::Vec3,
            count: 4,
        },
    );
    let Some(mut engine) = engine_or_skip(project) else {
        return;
    };

    engine.set_array("lights", &[1.0, 0.5, 0.0, 0.0, 0.0, 0.0]);
    advance(&mut engine);
    let [r, g, b, _] = center_pixel(&image_pixels(&engine));
    assert_close(r, 255); // 1.0 * 2 live elements / 2
    assert_close(g, 128);
    assert_eq!(b, 0);
}

#[test]
fn resize_changes_readback_dimensions() {
    let Some(mut engine) = engine_or_skip(Project::single_image(
        "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(1.0);\n}",
    )) else {
        return;
    };
    advance(&mut engine);
    engine.resize(4, 2);
    advance(&mut engine);
    let pixels = engine
        .read_pixels(PassName::Image, 0, 0, 4, 2)
        .expect("readback");
    assert_eq!(pixels.len(), 4 * 2 * 4);
}

#[test]
fn disposed_engine_ignores_step() {
    let Some(mut engine) = engine_or_skip(Project::single_image(
        "void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n    fragColor = vec4(1.0);\n}",
    )) else {
        return;
    };
    advance(&mut engine);
    let frame = engine.frame();
    engine.dispose();
    advance(&mut engine);
    assert_eq!(engine.frame(), frame);
}
