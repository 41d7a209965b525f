use std::fmt::Write;

use bytemuck::{Pod, Zeroable};

use super::{
    AlphaCycle, AlphaInput, AlphaStage, ColorCycle, ColorInput, ColorStage, CombinerAccuracy,
    CombinerFlags, CombinerKey,
};
use crate::backend::BackendCaps;

/// Uniform block consumed by every combiner program.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CombinerUniforms {
    pub prim_color: [f32; 4],
    pub env_color: [f32; 4],
    pub fog_color: [f32; 4],
    pub blend_color: [f32; 4],
    pub key_center: [f32; 4],
    pub key_scale: [f32; 4],
    /// (prim_lod_frac, k4, k5, alpha_ref).
    pub params: [f32; 4],
}

impl CombinerUniforms {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Convert a packed `0xRRGGBBAA` color into normalized floats.
pub(crate) fn rgba_to_f32(c: u32) -> [f32; 4] {
    c.to_be_bytes().map(|v| v as f32 / 255.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformField {
    pub name: &'static str,
    pub offset: u32,
    pub size: u32,
}

/// Binding layout a backend needs to drive a combiner program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformLayout {
    pub fields: Vec<UniformField>,
    /// Size of the uniform block in bytes.
    pub size: u32,
    /// Textures bound at `@group(1)`, followed by one sampler.
    pub texture_bindings: u32,
}

const UNIFORM_FIELDS: [&str; 7] = [
    "prim_color",
    "env_color",
    "fog_color",
    "blend_color",
    "key_center",
    "key_scale",
    "params",
];

impl UniformLayout {
    pub fn for_program(textured: bool) -> Self {
        let fields: Vec<UniformField> = UNIFORM_FIELDS
            .iter()
            .enumerate()
            .map(|(i, name)| UniformField {
                name,
                offset: i as u32 * 16,
                size: 16,
            })
            .collect();
        debug_assert_eq!(
            fields.len() * 16,
            std::mem::size_of::<CombinerUniforms>()
        );
        Self {
            size: std::mem::size_of::<CombinerUniforms>() as u32,
            fields,
            texture_bindings: if textured { 2 } else { 0 },
        }
    }
}

fn write_prelude(wgsl: &mut String, textured: bool) {
    wgsl.push_str("struct CombinerUniforms {\n");
    for name in UNIFORM_FIELDS {
        let _ = writeln!(wgsl, "  {name}: vec4<f32>,");
    }
    wgsl.push_str("}\n\n");
    wgsl.push_str("@group(0) @binding(0) var<uniform> u: CombinerUniforms;\n");
    if textured {
        wgsl.push_str("@group(1) @binding(0) var tex0: texture_2d<f32>;\n");
        wgsl.push_str("@group(1) @binding(1) var tex1: texture_2d<f32>;\n");
        wgsl.push_str("@group(1) @binding(2) var samp: sampler;\n");
    }
    wgsl.push_str(
        "\nstruct VertexIn {\n  @location(0) position: vec4<f32>,\n  @location(1) color: vec4<f32>,\n  @location(2) uv: vec2<f32>,\n}\n\n",
    );
    wgsl.push_str(
        "struct VertexOut {\n  @builtin(position) position: vec4<f32>,\n  @location(0) shade: vec4<f32>,\n  @location(1) uv: vec2<f32>,\n}\n\n",
    );
    wgsl.push_str("@vertex\nfn vs_main(input: VertexIn) -> VertexOut {\n  var out: VertexOut;\n");
    wgsl.push_str("  out.position = input.position;\n  out.shade = input.color;\n  out.uv = input.uv;\n  return out;\n}\n\n");
}

fn write_texels(wgsl: &mut String, textured: bool) {
    if textured {
        wgsl.push_str("  let texel0 = textureSample(tex0, samp, input.uv);\n");
        wgsl.push_str("  let texel1 = textureSample(tex1, samp, input.uv);\n");
    } else {
        // Untextured draws that still select a texel see white.
        wgsl.push_str("  let texel0 = vec4<f32>(1.0);\n  let texel1 = vec4<f32>(1.0);\n");
    }
    wgsl.push_str("  let shade = input.shade;\n");
}

fn color_expr(input: ColorInput) -> &'static str {
    match input {
        ColorInput::Combined => "combined.rgb",
        ColorInput::Texel0 => "texel0.rgb",
        ColorInput::Texel1 => "texel1.rgb",
        ColorInput::Primitive => "u.prim_color.rgb",
        ColorInput::Shade => "shade.rgb",
        ColorInput::Environment => "u.env_color.rgb",
        ColorInput::One => "vec3<f32>(1.0)",
        ColorInput::Noise => "vec3<f32>(noise)",
        ColorInput::Zero => "vec3<f32>(0.0)",
        ColorInput::KeyCenter => "u.key_center.rgb",
        ColorInput::K4 => "vec3<f32>(u.params.y)",
        ColorInput::KeyScale => "u.key_scale.rgb",
        ColorInput::CombinedAlpha => "vec3<f32>(combined.a)",
        ColorInput::Texel0Alpha => "vec3<f32>(texel0.a)",
        ColorInput::Texel1Alpha => "vec3<f32>(texel1.a)",
        ColorInput::PrimitiveAlpha => "vec3<f32>(u.prim_color.a)",
        ColorInput::ShadeAlpha => "vec3<f32>(shade.a)",
        ColorInput::EnvAlpha => "vec3<f32>(u.env_color.a)",
        ColorInput::LodFraction => "vec3<f32>(lod_frac)",
        ColorInput::PrimLodFraction => "vec3<f32>(u.params.x)",
        ColorInput::K5 => "vec3<f32>(u.params.z)",
    }
}

fn alpha_expr(input: AlphaInput) -> &'static str {
    match input {
        AlphaInput::Combined => "combined.a",
        AlphaInput::Texel0 => "texel0.a",
        AlphaInput::Texel1 => "texel1.a",
        AlphaInput::Primitive => "u.prim_color.a",
        AlphaInput::Shade => "shade.a",
        AlphaInput::Environment => "u.env_color.a",
        AlphaInput::One => "1.0",
        AlphaInput::Zero => "0.0",
        AlphaInput::LodFraction => "lod_frac",
        AlphaInput::PrimLodFraction => "u.params.x",
    }
}

fn write_cycle(wgsl: &mut String, n: usize, color: &ColorCycle, alpha: &AlphaCycle) {
    let _ = writeln!(
        wgsl,
        "  let c{n} = clamp(({} - {}) * {} + {}, vec3<f32>(0.0), vec3<f32>(1.0));",
        color_expr(color.a),
        color_expr(color.b),
        color_expr(color.c),
        color_expr(color.d),
    );
    let _ = writeln!(
        wgsl,
        "  let a{n} = clamp(({} - {}) * {} + {}, 0.0, 1.0);",
        alpha_expr(alpha.a),
        alpha_expr(alpha.b),
        alpha_expr(alpha.c),
        alpha_expr(alpha.d),
    );
    let _ = writeln!(wgsl, "  combined = vec4<f32>(c{n}, a{n});");
}

fn write_output(wgsl: &mut String, flags: CombinerFlags) {
    wgsl.push_str("  var out_color = combined;\n");
    if flags.contains(CombinerFlags::ALPHA_CVG_SEL) && !flags.contains(CombinerFlags::CVG_X_ALPHA) {
        // Coverage replaces alpha; every covered pixel is fully covered here.
        wgsl.push_str("  out_color.a = 1.0;\n");
    }
    if flags.contains(CombinerFlags::ALPHA_COMPARE) {
        wgsl.push_str("  if (out_color.a < u.params.w) {\n    discard;\n  }\n");
    }
    if flags.contains(CombinerFlags::FOG) {
        wgsl.push_str(
            "  out_color = vec4<f32>(mix(out_color.rgb, u.fog_color.rgb, shade.a), out_color.a);\n",
        );
    }
    wgsl.push_str("  return out_color;\n}\n");
}

/// Translate a combiner configuration into a WGSL module with `vs_main` and
/// `fs_main`.
///
/// Output depends only on the arguments.
pub fn generate_wgsl(
    color: &ColorStage,
    alpha: &AlphaStage,
    key: &CombinerKey,
    accuracy: CombinerAccuracy,
    caps: BackendCaps,
) -> String {
    let textured = key.flags.contains(CombinerFlags::TEXTURE_PRESENT);
    let two_cycle = key.is_two_cycle();
    let accurate = accuracy == CombinerAccuracy::Accurate;

    let mut wgsl = String::new();
    let _ = writeln!(wgsl, "// combiner {:032x}", key.packed());
    write_prelude(&mut wgsl, textured);

    if accurate {
        wgsl.push_str("fn rand_noise(p: vec2<f32>) -> f32 {\n  return fract(sin(dot(p, vec2<f32>(12.9898, 78.233))) * 43758.5453);\n}\n\n");
    }

    wgsl.push_str("@fragment\nfn fs_main(input: VertexOut) -> @location(0) vec4<f32> {\n");
    write_texels(&mut wgsl, textured);
    if accurate {
        wgsl.push_str("  let noise = rand_noise(input.position.xy);\n");
    } else {
        wgsl.push_str("  let noise: f32 = 0.5;\n");
    }
    if accurate && caps.contains(BackendCaps::SHADER_DERIVATIVES) {
        wgsl.push_str("  let footprint = max(length(dpdx(input.uv)), length(dpdy(input.uv)));\n");
        wgsl.push_str("  let lod_frac = fract(clamp(log2(max(footprint * 256.0, 1.0)), 0.0, 7.0));\n");
    } else {
        wgsl.push_str("  let lod_frac = u.params.x;\n");
    }
    wgsl.push_str("  var combined = vec4<f32>(0.0);\n");

    write_cycle(&mut wgsl, 0, &color.cycles[0], &alpha.cycles[0]);
    if two_cycle {
        write_cycle(&mut wgsl, 1, &color.cycles[1], &alpha.cycles[1]);
    }
    write_output(&mut wgsl, key.flags);
    wgsl
}

/// Program that keeps only the dominant term of a configuration: the first
/// texel if the color combiner reads one, otherwise shade.
pub fn passthrough_wgsl(color: &ColorStage, key: &CombinerKey) -> String {
    let textured = key.flags.contains(CombinerFlags::TEXTURE_PRESENT);
    let cycles = if key.is_two_cycle() { 2 } else { 1 };
    let reads_texel = color.cycles[..cycles].iter().any(|c| {
        c.reads(ColorInput::Texel0)
            || c.reads(ColorInput::Texel1)
            || c.reads(ColorInput::Texel0Alpha)
            || c.reads(ColorInput::Texel1Alpha)
    });

    let mut wgsl = String::new();
    let _ = writeln!(wgsl, "// passthrough {:032x}", key.packed());
    write_prelude(&mut wgsl, textured);
    wgsl.push_str("@fragment\nfn fs_main(input: VertexOut) -> @location(0) vec4<f32> {\n");
    write_texels(&mut wgsl, textured);
    if reads_texel {
        wgsl.push_str("  var combined = texel0 * shade;\n");
    } else {
        wgsl.push_str("  var combined = shade;\n");
    }
    write_output(&mut wgsl, key.flags & (CombinerFlags::ALPHA_COMPARE | CombinerFlags::FOG));
    wgsl
}
