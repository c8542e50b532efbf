//! # Pixel pipeline
//!
//! The fixed-function per-pixel policy shared by every renderer backend.
//! Each stage may discard the fragment:
//!
//! ```text
//!   scissor ─▶ depth range ─▶ depth test ─▶ texture ─▶ tex function
//!      ─▶ alpha test ─▶ blend ─▶ color write (dst alpha kept) ─▶ depth write
//! ```
//!
//! A [`PixelPipeline`] holds the configuration bits that select stages and
//! modes; it can be rebuilt from a compact [`PipelineKey`]. Values that
//! change often without changing the shape of the pipeline (reference
//! values, fixed colors, scissor) travel separately in [`Uniforms`].

use crate::bitwise::Bits;
use crate::memory::Memory;

use super::color::{Color, PixelFormat};
use super::state::{BlendFactor, BlendOp, GpuState, Scissor, TestFunc, TextureFunc};
use super::texture::Texture;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureStage {
    pub func: TextureFunc,
    pub use_alpha: bool,
    pub doubling: bool,
    pub linear: bool,
    pub clamp_u: bool,
    pub clamp_v: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClearStage {
    pub color: bool,
    pub alpha: bool,
    pub depth: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendStage {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
}

/// Fixed-function configuration of one draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PixelPipeline {
    pub through: bool,
    pub gouraud: bool,
    /// Set in clear mode, which skips every test and the texture.
    pub clear: Option<ClearStage>,
    pub depth_test: Option<TestFunc>,
    pub depth_write: bool,
    pub texture: Option<TextureStage>,
    pub alpha_test: Option<TestFunc>,
    pub blend: Option<BlendStage>,
}

/// Feature bitset identifying a [`PixelPipeline`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineKey(pub u64);

// bit layout of PipelineKey
const KEY_THROUGH: u8 = 0;
const KEY_GOURAUD: u8 = 1;
const KEY_CLEAR: u8 = 2;
const KEY_CLEAR_COLOR: u8 = 3;
const KEY_CLEAR_ALPHA: u8 = 4;
const KEY_CLEAR_DEPTH: u8 = 5;
const KEY_DEPTH_TEST: u8 = 6;
const KEY_DEPTH_FUNC: std::ops::RangeInclusive<u8> = 7..=9;
const KEY_DEPTH_WRITE: u8 = 10;
const KEY_TEXTURE: u8 = 11;
const KEY_TEX_FUNC: std::ops::RangeInclusive<u8> = 12..=14;
const KEY_TEX_ALPHA: u8 = 15;
const KEY_TEX_DOUBLE: u8 = 16;
const KEY_TEX_LINEAR: u8 = 17;
const KEY_TEX_CLAMP_U: u8 = 18;
const KEY_TEX_CLAMP_V: u8 = 19;
const KEY_ALPHA_TEST: u8 = 20;
const KEY_ALPHA_FUNC: std::ops::RangeInclusive<u8> = 21..=23;
const KEY_BLEND: u8 = 24;
const KEY_BLEND_SRC: std::ops::RangeInclusive<u8> = 25..=28;
const KEY_BLEND_DST: std::ops::RangeInclusive<u8> = 29..=32;
const KEY_BLEND_OP: std::ops::RangeInclusive<u8> = 33..=35;

const fn texture_func_bits(func: TextureFunc) -> u64 {
    match func {
        TextureFunc::Modulate => 0,
        TextureFunc::Decal => 1,
        TextureFunc::Blend => 2,
        TextureFunc::Replace => 3,
        TextureFunc::Add => 4,
    }
}

const fn test_func_bits(func: TestFunc) -> u64 {
    match func {
        TestFunc::Never => 0,
        TestFunc::Always => 1,
        TestFunc::Equal => 2,
        TestFunc::NotEqual => 3,
        TestFunc::Less => 4,
        TestFunc::LessEqual => 5,
        TestFunc::Greater => 6,
        TestFunc::GreaterEqual => 7,
    }
}

const fn blend_factor_bits(factor: BlendFactor) -> u64 {
    match factor {
        BlendFactor::OtherColor => 0,
        BlendFactor::InverseOtherColor => 1,
        BlendFactor::SourceAlpha => 2,
        BlendFactor::InverseSourceAlpha => 3,
        BlendFactor::DestAlpha => 4,
        BlendFactor::InverseDestAlpha => 5,
        BlendFactor::DoubleSourceAlpha => 6,
        BlendFactor::InverseDoubleSourceAlpha => 7,
        BlendFactor::DoubleDestAlpha => 8,
        BlendFactor::InverseDoubleDestAlpha => 9,
        BlendFactor::Fixed => 10,
    }
}

const fn blend_op_bits(op: BlendOp) -> u64 {
    match op {
        BlendOp::Add => 0,
        BlendOp::Subtract => 1,
        BlendOp::ReverseSubtract => 2,
        BlendOp::Min => 3,
        BlendOp::Max => 4,
        BlendOp::AbsoluteDifference => 5,
    }
}

impl PipelineKey {
    /// Packs the draw-shaping parts of the GE state.
    #[must_use]
    pub fn from_state(state: &GpuState, through: bool) -> Self {
        let mut key = 0u64;
        key.set_bit(KEY_THROUGH, through);
        key.set_bit(KEY_GOURAUD, state.gouraud());
        if state.clear_mode() {
            let (color, alpha, depth) = state.clear_flags();
            key.set_bit(KEY_CLEAR, true);
            key.set_bit(KEY_CLEAR_COLOR, color);
            key.set_bit(KEY_CLEAR_ALPHA, alpha);
            key.set_bit(KEY_CLEAR_DEPTH, depth);
            return Self(key);
        }
        if state.depth_test_enabled() {
            key.set_bit(KEY_DEPTH_TEST, true);
            key.set_bits(KEY_DEPTH_FUNC, test_func_bits(state.depth_func()));
            key.set_bit(KEY_DEPTH_WRITE, state.depth_write_enabled());
        }
        if state.texture_enabled() {
            let (clamp_u, clamp_v) = state.texture_clamp();
            key.set_bit(KEY_TEXTURE, true);
            key.set_bits(KEY_TEX_FUNC, texture_func_bits(state.texture_func()));
            key.set_bit(KEY_TEX_ALPHA, state.texture_alpha());
            key.set_bit(KEY_TEX_DOUBLE, state.texture_doubling());
            key.set_bit(KEY_TEX_LINEAR, state.texture_linear());
            key.set_bit(KEY_TEX_CLAMP_U, clamp_u);
            key.set_bit(KEY_TEX_CLAMP_V, clamp_v);
        }
        if state.alpha_test_enabled() {
            key.set_bit(KEY_ALPHA_TEST, true);
            key.set_bits(KEY_ALPHA_FUNC, test_func_bits(state.alpha_test().0));
        }
        if state.blend_enabled() {
            let (src, dst, op) = state.blend_mode();
            key.set_bit(KEY_BLEND, true);
            key.set_bits(KEY_BLEND_SRC, blend_factor_bits(src));
            key.set_bits(KEY_BLEND_DST, blend_factor_bits(dst));
            key.set_bits(KEY_BLEND_OP, blend_op_bits(op));
        }
        Self(key)
    }
}

impl PixelPipeline {
    #[must_use]
    pub fn from_state(state: &GpuState, through: bool) -> Self {
        Self::from_key(PipelineKey::from_state(state, through))
    }

    /// Rebuilds the configuration a key describes.
    #[must_use]
    pub fn from_key(key: PipelineKey) -> Self {
        let bits = key.0;
        let clear = bits.get_bit(KEY_CLEAR).then(|| ClearStage {
            color: bits.get_bit(KEY_CLEAR_COLOR),
            alpha: bits.get_bit(KEY_CLEAR_ALPHA),
            depth: bits.get_bit(KEY_CLEAR_DEPTH),
        });
        Self {
            through: bits.get_bit(KEY_THROUGH),
            gouraud: bits.get_bit(KEY_GOURAUD),
            clear,
            depth_test: bits
                .get_bit(KEY_DEPTH_TEST)
                .then(|| TestFunc::from_bits(bits.get_bits(KEY_DEPTH_FUNC) as u32)),
            depth_write: bits.get_bit(KEY_DEPTH_WRITE),
            texture: bits.get_bit(KEY_TEXTURE).then(|| TextureStage {
                func: TextureFunc::from_bits(bits.get_bits(KEY_TEX_FUNC) as u32),
                use_alpha: bits.get_bit(KEY_TEX_ALPHA),
                doubling: bits.get_bit(KEY_TEX_DOUBLE),
                linear: bits.get_bit(KEY_TEX_LINEAR),
                clamp_u: bits.get_bit(KEY_TEX_CLAMP_U),
                clamp_v: bits.get_bit(KEY_TEX_CLAMP_V),
            }),
            alpha_test: bits
                .get_bit(KEY_ALPHA_TEST)
                .then(|| TestFunc::from_bits(bits.get_bits(KEY_ALPHA_FUNC) as u32)),
            blend: bits.get_bit(KEY_BLEND).then(|| BlendStage {
                src: BlendFactor::from_bits(bits.get_bits(KEY_BLEND_SRC) as u32),
                dst: BlendFactor::from_bits(bits.get_bits(KEY_BLEND_DST) as u32),
                op: BlendOp::from_bits(bits.get_bits(KEY_BLEND_OP) as u32),
            }),
        }
    }
}

/// Per-draw values that do not change the pipeline's shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Uniforms {
    pub scissor: Scissor,
    pub depth_range: (u16, u16),
    pub alpha_ref: u8,
    pub alpha_mask: u8,
    pub env_color: Color,
    pub fixed_a: Color,
    pub fixed_b: Color,
    pub color_mask: u32,
}

impl Uniforms {
    #[must_use]
    pub fn from_state(state: &GpuState) -> Self {
        let (_, alpha_ref, alpha_mask) = state.alpha_test();
        let (fixed_a, fixed_b) = state.blend_fixed();
        Self {
            scissor: state.scissor(),
            depth_range: state.depth_range(),
            alpha_ref,
            alpha_mask,
            env_color: state.texture_env_color(),
            fixed_a,
            fixed_b,
            color_mask: state.color_mask(),
        }
    }
}

/// Color and depth buffers in guest memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderTarget {
    pub color: u32,
    pub color_stride: u32,
    pub format: PixelFormat,
    pub depth: u32,
    pub depth_stride: u32,
}

impl RenderTarget {
    fn color_address(&self, x: u32, y: u32) -> u32 {
        self.color + (y * self.color_stride + x) * self.format.bytes_per_pixel()
    }

    fn depth_address(&self, x: u32, y: u32) -> u32 {
        self.depth + (y * self.depth_stride + x) * 2
    }

    #[must_use]
    pub fn read_color(&self, memory: &Memory, x: u32, y: u32) -> Color {
        let address = self.color_address(x, y);
        let raw = match self.format {
            PixelFormat::Rgba8888 => memory.read_u32(address),
            _ => u32::from(memory.read_u16(address)),
        };
        Color::decode(raw, self.format)
    }

    fn write_raw(&self, memory: &mut Memory, x: u32, y: u32, raw: u32) {
        let address = self.color_address(x, y);
        match self.format {
            PixelFormat::Rgba8888 => memory.write_u32(address, raw),
            _ => memory.write_u16(address, raw as u16),
        }
    }

    fn read_raw(&self, memory: &Memory, x: u32, y: u32) -> u32 {
        let address = self.color_address(x, y);
        match self.format {
            PixelFormat::Rgba8888 => memory.read_u32(address),
            _ => u32::from(memory.read_u16(address)),
        }
    }

    #[must_use]
    pub fn read_depth(&self, memory: &Memory, x: u32, y: u32) -> u16 {
        memory.read_u16(self.depth_address(x, y))
    }

    fn write_depth(&self, memory: &mut Memory, x: u32, y: u32, z: u16) {
        memory.write_u16(self.depth_address(x, y), z);
    }
}

/// An interpolated sample inside a primitive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fragment {
    pub x: u32,
    pub y: u32,
    pub z: u16,
    pub u: f32,
    pub v: f32,
    pub color: Color,
}

const fn mul8(a: u8, b: u8) -> u8 {
    ((a as u32 * b as u32 + 127) / 255) as u8
}

const fn add8(a: u8, b: u8) -> u8 {
    let sum = a as u32 + b as u32;
    if sum > 255 { 255 } else { sum as u8 }
}

const fn lerp8(from: u8, to: u8, t: u8) -> u8 {
    ((from as u32 * (255 - t as u32) + to as u32 * t as u32 + 127) / 255) as u8
}

fn map_channels(a: Color, b: Color, f: impl Fn(u8, u8) -> u8) -> Color {
    Color::from_rgba(
        f(a.red, b.red),
        f(a.green, b.green),
        f(a.blue, b.blue),
        f(a.alpha, b.alpha),
    )
}

/// Combines the primitive color with a texel.
#[must_use]
pub fn texture_function(stage: &TextureStage, primary: Color, texel: Color, env: Color) -> Color {
    let texel_alpha = if stage.use_alpha { texel.alpha } else { 0xFF };
    let mut out = match stage.func {
        TextureFunc::Modulate => map_channels(primary, texel, mul8).with_alpha(mul8(primary.alpha, texel_alpha)),
        TextureFunc::Decal => {
            let mixed = map_channels(primary, texel, |p, t| lerp8(p, t, texel_alpha));
            mixed.with_alpha(primary.alpha)
        }
        TextureFunc::Blend => {
            let mixed = Color::from_rgba(
                lerp8(primary.red, env.red, texel.red),
                lerp8(primary.green, env.green, texel.green),
                lerp8(primary.blue, env.blue, texel.blue),
                0,
            );
            mixed.with_alpha(mul8(primary.alpha, texel_alpha))
        }
        TextureFunc::Replace => texel.with_alpha(if stage.use_alpha { texel.alpha } else { primary.alpha }),
        TextureFunc::Add => map_channels(primary, texel, add8).with_alpha(mul8(primary.alpha, texel_alpha)),
    };
    if stage.doubling {
        let alpha = out.alpha;
        out = map_channels(out, out, add8).with_alpha(alpha);
    }
    out
}

/// Blend factor applied to `color`, in 0..=510 (x2 variants double).
fn factor(kind: BlendFactor, other: Color, src: Color, dst: Color, fixed: Color) -> [u32; 3] {
    let splat = |v: u32| [v, v, v];
    let rgb = |c: Color| [u32::from(c.red), u32::from(c.green), u32::from(c.blue)];
    let invert = |c: [u32; 3]| c.map(|v| 255 - v);
    match kind {
        BlendFactor::OtherColor => rgb(other),
        BlendFactor::InverseOtherColor => invert(rgb(other)),
        BlendFactor::SourceAlpha => splat(u32::from(src.alpha)),
        BlendFactor::InverseSourceAlpha => splat(255 - u32::from(src.alpha)),
        BlendFactor::DestAlpha => splat(u32::from(dst.alpha)),
        BlendFactor::InverseDestAlpha => splat(255 - u32::from(dst.alpha)),
        BlendFactor::DoubleSourceAlpha => splat(2 * u32::from(src.alpha)),
        BlendFactor::InverseDoubleSourceAlpha => splat(255u32.saturating_sub(2 * u32::from(src.alpha))),
        BlendFactor::DoubleDestAlpha => splat(2 * u32::from(dst.alpha)),
        BlendFactor::InverseDoubleDestAlpha => splat(255u32.saturating_sub(2 * u32::from(dst.alpha))),
        BlendFactor::Fixed => rgb(fixed),
    }
}

/// The blend equation. The source alpha is kept.
#[must_use]
pub fn blend(stage: &BlendStage, uniforms: &Uniforms, src: Color, dst: Color) -> Color {
    let src_factor = factor(stage.src, dst, src, dst, uniforms.fixed_a);
    let dst_factor = factor(stage.dst, src, src, dst, uniforms.fixed_b);
    let src_rgb = [src.red, src.green, src.blue];
    let dst_rgb = [dst.red, dst.green, dst.blue];
    let mut out = [0u8; 3];
    for i in 0..3 {
        let s = (i32::from(src_rgb[i]) * src_factor[i] as i32 + 127) / 255;
        let d = (i32::from(dst_rgb[i]) * dst_factor[i] as i32 + 127) / 255;
        let value = match stage.op {
            BlendOp::Add => s + d,
            BlendOp::Subtract => s - d,
            BlendOp::ReverseSubtract => d - s,
            BlendOp::Min => i32::from(src_rgb[i]).min(i32::from(dst_rgb[i])),
            BlendOp::Max => i32::from(src_rgb[i]).max(i32::from(dst_rgb[i])),
            BlendOp::AbsoluteDifference => (i32::from(src_rgb[i]) - i32::from(dst_rgb[i])).abs(),
        };
        out[i] = value.clamp(0, 255) as u8;
    }
    Color::from_rgba(out[0], out[1], out[2], src.alpha)
}

impl PixelPipeline {
    /// Runs one fragment through the pipeline. Returns whether it was
    /// written.
    pub fn shade(
        &self,
        memory: &mut Memory,
        target: &RenderTarget,
        uniforms: &Uniforms,
        texture: Option<&Texture>,
        fragment: &Fragment,
    ) -> bool {
        let (x, y) = (fragment.x, fragment.y);
        if !uniforms.scissor.contains(x, y) {
            return false;
        }

        if let Some(clear) = self.clear {
            let dst = target.read_raw(memory, x, y);
            let src = fragment.color.encode(target.format);
            let alpha_bits = alpha_mask(target.format);
            let mut raw = dst;
            if clear.color {
                raw = (raw & alpha_bits) | (src & !alpha_bits);
            }
            if clear.alpha {
                raw = (raw & !alpha_bits) | (src & alpha_bits);
            }
            target.write_raw(memory, x, y, raw);
            if clear.depth {
                target.write_depth(memory, x, y, fragment.z);
            }
            return true;
        }

        if !self.through {
            let (min, max) = uniforms.depth_range;
            if fragment.z < min || fragment.z > max {
                return false;
            }
        }
        if let Some(func) = self.depth_test {
            if !func.passes(fragment.z, target.read_depth(memory, x, y)) {
                return false;
            }
        }

        let mut color = fragment.color;
        if let (Some(stage), Some(texture)) = (self.texture.as_ref(), texture) {
            let texel = texture.sample(fragment.u, fragment.v, stage.linear, (stage.clamp_u, stage.clamp_v));
            color = texture_function(stage, color, texel, uniforms.env_color);
        }

        if let Some(func) = self.alpha_test {
            let mask = uniforms.alpha_mask;
            if !func.passes(color.alpha & mask, uniforms.alpha_ref & mask) {
                return false;
            }
        }

        let dst_raw = target.read_raw(memory, x, y);
        if let Some(stage) = self.blend.as_ref() {
            let dst = Color::decode(dst_raw, target.format);
            color = blend(stage, uniforms, color, dst);
        }

        // the color write never touches the destination alpha
        let keep = alpha_mask(target.format) | (uniforms.color_mask & !alpha_mask(PixelFormat::Rgba8888));
        let keep = keep & format_mask(target.format);
        let raw = (dst_raw & keep) | (color.encode(target.format) & !keep);
        target.write_raw(memory, x, y, raw);

        if self.depth_test.is_some() && self.depth_write {
            target.write_depth(memory, x, y, fragment.z);
        }
        true
    }
}

const fn alpha_mask(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Rgb565 => 0,
        PixelFormat::Rgba5551 => 0x8000,
        PixelFormat::Rgba4444 => 0xF000,
        PixelFormat::Rgba8888 => 0xFF00_0000,
    }
}

const fn format_mask(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Rgba8888 => u32::MAX,
        _ => 0xFFFF,
    }
}
