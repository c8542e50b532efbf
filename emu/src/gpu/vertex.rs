//! # Vertex decoding and transform
//!
//! `VERTEXTYPE` describes a packed vertex. Components appear in a fixed
//! order, each aligned to the size of its own element type:
//!
//! ```text
//!   ┌─────────┬──────────┬───────┬────────┬──────────┐
//!   │ weights │ texcoord │ color │ normal │ position │
//!   └─────────┴──────────┴───────┴────────┴──────────┘
//! ```
//!
//! The whole vertex is padded to its largest element. Outside through mode
//! positions go through world, view, projection and viewport; in through
//! mode they are already screen coordinates.

use crate::bitwise::Bits;
use crate::memory::Memory;

use super::color::Color;
use super::state::{GpuState, MAX_BONES};

/// Element type of a vertex component. `None` means absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Numeric {
    None,
    Byte,
    Short,
    Float,
}

impl Numeric {
    const fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            1 => Self::Byte,
            2 => Self::Short,
            3 => Self::Float,
            _ => Self::None,
        }
    }

    const fn size(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Byte => 1,
            Self::Short => 2,
            Self::Float => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorFormat {
    None,
    Rgb565,
    Rgba5551,
    Rgba4444,
    Rgba8888,
}

impl ColorFormat {
    const fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            4 => Self::Rgb565,
            5 => Self::Rgba5551,
            6 => Self::Rgba4444,
            7 => Self::Rgba8888,
            _ => Self::None,
        }
    }

    const fn size(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Rgba8888 => 4,
            _ => 2,
        }
    }
}

/// Decoded `VERTEXTYPE` payload with precomputed component offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexLayout {
    pub texcoord: Numeric,
    pub color: ColorFormat,
    pub normal: Numeric,
    pub position: Numeric,
    pub weight: Numeric,
    /// Index buffer element, `Numeric::None` for direct vertices.
    pub index: Numeric,
    pub weight_count: u32,
    pub through: bool,
    weight_offset: u32,
    texcoord_offset: u32,
    color_offset: u32,
    normal_offset: u32,
    position_offset: u32,
    pub size: u32,
}

const fn align(offset: u32, to: u32) -> u32 {
    if to <= 1 {
        offset
    } else {
        (offset + to - 1) & !(to - 1)
    }
}

impl VertexLayout {
    #[must_use]
    pub fn new(vtype: u32) -> Self {
        let texcoord = Numeric::from_bits(vtype.get_bits(0..=1));
        let color = ColorFormat::from_bits(vtype.get_bits(2..=4));
        let normal = Numeric::from_bits(vtype.get_bits(5..=6));
        let position = Numeric::from_bits(vtype.get_bits(7..=8));
        let weight = Numeric::from_bits(vtype.get_bits(9..=10));
        let index = Numeric::from_bits(vtype.get_bits(11..=12));
        let weight_count = vtype.get_bits(14..=16) + 1;
        let through = vtype.get_bit(23);

        let mut offset = 0;
        let mut biggest = 1;
        let mut place = |size: u32, count: u32| {
            if size == 0 {
                return offset;
            }
            offset = align(offset, size);
            let at = offset;
            offset += size * count;
            biggest = biggest.max(size);
            at
        };
        let weight_offset = place(weight.size(), if weight == Numeric::None { 0 } else { weight_count });
        let texcoord_offset = place(texcoord.size(), 2);
        let color_offset = place(color.size(), 1);
        let normal_offset = place(normal.size(), 3);
        let position_offset = place(position.size(), 3);
        let size = align(offset, biggest);

        Self {
            texcoord,
            color,
            normal,
            position,
            weight,
            index,
            weight_count,
            through,
            weight_offset,
            texcoord_offset,
            color_offset,
            normal_offset,
            position_offset,
            size,
        }
    }

    /// Reads vertex `n` of the buffer at `base`.
    #[must_use]
    pub fn read(&self, memory: &Memory, base: u32, n: u32) -> RawVertex {
        let at = base.wrapping_add(n * self.size);
        let mut vertex = RawVertex::default();

        if self.weight != Numeric::None {
            let count = (self.weight_count as usize).min(MAX_BONES);
            for (i, weight) in vertex.weights.iter_mut().take(count).enumerate() {
                let offset = at + self.weight_offset + i as u32 * self.weight.size();
                *weight = read_unsigned(memory, offset, self.weight);
            }
        }
        if self.texcoord != Numeric::None {
            for (i, uv) in vertex.uv.iter_mut().enumerate() {
                let offset = at + self.texcoord_offset + i as u32 * self.texcoord.size();
                *uv = if self.through {
                    read_raw(memory, offset, self.texcoord, false)
                } else {
                    read_unsigned(memory, offset, self.texcoord)
                };
            }
        }
        vertex.color = match self.color {
            ColorFormat::None => None,
            ColorFormat::Rgb565 => Some(Color::from_565(memory.read_u16(at + self.color_offset))),
            ColorFormat::Rgba5551 => Some(Color::from_5551(memory.read_u16(at + self.color_offset))),
            ColorFormat::Rgba4444 => Some(Color::from_4444(memory.read_u16(at + self.color_offset))),
            ColorFormat::Rgba8888 => Some(Color::from(memory.read_u32(at + self.color_offset))),
        };
        if self.normal != Numeric::None {
            for (i, n) in vertex.normal.iter_mut().enumerate() {
                let offset = at + self.normal_offset + i as u32 * self.normal.size();
                *n = read_signed(memory, offset, self.normal);
            }
        }
        for (i, p) in vertex.position.iter_mut().enumerate() {
            let offset = at + self.position_offset + i as u32 * self.position.size();
            *p = if self.through {
                // z is unsigned in through mode
                read_raw(memory, offset, self.position, i < 2)
            } else {
                read_signed(memory, offset, self.position)
            };
        }
        vertex
    }

    /// Reads index `n` of the index buffer at `base`.
    #[must_use]
    pub fn read_index(&self, memory: &Memory, base: u32, n: u32) -> u32 {
        match self.index {
            Numeric::Byte => u32::from(memory.read_u8(base.wrapping_add(n))),
            Numeric::Short | Numeric::Float => u32::from(memory.read_u16(base.wrapping_add(n * 2))),
            Numeric::None => n,
        }
    }
}

fn read_raw(memory: &Memory, address: u32, kind: Numeric, signed: bool) -> f32 {
    match (kind, signed) {
        (Numeric::Byte, true) => f32::from(memory.read_u8(address) as i8),
        (Numeric::Byte, false) => f32::from(memory.read_u8(address)),
        (Numeric::Short, true) => f32::from(memory.read_u16(address) as i16),
        (Numeric::Short, false) => f32::from(memory.read_u16(address)),
        (Numeric::Float, _) => memory.read_f32(address),
        (Numeric::None, _) => 0.0,
    }
}

/// Fixed point components normalized the way the GE does for transformed
/// vertices: unsigned values scale by 1/128 and 1/32768.
fn read_unsigned(memory: &Memory, address: u32, kind: Numeric) -> f32 {
    match kind {
        Numeric::Byte => f32::from(memory.read_u8(address)) / 128.0,
        Numeric::Short => f32::from(memory.read_u16(address)) / 32768.0,
        Numeric::Float => memory.read_f32(address),
        Numeric::None => 0.0,
    }
}

fn read_signed(memory: &Memory, address: u32, kind: Numeric) -> f32 {
    match kind {
        Numeric::Byte => f32::from(memory.read_u8(address) as i8) / 127.0,
        Numeric::Short => f32::from(memory.read_u16(address) as i16) / 32767.0,
        Numeric::Float => memory.read_f32(address),
        Numeric::None => 0.0,
    }
}

/// A vertex as stored in guest memory.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawVertex {
    pub weights: [f32; MAX_BONES],
    pub uv: [f32; 2],
    pub color: Option<Color>,
    pub normal: [f32; 3],
    pub position: [f32; 3],
}

/// A vertex in framebuffer space, ready for the rasterizer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScreenVertex {
    pub x: f32,
    pub y: f32,
    /// Depth in `0..=65535`.
    pub z: f32,
    /// Clip-space w, 1 in through mode.
    pub w: f32,
    /// Texture coordinates in texels.
    pub u: f32,
    pub v: f32,
    pub color: Color,
}

fn mul_4x3(m: &[f32; 12], p: [f32; 3]) -> [f32; 3] {
    [
        p[0] * m[0] + p[1] * m[3] + p[2] * m[6] + m[9],
        p[0] * m[1] + p[1] * m[4] + p[2] * m[7] + m[10],
        p[0] * m[2] + p[1] * m[5] + p[2] * m[8] + m[11],
    ]
}

fn mul_4x4(m: &[f32; 16], p: [f32; 3]) -> [f32; 4] {
    [
        p[0] * m[0] + p[1] * m[4] + p[2] * m[8] + m[12],
        p[0] * m[1] + p[1] * m[5] + p[2] * m[9] + m[13],
        p[0] * m[2] + p[1] * m[6] + p[2] * m[10] + m[14],
        p[0] * m[3] + p[1] * m[7] + p[2] * m[11] + m[15],
    ]
}

/// Maps a decoded vertex to the screen. `texture_size` converts normalized
/// texture coordinates to texels.
#[must_use]
pub fn transform(state: &GpuState, layout: &VertexLayout, raw: &RawVertex, texture_size: (u32, u32)) -> ScreenVertex {
    let color = raw.color.unwrap_or_else(|| state.material_ambient());
    if layout.through {
        return ScreenVertex {
            x: raw.position[0],
            y: raw.position[1],
            z: raw.position[2],
            w: 1.0,
            u: raw.uv[0],
            v: raw.uv[1],
            color,
        };
    }

    let mut model = raw.position;
    if layout.weight != Numeric::None {
        let mut skinned = [0.0; 3];
        let count = (layout.weight_count as usize).min(MAX_BONES);
        for (bone, weight) in state.bones.iter().zip(raw.weights).take(count) {
            let moved = mul_4x3(bone, raw.position);
            for (out, component) in skinned.iter_mut().zip(moved) {
                *out += component * weight;
            }
        }
        model = skinned;
    }

    let world = mul_4x3(&state.world, model);
    let view = mul_4x3(&state.view, world);
    let clip = mul_4x4(&state.projection, view);
    let w = clip[3];
    let viewport = state.viewport();
    let (offset_x, offset_y) = state.screen_offset();
    let (ndc_x, ndc_y, ndc_z) = if w == 0.0 {
        (0.0, 0.0, 0.0)
    } else {
        (clip[0] / w, clip[1] / w, clip[2] / w)
    };

    let [scale_u, scale_v, offset_u, offset_v] = state.texture_scale_offset();
    let u = raw.uv[0].mul_add(scale_u, offset_u);
    let v = raw.uv[1].mul_add(scale_v, offset_v);

    ScreenVertex {
        x: ndc_x.mul_add(viewport.scale[0], viewport.center[0]) - offset_x as f32 / 16.0,
        y: ndc_y.mul_add(viewport.scale[1], viewport.center[1]) - offset_y as f32 / 16.0,
        z: ndc_z.mul_add(viewport.scale[2], viewport.center[2]),
        w,
        u: u * texture_size.0 as f32,
        v: v * texture_size.1 as f32,
        color,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::commands as cmd;
    use pretty_assertions::assert_eq;

    #[test]
    fn layout_aligns_each_component() {
        // u8 texcoords, 8888 color, float position
        let layout = VertexLayout::new(1 | (7 << 2) | (3 << 7));
        assert_eq!(layout.texcoord_offset, 0);
        assert_eq!(layout.color_offset, 4);
        assert_eq!(layout.position_offset, 8);
        assert_eq!(layout.size, 20);

        // u8 color-less s16 position in through mode
        let through = VertexLayout::new((2 << 7) | (1 << 23));
        assert_eq!(through.size, 6);
        assert!(through.through);
    }

    #[test]
    fn through_vertices_are_screen_coordinates() {
        let mut memory = Memory::new();
        let base = 0x0890_0000;
        // u16 texcoords, 4444 color, s16 position
        let layout = VertexLayout::new(2 | (6 << 2) | (2 << 7) | (1 << 23));
        memory.write_u16(base, 32);
        memory.write_u16(base + 2, 16);
        memory.write_u16(base + 4, 0xF00F);
        memory.write_u16(base + 6, 100);
        memory.write_u16(base + 8, 50);
        memory.write_u16(base + 10, 0xFFFF);

        let raw = layout.read(&memory, base, 0);
        let state = GpuState::new();
        let vertex = transform(&state, &layout, &raw, (64, 64));
        assert_eq!((vertex.x, vertex.y, vertex.z), (100.0, 50.0, 65535.0));
        assert_eq!((vertex.u, vertex.v), (32.0, 16.0));
        assert_eq!(vertex.color, Color::from_rgba(0xFF, 0, 0, 0xFF));
    }

    #[test]
    fn identity_transform_goes_through_the_viewport() {
        let mut state = GpuState::new();
        let float = |v: f32| v.to_bits() >> 8;
        state.apply(cmd::VIEWPORTXSCALE, float(240.0));
        state.apply(cmd::VIEWPORTYSCALE, float(-136.0));
        state.apply(cmd::VIEWPORTXCENTER, float(2048.0));
        state.apply(cmd::VIEWPORTYCENTER, float(2048.0));
        state.apply(cmd::OFFSETX, (2048 - 240) << 4);
        state.apply(cmd::OFFSETY, (2048 - 136) << 4);

        let layout = VertexLayout::new(3 << 7);
        let raw = RawVertex {
            position: [0.5, 0.5, 0.0],
            ..RawVertex::default()
        };
        let vertex = transform(&state, &layout, &raw, (1, 1));
        assert_eq!((vertex.x, vertex.y), (360.0, 68.0));
        assert_eq!(vertex.w, 1.0);
    }
}
