//! # Rasterizer
//!
//! Turns screen-space primitives into [`Fragment`]s for the pixel pipeline.
//!
//! Triangles use edge functions in 1/16 pixel fixed point, sampled at
//! integer pixel positions. The signed area picks the winding; negative
//! triangles are swapped into positive ones so a single loop walks all of
//! them. Pixels exactly on an edge belong to the triangle only when the edge
//! is a top-left one:
//!
//! ```text
//!        v0 ───────────▶ v1      top edge: horizontal, going right
//!         ▲            ╱
//!   left  │          ╱            other edges: bias -1, so samples on
//!   edge  │        ╱              them fall to the neighbour
//!         │      ╱
//!         │    ╱
//!         v2 ◀
//! ```
//!
//! Rectangles cover `[x0, x1) x [y0, y1)` and share the same fragment path.

use crate::memory::Memory;

use super::color::Color;
use super::pixel::{Fragment, PixelPipeline, RenderTarget, Uniforms};
use super::state::Scissor;
use super::texture::Texture;
use super::vertex::ScreenVertex;

const SUBPIXEL: f32 = 16.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Point {
    x: i64,
    y: i64,
}

impl Point {
    fn from_vertex(vertex: &ScreenVertex) -> Self {
        Self {
            x: (vertex.x * SUBPIXEL).round() as i64,
            y: (vertex.y * SUBPIXEL).round() as i64,
        }
    }
}

/// Twice the signed area of `(a, b, c)` in subpixel units.
const fn area(a: Point, b: Point, c: Point) -> i64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

/// Which side of `a -> b` the point `p` lies on. Positive inside a
/// positive-area triangle.
const fn edge(a: Point, b: Point, p: Point) -> i64 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

const fn is_top_left(a: Point, b: Point) -> bool {
    (a.y == b.y && b.x > a.x) || a.y > b.y
}

const fn bias(a: Point, b: Point) -> i64 {
    if is_top_left(a, b) { 0 } else { -1 }
}

/// How a triangle's winding is treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Culling {
    None,
    /// Drop positive-area triangles.
    Positive,
    /// Drop negative-area triangles.
    Negative,
}

impl Culling {
    /// The opposite direction, for odd triangles of a strip.
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Positive => Self::Negative,
            Self::Negative => Self::Positive,
        }
    }
}

/// Everything a draw needs besides the primitive itself.
pub struct DrawContext<'a> {
    pub pipeline: &'a PixelPipeline,
    pub uniforms: &'a Uniforms,
    pub target: &'a RenderTarget,
    pub texture: Option<&'a Texture>,
}

impl DrawContext<'_> {
    fn emit(&self, memory: &mut Memory, fragment: &Fragment) -> bool {
        self.pipeline
            .shade(memory, self.target, self.uniforms, self.texture, fragment)
    }
}

fn depth(value: f32) -> u16 {
    value.clamp(0.0, 65535.0) as u16
}

fn mix_color(colors: [Color; 3], weights: [f32; 3]) -> Color {
    let channel = |get: fn(&Color) -> u8| {
        let value: f32 = colors
            .iter()
            .zip(weights)
            .map(|(c, w)| f32::from(get(c)) * w)
            .sum();
        value.round().clamp(0.0, 255.0) as u8
    };
    Color::from_rgba(
        channel(|c| c.red),
        channel(|c| c.green),
        channel(|c| c.blue),
        channel(|c| c.alpha),
    )
}

fn clip_box(min_x: i64, min_y: i64, max_x: i64, max_y: i64, scissor: &Scissor) -> Option<(u32, u32, u32, u32)> {
    let x0 = min_x.max(i64::from(scissor.x1));
    let y0 = min_y.max(i64::from(scissor.y1));
    let x1 = max_x.min(i64::from(scissor.x2));
    let y1 = max_y.min(i64::from(scissor.y2));
    if x0 > x1 || y0 > y1 {
        return None;
    }
    Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
}

/// Rasterizes one triangle. Returns the number of fragments written.
pub fn draw_triangle(memory: &mut Memory, ctx: &DrawContext, vertices: &[ScreenVertex; 3], culling: Culling) -> usize {
    let pipeline = ctx.pipeline;
    if !pipeline.through && vertices.iter().any(|v| v.w <= 0.0) {
        return 0;
    }
    // flat shading takes the provoking (last) vertex
    let flat = vertices[2].color;

    let mut v = *vertices;
    let mut p = v.map(|vertex| Point::from_vertex(&vertex));
    let signed = area(p[0], p[1], p[2]);
    if signed == 0 {
        return 0;
    }
    let culling = if pipeline.through { Culling::None } else { culling };
    match culling {
        Culling::Positive if signed > 0 => return 0,
        Culling::Negative if signed < 0 => return 0,
        _ => {}
    }
    if signed < 0 {
        v.swap(1, 2);
        p.swap(1, 2);
    }
    let total = area(p[0], p[1], p[2]) as f32;

    let min_x = p.iter().map(|q| q.x).min().unwrap_or(0).div_euclid(16);
    let min_y = p.iter().map(|q| q.y).min().unwrap_or(0).div_euclid(16);
    let max_x = p.iter().map(|q| q.x).max().unwrap_or(0).div_euclid(16) + 1;
    let max_y = p.iter().map(|q| q.y).max().unwrap_or(0).div_euclid(16) + 1;
    let Some((x0, y0, x1, y1)) = clip_box(min_x, min_y, max_x, max_y, &ctx.uniforms.scissor) else {
        return 0;
    };

    let biases = [bias(p[1], p[2]), bias(p[2], p[0]), bias(p[0], p[1])];
    let inverse_w = v.map(|vertex| if pipeline.through { 1.0 } else { 1.0 / vertex.w });
    let colors = v.map(|vertex| vertex.color);

    let mut written = 0;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let sample = Point {
                x: i64::from(x) * 16,
                y: i64::from(y) * 16,
            };
            let e = [
                edge(p[1], p[2], sample),
                edge(p[2], p[0], sample),
                edge(p[0], p[1], sample),
            ];
            if e.iter().zip(biases).any(|(value, b)| value + b < 0) {
                continue;
            }
            let weights = e.map(|value| value as f32 / total);

            let z = weights[0] * v[0].z + weights[1] * v[1].z + weights[2] * v[2].z;
            let perspective = [
                weights[0] * inverse_w[0],
                weights[1] * inverse_w[1],
                weights[2] * inverse_w[2],
            ];
            let sum: f32 = perspective.iter().sum();
            let uv_weights = if sum == 0.0 {
                weights
            } else {
                perspective.map(|w| w / sum)
            };
            let u = uv_weights[0] * v[0].u + uv_weights[1] * v[1].u + uv_weights[2] * v[2].u;
            let tv = uv_weights[0] * v[0].v + uv_weights[1] * v[1].v + uv_weights[2] * v[2].v;
            let color = if pipeline.gouraud {
                mix_color(colors, weights)
            } else {
                flat
            };

            let fragment = Fragment {
                x,
                y,
                z: depth(z),
                u,
                v: tv,
                color,
            };
            if ctx.emit(memory, &fragment) {
                written += 1;
            }
        }
    }
    written
}

/// Fills the rectangle spanned by two corners. Texture coordinates are
/// interpolated across it; color and depth come from the second vertex.
pub fn draw_rectangle(memory: &mut Memory, ctx: &DrawContext, corners: &[ScreenVertex; 2]) -> usize {
    let [mut a, mut b] = *corners;
    if a.x > b.x {
        std::mem::swap(&mut a.x, &mut b.x);
        std::mem::swap(&mut a.u, &mut b.u);
    }
    if a.y > b.y {
        std::mem::swap(&mut a.y, &mut b.y);
        std::mem::swap(&mut a.v, &mut b.v);
    }
    let (left, top) = (a.x.round() as i64, a.y.round() as i64);
    let (right, bottom) = (b.x.round() as i64, b.y.round() as i64);
    if right <= left || bottom <= top {
        return 0;
    }
    let Some((x0, y0, x1, y1)) = clip_box(left, top, right - 1, bottom - 1, &ctx.uniforms.scissor) else {
        return 0;
    };

    let width = (right - left) as f32;
    let height = (bottom - top) as f32;
    let du = (b.u - a.u) / width;
    let dv = (b.v - a.v) / height;
    let z = depth(corners[1].z);
    let color = corners[1].color;

    let mut written = 0;
    for y in y0..=y1 {
        let v = a.v + dv * (i64::from(y) - top) as f32;
        for x in x0..=x1 {
            let u = a.u + du * (i64::from(x) - left) as f32;
            let fragment = Fragment { x, y, z, u, v, color };
            if ctx.emit(memory, &fragment) {
                written += 1;
            }
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::color::{PixelFormat, colors};
    use crate::gpu::state::GpuState;
    use crate::memory::VRAM_BASE;
    use pretty_assertions::assert_eq;

    fn vertex(x: f32, y: f32, color: Color) -> ScreenVertex {
        ScreenVertex {
            x,
            y,
            z: 0.0,
            w: 1.0,
            u: 0.0,
            v: 0.0,
            color,
        }
    }

    struct Fixture {
        memory: Memory,
        pipeline: PixelPipeline,
        uniforms: Uniforms,
        target: RenderTarget,
    }

    impl Fixture {
        fn new(through: bool) -> Self {
            let state = GpuState::new();
            let mut uniforms = Uniforms::from_state(&state);
            uniforms.scissor = Scissor {
                x1: 0,
                y1: 0,
                x2: 479,
                y2: 271,
            };
            uniforms.depth_range = (0, 0xFFFF);
            Self {
                memory: Memory::new(),
                pipeline: PixelPipeline::from_state(&state, through),
                uniforms,
                target: RenderTarget {
                    color: VRAM_BASE,
                    color_stride: 512,
                    format: PixelFormat::Rgba8888,
                    depth: VRAM_BASE + 0x0015_4000,
                    depth_stride: 512,
                },
            }
        }

        fn triangle(&mut self, vertices: [ScreenVertex; 3], culling: Culling) -> usize {
            let ctx = DrawContext {
                pipeline: &self.pipeline,
                uniforms: &self.uniforms,
                target: &self.target,
                texture: None,
            };
            draw_triangle(&mut self.memory, &ctx, &vertices, culling)
        }

        fn pixel(&self, x: u32, y: u32) -> Color {
            self.target.read_color(&self.memory, x, y)
        }
    }

    #[test]
    fn top_left_rule() {
        let mut fixture = Fixture::new(true);
        let count = fixture.triangle(
            [
                vertex(0.0, 0.0, colors::RED),
                vertex(4.0, 0.0, colors::RED),
                vertex(0.0, 4.0, colors::RED),
            ],
            Culling::None,
        );
        assert_eq!(fixture.pixel(0, 0).red, 0xFF);
        assert_eq!(fixture.pixel(4, 0).red, 0);
        assert_eq!(fixture.pixel(0, 4).red, 0);
        assert_eq!(fixture.pixel(3, 0).red, 0xFF);
        assert_eq!(fixture.pixel(2, 2).red, 0);
        // rows hold 4, 3, 2 and 1 pixels
        assert_eq!(count, 10);
    }

    #[test]
    fn shared_edges_are_covered_once() {
        let mut fixture = Fixture::new(true);
        let a = vertex(0.0, 0.0, colors::RED);
        let b = vertex(8.0, 0.0, colors::RED);
        let c = vertex(8.0, 8.0, colors::RED);
        let d = vertex(0.0, 8.0, colors::RED);
        let first = fixture.triangle([a, b, c], Culling::None);
        let second = fixture.triangle([a, c, d], Culling::None);
        assert_eq!(first + second, 64);
    }

    #[test]
    fn winding_is_canonicalized_and_culled() {
        let clockwise = [
            vertex(0.0, 0.0, colors::RED),
            vertex(0.0, 4.0, colors::RED),
            vertex(4.0, 0.0, colors::RED),
        ];
        let mut fixture = Fixture::new(false);
        assert_eq!(fixture.triangle(clockwise, Culling::None), 10);
        assert_eq!(fixture.triangle(clockwise, Culling::Negative), 0);
        assert_eq!(fixture.triangle(clockwise, Culling::Positive), 10);

        let degenerate = [
            vertex(0.0, 0.0, colors::RED),
            vertex(2.0, 2.0, colors::RED),
            vertex(4.0, 4.0, colors::RED),
        ];
        assert_eq!(fixture.triangle(degenerate, Culling::None), 0);
    }

    #[test]
    fn flat_shading_uses_the_last_vertex() {
        let mut fixture = Fixture::new(true);
        fixture.triangle(
            [
                vertex(0.0, 0.0, colors::RED),
                vertex(4.0, 0.0, colors::GREEN),
                vertex(0.0, 4.0, colors::BLUE),
            ],
            Culling::None,
        );
        assert_eq!(fixture.pixel(1, 1), Color::from_rgba(0, 0, 0xFF, 0));
    }

    #[test]
    fn rectangles_are_half_open() {
        let mut fixture = Fixture::new(true);
        let ctx = DrawContext {
            pipeline: &fixture.pipeline,
            uniforms: &fixture.uniforms,
            target: &fixture.target,
            texture: None,
        };
        let corners = [vertex(2.0, 1.0, colors::BLACK), vertex(6.0, 3.0, colors::GREEN)];
        let count = draw_rectangle(&mut fixture.memory, &ctx, &corners);
        assert_eq!(count, 8);
        assert_eq!(fixture.pixel(2, 1).green, 0xFF);
        assert_eq!(fixture.pixel(6, 1).green, 0);
        assert_eq!(fixture.pixel(2, 3).green, 0);
    }

    #[test]
    fn textured_rectangle_maps_texels() {
        let mut fixture = Fixture::new(true);
        fixture.pipeline.texture = Some(crate::gpu::pixel::TextureStage {
            func: crate::gpu::state::TextureFunc::Replace,
            use_alpha: true,
            doubling: false,
            linear: false,
            clamp_u: true,
            clamp_v: true,
        });
        let texture = Texture {
            width: 2,
            height: 1,
            texels: vec![colors::RED, colors::BLUE],
        };
        let ctx = DrawContext {
            pipeline: &fixture.pipeline,
            uniforms: &fixture.uniforms,
            target: &fixture.target,
            texture: Some(&texture),
        };
        let mut a = vertex(0.0, 0.0, colors::WHITE);
        let mut b = vertex(4.0, 1.0, colors::WHITE);
        a.u = 0.0;
        b.u = 2.0;
        draw_rectangle(&mut fixture.memory, &ctx, &[a, b]);
        assert_eq!(fixture.pixel(1, 0).red, 0xFF);
        assert_eq!(fixture.pixel(2, 0).blue, 0xFF);
    }
}
