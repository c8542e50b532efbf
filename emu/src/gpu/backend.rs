//! # Renderer backends
//!
//! The command processor talks to a [`RenderBackend`]. Two implementations
//! exist and both run the same [`PixelPipeline`] policy, so they produce
//! identical pixels:
//!
//! ```text
//!                  ┌───────────────────┐
//!   GE draw ──────▶│  RenderBackend    │
//!                  └─────────┬─────────┘
//!             ┌──────────────┴──────────────┐
//!   SoftwareRenderer                 PipelineRenderer
//!   resolve state every draw         PipelineKey ──▶ cached PixelPipeline
//!             └──────────────┬──────────────┘
//!                     Rasterizer (target + TextureCache)
//! ```

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::config::{Config, RendererKind};
use crate::memory::Memory;

use super::pixel::{PipelineKey, PixelPipeline, RenderTarget, Uniforms};
use super::raster::{self, Culling, DrawContext};
use super::state::GpuState;
use super::texture::{TextureCache, TextureParams};
use super::vertex::ScreenVertex;

/// GE state of the draw being submitted.
#[derive(Clone, Copy)]
pub struct DrawCall<'a> {
    pub state: &'a GpuState,
    pub through: bool,
}

impl DrawCall<'_> {
    #[must_use]
    pub fn culling(&self) -> Culling {
        if !self.state.cull_enabled() || self.through {
            Culling::None
        } else if self.state.cull_negative() {
            Culling::Negative
        } else {
            Culling::Positive
        }
    }
}

/// What a renderer backend must provide.
pub trait RenderBackend {
    fn name(&self) -> &'static str;

    fn set_framebuffer(&mut self, target: RenderTarget);

    fn draw_rectangle(&mut self, memory: &mut Memory, call: DrawCall, corners: &[ScreenVertex; 2]);

    fn draw_triangle(&mut self, memory: &mut Memory, call: DrawCall, vertices: &[ScreenVertex; 3], culling: Culling);

    /// Every other triangle of a strip is wound the other way.
    fn draw_triangle_strip(&mut self, memory: &mut Memory, call: DrawCall, vertices: &[ScreenVertex]) {
        let culling = call.culling();
        for (i, window) in vertices.windows(3).enumerate() {
            let triangle = [window[0], window[1], window[2]];
            let culling = if i % 2 == 1 { culling.flipped() } else { culling };
            self.draw_triangle(memory, call, &triangle, culling);
        }
    }

    fn draw_triangle_fan(&mut self, memory: &mut Memory, call: DrawCall, vertices: &[ScreenVertex]) {
        let Some((center, rest)) = vertices.split_first() else {
            return;
        };
        let culling = call.culling();
        for pair in rest.windows(2) {
            self.draw_triangle(memory, call, &[*center, pair[0], pair[1]], culling);
        }
    }

    /// Marks every cached texture for revalidation.
    fn clear_texture_cache(&mut self);

    /// Reports that guest memory in `[address, address + size)` changed.
    fn invalidate_texture(&mut self, address: u32, size: u32);

    fn end_frame(&mut self, frame: u64);
}

/// Creates the backend the configuration asks for.
#[must_use]
pub fn create(config: &Config) -> Box<dyn RenderBackend> {
    match config.renderer {
        RendererKind::Software => Box::new(SoftwareRenderer::new(config.texture_kill_age)),
        RendererKind::Pipeline => Box::new(PipelineRenderer::new(config.texture_kill_age)),
    }
}

/// Target and texture cache, shared by both backends.
pub struct Rasterizer {
    target: RenderTarget,
    textures: TextureCache,
}

enum Shape<'a> {
    Rectangle(&'a [ScreenVertex; 2]),
    Triangle(&'a [ScreenVertex; 3], Culling),
}

impl Rasterizer {
    #[must_use]
    pub fn new(texture_kill_age: u32) -> Self {
        Self {
            target: RenderTarget::default(),
            textures: TextureCache::new(texture_kill_age),
        }
    }

    #[must_use]
    pub const fn target(&self) -> &RenderTarget {
        &self.target
    }

    #[must_use]
    pub const fn textures(&self) -> &TextureCache {
        &self.textures
    }

    fn draw(&mut self, memory: &mut Memory, call: DrawCall, pipeline: &PixelPipeline, shape: &Shape) -> usize {
        let uniforms = Uniforms::from_state(call.state);
        let texture = if pipeline.texture.is_some() && pipeline.clear.is_none() {
            TextureParams::from_state(call.state)
                .map(|params| self.textures.get(memory, &params, &call.state.clut[..]))
        } else {
            None
        };
        let ctx = DrawContext {
            pipeline,
            uniforms: &uniforms,
            target: &self.target,
            texture,
        };
        match shape {
            Shape::Rectangle(corners) => raster::draw_rectangle(memory, &ctx, corners),
            Shape::Triangle(vertices, culling) => raster::draw_triangle(memory, &ctx, vertices, *culling),
        }
    }
}

/// Resolves the fixed-function state from scratch for every draw.
pub struct SoftwareRenderer {
    raster: Rasterizer,
}

impl SoftwareRenderer {
    #[must_use]
    pub fn new(texture_kill_age: u32) -> Self {
        Self {
            raster: Rasterizer::new(texture_kill_age),
        }
    }

    #[must_use]
    pub const fn rasterizer(&self) -> &Rasterizer {
        &self.raster
    }
}

impl RenderBackend for SoftwareRenderer {
    fn name(&self) -> &'static str {
        "software"
    }

    fn set_framebuffer(&mut self, target: RenderTarget) {
        self.raster.target = target;
    }

    fn draw_rectangle(&mut self, memory: &mut Memory, call: DrawCall, corners: &[ScreenVertex; 2]) {
        let pipeline = PixelPipeline::from_state(call.state, call.through);
        self.raster.draw(memory, call, &pipeline, &Shape::Rectangle(corners));
    }

    fn draw_triangle(&mut self, memory: &mut Memory, call: DrawCall, vertices: &[ScreenVertex; 3], culling: Culling) {
        let pipeline = PixelPipeline::from_state(call.state, call.through);
        self.raster.draw(memory, call, &pipeline, &Shape::Triangle(vertices, culling));
    }

    fn clear_texture_cache(&mut self) {
        self.raster.textures.invalidate_all();
    }

    fn invalidate_texture(&mut self, address: u32, size: u32) {
        self.raster.textures.invalidate(address, size);
    }

    fn end_frame(&mut self, frame: u64) {
        self.raster.textures.decimate(frame);
    }
}

/// Keeps one resolved pipeline per distinct feature bitset.
pub struct PipelineRenderer {
    raster: Rasterizer,
    pipelines: HashMap<PipelineKey, PixelPipeline>,
    hits: u64,
    misses: u64,
}

impl PipelineRenderer {
    #[must_use]
    pub fn new(texture_kill_age: u32) -> Self {
        Self {
            raster: Rasterizer::new(texture_kill_age),
            pipelines: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    fn pipeline(&mut self, call: DrawCall) -> PixelPipeline {
        let key = PipelineKey::from_state(call.state, call.through);
        if let Some(pipeline) = self.pipelines.get(&key) {
            self.hits += 1;
            return *pipeline;
        }
        self.misses += 1;
        trace!("building pipeline {:#x}", key.0);
        let pipeline = PixelPipeline::from_key(key);
        self.pipelines.insert(key, pipeline);
        pipeline
    }

    /// Number of distinct pipelines built so far.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    #[must_use]
    pub const fn cache_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl RenderBackend for PipelineRenderer {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn set_framebuffer(&mut self, target: RenderTarget) {
        self.raster.target = target;
    }

    fn draw_rectangle(&mut self, memory: &mut Memory, call: DrawCall, corners: &[ScreenVertex; 2]) {
        let pipeline = self.pipeline(call);
        self.raster.draw(memory, call, &pipeline, &Shape::Rectangle(corners));
    }

    fn draw_triangle(&mut self, memory: &mut Memory, call: DrawCall, vertices: &[ScreenVertex; 3], culling: Culling) {
        let pipeline = self.pipeline(call);
        self.raster.draw(memory, call, &pipeline, &Shape::Triangle(vertices, culling));
    }

    fn clear_texture_cache(&mut self) {
        self.raster.textures.invalidate_all();
    }

    fn invalidate_texture(&mut self, address: u32, size: u32) {
        self.raster.textures.invalidate(address, size);
    }

    fn end_frame(&mut self, frame: u64) {
        self.raster.textures.decimate(frame);
        if frame % 600 == 0 {
            debug!(
                "{} pipelines, {} hits, {} misses",
                self.pipelines.len(),
                self.hits,
                self.misses
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::color::{Color, PixelFormat, colors};
    use crate::gpu::commands as cmd;
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

    fn target() -> RenderTarget {
        RenderTarget {
            color: VRAM_BASE,
            color_stride: 512,
            format: PixelFormat::Rgba8888,
            depth: VRAM_BASE + 0x0015_4000,
            depth_stride: 512,
        }
    }

    fn state() -> GpuState {
        let mut state = GpuState::new();
        state.apply(cmd::SCISSOR2, 479 | (271 << 10));
        state.apply(cmd::ALPHABLENDENABLE, 1);
        state.apply(cmd::BLENDMODE, 10 | (11 << 4));
        state.apply(cmd::BLENDFIXEDA, 0x80_8080);
        state.apply(cmd::BLENDFIXEDB, 0x80_8080);
        state
    }

    fn render(backend: &mut dyn RenderBackend, memory: &mut Memory) {
        let state = state();
        backend.set_framebuffer(target());
        let call = DrawCall {
            state: &state,
            through: true,
        };
        memory.write_u32(VRAM_BASE + 4, 0xFFFF_FFFF);
        let strip = [
            vertex(0.0, 0.0, colors::WHITE),
            vertex(4.0, 0.0, colors::WHITE),
            vertex(0.0, 4.0, colors::WHITE),
            vertex(4.0, 4.0, colors::WHITE),
        ];
        backend.draw_triangle_strip(memory, call, &strip);
        backend.draw_rectangle(memory, call, &[vertex(8.0, 0.0, colors::RED), vertex(10.0, 2.0, colors::RED)]);
    }

    #[test]
    fn both_backends_agree() {
        let mut software_memory = Memory::new();
        let mut pipeline_memory = Memory::new();
        let mut software = SoftwareRenderer::new(60);
        let mut pipeline = PipelineRenderer::new(60);
        render(&mut software, &mut software_memory);
        render(&mut pipeline, &mut pipeline_memory);

        let size = 512 * 8 * 4;
        assert_eq!(
            software_memory.slice(VRAM_BASE, size),
            pipeline_memory.slice(VRAM_BASE, size)
        );
        // fixed blend: half white over half the white destination
        assert_eq!(software_memory.read_u32(VRAM_BASE + 4) & 0x00FF_FFFF, 0x00FF_FFFF);
        assert_eq!(software_memory.read_u32(VRAM_BASE) & 0xFF, 0x80);
        assert_eq!(pipeline.pipeline_count(), 1);
        assert_eq!(pipeline.cache_stats(), (2, 1));
    }

    fn draw_culled_strip(cull_negative: bool) -> usize {
        let mut memory = Memory::new();
        let mut backend = SoftwareRenderer::new(60);
        let mut state = GpuState::new();
        state.apply(cmd::SCISSOR2, 479 | (271 << 10));
        state.apply(cmd::CULLFACEENABLE, 1);
        state.apply(cmd::CULL, u32::from(cull_negative));
        backend.set_framebuffer(target());
        let call = DrawCall {
            state: &state,
            through: false,
        };
        // alternating winding: both triangles face the same way
        let strip = [
            vertex(0.0, 0.0, colors::WHITE),
            vertex(0.0, 4.0, colors::WHITE),
            vertex(4.0, 0.0, colors::WHITE),
            vertex(4.0, 4.0, colors::WHITE),
        ];
        backend.draw_triangle_strip(&mut memory, call, &strip);
        let target = *backend.rasterizer().target();
        (0..4)
            .flat_map(|y| (0..4).map(move |x| (x, y)))
            .filter(|&(x, y)| target.read_color(&memory, x, y).red == 0xFF)
            .count()
    }

    #[test]
    fn strips_flip_culling_every_other_triangle() {
        assert_eq!(draw_culled_strip(false), 16);
        assert_eq!(draw_culled_strip(true), 0);
    }
}
