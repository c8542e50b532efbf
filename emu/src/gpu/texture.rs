//! # Textures
//!
//! Level 0 of the bound texture is decoded once into RGBA texels and kept in
//! a [`TextureCache`] keyed by its guest address. An entry stays valid while
//! its parameters (format, size, CLUT contents) match and its source bytes
//! have not been reported as overwritten.
//!
//! ```text
//!   guest bytes ──▶ unswizzle? ──▶ ┬─ direct   565/5551/4444/8888
//!                                  ├─ indexed  CLUT4/8/16/32 ──▶ CLUT
//!                                  └─ DXT1/3/5 4x4 blocks
//! ```

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tracing::{debug, trace, warn};

use crate::bitwise::Bits;
use crate::memory::Memory;

use super::color::{Color, PixelFormat, colors};
use super::state::{ClutFormat, GpuState, TextureFormat};

/// Everything needed to decode texture level 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureParams {
    pub address: u32,
    /// Row pitch in texels.
    pub stride: u32,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub swizzled: bool,
    pub clut: ClutFormat,
}

impl TextureParams {
    /// Reads the bound texture from the GE state. `None` for unknown formats.
    #[must_use]
    pub fn from_state(state: &GpuState) -> Option<Self> {
        let Some(format) = state.texture_format() else {
            warn!("unknown texture format {:#x}", state.regs[usize::from(super::commands::TEXFORMAT)]);
            return None;
        };
        let (width, height) = state.texture_size(0);
        Some(Self {
            address: state.texture_address(0),
            stride: state.texture_stride(0).max(1),
            width,
            height,
            format,
            swizzled: state.texture_swizzled(),
            clut: state.clut_format(),
        })
    }

    /// Bytes of guest memory the texture reads.
    #[must_use]
    pub const fn byte_size(&self) -> u32 {
        let rows = if self.format.is_compressed() {
            self.height.div_ceil(4) * 4
        } else {
            self.height
        };
        self.stride * rows * self.format.bits_per_texel() / 8
    }
}

/// Decoded RGBA texels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<Color>,
}

impl Texture {
    #[must_use]
    pub fn texel(&self, x: u32, y: u32) -> Color {
        self.texels
            .get((y * self.width + x) as usize)
            .copied()
            .unwrap_or(colors::TRANSPARENT)
    }

    fn coordinate(value: i32, size: u32, clamp: bool) -> u32 {
        let size = size as i32;
        if clamp {
            value.clamp(0, size - 1) as u32
        } else {
            value.rem_euclid(size) as u32
        }
    }

    /// Samples at texel coordinates `(u, v)`.
    #[must_use]
    pub fn sample(&self, u: f32, v: f32, linear: bool, clamp: (bool, bool)) -> Color {
        if self.width == 0 || self.height == 0 {
            return colors::TRANSPARENT;
        }
        if !linear {
            let x = Self::coordinate(u.floor() as i32, self.width, clamp.0);
            let y = Self::coordinate(v.floor() as i32, self.height, clamp.1);
            return self.texel(x, y);
        }
        let u = u - 0.5;
        let v = v - 0.5;
        let (x0, y0) = (u.floor() as i32, v.floor() as i32);
        let (fu, fv) = (u - u.floor(), v - v.floor());
        let fetch = |dx: i32, dy: i32| {
            self.texel(
                Self::coordinate(x0 + dx, self.width, clamp.0),
                Self::coordinate(y0 + dy, self.height, clamp.1),
            )
        };
        let (c00, c10, c01, c11) = (fetch(0, 0), fetch(1, 0), fetch(0, 1), fetch(1, 1));
        let mix = |a: u8, b: u8, c: u8, d: u8| {
            let top = f32::from(a) + (f32::from(b) - f32::from(a)) * fu;
            let bottom = f32::from(c) + (f32::from(d) - f32::from(c)) * fu;
            (top + (bottom - top) * fv).round() as u8
        };
        Color::from_rgba(
            mix(c00.red, c10.red, c01.red, c11.red),
            mix(c00.green, c10.green, c01.green, c11.green),
            mix(c00.blue, c10.blue, c01.blue, c11.blue),
            mix(c00.alpha, c10.alpha, c01.alpha, c11.alpha),
        )
    }
}

/// Undoes the 16 byte x 8 row block layout of swizzled textures.
#[must_use]
pub fn unswizzle(data: &[u8], row_bytes: usize, rows: usize) -> Vec<u8> {
    let mut linear = vec![0; row_bytes * rows];
    let blocks_per_row = row_bytes.div_ceil(16);
    for y in 0..rows {
        for x in 0..row_bytes {
            let block = (y / 8) * blocks_per_row + x / 16;
            let source = block * 128 + (y % 8) * 16 + x % 16;
            linear[y * row_bytes + x] = data.get(source).copied().unwrap_or_default();
        }
    }
    linear
}

fn clut_color(clut: &[u8], format: &ClutFormat, raw: u32) -> Color {
    let index = format.index(raw) as usize;
    let bytes = format.format.bytes_per_pixel() as usize;
    if clut.len() < bytes {
        return colors::TRANSPARENT;
    }
    let at = (index * bytes) % clut.len();
    let entry = if bytes == 4 {
        u32::from_le_bytes([clut[at], clut[at + 1], clut[at + 2], clut[at + 3]])
    } else {
        u32::from(u16::from_le_bytes([clut[at], clut[at + 1]]))
    };
    Color::decode(entry, format.format)
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// DXT colors keep red in the high bits, unlike GE texels.
fn dxt_color(value: u16) -> Color {
    let value = u32::from(value);
    Color::from_rgba(
        crate::bitwise::expand_channel(value.get_bits(11..=15), 5),
        crate::bitwise::expand_channel(value.get_bits(5..=10), 6),
        crate::bitwise::expand_channel(value.get_bits(0..=4), 5),
        0xFF,
    )
}

const fn third(a: u8, b: u8) -> u8 {
    ((2 * a as u32 + b as u32 + 1) / 3) as u8
}

const fn half(a: u8, b: u8) -> u8 {
    ((a as u32 + b as u32) / 2) as u8
}

/// The four colors of a DXT color block. Three-color mode (with a
/// transparent fourth entry) only exists in DXT1.
#[must_use]
pub fn dxt_palette(color1: u16, color2: u16, always_four: bool) -> [Color; 4] {
    let a = dxt_color(color1);
    let b = dxt_color(color2);
    if color1 > color2 || always_four {
        [
            a,
            b,
            Color::from_rgba(third(a.red, b.red), third(a.green, b.green), third(a.blue, b.blue), 0xFF),
            Color::from_rgba(third(b.red, a.red), third(b.green, a.green), third(b.blue, a.blue), 0xFF),
        ]
    } else {
        [
            a,
            b,
            Color::from_rgba(half(a.red, b.red), half(a.green, b.green), half(a.blue, b.blue), 0xFF),
            colors::TRANSPARENT,
        ]
    }
}

/// The eight alpha values of a DXT5 block.
#[must_use]
pub fn dxt5_alpha_ramp(alpha1: u8, alpha2: u8) -> [u8; 8] {
    let (a1, a2) = (u32::from(alpha1), u32::from(alpha2));
    let mut ramp = [alpha1, alpha2, 0, 0, 0, 0, 0, 0];
    if alpha1 > alpha2 {
        for i in 1..7 {
            ramp[i + 1] = (((7 - i as u32) * a1 + i as u32 * a2) / 7) as u8;
        }
    } else {
        for i in 1..5 {
            ramp[i + 1] = (((5 - i as u32) * a1 + i as u32 * a2) / 5) as u8;
        }
        ramp[6] = 0;
        ramp[7] = 0xFF;
    }
    ramp
}

fn decode_dxt(data: &[u8], params: &TextureParams, texels: &mut [Color]) {
    let block_size = if params.format == TextureFormat::Dxt1 { 8 } else { 16 };
    let blocks_per_row = (params.stride as usize).div_ceil(4);
    let (width, height) = (params.width as usize, params.height as usize);
    for by in 0..height.div_ceil(4) {
        for bx in 0..width.div_ceil(4) {
            let at = (by * blocks_per_row + bx) * block_size;
            if at + block_size > data.len() {
                return;
            }
            let lines = read_u32(data, at);
            let palette = dxt_palette(
                read_u16(data, at + 4),
                read_u16(data, at + 6),
                params.format != TextureFormat::Dxt1,
            );
            let (ramp, alpha_bits) = if params.format == TextureFormat::Dxt5 {
                let bits = (u64::from(read_u16(data, at + 12)) << 32) | u64::from(read_u32(data, at + 8));
                (dxt5_alpha_ramp(data[at + 14], data[at + 15]), bits)
            } else {
                ([0xFF; 8], 0)
            };
            for y in 0..4 {
                for x in 0..4 {
                    let (px, py) = (bx * 4 + x, by * 4 + y);
                    if px >= width || py >= height {
                        continue;
                    }
                    let mut color = palette[((lines >> (y * 8 + x * 2)) & 3) as usize];
                    match params.format {
                        TextureFormat::Dxt3 => {
                            let line = read_u16(data, at + 8 + y * 2);
                            color.alpha = (((line >> (x * 4)) & 0xF) * 17) as u8;
                        }
                        TextureFormat::Dxt5 => {
                            color.alpha = ramp[((alpha_bits >> (y * 12 + x * 3)) & 7) as usize];
                        }
                        _ => {}
                    }
                    texels[py * width + px] = color;
                }
            }
        }
    }
}

/// Decodes texture level 0. `clut` is the loaded palette.
#[must_use]
pub fn decode(memory: &Memory, params: &TextureParams, clut: &[u8]) -> Texture {
    let (width, height) = (params.width as usize, params.height as usize);
    let mut texels = vec![colors::TRANSPARENT; width * height];
    let size = params.byte_size() as usize;
    let Some(source) = memory.slice(params.address, size) else {
        warn!("texture at {:#010x} ({size:#x} bytes) is out of range", params.address);
        return Texture {
            width: params.width,
            height: params.height,
            texels,
        };
    };

    if params.format.is_compressed() {
        decode_dxt(source, params, &mut texels);
        return Texture {
            width: params.width,
            height: params.height,
            texels,
        };
    }

    let bits = params.format.bits_per_texel() as usize;
    let row_bytes = params.stride as usize * bits / 8;
    let unswizzled;
    let data = if params.swizzled {
        unswizzled = unswizzle(source, row_bytes, height);
        &unswizzled[..]
    } else {
        source
    };

    for y in 0..height {
        for x in 0..width {
            let bit = (y * params.stride as usize + x) * bits;
            let at = bit / 8;
            if at + bits.div_ceil(8) > data.len() {
                continue;
            }
            let raw = match bits {
                4 => u32::from(data[at] >> (bit % 8)) & 0xF,
                8 => u32::from(data[at]),
                16 => u32::from(read_u16(data, at)),
                _ => read_u32(data, at),
            };
            texels[y * width + x] = match params.format {
                TextureFormat::Rgb565 => Color::decode(raw, PixelFormat::Rgb565),
                TextureFormat::Rgba5551 => Color::decode(raw, PixelFormat::Rgba5551),
                TextureFormat::Rgba4444 => Color::decode(raw, PixelFormat::Rgba4444),
                TextureFormat::Rgba8888 => Color::decode(raw, PixelFormat::Rgba8888),
                _ => clut_color(clut, &params.clut, raw),
            };
        }
    }
    Texture {
        width: params.width,
        height: params.height,
        texels,
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

struct CacheEntry {
    params: TextureParams,
    clut_hash: u64,
    source_hash: u64,
    dirty: bool,
    last_frame: u64,
    texture: Texture,
}

impl CacheEntry {
    fn is_valid_for(&mut self, params: &TextureParams, clut_hash: u64, source: &[u8]) -> bool {
        if self.params != *params || self.clut_hash != clut_hash {
            return false;
        }
        if self.dirty {
            if hash_bytes(source) != self.source_hash {
                return false;
            }
            self.dirty = false;
        }
        true
    }
}

/// Decoded textures by guest address.
pub struct TextureCache {
    entries: HashMap<u32, CacheEntry>,
    kill_age: u64,
    frame: u64,
}

impl TextureCache {
    #[must_use]
    pub fn new(kill_age: u32) -> Self {
        Self {
            entries: HashMap::new(),
            kill_age: u64::from(kill_age),
            frame: 0,
        }
    }

    /// Returns the decoded texture, decoding it again only if the
    /// parameters changed or the source was overwritten.
    pub fn get(&mut self, memory: &Memory, params: &TextureParams, clut: &[u8]) -> &Texture {
        let clut_hash = if params.format.is_indexed() { hash_bytes(clut) } else { 0 };
        let source = memory
            .slice(params.address, params.byte_size() as usize)
            .unwrap_or_default();
        let frame = self.frame;

        let fresh = || {
            trace!("decoding {:?} texture at {:#010x}", params.format, params.address);
            CacheEntry {
                params: *params,
                clut_hash,
                source_hash: hash_bytes(source),
                dirty: false,
                last_frame: frame,
                texture: decode(memory, params, clut),
            }
        };
        let entry = self.entries.entry(params.address).or_insert_with(fresh);
        if !entry.is_valid_for(params, clut_hash, source) {
            *entry = fresh();
        }
        entry.last_frame = frame;
        &entry.texture
    }

    /// Marks every entry whose source overlaps `[address, address + size)`.
    pub fn invalidate(&mut self, address: u32, size: u32) {
        let end = address.saturating_add(size);
        for entry in self.entries.values_mut() {
            let start = entry.params.address;
            let stop = start.saturating_add(entry.params.byte_size());
            if start < end && address < stop {
                entry.dirty = true;
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.dirty = true;
        }
    }

    /// Advances to `frame` and drops entries unused for `kill_age` frames.
    pub fn decimate(&mut self, frame: u64) {
        self.frame = frame;
        let kill_age = self.kill_age;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| frame.saturating_sub(entry.last_frame) <= kill_age);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("evicted {evicted} textures at frame {frame}");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
