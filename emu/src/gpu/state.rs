//! The GE's register file.
//!
//! Most commands simply latch their payload; `GpuState` keeps the last value
//! of every command in `regs` and decodes fields on demand. Matrices are the
//! exception: they are uploaded one float at a time through a
//! `*NUMBER`/`*DATA` command pair, each with its own write counter.

use crate::bitwise::Bits;
use crate::memory::VRAM_BASE;

use super::color::{Color, PixelFormat};
use super::commands::{self as cmd, float24};

pub const MAX_BONES: usize = 8;
pub const CLUT_BYTES: usize = 1024;

/// Comparison used by both the depth and alpha tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TestFunc {
    Never,
    Always,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl TestFunc {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            0 => Self::Never,
            1 => Self::Always,
            2 => Self::Equal,
            3 => Self::NotEqual,
            4 => Self::Less,
            5 => Self::LessEqual,
            6 => Self::Greater,
            _ => Self::GreaterEqual,
        }
    }

    /// `value <op> reference`.
    #[must_use]
    pub fn passes<T: PartialOrd>(self, value: T, reference: T) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Equal => value == reference,
            Self::NotEqual => value != reference,
            Self::Less => value < reference,
            Self::LessEqual => value <= reference,
            Self::Greater => value > reference,
            Self::GreaterEqual => value >= reference,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFunc {
    Modulate,
    Decal,
    Blend,
    Replace,
    Add,
}

impl TextureFunc {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            1 => Self::Decal,
            2 => Self::Blend,
            3 => Self::Replace,
            4 => Self::Add,
            _ => Self::Modulate,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
    AbsoluteDifference,
}

impl BlendOp {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            1 => Self::Subtract,
            2 => Self::ReverseSubtract,
            3 => Self::Min,
            4 => Self::Max,
            5 => Self::AbsoluteDifference,
            _ => Self::Add,
        }
    }
}

/// Blend factor selector. `0`/`1` pick the other color (or its complement),
/// `2..=9` are alpha variants, `10` is the fixed register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    OtherColor,
    InverseOtherColor,
    SourceAlpha,
    InverseSourceAlpha,
    DestAlpha,
    InverseDestAlpha,
    DoubleSourceAlpha,
    InverseDoubleSourceAlpha,
    DoubleDestAlpha,
    InverseDoubleDestAlpha,
    Fixed,
}

impl BlendFactor {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0xF {
            0 => Self::OtherColor,
            1 => Self::InverseOtherColor,
            2 => Self::SourceAlpha,
            3 => Self::InverseSourceAlpha,
            4 => Self::DestAlpha,
            5 => Self::InverseDestAlpha,
            6 => Self::DoubleSourceAlpha,
            7 => Self::InverseDoubleSourceAlpha,
            8 => Self::DoubleDestAlpha,
            9 => Self::InverseDoubleDestAlpha,
            _ => Self::Fixed,
        }
    }
}

/// Texel layout of texture level 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgb565,
    Rgba5551,
    Rgba4444,
    Rgba8888,
    Clut4,
    Clut8,
    Clut16,
    Clut32,
    Dxt1,
    Dxt3,
    Dxt5,
}

impl TextureFormat {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & 0xF {
            0 => Self::Rgb565,
            1 => Self::Rgba5551,
            2 => Self::Rgba4444,
            3 => Self::Rgba8888,
            4 => Self::Clut4,
            5 => Self::Clut8,
            6 => Self::Clut16,
            7 => Self::Clut32,
            8 => Self::Dxt1,
            9 => Self::Dxt3,
            10 => Self::Dxt5,
            _ => return None,
        })
    }

    /// Bits per texel. DXT formats are averaged over a 4x4 block.
    #[must_use]
    pub const fn bits_per_texel(self) -> u32 {
        match self {
            Self::Clut4 | Self::Dxt1 => 4,
            Self::Clut8 | Self::Dxt3 | Self::Dxt5 => 8,
            Self::Rgb565 | Self::Rgba5551 | Self::Rgba4444 | Self::Clut16 => 16,
            Self::Rgba8888 | Self::Clut32 => 32,
        }
    }

    #[must_use]
    pub const fn is_indexed(self) -> bool {
        matches!(self, Self::Clut4 | Self::Clut8 | Self::Clut16 | Self::Clut32)
    }

    #[must_use]
    pub const fn is_compressed(self) -> bool {
        matches!(self, Self::Dxt1 | Self::Dxt3 | Self::Dxt5)
    }
}

/// How palette indices are remapped before the CLUT lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClutFormat {
    pub format: PixelFormat,
    pub shift: u32,
    pub mask: u32,
    pub offset: u32,
}

impl ClutFormat {
    #[must_use]
    pub const fn index(&self, raw: u32) -> u32 {
        ((raw >> self.shift) & self.mask) | self.offset
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Scissor {
    pub x1: u32,
    pub y1: u32,
    /// Inclusive.
    pub x2: u32,
    /// Inclusive.
    pub y2: u32,
}

impl Scissor {
    #[must_use]
    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub scale: [f32; 3],
    pub center: [f32; 3],
}

/// Parameters of a pending BLOCK TRANSFER.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub src: u32,
    pub src_stride: u32,
    pub src_x: u32,
    pub src_y: u32,
    pub dst: u32,
    pub dst_stride: u32,
    pub dst_x: u32,
    pub dst_y: u32,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

pub struct GpuState {
    pub regs: [u32; 256],
    pub world: [f32; 12],
    pub view: [f32; 12],
    pub projection: [f32; 16],
    pub tgen: [f32; 12],
    pub bones: [[f32; 12]; MAX_BONES],
    pub clut: Box<[u8; CLUT_BYTES]>,
    world_index: usize,
    view_index: usize,
    projection_index: usize,
    tgen_index: usize,
    bone_index: usize,
}

impl Default for GpuState {
    fn default() -> Self {
        Self::new()
    }
}

const IDENTITY_4X3: [f32; 12] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0];

impl GpuState {
    #[must_use]
    pub fn new() -> Self {
        let mut projection = [0.0; 16];
        for i in 0..4 {
            projection[i * 5] = 1.0;
        }
        Self {
            regs: [0; 256],
            world: IDENTITY_4X3,
            view: IDENTITY_4X3,
            projection,
            tgen: IDENTITY_4X3,
            bones: [IDENTITY_4X3; MAX_BONES],
            clut: Box::new([0; CLUT_BYTES]),
            world_index: 0,
            view_index: 0,
            projection_index: 0,
            tgen_index: 0,
            bone_index: 0,
        }
    }

    /// Latches a command. Returns `true` if the command was a matrix upload
    /// and is fully handled.
    pub fn apply(&mut self, command: u8, data: u32) -> bool {
        self.regs[usize::from(command)] = data;
        let value = float24(data);
        match command {
            cmd::WORLDMATRIXNUMBER => self.world_index = (data & 0xF) as usize,
            cmd::WORLDMATRIXDATA => upload(&mut self.world, &mut self.world_index, value),
            cmd::VIEWMATRIXNUMBER => self.view_index = (data & 0xF) as usize,
            cmd::VIEWMATRIXDATA => upload(&mut self.view, &mut self.view_index, value),
            cmd::PROJMATRIXNUMBER => self.projection_index = (data & 0xF) as usize,
            cmd::PROJMATRIXDATA => {
                upload(&mut self.projection, &mut self.projection_index, value);
            }
            cmd::TGENMATRIXNUMBER => self.tgen_index = (data & 0xF) as usize,
            cmd::TGENMATRIXDATA => upload(&mut self.tgen, &mut self.tgen_index, value),
            cmd::BONEMATRIXNUMBER => self.bone_index = (data & 0x7F) as usize,
            cmd::BONEMATRIXDATA => {
                let index = self.bone_index;
                if index < MAX_BONES * 12 {
                    self.bones[index / 12][index % 12] = value;
                }
                self.bone_index += 1;
            }
            _ => return false,
        }
        true
    }

    fn reg(&self, command: u8) -> u32 {
        self.regs[usize::from(command)]
    }

    fn enabled(&self, command: u8) -> bool {
        self.reg(command).get_bit(0)
    }

    fn float(&self, command: u8) -> f32 {
        float24(self.reg(command))
    }

    #[must_use]
    pub fn framebuffer_address(&self) -> u32 {
        let raw = self.reg(cmd::FRAMEBUFPTR) | ((self.reg(cmd::FRAMEBUFWIDTH) & 0x00FF_0000) << 8);
        VRAM_BASE | (raw & 0x001F_FFF0)
    }

    #[must_use]
    pub fn framebuffer_stride(&self) -> u32 {
        self.reg(cmd::FRAMEBUFWIDTH) & 0x7FC
    }

    #[must_use]
    pub fn framebuffer_format(&self) -> PixelFormat {
        PixelFormat::from_bits(self.reg(cmd::FRAMEBUFPIXFORMAT))
    }

    #[must_use]
    pub fn depth_address(&self) -> u32 {
        let raw = self.reg(cmd::ZBUFPTR) | ((self.reg(cmd::ZBUFWIDTH) & 0x00FF_0000) << 8);
        VRAM_BASE | (raw & 0x001F_FFF0)
    }

    #[must_use]
    pub fn depth_stride(&self) -> u32 {
        self.reg(cmd::ZBUFWIDTH) & 0x7FC
    }

    #[must_use]
    pub fn texture_address(&self, level: u8) -> u32 {
        let level = level.min(7);
        let low = self.reg(cmd::TEXADDR0 + level) & 0x00FF_FFF0;
        let high = (self.reg(cmd::TEXBUFWIDTH0 + level) << 8) & 0x0F00_0000;
        low | high
    }

    #[must_use]
    pub fn texture_stride(&self, level: u8) -> u32 {
        self.reg(cmd::TEXBUFWIDTH0 + level.min(7)) & 0x7FF
    }

    #[must_use]
    pub fn texture_size(&self, level: u8) -> (u32, u32) {
        let size = self.reg(cmd::TEXSIZE0 + level.min(7));
        (1 << (size & 0xF).min(9), 1 << ((size >> 8) & 0xF).min(9))
    }

    #[must_use]
    pub fn texture_format(&self) -> Option<TextureFormat> {
        TextureFormat::from_bits(self.reg(cmd::TEXFORMAT))
    }

    #[must_use]
    pub fn texture_swizzled(&self) -> bool {
        self.reg(cmd::TEXMODE).get_bit(0)
    }

    #[must_use]
    pub fn clut_address(&self) -> u32 {
        (self.reg(cmd::CLUTADDR) & 0x00FF_FFF0) | ((self.reg(cmd::CLUTADDRUPPER) << 8) & 0x0F00_0000)
    }

    #[must_use]
    pub fn clut_format(&self) -> ClutFormat {
        let data = self.reg(cmd::CLUTFORMAT);
        ClutFormat {
            format: PixelFormat::from_bits(data),
            shift: data.get_bits(2..=6),
            mask: data.get_bits(8..=15),
            offset: data.get_bits(16..=20) << 4,
        }
    }

    /// Bilinear magnification.
    #[must_use]
    pub fn texture_linear(&self) -> bool {
        self.reg(cmd::TEXFILTER).get_bit(8)
    }

    #[must_use]
    pub fn texture_clamp(&self) -> (bool, bool) {
        let wrap = self.reg(cmd::TEXWRAP);
        (wrap.get_bit(0), wrap.get_bit(8))
    }

    #[must_use]
    pub fn texture_func(&self) -> TextureFunc {
        TextureFunc::from_bits(self.reg(cmd::TEXFUNC))
    }

    /// Whether the texture alpha takes part in the texture function.
    #[must_use]
    pub fn texture_alpha(&self) -> bool {
        self.reg(cmd::TEXFUNC).get_bit(8)
    }

    #[must_use]
    pub fn texture_doubling(&self) -> bool {
        self.reg(cmd::TEXFUNC).get_bit(16)
    }

    #[must_use]
    pub fn texture_env_color(&self) -> Color {
        Color::from_bgr24(self.reg(cmd::TEXENVCOLOR))
    }

    #[must_use]
    pub fn texture_scale_offset(&self) -> [f32; 4] {
        [
            self.float(cmd::TEXSCALEU),
            self.float(cmd::TEXSCALEV),
            self.float(cmd::TEXOFFSETU),
            self.float(cmd::TEXOFFSETV),
        ]
    }

    #[must_use]
    pub fn texture_enabled(&self) -> bool {
        self.enabled(cmd::TEXTUREMAPENABLE)
    }

    #[must_use]
    pub fn clear_mode(&self) -> bool {
        self.enabled(cmd::CLEARMODE)
    }

    /// Color, alpha and depth writes of clear mode.
    #[must_use]
    pub fn clear_flags(&self) -> (bool, bool, bool) {
        let data = self.reg(cmd::CLEARMODE);
        (data.get_bit(8), data.get_bit(9), data.get_bit(10))
    }

    #[must_use]
    pub fn scissor(&self) -> Scissor {
        let first = self.reg(cmd::SCISSOR1);
        let second = self.reg(cmd::SCISSOR2);
        Scissor {
            x1: first.get_bits(0..=9),
            y1: first.get_bits(10..=19),
            x2: second.get_bits(0..=9),
            y2: second.get_bits(10..=19),
        }
    }

    #[must_use]
    pub fn depth_range(&self) -> (u16, u16) {
        (self.reg(cmd::MINZ) as u16, self.reg(cmd::MAXZ) as u16)
    }

    #[must_use]
    pub fn depth_test_enabled(&self) -> bool {
        self.enabled(cmd::ZTESTENABLE)
    }

    #[must_use]
    pub fn depth_func(&self) -> TestFunc {
        TestFunc::from_bits(self.reg(cmd::ZTEST))
    }

    #[must_use]
    pub fn depth_write_enabled(&self) -> bool {
        !self.enabled(cmd::ZWRITEDISABLE)
    }

    #[must_use]
    pub fn alpha_test_enabled(&self) -> bool {
        self.enabled(cmd::ALPHATESTENABLE)
    }

    /// Function, reference and mask of the alpha test.
    #[must_use]
    pub fn alpha_test(&self) -> (TestFunc, u8, u8) {
        let data = self.reg(cmd::ALPHATEST);
        (TestFunc::from_bits(data), data.get_byte(1), data.get_byte(2))
    }

    #[must_use]
    pub fn blend_enabled(&self) -> bool {
        self.enabled(cmd::ALPHABLENDENABLE)
    }

    #[must_use]
    pub fn blend_mode(&self) -> (BlendFactor, BlendFactor, BlendOp) {
        let data = self.reg(cmd::BLENDMODE);
        (
            BlendFactor::from_bits(data.get_bits(0..=3)),
            BlendFactor::from_bits(data.get_bits(4..=7)),
            BlendOp::from_bits(data.get_bits(8..=10)),
        )
    }

    #[must_use]
    pub fn blend_fixed(&self) -> (Color, Color) {
        (
            Color::from_bgr24(self.reg(cmd::BLENDFIXEDA)),
            Color::from_bgr24(self.reg(cmd::BLENDFIXEDB)),
        )
    }

    /// Bits set in the mask are kept from the destination.
    #[must_use]
    pub fn color_mask(&self) -> u32 {
        (self.reg(cmd::MASKRGB) & 0x00FF_FFFF) | ((self.reg(cmd::MASKALPHA) & 0xFF) << 24)
    }

    #[must_use]
    pub fn gouraud(&self) -> bool {
        self.enabled(cmd::SHADEMODE)
    }

    #[must_use]
    pub fn cull_enabled(&self) -> bool {
        self.enabled(cmd::CULLFACEENABLE)
    }

    /// `false` culls positive-area triangles, `true` culls negative ones.
    #[must_use]
    pub fn cull_negative(&self) -> bool {
        self.enabled(cmd::CULL)
    }

    #[must_use]
    pub fn material_ambient(&self) -> Color {
        Color::from_bgr24(self.reg(cmd::MATERIALAMBIENT)).with_alpha(self.reg(cmd::MATERIALALPHA) as u8)
    }

    #[must_use]
    pub fn viewport(&self) -> Viewport {
        Viewport {
            scale: [
                self.float(cmd::VIEWPORTXSCALE),
                self.float(cmd::VIEWPORTYSCALE),
                self.float(cmd::VIEWPORTZSCALE),
            ],
            center: [
                self.float(cmd::VIEWPORTXCENTER),
                self.float(cmd::VIEWPORTYCENTER),
                self.float(cmd::VIEWPORTZCENTER),
            ],
        }
    }

    /// Screen offset in 1/16 pixels.
    #[must_use]
    pub fn screen_offset(&self) -> (u32, u32) {
        (self.reg(cmd::OFFSETX) & 0xFFFF, self.reg(cmd::OFFSETY) & 0xFFFF)
    }

    #[must_use]
    pub fn transfer(&self) -> Transfer {
        let src_w = self.reg(cmd::TRANSFERSRCW);
        let dst_w = self.reg(cmd::TRANSFERDSTW);
        let src_pos = self.reg(cmd::TRANSFERSRCPOS);
        let dst_pos = self.reg(cmd::TRANSFERDSTPOS);
        let size = self.reg(cmd::TRANSFERSIZE);
        Transfer {
            src: (self.reg(cmd::TRANSFERSRC) & 0x00FF_FFF0) | ((src_w & 0x00FF_0000) << 8),
            src_stride: src_w & 0x7F8,
            src_x: src_pos.get_bits(0..=9),
            src_y: src_pos.get_bits(10..=19),
            dst: (self.reg(cmd::TRANSFERDST) & 0x00FF_FFF0) | ((dst_w & 0x00FF_0000) << 8),
            dst_stride: dst_w & 0x7F8,
            dst_x: dst_pos.get_bits(0..=9),
            dst_y: dst_pos.get_bits(10..=19),
            width: size.get_bits(0..=9) + 1,
            height: size.get_bits(10..=19) + 1,
            bytes_per_pixel: if self.reg(cmd::TRANSFERSTART).get_bit(0) { 4 } else { 2 },
        }
    }
}

fn upload<const N: usize>(matrix: &mut [f32; N], index: &mut usize, value: f32) {
    if *index < N {
        matrix[*index] = value;
    }
    *index += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn float_data(value: f32) -> u32 {
        value.to_bits() >> 8
    }

    #[test]
    fn matrix_uploads_advance_row_by_row() {
        let mut state = GpuState::new();
        state.apply(cmd::WORLDMATRIXNUMBER, 0);
        for i in 0..12 {
            state.apply(cmd::WORLDMATRIXDATA, float_data(i as f32));
        }
        // extra writes past the end are ignored
        state.apply(cmd::WORLDMATRIXDATA, float_data(99.0));
        assert_eq!(state.world[11], 11.0);
        assert_eq!(state.world[0], 0.0);

        state.apply(cmd::BONEMATRIXNUMBER, 12);
        state.apply(cmd::BONEMATRIXDATA, float_data(2.0));
        assert_eq!(state.bones[1][0], 2.0);
    }

    #[test]
    fn field_decoding() {
        let mut state = GpuState::new();
        state.apply(cmd::FRAMEBUFPTR, 0x08_8000);
        state.apply(cmd::FRAMEBUFWIDTH, 512);
        state.apply(cmd::CLUTFORMAT, 3 | (4 << 2) | (0x0F << 8) | (2 << 16));
        state.apply(cmd::SCISSOR2, 479 | (271 << 10));
        state.apply(cmd::BLENDMODE, 2 | (3 << 4) | (1 << 8));

        assert_eq!(state.framebuffer_address(), 0x0408_8000);
        assert_eq!(state.framebuffer_stride(), 512);
        let clut = state.clut_format();
        assert_eq!(clut.format, PixelFormat::Rgba8888);
        assert_eq!(clut.index(0xA5), 0x2A);
        assert!(state.scissor().contains(479, 271));
        assert!(!state.scissor().contains(480, 0));
        assert_eq!(
            state.blend_mode(),
            (BlendFactor::SourceAlpha, BlendFactor::InverseSourceAlpha, BlendOp::Subtract)
        );
    }
}
