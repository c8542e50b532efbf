use std::fmt::Display;

use crate::bitwise::{Bits, expand_channel};

/// Pixel layout of framebuffers, CLUT entries and direct textures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    #[default]
    Rgb565,
    Rgba5551,
    Rgba4444,
    Rgba8888,
}

impl PixelFormat {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::Rgb565,
            1 => Self::Rgba5551,
            2 => Self::Rgba4444,
            _ => Self::Rgba8888,
        }
    }

    #[must_use]
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8888 => 4,
            _ => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Color {
    #[must_use]
    pub const fn from_rgba(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    /// Reads the `0xBBGGRR` layout GE color registers use. Alpha is opaque.
    #[must_use]
    pub const fn from_bgr24(value: u32) -> Self {
        Self::from_rgba(value as u8, (value >> 8) as u8, (value >> 16) as u8, 0xFF)
    }

    #[must_use]
    pub fn decode(value: u32, format: PixelFormat) -> Self {
        match format {
            PixelFormat::Rgb565 => Self::from_565(value as u16),
            PixelFormat::Rgba5551 => Self::from_5551(value as u16),
            PixelFormat::Rgba4444 => Self::from_4444(value as u16),
            PixelFormat::Rgba8888 => Self::from(value),
        }
    }

    #[must_use]
    pub fn encode(self, format: PixelFormat) -> u32 {
        match format {
            PixelFormat::Rgb565 => u32::from(self.to_565()),
            PixelFormat::Rgba5551 => u32::from(self.to_5551()),
            PixelFormat::Rgba4444 => u32::from(self.to_4444()),
            PixelFormat::Rgba8888 => u32::from(self),
        }
    }

    #[must_use]
    pub fn from_565(color: u16) -> Self {
        // red ---> bits 0-4
        // green -> bits 5-10
        // blue --> bits 11-15
        let color = u32::from(color);
        Self {
            red: expand_channel(color.get_bits(0..=4), 5),
            green: expand_channel(color.get_bits(5..=10), 6),
            blue: expand_channel(color.get_bits(11..=15), 5),
            alpha: 0xFF,
        }
    }

    #[must_use]
    pub fn from_5551(color: u16) -> Self {
        let color = u32::from(color);
        Self {
            red: expand_channel(color.get_bits(0..=4), 5),
            green: expand_channel(color.get_bits(5..=9), 5),
            blue: expand_channel(color.get_bits(10..=14), 5),
            alpha: if color.get_bit(15) { 0xFF } else { 0 },
        }
    }

    #[must_use]
    pub fn from_4444(color: u16) -> Self {
        let color = u32::from(color);
        Self {
            red: expand_channel(color.get_bits(0..=3), 4),
            green: expand_channel(color.get_bits(4..=7), 4),
            blue: expand_channel(color.get_bits(8..=11), 4),
            alpha: expand_channel(color.get_bits(12..=15), 4),
        }
    }

    #[must_use]
    pub fn to_565(self) -> u16 {
        let red = u16::from(self.red >> 3);
        let green = u16::from(self.green >> 2);
        let blue = u16::from(self.blue >> 3);
        (blue << 11) | (green << 5) | red
    }

    #[must_use]
    pub fn to_5551(self) -> u16 {
        let red = u16::from(self.red >> 3);
        let green = u16::from(self.green >> 3);
        let blue = u16::from(self.blue >> 3);
        let alpha = u16::from(self.alpha >> 7);
        (alpha << 15) | (blue << 10) | (green << 5) | red
    }

    #[must_use]
    pub fn to_4444(self) -> u16 {
        let red = u16::from(self.red >> 4);
        let green = u16::from(self.green >> 4);
        let blue = u16::from(self.blue >> 4);
        let alpha = u16::from(self.alpha >> 4);
        (alpha << 12) | (blue << 8) | (green << 4) | red
    }

    #[must_use]
    pub const fn with_alpha(self, alpha: u8) -> Self {
        Self { alpha, ..self }
    }
}

impl Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{},{})", self.red, self.green, self.blue, self.alpha)
    }
}

/// `0xAABBGGRR`, the GE's 32-bit layout.
impl From<u32> for Color {
    fn from(color: u32) -> Self {
        Self {
            red: color.get_byte(0),
            green: color.get_byte(1),
            blue: color.get_byte(2),
            alpha: color.get_byte(3),
        }
    }
}

impl From<Color> for u32 {
    fn from(color: Color) -> Self {
        let red: Self = color.red.into();
        let green: Self = color.green.into();
        let blue: Self = color.blue.into();
        let alpha: Self = color.alpha.into();

        (alpha << 24) | (blue << 16) | (green << 8) | red
    }
}

pub mod colors {
    use super::Color;

    pub const TRANSPARENT: Color = Color::from_rgba(0, 0, 0, 0);
    pub const BLACK: Color = Color::from_rgba(0, 0, 0, 255);
    pub const RED: Color = Color::from_rgba(255, 0, 0, 255);
    pub const GREEN: Color = Color::from_rgba(0, 255, 0, 255);
    pub const BLUE: Color = Color::from_rgba(0, 0, 255, 255);
    pub const WHITE: Color = Color::from_rgba(255, 255, 255, 255);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn color_from_565() {
        // red: 8     0b01000
        // green: 4   0b000100
        // blue: 2    0b00010
        let color = Color::from_565(0b00010_000100_01000);
        assert_eq!(color.red, expand_channel(8, 5));
        assert_eq!(color.green, expand_channel(4, 6));
        assert_eq!(color.blue, expand_channel(2, 5));
        assert_eq!(color.alpha, 0xFF);
    }

    #[test]
    fn color_into_u32() {
        let color = Color::from_rgba(0x11, 0x22, 0x33, 0x44);
        let value: u32 = color.into();
        assert_eq!(value, 0x4433_2211);
        assert_eq!(Color::from(value), color);
    }

    #[test]
    fn sixteen_bit_layouts_keep_their_precision() {
        for raw in [0x0000u16, 0xFFFF, 0x8421, 0x7BEF] {
            assert_eq!(Color::from_5551(raw).to_5551(), raw);
            assert_eq!(Color::from_4444(raw).to_4444(), raw);
            assert_eq!(Color::from_565(raw).to_565(), raw);
        }
    }

    #[test]
    fn register_colors_are_bgr() {
        assert_eq!(Color::from_bgr24(0x00_00FF), colors::RED);
        assert_eq!(Color::from_bgr24(0xFF_0000), colors::BLUE);
    }
}
