//! GE command identifiers.
//!
//! Every display list word is `command << 24 | data`, with a 24-bit payload.
//! Floats are sent as the top 24 bits of an `f32`.

pub const NOP: u8 = 0x00;
pub const VADDR: u8 = 0x01;
pub const IADDR: u8 = 0x02;
pub const PRIM: u8 = 0x04;
pub const BEZIER: u8 = 0x05;
pub const SPLINE: u8 = 0x06;
pub const JUMP: u8 = 0x08;
pub const BJUMP: u8 = 0x09;
pub const CALL: u8 = 0x0A;
pub const RET: u8 = 0x0B;
pub const END: u8 = 0x0C;
pub const SIGNAL: u8 = 0x0E;
pub const FINISH: u8 = 0x0F;
pub const BASE: u8 = 0x10;
pub const VERTEXTYPE: u8 = 0x12;
pub const OFFSETADDR: u8 = 0x13;
pub const ORIGIN: u8 = 0x14;

pub const CULLFACEENABLE: u8 = 0x1D;
pub const TEXTUREMAPENABLE: u8 = 0x1E;
pub const ALPHABLENDENABLE: u8 = 0x21;
pub const ALPHATESTENABLE: u8 = 0x22;
pub const ZTESTENABLE: u8 = 0x23;

pub const BONEMATRIXNUMBER: u8 = 0x2A;
pub const BONEMATRIXDATA: u8 = 0x2B;
pub const WORLDMATRIXNUMBER: u8 = 0x3A;
pub const WORLDMATRIXDATA: u8 = 0x3B;
pub const VIEWMATRIXNUMBER: u8 = 0x3C;
pub const VIEWMATRIXDATA: u8 = 0x3D;
pub const PROJMATRIXNUMBER: u8 = 0x3E;
pub const PROJMATRIXDATA: u8 = 0x3F;
pub const TGENMATRIXNUMBER: u8 = 0x40;
pub const TGENMATRIXDATA: u8 = 0x41;

pub const VIEWPORTXSCALE: u8 = 0x42;
pub const VIEWPORTYSCALE: u8 = 0x43;
pub const VIEWPORTZSCALE: u8 = 0x44;
pub const VIEWPORTXCENTER: u8 = 0x45;
pub const VIEWPORTYCENTER: u8 = 0x46;
pub const VIEWPORTZCENTER: u8 = 0x47;
pub const TEXSCALEU: u8 = 0x48;
pub const TEXSCALEV: u8 = 0x49;
pub const TEXOFFSETU: u8 = 0x4A;
pub const TEXOFFSETV: u8 = 0x4B;
pub const OFFSETX: u8 = 0x4C;
pub const OFFSETY: u8 = 0x4D;

pub const SHADEMODE: u8 = 0x50;
pub const MATERIALAMBIENT: u8 = 0x55;
pub const MATERIALALPHA: u8 = 0x58;
pub const CULL: u8 = 0x9B;

pub const FRAMEBUFPTR: u8 = 0x9C;
pub const FRAMEBUFWIDTH: u8 = 0x9D;
pub const ZBUFPTR: u8 = 0x9E;
pub const ZBUFWIDTH: u8 = 0x9F;
pub const TEXADDR0: u8 = 0xA0;
pub const TEXADDR7: u8 = 0xA7;
pub const TEXBUFWIDTH0: u8 = 0xA8;
pub const TEXBUFWIDTH7: u8 = 0xAF;
pub const CLUTADDR: u8 = 0xB0;
pub const CLUTADDRUPPER: u8 = 0xB1;
pub const TRANSFERSRC: u8 = 0xB2;
pub const TRANSFERSRCW: u8 = 0xB3;
pub const TRANSFERDST: u8 = 0xB4;
pub const TRANSFERDSTW: u8 = 0xB5;
pub const TEXSIZE0: u8 = 0xB8;
pub const TEXSIZE7: u8 = 0xBF;
pub const TEXMODE: u8 = 0xC2;
pub const TEXFORMAT: u8 = 0xC3;
pub const LOADCLUT: u8 = 0xC4;
pub const CLUTFORMAT: u8 = 0xC5;
pub const TEXFILTER: u8 = 0xC6;
pub const TEXWRAP: u8 = 0xC7;
pub const TEXFUNC: u8 = 0xC9;
pub const TEXENVCOLOR: u8 = 0xCA;
pub const TEXFLUSH: u8 = 0xCB;
pub const TEXSYNC: u8 = 0xCC;

pub const FRAMEBUFPIXFORMAT: u8 = 0xD2;
pub const CLEARMODE: u8 = 0xD3;
pub const SCISSOR1: u8 = 0xD4;
pub const SCISSOR2: u8 = 0xD5;
pub const MINZ: u8 = 0xD6;
pub const MAXZ: u8 = 0xD7;
pub const ALPHATEST: u8 = 0xDB;
pub const ZTEST: u8 = 0xDE;
pub const BLENDMODE: u8 = 0xDF;
pub const BLENDFIXEDA: u8 = 0xE0;
pub const BLENDFIXEDB: u8 = 0xE1;
pub const ZWRITEDISABLE: u8 = 0xE7;
pub const MASKRGB: u8 = 0xE8;
pub const MASKALPHA: u8 = 0xE9;
pub const TRANSFERSTART: u8 = 0xEA;
pub const TRANSFERSRCPOS: u8 = 0xEB;
pub const TRANSFERDSTPOS: u8 = 0xEC;
pub const TRANSFERSIZE: u8 = 0xEE;

/// Splits a list word into its command and 24-bit payload.
#[must_use]
pub const fn split(word: u32) -> (u8, u32) {
    ((word >> 24) as u8, word & 0x00FF_FFFF)
}

/// Reassembles the `f32` a float command carries.
#[must_use]
pub const fn float24(data: u32) -> f32 {
    f32::from_bits(data << 8)
}
