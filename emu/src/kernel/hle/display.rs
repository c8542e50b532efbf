//! `sceDisplay`: video mode, the shown framebuffer and vblank waits.

use tracing::debug;

use crate::gpu::color::PixelFormat;
use crate::kernel::error;

use super::{Hle, HleFunction, HleRegistry, HleReturn};

const MODULE: &str = "sceDisplay";

const FUNCTIONS: &[(u32, HleFunction)] = &[
    (0x0E20_F177, HleFunction::new("sceDisplaySetMode", set_mode)),
    (0xDEA1_97D4, HleFunction::new("sceDisplayGetMode", get_mode)),
    (0x289D_82FE, HleFunction::new("sceDisplaySetFrameBuf", set_frame_buf)),
    (0xEEDA_2E54, HleFunction::new("sceDisplayGetFrameBuf", get_frame_buf)),
    (0x984C_27E7, HleFunction::new("sceDisplayWaitVblankStart", wait_vblank)),
    (0x46F1_86C3, HleFunction::new("sceDisplayWaitVblankStartCB", wait_vblank_cb)),
    (0x36CD_FADE, HleFunction::new("sceDisplayWaitVblank", wait_vblank)),
    (0x8EB9_EC49, HleFunction::new("sceDisplayWaitVblankCB", wait_vblank_cb)),
    (0x9C6E_AAD7, HleFunction::new("sceDisplayGetVcount", get_vcount)),
    (0x4D4E_10EC, HleFunction::new("sceDisplayIsVblank", is_vblank)),
];

pub(super) fn register(registry: &mut HleRegistry) {
    for (nid, function) in FUNCTIONS {
        registry.register(MODULE, *nid, *function);
    }
}

fn set_mode(hle: &mut Hle) -> HleReturn {
    let (mode, width, height) = (hle.arg(0), hle.arg(1), hle.arg(2));
    if width == 0 || height == 0 {
        return HleReturn::U32(error::ILLEGAL_ARGUMENT);
    }
    debug!("display mode {mode} {width}x{height}");
    let display = &mut hle.gpu.display;
    display.mode = mode;
    display.width = width;
    display.height = height;
    HleReturn::U32(error::OK)
}

fn get_mode(hle: &mut Hle) -> HleReturn {
    let display = hle.gpu.display;
    hle.write_out(0, display.mode);
    hle.write_out(1, display.width);
    hle.write_out(2, display.height);
    HleReturn::U32(error::OK)
}

fn set_frame_buf(hle: &mut Hle) -> HleReturn {
    let (address, stride, format) = (hle.arg(0), hle.arg(1), hle.arg(2));
    if format > 3 || (address != 0 && stride == 0) {
        return HleReturn::U32(error::ILLEGAL_ARGUMENT);
    }
    let display = &mut hle.gpu.display;
    display.framebuffer = address;
    display.stride = stride;
    display.format = PixelFormat::from_bits(format);
    HleReturn::U32(error::OK)
}

fn get_frame_buf(hle: &mut Hle) -> HleReturn {
    let display = hle.gpu.display;
    hle.write_out(0, display.framebuffer);
    hle.write_out(1, display.stride);
    let format = match display.format {
        PixelFormat::Rgb565 => 0,
        PixelFormat::Rgba5551 => 1,
        PixelFormat::Rgba4444 => 2,
        PixelFormat::Rgba8888 => 3,
    };
    hle.write_out(2, format);
    HleReturn::U32(error::OK)
}

fn wait_vblank(hle: &mut Hle) -> HleReturn {
    hle.kernel.wait_vblank(false).into()
}

fn wait_vblank_cb(hle: &mut Hle) -> HleReturn {
    hle.kernel.wait_vblank(true).into()
}

fn get_vcount(hle: &mut Hle) -> HleReturn {
    HleReturn::U32(hle.kernel.frame_count() as u32)
}

fn is_vblank(_hle: &mut Hle) -> HleReturn {
    HleReturn::U32(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::hle::tests::call;
    use crate::kernel::tests::setup;
    use pretty_assertions::assert_eq;

    #[test]
    fn vblank_waits_block_the_caller() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        assert_eq!(call(&mut kernel, &mut cpu, &mut memory, MODULE, 0x984C_27E7, &[]), error::OK);
        assert!(kernel.reschedule_pending());
        kernel.reschedule(&mut cpu, false);
        assert_eq!(kernel.current_thread(), None);
        assert!(kernel.idle(&mut memory));
        assert_eq!(call(&mut kernel, &mut cpu, &mut memory, MODULE, 0x9C6E_AAD7, &[]), 1);
    }

    #[test]
    fn mode_arguments_are_checked() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        assert_eq!(
            call(&mut kernel, &mut cpu, &mut memory, MODULE, 0x0E20_F177, &[0, 0, 272]),
            error::ILLEGAL_ARGUMENT
        );
        assert_eq!(
            call(&mut kernel, &mut cpu, &mut memory, MODULE, 0x289D_82FE, &[0x0400_0000, 512, 7, 1]),
            error::ILLEGAL_ARGUMENT
        );
        assert_eq!(
            call(&mut kernel, &mut cpu, &mut memory, MODULE, 0x289D_82FE, &[0x0400_0000, 512, 3, 1]),
            error::OK
        );
    }
}
