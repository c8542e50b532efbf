//! `LoadExecForUser`: process exit.

use crate::kernel::callback::Callback;
use crate::kernel::error;

use super::{Hle, HleFunction, HleRegistry, HleReturn};

const MODULE: &str = "LoadExecForUser";

const FUNCTIONS: &[(u32, HleFunction)] = &[
    (0x0557_2A5F, HleFunction::new("sceKernelExitGame", exit_game)),
    (0x2AC9_954B, HleFunction::new("sceKernelExitGameWithStatus", exit_game)),
    (0x4AC5_7943, HleFunction::new("sceKernelRegisterExitCallback", register_exit_callback)),
];

pub(super) fn register(registry: &mut HleRegistry) {
    for (nid, function) in FUNCTIONS {
        registry.register(MODULE, *nid, *function);
    }
}

fn exit_game(hle: &mut Hle) -> HleReturn {
    hle.kernel.exit_game();
    HleReturn::Void
}

fn register_exit_callback(hle: &mut Hle) -> HleReturn {
    let uid = hle.arg(0);
    if hle.kernel.objects.get::<Callback>(uid).is_none() {
        return HleReturn::U32(error::ILLEGAL_ARGUMENT);
    }
    hle.kernel.set_exit_callback(uid);
    HleReturn::U32(error::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::hle::tests::call;
    use crate::kernel::tests::setup;
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_callback_and_exit() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        let cb = kernel.create_callback("exit", 0x0880_4000, 0).unwrap();
        assert_eq!(call(&mut kernel, &mut cpu, &mut memory, MODULE, 0x4AC5_7943, &[0x999]), error::ILLEGAL_ARGUMENT);
        assert_eq!(call(&mut kernel, &mut cpu, &mut memory, MODULE, 0x4AC5_7943, &[cb]), error::OK);
        assert_eq!(kernel.exit_callback(), Some(cb));

        call(&mut kernel, &mut cpu, &mut memory, MODULE, 0x0557_2A5F, &[]);
        assert!(kernel.has_exited());
    }
}
