//! `InterruptManager` and the CPU interrupt mask of `Kernel_Library`.

use super::{Hle, HleFunction, HleRegistry, HleReturn};

const FUNCTIONS: &[(&str, u32, HleFunction)] = &[
    ("InterruptManager", 0xCA04_A2B9, HleFunction::new("sceKernelRegisterSubIntrHandler", register_sub_intr_handler)),
    ("InterruptManager", 0xD61E_6961, HleFunction::new("sceKernelReleaseSubIntrHandler", release_sub_intr_handler)),
    ("InterruptManager", 0xFB8E_22EC, HleFunction::new("sceKernelEnableSubIntr", enable_sub_intr)),
    ("InterruptManager", 0x8A38_9411, HleFunction::new("sceKernelDisableSubIntr", disable_sub_intr)),
    ("Kernel_Library", 0x0929_68F4, HleFunction::new("sceKernelCpuSuspendIntr", cpu_suspend_intr)),
    ("Kernel_Library", 0x5F10_D406, HleFunction::new("sceKernelCpuResumeIntr", cpu_resume_intr)),
];

pub(super) fn register(registry: &mut HleRegistry) {
    for (module, nid, function) in FUNCTIONS {
        registry.register(module, *nid, *function);
    }
}

fn register_sub_intr_handler(hle: &mut Hle) -> HleReturn {
    let (line, sub, handler, arg) = (hle.arg(0), hle.arg(1), hle.arg(2), hle.arg(3));
    hle.kernel.register_sub_interrupt(line, sub, handler, arg).into()
}

fn release_sub_intr_handler(hle: &mut Hle) -> HleReturn {
    hle.kernel.interrupts.release(hle.arg(0), hle.arg(1)).into()
}

fn enable_sub_intr(hle: &mut Hle) -> HleReturn {
    hle.kernel.interrupts.set_enabled(hle.arg(0), hle.arg(1), true).into()
}

fn disable_sub_intr(hle: &mut Hle) -> HleReturn {
    hle.kernel.interrupts.set_enabled(hle.arg(0), hle.arg(1), false).into()
}

fn cpu_suspend_intr(hle: &mut Hle) -> HleReturn {
    HleReturn::U32(hle.kernel.interrupts.suspend())
}

fn cpu_resume_intr(hle: &mut Hle) -> HleReturn {
    hle.kernel.interrupts.resume(hle.arg(0));
    HleReturn::Void
}

#[cfg(test)]
mod tests {
    use crate::kernel::hle::tests::call;
    use crate::kernel::interrupt::VBLANK_INTERRUPT;
    use crate::kernel::tests::setup;
    use pretty_assertions::assert_eq;

    #[test]
    fn suspend_nests_through_the_flag_word() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        let outer = call(&mut kernel, &mut cpu, &mut memory, "Kernel_Library", 0x0929_68F4, &[]);
        let inner = call(&mut kernel, &mut cpu, &mut memory, "Kernel_Library", 0x0929_68F4, &[]);
        assert_eq!((outer, inner), (1, 0));
        call(&mut kernel, &mut cpu, &mut memory, "Kernel_Library", 0x5F10_D406, &[inner]);
        assert!(kernel.interrupts.is_suspended());
        call(&mut kernel, &mut cpu, &mut memory, "Kernel_Library", 0x5F10_D406, &[outer]);
        assert!(!kernel.interrupts.is_suspended());
    }

    #[test]
    fn handlers_are_registered_disabled() {
        let (mut kernel, mut cpu, mut memory, _main) = setup();
        let args = [VBLANK_INTERRUPT, 0, 0x0880_4000, 0];
        assert_eq!(call(&mut kernel, &mut cpu, &mut memory, "InterruptManager", 0xCA04_A2B9, &args), 0);
        assert!(!kernel.interrupts.has_handlers());
        call(&mut kernel, &mut cpu, &mut memory, "InterruptManager", 0xFB8E_22EC, &[VBLANK_INTERRUPT, 0]);
        assert!(kernel.interrupts.has_handlers());
    }
}
