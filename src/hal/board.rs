//! BCM283x peripheral register layouts (Raspberry Pi 1 and 4).
//!
//! The same blocks exist on both boards at different bases; the firmware
//! tells us where via `BootInfo`, so the kernel carries no per-board
//! constants beyond these layouts.

use volatile::Volatile;

/// BCM283x system timer. Free-running 1 MHz counter with four compare
/// registers; the kernel owns channel 3.
#[repr(C)]
pub struct SystemTimerRegs {
    pub cs: Volatile<u32>,
    pub clo: Volatile<u32>,
    pub chi: Volatile<u32>,
    pub c0: Volatile<u32>,
    pub c1: Volatile<u32>,
    pub c2: Volatile<u32>,
    pub c3: Volatile<u32>,
}

/// `cs` match bit for compare channel 3.
pub const ST_CS_M3: u32 = 1 << 3;

/// BCM2835-style legacy interrupt controller.
#[repr(C)]
pub struct InterruptRegs {
    pub irq_basic_pending: Volatile<u32>,
    pub irq_pending_1: Volatile<u32>,
    pub irq_pending_2: Volatile<u32>,
    pub fiq_control: Volatile<u32>,
    pub enable_irqs_1: Volatile<u32>,
    pub enable_irqs_2: Volatile<u32>,
    pub enable_basic_irqs: Volatile<u32>,
    pub disable_irqs_1: Volatile<u32>,
    pub disable_irqs_2: Volatile<u32>,
    pub disable_basic_irqs: Volatile<u32>,
}

/// PL011 UART (the Pi 1 debug console; also present on the Pi 4).
#[repr(C)]
pub struct Pl011Regs {
    pub dr: Volatile<u32>,
    _reserved0: [Volatile<u32>; 5],
    pub fr: Volatile<u32>,
    _reserved1: [Volatile<u32>; 2],
    pub ibrd: Volatile<u32>,
    pub fbrd: Volatile<u32>,
    pub lcrh: Volatile<u32>,
    pub cr: Volatile<u32>,
}

pub const PL011_FR_TXFF: u32 = 1 << 5;

/// IRQ line of system timer compare 3 in the controller's numbering.
pub const IRQ_TIMER3: usize = 3;

pub unsafe fn timer_regs(base: usize) -> &'static mut SystemTimerRegs {
    &mut *(base as *mut SystemTimerRegs)
}

pub unsafe fn interrupt_regs(base: usize) -> &'static mut InterruptRegs {
    &mut *(base as *mut InterruptRegs)
}

pub unsafe fn pl011_regs(base: usize) -> &'static mut Pl011Regs {
    &mut *(base as *mut Pl011Regs)
}
