//! Interrupt dispatch: top half, bottom half and the per-IRQ handler
//! lists with their nested mask discipline.
//!
//! The top half runs in IRQ context with the kernel lock unavailable: it
//! latches the controller's pending bitmap into statics, masks every
//! pending level at the controller and (for the timer IRQ) re-arms the
//! compare register inline. The bottom half runs on the kernel exit path
//! with the lock held: it unmasks what the top half parked, then walks
//! each pending IRQ's handler list, bumping the handler's mask count and
//! raising the owner's event. The IRQ stays masked until every owner has
//! called `unmask_interrupt` back down to zero.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bit_field::BitField;
use pionabi::process::ProcFlags;
use pionabi::{Handle, SysError};

use crate::kernel::{KResult, Kernel};
use crate::multitasking::handle::{HandleObject, HandleType};
use crate::util::slab::Slab;

/// IRQ lines on the BCM283x: two GPU banks plus the basic bank.
pub const NIRQ: usize = 32 + 32 + 20;

/// Nesting ceiling for `mask_interrupt`.
const MASK_CNT_MAX: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IsrId(pub u32);

#[derive(Debug)]
pub struct IsrHandler {
    pub irq: usize,
    /// Handle whose event is raised when the IRQ fires.
    pub handle: Handle,
}

/// Pending bits latched by the top half, folded into `IsrTable::pending`
/// by the bottom half.
static PENDING_LATCH: [AtomicU32; 3] = [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)];

/// Reschedule request raised from IRQ context, merged by the bottom half.
static RESCHEDULE_FROM_IRQ: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
pub struct IsrTable {
    pub handlers: Slab<IsrHandler>,
    per_irq: Vec<Vec<IsrId>>,
    /// Registered handlers per IRQ; the line is unmasked while non-zero.
    handler_cnt: Vec<u32>,
    /// Nested mask counts per IRQ.
    mask_cnt: Vec<u32>,
    /// Bottom-half view of pending work.
    pub pending: [u32; 3],
    /// Shadow of the controller's disable state, bit per IRQ.
    masked_at_controller: [u32; 3],
}

impl IsrTable {
    pub fn new(max_isr_handler: usize) -> Self {
        let mut per_irq = Vec::with_capacity(NIRQ);
        for _ in 0..NIRQ {
            per_irq.push(Vec::new());
        }
        IsrTable {
            handlers: Slab::with_capacity(max_isr_handler),
            per_irq,
            handler_cnt: vec![0; NIRQ],
            mask_cnt: vec![0; NIRQ],
            pending: [0; 3],
            masked_at_controller: [0; 3],
        }
    }

    pub fn mask_count(&self, irq: usize) -> u32 {
        self.mask_cnt[irq]
    }

    pub fn is_masked_at_controller(&self, irq: usize) -> bool {
        self.masked_at_controller[irq / 32].get_bit(irq % 32)
    }

    fn set_controller_mask(&mut self, irq: usize, masked: bool) {
        self.masked_at_controller[irq / 32].set_bit(irq % 32, masked);
        controller_write_mask(irq, masked);
    }

    /// Test-side injection point standing in for the hardware latch.
    #[cfg(test)]
    pub fn latch_pending(&mut self, irq: usize) {
        self.pending[irq / 32].set_bit(irq % 32, true);
    }
}

/// Reflect one IRQ's mask state into the controller registers.
fn controller_write_mask(irq: usize, masked: bool) {
    #[cfg(target_arch = "arm")]
    unsafe {
        use crate::hal::board;
        let base = crate::hal::INTERRUPT_BASE.load(Ordering::Relaxed);
        if base == 0 {
            return;
        }
        let regs = board::interrupt_regs(base);
        let bit = 1u32 << (irq % 32);
        crate::hal::memory_barrier();
        match (irq / 32, masked) {
            (0, true) => regs.disable_irqs_1.write(bit),
            (0, false) => regs.enable_irqs_1.write(bit),
            (1, true) => regs.disable_irqs_2.write(bit),
            (1, false) => regs.enable_irqs_2.write(bit),
            (_, true) => regs.disable_basic_irqs.write(bit),
            (_, false) => regs.enable_basic_irqs.write(bit),
        }
        crate::hal::memory_barrier();
    }
    #[cfg(not(target_arch = "arm"))]
    let _ = (irq, masked);
}

/// Set up the controller: everything masked until a handler registers.
pub unsafe fn init_controller() {
    #[cfg(target_arch = "arm")]
    {
        use crate::hal::board;
        let base = crate::hal::INTERRUPT_BASE.load(Ordering::Relaxed);
        if base != 0 {
            let regs = board::interrupt_regs(base);
            regs.disable_irqs_1.write(!0);
            regs.disable_irqs_2.write(!0);
            regs.disable_basic_irqs.write(!0);
            crate::hal::memory_barrier();
        }
    }
}

/// IRQ-context entry: latch pending state, mask the pending levels,
/// special-case the jiffy timer and ask for a reschedule.
pub fn top_half() {
    #[cfg(target_arch = "arm")]
    unsafe {
        use crate::hal::board::{self, IRQ_TIMER3, ST_CS_M3};
        let base = crate::hal::INTERRUPT_BASE.load(Ordering::Relaxed);
        if base != 0 {
            let regs = board::interrupt_regs(base);
            crate::hal::memory_barrier();
            let mut pending = [
                regs.irq_pending_1.read(),
                regs.irq_pending_2.read(),
                regs.irq_basic_pending.read(),
            ];

            // The jiffy timer is handled inline: re-arm the compare
            // register and count the tick; it never reaches the
            // handler lists.
            if pending[IRQ_TIMER3 / 32].get_bit(IRQ_TIMER3 % 32) {
                pending[IRQ_TIMER3 / 32].set_bit(IRQ_TIMER3 % 32, false);
                let timer_base = crate::hal::TIMER_BASE.load(Ordering::Relaxed);
                let timer = board::timer_regs(timer_base);
                crate::hal::memory_barrier();
                if timer.cs.read() & ST_CS_M3 != 0 {
                    let clo = timer.clo.read();
                    timer
                        .c3
                        .write(clo.wrapping_add(crate::time::MICROSECONDS_PER_JIFFY));
                    timer.cs.write(ST_CS_M3);
                    crate::hal::memory_barrier();
                    crate::time::timer_top_half();
                }
            }

            // Park every pending level masked until the bottom half
            // dispatches it.
            for w in 0..3 {
                if pending[w] != 0 {
                    PENDING_LATCH[w].fetch_or(pending[w], Ordering::Relaxed);
                    match w {
                        0 => regs.disable_irqs_1.write(pending[w]),
                        1 => regs.disable_irqs_2.write(pending[w]),
                        _ => regs.disable_basic_irqs.write(pending[w]),
                    }
                }
            }
            crate::hal::memory_barrier();
        }
    }

    RESCHEDULE_FROM_IRQ.store(true, Ordering::Release);
}

impl Kernel {
    /// Bottom half, run on every kernel exit with the lock held.
    pub fn interrupt_bottom_half(&mut self) {
        if RESCHEDULE_FROM_IRQ.swap(false, Ordering::Acquire) {
            self.reschedule_request = true;
        }
        for w in 0..3 {
            self.isr.pending[w] |= PENDING_LATCH[w].swap(0, Ordering::Relaxed);
        }
        if self.isr.pending == [0; 3] {
            return;
        }

        let pending = self.isr.pending;
        self.isr.pending = [0; 3];

        for irq in 0..NIRQ {
            if !pending[irq / 32].get_bit(irq % 32) {
                continue;
            }

            // The top half parked the level; lift that unless the mask
            // discipline below keeps it down.
            self.isr.set_controller_mask(irq, false);

            let handles: Vec<Handle> = self.isr.per_irq[irq]
                .iter()
                .filter_map(|id| self.isr.handlers.get(id.0 as usize))
                .map(|handler| handler.handle)
                .collect();

            for _ in handles.iter() {
                if self.isr.mask_cnt[irq] < MASK_CNT_MAX {
                    self.isr.mask_cnt[irq] += 1;
                }
            }
            if self.isr.mask_cnt[irq] > 0 {
                self.isr.set_controller_mask(irq, true);
            }

            for h in handles {
                self.raise_event(h);
            }
        }
    }

    /// `create_interrupt` syscall: register an ISR handler for `irq` and
    /// return the handle its events arrive on. Requires allow-io.
    pub fn sys_create_interrupt(&mut self, irq: usize) -> KResult<i32> {
        let current = self.current();
        if !self.procs[&current].flags.contains(ProcFlags::ALLOW_IO) {
            return Err(SysError::Privilege.into());
        }
        if irq >= NIRQ {
            return Err(SysError::Param.into());
        }
        if self.handles.free_count() < 1 || self.isr.handlers.free_count() < 1 {
            return Err(SysError::Resource.into());
        }

        let h = self.handles.alloc().ok_or(SysError::Resource)?;
        let id = IsrId(
            self.isr
                .handlers
                .alloc(IsrHandler { irq, handle: h })
                .expect("isr slab changed underfoot") as u32,
        );
        self.isr.per_irq[irq].push(id);
        self.isr.handler_cnt[irq] += 1;
        if self.isr.handler_cnt[irq] == 1 {
            self.isr.set_controller_mask(irq, false);
        }
        self.handles
            .set_object(current, h, HandleType::Isr, HandleObject::Isr(id));
        log::debug!("irq {}: handler registered on handle {}", irq, h);
        Ok(h)
    }

    pub(crate) fn do_close_isr(&mut self, h: Handle) {
        let current = self.current();
        let id = match self.handles.object_of(current, h, HandleType::Isr) {
            Ok(HandleObject::Isr(id)) => id,
            _ => return,
        };
        let irq = match self.isr.handlers.get(id.0 as usize) {
            Some(handler) => handler.irq,
            None => return,
        };

        self.isr.per_irq[irq].retain(|i| *i != id);
        self.isr.handlers.free(id.0 as usize);
        self.isr.handler_cnt[irq] -= 1;
        if self.isr.handler_cnt[irq] == 0 {
            self.isr.set_controller_mask(irq, true);
        }
        self.free_handle(h);
    }

    /// `mask_interrupt` syscall: nested masking, up to 2^31 deep.
    /// Returns the new nesting count.
    pub fn sys_mask_interrupt(&mut self, irq: usize) -> KResult<i32> {
        let current = self.current();
        if !self.procs[&current].flags.contains(ProcFlags::ALLOW_IO) {
            return Err(SysError::Privilege.into());
        }
        if irq >= NIRQ {
            return Err(SysError::Param.into());
        }

        if self.isr.mask_cnt[irq] < MASK_CNT_MAX {
            self.isr.mask_cnt[irq] += 1;
        }
        if self.isr.mask_cnt[irq] > 0 {
            self.isr.set_controller_mask(irq, true);
        }
        Ok(self.isr.mask_cnt[irq] as i32)
    }

    /// `unmask_interrupt` syscall: undo one level; the controller opens
    /// the line again at zero.
    pub fn sys_unmask_interrupt(&mut self, irq: usize) -> KResult<i32> {
        let current = self.current();
        if !self.procs[&current].flags.contains(ProcFlags::ALLOW_IO) {
            return Err(SysError::Privilege.into());
        }
        if irq >= NIRQ {
            return Err(SysError::Param.into());
        }

        if self.isr.mask_cnt[irq] > 0 {
            self.isr.mask_cnt[irq] -= 1;
        }
        if self.isr.mask_cnt[irq] == 0 {
            self.isr.set_controller_mask(irq, false);
        }
        Ok(self.isr.mask_cnt[irq] as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KErr;
    use crate::multitasking::process::ProcState;

    #[test]
    fn irq_mask_nesting_three_deep() {
        let mut k = Kernel::for_tests();
        let irq = 49;
        let h = k.sys_create_interrupt(irq).unwrap();
        assert!(!k.isr.is_masked_at_controller(irq));

        for depth in 1..=3 {
            assert_eq!(k.sys_mask_interrupt(irq).unwrap(), depth);
            assert!(k.isr.is_masked_at_controller(irq));
        }
        for depth in (0..3).rev() {
            assert_eq!(k.sys_unmask_interrupt(irq).unwrap(), depth);
        }
        // Back to zero: the line is open at the controller.
        assert!(!k.isr.is_masked_at_controller(irq));
        let _ = h;
    }

    #[test]
    fn pending_irq_raises_event_and_masks_until_unmask() {
        let mut k = Kernel::for_tests();
        let irq = 8;
        let h = k.sys_create_interrupt(irq).unwrap();

        k.isr.latch_pending(irq);
        k.interrupt_bottom_half();

        // The owner got the event and the line is held masked.
        assert_eq!(k.sys_check_event(h).unwrap(), h);
        assert_eq!(k.isr.mask_count(irq), 1);
        assert!(k.isr.is_masked_at_controller(irq));

        k.sys_unmask_interrupt(irq).unwrap();
        assert_eq!(k.isr.mask_count(irq), 0);
        assert!(!k.isr.is_masked_at_controller(irq));
    }

    #[test]
    fn interrupt_wakes_waiting_driver() {
        let mut k = Kernel::for_tests();
        let root = k.current();
        let irq = 17;
        let h = k.sys_create_interrupt(irq).unwrap();

        assert!(matches!(k.sys_wait_event(h), Err(KErr::Restart)));
        assert_eq!(k.procs[&root].state, ProcState::Sleep);

        k.isr.latch_pending(irq);
        k.interrupt_bottom_half();
        assert_eq!(k.procs[&root].state, ProcState::Ready);
    }

    #[test]
    fn create_interrupt_requires_allow_io() {
        let mut k = Kernel::for_tests();
        k.cur().flags.remove(ProcFlags::ALLOW_IO);
        assert!(matches!(
            k.sys_create_interrupt(4),
            Err(KErr::Sys(SysError::Privilege))
        ));
        assert!(matches!(
            k.sys_mask_interrupt(4),
            Err(KErr::Sys(SysError::Privilege))
        ));
    }

    #[test]
    fn closing_last_handler_masks_the_line() {
        let mut k = Kernel::for_tests();
        let irq = 62;
        let h = k.sys_create_interrupt(irq).unwrap();
        assert!(!k.isr.is_masked_at_controller(irq));

        k.sys_close_handle(h).unwrap();
        k.close_pending_handles();
        assert!(k.isr.is_masked_at_controller(irq));
        assert_eq!(k.isr.handlers.len(), 0);
    }

    #[test]
    fn bad_irq_number_is_param_error() {
        let mut k = Kernel::for_tests();
        assert!(matches!(
            k.sys_create_interrupt(NIRQ),
            Err(KErr::Sys(SysError::Param))
        ));
        assert!(matches!(
            k.sys_mask_interrupt(NIRQ),
            Err(KErr::Sys(SysError::Param))
        ));
    }
}
