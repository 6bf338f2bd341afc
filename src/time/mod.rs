//! Kernel time: the jiffy clock and the timing wheel.
//!
//! The hardware timer fires once per jiffy; its top half only counts
//! (and re-arms the compare register). The bottom half, run with the
//! kernel lock held on every kernel exit, advances the soft clock one
//! jiffy at a time, expires the wheel bucket for that jiffy and does the
//! quantum accounting for the running process.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use pionabi::process::{PROCESS_QUANTA, SCHED_FIFO};
use pionabi::{Handle, SysError};
use static_assertions::const_assert;

use crate::kernel::{KResult, Kernel};
use crate::multitasking::handle::{HandleObject, HandleType};
use crate::multitasking::process::{ProcState, ProcessId};
use crate::multitasking::rendez::RendezId;
use crate::util::slab::Slab;

pub const JIFFIES_PER_SECOND: usize = 100;
pub const MICROSECONDS_PER_JIFFY: u32 = 1_000_000 / JIFFIES_PER_SECOND as u32;

const_assert!(JIFFIES_PER_SECOND as u32 * MICROSECONDS_PER_JIFFY == 1_000_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u32);

/// What an expired timer does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Raise an event on a handle (user timers).
    RaiseEvent(Handle),
    /// Wake every sleeper on a rendez.
    WakeRendez(RendezId),
    /// Blocking-syscall watchdog: set `timeout_expired` and wake the
    /// process so the restarted syscall can see it.
    Watchdog(ProcessId),
}

#[derive(Debug)]
pub struct Timer {
    pub owner: ProcessId,
    /// Absolute expiry in jiffies since boot.
    pub expiry: u64,
    /// Re-arm interval in jiffies; 0 for one-shot.
    pub period: u64,
    pub armed: bool,
    pub action: TimerAction,
}

/// Count of hardware ticks not yet folded into the soft clock. Written
/// from interrupt context, drained by the bottom half.
static PENDING_TICKS: AtomicU32 = AtomicU32::new(0);

/// Timer interrupt top half: count the tick. The dispatcher has already
/// re-armed the compare register.
pub fn timer_top_half() {
    PENDING_TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Program the first compare window.
pub unsafe fn init_hardware_timer() {
    #[cfg(target_arch = "arm")]
    {
        use crate::hal::board;
        let base = crate::hal::TIMER_BASE.load(Ordering::Relaxed);
        if base != 0 {
            let regs = board::timer_regs(base);
            crate::hal::memory_barrier();
            let clo = regs.clo.read();
            regs.c3.write(clo.wrapping_add(MICROSECONDS_PER_JIFFY));
            crate::hal::memory_barrier();
        }
    }
}

#[derive(Debug)]
pub struct TimerWheel {
    pub timers: Slab<Timer>,
    /// `JIFFIES_PER_SECOND` buckets; a timer lives in bucket
    /// `expiry % JIFFIES_PER_SECOND`.
    buckets: Vec<VecDeque<TimerId>>,
    /// Jiffies the hardware has delivered.
    pub hardclock: u64,
    /// Jiffies the bottom half has processed.
    pub softclock: u64,
}

impl TimerWheel {
    pub fn new(max_timer: usize) -> Self {
        let mut buckets = Vec::with_capacity(JIFFIES_PER_SECOND);
        for _ in 0..JIFFIES_PER_SECOND {
            buckets.push(VecDeque::new());
        }
        TimerWheel {
            timers: Slab::with_capacity(max_timer),
            buckets,
            hardclock: 0,
            softclock: 0,
        }
    }

    pub fn seconds(&self) -> u64 {
        self.softclock / JIFFIES_PER_SECOND as u64
    }

    pub fn alloc_timer(&mut self, timer: Timer) -> Result<TimerId, SysError> {
        self.timers
            .alloc(timer)
            .map(|idx| TimerId(idx as u32))
            .ok_or(SysError::Resource)
    }

    /// Arm `id` to fire at absolute jiffy `expiry`.
    pub fn arm(&mut self, id: TimerId, expiry: u64) {
        let timer = self.timers.get_mut(id.0 as usize).expect("arm: no timer");
        debug_assert!(!timer.armed);
        timer.expiry = expiry;
        timer.armed = true;
        self.buckets[expiry as usize % JIFFIES_PER_SECOND].push_back(id);
    }

    pub fn disarm(&mut self, id: TimerId) {
        let timer = match self.timers.get_mut(id.0 as usize) {
            Some(t) => t,
            None => return,
        };
        if timer.armed {
            timer.armed = false;
            let bucket = timer.expiry as usize % JIFFIES_PER_SECOND;
            self.buckets[bucket].retain(|t| *t != id);
        }
    }

    /// Disarm and free a timer.
    pub fn discard_timer(&mut self, id: TimerId) {
        self.disarm(id);
        self.timers.free(id.0 as usize);
    }

    /// Pull the timers in `now`'s bucket that have expired, in expiry
    /// order.
    fn take_expired(&mut self, now: u64) -> Vec<TimerId> {
        let bucket = &mut self.buckets[now as usize % JIFFIES_PER_SECOND];
        let mut expired: Vec<TimerId> = Vec::new();
        let mut keep: VecDeque<TimerId> = VecDeque::new();
        while let Some(id) = bucket.pop_front() {
            let timer = self.timers.get(id.0 as usize).expect("wheel: dead timer");
            if timer.expiry <= now {
                expired.push(id);
            } else {
                keep.push_back(id);
            }
        }
        *bucket = keep;
        expired.sort_by_key(|id| self.timers.get(id.0 as usize).unwrap().expiry);
        for id in expired.iter() {
            self.timers.get_mut(id.0 as usize).unwrap().armed = false;
        }
        expired
    }

    #[cfg(test)]
    pub fn advance_hardclock(&mut self, jiffies: u64) {
        self.hardclock += jiffies;
    }
}

impl Kernel {
    /// Timer bottom half: fold in hardware ticks, walk the wheel for
    /// every elapsed jiffy and account the running process's quantum.
    pub fn timer_bottom_half(&mut self) {
        self.wheel.hardclock += PENDING_TICKS.swap(0, Ordering::Relaxed) as u64;

        while self.wheel.softclock < self.wheel.hardclock {
            self.wheel.softclock += 1;
            let now = self.wheel.softclock;

            for id in self.wheel.take_expired(now) {
                self.fire_timer(id);
            }

            self.quantum_tick();
        }
    }

    fn fire_timer(&mut self, id: TimerId) {
        let (action, period) = {
            let timer = self.wheel.timers.get(id.0 as usize).expect("fire: no timer");
            (timer.action, timer.period)
        };

        // Periodic timers re-insert themselves when they fire.
        if period != 0 {
            let expiry = self.wheel.softclock + period;
            self.wheel.arm(id, expiry);
        }

        match action {
            TimerAction::RaiseEvent(h) => self.raise_event(h),
            TimerAction::WakeRendez(r) => self.wakeup(r),
            TimerAction::Watchdog(pid) => {
                let sleeping = match self.procs.get_mut(&pid) {
                    Some(proc) => {
                        proc.timeout_expired = true;
                        proc.state == ProcState::Sleep
                    },
                    None => false,
                };
                if sleeping {
                    self.wakeup_process(pid);
                }
            },
        }
    }

    fn quantum_tick(&mut self) {
        let current = self.current();
        let proc = match self.procs.get_mut(&current) {
            Some(p) => p,
            None => return,
        };
        proc.quanta_used += 1;
        // FIFO runs until it sleeps or yields; everyone else has a slice.
        if proc.sched_policy != SCHED_FIFO && proc.quanta_used >= PROCESS_QUANTA {
            self.reschedule_request = true;
        }
    }

    /// `create_timer` syscall: a fresh timer handle, unarmed.
    pub fn sys_create_timer(&mut self) -> KResult<i32> {
        let current = self.current();
        if self.handles.free_count() < 1 || self.wheel.timers.free_count() < 1 {
            return Err(SysError::Resource.into());
        }
        let h = self.handles.alloc().ok_or(SysError::Resource)?;
        let id = self
            .wheel
            .alloc_timer(Timer {
                owner: current,
                expiry: 0,
                period: 0,
                armed: false,
                action: TimerAction::RaiseEvent(h),
            })
            .expect("timer slab changed underfoot");
        self.handles
            .set_object(current, h, HandleType::Timer, HandleObject::Timer(id));
        Ok(h)
    }

    /// `set_timer` syscall: arm (or with 0 microseconds, cancel) the
    /// timer behind handle `h`. A non-zero period re-arms on expiry.
    /// Fires an event on the handle.
    pub fn sys_set_timer(&mut self, h: Handle, microseconds: u32, period_microseconds: u32) -> KResult<i32> {
        let current = self.current();
        let id = match self.handles.object_of(current, h, HandleType::Timer)? {
            HandleObject::Timer(id) => id,
            _ => return Err(SysError::Param.into()),
        };

        self.wheel.disarm(id);
        if microseconds == 0 {
            return Ok(0);
        }

        let jiffies = jiffies_for(microseconds);
        let period = if period_microseconds == 0 {
            0
        } else {
            jiffies_for(period_microseconds)
        };
        {
            let timer = self.wheel.timers.get_mut(id.0 as usize).expect("no timer");
            timer.period = period;
        }
        let expiry = self.wheel.softclock + jiffies;
        self.wheel.arm(id, expiry);
        Ok(0)
    }

    /// `set_timeout` syscall: the per-process watchdog for blocking
    /// syscalls. Zero cancels. Expiry sets `timeout_expired` and wakes
    /// the process.
    pub fn sys_set_timeout(&mut self, microseconds: u32) -> KResult<i32> {
        let current = self.current();

        if microseconds == 0 {
            if let Some(id) = self.cur().watchdog {
                self.wheel.disarm(id);
            }
            self.cur().timeout_expired = false;
            return Ok(0);
        }

        let id = match self.cur().watchdog {
            Some(id) => {
                self.wheel.disarm(id);
                id
            },
            None => {
                let id = self.wheel.alloc_timer(Timer {
                    owner: current,
                    expiry: 0,
                    period: 0,
                    armed: false,
                    action: TimerAction::Watchdog(current),
                })?;
                self.cur().watchdog = Some(id);
                id
            },
        };

        self.cur().timeout_expired = false;
        let expiry = self.wheel.softclock + jiffies_for(microseconds);
        self.wheel.arm(id, expiry);
        Ok(0)
    }

    pub(crate) fn do_close_timer(&mut self, h: Handle) {
        let current = self.current();
        if let Ok(HandleObject::Timer(id)) = self.handles.object_of(current, h, HandleType::Timer)
        {
            self.wheel.discard_timer(id);
            self.free_handle(h);
        }
    }
}

/// Round microseconds up to jiffies, minimum one.
fn jiffies_for(microseconds: u32) -> u64 {
    let j = (microseconds as u64 + MICROSECONDS_PER_JIFFY as u64 - 1)
        / MICROSECONDS_PER_JIFFY as u64;
    j.max(1)
}
