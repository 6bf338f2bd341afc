//! The scheduler: 32 real-time round-robin/FIFO queues over a
//! proportional-share stride pool.
//!
//! Real-time processes (`SCHED_RR`, `SCHED_FIFO`) always run before
//! `SCHED_OTHER`. The stride pool follows Waldspurger's stride scheduler:
//! each process advances its pass by `STRIDE1 / tickets` per quantum and
//! the lowest pass runs next. A process's unused share survives a sleep
//! as `remaining` credit.

use alloc::collections::VecDeque;

use bit_field::BitField;
use pionabi::process::{ProcFlags, SCHED_FIFO, SCHED_OTHER, SCHED_RR, STRIDE1, STRIDE_MAX_TICKETS};
use pionabi::SysError;

use crate::kernel::{KResult, Kernel};
use crate::multitasking::process::{ProcState, ProcessId, SCHED_IDLE};

/// Number of real-time priority levels.
pub const RT_PRIORITIES: usize = 32;

#[derive(Debug)]
pub struct Scheduler {
    pub realtime_queue: [VecDeque<ProcessId>; RT_PRIORITIES],
    /// Bit `p` set iff `realtime_queue[p]` is non-empty.
    pub realtime_bitmap: u32,
    /// `SCHED_OTHER` ready list, sorted by pass ascending, stable.
    pub stride_queue: VecDeque<ProcessId>,
    pub global_tickets: i64,
    pub global_stride: i64,
    pub global_pass: i64,
    pub current: ProcessId,
    pub idle: ProcessId,
}

impl Scheduler {
    pub fn new(idle: ProcessId) -> Self {
        Scheduler {
            realtime_queue: [(); RT_PRIORITIES].map(|_| VecDeque::new()),
            realtime_bitmap: 0,
            stride_queue: VecDeque::new(),
            global_tickets: 0,
            global_stride: 0,
            global_pass: 0,
            current: idle,
            idle,
        }
    }

    fn highest_rt_priority(&self) -> Option<usize> {
        if self.realtime_bitmap == 0 {
            None
        } else {
            Some(31 - self.realtime_bitmap.leading_zeros() as usize)
        }
    }
}

impl Kernel {
    /// Index in the sorted stride queue before which a process with
    /// `pass` belongs (stable: after all equal passes).
    fn stride_insert_index(&self, pass: i64) -> usize {
        let queue = &self.sched.stride_queue;
        let mut i = 0;
        while i < queue.len() {
            if self.procs[&queue[i]].pass > pass {
                return i;
            }
            i += 1;
        }
        queue.len()
    }

    /// Admit a process to the ready structures for its policy. Its
    /// scheduling accounting starts (stride tickets join the pool).
    pub fn sched_ready(&mut self, pid: ProcessId) {
        let (policy, tickets) = {
            let proc = &self.procs[&pid];
            (proc.sched_policy, proc.tickets)
        };

        match policy {
            SCHED_RR | SCHED_FIFO => {
                let prio = tickets as usize;
                self.sched.realtime_queue[prio].push_back(pid);
                self.sched.realtime_bitmap.set_bit(prio, true);
            },
            SCHED_OTHER => {
                self.sched.global_tickets += tickets as i64;
                self.sched.global_stride = STRIDE1 / self.sched.global_tickets;
                let pass = {
                    let proc = self.procs.get_mut(&pid).expect("ready: no such process");
                    proc.pass = self.sched.global_pass - proc.remaining;
                    proc.pass
                };
                let at = self.stride_insert_index(pass);
                self.sched.stride_queue.insert(at, pid);
            },
            SCHED_IDLE => {},
            other => log::error!("sched_ready: unknown policy {}", other),
        }

        self.procs.get_mut(&pid).expect("ready: no such process").quanta_used = 0;
        self.reschedule_request = true;
    }

    /// Withdraw a process from its ready structures; stride processes
    /// bank their unconsumed share in `remaining`.
    pub fn sched_unready(&mut self, pid: ProcessId) {
        let (policy, tickets) = {
            let proc = &self.procs[&pid];
            (proc.sched_policy, proc.tickets)
        };

        match policy {
            SCHED_RR | SCHED_FIFO => {
                let prio = tickets as usize;
                let queue = &mut self.sched.realtime_queue[prio];
                queue.retain(|p| *p != pid);
                if queue.is_empty() {
                    self.sched.realtime_bitmap.set_bit(prio, false);
                }
            },
            SCHED_OTHER => {
                self.sched.global_tickets -= tickets as i64;
                if self.sched.global_tickets > 0 {
                    self.sched.global_stride = STRIDE1 / self.sched.global_tickets;
                }
                let proc = self.procs.get_mut(&pid).expect("unready: no such process");
                proc.remaining = self.sched.global_pass - proc.pass;
                self.sched.stride_queue.retain(|p| *p != pid);
            },
            SCHED_IDLE => {},
            other => log::error!("sched_unready: unknown policy {}", other),
        }

        self.procs.get_mut(&pid).expect("unready: no such process").quanta_used = 0;
        self.reschedule_request = true;
    }

    /// Pick the next process to run: rotate the outgoing process into its
    /// queue, then take the highest real-time priority, else the lowest
    /// stride pass, else idle.
    pub fn reschedule(&mut self) {
        let outgoing = self.sched.current;

        let still_running = self.procs[&outgoing].state == ProcState::Running;
        if still_running {
            let policy = self.procs[&outgoing].sched_policy;
            match policy {
                SCHED_RR => {
                    let prio = self.procs[&outgoing].tickets as usize;
                    self.sched.realtime_queue[prio].push_back(outgoing);
                    self.sched.realtime_bitmap.set_bit(prio, true);
                },
                SCHED_FIFO => {
                    // Keeps its turn until it sleeps or yields.
                    let prio = self.procs[&outgoing].tickets as usize;
                    self.sched.realtime_queue[prio].push_front(outgoing);
                    self.sched.realtime_bitmap.set_bit(prio, true);
                },
                SCHED_OTHER => {
                    if self.sched.global_tickets > 0 {
                        self.sched.global_stride = STRIDE1 / self.sched.global_tickets;
                    }
                    self.sched.global_pass += self.sched.global_stride;
                    let pass = {
                        let proc = self.procs.get_mut(&outgoing).expect("no outgoing");
                        proc.pass += proc.stride;
                        proc.pass
                    };
                    let at = self.stride_insert_index(pass);
                    self.sched.stride_queue.insert(at, outgoing);
                    // Keep the pool clock from drifting past the head.
                    if let Some(head) = self.sched.stride_queue.front() {
                        let head_pass = self.procs[head].pass;
                        if self.sched.global_pass > head_pass {
                            self.sched.global_pass = head_pass;
                        }
                    }
                },
                SCHED_IDLE => {},
                other => log::error!("reschedule: unknown policy {}", other),
            }
            let proc = self.procs.get_mut(&outgoing).expect("no outgoing");
            proc.quanta_used = 0;
            proc.state = ProcState::Ready;
        }

        let next = if let Some(prio) = self.sched.highest_rt_priority() {
            let queue = &mut self.sched.realtime_queue[prio];
            let pid = queue.pop_front().expect("bitmap lied");
            if queue.is_empty() {
                self.sched.realtime_bitmap.set_bit(prio, false);
            }
            pid
        } else if let Some(pid) = self.sched.stride_queue.pop_front() {
            pid
        } else {
            self.sched.idle
        };

        self.procs.get_mut(&next).expect("no next process").state = ProcState::Running;
        self.sched.current = next;

        if next != outgoing {
            let Kernel { mem, procs, .. } = self;
            if let Some(l1) = procs[&next].pmap.l1_phys(mem) {
                unsafe { crate::arch::switch_address_space(l1) };
            }
        }
    }

    /// `set_sched_params` syscall: change the current process's policy
    /// and tickets (priority for real-time). The transition is atomic:
    /// withdraw, retune, readmit.
    pub fn sys_set_sched_params(&mut self, policy: i32, tickets: i32) -> KResult<i32> {
        let current = self.current();

        match policy {
            SCHED_RR | SCHED_FIFO => {
                if !self.procs[&current].flags.contains(ProcFlags::ALLOW_IO) {
                    return Err(SysError::Privilege.into());
                }
                if tickets < 0 || tickets as usize >= RT_PRIORITIES {
                    return Err(SysError::Param.into());
                }
            },
            SCHED_OTHER => {
                if tickets < 1 || tickets > STRIDE_MAX_TICKETS {
                    return Err(SysError::Param.into());
                }
            },
            _ => return Err(SysError::Param.into()),
        }

        self.sched_unready(current);
        {
            let global_pass = self.sched.global_pass;
            let proc = self.procs.get_mut(&current).expect("no current");
            proc.sched_policy = policy;
            proc.tickets = tickets;
            if policy == SCHED_OTHER {
                proc.stride = STRIDE1 / tickets as i64;
                proc.remaining = proc.stride;
                proc.pass = global_pass;
            }
        }
        // The current process stays off the ready queues while running,
        // but its stride tickets rejoin the pool immediately.
        if policy == SCHED_OTHER {
            self.sched.global_tickets += tickets as i64;
            self.sched.global_stride = STRIDE1 / self.sched.global_tickets;
            let proc = self.procs.get_mut(&current).expect("no current");
            proc.pass = self.sched.global_pass - proc.remaining;
        }
        let proc = self.procs.get_mut(&current).expect("no current");
        proc.quanta_used = 0;
        proc.state = ProcState::Running;
        self.reschedule_request = true;
        Ok(0)
    }

    /// Voluntarily give up the CPU.
    pub fn sys_yield(&mut self) -> KResult<i32> {
        self.reschedule_request = true;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KErr, Kernel};

    fn spawn_ready(k: &mut Kernel, policy: i32, tickets: i32) -> ProcessId {
        let pid = k.alloc_process(policy, tickets).unwrap();
        k.procs.get_mut(&pid).unwrap().state = ProcState::Ready;
        if policy == SCHED_RR || policy == SCHED_FIFO {
            k.procs.get_mut(&pid).unwrap().flags |= ProcFlags::ALLOW_IO;
        }
        k.sched_ready(pid);
        pid
    }

    fn park_current(k: &mut Kernel) {
        let r = k.alloc_rendez().unwrap();
        assert!(matches!(k.sleep(r), KErr::Restart));
    }

    #[test]
    fn bitmap_tracks_queue_occupancy() {
        let mut k = Kernel::for_tests();
        let a = spawn_ready(&mut k, SCHED_RR, 5);
        let b = spawn_ready(&mut k, SCHED_RR, 5);
        assert!(k.sched.realtime_bitmap.get_bit(5));

        k.sched_unready(a);
        assert!(k.sched.realtime_bitmap.get_bit(5));
        k.sched_unready(b);
        assert!(!k.sched.realtime_bitmap.get_bit(5));
    }

    #[test]
    fn realtime_precedes_stride() {
        let mut k = Kernel::for_tests();
        let other = spawn_ready(&mut k, SCHED_OTHER, 400);
        let rt = spawn_ready(&mut k, SCHED_RR, 3);

        park_current(&mut k);
        k.reschedule();
        assert_eq!(k.current(), rt);
        let _ = other;
    }

    #[test]
    fn higher_rt_priority_wins() {
        let mut k = Kernel::for_tests();
        let low = spawn_ready(&mut k, SCHED_RR, 2);
        let high = spawn_ready(&mut k, SCHED_RR, 9);

        park_current(&mut k);
        k.reschedule();
        assert_eq!(k.current(), high);
        let _ = low;
    }

    #[test]
    fn rr_rotates_within_priority() {
        let mut k = Kernel::for_tests();
        let a = spawn_ready(&mut k, SCHED_RR, 4);
        let b = spawn_ready(&mut k, SCHED_RR, 4);
        park_current(&mut k);

        k.reschedule();
        let first = k.current();
        k.reschedule();
        let second = k.current();
        k.reschedule();
        let third = k.current();
        assert_ne!(first, second);
        assert_eq!(first, third);
        assert!(first == a || first == b);
    }

    #[test]
    fn fifo_keeps_running_until_it_sleeps() {
        let mut k = Kernel::for_tests();
        let fifo = spawn_ready(&mut k, SCHED_FIFO, 4);
        let rr = spawn_ready(&mut k, SCHED_RR, 4);
        park_current(&mut k);

        k.reschedule();
        assert_eq!(k.current(), fifo);
        // Quantum expiry does not rotate a FIFO process.
        k.reschedule();
        assert_eq!(k.current(), fifo);

        park_current(&mut k);
        k.reschedule();
        assert_eq!(k.current(), rr);
    }

    #[test]
    fn idle_runs_when_nothing_is_ready() {
        let mut k = Kernel::for_tests();
        park_current(&mut k);
        k.reschedule();
        assert_eq!(k.current(), k.sched.idle);
    }

    #[test]
    fn stride_fairness_two_to_one() {
        let mut k = Kernel::for_tests();
        let t1 = 100;
        let t2 = 200;
        let a = spawn_ready(&mut k, SCHED_OTHER, t1);
        let b = spawn_ready(&mut k, SCHED_OTHER, t2);
        park_current(&mut k);

        let mut c1 = 0i64;
        let mut c2 = 0i64;
        for _ in 0..300 {
            k.reschedule();
            let cur = k.current();
            if cur == a {
                c1 += 1;
            } else if cur == b {
                c2 += 1;
            } else {
                panic!("unexpected pick {:?}", cur);
            }
        }
        // |c1*T2 - c2*T1| <= max(T1, T2)
        assert!((c1 * t2 as i64 - c2 * t1 as i64).abs() <= t2 as i64, "c1={} c2={}", c1, c2);
        // And the ratio is roughly 1:2.
        assert!(c2 > c1);
    }

    #[test]
    fn sleeping_keeps_remaining_credit() {
        let mut k = Kernel::for_tests();
        let a = spawn_ready(&mut k, SCHED_OTHER, 100);
        park_current(&mut k);
        k.reschedule();
        assert_eq!(k.current(), a);

        // Let it run a few quanta, then sleep and wake: its pass picks up
        // near the pool clock rather than at zero.
        k.reschedule();
        k.reschedule();
        let r = k.alloc_rendez().unwrap();
        assert!(matches!(k.sleep(r), KErr::Restart));
        k.wakeup(r);
        // Readmission resumes from the pool clock minus the banked credit.
        let proc = &k.procs[&a];
        assert_eq!(proc.pass + proc.remaining, k.sched.global_pass);
    }

    #[test]
    fn set_sched_params_validates() {
        let mut k = Kernel::for_tests();
        // Root in for_tests holds allow-io.
        assert!(k.sys_set_sched_params(SCHED_RR, 31).is_ok());
        assert!(matches!(
            k.sys_set_sched_params(SCHED_RR, 32),
            Err(KErr::Sys(SysError::Param))
        ));
        assert!(matches!(
            k.sys_set_sched_params(SCHED_OTHER, 0),
            Err(KErr::Sys(SysError::Param))
        ));
        assert!(matches!(
            k.sys_set_sched_params(SCHED_OTHER, STRIDE_MAX_TICKETS + 1),
            Err(KErr::Sys(SysError::Param))
        ));
        assert!(k.sys_set_sched_params(SCHED_OTHER, 250).is_ok());
        assert_eq!(k.cur().tickets, 250);

        // Dropping allow-io forbids the real-time classes.
        k.cur().flags.remove(ProcFlags::ALLOW_IO);
        assert!(matches!(
            k.sys_set_sched_params(SCHED_FIFO, 1),
            Err(KErr::Sys(SysError::Privilege))
        ));
    }

    #[test]
    fn policy_transition_keeps_pool_accounting_consistent() {
        let mut k = Kernel::for_tests();
        let before = k.sched.global_tickets;
        assert!(k.sys_set_sched_params(SCHED_OTHER, 300).is_ok());
        assert_eq!(k.sched.global_tickets, before - 100 + 300);
        assert!(k.sys_set_sched_params(SCHED_RR, 10).is_ok());
        assert_eq!(k.sched.global_tickets, before - 100);
    }
}
