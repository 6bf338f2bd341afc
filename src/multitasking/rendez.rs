//! Rendez: the sleep/wakeup primitive.
//!
//! A rendez is nothing but a queue of sleeping processes. A woken system
//! call restarts from its entry point, so all blocking paths are written
//! lookup -> check -> block-or-commit and `sleep` surfaces as
//! `KErr::Restart` to the dispatcher.

use alloc::collections::VecDeque;

use pionabi::SysError;

use crate::kernel::{KErr, Kernel};
use crate::multitasking::process::{ProcState, ProcessId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RendezId(pub u32);

#[derive(Debug)]
pub struct Rendez {
    pub sleepers: VecDeque<ProcessId>,
}

impl Rendez {
    pub fn new() -> Self {
        Rendez {
            sleepers: VecDeque::new(),
        }
    }
}

impl Kernel {
    pub fn alloc_rendez(&mut self) -> Result<RendezId, SysError> {
        self.rendezvous
            .alloc(Rendez::new())
            .map(|idx| RendezId(idx as u32))
            .ok_or(SysError::Resource)
    }

    pub fn free_rendez(&mut self, r: RendezId) {
        if let Some(rendez) = self.rendezvous.free(r.0 as usize) {
            debug_assert!(rendez.sleepers.is_empty(), "freeing rendez with sleepers");
        }
    }

    /// Put the current process to sleep on `r`. Returns the `Restart`
    /// marker the syscall propagates; the syscall re-executes from the
    /// top once the process is woken.
    #[must_use]
    pub fn sleep(&mut self, r: RendezId) -> KErr {
        let current = self.current();
        {
            let proc = self.cur();
            debug_assert_eq!(proc.state, ProcState::Running);
            proc.state = ProcState::Sleep;
            proc.sleeping_on = Some(r);
        }
        self.rendezvous
            .get_mut(r.0 as usize)
            .expect("sleep on dead rendez")
            .sleepers
            .push_back(current);
        self.sched_unready(current);
        self.reschedule_request = true;
        KErr::Restart
    }

    /// Wake every process sleeping on `r`.
    pub fn wakeup(&mut self, r: RendezId) {
        loop {
            let pid = match self.rendezvous.get_mut(r.0 as usize) {
                Some(rendez) => match rendez.sleepers.pop_front() {
                    Some(pid) => pid,
                    None => break,
                },
                None => break,
            };
            let proc = self.procs.get_mut(&pid).expect("sleeper vanished");
            proc.sleeping_on = None;
            proc.state = ProcState::Ready;
            self.sched_ready(pid);
        }
    }

    /// Wake exactly one process, removing it from whatever rendez it
    /// sleeps on.
    pub fn wakeup_process(&mut self, pid: ProcessId) {
        let r = {
            let proc = match self.procs.get_mut(&pid) {
                Some(p) => p,
                None => return,
            };
            if proc.state != ProcState::Sleep {
                return;
            }
            let r = proc.sleeping_on.take().expect("sleeping without rendez");
            proc.state = ProcState::Ready;
            r
        };
        let rendez = self
            .rendezvous
            .get_mut(r.0 as usize)
            .expect("sleeper on dead rendez");
        rendez.sleepers.retain(|p| *p != pid);
        self.sched_ready(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;

    #[test]
    fn sleep_parks_and_wakeup_readies() {
        let mut k = Kernel::for_tests();
        let root = k.current();
        let r = k.alloc_rendez().unwrap();

        assert!(matches!(k.sleep(r), KErr::Restart));
        assert_eq!(k.procs[&root].state, ProcState::Sleep);
        assert_eq!(k.procs[&root].sleeping_on, Some(r));
        assert!(k.reschedule_request);

        k.wakeup(r);
        assert_eq!(k.procs[&root].state, ProcState::Ready);
        assert_eq!(k.procs[&root].sleeping_on, None);
        assert!(k.rendezvous.get(r.0 as usize).unwrap().sleepers.is_empty());
    }

    #[test]
    fn wakeup_process_removes_only_target() {
        let mut k = Kernel::for_tests();
        let r = k.alloc_rendez().unwrap();

        let a = k.alloc_process(pionabi::process::SCHED_OTHER, 100).unwrap();
        let b = k.alloc_process(pionabi::process::SCHED_OTHER, 100).unwrap();
        for pid in [a, b].iter() {
            let proc = k.procs.get_mut(pid).unwrap();
            proc.state = ProcState::Sleep;
            proc.sleeping_on = Some(r);
            k.rendezvous.get_mut(r.0 as usize).unwrap().sleepers.push_back(*pid);
        }

        k.wakeup_process(a);
        assert_eq!(k.procs[&a].state, ProcState::Ready);
        assert_eq!(k.procs[&b].state, ProcState::Sleep);
        let sleepers = &k.rendezvous.get(r.0 as usize).unwrap().sleepers;
        assert_eq!(sleepers.len(), 1);
        assert_eq!(sleepers[0], b);
    }

    #[test]
    fn wakeup_on_empty_rendez_is_noop() {
        let mut k = Kernel::for_tests();
        let r = k.alloc_rendez().unwrap();
        k.wakeup(r);
    }
}
