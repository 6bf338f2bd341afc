//! The global handle table.
//!
//! Every kernel object a process can name is reached through a small
//! integer handle. Numbers come from one global free list; ownership and
//! type are recorded at allocation and checked on every lookup.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use pionabi::{Handle, SysError};

use crate::interrupt::IsrId;
use crate::ipc::channel::ChannelId;
use crate::ipc::notification::NotificationId;
use crate::kernel::{KResult, Kernel};
use crate::multitasking::process::ProcessId;
use crate::time::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Free,
    Process,
    Isr,
    Channel,
    Timer,
    Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleObject {
    None,
    Process(ProcessId),
    Isr(IsrId),
    Channel(ChannelId),
    Timer(TimerId),
    Notification(NotificationId),
}

#[derive(Debug)]
pub struct HandleEntry {
    pub htype: HandleType,
    /// Owning process; `None` while an entry is in flight inside a
    /// channel parcel.
    pub owner: Option<ProcessId>,
    pub object: HandleObject,
    /// Event pending bit (see the event facility).
    pub pending: bool,
}

impl HandleEntry {
    fn free() -> Self {
        HandleEntry {
            htype: HandleType::Free,
            owner: None,
            object: HandleObject::None,
            pending: false,
        }
    }
}

#[derive(Debug)]
pub struct HandleTable {
    entries: Vec<HandleEntry>,
    free_list: VecDeque<Handle>,
}

impl HandleTable {
    pub fn new(max_handle: usize) -> Self {
        let mut entries = Vec::with_capacity(max_handle);
        let mut free_list = VecDeque::with_capacity(max_handle);
        for h in 0..max_handle {
            entries.push(HandleEntry::free());
            free_list.push_back(h as Handle);
        }
        HandleTable { entries, free_list }
    }

    pub fn max_handle(&self) -> usize {
        self.entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// The handle number the `index`-th upcoming `alloc` will return.
    /// Lets multi-handle syscalls copy numbers out to the user before
    /// committing to the allocation.
    pub fn peek(&self, index: usize) -> Option<Handle> {
        self.free_list.get(index).copied()
    }

    pub fn alloc(&mut self) -> Option<Handle> {
        let h = self.free_list.pop_front()?;
        debug_assert_eq!(self.entries[h as usize].htype, HandleType::Free);
        Some(h)
    }

    /// Return a number to the free list. The pending bit must already be
    /// cleared (`Kernel::free_handle` does both).
    pub(super) fn release(&mut self, h: Handle) {
        let entry = &mut self.entries[h as usize];
        debug_assert!(!entry.pending);
        *entry = HandleEntry::free();
        self.free_list.push_back(h);
    }

    pub fn set_object(
        &mut self, owner: ProcessId, h: Handle, htype: HandleType, object: HandleObject,
    ) {
        let entry = &mut self.entries[h as usize];
        entry.htype = htype;
        entry.object = object;
        entry.owner = Some(owner);
        entry.pending = false;
    }

    pub fn get(&self, h: Handle) -> Option<&HandleEntry> {
        if h < 0 {
            return None;
        }
        self.entries.get(h as usize)
    }

    pub fn get_mut(&mut self, h: Handle) -> Option<&mut HandleEntry> {
        if h < 0 {
            return None;
        }
        self.entries.get_mut(h as usize)
    }

    /// Typed, ownership-checked lookup: the original's `GetObject`.
    pub fn object_of(
        &self, owner: ProcessId, h: Handle, htype: HandleType,
    ) -> Result<HandleObject, SysError> {
        let entry = self.get(h).ok_or(SysError::Param)?;
        if entry.owner != Some(owner) {
            return Err(SysError::Param);
        }
        if entry.htype != htype {
            return Err(SysError::Handle);
        }
        Ok(entry.object)
    }

    /// Handles currently owned by `pid`.
    pub fn owned_by(&self, pid: ProcessId) -> Vec<Handle> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.owner == Some(pid) && e.htype != HandleType::Free)
            .map(|(h, _)| h as Handle)
            .collect()
    }
}

impl Kernel {
    /// Free a handle number, clearing any pending event first.
    pub fn free_handle(&mut self, h: Handle) {
        if let Some(owner) = self.handles.get(h).and_then(|e| e.owner) {
            self.clear_event(owner, h);
        }
        self.handles.release(h);
    }

    /// `close_handle` syscall: closing is deferred to the kernel exit
    /// path; this only queues the handle.
    pub fn sys_close_handle(&mut self, h: Handle) -> KResult<i32> {
        let current = self.current();
        let entry = self.handles.get(h).ok_or(SysError::Param)?;
        if entry.owner != Some(current) {
            return Err(SysError::Param.into());
        }
        let cur = self.cur();
        if !cur.close_handles.contains(&h) {
            cur.close_handles.push_back(h);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_predicts_alloc_order() {
        let mut t = HandleTable::new(8);
        let first = t.peek(0).unwrap();
        let second = t.peek(1).unwrap();
        assert_eq!(t.alloc().unwrap(), first);
        assert_eq!(t.alloc().unwrap(), second);
    }

    #[test]
    fn typed_lookup_checks_owner_and_type() {
        let mut t = HandleTable::new(4);
        let owner = ProcessId::first();
        let stranger = owner.next();
        let h = t.alloc().unwrap();
        t.set_object(owner, h, HandleType::Channel, HandleObject::Channel(ChannelId(7)));

        assert!(t.object_of(owner, h, HandleType::Channel).is_ok());
        assert_eq!(
            t.object_of(stranger, h, HandleType::Channel),
            Err(SysError::Param)
        );
        assert_eq!(
            t.object_of(owner, h, HandleType::Timer),
            Err(SysError::Handle)
        );
        assert_eq!(t.object_of(owner, -1, HandleType::Channel), Err(SysError::Param));
    }

    #[test]
    fn release_recycles_numbers() {
        let mut t = HandleTable::new(2);
        let a = t.alloc().unwrap();
        let b = t.alloc().unwrap();
        assert_eq!(t.alloc(), None);
        t.release(a);
        assert_eq!(t.free_count(), 1);
        assert_eq!(t.alloc().unwrap(), a);
        let _ = b;
    }
}
