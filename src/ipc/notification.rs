//! Notifications: two endpoints sharing one integer of state.
//!
//! `put` overwrites the state and pokes the peer's event; `get` reads
//! whatever is current. Unlike a channel nothing queues, so only the
//! most recent value is ever observed.

use pionabi::{Handle, SysError};

use crate::kernel::{KResult, Kernel};
use crate::memory::uaccess;
use crate::multitasking::handle::{HandleObject, HandleType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(pub u32);

#[derive(Debug)]
pub struct Notification {
    /// Endpoint handles; -1 marks a closed side.
    pub handles: [Handle; 2],
    /// The single shared state word.
    pub state: i32,
}

impl Kernel {
    fn notification_of(&self, h: Handle) -> KResult<(NotificationId, usize)> {
        let current = self.current();
        let id = match self.handles.object_of(current, h, HandleType::Notification)? {
            HandleObject::Notification(id) => id,
            _ => return Err(SysError::Param.into()),
        };
        let notif = self.notifications.get(id.0 as usize).ok_or(SysError::Param)?;
        let side = if notif.handles[0] == h { 0 } else { 1 };
        Ok((id, side))
    }

    pub fn create_notification_pair(&mut self, out: &mut [Handle; 2]) -> Result<(), SysError> {
        let current = self.current();
        if self.handles.free_count() < 2 || self.notifications.free_count() < 1 {
            return Err(SysError::Resource);
        }
        let h0 = self.handles.alloc().ok_or(SysError::Resource)?;
        let h1 = self.handles.alloc().ok_or(SysError::Resource)?;
        let id = NotificationId(
            self.notifications
                .alloc(Notification {
                    handles: [h0, h1],
                    state: 0,
                })
                .expect("notification slab changed underfoot") as u32,
        );
        self.handles.set_object(
            current,
            h0,
            HandleType::Notification,
            HandleObject::Notification(id),
        );
        self.handles.set_object(
            current,
            h1,
            HandleType::Notification,
            HandleObject::Notification(id),
        );
        out[0] = h0;
        out[1] = h1;
        Ok(())
    }

    /// `create_notification` syscall; handle pair copy-out precedes the
    /// commit, as for channels.
    pub fn sys_create_notification(&mut self, result_uva: u32) -> KResult<i32> {
        let current = self.current();
        if self.handles.free_count() < 2 || self.notifications.free_count() < 1 {
            return Err(SysError::Resource.into());
        }
        let pair = [
            self.handles.peek(0).expect("free_count lied"),
            self.handles.peek(1).expect("free_count lied"),
        ];
        {
            let Kernel { mem, procs, .. } = self;
            let proc = procs.get_mut(&current).expect("no current");
            let mut bytes = [0u8; 8];
            bytes[..4].copy_from_slice(&pair[0].to_ne_bytes());
            bytes[4..].copy_from_slice(&pair[1].to_ne_bytes());
            uaccess::copy_out(mem, &mut proc.pmap, result_uva, &bytes)?;
        }
        let mut got = [0 as Handle; 2];
        self.create_notification_pair(&mut got)?;
        debug_assert_eq!(got, pair);
        Ok(0)
    }

    /// `put_notification` syscall: publish a new state value and raise
    /// the peer's event.
    pub fn sys_put_notification(&mut self, h: Handle, value: i32) -> KResult<i32> {
        let (id, side) = self.notification_of(h)?;
        let peer = 1 - side;
        let peer_handle = self.notifications.get(id.0 as usize).expect("no notification").handles
            [peer];
        if peer_handle == -1 {
            return Err(SysError::Connection.into());
        }
        self.notifications.get_mut(id.0 as usize).expect("no notification").state = value;
        self.raise_event(peer_handle);
        Ok(0)
    }

    /// `get_notification` syscall: read the state, consuming the local
    /// event.
    pub fn sys_get_notification(&mut self, h: Handle) -> KResult<i32> {
        let current = self.current();
        let (id, _side) = self.notification_of(h)?;
        let value = self.notifications.get(id.0 as usize).expect("no notification").state;
        self.clear_event(current, h);
        Ok(value)
    }

    /// Close one endpoint; the peer gets a final event. The second close
    /// frees the object.
    pub(crate) fn do_close_notification(&mut self, h: Handle) {
        let (id, side) = match self.notification_of(h) {
            Ok(found) => found,
            Err(_) => return,
        };
        let peer = 1 - side;

        let peer_handle = {
            let notif = self.notifications.get_mut(id.0 as usize).expect("no notification");
            notif.handles[side] = -1;
            notif.handles[peer]
        };
        self.free_handle(h);

        if peer_handle == -1 {
            self.notifications.free(id.0 as usize);
        } else {
            self.raise_event(peer_handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KErr;

    fn pair(k: &mut Kernel) -> [Handle; 2] {
        let mut out = [0 as Handle; 2];
        k.create_notification_pair(&mut out).unwrap();
        out
    }

    #[test]
    fn put_updates_state_and_raises_peer_event() {
        let mut k = Kernel::for_tests();
        let [a, b] = pair(&mut k);

        k.sys_put_notification(a, 41).unwrap();
        assert_eq!(k.sys_check_event(b).unwrap(), b);
        assert_eq!(k.sys_get_notification(b).unwrap(), 41);
    }

    #[test]
    fn only_most_recent_value_is_observed() {
        let mut k = Kernel::for_tests();
        let [a, b] = pair(&mut k);

        k.sys_put_notification(a, 1).unwrap();
        k.sys_put_notification(a, 2).unwrap();
        k.sys_put_notification(a, 3).unwrap();
        assert_eq!(k.sys_get_notification(b).unwrap(), 3);
        // Not queued: reading again sees the same state.
        assert_eq!(k.sys_get_notification(b).unwrap(), 3);
    }

    #[test]
    fn state_flows_both_directions() {
        let mut k = Kernel::for_tests();
        let [a, b] = pair(&mut k);
        k.sys_put_notification(b, -5).unwrap();
        assert_eq!(k.sys_get_notification(a).unwrap(), -5);
    }

    #[test]
    fn get_consumes_local_event() {
        let mut k = Kernel::for_tests();
        let [a, b] = pair(&mut k);
        k.sys_put_notification(a, 9).unwrap();
        assert_eq!(k.sys_get_notification(b).unwrap(), 9);
        assert!(matches!(k.sys_check_event(b), Err(KErr::Sys(SysError::Param))));
    }

    #[test]
    fn close_notifies_peer_then_second_close_frees() {
        let mut k = Kernel::for_tests();
        let free_handles = k.handles.free_count();
        let free_notifications = k.notifications.free_count();
        let [a, b] = pair(&mut k);

        k.sys_close_handle(a).unwrap();
        k.close_pending_handles();
        assert_eq!(k.sys_check_event(b).unwrap(), b);
        assert!(matches!(
            k.sys_put_notification(b, 1),
            Err(KErr::Sys(SysError::Connection))
        ));

        k.sys_close_handle(b).unwrap();
        k.close_pending_handles();
        assert_eq!(k.handles.free_count(), free_handles);
        assert_eq!(k.notifications.free_count(), free_notifications);
    }
}
