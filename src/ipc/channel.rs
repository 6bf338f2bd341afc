//! Channels: two handle endpoints, each with its own FIFO of parcels.
//!
//! A parcel is either a byte message or a granted handle. Either endpoint
//! can be closed independently; the survivor learns about it through an
//! event and subsequent `Connection` errors. Parcels still queued at a
//! closing endpoint are reclaimed through the closer's pending-close
//! list, so granted objects are never stranded.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use pionabi::{Handle, SysError};

use crate::kernel::{KResult, Kernel};
use crate::memory::uaccess;
use crate::multitasking::handle::{HandleObject, HandleType};

/// Largest byte message a channel accepts.
pub const MAX_MSG_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

#[derive(Debug)]
pub enum Parcel {
    Msg(Vec<u8>),
    /// A handle in flight: the entry keeps its number but has no owner
    /// until the receiver picks it up.
    Grant(Handle),
}

#[derive(Debug)]
pub struct Channel {
    /// The two endpoint handles; -1 marks a closed side.
    pub handles: [Handle; 2],
    /// Pending parcels per endpoint, FIFO.
    pub queues: [VecDeque<Parcel>; 2],
}

impl Kernel {
    fn channel_of(&self, h: Handle) -> KResult<(ChannelId, usize)> {
        let current = self.current();
        let id = match self.handles.object_of(current, h, HandleType::Channel)? {
            HandleObject::Channel(id) => id,
            _ => return Err(SysError::Param.into()),
        };
        let channel = self.channels.get(id.0 as usize).ok_or(SysError::Param)?;
        let side = if channel.handles[0] == h { 0 } else { 1 };
        Ok((id, side))
    }

    /// Kernel-level channel creation; the syscall wrapper handles the
    /// user copy-out of the handle pair.
    pub fn create_channel_pair(&mut self, out: &mut [Handle; 2]) -> Result<(), SysError> {
        let current = self.current();
        if self.handles.free_count() < 2 || self.channels.free_count() < 1 {
            return Err(SysError::Resource);
        }
        let h0 = self.handles.alloc().ok_or(SysError::Resource)?;
        let h1 = self.handles.alloc().ok_or(SysError::Resource)?;
        let id = ChannelId(
            self.channels
                .alloc(Channel {
                    handles: [h0, h1],
                    queues: [VecDeque::new(), VecDeque::new()],
                })
                .expect("channel slab changed underfoot") as u32,
        );
        self.handles
            .set_object(current, h0, HandleType::Channel, HandleObject::Channel(id));
        self.handles
            .set_object(current, h1, HandleType::Channel, HandleObject::Channel(id));
        out[0] = h0;
        out[1] = h1;
        Ok(())
    }

    /// `create_channel` syscall. The handle numbers are copied out to
    /// the user *before* the allocation commits, using `peek_handle`;
    /// a fault in the copy must not leak kernel objects.
    pub fn sys_create_channel(&mut self, result_uva: u32) -> KResult<i32> {
        let current = self.current();
        if self.handles.free_count() < 2 || self.channels.free_count() < 1 {
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
        self.create_channel_pair(&mut got)?;
        debug_assert_eq!(got, pair);
        Ok(0)
    }

    /// `put_msg` syscall: enqueue bytes for the *other* endpoint and
    /// raise its event.
    pub fn sys_put_msg(&mut self, h: Handle, buf_uva: u32, len: u32) -> KResult<i32> {
        if len as usize > MAX_MSG_SIZE {
            return Err(SysError::Param.into());
        }
        let (id, side) = self.channel_of(h)?;
        let peer = 1 - side;
        let peer_handle = self.channels.get(id.0 as usize).expect("no channel").handles[peer];
        if peer_handle == -1 {
            return Err(SysError::Connection.into());
        }

        let mut payload = vec![0u8; len as usize];
        {
            let current = self.current();
            let Kernel { mem, procs, .. } = self;
            let proc = procs.get(&current).expect("no current");
            uaccess::copy_in(mem, &proc.pmap, buf_uva, &mut payload)?;
        }

        self.channels
            .get_mut(id.0 as usize)
            .expect("no channel")
            .queues[peer]
            .push_back(Parcel::Msg(payload));
        self.raise_event(peer_handle);
        Ok(len as i32)
    }

    /// `get_msg` syscall: dequeue this endpoint's oldest parcel. Returns
    /// the byte count copied out; an empty queue or a handle grant at
    /// the head is a `Message` error.
    pub fn sys_get_msg(&mut self, h: Handle, buf_uva: u32, buf_len: u32) -> KResult<i32> {
        let (id, side) = self.channel_of(h)?;

        let payload = {
            let channel = self.channels.get_mut(id.0 as usize).expect("no channel");
            let head_is_msg = matches!(channel.queues[side].front(), Some(Parcel::Msg(_)));
            if !head_is_msg {
                return Err(SysError::Message.into());
            }
            match channel.queues[side].pop_front() {
                Some(Parcel::Msg(payload)) => payload,
                _ => unreachable!(),
            }
        };

        let n = payload.len().min(buf_len as usize);
        {
            let current = self.current();
            let Kernel { mem, procs, .. } = self;
            let proc = procs.get_mut(&current).expect("no current");
            uaccess::copy_out(mem, &mut proc.pmap, buf_uva, &payload[..n])?;
        }
        Ok(n as i32)
    }

    /// `put_handle` syscall: grant a handle through the channel. The
    /// sender loses the handle immediately; the entry rides in the
    /// parcel without an owner.
    pub fn sys_put_handle(&mut self, ch: Handle, h: Handle) -> KResult<i32> {
        let current = self.current();
        let (id, side) = self.channel_of(ch)?;
        let peer = 1 - side;
        let peer_handle = self.channels.get(id.0 as usize).expect("no channel").handles[peer];
        if peer_handle == -1 {
            return Err(SysError::Connection.into());
        }

        let entry = self.handles.get(h).ok_or(SysError::Param)?;
        if entry.owner != Some(current) || entry.htype == HandleType::Free {
            return Err(SysError::Param.into());
        }
        // Granting an endpoint of the same channel would orphan it.
        let endpoints = self.channels.get(id.0 as usize).expect("no channel").handles;
        if h == endpoints[0] || h == endpoints[1] {
            return Err(SysError::Param.into());
        }

        self.clear_event(current, h);
        self.handles.get_mut(h).expect("entry vanished").owner = None;
        self.channels
            .get_mut(id.0 as usize)
            .expect("no channel")
            .queues[peer]
            .push_back(Parcel::Grant(h));
        self.raise_event(peer_handle);
        Ok(0)
    }

    /// `get_handle` syscall: receive a granted handle. The receiving
    /// side's ownership record is created here, at receive time.
    pub fn sys_get_handle(&mut self, ch: Handle) -> KResult<i32> {
        let current = self.current();
        let (id, side) = self.channel_of(ch)?;

        let granted = {
            let channel = self.channels.get_mut(id.0 as usize).expect("no channel");
            let head_is_grant = matches!(channel.queues[side].front(), Some(Parcel::Grant(_)));
            if !head_is_grant {
                return Err(SysError::Message.into());
            }
            match channel.queues[side].pop_front() {
                Some(Parcel::Grant(granted)) => granted,
                _ => unreachable!(),
            }
        };

        self.handles.get_mut(granted).expect("granted entry vanished").owner = Some(current);
        Ok(granted)
    }

    /// `is_a_channel` syscall: succeeds iff `h1` and `h2` are the two
    /// endpoints of one channel owned by the caller.
    pub fn sys_is_a_channel(&mut self, h1: Handle, h2: Handle) -> KResult<i32> {
        let (id1, side1) = self.channel_of(h1)?;
        let (id2, side2) = self.channel_of(h2)?;
        if id1 == id2 && side1 != side2 {
            Ok(0)
        } else {
            Err(SysError::Param.into())
        }
    }

    /// Close one endpoint. Parcels pending here are reclaimed: granted
    /// handles go onto the closer's pending-close list so the kernel
    /// exit path closes the objects properly. The last side out frees
    /// the channel.
    pub(crate) fn do_close_channel(&mut self, h: Handle) {
        let current = self.current();
        let (id, side) = match self.channel_of(h) {
            Ok(found) => found,
            Err(_) => return,
        };
        let peer = 1 - side;

        let drained = {
            let channel = self.channels.get_mut(id.0 as usize).expect("no channel");
            channel.handles[side] = -1;
            core::mem::take(&mut channel.queues[side])
        };
        for parcel in drained {
            if let Parcel::Grant(granted) = parcel {
                self.handles.get_mut(granted).expect("granted entry vanished").owner =
                    Some(current);
                let cur = self.cur();
                if !cur.close_handles.contains(&granted) {
                    cur.close_handles.push_back(granted);
                }
            }
        }

        let peer_handle = self.channels.get(id.0 as usize).expect("no channel").handles[peer];
        self.free_handle(h);

        if peer_handle == -1 {
            self.channels.free(id.0 as usize);
        } else {
            self.raise_event(peer_handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KErr;
    use crate::memory::{PageFlags, PAGE_SIZE};

    /// Map one page of user memory for message buffers.
    fn user_buf(k: &mut Kernel) -> u32 {
        let va = 0x0100_0000;
        let mapped = k
            .sys_virtualalloc(
                va,
                PAGE_SIZE as u32,
                (PageFlags::PROT_READ | PageFlags::PROT_WRITE).bits(),
            )
            .unwrap();
        assert_eq!(mapped as usize, PAGE_SIZE);
        va
    }

    fn pair(k: &mut Kernel) -> [Handle; 2] {
        let mut out = [0 as Handle; 2];
        k.create_channel_pair(&mut out).unwrap();
        out
    }

    #[test]
    fn messages_arrive_fifo_at_the_peer() {
        let mut k = Kernel::for_tests();
        let buf = user_buf(&mut k);
        let [a, b] = pair(&mut k);

        k.poke_user(buf, 1);
        k.sys_put_msg(a, buf, 1).unwrap();
        k.poke_user(buf, 2);
        k.sys_put_msg(a, buf, 1).unwrap();

        // Sender's own queue is untouched.
        assert!(matches!(k.sys_get_msg(a, buf, 1), Err(KErr::Sys(SysError::Message))));

        assert_eq!(k.sys_get_msg(b, buf, 1).unwrap(), 1);
        assert_eq!(k.peek_user(buf), 1);
        assert_eq!(k.sys_get_msg(b, buf, 1).unwrap(), 1);
        assert_eq!(k.peek_user(buf), 2);
        assert!(matches!(k.sys_get_msg(b, buf, 1), Err(KErr::Sys(SysError::Message))));
    }

    #[test]
    fn put_msg_raises_event_on_peer_only() {
        let mut k = Kernel::for_tests();
        let buf = user_buf(&mut k);
        let [a, b] = pair(&mut k);

        k.poke_user(buf, 7);
        k.sys_put_msg(a, buf, 1).unwrap();
        assert_eq!(k.sys_check_event(b).unwrap(), b);
        assert!(matches!(k.sys_check_event(a), Err(KErr::Sys(SysError::Param))));
    }

    #[test]
    fn channel_round_trip_ten_thousand_messages() {
        let mut k = Kernel::for_tests();
        let buf = user_buf(&mut k);
        let [a, b] = pair(&mut k);

        for i in 0..10_000u32 {
            let byte = (i % 251) as u8;
            k.poke_user(buf, byte);
            assert_eq!(k.sys_put_msg(a, buf, 1).unwrap(), 1);
            assert_eq!(k.sys_get_msg(b, buf, 1).unwrap(), 1);
            assert_eq!(k.peek_user(buf), byte);

            k.poke_user(buf, byte.wrapping_add(1));
            assert_eq!(k.sys_put_msg(b, buf, 1).unwrap(), 1);
            assert_eq!(k.sys_get_msg(a, buf, 1).unwrap(), 1);
            assert_eq!(k.peek_user(buf), byte.wrapping_add(1));
        }
    }

    #[test]
    fn handle_grant_transfers_ownership_at_receive() {
        let mut k = Kernel::for_tests();
        let [a, b] = pair(&mut k);
        let timer = k.sys_create_timer().unwrap();

        k.sys_put_handle(a, timer).unwrap();
        // In flight: no owner, so the sender cannot use it any more.
        assert_eq!(k.handles.get(timer).unwrap().owner, None);
        assert!(matches!(
            k.sys_set_timer(timer, 1000, 0),
            Err(KErr::Sys(SysError::Param))
        ));

        let got = k.sys_get_handle(b).unwrap();
        assert_eq!(got, timer);
        assert_eq!(k.handles.get(timer).unwrap().owner, Some(k.current()));
        k.sys_set_timer(timer, 1000, 0).unwrap();
    }

    #[test]
    fn get_msg_on_grant_head_is_message_error() {
        let mut k = Kernel::for_tests();
        let buf = user_buf(&mut k);
        let [a, b] = pair(&mut k);
        let timer = k.sys_create_timer().unwrap();
        k.sys_put_handle(a, timer).unwrap();
        assert!(matches!(k.sys_get_msg(b, buf, 1), Err(KErr::Sys(SysError::Message))));
        assert_eq!(k.sys_get_handle(b).unwrap(), timer);
    }

    #[test]
    fn closed_peer_turns_put_into_connection_error() {
        let mut k = Kernel::for_tests();
        let buf = user_buf(&mut k);
        let [a, b] = pair(&mut k);

        k.sys_close_handle(b).unwrap();
        k.close_pending_handles();

        // Peer close raised an event on the survivor.
        assert_eq!(k.sys_check_event(a).unwrap(), a);
        k.poke_user(buf, 1);
        assert!(matches!(
            k.sys_put_msg(a, buf, 1),
            Err(KErr::Sys(SysError::Connection))
        ));
    }

    #[test]
    fn closing_both_ends_frees_channel_and_inflight_grants() {
        let mut k = Kernel::for_tests();
        let free_handles = k.handles.free_count();
        let free_channels = k.channels.free_count();
        let free_timers = k.wheel.timers.free_count();

        let [a, b] = pair(&mut k);
        let timer = k.sys_create_timer().unwrap();
        k.sys_put_handle(a, timer).unwrap();

        // Receiver closes without ever picking the grant up, then the
        // sender closes too.
        k.sys_close_handle(b).unwrap();
        k.sys_close_handle(a).unwrap();
        k.close_pending_handles();

        assert_eq!(k.handles.free_count(), free_handles);
        assert_eq!(k.channels.free_count(), free_channels);
        assert_eq!(k.wheel.timers.free_count(), free_timers);
    }

    #[test]
    fn is_a_channel_checks_pairing() {
        let mut k = Kernel::for_tests();
        let [a, b] = pair(&mut k);
        let [c, _d] = pair(&mut k);

        assert_eq!(k.sys_is_a_channel(a, b).unwrap(), 0);
        assert!(matches!(k.sys_is_a_channel(a, a), Err(KErr::Sys(SysError::Param))));
        assert!(matches!(k.sys_is_a_channel(a, c), Err(KErr::Sys(SysError::Param))));
    }

    #[test]
    fn create_channel_copies_pair_to_user() {
        let mut k = Kernel::for_tests();
        let buf = user_buf(&mut k);
        k.sys_create_channel(buf).unwrap();

        let mut bytes = [0u8; 8];
        let current = k.current();
        {
            let Kernel { mem, procs, .. } = &mut k;
            let proc = procs.get(&current).unwrap();
            uaccess::copy_in(mem, &proc.pmap, buf, &mut bytes).unwrap();
        }
        let h0 = i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let h1 = i32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(k.sys_is_a_channel(h0, h1).unwrap(), 0);
    }

    #[test]
    fn create_channel_copyout_failure_leaks_nothing() {
        let mut k = Kernel::for_tests();
        let free_handles = k.handles.free_count();
        let free_channels = k.channels.free_count();
        // No user page mapped at this address.
        assert!(matches!(
            k.sys_create_channel(0x0600_0000),
            Err(KErr::Sys(SysError::Memory))
        ));
        assert_eq!(k.handles.free_count(), free_handles);
        assert_eq!(k.channels.free_count(), free_channels);
    }
}
