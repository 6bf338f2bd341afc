//! Message ports: the synchronous request/reply transport under the
//! user-space VFS.
//!
//! A port holds a FIFO of in-flight messages. A sender enqueues a
//! message in `Send` state and blocks on the message's private rendez;
//! the server picks it up (`Received`), moves data through the sender's
//! iovecs, and replies (`Replied`), which wakes the sender. The file
//! system layer that drives this lives outside the kernel; these are the
//! kernel-side mechanics only.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use pionabi::SysError;

use crate::kernel::{KErr, KResult, Kernel};
use crate::memory::uaccess;
use crate::memory::VAddr;
use crate::multitasking::process::ProcessId;
use crate::multitasking::rendez::RendezId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgPortId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    Send,
    Received,
    Replied,
}

/// One scatter/gather element in the sender's address space.
#[derive(Debug, Clone, Copy)]
pub struct Iov {
    pub addr: VAddr,
    pub size: usize,
}

#[derive(Debug)]
pub struct Msg {
    pub sender: ProcessId,
    pub state: MsgState,
    pub iov: Vec<Iov>,
    /// Server-maintained position within the iovec stream.
    pub offset: usize,
    /// Reply wakeup for the sender.
    pub rendez: RendezId,
    pub reply_status: i32,
}

#[derive(Debug)]
pub struct MsgPort {
    pub pending: VecDeque<MsgId>,
    /// Where the server sleeps in `receive_msg`.
    pub rendez: RendezId,
}

impl Kernel {
    pub fn create_msgport(&mut self) -> Result<MsgPortId, SysError> {
        let rendez = self.alloc_rendez()?;
        self.msgports
            .alloc(MsgPort {
                pending: VecDeque::new(),
                rendez,
            })
            .map(|idx| MsgPortId(idx as u32))
            .ok_or(SysError::Resource)
    }

    pub fn free_msgport(&mut self, port: MsgPortId) {
        if let Some(port) = self.msgports.free(port.0 as usize) {
            debug_assert!(port.pending.is_empty(), "freeing port with messages");
            self.free_rendez(port.rendez);
        }
    }

    /// Send a message through `port` and wait for the reply. Restart
    /// safe: the in-flight message is parked on the current process so
    /// the re-entered call finds it and re-checks its state.
    pub fn msgport_send(&mut self, port: MsgPortId, iov: Vec<Iov>) -> KResult<i32> {
        let current = self.current();

        if let Some(mid) = self.cur().pending_msg {
            // Restarted: the message is in flight. Either the reply is
            // in, or we keep sleeping.
            let state = self.msgs.get(mid.0 as usize).ok_or(SysError::Message)?.state;
            return match state {
                MsgState::Replied => {
                    let msg = self.msgs.free(mid.0 as usize).expect("message vanished");
                    self.free_rendez(msg.rendez);
                    self.cur().pending_msg = None;
                    Ok(msg.reply_status)
                },
                _ => {
                    let r = self.msgs.get(mid.0 as usize).expect("message vanished").rendez;
                    Err(self.sleep(r))
                },
            };
        }

        let rendez = self.alloc_rendez()?;
        let mid = match self.msgs.alloc(Msg {
            sender: current,
            state: MsgState::Send,
            iov,
            offset: 0,
            rendez,
            reply_status: 0,
        }) {
            Some(idx) => MsgId(idx as u32),
            None => {
                self.free_rendez(rendez);
                return Err(SysError::Resource.into());
            },
        };

        {
            let port = match self.msgports.get_mut(port.0 as usize) {
                Some(p) => p,
                None => {
                    let msg = self.msgs.free(mid.0 as usize).expect("message vanished");
                    self.free_rendez(msg.rendez);
                    return Err(SysError::Connection.into());
                },
            };
            port.pending.push_back(mid);
        }
        self.cur().pending_msg = Some(mid);

        let port_rendez = self.msgports.get(port.0 as usize).expect("no port").rendez;
        self.wakeup(port_rendez);
        Err(self.sleep(rendez))
    }

    /// Server side: dequeue the oldest pending message, blocking when
    /// the port is empty.
    pub fn msgport_receive(&mut self, port: MsgPortId) -> KResult<MsgId> {
        let (mid, rendez) = {
            let port = self.msgports.get_mut(port.0 as usize).ok_or(SysError::Connection)?;
            (port.pending.pop_front(), port.rendez)
        };
        match mid {
            Some(mid) => {
                self.msgs.get_mut(mid.0 as usize).expect("message vanished").state =
                    MsgState::Received;
                Ok(mid)
            },
            None => Err(self.sleep(rendez)),
        }
    }

    /// Server side: complete a received message and wake its sender.
    pub fn msgport_reply(&mut self, mid: MsgId, status: i32) -> Result<(), SysError> {
        let rendez = {
            let msg = self.msgs.get_mut(mid.0 as usize).ok_or(SysError::Message)?;
            if msg.state != MsgState::Received {
                return Err(SysError::Message);
            }
            msg.state = MsgState::Replied;
            msg.reply_status = status;
            msg.rendez
        };
        self.wakeup(rendez);
        Ok(())
    }

    /// Server side: read out of the sender's iovec stream starting at
    /// `offset`. Returns bytes copied (short at the end of the iovecs).
    pub fn msgport_read(&mut self, mid: MsgId, offset: usize, buf: &mut [u8]) -> Result<usize, SysError> {
        let (sender, iov) = {
            let msg = self.msgs.get(mid.0 as usize).ok_or(SysError::Message)?;
            if msg.state != MsgState::Received {
                return Err(SysError::Message);
            }
            (msg.sender, msg.iov.clone())
        };

        let mut done = 0usize;
        let Kernel { mem, procs, .. } = self;
        let proc = procs.get(&sender).ok_or(SysError::Connection)?;
        for (start, chunk_addr, chunk_len) in iov_chunks(&iov, offset, buf.len()) {
            uaccess::copy_in(mem, &proc.pmap, chunk_addr, &mut buf[start..start + chunk_len])?;
            done = start + chunk_len;
        }
        Ok(done)
    }

    /// Server side: write into the sender's iovec stream.
    pub fn msgport_write(&mut self, mid: MsgId, offset: usize, buf: &[u8]) -> Result<usize, SysError> {
        let (sender, iov) = {
            let msg = self.msgs.get(mid.0 as usize).ok_or(SysError::Message)?;
            if msg.state != MsgState::Received {
                return Err(SysError::Message);
            }
            (msg.sender, msg.iov.clone())
        };

        let mut done = 0usize;
        let Kernel { mem, procs, .. } = self;
        let proc = procs.get_mut(&sender).ok_or(SysError::Connection)?;
        for (start, chunk_addr, chunk_len) in iov_chunks(&iov, offset, buf.len()) {
            uaccess::copy_out(mem, &mut proc.pmap, chunk_addr, &buf[start..start + chunk_len])?;
            done = start + chunk_len;
        }
        Ok(done)
    }
}

/// Resolve `(offset, len)` against an iovec list into `(buf_start,
/// user_addr, chunk_len)` runs.
fn iov_chunks(iov: &[Iov], mut offset: usize, len: usize) -> Vec<(usize, VAddr, usize)> {
    let mut out = Vec::new();
    let mut remaining = len;
    let mut buf_pos = 0usize;

    for entry in iov {
        if remaining == 0 {
            break;
        }
        if offset >= entry.size {
            offset -= entry.size;
            continue;
        }
        let take = (entry.size - offset).min(remaining);
        out.push((buf_pos, entry.addr + offset as u32, take));
        buf_pos += take;
        remaining -= take;
        offset = 0;
    }
    out
}
