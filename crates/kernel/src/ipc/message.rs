/// IPC messages
///
/// Fixed-size wire format with a bounded flat payload. The same struct
/// crosses the user/kernel boundary through bounded copy-in/out; the
/// byte layout is little-endian and position-stable.

use crate::error::{KernelError, Result};
use crate::process::Pid;

/// Maximum payload bytes per message.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Serialized message size:
/// six u32 header words, one u64 timestamp, reply_to, then the payload.
pub const MESSAGE_WIRE_SIZE: usize = 6 * 4 + 8 + 4 + MAX_MESSAGE_SIZE;

/// Message types.
pub mod msg_type {
    pub const NOTIFICATION: u32 = 0;
    pub const REQUEST: u32 = 1;
    pub const REPLY: u32 = 2;
    /// 3+ reserved for device events
    pub const RESERVED_BASE: u32 = 3;
}

bitflags::bitflags! {
    /// Per-call IPC flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        /// Fail with QueueFull/QueueEmpty instead of blocking
        const NON_BLOCKING = 1 << 0;
    }
}

/// One IPC datum.
#[derive(Clone)]
pub struct Message {
    pub msg_id: u32,
    pub mtype: u32,
    pub receiver_pid: Pid,
    pub sender_pid: Pid,
    pub data_size: u32,
    pub flags: u32,
    pub timestamp: u64,
    pub reply_to: u32,
    pub data: [u8; MAX_MESSAGE_SIZE],
}

impl Message {
    pub fn new(mtype: u32, receiver: Pid) -> Self {
        Self {
            msg_id: 0,
            mtype,
            receiver_pid: receiver,
            sender_pid: 0,
            data_size: 0,
            flags: 0,
            timestamp: 0,
            reply_to: 0,
            data: [0; MAX_MESSAGE_SIZE],
        }
    }

    /// Set the payload, bounded by MAX_MESSAGE_SIZE.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(KernelError::MessageTooLarge);
        }
        self.data[..data.len()].copy_from_slice(data);
        self.data[data.len()..].fill(0);
        self.data_size = data.len() as u32;
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_size.min(MAX_MESSAGE_SIZE as u32) as usize]
    }

    pub fn to_wire(&self) -> [u8; MESSAGE_WIRE_SIZE] {
        let mut out = [0u8; MESSAGE_WIRE_SIZE];
        out[0..4].copy_from_slice(&self.msg_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.mtype.to_le_bytes());
        out[8..12].copy_from_slice(&self.receiver_pid.to_le_bytes());
        out[12..16].copy_from_slice(&self.sender_pid.to_le_bytes());
        out[16..20].copy_from_slice(&self.data_size.to_le_bytes());
        out[20..24].copy_from_slice(&self.flags.to_le_bytes());
        out[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        out[32..36].copy_from_slice(&self.reply_to.to_le_bytes());
        out[36..].copy_from_slice(&self.data);
        out
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < MESSAGE_WIRE_SIZE {
            return Err(KernelError::Invalid);
        }
        let word = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or_default());
        let data_size = word(16);
        if data_size as usize > MAX_MESSAGE_SIZE {
            return Err(KernelError::MessageTooLarge);
        }
        let mut data = [0u8; MAX_MESSAGE_SIZE];
        data.copy_from_slice(&buf[36..36 + MAX_MESSAGE_SIZE]);
        Ok(Self {
            msg_id: word(0),
            mtype: word(4),
            receiver_pid: word(8),
            sender_pid: word(12),
            data_size,
            flags: word(20),
            timestamp: u64::from_le_bytes(buf[24..32].try_into().unwrap_or_default()),
            reply_to: word(32),
            data,
        })
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("msg_id", &self.msg_id)
            .field("mtype", &self.mtype)
            .field("sender", &self.sender_pid)
            .field("receiver", &self.receiver_pid)
            .field("data_size", &self.data_size)
            .field("reply_to", &self.reply_to)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let mut msg = Message::new(msg_type::REQUEST, 42);
        msg.msg_id = 7;
        msg.sender_pid = 1000;
        msg.timestamp = 123_456;
        msg.reply_to = 3;
        msg.set_data(b"hello").unwrap();
        let wire = msg.to_wire();
        let back = Message::from_wire(&wire).unwrap();
        assert_eq!(back.msg_id, 7);
        assert_eq!(back.mtype, msg_type::REQUEST);
        assert_eq!(back.receiver_pid, 42);
        assert_eq!(back.sender_pid, 1000);
        assert_eq!(back.timestamp, 123_456);
        assert_eq!(back.reply_to, 3);
        assert_eq!(back.payload(), b"hello");
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut msg = Message::new(msg_type::NOTIFICATION, 1);
        let big = [0u8; MAX_MESSAGE_SIZE + 1];
        assert_eq!(msg.set_data(&big).unwrap_err(), KernelError::MessageTooLarge);
    }

    #[test]
    fn wire_rejects_bad_size_field() {
        let msg = Message::new(msg_type::NOTIFICATION, 1);
        let mut wire = msg.to_wire();
        wire[16..20].copy_from_slice(&(600u32).to_le_bytes());
        assert_eq!(
            Message::from_wire(&wire).unwrap_err(),
            KernelError::MessageTooLarge
        );
    }
}
