/// Inter-process communication
///
/// Message queues (explicit id, owner-granted permissions) and named
/// channels (publish/subscribe). The registry owns both tables plus the
/// per-process default queues that request/reply and channel delivery
/// target. Blocking behavior lives in the kernel glue; everything here
/// is non-blocking and per-queue locked.

pub mod channel;
pub mod message;
pub mod queue;

pub use channel::Channel;
pub use message::{msg_type, Message, MessageFlags, MAX_MESSAGE_SIZE, MESSAGE_WIRE_SIZE};
pub use queue::{MessageQueue, QueuePerms};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::process::Pid;

/// IPC statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub requests: u64,
    pub replies: u64,
    pub timeouts: u64,
    pub broadcasts: u64,
    pub queues_created: u64,
    pub queues_destroyed: u64,
}

#[derive(Default)]
pub(crate) struct IpcCounters {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub requests: AtomicU64,
    pub replies: AtomicU64,
    pub timeouts: AtomicU64,
    pub broadcasts: AtomicU64,
    pub queues_created: AtomicU64,
    pub queues_destroyed: AtomicU64,
}

pub struct IpcRegistry {
    queues: Mutex<BTreeMap<u32, Arc<MessageQueue>>>,
    channels: Mutex<BTreeMap<u32, Channel>>,
    /// Default per-process queue ids
    process_queues: Mutex<BTreeMap<Pid, u32>>,
    next_qid: AtomicU32,
    next_cid: AtomicU32,
    next_msg_id: AtomicU32,
    pub(crate) stats: IpcCounters,
}

impl IpcRegistry {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            channels: Mutex::new(BTreeMap::new()),
            process_queues: Mutex::new(BTreeMap::new()),
            next_qid: AtomicU32::new(1),
            next_cid: AtomicU32::new(1),
            next_msg_id: AtomicU32::new(1),
            stats: IpcCounters::default(),
        }
    }

    /// Fresh message id, unique for the kernel lifetime.
    pub fn next_msg_id(&self) -> u32 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---- queues ----

    pub fn create_queue(&self, owner: Pid, capacity: usize, perms: QueuePerms) -> u32 {
        let id = self.next_qid.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(MessageQueue::new(id, owner, capacity, perms));
        self.queues.lock().insert(id, queue);
        self.stats.queues_created.fetch_add(1, Ordering::Relaxed);
        log::debug!("ipc: queue {} created (owner {}, cap {})", id, owner, capacity);
        id
    }

    pub fn queue(&self, qid: u32) -> Result<Arc<MessageQueue>> {
        self.queues
            .lock()
            .get(&qid)
            .cloned()
            .ok_or(KernelError::NoSuchQueue)
    }

    /// Destroy a queue; only its owner may. Returns parked tasks to wake.
    pub fn destroy_queue(&self, qid: u32, caller: Pid) -> Result<Vec<Pid>> {
        let queue = self.queue(qid)?;
        if queue.owner() != caller {
            return Err(KernelError::PermissionDenied);
        }
        self.queues.lock().remove(&qid);
        self.stats.queues_destroyed.fetch_add(1, Ordering::Relaxed);
        log::debug!("ipc: queue {} destroyed", qid);
        Ok(queue.destroy())
    }

    /// Create the default queue every process owns.
    pub fn create_process_queue(&self, pid: Pid, capacity: usize) -> u32 {
        let qid = self.create_queue(
            pid,
            capacity,
            QueuePerms::OTHER_SEND, // anyone may send, only the owner receives
        );
        self.process_queues.lock().insert(pid, qid);
        qid
    }

    pub fn process_queue(&self, pid: Pid) -> Result<Arc<MessageQueue>> {
        let qid = *self
            .process_queues
            .lock()
            .get(&pid)
            .ok_or(KernelError::NoSuchQueue)?;
        self.queue(qid)
    }

    // ---- channels ----

    pub fn create_channel(&self, name: &str, broadcast: bool, persistent: bool) -> Result<u32> {
        if name.is_empty() {
            return Err(KernelError::Invalid);
        }
        let mut channels = self.channels.lock();
        if channels.values().any(|c| c.name == name) {
            return Err(KernelError::Busy);
        }
        let id = self.next_cid.fetch_add(1, Ordering::Relaxed);
        channels.insert(id, Channel::new(id, name, broadcast, persistent));
        log::debug!("ipc: channel {} '{}' created (broadcast={})", id, name, broadcast);
        Ok(id)
    }

    pub fn find_channel(&self, name: &str) -> Option<u32> {
        self.channels
            .lock()
            .values()
            .find(|c| c.name == name)
            .map(|c| c.id)
    }

    pub fn channel_subscribers(&self, cid: u32) -> Result<Vec<Pid>> {
        self.channels
            .lock()
            .get(&cid)
            .map(|c| c.subscribers.clone())
            .ok_or(KernelError::NoSuchChannel)
    }

    pub fn channel_is_broadcast(&self, cid: u32) -> Result<bool> {
        self.channels
            .lock()
            .get(&cid)
            .map(|c| c.broadcast)
            .ok_or(KernelError::NoSuchChannel)
    }

    pub fn subscribe(&self, cid: u32, pid: Pid) -> Result<()> {
        let mut channels = self.channels.lock();
        let channel = channels.get_mut(&cid).ok_or(KernelError::NoSuchChannel)?;
        channel.subscribe(pid);
        Ok(())
    }

    // ---- process exit ----

    /// Destroy everything a dying process owns. Blocked peers are
    /// returned so the caller can wake them into the NoSuchQueue error.
    pub fn destroy_for(&self, pid: Pid) -> Vec<Pid> {
        let mut to_wake = Vec::new();

        let owned: Vec<u32> = {
            let queues = self.queues.lock();
            queues
                .values()
                .filter(|q| q.owner() == pid)
                .map(|q| q.id)
                .collect()
        };
        for qid in owned {
            if let Some(queue) = self.queues.lock().remove(&qid) {
                to_wake.extend(queue.destroy());
                self.stats.queues_destroyed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.process_queues.lock().remove(&pid);

        let mut channels = self.channels.lock();
        for channel in channels.values_mut() {
            channel.unsubscribe(pid);
        }
        channels.retain(|_, c| c.persistent || !c.subscribers.is_empty());

        to_wake
    }

    pub fn all_queues(&self) -> Vec<Arc<MessageQueue>> {
        self.queues.lock().values().cloned().collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn stats(&self) -> IpcStats {
        IpcStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            requests: self.stats.requests.load(Ordering::Relaxed),
            replies: self.stats.replies.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            queues_created: self.stats.queues_created.load(Ordering::Relaxed),
            queues_destroyed: self.stats.queues_destroyed.load(Ordering::Relaxed),
        }
    }
}

impl Default for IpcRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_lifecycle() {
        let reg = IpcRegistry::new();
        let qid = reg.create_queue(1000, 4, QueuePerms::OTHER_SEND);
        assert!(reg.queue(qid).is_ok());
        assert_eq!(
            reg.destroy_queue(qid, 1001).unwrap_err(),
            KernelError::PermissionDenied
        );
        reg.destroy_queue(qid, 1000).unwrap();
        assert_eq!(reg.queue(qid).unwrap_err(), KernelError::NoSuchQueue);
    }

    #[test]
    fn channel_names_are_unique() {
        let reg = IpcRegistry::new();
        let cid = reg.create_channel("events", true, false).unwrap();
        assert_eq!(
            reg.create_channel("events", false, false).unwrap_err(),
            KernelError::Busy
        );
        assert_eq!(reg.find_channel("events"), Some(cid));
        assert_eq!(reg.find_channel("missing"), None);
    }

    #[test]
    fn exit_destroys_owned_queues_and_subscriptions() {
        let reg = IpcRegistry::new();
        let _pq = reg.create_process_queue(1000, 8);
        let other = reg.create_queue(1001, 8, QueuePerms::empty());
        let cid = reg.create_channel("bus", true, false).unwrap();
        reg.subscribe(cid, 1000).unwrap();
        reg.subscribe(cid, 1001).unwrap();

        reg.destroy_for(1000);
        assert!(reg.process_queue(1000).is_err());
        assert!(reg.queue(other).is_ok());
        assert_eq!(reg.channel_subscribers(cid).unwrap(), alloc::vec![1001]);

        // Last subscriber leaving kills the non-persistent channel
        reg.destroy_for(1001);
        assert_eq!(
            reg.channel_subscribers(cid).unwrap_err(),
            KernelError::NoSuchChannel
        );
    }

    #[test]
    fn msg_ids_are_unique() {
        let reg = IpcRegistry::new();
        let a = reg.next_msg_id();
        let b = reg.next_msg_id();
        assert_ne!(a, b);
    }
}
