/// Bounded message queues
///
/// FIFO of messages behind a per-queue lock. Blocked senders and
/// receivers are kept on waiter lists in arrival order so wake-ups are
/// FIFO-fair; the actual parking happens in the kernel glue, this module
/// only decides who may proceed.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::process::Pid;
use super::message::Message;

bitflags::bitflags! {
    /// Owner-granted queue permissions for other processes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueuePerms: u32 {
        const OTHER_SEND = 1 << 0;
        const OTHER_RECV = 1 << 1;
    }
}

#[derive(Debug)]
struct QueueInner {
    owner: Pid,
    perms: QueuePerms,
    capacity: usize,
    messages: VecDeque<Message>,
    send_waiters: VecDeque<Pid>,
    recv_waiters: VecDeque<Pid>,
    destroyed: bool,
    total_enqueued: u64,
    total_dequeued: u64,
}

/// A bounded, ordered message queue.
#[derive(Debug)]
pub struct MessageQueue {
    pub id: u32,
    inner: Mutex<QueueInner>,
}

impl MessageQueue {
    pub fn new(id: u32, owner: Pid, capacity: usize, perms: QueuePerms) -> Self {
        Self {
            id,
            inner: Mutex::new(QueueInner {
                owner,
                perms,
                capacity: capacity.max(1),
                messages: VecDeque::new(),
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
                destroyed: false,
                total_enqueued: 0,
                total_dequeued: 0,
            }),
        }
    }

    pub fn owner(&self) -> Pid {
        self.inner.lock().owner
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    pub fn blocked_senders(&self) -> usize {
        self.inner.lock().send_waiters.len()
    }

    pub fn blocked_receivers(&self) -> usize {
        self.inner.lock().recv_waiters.len()
    }

    /// Try to append. On success returns one blocked receiver to wake.
    /// Fails with QueueFull while the queue is full or while earlier
    /// senders are still parked ahead of the caller.
    pub fn try_send(&self, sender: Pid, msg: Message) -> Result<Option<Pid>> {
        let mut q = self.inner.lock();
        if q.destroyed {
            return Err(KernelError::NoSuchQueue);
        }
        if sender != q.owner && !q.perms.contains(QueuePerms::OTHER_SEND) {
            return Err(KernelError::PermissionDenied);
        }
        if q.messages.len() >= q.capacity {
            return Err(KernelError::QueueFull);
        }
        match q.send_waiters.front() {
            Some(&first) if first != sender => return Err(KernelError::QueueFull),
            Some(_) => {
                q.send_waiters.pop_front();
            }
            None => {}
        }
        q.messages.push_back(msg);
        q.total_enqueued += 1;
        // Peek, don't pop: the parked receiver drops off the waiter list
        // itself once its try_recv goes through.
        Ok(q.recv_waiters.front().copied())
    }

    /// Try to take the head. On success returns one blocked sender to
    /// wake. FIFO-fair with respect to parked receivers.
    pub fn try_recv(&self, receiver: Pid) -> Result<(Message, Option<Pid>)> {
        let mut q = self.inner.lock();
        if q.destroyed {
            return Err(KernelError::NoSuchQueue);
        }
        if receiver != q.owner && !q.perms.contains(QueuePerms::OTHER_RECV) {
            return Err(KernelError::PermissionDenied);
        }
        if q.messages.is_empty() {
            return Err(KernelError::QueueEmpty);
        }
        match q.recv_waiters.front() {
            Some(&first) if first != receiver => return Err(KernelError::QueueEmpty),
            Some(_) => {
                q.recv_waiters.pop_front();
            }
            None => {}
        }
        let msg = q.messages.pop_front().ok_or(KernelError::QueueEmpty)?;
        q.total_dequeued += 1;
        Ok((msg, q.send_waiters.front().copied()))
    }

    /// Remove the first message matching `pred`, anywhere in the queue.
    /// Used by the request/reply rendezvous to fish its reply out.
    pub fn take_matching(
        &self,
        receiver: Pid,
        pred: impl Fn(&Message) -> bool,
    ) -> Result<Option<(Message, Option<Pid>)>> {
        let mut q = self.inner.lock();
        if q.destroyed {
            return Err(KernelError::NoSuchQueue);
        }
        if receiver != q.owner && !q.perms.contains(QueuePerms::OTHER_RECV) {
            return Err(KernelError::PermissionDenied);
        }
        match q.messages.iter().position(pred) {
            Some(pos) => {
                let msg = q.messages.remove(pos).ok_or(KernelError::QueueEmpty)?;
                q.total_dequeued += 1;
                Ok(Some((msg, q.send_waiters.front().copied())))
            }
            None => Ok(None),
        }
    }

    /// Read the head without removing it; blocked counters untouched.
    pub fn peek(&self) -> Result<Message> {
        let q = self.inner.lock();
        if q.destroyed {
            return Err(KernelError::NoSuchQueue);
        }
        q.messages.front().cloned().ok_or(KernelError::QueueEmpty)
    }

    pub fn register_send_waiter(&self, pid: Pid) {
        let mut q = self.inner.lock();
        if !q.send_waiters.contains(&pid) {
            q.send_waiters.push_back(pid);
        }
    }

    pub fn unregister_send_waiter(&self, pid: Pid) {
        self.inner.lock().send_waiters.retain(|&p| p != pid);
    }

    pub fn register_recv_waiter(&self, pid: Pid) {
        let mut q = self.inner.lock();
        if !q.recv_waiters.contains(&pid) {
            q.recv_waiters.push_back(pid);
        }
    }

    pub fn unregister_recv_waiter(&self, pid: Pid) {
        self.inner.lock().recv_waiters.retain(|&p| p != pid);
    }

    /// Mark destroyed and return every parked task so the caller can
    /// wake them; they will observe NoSuchQueue on retry.
    pub fn destroy(&self) -> Vec<Pid> {
        let mut q = self.inner.lock();
        q.destroyed = true;
        q.messages.clear();
        let mut waiters: Vec<Pid> = q.send_waiters.drain(..).collect();
        waiters.extend(q.recv_waiters.drain(..));
        waiters
    }

    /// Queue invariant: bounded occupancy and monotone timestamps from
    /// head to tail.
    pub fn verify(&self) -> bool {
        let q = self.inner.lock();
        if q.messages.len() > q.capacity {
            return false;
        }
        let mut last = 0u64;
        for msg in &q.messages {
            if msg.timestamp < last {
                return false;
            }
            last = msg.timestamp;
        }
        q.total_enqueued - q.total_dequeued == q.messages.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::msg_type;

    fn msg(id: u32, ts: u64) -> Message {
        let mut m = Message::new(msg_type::NOTIFICATION, 1);
        m.msg_id = id;
        m.timestamp = ts;
        m
    }

    fn open_queue(capacity: usize) -> MessageQueue {
        MessageQueue::new(
            1,
            100,
            capacity,
            QueuePerms::OTHER_SEND | QueuePerms::OTHER_RECV,
        )
    }

    #[test]
    fn fifo_order() {
        let q = open_queue(4);
        q.try_send(100, msg(1, 10)).unwrap();
        q.try_send(100, msg(2, 11)).unwrap();
        q.try_send(100, msg(3, 12)).unwrap();
        assert!(q.verify());
        assert_eq!(q.try_recv(100).unwrap().0.msg_id, 1);
        assert_eq!(q.try_recv(100).unwrap().0.msg_id, 2);
        assert_eq!(q.try_recv(100).unwrap().0.msg_id, 3);
        assert_eq!(q.try_recv(100).unwrap_err(), KernelError::QueueEmpty);
    }

    #[test]
    fn capacity_is_bounded() {
        let q = open_queue(2);
        q.try_send(100, msg(1, 1)).unwrap();
        q.try_send(100, msg(2, 2)).unwrap();
        assert_eq!(
            q.try_send(100, msg(3, 3)).unwrap_err(),
            KernelError::QueueFull
        );
        assert_eq!(q.count(), 2);
    }

    #[test]
    fn peek_does_not_consume() {
        let q = open_queue(2);
        q.try_send(100, msg(9, 1)).unwrap();
        assert_eq!(q.peek().unwrap().msg_id, 9);
        assert_eq!(q.count(), 1);
        assert_eq!(q.try_recv(100).unwrap().0.msg_id, 9);
    }

    #[test]
    fn permissions_enforced() {
        let q = MessageQueue::new(1, 100, 2, QueuePerms::empty());
        assert_eq!(
            q.try_send(200, msg(1, 1)).unwrap_err(),
            KernelError::PermissionDenied
        );
        q.try_send(100, msg(1, 1)).unwrap();
        assert_eq!(
            q.try_recv(200).unwrap_err(),
            KernelError::PermissionDenied
        );
        assert_eq!(q.try_recv(100).unwrap().0.msg_id, 1);
    }

    #[test]
    fn sender_wakes_receiver_in_fifo_order() {
        let q = open_queue(1);
        q.register_recv_waiter(201);
        q.register_recv_waiter(202);
        let wake = q.try_send(100, msg(1, 1)).unwrap();
        assert_eq!(wake, Some(201));
    }

    #[test]
    fn parked_senders_keep_their_turn() {
        let q = open_queue(1);
        q.try_send(100, msg(1, 1)).unwrap();
        // 201 parks first; 202 must not overtake once space appears
        q.register_send_waiter(201);
        q.register_send_waiter(202);
        let (_, wake) = q.try_recv(100).unwrap();
        assert_eq!(wake, Some(201));
        assert_eq!(
            q.try_send(202, msg(3, 3)).unwrap_err(),
            KernelError::QueueFull
        );
        q.try_send(201, msg(2, 2)).unwrap();
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn destroy_reports_waiters() {
        let q = open_queue(1);
        q.register_send_waiter(7);
        q.register_recv_waiter(8);
        let waiters = q.destroy();
        assert!(waiters.contains(&7) && waiters.contains(&8));
        assert_eq!(q.peek().unwrap_err(), KernelError::NoSuchQueue);
        assert_eq!(
            q.try_send(100, msg(1, 1)).unwrap_err(),
            KernelError::NoSuchQueue
        );
    }

    #[test]
    fn take_matching_pulls_from_middle() {
        let q = open_queue(4);
        q.try_send(100, msg(1, 1)).unwrap();
        q.try_send(100, msg(2, 2)).unwrap();
        q.try_send(100, msg(3, 3)).unwrap();
        let (found, _) = q
            .take_matching(100, |m| m.msg_id == 2)
            .unwrap()
            .unwrap();
        assert_eq!(found.msg_id, 2);
        assert_eq!(q.count(), 2);
        assert!(q.take_matching(100, |m| m.msg_id == 2).unwrap().is_none());
    }
}
