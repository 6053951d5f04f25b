/// Named channels
///
/// Publish endpoints with a subscriber list. Broadcast channels deliver
/// a copy to every subscriber's process queue, best-effort; unicast
/// channels pick the first subscriber whose queue has room.

use alloc::string::String;
use alloc::vec::Vec;

use crate::process::Pid;

/// A named publish endpoint.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    pub broadcast: bool,
    /// Survives subscriber exits; non-persistent channels are destroyed
    /// when their subscriber list empties.
    pub persistent: bool,
    pub subscribers: Vec<Pid>,
}

impl Channel {
    pub fn new(id: u32, name: &str, broadcast: bool, persistent: bool) -> Self {
        Self {
            id,
            name: String::from(name),
            broadcast,
            persistent,
            subscribers: Vec::new(),
        }
    }

    /// Add a subscriber; duplicates are ignored.
    pub fn subscribe(&mut self, pid: Pid) {
        if !self.subscribers.contains(&pid) {
            self.subscribers.push(pid);
        }
    }

    pub fn unsubscribe(&mut self, pid: Pid) {
        self.subscribers.retain(|&p| p != pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_deduplicates() {
        let mut ch = Channel::new(1, "events", true, false);
        ch.subscribe(100);
        ch.subscribe(100);
        ch.subscribe(101);
        assert_eq!(ch.subscribers, alloc::vec![100, 101]);
        ch.unsubscribe(100);
        assert_eq!(ch.subscribers, alloc::vec![101]);
    }
}
