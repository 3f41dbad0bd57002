//! Readiness multiplexing over several sockets or channels.
//!
//! Sockets expose readiness through [`Socket::has_input`]/[`has_output`]
//! snapshots (their inboxes are filled by transport threads), so the poller
//! scans those snapshots in short slices until something is ready or the
//! deadline passes. Deadline math keeps the contract: a timed-out poll
//! takes no less than the timeout and at most one slice more.

use super::{Poller, Socket, SocketPtr, TransportError};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const POLL_SLICE: Duration = Duration::from_micros(200);

struct Entry {
    channel: String,
    sub_index: usize,
    socket: SocketPtr,
}

/// Poller over an arbitrary set of sockets, usable with any transport.
pub struct GenericPoller {
    entries: Vec<Entry>,
    // (readable, writable) per entry, refreshed by the last poll.
    results: Mutex<Vec<(bool, bool)>>,
}

impl GenericPoller {
    pub fn new(channels: &[(String, Vec<SocketPtr>)]) -> Self {
        let mut entries = Vec::new();
        for (channel, subs) in channels {
            for (sub_index, socket) in subs.iter().enumerate() {
                entries.push(Entry {
                    channel: channel.clone(),
                    sub_index,
                    socket: socket.clone(),
                });
            }
        }
        let results = Mutex::new(vec![(false, false); entries.len()]);
        Self { entries, results }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn scan(&self) -> (Vec<(bool, bool)>, bool) {
        let mut any = false;
        let snapshot: Vec<(bool, bool)> = self
            .entries
            .iter()
            .map(|e| {
                let ready = (e.socket.has_input(), e.socket.has_output());
                any |= ready.0 || ready.1;
                ready
            })
            .collect();
        (snapshot, any)
    }

    fn find(&self, channel: &str, sub_index: usize) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.channel == channel && e.sub_index == sub_index)
    }
}

impl Poller for GenericPoller {
    fn poll(&self, timeout_ms: i64) -> Result<(), TransportError> {
        if self.entries.is_empty() {
            return Err(TransportError::Poller("poll on empty poller".to_owned()));
        }
        let deadline = (timeout_ms >= 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        loop {
            let (snapshot, any) = self.scan();
            if any {
                *self.results.lock() = snapshot;
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    *self.results.lock() = snapshot;
                    return Ok(());
                }
            }
            std::thread::sleep(POLL_SLICE);
        }
    }

    fn check_input(&self, index: usize) -> bool {
        self.results.lock().get(index).map_or(false, |r| r.0)
    }

    fn check_output(&self, index: usize) -> bool {
        self.results.lock().get(index).map_or(false, |r| r.1)
    }

    fn check_input_of(&self, channel: &str, index: usize) -> bool {
        self.find(channel, index)
            .map_or(false, |i| self.check_input(i))
    }

    fn check_output_of(&self, channel: &str, index: usize) -> bool {
        self.find(channel, index)
            .map_or(false, |i| self.check_output(i))
    }
}
