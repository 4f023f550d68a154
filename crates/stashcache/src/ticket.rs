//! Per-key write ordering
//!
//! Every fetch that may write a key takes a ticket when it starts. Only the
//! holder of the newest ticket for a key may write it, so a slow fetch that
//! settles after a newer one never replaces the newer result.

use std::collections::HashMap;

use ahash::RandomState;
use parking_lot::Mutex;

struct TicketMap {
    next: u64,
    newest: HashMap<String, u64, RandomState>,
}

pub(crate) struct WriteTickets {
    map: Mutex<TicketMap>,
}

impl WriteTickets {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(TicketMap {
                next: 0,
                newest: HashMap::with_hasher(RandomState::new()),
            }),
        }
    }

    /// Take a ticket for `key`, superseding every ticket issued before it
    pub(crate) fn issue(&self, key: &str) -> u64 {
        let mut map = self.map.lock();
        map.next += 1;
        let ticket = map.next;
        map.newest.insert(key.to_string(), ticket);
        ticket
    }

    /// Run `write` if `ticket` is still the newest for `key`
    ///
    /// The ticket lock is held while `write` runs, so writes for one key are
    /// applied in ticket order. Returns false if the write was superseded.
    pub(crate) fn settle(&self, key: &str, ticket: u64, write: impl FnOnce()) -> bool {
        let mut map = self.map.lock();
        if map.newest.get(key) != Some(&ticket) {
            return false;
        }
        write();
        map.newest.remove(key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_ticket_writes() {
        let tickets = WriteTickets::new();
        let older = tickets.issue("k");
        let newer = tickets.issue("k");

        let mut written = Vec::new();
        assert!(tickets.settle("k", newer, || written.push(newer)));
        assert!(!tickets.settle("k", older, || written.push(older)));
        assert_eq!(written, vec![newer]);
    }

    #[test]
    fn test_keys_are_independent() {
        let tickets = WriteTickets::new();
        let a = tickets.issue("a");
        let _b = tickets.issue("b");

        assert!(tickets.settle("a", a, || {}));
    }

    #[test]
    fn test_settled_ticket_cannot_write_twice() {
        let tickets = WriteTickets::new();
        let t = tickets.issue("k");

        assert!(tickets.settle("k", t, || {}));
        assert!(!tickets.settle("k", t, || {}));
    }
}
