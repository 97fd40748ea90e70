//! Learning-bridge MAC table.
//!
//! Maps a source MAC address to the session it was last seen on, separately
//! for each network (broadcast domain).  Relearning overwrites: the last
//! session to send from a MAC owns it.  That means a roaming or spoofed MAC
//! is redirected immediately; the switch trusts its authenticated sessions.
//!
//! Entries are never removed when their session closes.  Callers resolve a
//! binding against the live session registry and treat a dangling one as
//! "not found".  With a maximum age configured, old bindings also read as
//! absent and [`MacTable::sweep`] reclaims them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::ethernet::MacAddr;
use crate::registry::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacEntry {
    pub session: SessionId,
    pub learned_at: Instant,
}

#[derive(Debug, Default)]
pub struct MacTable {
    domains: HashMap<String, HashMap<MacAddr, MacEntry>>,
    max_age: Option<Duration>,
}

impl MacTable {
    pub fn new(max_age: Option<Duration>) -> Self {
        Self {
            domains: HashMap::new(),
            max_age,
        }
    }

    /// Bind `mac` to `session` in `network`.
    ///
    /// Returns the previous owner when the MAC moved between sessions.
    pub fn learn(&mut self, network: &str, mac: MacAddr, session: SessionId) -> Option<SessionId> {
        self.learn_at(network, mac, session, Instant::now())
    }

    pub fn learn_at(
        &mut self,
        network: &str,
        mac: MacAddr,
        session: SessionId,
        now: Instant,
    ) -> Option<SessionId> {
        let entry = MacEntry { session, learned_at: now };
        let domain = match self.domains.get_mut(network) {
            Some(d) => d,
            None => self.domains.entry(network.to_string()).or_default(),
        };
        domain
            .insert(mac, entry)
            .map(|old| old.session)
            .filter(|&old| old != session)
    }

    pub fn lookup(&self, network: &str, mac: &MacAddr) -> Option<SessionId> {
        self.lookup_at(network, mac, Instant::now())
    }

    pub fn lookup_at(&self, network: &str, mac: &MacAddr, now: Instant) -> Option<SessionId> {
        let entry = self.domains.get(network)?.get(mac)?;
        if self.is_expired(entry, now) {
            return None;
        }
        Some(entry.session)
    }

    /// Drop expired bindings and those whose session `is_live` rejects.
    /// Returns how many entries were removed.
    pub fn sweep(&mut self, now: Instant, is_live: impl Fn(SessionId) -> bool) -> usize {
        let max_age = self.max_age;
        let mut removed = 0;
        for domain in self.domains.values_mut() {
            let before = domain.len();
            domain.retain(|_, e| {
                let expired = max_age.is_some_and(|age| now.saturating_duration_since(e.learned_at) > age);
                !expired && is_live(e.session)
            });
            removed += before - domain.len();
        }
        self.domains.retain(|_, d| !d.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.domains.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &MacEntry, now: Instant) -> bool {
        self.max_age
            .is_some_and(|age| now.saturating_duration_since(entry.learned_at) > age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
    const B: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);

    #[test]
    fn learn_then_lookup() {
        let mut t = MacTable::new(None);
        assert_eq!(t.learn("default", A, SessionId(1)), None);
        assert_eq!(t.lookup("default", &A), Some(SessionId(1)));
        assert_eq!(t.lookup("default", &B), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn relearn_overwrites_and_reports_move() {
        let mut t = MacTable::new(None);
        t.learn("default", A, SessionId(1));
        assert_eq!(t.learn("default", A, SessionId(1)), None);
        assert_eq!(t.learn("default", A, SessionId(2)), Some(SessionId(1)));
        assert_eq!(t.lookup("default", &A), Some(SessionId(2)));
    }

    #[test]
    fn networks_are_isolated() {
        let mut t = MacTable::new(None);
        t.learn("red", A, SessionId(1));
        t.learn("blue", A, SessionId(2));
        assert_eq!(t.lookup("red", &A), Some(SessionId(1)));
        assert_eq!(t.lookup("blue", &A), Some(SessionId(2)));
        assert_eq!(t.lookup("green", &A), None);
    }

    #[test]
    fn aged_entries_read_as_absent() {
        let mut t = MacTable::new(Some(Duration::from_secs(30)));
        let start = Instant::now();
        t.learn_at("default", A, SessionId(1), start);
        assert_eq!(t.lookup_at("default", &A, start + Duration::from_secs(10)), Some(SessionId(1)));
        assert_eq!(t.lookup_at("default", &A, start + Duration::from_secs(31)), None);
    }

    #[test]
    fn sweep_removes_expired_and_dead() {
        let mut t = MacTable::new(Some(Duration::from_secs(30)));
        let start = Instant::now();
        t.learn_at("default", A, SessionId(1), start);
        t.learn_at("default", B, SessionId(2), start + Duration::from_secs(20));
        t.learn_at("other", A, SessionId(3), start + Duration::from_secs(20));

        let removed = t.sweep(start + Duration::from_secs(40), |id| id != SessionId(3));
        assert_eq!(removed, 2);
        assert_eq!(t.len(), 1);
        assert_eq!(t.lookup_at("default", &B, start + Duration::from_secs(40)), Some(SessionId(2)));
    }
}
