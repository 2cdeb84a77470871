//! The peer table: the set of known mesh members, keyed by interned hostname, plus the
//!  sanctioned list of quorum-eligible peers.

use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;

use crate::net::hostname::HostName;
use crate::net::peer::Peer;

/// Peers keyed by interned hostname. Insertion is idempotent; removal is driven by
///  decommissioning only - unreachable peers stay and are re-dialed forever.
pub struct PeerTable {
    peers: RwLock<FxHashMap<HostName, Arc<Peer>>>,
    /// single-entry cache of the last successful lookup; sends are heavily repetitive
    cache: Mutex<Option<Arc<Peer>>>,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable {
            peers: RwLock::new(FxHashMap::default()),
            cache: Mutex::new(None),
        }
    }

    /// Adds a peer if it is new. Returns the created entry, or `None` if the peer was already
    ///  present (the existing entry's port is left alone - the name service refreshes it on
    ///  the next dial).
    pub fn insert(&self, host: HostName, port: u16) -> Option<Arc<Peer>> {
        let mut peers = self.peers.write().expect("peer table poisoned");
        if peers.contains_key(&host) {
            return None;
        }
        let peer = Arc::new(Peer::new(host.clone(), port));
        peers.insert(host, peer.clone());
        Some(peer)
    }

    pub fn get(&self, host: &HostName) -> Option<Arc<Peer>> {
        {
            let cache = self.cache.lock().expect("peer cache poisoned");
            if let Some(cached) = cache.as_ref() {
                if &cached.host == host {
                    return Some(cached.clone());
                }
            }
        }

        let found = self.peers.read().expect("peer table poisoned").get(host).cloned();
        if let Some(peer) = &found {
            *self.cache.lock().expect("peer cache poisoned") = Some(peer.clone());
        }
        found
    }

    pub fn contains(&self, host: &HostName) -> bool {
        self.peers.read().expect("peer table poisoned").contains_key(host)
    }

    /// Splices a peer out of the table. The entry itself is freed when its workers are done
    ///  with it; callers mark it decommissioned first.
    pub fn remove(&self, host: &HostName) -> Option<Arc<Peer>> {
        let removed = self.peers.write().expect("peer table poisoned").remove(host);
        if removed.is_some() {
            let mut cache = self.cache.lock().expect("peer cache poisoned");
            if cache.as_ref().map(|c| &c.host == host).unwrap_or(false) {
                *cache = None;
            }
        }
        removed
    }

    /// All peers, ordered by name for deterministic hellos and listings.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self.peers.read().expect("peer table poisoned")
            .values()
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.host.cmp(&b.host));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peer table poisoned").len()
    }
}


/// The configured quorum-eligible peer set. Sanctioned membership is orthogonal to
///  connectivity and to presence in the peer table.
pub struct SanctionedList {
    hosts: Mutex<Vec<HostName>>,
}

impl SanctionedList {
    pub fn new() -> SanctionedList {
        SanctionedList { hosts: Mutex::new(Vec::new()) }
    }

    /// returns false if the host was already sanctioned
    pub fn add(&self, host: HostName) -> bool {
        let mut hosts = self.hosts.lock().expect("sanctioned list poisoned");
        if hosts.contains(&host) {
            return false;
        }
        hosts.push(host);
        true
    }

    pub fn remove(&self, host: &HostName) -> bool {
        let mut hosts = self.hosts.lock().expect("sanctioned list poisoned");
        match hosts.iter().position(|h| h == host) {
            Some(idx) => {
                hosts.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, host: &HostName) -> bool {
        self.hosts.lock().expect("sanctioned list poisoned").contains(host)
    }

    pub fn list(&self) -> Vec<HostName> {
        self.hosts.lock().expect("sanctioned list poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().expect("sanctioned list poisoned").len()
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let table = PeerTable::new();
        assert!(table.insert(HostName::intern("alpha"), 7000).is_some());
        assert!(table.insert(HostName::intern("alpha"), 7001).is_none());
        assert_eq!(table.len(), 1);
        // the existing entry keeps its port
        assert_eq!(table.get(&HostName::intern("alpha")).unwrap().port(), 7000);
    }

    #[test]
    fn test_lookup_after_remove_misses_despite_cache() {
        let table = PeerTable::new();
        let host = HostName::intern("beta");
        table.insert(host.clone(), 7000);

        // populate the lookup cache
        assert!(table.get(&host).is_some());

        table.remove(&host);
        assert!(table.get(&host).is_none());
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let table = PeerTable::new();
        assert!(table.remove(&HostName::intern("nobody")).is_none());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let table = PeerTable::new();
        table.insert(HostName::intern("zeta"), 1);
        table.insert(HostName::intern("alpha"), 2);
        table.insert(HostName::intern("mu"), 3);

        let names: Vec<String> = table.snapshot().iter().map(|p| p.host.to_string()).collect();
        assert_eq!(names, vec!["alpha", "mu", "zeta"]);
    }

    #[test]
    fn test_sanctioned_list() {
        let sanctioned = SanctionedList::new();
        let host = HostName::intern("gamma");

        assert!(sanctioned.add(host.clone()));
        assert!(!sanctioned.add(host.clone()));
        assert!(sanctioned.contains(&host));
        assert_eq!(sanctioned.len(), 1);

        assert!(sanctioned.remove(&host));
        assert!(!sanctioned.remove(&host));
        assert!(!sanctioned.contains(&host));
    }
}
