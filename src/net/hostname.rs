use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use rustc_hash::FxHashSet;

/// A peer's identity: its canonical (case-folded) hostname, interned process-wide.
///
/// Interning makes equality a pointer comparison, which the transport leans on heavily - every
///  send does a peer lookup, and the reader compares sender names on every frame. The interner
///  guarantees that two equal strings always yield the same allocation, so pointer equality and
///  string equality coincide. A [HostName] is also the stable peer handle: it survives
///  reconnects and is cheap to clone and pass around.
#[derive(Clone, Eq)]
pub struct HostName(Arc<str>);

static INTERNED: OnceLock<Mutex<FxHashSet<Arc<str>>>> = OnceLock::new();

impl HostName {
    pub fn intern(name: &str) -> HostName {
        let canonical = name.to_ascii_lowercase();

        let mut interned = INTERNED.get_or_init(Default::default)
            .lock()
            .expect("hostname interner poisoned");

        if let Some(existing) = interned.get(canonical.as_str()) {
            return HostName(existing.clone());
        }

        let entry: Arc<str> = Arc::from(canonical.as_str());
        interned.insert(entry.clone());
        HostName(entry)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for HostName {
    fn eq(&self, other: &Self) -> bool {
        // interning guarantees one allocation per distinct name
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Hash for HostName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl PartialOrd for HostName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HostName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_ref().cmp(other.0.as_ref())
    }
}

impl Display for HostName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Debug for HostName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0.as_ref())
    }
}

impl From<&str> for HostName {
    fn from(value: &str) -> Self {
        HostName::intern(value)
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_intern_identity() {
        let a = HostName::intern("db-node-1");
        let b = HostName::intern("db-node-1");
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(a, b);
    }

    #[rstest]
    #[case::folded("DB-Node-1", "db-node-1", true)]
    #[case::identical("db-node-1", "db-node-1", true)]
    #[case::different("db-node-1", "db-node-2", false)]
    fn test_case_folding(#[case] left: &str, #[case] right: &str, #[case] expected_eq: bool) {
        let l = HostName::intern(left);
        let r = HostName::intern(right);
        assert_eq!(l == r, expected_eq);
    }

    #[test]
    fn test_hash_map_key() {
        let mut map = rustc_hash::FxHashMap::default();
        map.insert(HostName::intern("alpha"), 1);
        map.insert(HostName::intern("beta"), 2);
        assert_eq!(map.get(&HostName::intern("ALPHA")), Some(&1));
        assert_eq!(map.get(&HostName::intern("gamma")), None);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut names = vec![HostName::intern("zeta"), HostName::intern("alpha"), HostName::intern("mu")];
        names.sort();
        let strs: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
        assert_eq!(strs, vec!["alpha", "mu", "zeta"]);
    }
}
