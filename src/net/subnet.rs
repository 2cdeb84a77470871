//! Multi-subnet dial rotation.
//!
//! A host may be reachable over several dedicated NICs, each addressed by appending a
//!  configured DNS suffix to the peer's hostname (e.g. `db3` + `_n2` -> `db3_n2`). Each dial
//!  picks the next suffix round-robin; a subnet recently marked bad by the liveness check is
//!  skipped for the blackout interval (when there is an alternative), and a subnet can be
//!  administratively disabled outright.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::bail;
use rand::Rng;

use crate::net::stats::epoch_secs;

pub const MAX_SUBNETS: usize = 15;

#[derive(Debug, Clone)]
pub struct SubnetStatus {
    pub suffix: String,
    /// epoch seconds at which the subnet was administratively disabled
    pub disabled_since: Option<i64>,
}

/// What the rotation yields for one dial attempt.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SubnetChoice {
    /// no dedicated subnets are configured; dial the plain hostname
    NoneConfigured,
    /// every subnet is currently disabled or blacked out; skip this dial attempt
    Unavailable,
    /// dial with this suffix appended (possibly the empty non-dedicated suffix)
    Use(String),
}

struct Entry {
    suffix: String,
    disabled_since: Option<i64>,
}

struct Inner {
    entries: Vec<Entry>,
    /// rotation position; initialized lazily with a random offset so a restarted fleet does
    ///  not gang up on one subnet
    counter: Option<usize>,
    last_bad: Option<(usize, Instant)>,
    has_nondedicated: bool,
}

pub struct Subnets {
    inner: Mutex<Inner>,
}

impl Subnets {
    pub fn new() -> Subnets {
        Subnets {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                counter: None,
                last_bad: None,
                has_nondedicated: false,
            }),
        }
    }

    pub fn add_suffix(&self, suffix: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("subnet table poisoned");
        if inner.entries.len() >= MAX_SUBNETS {
            bail!("too many subnet suffixes (max {})", MAX_SUBNETS);
        }
        inner.entries.push(Entry { suffix: suffix.to_string(), disabled_since: None });
        Ok(())
    }

    /// adds the plain, un-suffixed network as one rotation slot (at most once)
    pub fn add_nondedicated(&self) {
        let mut inner = self.inner.lock().expect("subnet table poisoned");
        if !inner.has_nondedicated {
            inner.has_nondedicated = true;
            inner.entries.push(Entry { suffix: String::new(), disabled_since: None });
        }
    }

    /// Picks the subnet for the next dial attempt.
    pub fn pick(&self, blackout: Duration) -> SubnetChoice {
        let mut inner = self.inner.lock().expect("subnet table poisoned");
        let n = inner.entries.len();
        if n == 0 {
            return SubnetChoice::NoneConfigured;
        }

        // clear an expired blackout
        if let Some((_, since)) = inner.last_bad {
            if since.elapsed() >= blackout {
                inner.last_bad = None;
            }
        }

        let mut counter = match inner.counter {
            Some(c) => c,
            None => rand::thread_rng().gen_range(0..n),
        };

        for _ in 0..n {
            counter = counter.wrapping_add(1);
            let idx = counter % n;

            if inner.entries[idx].disabled_since.is_some() {
                continue;
            }
            // skip the last bad subnet only while there is a choice
            if n > 1 {
                if let Some((bad_idx, _)) = inner.last_bad {
                    if bad_idx == idx {
                        continue;
                    }
                }
            }

            inner.counter = Some(counter);
            return SubnetChoice::Use(inner.entries[idx].suffix.clone());
        }

        inner.counter = Some(counter);
        SubnetChoice::Unavailable
    }

    /// Marks the subnet a read timeout was observed on; the rotation avoids it for the
    ///  blackout interval.
    pub fn mark_bad(&self, suffix: &str) {
        let mut inner = self.inner.lock().expect("subnet table poisoned");
        if let Some(idx) = inner.entries.iter().position(|e| e.suffix == suffix) {
            inner.last_bad = Some((idx, Instant::now()));
        }
    }

    /// Administratively disables or re-enables a subnet. Returns whether the suffix exists.
    ///  The caller is responsible for shutting down sockets currently using it.
    pub fn set_disabled(&self, suffix: &str, disabled: bool) -> bool {
        let mut inner = self.inner.lock().expect("subnet table poisoned");
        match inner.entries.iter_mut().find(|e| e.suffix == suffix) {
            Some(entry) => {
                entry.disabled_since = if disabled { Some(epoch_secs()) } else { None };
                true
            }
            None => false,
        }
    }

    pub fn is_disabled(&self, suffix: &str) -> bool {
        self.inner.lock().expect("subnet table poisoned")
            .entries.iter()
            .any(|e| e.suffix == suffix && e.disabled_since.is_some())
    }

    pub fn status(&self) -> Vec<SubnetStatus> {
        self.inner.lock().expect("subnet table poisoned")
            .entries.iter()
            .map(|e| SubnetStatus { suffix: e.suffix.clone(), disabled_since: e.disabled_since })
            .collect()
    }
}


#[cfg(test)]
mod test {
    use rustc_hash::FxHashSet;

    use super::*;

    const NO_BLACKOUT: Duration = Duration::ZERO;
    const LONG_BLACKOUT: Duration = Duration::from_secs(3600);

    fn suffix_of(choice: SubnetChoice) -> String {
        match choice {
            SubnetChoice::Use(s) => s,
            other => panic!("expected a usable subnet, got {:?}", other),
        }
    }

    #[test]
    fn test_no_subnets_configured() {
        let subnets = Subnets::new();
        assert_eq!(subnets.pick(NO_BLACKOUT), SubnetChoice::NoneConfigured);
    }

    #[test]
    fn test_rotation_cycles_through_all() {
        let subnets = Subnets::new();
        subnets.add_suffix("_n1").unwrap();
        subnets.add_suffix("_n2").unwrap();
        subnets.add_suffix("_n3").unwrap();

        let picked: FxHashSet<String> = (0..3).map(|_| suffix_of(subnets.pick(NO_BLACKOUT))).collect();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_blackout_skips_bad_subnet() {
        let subnets = Subnets::new();
        subnets.add_suffix("_n1").unwrap();
        subnets.add_suffix("_n2").unwrap();

        subnets.mark_bad("_n1");
        for _ in 0..4 {
            assert_eq!(suffix_of(subnets.pick(LONG_BLACKOUT)), "_n2");
        }
    }

    #[test]
    fn test_blackout_expires() {
        let subnets = Subnets::new();
        subnets.add_suffix("_n1").unwrap();
        subnets.add_suffix("_n2").unwrap();

        subnets.mark_bad("_n1");
        // with a zero blackout the bad mark is already expired
        let picked: FxHashSet<String> = (0..2).map(|_| suffix_of(subnets.pick(NO_BLACKOUT))).collect();
        assert!(picked.contains("_n1"));
    }

    #[test]
    fn test_single_subnet_is_used_even_when_bad() {
        let subnets = Subnets::new();
        subnets.add_suffix("_n1").unwrap();
        subnets.mark_bad("_n1");
        assert_eq!(suffix_of(subnets.pick(LONG_BLACKOUT)), "_n1");
    }

    #[test]
    fn test_disabled_subnet_is_skipped() {
        let subnets = Subnets::new();
        subnets.add_suffix("_n1").unwrap();
        subnets.add_suffix("_n2").unwrap();

        assert!(subnets.set_disabled("_n1", true));
        for _ in 0..4 {
            assert_eq!(suffix_of(subnets.pick(NO_BLACKOUT)), "_n2");
        }

        assert!(subnets.set_disabled("_n1", false));
        let picked: FxHashSet<String> = (0..2).map(|_| suffix_of(subnets.pick(NO_BLACKOUT))).collect();
        assert!(picked.contains("_n1"));
    }

    #[test]
    fn test_all_disabled_is_unavailable() {
        let subnets = Subnets::new();
        subnets.add_suffix("_n1").unwrap();
        subnets.set_disabled("_n1", true);
        assert_eq!(subnets.pick(NO_BLACKOUT), SubnetChoice::Unavailable);
    }

    #[test]
    fn test_nondedicated_added_once() {
        let subnets = Subnets::new();
        subnets.add_nondedicated();
        subnets.add_nondedicated();
        assert_eq!(subnets.status().len(), 1);
        assert_eq!(suffix_of(subnets.pick(NO_BLACKOUT)), "");
    }

    #[test]
    fn test_unknown_suffix_reports_missing() {
        let subnets = Subnets::new();
        subnets.add_suffix("_n1").unwrap();
        assert!(!subnets.set_disabled("_n9", true));
        assert!(!subnets.is_disabled("_n9"));
    }
}
