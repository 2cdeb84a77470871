//! Wait list of outstanding sequence numbers for synchronous sends.
//!
//! A sender registers its seqnum before the frame is queued, then waits on the returned
//!  channel. The reader completes the entry when the matching ack arrives. Entries that never
//!  complete are reclaimed by the sender's timeout path; tearing down the registry (peer
//!  decommission) completes every waiter with an error instead of leaving it to time out.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::net::error::SendError;

/// What the remote side answered for one seqnum.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckResult {
    pub outrc: i32,
    pub payload: Option<Vec<u8>>,
}

struct Waiter {
    seqnum: i32,
    tx: oneshot::Sender<AckResult>,
}

pub struct AckRegistry {
    waiters: Mutex<Vec<Waiter>>,
}

impl AckRegistry {
    pub fn new() -> AckRegistry {
        AckRegistry { waiters: Mutex::new(Vec::new()) }
    }

    /// Registers a waiter for `seqnum`. Must happen before the frame is queued so the ack
    ///  cannot race past the registration.
    pub fn register(&self, seqnum: i32) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("ack registry poisoned")
            .push(Waiter { seqnum, tx });
        rx
    }

    /// Completes the waiter for `seqnum`, if any. A stray ack (timeout already reclaimed the
    ///  entry, or a duplicate) is dropped silently.
    pub fn complete(&self, seqnum: i32, result: AckResult) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock().expect("ack registry poisoned");
            match waiters.iter().position(|w| w.seqnum == seqnum) {
                Some(idx) => waiters.swap_remove(idx),
                None => return false,
            }
        };
        waiter.tx.send(result).is_ok()
    }

    /// Removes a waiter that gave up.
    pub fn remove(&self, seqnum: i32) {
        let mut waiters = self.waiters.lock().expect("ack registry poisoned");
        if let Some(idx) = waiters.iter().position(|w| w.seqnum == seqnum) {
            waiters.swap_remove(idx);
        }
    }

    /// Drops every outstanding waiter; their receivers resolve immediately with an error.
    pub fn clear(&self) {
        self.waiters.lock().expect("ack registry poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().expect("ack registry poisoned").len()
    }
}

/// Waits for the ack with the caller's budget and maps the outcome onto the send error set:
///  no answer in time is [SendError::Timeout], a torn-down registry is [SendError::Closed],
///  and a negative handler return code is remapped to [SendError::InvalidAckRc] so user code
///  cannot impersonate transport errors.
pub async fn await_ack(registry: &AckRegistry, seqnum: i32, rx: oneshot::Receiver<AckResult>, waitms: u64) -> Result<AckResult, SendError> {
    match tokio::time::timeout(Duration::from_millis(waitms), rx).await {
        Ok(Ok(result)) => {
            if result.outrc < 0 {
                return Err(SendError::InvalidAckRc);
            }
            Ok(result)
        }
        Ok(Err(_)) => Err(SendError::Closed),
        Err(_) => {
            registry.remove(seqnum);
            Err(SendError::Timeout)
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_ack_completes_waiter() {
        let registry = AckRegistry::new();
        let rx = registry.register(7);

        assert!(registry.complete(7, AckResult { outrc: 42, payload: None }));
        let result = await_ack(&registry, 7, rx, 1000).await.unwrap();
        assert_eq!(result.outrc, 42);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_ack_payload_is_delivered() {
        let registry = AckRegistry::new();
        let rx = registry.register(8);

        registry.complete(8, AckResult { outrc: 0, payload: Some(b"row".to_vec()) });
        let result = await_ack(&registry, 8, rx, 1000).await.unwrap();
        assert_eq!(result.payload.as_deref(), Some(&b"row"[..]));
    }

    #[tokio::test]
    async fn test_timeout_reclaims_entry() {
        let registry = AckRegistry::new();
        let rx = registry.register(9);

        let err = await_ack(&registry, 9, rx, 20).await.unwrap_err();
        assert_eq!(err, SendError::Timeout);
        assert_eq!(registry.len(), 0);

        // a late ack finds nothing to complete
        assert!(!registry.complete(9, AckResult { outrc: 1, payload: None }));
    }

    #[tokio::test]
    async fn test_negative_outrc_is_remapped() {
        let registry = AckRegistry::new();
        let rx = registry.register(10);

        registry.complete(10, AckResult { outrc: -3, payload: None });
        assert_eq!(await_ack(&registry, 10, rx, 1000).await.unwrap_err(), SendError::InvalidAckRc);
    }

    #[tokio::test]
    async fn test_clear_fails_waiters_fast() {
        let registry = AckRegistry::new();
        let rx = registry.register(11);

        registry.clear();
        // resolves well before the 10s budget because the sender side is gone
        let err = tokio::time::timeout(Duration::from_secs(1), await_ack(&registry, 11, rx, 10_000))
            .await
            .expect("waiter did not resolve after registry teardown")
            .unwrap_err();
        assert_eq!(err, SendError::Closed);
    }

    #[tokio::test]
    async fn test_ack_matches_only_its_seqnum() {
        let registry = AckRegistry::new();
        let rx_a = registry.register(20);
        let rx_b = registry.register(21);

        registry.complete(21, AckResult { outrc: 5, payload: None });
        assert_eq!(await_ack(&registry, 21, rx_b, 1000).await.unwrap().outrc, 5);

        let err = await_ack(&registry, 20, rx_a, 20).await.unwrap_err();
        assert_eq!(err, SendError::Timeout);
    }
}
