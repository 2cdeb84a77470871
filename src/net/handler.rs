//! Dispatch of inbound user messages to registered handlers, and the ack primitive handlers
//!  use to answer synchronous sends.

use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail};
use async_trait::async_trait;

use crate::net::error::SendError;
use crate::net::hostname::HostName;
use crate::net::net::Net;
use crate::net::stats::HandlerStats;
use crate::net::wire::MAX_ACK_PAYLOAD;

/// One inbound user message, borrowed from the reader's receive buffer for the duration of the
///  handler call.
pub struct ReceivedMessage<'a> {
    pub from: HostName,
    pub usertype: i32,
    pub data: &'a [u8],
    /// present when the sender is blocked waiting; pass it to [AckHandle::ack] to release them
    pub ack: Option<AckHandle>,
}

/// Handlers are registered per user type. A handler call blocks the peer's reader, so
///  non-trivial work should be offloaded; whether and how is up to the handler.
#[async_trait]
pub trait NetHandler: Send + Sync + 'static {
    async fn handle(&self, msg: ReceivedMessage<'_>);
}

/// Capability to answer one synchronous send. The return code travels back to the sender as
///  the result of its `send_message` call; only non-negative codes are valid.
pub struct AckHandle {
    net: Arc<Net>,
    from: HostName,
    seqnum: i32,
}

impl AckHandle {
    pub(crate) fn new(net: Arc<Net>, from: HostName, seqnum: i32) -> AckHandle {
        AckHandle { net, from, seqnum }
    }

    pub fn from_host(&self) -> &HostName {
        &self.from
    }

    pub async fn ack(&self, outrc: i32) -> Result<(), SendError> {
        self.net.send_ack(&self.from, self.seqnum, outrc, None).await
    }

    /// Answers with a small payload alongside the return code (at most 1024 bytes).
    pub async fn ack_with_payload(&self, outrc: i32, payload: &[u8]) -> Result<(), SendError> {
        if payload.is_empty() || payload.len() > MAX_ACK_PAYLOAD {
            return Err(SendError::Internal);
        }
        self.net.send_ack(&self.from, self.seqnum, outrc, Some(payload)).await
    }
}

pub struct RegisteredHandler {
    pub name: String,
    pub func: Arc<dyn NetHandler>,
    pub stats: HandlerStats,
}

/// The per-mesh handler table, indexed by user type.
pub struct HandlerTable {
    slots: RwLock<Vec<Option<Arc<RegisteredHandler>>>>,
}

impl HandlerTable {
    pub fn new(max_user_type: usize) -> HandlerTable {
        HandlerTable {
            slots: RwLock::new(vec![None; max_user_type + 1]),
        }
    }

    pub fn register(&self, usertype: i32, name: &str, func: Arc<dyn NetHandler>) -> anyhow::Result<()> {
        let mut slots = self.slots.write().expect("handler table poisoned");
        let slot = self.slot_index(usertype, slots.len())?;
        if slots[slot].is_some() {
            bail!("handler already registered for user type {}", usertype);
        }
        slots[slot] = Some(Arc::new(RegisteredHandler {
            name: name.to_string(),
            func,
            stats: HandlerStats::default(),
        }));
        Ok(())
    }

    pub fn deregister(&self, usertype: i32) -> anyhow::Result<()> {
        let mut slots = self.slots.write().expect("handler table poisoned");
        let slot = self.slot_index(usertype, slots.len())?;
        if slots[slot].take().is_none() {
            bail!("no handler registered for user type {}", usertype);
        }
        Ok(())
    }

    pub fn get(&self, usertype: i32) -> Option<Arc<RegisteredHandler>> {
        let slots = self.slots.read().expect("handler table poisoned");
        if usertype < 0 || usertype as usize >= slots.len() {
            return None;
        }
        slots[usertype as usize].clone()
    }

    /// iterates registered handlers with their call counters, for introspection
    pub fn iterate(&self, mut f: impl FnMut(i32, &str, u64, u64)) {
        let slots = self.slots.read().expect("handler table poisoned");
        for (usertype, slot) in slots.iter().enumerate() {
            if let Some(handler) = slot {
                f(
                    usertype as i32,
                    &handler.name,
                    handler.stats.calls.load(Ordering::Relaxed),
                    handler.stats.total_us.load(Ordering::Relaxed),
                );
            }
        }
    }

    fn slot_index(&self, usertype: i32, len: usize) -> anyhow::Result<usize> {
        if usertype < 0 || usertype as usize >= len {
            return Err(anyhow!("user type {} out of range (max {})", usertype, len - 1));
        }
        Ok(usertype as usize)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    struct NoopHandler;
    #[async_trait]
    impl NetHandler for NoopHandler {
        async fn handle(&self, _msg: ReceivedMessage<'_>) {}
    }

    #[test]
    fn test_register_and_get() {
        let table = HandlerTable::new(16);
        table.register(5, "replication", Arc::new(NoopHandler)).unwrap();

        let handler = table.get(5).unwrap();
        assert_eq!(handler.name, "replication");
        assert!(table.get(6).is_none());
    }

    #[test]
    fn test_double_registration_is_rejected() {
        let table = HandlerTable::new(16);
        table.register(5, "first", Arc::new(NoopHandler)).unwrap();
        assert!(table.register(5, "second", Arc::new(NoopHandler)).is_err());
    }

    #[test]
    fn test_deregister() {
        let table = HandlerTable::new(16);
        table.register(5, "replication", Arc::new(NoopHandler)).unwrap();
        table.deregister(5).unwrap();
        assert!(table.get(5).is_none());
        assert!(table.deregister(5).is_err());
    }

    #[test]
    fn test_out_of_range_user_types() {
        let table = HandlerTable::new(16);
        assert!(table.register(-1, "negative", Arc::new(NoopHandler)).is_err());
        assert!(table.register(17, "too-big", Arc::new(NoopHandler)).is_err());
        assert!(table.get(-1).is_none());
        assert!(table.get(17).is_none());
    }

    #[test]
    fn test_iterate_reports_registered() {
        let table = HandlerTable::new(16);
        table.register(3, "a", Arc::new(NoopHandler)).unwrap();
        table.register(9, "b", Arc::new(NoopHandler)).unwrap();

        let mut seen = Vec::new();
        table.iterate(|usertype, name, calls, _| seen.push((usertype, name.to_string(), calls)));
        assert_eq!(seen, vec![(3, "a".to_string(), 0), (9, "b".to_string(), 0)]);
    }
}
