//! Embedded in-memory backend.
//!
//! One `MemIpfs` is a complete medium: per-machine append-only logs plus
//! per-machine topics. Cloning shares the medium, which is how a single
//! process wires several daemons (or a daemon and a test harness) to the
//! same logs and topics.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use super::{Index, Ipfs, Message, Subscription};
use crate::error::Error;
use crate::lang::Value;
use crate::machine::MachineId;

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct MemIpfs {
    logs: std::sync::Arc<Mutex<HashMap<MachineId, Vec<Value>>>>,
    topics: std::sync::Arc<Mutex<HashMap<MachineId, broadcast::Sender<serde_json::Value>>>>,
}

impl MemIpfs {
    pub fn new() -> Self {
        Self::default()
    }

    async fn topic(&self, id: &MachineId) -> broadcast::Sender<serde_json::Value> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Ipfs for MemIpfs {
    async fn write_log(&self, id: &MachineId, inputs: &[Value]) -> Result<Index, Error> {
        let mut logs = self.logs.lock().await;
        let log = logs.entry(id.clone()).or_default();
        log.extend(inputs.iter().cloned());
        Ok(Index::new(log.len().to_string()))
    }

    async fn read_log_from(
        &self,
        id: &MachineId,
        from: Option<&Index>,
    ) -> Result<(Option<Index>, Vec<Value>), Error> {
        let logs = self.logs.lock().await;
        let log = logs.get(id).map(Vec::as_slice).unwrap_or_default();
        let start = match from {
            None => 0,
            Some(index) => index
                .as_str()
                .parse::<usize>()
                .map_err(|_| Error::Ipfs(format!("unreadable log cursor `{}`", index)))?,
        };
        let tail = log.get(start..).unwrap_or_default().to_vec();
        let index = if log.is_empty() {
            None
        } else {
            Some(Index::new(log.len().to_string()))
        };
        Ok((index, tail))
    }

    async fn subscribe(&self, id: &MachineId) -> Result<Subscription, Error> {
        Ok(Subscription::new(self.topic(id).await))
    }

    async fn publish(&self, id: &MachineId, msg: &Message) -> Result<(), Error> {
        let raw = serde_json::to_value(msg)
            .map_err(|err| Error::Ipfs(format!("encoding topic message: {}", err)))?;
        // No subscribers is fine; the message is simply gone.
        let _ = self.topic(id).await.send(raw);
        Ok(())
    }
}
