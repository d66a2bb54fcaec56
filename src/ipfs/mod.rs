//! The storage and pub/sub boundary.
//!
//! Machines live in a content-addressed store as append-only logs of
//! expressions, with one pub/sub topic per machine for change notifications
//! and remote append requests. The daemon core only ever talks to this
//! boundary through [`Ipfs`]; the wire protocol behind it is not this crate's
//! concern. [`MemIpfs`] is the embedded implementation used for single-node
//! operation and for wiring several daemons to one medium in tests.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Error;
use crate::lang::Value;
use crate::machine::MachineId;

mod memory;

pub use memory::MemIpfs;

/// Opaque cursor into a machine's log.
///
/// Produced and interpreted by the backend only; the core round-trips it as
/// its "last seen" position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index(String);

impl Index {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages exchanged on a machine's topic.
///
/// `Req` travels reader → writer to ask for a remote append; `New` travels
/// writer → everyone once inputs are in the log. The `nonce` ties a `New`
/// back to the `Req` it answers. Payload kinds we do not know fail to decode
/// and are dropped in [`MessageWatch::recv`], never surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Req {
        expressions: Vec<Value>,
        nonce: String,
    },
    New {
        results: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },
}

/// Handle on a machine's topic.
///
/// Cloneable; every [`Subscription::watch`] call yields an independent
/// receiver that sees messages published from then on.
#[derive(Debug, Clone)]
pub struct Subscription {
    sender: broadcast::Sender<serde_json::Value>,
}

impl Subscription {
    pub(crate) fn new(sender: broadcast::Sender<serde_json::Value>) -> Self {
        Self { sender }
    }

    pub fn watch(&self) -> MessageWatch {
        MessageWatch {
            rx: self.sender.subscribe(),
        }
    }
}

/// Receiving end of a [`Subscription`].
#[derive(Debug)]
pub struct MessageWatch {
    rx: broadcast::Receiver<serde_json::Value>,
}

impl MessageWatch {
    /// Next decodable message, or `None` once the topic is gone.
    ///
    /// Undecodable payloads are skipped; so is anything lost to receiver
    /// lag. Both are best-effort conditions the poller papers over.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(raw) => match serde_json::from_value(raw) {
                    Ok(msg) => return Some(msg),
                    Err(err) => {
                        debug!("ignoring unknown topic message: {}", err);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "subscription lagged, dropping messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Client boundary to the content-addressed store and its pub/sub layer.
#[async_trait]
pub trait Ipfs: Send + Sync + 'static {
    /// Atomically appends `inputs` to the machine's log and returns the new
    /// tail index. Callers must not pass an empty batch.
    async fn write_log(&self, id: &MachineId, inputs: &[Value]) -> Result<Index, Error>;

    /// Reads the log suffix strictly after `from` (the whole log when
    /// `None`). The returned tail index is `None` iff the log is empty.
    async fn read_log_from(
        &self,
        id: &MachineId,
        from: Option<&Index>,
    ) -> Result<(Option<Index>, Vec<Value>), Error>;

    /// Joins the machine's topic.
    async fn subscribe(&self, id: &MachineId) -> Result<Subscription, Error>;

    /// Best-effort broadcast to the machine's topic.
    async fn publish(&self, id: &MachineId, msg: &Message) -> Result<(), Error>;
}
