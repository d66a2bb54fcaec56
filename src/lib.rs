//! machined replicates *machines*: deterministic, append-only logs of
//! expressions held in a content-addressed store, folded into evaluator
//! state by an embedded interpreter.
//!
//! The daemon caches the machines it follows, keeps reader caches fresh via
//! pub/sub notifications with a polling fallback, relays reader appends to
//! the machine's writer through an ack'd request/broadcast exchange, and
//! exposes query/send/new over HTTP. The follow set survives restarts in a
//! small JSON file; storage stays the source of truth for log contents.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod follow;
pub mod ipfs;
pub mod lang;
pub mod machine;
pub mod poller;
pub mod registry;
pub mod server;
pub mod util;
