//! The follow file: the daemon's only durable local state.
//!
//! A JSON object mapping machine id to `"Reader"` or `"Writer"`. Loaded once
//! at boot to rebuild the registry from storage, rewritten whenever the
//! follow set changes. Storage itself remains the source of truth for log
//! contents; losing this file only loses which machines we cared about.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Error;
use crate::machine::Role;

#[derive(Debug)]
pub struct FollowStore {
    path: PathBuf,
    /// Serialises load against persist; never held during registry work.
    lock: Mutex<()>,
}

impl FollowStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the follow set, creating an empty file when none exists.
    ///
    /// A file that exists but does not decode is fatal: the operator has to
    /// look at it, silently forgetting machines is worse.
    pub async fn load(&self) -> anyhow::Result<BTreeMap<String, Role>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("follow file {} is corrupt", self.path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "creating empty follow file");
                let follows = BTreeMap::new();
                self.write_atomically(&follows)
                    .await
                    .with_context(|| format!("creating follow file {}", self.path.display()))?;
                Ok(follows)
            }
            Err(err) => Err(err).with_context(|| {
                format!("reading follow file {}", self.path.display())
            }),
        }
    }

    /// Rewrites the follow set; a crash mid-write leaves old or new intact.
    pub async fn persist(&self, follows: &BTreeMap<String, Role>) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        self.write_atomically(follows).await.map_err(|err| {
            Error::Daemon(format!(
                "persisting follow file {}: {}",
                self.path.display(),
                err
            ))
        })
    }

    async fn write_atomically(&self, follows: &BTreeMap<String, Role>) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(follows).map_err(io::Error::from)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}
