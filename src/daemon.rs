//! The daemon context and the role engine.
//!
//! One [`Daemon`] owns the machine registry, the follow store and a handle
//! on the storage/pub-sub backend. Machines enter the registry through
//! `new` (writer), lazy adoption (reader) or startup replay, and from then
//! on every state transition goes through the per-entry lock. The handle is
//! cheap to clone; dispatch tasks and the poller each carry one.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::follow::FollowStore;
use crate::ipfs::{Ipfs, Message, Subscription};
use crate::lang::Value;
use crate::machine::{advance_state, Machine, MachineId, Polling, Role};
use crate::poller;
use crate::registry::Registry;

/// Point-in-time view of one cached machine, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    pub id: String,
    pub role: Role,
    pub history_len: usize,
    pub last_index: Option<String>,
}

#[derive(Clone)]
pub struct Daemon {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    ipfs: Arc<dyn Ipfs>,
    registry: Registry,
    follows: FollowStore,
    /// Per-subscription dispatch tasks, aborted on drain.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    pub fn new(config: Arc<Config>, ipfs: Arc<dyn Ipfs>) -> Self {
        let follows = FollowStore::new(config.follow_file_path());
        Self {
            inner: Arc::new(Inner {
                config,
                ipfs,
                registry: Registry::new(),
                follows,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Rebuilds the registry from the follow file and current storage.
    ///
    /// Any failure here is fatal: a daemon that silently dropped part of its
    /// follow set would stop replicating machines its operator relies on.
    pub async fn restore(&self) -> anyhow::Result<()> {
        let follows = self.inner.follows.load().await?;
        for (id, role) in &follows {
            let id = MachineId::new(id.clone());
            let result = match role {
                Role::Writer => self.init_as_writer(id.clone()).await,
                Role::Reader => self.init_as_reader(id.clone()).await,
            };
            result.map_err(|err| anyhow::anyhow!("replaying machine {}: {}", id, err))?;
        }
        self.persist_follows().await?;
        info!(count = follows.len(), "follow set restored");
        Ok(())
    }

    /// Creates a fresh machine owned by this daemon.
    pub async fn new_machine(&self) -> Result<MachineId, Error> {
        let id = MachineId::generate();
        self.init_as_writer(id.clone()).await?;
        self.persist_follows().await?;
        info!(%id, "created machine");
        Ok(id)
    }

    /// Appends inputs to a machine.
    ///
    /// On a writer this is a direct log append; on a reader the inputs are
    /// relayed to the writer and the call resolves when the writer's
    /// acknowledgement comes back (or times out). An unknown id is adopted
    /// as a reader first.
    pub async fn send(&self, id: &MachineId, inputs: Vec<Value>) -> Result<Vec<Value>, Error> {
        self.ensure_loaded(id).await?;
        let (role, subscription) = self
            .inner
            .registry
            .with(id, |m| (m.role, m.subscription.clone()))
            .await?;
        match role {
            Role::Writer => self.write_inputs(id, inputs, None).await,
            Role::Reader => self.request_remote_write(id, subscription, inputs).await,
        }
    }

    /// Evaluates an expression against a machine's current state.
    ///
    /// Readers refresh from storage first to keep staleness down. The
    /// expression runs on a throwaway copy of the state; queries never
    /// commit anything.
    pub async fn query(&self, id: &MachineId, expr: &Value) -> Result<Value, Error> {
        self.ensure_loaded(id).await?;
        if self.inner.registry.with(id, |m| m.role).await? == Role::Reader {
            self.refresh_as_reader(id).await?;
        }
        let state = self.inner.registry.with(id, |m| m.state.clone()).await?;
        let result = state.query(expr)?;
        Ok(result)
    }

    /// Peeks at a cached machine without touching storage.
    ///
    /// Unlike `query` this never adopts or refreshes, so it reports the
    /// cache exactly as it stands.
    pub async fn status(&self, id: &MachineId) -> Result<MachineStatus, Error> {
        self.inner
            .registry
            .with(id, |m| MachineStatus {
                id: m.id.to_string(),
                role: m.role,
                history_len: m.history.len(),
                last_index: m.last_index.as_ref().map(|i| i.to_string()),
            })
            .await
    }

    /// Pulls the unseen log suffix into a reader and re-arms the
    /// high-frequency window.
    pub async fn refresh_as_reader(&self, id: &MachineId) -> Result<(), Error> {
        let mut machine = self.inner.registry.lock(id).await?;
        self.refresh_locked(&mut machine).await?;
        machine.polling = Polling::HighFreq {
            remaining: self.inner.config.high_freq_window_secs,
        };
        Ok(())
    }

    /// One poller pass over the registry; writers are skipped.
    pub async fn poll_readers(&self) {
        for id in self.inner.registry.ids().await {
            if let Err(err) = self.poll_one(&id).await {
                warn!(%id, "poll refresh failed: {}", err);
            }
        }
    }

    /// Waits out in-flight per-machine operations and stops dispatch tasks.
    pub async fn drain(&self) {
        for id in self.inner.registry.ids().await {
            let _ = self.inner.registry.with(&id, |_| ()).await;
        }
        let tasks = {
            let mut tasks = self.inner.tasks.lock().expect("task list poisoned");
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
    }

    /// Loads an unknown machine as a reader; a lost adoption race counts as
    /// loaded.
    async fn ensure_loaded(&self, id: &MachineId) -> Result<(), Error> {
        if self.inner.registry.contains(id).await {
            return Ok(());
        }
        match self.init_as_reader(id.clone()).await {
            Ok(()) => {
                self.persist_follows().await?;
                info!(%id, "adopted machine as reader");
                Ok(())
            }
            Err(Error::MachineAlreadyCached(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Fetches the whole log, folds it, subscribes, and caches the machine.
    async fn load_machine(&self, role: Role, id: MachineId) -> Result<Subscription, Error> {
        let (end_index, inputs) = self.inner.ipfs.read_log_from(&id, None).await?;
        let subscription = self.inner.ipfs.subscribe(&id).await?;
        let mut machine = Machine::new(
            id,
            role,
            subscription.clone(),
            self.inner.config.high_freq_window_secs,
        );
        machine.advance(&inputs)?;
        machine.last_index = end_index;
        debug!(id = %machine.id, ?role, inputs = machine.history.len(), "loaded machine");
        self.inner.registry.insert_new(machine).await?;
        Ok(subscription)
    }

    async fn init_as_reader(&self, id: MachineId) -> Result<(), Error> {
        let subscription = self.load_machine(Role::Reader, id.clone()).await?;
        let daemon = self.clone();
        let mut watch = subscription.watch();
        let handle = tokio::spawn(async move {
            while let Some(msg) = watch.recv().await {
                if let Message::New { .. } = msg {
                    if let Err(err) = daemon.refresh_as_reader(&id).await {
                        warn!(%id, "refresh after notification failed: {}", err);
                    }
                }
            }
        });
        self.track_task(handle);
        Ok(())
    }

    async fn init_as_writer(&self, id: MachineId) -> Result<(), Error> {
        let subscription = self.load_machine(Role::Writer, id.clone()).await?;
        let daemon = self.clone();
        let mut watch = subscription.watch();
        let handle = tokio::spawn(async move {
            while let Some(msg) = watch.recv().await {
                if let Message::Req { expressions, nonce } = msg {
                    // Handler errors must not tear down the subscription;
                    // the requester learns about them through its timeout.
                    if let Err(err) = daemon.write_inputs(&id, expressions, Some(nonce)).await {
                        warn!(%id, "remote append rejected: {}", err);
                    }
                }
            }
        });
        self.track_task(handle);
        Ok(())
    }

    /// Writer-side append: advance, write to storage, publish, commit.
    ///
    /// The log write is the commit point. A failed advance or storage write
    /// leaves the machine untouched; a failed publish is only a lost
    /// notification, which readers recover from by polling.
    pub(crate) async fn write_inputs(
        &self,
        id: &MachineId,
        inputs: Vec<Value>,
        nonce: Option<String>,
    ) -> Result<Vec<Value>, Error> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let mut machine = self.inner.registry.lock(id).await?;
        if machine.role != Role::Writer {
            return Err(Error::Daemon(format!(
                "append to machine `{}` which we only read",
                id
            )));
        }
        let (state, results) = advance_state(&machine.state, &inputs)?;
        let index = self.inner.ipfs.write_log(&machine.id, &inputs).await?;
        let message = Message::New {
            results: results.clone(),
            nonce,
        };
        if let Err(err) = self.inner.ipfs.publish(&machine.id, &message).await {
            warn!(id = %machine.id, "publish after append failed: {}", err);
        }
        machine.state = state;
        machine
            .history
            .extend(inputs.into_iter().zip(results.iter().cloned()));
        machine.last_index = Some(index);
        machine.last_updated = Instant::now();
        Ok(results)
    }

    /// Reader-side append: relay to the writer and wait for the matching
    /// acknowledgement.
    async fn request_remote_write(
        &self,
        id: &MachineId,
        subscription: Subscription,
        inputs: Vec<Value>,
    ) -> Result<Vec<Value>, Error> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let nonce = fresh_nonce();
        // The receiver exists before the request goes out, so the
        // acknowledgement cannot slip past us.
        let mut watch = subscription.watch();
        self.inner
            .ipfs
            .publish(
                id,
                &Message::Req {
                    expressions: inputs,
                    nonce: nonce.clone(),
                },
            )
            .await?;
        let deadline = tokio::time::Instant::now() + self.inner.config.ack_timeout();
        loop {
            let next = tokio::time::timeout_at(deadline, watch.recv())
                .await
                .map_err(|_| Error::AckTimeout)?;
            match next {
                Some(Message::New {
                    results,
                    nonce: Some(got),
                }) if got == nonce => return Ok(results),
                Some(_) => continue,
                None => {
                    return Err(Error::Daemon(format!(
                        "subscription for machine `{}` closed while waiting for an ack",
                        id
                    )))
                }
            }
        }
    }

    async fn refresh_locked(&self, machine: &mut Machine) -> Result<(), Error> {
        let (index, inputs) = self
            .inner
            .ipfs
            .read_log_from(&machine.id, machine.last_index.as_ref())
            .await?;
        machine.advance(&inputs)?;
        machine.last_index = index;
        machine.last_updated = Instant::now();
        Ok(())
    }

    async fn poll_one(&self, id: &MachineId) -> Result<(), Error> {
        let mut machine = self.inner.registry.lock(id).await?;
        if machine.role == Role::Writer {
            return Ok(());
        }
        let delta = machine.last_updated.elapsed().as_secs() as i64;
        let (refresh, next) = poller::next_polling(machine.polling, delta);
        if refresh {
            self.refresh_locked(&mut machine).await?;
        }
        machine.polling = next;
        Ok(())
    }

    async fn persist_follows(&self) -> Result<(), Error> {
        let roles = self.inner.registry.roles().await;
        self.inner.follows.persist(&roles).await
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .expect("task list poisoned")
            .push(handle);
    }
}

/// 128 bits of nonce, plenty to never collide within an ack window.
fn fresh_nonce() -> String {
    let raw: u128 = rand::thread_rng().gen();
    format!("{:032x}", raw)
}
