//! A machine: one append-only log and the state folded out of it.

use std::fmt;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ipfs::{Index, Subscription};
use crate::lang::{State, Value};

/// Name of a machine; doubles as its topic name and storage log key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(String);

impl MachineId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mints a fresh id for a machine created on this daemon.
    pub fn generate() -> Self {
        let raw: u128 = rand::thread_rng().gen();
        Self(format!("{:032x}", raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// This daemon's posture toward a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// We observe the log; appends happen elsewhere.
    Reader,
    /// We own the log; every append goes through this daemon.
    Writer,
}

/// Polling posture of a reader.
///
/// After a pub/sub event the subscription is known live, so storage polls
/// pause for a high-frequency window; once the window runs out the reader
/// falls back to refreshing every poller tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polling {
    HighFreq { remaining: i64 },
    LowFreq,
}

/// Cached state of one machine.
///
/// Lives behind the registry's per-entry lock; all mutation happens with the
/// lock held.
#[derive(Debug)]
pub struct Machine {
    pub id: MachineId,
    pub state: State,
    /// Applied `(input, result)` pairs, in log order.
    pub history: Vec<(Value, Value)>,
    /// Storage cursor of the final history entry; `None` iff the log is empty.
    pub last_index: Option<Index>,
    pub role: Role,
    pub subscription: Subscription,
    pub last_updated: Instant,
    pub polling: Polling,
}

impl Machine {
    pub fn new(id: MachineId, role: Role, subscription: Subscription, window_secs: i64) -> Self {
        Self {
            id,
            state: State::new(),
            history: Vec::new(),
            last_index: None,
            role,
            subscription,
            last_updated: Instant::now(),
            polling: Polling::HighFreq {
                remaining: window_secs,
            },
        }
    }

    /// Folds `inputs` into the machine.
    ///
    /// The fold is staged on a clone of the evaluator state; when any input
    /// is rejected nothing at all changes and the error surfaces as
    /// `InvalidInput`.
    pub fn advance(&mut self, inputs: &[Value]) -> Result<Vec<Value>, Error> {
        let (state, results) = advance_state(&self.state, inputs)?;
        self.state = state;
        self.history
            .extend(inputs.iter().cloned().zip(results.iter().cloned()));
        Ok(results)
    }
}

/// Pure half of [`Machine::advance`]: fold without committing.
pub fn advance_state(state: &State, inputs: &[Value]) -> Result<(State, Vec<Value>), Error> {
    let mut next = state.clone();
    let mut results = Vec::with_capacity(inputs.len());
    for input in inputs {
        results.push(next.apply(input)?);
    }
    Ok((next, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipfs::{Ipfs, MemIpfs};
    use crate::lang::parse;

    async fn test_machine(role: Role) -> Machine {
        let id = MachineId::new("m");
        let subscription = MemIpfs::new().subscribe(&id).await.unwrap();
        Machine::new(id, role, subscription, 10)
    }

    #[test]
    fn generated_ids_are_fresh() {
        let a = MachineId::generate();
        let b = MachineId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn role_round_trips_through_json() {
        for role in [Role::Reader, Role::Writer] {
            let j = serde_json::to_string(&role).unwrap();
            assert_eq!(serde_json::from_str::<Role>(&j).unwrap(), role);
        }
        assert!(serde_json::from_str::<Role>("\"Owner\"").is_err());
    }

    #[tokio::test]
    async fn advance_records_history_in_order() {
        let mut machine = test_machine(Role::Writer).await;
        let inputs = vec![parse("(def x 2)").unwrap(), parse("(+ x 1)").unwrap()];
        let results = machine.advance(&inputs).unwrap();
        assert_eq!(results, vec![Value::Num(2), Value::Num(3)]);
        assert_eq!(machine.history.len(), 2);
        assert_eq!(machine.history[1].0, inputs[1]);
        assert_eq!(machine.history[1].1, Value::Num(3));
    }

    #[tokio::test]
    async fn advance_commits_nothing_on_error() {
        let mut machine = test_machine(Role::Reader).await;
        machine.advance(&[Value::Num(1)]).unwrap();
        let bad = vec![Value::Num(2), parse("(boom)").unwrap()];
        assert!(machine.advance(&bad).is_err());
        assert_eq!(machine.history.len(), 1);
        assert_eq!(
            machine.state.query(&parse("(count history)").unwrap()).unwrap(),
            Value::Num(1)
        );
    }
}
