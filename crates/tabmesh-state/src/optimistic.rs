//! Two-phase optimistic apply
//!
//! A local write is applied at once as a tentative operation holding a
//! snapshot of the value it replaced. The operation later commits or rolls
//! back. Rolling back restores the snapshot beneath any later operations on
//! the same key, so their values stay applied in order.

use std::collections::{HashMap, VecDeque};

use crate::{StateError, StateResult};

/// Settled operation ids remembered for status queries
const HISTORY_LIMIT: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpStatus {
    Tentative,
    Committed,
    RolledBack,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingOp<V> {
    pub id: String,
    pub key: String,
    pub value: V,
    /// Value beneath this operation
    pub previous: Option<V>,
    pub status: OpStatus,
}

#[derive(Clone, Debug)]
pub struct OptimisticStore<V> {
    values: HashMap<String, V>,
    /// Live operations in apply order
    ops: Vec<PendingOp<V>>,
    history: VecDeque<(String, OpStatus)>,
}

impl<V> Default for OptimisticStore<V> {
    fn default() -> Self {
        OptimisticStore {
            values: HashMap::new(),
            ops: Vec::new(),
            history: VecDeque::new(),
        }
    }
}

impl<V: Clone> OptimisticStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visible value, tentative writes included
    pub fn get(&self, key: &str) -> Option<&V> {
        self.values.get(key)
    }

    pub fn status(&self, op_id: &str) -> Option<OpStatus> {
        self.ops
            .iter()
            .find(|op| op.id == op_id)
            .map(|op| op.status)
            .or_else(|| {
                self.history
                    .iter()
                    .find(|(id, _)| id == op_id)
                    .map(|(_, status)| *status)
            })
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingOp<V>> {
        self.ops.iter().filter(|op| op.status == OpStatus::Tentative)
    }

    pub fn has_pending(&self, key: &str) -> bool {
        self.pending().any(|op| op.key == key)
    }

    /// Key an operation writes
    pub fn key_of(&self, op_id: &str) -> Option<&str> {
        self.ops
            .iter()
            .find(|op| op.id == op_id)
            .map(|op| op.key.as_str())
    }

    /// Apply `value` to `key` now, pending confirmation
    pub fn apply_tentative(&mut self, op_id: &str, key: &str, value: V) -> StateResult<()> {
        if self.status(op_id).is_some() {
            return Err(StateError::DuplicateOp(op_id.to_string()));
        }
        let previous = self.values.insert(key.to_string(), value.clone());
        self.ops.push(PendingOp {
            id: op_id.to_string(),
            key: key.to_string(),
            value,
            previous,
            status: OpStatus::Tentative,
        });
        Ok(())
    }

    pub fn confirm(&mut self, op_id: &str) -> StateResult<()> {
        let index = self.tentative_index(op_id)?;
        self.ops[index].status = OpStatus::Committed;
        self.prune();
        Ok(())
    }

    /// Undo a tentative operation; returns the key's visible value afterwards
    pub fn reject(&mut self, op_id: &str) -> StateResult<Option<V>> {
        let index = self.tentative_index(op_id)?;
        self.ops[index].status = OpStatus::RolledBack;
        let key = self.ops[index].key.clone();
        let snapshot = self.ops[index].previous.clone();

        let successor = self.ops[index + 1..]
            .iter_mut()
            .find(|op| op.key == key && op.status != OpStatus::RolledBack);
        match successor {
            // Later writes stay visible; only what lies beneath them changes
            Some(next) => next.previous = snapshot,
            None => match snapshot {
                Some(value) => {
                    self.values.insert(key.clone(), value);
                }
                None => {
                    self.values.remove(&key);
                }
            },
        }
        self.prune();
        Ok(self.values.get(&key).cloned())
    }

    /// Install an authoritative value for `key`
    ///
    /// With operations pending on `key` the value becomes their base and the
    /// tentative value stays visible.
    pub fn rebase(&mut self, key: &str, value: V) {
        let first = self
            .ops
            .iter_mut()
            .find(|op| op.key == key && op.status != OpStatus::RolledBack);
        match first {
            Some(op) => op.previous = Some(value),
            None => {
                self.values.insert(key.to_string(), value);
            }
        }
    }

    fn tentative_index(&self, op_id: &str) -> StateResult<usize> {
        match self.ops.iter().position(|op| op.id == op_id) {
            Some(index) if self.ops[index].status == OpStatus::Tentative => Ok(index),
            Some(_) => Err(StateError::AlreadySettled(op_id.to_string())),
            None if self.status(op_id).is_some() => {
                Err(StateError::AlreadySettled(op_id.to_string()))
            }
            None => Err(StateError::UnknownOp(op_id.to_string())),
        }
    }

    /// Drop operations nothing earlier can undo
    fn prune(&mut self) {
        let mut kept = Vec::with_capacity(self.ops.len());
        for op in self.ops.drain(..) {
            let blocked = kept
                .iter()
                .any(|earlier: &PendingOp<V>| earlier.key == op.key && earlier.status == OpStatus::Tentative);
            let keep = match op.status {
                OpStatus::Tentative => true,
                OpStatus::Committed => blocked,
                OpStatus::RolledBack => false,
            };
            if keep {
                kept.push(op);
            } else {
                self.history.push_back((op.id, op.status));
            }
        }
        self.ops = kept;
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}
