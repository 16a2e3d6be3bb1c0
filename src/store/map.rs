//! Local replica of the stock map
//!
//! Every member holds a full copy. Mutations only arrive through replicated
//! calls (or a state install), so all members apply the same sequence.

use crate::state::transfer::StateProvider;
use crate::transport::message::{ApplicationError, RpcCall, Value};
use crate::transport::rpc::MutationHandler;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

pub const SET_STOCK: &str = "set_stock";
pub const REMOVE_STOCK: &str = "remove_stock";
pub const COMPARE_AND_SWAP: &str = "compare_and_swap";

#[derive(Default)]
pub struct ReplicatedMapStore {
    stocks: Mutex<HashMap<String, f64>>,
}

impl ReplicatedMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_set(&self, key: &str, value: f64) {
        tracing::info!("set {} to {}", key, value);
        self.stocks.lock().insert(key.to_string(), value);
    }

    /// Removing an absent key is a no-op.
    pub fn local_remove(&self, key: &str) {
        match self.stocks.lock().remove(key) {
            Some(_) => tracing::info!("removed {}", key),
            None => tracing::debug!("remove of absent {}", key),
        }
    }

    /// Replace `key`'s value with `new` if it currently equals `expected`.
    ///
    /// Values compare numerically, so NaN never matches and -0.0 matches 0.0.
    /// An absent key never matches.
    pub fn local_compare_and_swap(&self, key: &str, expected: f64, new: f64) -> bool {
        let mut stocks = self.stocks.lock();
        match stocks.get_mut(key) {
            Some(current) if *current == expected => {
                *current = new;
                drop(stocks);
                tracing::info!("changed {} from {} to {}", key, expected, new);
                true
            }
            Some(current) => {
                let current = *current;
                drop(stocks);
                tracing::info!(
                    "failed changing {} from {} to {}: current value is {}",
                    key,
                    expected,
                    new,
                    current
                );
                false
            }
            None => {
                drop(stocks);
                tracing::info!("failed changing {} from {} to {}: no such stock", key, expected, new);
                false
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.stocks.lock().get(key).copied()
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> BTreeMap<String, f64> {
        self.stocks
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stocks.lock().is_empty()
    }
}

impl MutationHandler for ReplicatedMapStore {
    fn handle(&self, call: &RpcCall) -> Result<Value, ApplicationError> {
        match call.method.as_str() {
            SET_STOCK => {
                call.expect_arity(2)?;
                self.local_set(call.str_arg(0)?, call.f64_arg(1)?);
                Ok(Value::Unit)
            }
            REMOVE_STOCK => {
                call.expect_arity(1)?;
                self.local_remove(call.str_arg(0)?);
                Ok(Value::Unit)
            }
            COMPARE_AND_SWAP => {
                call.expect_arity(3)?;
                let swapped = self.local_compare_and_swap(
                    call.str_arg(0)?,
                    call.f64_arg(1)?,
                    call.f64_arg(2)?,
                );
                Ok(Value::Bool(swapped))
            }
            other => Err(ApplicationError(format!("unknown method {}", other))),
        }
    }
}

impl StateProvider for ReplicatedMapStore {
    fn snapshot_entries(&self) -> BTreeMap<String, f64> {
        self.entries()
    }

    fn install_entries(&self, entries: BTreeMap<String, f64>) {
        *self.stocks.lock() = entries.into_iter().collect();
    }
}
