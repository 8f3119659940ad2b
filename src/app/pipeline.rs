//! User pipelines
//!
//! A pipeline is a user callable bound to one input topic. It receives
//! rows in offset order and a [`ProcessingContext`] through which all of
//! its effects flow: emitted output goes to the shared row producer, and
//! state access goes to the store transaction open for the source
//! partition. State handles are bound to a single sub-store prefix, so
//! cross-prefix access is impossible by construction.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SerializationError};
use crate::model::{Header, Row, RowValue};
use crate::producer::RowProducer;
use crate::state::{StateStoreManager, StoreTransaction, DEFAULT_STORE_NAME, PREFIX_DEFAULT};
use crate::topics::Topic;

/// A transform bound to one input topic
pub trait Pipeline: Send {
    /// Process one row. Returning an error aborts the current checkpoint
    /// and surfaces per the configured error policy.
    fn process(&mut self, row: Row, ctx: &mut ProcessingContext<'_>) -> Result<()>;
}

impl<F> Pipeline for F
where
    F: FnMut(Row, &mut ProcessingContext<'_>) -> Result<()> + Send,
{
    fn process(&mut self, row: Row, ctx: &mut ProcessingContext<'_>) -> Result<()> {
        self(row, ctx)
    }
}

/// Effect surface handed to a pipeline invocation
pub struct ProcessingContext<'a> {
    pub(crate) topic: &'a str,
    pub(crate) partition: i32,
    pub(crate) producer: &'a Arc<RowProducer>,
    pub(crate) state_manager: &'a StateStoreManager,
    pub(crate) transactions: &'a mut HashMap<String, StoreTransaction>,
}

impl ProcessingContext<'_> {
    /// Source partition of the row being processed.
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Emit an output row to a topic via the shared producer.
    pub fn emit(&mut self, topic: &Topic, key: Option<Bytes>, value: &RowValue) -> Result<()> {
        self.emit_with(topic, key, value, Vec::new(), None, None)
    }

    /// Emit with explicit headers, partition, or timestamp.
    pub fn emit_with(
        &mut self,
        topic: &Topic,
        key: Option<Bytes>,
        value: &RowValue,
        headers: Vec<Header>,
        partition: Option<i32>,
        timestamp: Option<i64>,
    ) -> Result<()> {
        self.producer
            .produce(topic, key, value, headers, partition, timestamp)?;
        Ok(())
    }

    /// The default store, scoped to this partition's open transaction.
    pub fn state(&mut self) -> Result<StateHandle<'_>> {
        self.state_store(DEFAULT_STORE_NAME)
    }

    /// A named store, scoped to this partition's open transaction.
    pub fn state_store(&mut self, store_name: &str) -> Result<StateHandle<'_>> {
        self.state_with_prefix(store_name, PREFIX_DEFAULT)
    }

    /// A named store under a reserved sub-store prefix. Stateful operators
    /// that multiplex several keyspaces onto one changelog (window values
    /// vs. expiry indexes) reserve disjoint prefixes here.
    pub fn state_with_prefix(&mut self, store_name: &str, prefix: u8) -> Result<StateHandle<'_>> {
        let txn = match self.transactions.entry(store_name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let txn = self.state_manager.start_transaction(
                    self.topic,
                    store_name,
                    self.partition,
                )?;
                entry.insert(txn)
            }
        };
        Ok(StateHandle { txn, prefix })
    }
}

/// Typed view over one sub-store of an open transaction
pub struct StateHandle<'a> {
    txn: &'a mut StoreTransaction,
    prefix: u8,
}

impl StateHandle<'_> {
    /// Read and JSON-decode a value.
    pub fn get<V: DeserializeOwned>(&mut self, key: &[u8]) -> Result<Option<V>> {
        match self.txn.get(self.prefix, key)? {
            Some(bytes) => {
                let value =
                    serde_json::from_slice(&bytes).map_err(SerializationError::Json)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// JSON-encode and buffer a value.
    pub fn set<V: Serialize>(&mut self, key: &[u8], value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(SerializationError::Json)?;
        self.txn.set(self.prefix, key, Bytes::from(bytes))?;
        Ok(())
    }

    /// Buffer a tombstone.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.txn.delete(self.prefix, key)?;
        Ok(())
    }

    /// Raw-bytes read, bypassing JSON.
    pub fn get_bytes(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.txn.get(self.prefix, key)?)
    }

    /// Raw-bytes write, bypassing JSON.
    pub fn set_bytes(&mut self, key: &[u8], value: Bytes) -> Result<()> {
        self.txn.set(self.prefix, key, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStoreManager;

    fn context_fixture() -> (StateStoreManager, Arc<RowProducer>) {
        let broker = crate::broker::InMemoryBroker::new();
        let producer = Arc::new(RowProducer::new(Arc::new(broker.producer()), 16));
        let mut manager = StateStoreManager::new(None, None, false);
        manager.register_store("words", DEFAULT_STORE_NAME, None);
        manager.on_partition_assign("words", 0).unwrap();
        (manager, producer)
    }

    #[test]
    fn test_state_handle_typed_round_trip() {
        let (manager, producer) = context_fixture();
        let mut transactions = HashMap::new();
        let mut ctx = ProcessingContext {
            topic: "words",
            partition: 0,
            producer: &producer,
            state_manager: &manager,
            transactions: &mut transactions,
        };

        let mut state = ctx.state().unwrap();
        assert_eq!(state.get::<u64>(b"a").unwrap(), None);
        state.set(b"a", &4_u64).unwrap();
        assert_eq!(state.get::<u64>(b"a").unwrap(), Some(4));

        // The transaction is created once and reused.
        assert_eq!(transactions.len(), 1);
    }

    #[test]
    fn test_prefixes_are_disjoint() {
        let (manager, producer) = context_fixture();
        let mut transactions = HashMap::new();
        let mut ctx = ProcessingContext {
            topic: "words",
            partition: 0,
            producer: &producer,
            state_manager: &manager,
            transactions: &mut transactions,
        };

        ctx.state_with_prefix(DEFAULT_STORE_NAME, 0x00)
            .unwrap()
            .set(b"k", &1_u32)
            .unwrap();
        let got: Option<u32> = ctx
            .state_with_prefix(DEFAULT_STORE_NAME, 0x01)
            .unwrap()
            .get(b"k")
            .unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn test_closure_is_a_pipeline() {
        fn assert_pipeline<P: Pipeline>(_p: &P) {}
        let pipeline =
            |_row: Row, _ctx: &mut ProcessingContext<'_>| -> crate::error::Result<()> { Ok(()) };
        assert_pipeline(&pipeline);
    }
}
