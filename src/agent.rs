use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::Config;
use crate::error::SparkError;
use sparkinsight_payment::client::{JsonRpcClient, ReceiptSource};
use sparkinsight_payment::types::PaymentVerification;
use sparkinsight_payment::verifier::PaymentVerifier;
use sparkinsight_storage::db::{MemoryRecord, MemoryStore, SearchHit};

pub const PAYMENT_KEY_PREFIX: &str = "payment_";
pub const PAYMENT_TAG: &str = "payment";

/// Memory store and payment verifier built once at startup and passed to
/// whatever needs them.
pub struct Agent<S = JsonRpcClient> {
    store: MemoryStore,
    verifier: PaymentVerifier<S>,
}

impl Agent<JsonRpcClient> {
    pub fn from_config(config: &Config) -> Result<Self, SparkError> {
        let store = MemoryStore::open(&config.db_path)?;
        let client = JsonRpcClient::new(&config.rpc_url, config.rpc_timeout());
        info!("Payment verifier using {}", client.url());
        Ok(Self::new(
            store,
            PaymentVerifier::new(client, config.payment_terms()),
        ))
    }
}

impl<S: ReceiptSource> Agent<S> {
    pub fn new(store: MemoryStore, verifier: PaymentVerifier<S>) -> Self {
        Self { store, verifier }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn verifier(&self) -> &PaymentVerifier<S> {
        &self.verifier
    }

    pub fn remember<T: Serialize + ?Sized>(&self, key: &str, value: &T, tags: &[&str]) -> bool {
        self.store.remember(key, value, tags)
    }

    pub fn recall(&self, key: &str) -> Option<Value> {
        self.store.recall(key)
    }

    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        self.store.search(query)
    }

    pub fn forget(&self, key: &str) -> bool {
        self.store.forget(key)
    }

    pub fn list_all(&self) -> Vec<MemoryRecord> {
        self.store.list_all()
    }

    pub fn count(&self) -> usize {
        self.store.count()
    }

    pub fn clear(&self) -> bool {
        self.store.clear()
    }

    pub fn verify_payment(&self, tx_hash: &str, min_amount: f64) -> PaymentVerification {
        self.verifier.verify_payment(tx_hash, min_amount)
    }

    pub fn verify_payment_default(&self, tx_hash: &str) -> PaymentVerification {
        self.verifier.verify_payment_default(tx_hash)
    }

    /// Store a verified payment under `payment_<tx_hash>`. Unverified results
    /// are not recorded.
    pub fn record_payment(&self, result: &PaymentVerification) -> bool {
        let Some(tx_hash) = result.tx_hash.as_deref().filter(|_| result.verified) else {
            return false;
        };
        self.store.remember(
            &format!("{PAYMENT_KEY_PREFIX}{tx_hash}"),
            result,
            &[PAYMENT_TAG],
        )
    }
}
