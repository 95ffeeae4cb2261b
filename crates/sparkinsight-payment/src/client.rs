use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::types::TransactionReceipt;
use sparkinsight_core::error::SparkError;

/// Where the verifier gets receipts from.
pub trait ReceiptSource {
    fn is_connected(&self) -> bool;

    /// `Ok(None)` when the node does not know the transaction (yet).
    fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, SparkError>;
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

fn decode_response<T: DeserializeOwned>(resp: RpcResponse) -> Result<Option<T>, SparkError> {
    if let Some(err) = resp.error {
        return Err(SparkError::Rpc(format!(
            "{} (code {})",
            err.message, err.code
        )));
    }
    match resp.result {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
    }
}

/// Blocking Ethereum JSON-RPC client over HTTP(S).
///
/// The underlying HTTP client is built on the first call, so a handle that
/// never talks to the node costs nothing.
pub struct JsonRpcClient {
    url: String,
    timeout: Option<Duration>,
    client: OnceLock<reqwest::blocking::Client>,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    /// `timeout` of `None` waits on the node indefinitely.
    pub fn new(url: &str, timeout: Option<Duration>) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            client: OnceLock::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn http(&self) -> Result<&reqwest::blocking::Client, SparkError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        Ok(self.client.get_or_init(|| built))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, SparkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let resp: RpcResponse = self
            .http()?
            .post(&self.url)
            .json(&body)
            .send()?
            .error_for_status()?
            .json()?;
        decode_response(resp)
    }
}

impl ReceiptSource for JsonRpcClient {
    fn is_connected(&self) -> bool {
        match self.call::<Value>("web3_clientVersion", json!([])) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("RPC endpoint {} unreachable: {e}", self.url);
                false
            }
        }
    }

    fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, SparkError> {
        self.call("eth_getTransactionReceipt", json!([tx_hash]))
    }
}
