use serde::{Deserialize, Serialize};

/// Wallet that payments must be sent to.
pub const DEV_WALLET: &str = "0xEE2B6C840105079874d5980962e874810d05734B";
/// USDC on Base.
pub const PAYMENT_TOKEN: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";
pub const TOKEN_SYMBOL: &str = "USDC";
pub const TOKEN_DECIMALS: u32 = 6;
pub const PAYMENT_AMOUNT: f64 = 1.0;
pub const DEFAULT_RPC_URL: &str = "https://base.publicnode.com";
/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_EVENT_SIGNATURE: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// `0x` followed by exactly 40 hex digits.
pub fn is_hex_address(s: &str) -> bool {
    let Some(body) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) else {
        return false;
    };
    body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit())
}

/// Address packed into a 32-byte topic: `0x` plus its last 40 hex digits.
pub fn topic_address(topic: &str) -> String {
    let tail = topic
        .get(topic.len().saturating_sub(40)..)
        .unwrap_or(topic);
    format!("0x{tail}")
}

/// Subset of `eth_getTransactionReceipt` the verifier looks at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub logs: Vec<ReceiptLog>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptLog {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: Option<String>,
}

impl TransactionReceipt {
    /// True only for an explicit status of 1.
    pub fn succeeded(&self) -> bool {
        self.status
            .as_deref()
            .and_then(parse_quantity)
            .is_some_and(|s| s == 1)
    }
}

fn parse_quantity(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

/// Who receives payments, in which token, and how much is enough.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentTerms {
    pub recipient_wallet: String,
    pub token_contract: String,
    pub token_decimals: u32,
    pub min_amount: f64,
    /// Skip transfer logs emitted by any contract other than `token_contract`.
    pub enforce_token_contract: bool,
}

impl Default for PaymentTerms {
    fn default() -> Self {
        Self {
            recipient_wallet: DEV_WALLET.to_string(),
            token_contract: PAYMENT_TOKEN.to_string(),
            token_decimals: TOKEN_DECIMALS,
            min_amount: PAYMENT_AMOUNT,
            enforce_token_contract: false,
        }
    }
}

/// Outcome of a payment check as handed back to callers.
///
/// On success `verified` is true and `amount`, `from`, `tx_hash` and `message`
/// are set. On failure `error` explains why; `amount` is still reported when
/// a transfer was found but fell short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
