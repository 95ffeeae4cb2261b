//! Confirms that a transaction paid at least a minimum token amount to our wallet.
//!
//! The receipt is fetched once, no retries. Only the first transfer log to the
//! recipient wallet is considered, even if the transaction contains several.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::ReceiptSource;
use crate::types::{
    topic_address, PaymentTerms, PaymentVerification, ReceiptLog, TransactionReceipt,
    TOKEN_SYMBOL, TRANSFER_EVENT_SIGNATURE,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error("Cannot connect to RPC endpoint")]
    CannotConnect,

    #[error("TX not found or pending")]
    NotFoundOrPending,

    #[error("TX failed or unconfirmed")]
    FailedOrUnconfirmed,

    #[error("Amount ${amount:.2} below minimum ${min_amount:.2}")]
    BelowMinimum { amount: f64, min_amount: f64 },

    #[error("TX not sent to our wallet")]
    NotSentToWallet,

    #[error("Invalid transfer amount: {0}")]
    InvalidAmount(String),
}

impl VerifyError {
    /// Rejections caused by what the transaction did, as opposed to
    /// failing to look it up.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            VerifyError::BelowMinimum { .. }
                | VerifyError::NotSentToWallet
                | VerifyError::InvalidAmount(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPayment {
    pub amount: f64,
    pub from: String,
    pub tx_hash: String,
}

impl From<Result<VerifiedPayment, VerifyError>> for PaymentVerification {
    fn from(outcome: Result<VerifiedPayment, VerifyError>) -> Self {
        match outcome {
            Ok(p) => PaymentVerification {
                verified: true,
                amount: Some(p.amount),
                message: Some(format!("Verified! ${:.2} {TOKEN_SYMBOL} received", p.amount)),
                from: Some(p.from),
                tx_hash: Some(p.tx_hash),
                error: None,
            },
            Err(e) => PaymentVerification {
                verified: false,
                amount: match &e {
                    VerifyError::BelowMinimum { amount, .. } => Some(*amount),
                    _ => None,
                },
                from: None,
                tx_hash: None,
                message: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Raw transfer value from a log's `data` field, scaled down by `decimals`.
pub fn decode_amount(data: &str, decimals: u32) -> Result<f64, VerifyError> {
    let digits = data
        .strip_prefix("0x")
        .or_else(|| data.strip_prefix("0X"))
        .unwrap_or(data);
    if digits.is_empty() {
        return Err(VerifyError::InvalidAmount(format!("empty data {data:?}")));
    }
    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Ok(0.0);
    }
    if significant.len() > 32 {
        return Err(VerifyError::InvalidAmount(format!(
            "value does not fit in 128 bits: {data}"
        )));
    }
    let raw = u128::from_str_radix(significant, 16)
        .map_err(|e| VerifyError::InvalidAmount(format!("{data}: {e}")))?;
    Ok(raw as f64 / 10f64.powi(decimals as i32))
}

/// First transfer log in the receipt whose recipient is the terms' wallet.
pub fn find_transfer<'a>(
    receipt: &'a TransactionReceipt,
    terms: &PaymentTerms,
) -> Option<&'a ReceiptLog> {
    receipt.logs.iter().find(|log| {
        if log.topics.len() < 3 || !log.topics[0].eq_ignore_ascii_case(TRANSFER_EVENT_SIGNATURE) {
            return false;
        }
        if terms.enforce_token_contract {
            let from_token = log
                .address
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(&terms.token_contract));
            if !from_token {
                return false;
            }
        }
        topic_address(&log.topics[2]).eq_ignore_ascii_case(&terms.recipient_wallet)
    })
}

pub struct PaymentVerifier<S> {
    source: S,
    terms: PaymentTerms,
}

impl<S: ReceiptSource> PaymentVerifier<S> {
    pub fn new(source: S, terms: PaymentTerms) -> Self {
        Self { source, terms }
    }

    pub fn terms(&self) -> &PaymentTerms {
        &self.terms
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn check_payment(
        &self,
        tx_hash: &str,
        min_amount: f64,
    ) -> Result<VerifiedPayment, VerifyError> {
        if !self.source.is_connected() {
            return Err(VerifyError::CannotConnect);
        }

        let receipt = match self.source.transaction_receipt(tx_hash) {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return Err(VerifyError::NotFoundOrPending),
            Err(e) => {
                debug!("receipt lookup for {tx_hash} failed: {e}");
                return Err(VerifyError::NotFoundOrPending);
            }
        };

        if !receipt.succeeded() {
            return Err(VerifyError::FailedOrUnconfirmed);
        }

        let log = find_transfer(&receipt, &self.terms).ok_or(VerifyError::NotSentToWallet)?;
        let amount = decode_amount(
            log.data.as_deref().unwrap_or("0x0"),
            self.terms.token_decimals,
        )?;

        if amount >= min_amount {
            Ok(VerifiedPayment {
                amount,
                from: topic_address(&log.topics[1]),
                tx_hash: tx_hash.to_string(),
            })
        } else {
            Err(VerifyError::BelowMinimum { amount, min_amount })
        }
    }

    /// Never fails: every problem comes back as `verified: false` with an `error`.
    pub fn verify_payment(&self, tx_hash: &str, min_amount: f64) -> PaymentVerification {
        let outcome = self.check_payment(tx_hash, min_amount);
        match &outcome {
            Ok(p) => info!("Payment {tx_hash} verified: {} from {}", p.amount, p.from),
            Err(e) if e.is_business_rule() => warn!("Payment {tx_hash} rejected: {e}"),
            Err(e) => warn!("Payment {tx_hash} could not be checked: {e}"),
        }
        outcome.into()
    }

    pub fn verify_payment_default(&self, tx_hash: &str) -> PaymentVerification {
        self.verify_payment(tx_hash, self.terms.min_amount)
    }

    pub fn verify_payment_simple(&self, tx_hash: &str) -> bool {
        self.verify_payment_default(tx_hash).verified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DEV_WALLET, PAYMENT_TOKEN};
    use serde_json::{json, Value};
    use sparkinsight_core::error::SparkError;

    const SENDER_TOPIC: &str =
        "0x0000000000000000000000001111111111111111111111111111111111111111";
    const OTHER_TOPIC: &str =
        "0x0000000000000000000000002222222222222222222222222222222222222222";

    enum Reply {
        Receipt(Value),
        Missing,
        Fail,
    }

    struct FakeSource {
        connected: bool,
        reply: Reply,
    }

    impl ReceiptSource for FakeSource {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn transaction_receipt(
            &self,
            _tx_hash: &str,
        ) -> Result<Option<TransactionReceipt>, SparkError> {
            match &self.reply {
                Reply::Receipt(v) => Ok(Some(serde_json::from_value(v.clone())?)),
                Reply::Missing => Ok(None),
                Reply::Fail => Err(SparkError::Rpc("transaction pending".into())),
            }
        }
    }

    fn wallet_topic() -> String {
        format!("0x000000000000000000000000{}", &DEV_WALLET[2..].to_lowercase())
    }

    fn amount_data(raw: u128) -> String {
        format!("0x{raw:064x}")
    }

    fn transfer_log(to_topic: &str, raw: u128) -> Value {
        json!({
            "address": PAYMENT_TOKEN,
            "topics": [TRANSFER_EVENT_SIGNATURE, SENDER_TOPIC, to_topic],
            "data": amount_data(raw),
        })
    }

    fn receipt(status: &str, logs: Vec<Value>) -> Value {
        json!({"transactionHash": "0xfeed", "status": status, "logs": logs})
    }

    fn verifier(reply: Reply) -> PaymentVerifier<FakeSource> {
        PaymentVerifier::new(
            FakeSource {
                connected: true,
                reply,
            },
            PaymentTerms::default(),
        )
    }

    #[test]
    fn test_exact_minimum_is_verified() {
        let v = verifier(Reply::Receipt(receipt(
            "0x1",
            vec![transfer_log(&wallet_topic(), 1_000_000)],
        )));
        let result = v.verify_payment("0xfeed", 1.0);
        assert!(result.verified);
        assert_eq!(result.amount, Some(1.0));
        assert_eq!(
            result.from.as_deref(),
            Some("0x1111111111111111111111111111111111111111")
        );
        assert_eq!(result.tx_hash.as_deref(), Some("0xfeed"));
        assert_eq!(
            result.message.as_deref(),
            Some("Verified! $1.00 USDC received")
        );
        assert!(result.error.is_none());
    }

    #[test]
    fn test_short_payment_reports_amount() {
        let v = verifier(Reply::Receipt(receipt(
            "0x1",
            vec![transfer_log(&wallet_topic(), 500_000)],
        )));
        let result = v.verify_payment("0xfeed", 1.0);
        assert!(!result.verified);
        assert_eq!(result.amount, Some(0.5));
        assert_eq!(
            result.error.as_deref(),
            Some("Amount $0.50 below minimum $1.00")
        );
    }

    #[test]
    fn test_failed_status_rejected_regardless_of_logs() {
        let v = verifier(Reply::Receipt(receipt(
            "0x0",
            vec![transfer_log(&wallet_topic(), 5_000_000)],
        )));
        let result = v.verify_payment("0xfeed", 1.0);
        assert!(!result.verified);
        assert_eq!(result.error.as_deref(), Some("TX failed or unconfirmed"));
        assert!(result.amount.is_none());
    }

    #[test]
    fn test_not_connected() {
        let v = PaymentVerifier::new(
            FakeSource {
                connected: false,
                reply: Reply::Missing,
            },
            PaymentTerms::default(),
        );
        assert_eq!(
            v.check_payment("0xfeed", 1.0),
            Err(VerifyError::CannotConnect)
        );
        assert!(!v.verify_payment_simple("0xfeed"));
    }

    #[test]
    fn test_missing_or_erroring_receipt_is_not_found() {
        for reply in [Reply::Missing, Reply::Fail] {
            let v = verifier(reply);
            let result = v.verify_payment("0xfeed", 1.0);
            assert!(!result.verified);
            assert_eq!(result.error.as_deref(), Some("TX not found or pending"));
        }
    }

    #[test]
    fn test_other_recipient_is_not_ours() {
        let v = verifier(Reply::Receipt(receipt(
            "0x1",
            vec![transfer_log(OTHER_TOPIC, 9_000_000)],
        )));
        let err = v.check_payment("0xfeed", 1.0).unwrap_err();
        assert_eq!(err, VerifyError::NotSentToWallet);
        assert!(err.is_business_rule());
        assert_eq!(err.to_string(), "TX not sent to our wallet");
    }

    #[test]
    fn test_logs_with_too_few_topics_or_other_events_are_skipped() {
        let approval = json!({
            "address": PAYMENT_TOKEN,
            "topics": [
                "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925",
                SENDER_TOPIC,
                wallet_topic(),
            ],
            "data": amount_data(9_000_000),
        });
        let short = json!({
            "address": PAYMENT_TOKEN,
            "topics": [TRANSFER_EVENT_SIGNATURE, SENDER_TOPIC],
            "data": amount_data(9_000_000),
        });
        let v = verifier(Reply::Receipt(receipt("0x1", vec![approval, short])));
        assert_eq!(
            v.check_payment("0xfeed", 1.0),
            Err(VerifyError::NotSentToWallet)
        );
    }

    #[test]
    fn test_first_matching_log_wins() {
        let v = verifier(Reply::Receipt(receipt(
            "0x1",
            vec![
                transfer_log(OTHER_TOPIC, 7_000_000),
                transfer_log(&wallet_topic(), 250_000),
                transfer_log(&wallet_topic(), 3_000_000),
            ],
        )));
        let err = v.check_payment("0xfeed", 1.0).unwrap_err();
        assert_eq!(
            err,
            VerifyError::BelowMinimum {
                amount: 0.25,
                min_amount: 1.0
            }
        );
    }

    #[test]
    fn test_recipient_comparison_ignores_case() {
        let upper = format!("0x000000000000000000000000{}", &DEV_WALLET[2..].to_uppercase());
        let v = verifier(Reply::Receipt(receipt(
            "0x1",
            vec![transfer_log(&upper, 2_000_000)],
        )));
        assert!(v.verify_payment_simple("0xfeed"));
    }

    #[test]
    fn test_enforce_token_contract_skips_foreign_tokens() {
        let mut foreign = transfer_log(&wallet_topic(), 2_000_000);
        foreign["address"] = json!("0x0000000000000000000000000000000000000bad");
        let reply = || Reply::Receipt(receipt("0x1", vec![foreign.clone()]));

        assert!(verifier(reply()).verify_payment_simple("0xfeed"));

        let strict = PaymentVerifier::new(
            FakeSource {
                connected: true,
                reply: reply(),
            },
            PaymentTerms {
                enforce_token_contract: true,
                ..PaymentTerms::default()
            },
        );
        assert_eq!(
            strict.check_payment("0xfeed", 1.0),
            Err(VerifyError::NotSentToWallet)
        );
    }

    #[test]
    fn test_verify_payment_default_uses_terms_minimum() {
        let reply = || {
            Reply::Receipt(receipt(
                "0x1",
                vec![transfer_log(&wallet_topic(), 1_500_000)],
            ))
        };
        assert!(verifier(reply()).verify_payment_default("0xfeed").verified);

        let pricey = PaymentVerifier::new(
            FakeSource {
                connected: true,
                reply: reply(),
            },
            PaymentTerms {
                min_amount: 2.0,
                ..PaymentTerms::default()
            },
        );
        let result = pricey.verify_payment_default("0xfeed");
        assert!(!result.verified);
        assert_eq!(result.amount, Some(1.5));
    }

    #[test]
    fn test_decode_amount() {
        assert_eq!(decode_amount(&amount_data(1_000_000), 6).unwrap(), 1.0);
        assert_eq!(decode_amount("0x0f4240", 6).unwrap(), 1.0);
        assert_eq!(decode_amount("0x0", 6).unwrap(), 0.0);
        assert_eq!(decode_amount("0x64", 2).unwrap(), 1.0);
        assert!(decode_amount("0x", 6).is_err());
        assert!(decode_amount("0xnothex", 6).is_err());
        let too_big = format!("0x1{}", "0".repeat(32));
        assert!(decode_amount(&too_big, 6).is_err());
    }

    #[test]
    fn test_missing_data_counts_as_zero() {
        let log = json!({
            "address": PAYMENT_TOKEN,
            "topics": [TRANSFER_EVENT_SIGNATURE, SENDER_TOPIC, wallet_topic()],
        });
        let v = verifier(Reply::Receipt(receipt("0x1", vec![log])));
        let result = v.verify_payment("0xfeed", 1.0);
        assert!(!result.verified);
        assert_eq!(result.amount, Some(0.0));
    }

    #[test]
    fn test_connectivity_errors_are_not_business_rules() {
        assert!(!VerifyError::CannotConnect.is_business_rule());
        assert!(!VerifyError::NotFoundOrPending.is_business_rule());
        assert!(!VerifyError::FailedOrUnconfirmed.is_business_rule());
    }
}
