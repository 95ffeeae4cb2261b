//! On-chain token payment checks against a JSON-RPC node.

pub mod client;
pub mod types;
pub mod verifier;
