//! Shared error type and helpers for SPARKInsight.

pub mod error;
pub mod text;
