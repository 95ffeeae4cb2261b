//! Persistent key-value memory for agent scripts.

pub mod db;
