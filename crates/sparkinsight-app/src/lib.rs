//! Process bootstrap shared by SPARKInsight binaries.

pub mod logging;
