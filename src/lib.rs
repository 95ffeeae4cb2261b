pub mod agent;
pub mod config;

pub use sparkinsight_app::logging;
pub use sparkinsight_core::error;
pub use sparkinsight_core::text;
pub use sparkinsight_payment::client;
pub use sparkinsight_payment::types as payment_types;
pub use sparkinsight_payment::verifier;
pub use sparkinsight_storage::db;
