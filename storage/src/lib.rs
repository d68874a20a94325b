pub mod extension;
pub mod page;
pub mod txn;
pub mod write_ahead_log;
