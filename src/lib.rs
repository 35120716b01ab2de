pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod service;
pub mod sql;
pub mod validate;
pub mod wal;
pub mod wire;
