pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod document;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod wal;
