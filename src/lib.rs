//! rangedb - replicated MVCC range storage
//!
//! Features:
//! - MVCC key/value storage with write intents and transaction records
//! - Per-range latching, timestamp cache and batch evaluation
//! - Raft command pipeline with split, merge and replica change triggers
//! - Rangefeeds with catch-up scans and resolved timestamps

pub mod api;
pub mod batcheval;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod hlc;
pub mod keys;
pub mod mvcc;
pub mod print;
pub mod raft;
pub mod rangefeed;
pub mod replica;
pub mod stateloader;
pub mod storage;
pub mod store;
pub mod txn;
