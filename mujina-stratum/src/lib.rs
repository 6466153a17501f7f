//! Stratum v1 mining client.
//!
//! A pool session (or a dummy source) produces jobs; the [`dispatcher`]
//! splits them over hash threads (BM13xx chips on serial ports, or CPU
//! threads), validates what they find, and submits shares back to the pool.

pub mod chip;
pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod hash_thread;
pub mod job_source;
pub mod stratum_v1;
pub mod tracing;
pub mod types;
