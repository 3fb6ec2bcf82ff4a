//! Batch consumer configuration: TOML parsing, environment overrides,
//! validation and the resolved [`BatchSettings`] handed to consumer loops.

mod loading;
mod types;
mod validation;


pub use types::{
    BatchConfig, BatchSettings, DEFAULT_COMPLETION_SIZE, DEFAULT_COMPLETION_TIMEOUT_MS,
    DEFAULT_POLL_DURATION_MS,
};
