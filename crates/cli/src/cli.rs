use std::path::PathBuf;

use clap::Parser;

/// Run a transactional batch consumer against an in-process broker.
///
/// A producer task feeds the destination from the config while the
/// consumer batches, processes and commits. Useful for exploring how the
/// size, timeout and interval settings shape batches.
#[derive(Parser, Debug)]
#[command(name = "qbatch", about = "Transactional batch consumer demo")]
pub struct CliArgs {
    /// Path to the consumer config file
    #[arg(long, env = "QBATCH_CONFIG", default_value = "config/qbatch.toml")]
    pub config: PathBuf,

    /// Number of messages the producer sends (0 = unbounded)
    #[arg(long, default_value = "1000")]
    pub messages: u64,

    /// Delay between produced messages, in milliseconds
    #[arg(long, default_value = "5")]
    pub produce_interval_ms: u64,

    /// Fail every Nth non-empty batch to exercise rollback (0 = never)
    #[arg(long, default_value = "0")]
    pub fail_every: u64,

    /// Stop after this many seconds (0 = run until Ctrl-C)
    #[arg(long, default_value = "0")]
    pub run_for_secs: u64,
}
