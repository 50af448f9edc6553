//! Configuration surface (spec §6): the parameters the outer migration
//! command sets via `set_params`, available both as a `serde`-loadable
//! file (mirroring the teacher's YAML `mayastor_config`) and as CLI flags
//! (mirroring `MayastorCliArgs`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use structopt::StructOpt;

/// File-loadable migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Enable full-copy block migration.
    #[serde(default)]
    pub blk: bool,
    /// Enable shared-base-image mode; implies `blk`.
    #[serde(default)]
    pub shared: bool,
    /// Downtime budget for cutover, in nanoseconds on the wire.
    #[serde(default = "default_max_downtime_ns")]
    pub max_downtime_ns: u64,
    /// Bandwidth cap in bytes/second; `0` means unlimited.
    #[serde(default)]
    pub bandwidth_limit: u64,
}

fn default_max_downtime_ns() -> u64 {
    // 300 ms, a conservative default cutover budget.
    300_000_000
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            blk: false,
            shared: false,
            max_downtime_ns: default_max_downtime_ns(),
            bandwidth_limit: 0,
        }
    }
}

impl MigrationConfig {
    pub fn max_downtime(&self) -> Duration {
        Duration::from_nanos(self.max_downtime_ns)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

/// CLI flags for `blkmigd`, one flag per configuration field, mirroring
/// the teacher's short-flag-first `MayastorCliArgs` style.
#[derive(Debug, StructOpt)]
#[structopt(name = "blkmigd", about = "live block-device migration sender/receiver")]
pub struct MigrationCliArgs {
    /// Enable full-copy block migration.
    #[structopt(short = "b", long = "blk")]
    pub blk: bool,

    /// Enable shared-base-image mode.
    #[structopt(short = "s", long = "shared")]
    pub shared: bool,

    /// Downtime budget for cutover, in milliseconds.
    #[structopt(short = "d", long = "max-downtime-ms", default_value = "300")]
    pub max_downtime_ms: u64,

    /// Bandwidth cap in bytes/second; 0 means unlimited.
    #[structopt(short = "r", long = "bandwidth-limit", default_value = "0")]
    pub bandwidth_limit: u64,

    /// Address to connect to (sender) or listen on (receiver),
    /// `host:port`.
    #[structopt(short = "a", long = "address")]
    pub address: String,

    /// Run as the receiving side instead of the sender.
    #[structopt(short = "l", long = "listen")]
    pub listen: bool,

    /// Log level passed to `logging::init` when `RUST_LOG` is unset.
    #[structopt(short = "v", long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl From<&MigrationCliArgs> for MigrationConfig {
    fn from(args: &MigrationCliArgs) -> Self {
        Self {
            blk: args.blk,
            shared: args.shared,
            max_downtime_ns: args.max_downtime_ms * 1_000_000,
            bandwidth_limit: args.bandwidth_limit,
        }
    }
}
