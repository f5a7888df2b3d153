// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the vigil fan-in proxy.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "vigilproxy", about = "Vigil fan-in proxy")]
pub struct ProxyConfig {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:1984", env = "VIGILPROXY_LISTEN")]
    pub listen: String,

    /// Upstream daemon address; repeat for multiple upstreams.
    #[arg(long = "server", required = true, env = "VIGILPROXY_SERVERS", value_delimiter = ',')]
    pub servers: Vec<String>,

    /// Per-connection deadline, seconds.
    #[arg(long, default_value_t = 10, env = "VIGILPROXY_TIMEOUT")]
    pub timeout: u64,

    /// Back-feed queue socket of a local daemon; one-way messages are
    /// placed there instead of being sent over TCP.
    #[arg(long, env = "VIGILPROXY_BFQ")]
    pub bfq: Option<PathBuf>,

    /// Hard ceiling on one inbound message, bytes.
    #[arg(long, default_value_t = 10 * 1024 * 1024, env = "VIGILPROXY_MAX_MSG_SIZE")]
    pub max_msg_size: usize,

    /// How long a status message may wait for combining, milliseconds.
    #[arg(long, default_value_t = 250, env = "VIGILPROXY_COMBO_DELAY_MS")]
    pub combo_delay_ms: u64,

    /// Report proxy statistics as a status for this `host.test` address.
    #[arg(long, env = "VIGILPROXY_REPORT")]
    pub report: Option<String>,

    /// Seconds between statistics reports.
    #[arg(long, default_value_t = 300, env = "VIGILPROXY_REPORT_INTERVAL")]
    pub report_interval: u64,
}

impl ProxyConfig {
    pub fn conn_deadline(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn combo_delay(&self) -> Duration {
        Duration::from_millis(self.combo_delay_ms.max(1))
    }

    pub fn report_every(&self) -> Duration {
        Duration::from_secs(self.report_interval.max(1))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
