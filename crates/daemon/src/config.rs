// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::GhostMode;

/// Configuration for the vigil monitor daemon.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "vigild", about = "Vigil monitor daemon")]
pub struct DaemonConfig {
    /// Address to listen on for the plaintext protocol.
    #[arg(long, default_value = "0.0.0.0:1984", env = "VIGILD_LISTEN")]
    pub listen: String,

    /// Separate TLS listener address.
    #[arg(long, env = "VIGILD_TLS_LISTEN")]
    pub tls_listen: Option<String>,

    /// Server certificate (PEM). Enables STARTTLS on the plaintext port.
    #[arg(long, env = "VIGILD_TLS_CERTIFICATE")]
    pub tls_certificate: Option<PathBuf>,

    /// Server private key (PEM).
    #[arg(long, env = "VIGILD_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Root CA bundle used to verify client certificates.
    #[arg(long, env = "VIGILD_TLS_CLIENTROOTCA")]
    pub tls_clientrootca: Option<PathBuf>,

    /// Require a verified client certificate on TLS connections.
    #[arg(long, env = "VIGILD_TLS_REQUIRECLIENTCERT")]
    pub tls_requireclientcert: bool,

    /// Hosts configuration file.
    #[arg(long, env = "VIGILD_HOSTS")]
    pub hosts: Option<PathBuf>,

    /// How unknown hosts seen in traffic are handled.
    #[arg(long, value_enum, default_value_t = GhostMode::Log, env = "VIGILD_GHOSTS")]
    pub ghosts: GhostMode,

    /// Disable the purple sweeper entirely.
    #[arg(long, env = "VIGILD_NO_PURPLE")]
    pub no_purple: bool,

    /// Checkpoint file path.
    #[arg(long, env = "VIGILD_CHECKPOINT_FILE")]
    pub checkpoint_file: Option<PathBuf>,

    /// Seconds between checkpoint saves.
    #[arg(long, default_value_t = 900, env = "VIGILD_CHECKPOINT_INTERVAL")]
    pub checkpoint_interval: u64,

    /// Seconds between host-configuration reload checks.
    #[arg(long, default_value_t = 600, env = "VIGILD_RELOAD_INTERVAL")]
    pub reload_interval: u64,

    /// Seconds between purple sweeps.
    #[arg(long, default_value_t = 60, env = "VIGILD_PURPLE_INTERVAL")]
    pub purple_interval: u64,

    /// Seconds between self-reported statistics messages.
    #[arg(long, default_value_t = 300, env = "VIGILD_STATS_INTERVAL")]
    pub stats_interval: u64,

    /// Status changes kept in the flap ring; 0 disables flap damping.
    #[arg(long, default_value_t = 5, env = "VIGILD_FLAP_COUNT")]
    pub flap_count: usize,

    /// Window (seconds) within which flap-count changes mean flapping.
    #[arg(long, default_value_t = 1800, env = "VIGILD_FLAP_SECONDS")]
    pub flap_seconds: i64,

    /// Clear acks when the color escalates past the acked severity.
    #[arg(long, env = "VIGILD_ACK_EACH_COLOR")]
    pub ack_each_color: bool,

    /// Do not keep client messages in memory.
    #[arg(long, env = "VIGILD_NO_CLIENTLOG")]
    pub no_clientlog: bool,

    /// Forward client logs on alert transitions; optionally only for the
    /// named tests (comma-separated; bare flag means all).
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "", env = "VIGILD_STORE_CLIENTLOGS")]
    pub store_clientlogs: Option<String>,

    /// Allow-list for maintenance verbs (enable/disable/ack/notes).
    #[arg(long, env = "VIGILD_MAINT_SENDERS")]
    pub maint_senders: Option<String>,

    /// Allow-list for status-bearing verbs.
    #[arg(long, env = "VIGILD_STATUS_SENDERS")]
    pub status_senders: Option<String>,

    /// Allow-list for admin verbs (drop/rename/config/schedule).
    #[arg(long, env = "VIGILD_ADMIN_SENDERS")]
    pub admin_senders: Option<String>,

    /// Allow-list for query verbs.
    #[arg(long, env = "VIGILD_WWW_SENDERS")]
    pub www_senders: Option<String>,

    /// Back-feed queue channel number (0-9).
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "0", env = "VIGILD_BFQ")]
    pub bfq: Option<u8>,

    /// Disable the back-feed queue.
    #[arg(long, env = "VIGILD_NO_BFQ")]
    pub no_bfq: bool,

    /// Directory holding the back-feed queue socket.
    #[arg(long, default_value = "/tmp", env = "VIGILD_BFQ_DIR")]
    pub bfq_dir: PathBuf,

    /// Messages drained from the back-feed queue per scheduling pass.
    #[arg(long, default_value_t = 50, env = "VIGILD_BFQ_CHUNK")]
    pub bfq_chunk: usize,

    /// Ack-info log file.
    #[arg(long, env = "VIGILD_ACK_LOG")]
    pub ack_log: Option<PathBuf>,

    /// Colors that raise alerts.
    #[arg(long, default_value = "red,yellow,purple", env = "VIGILD_ALERT_COLORS")]
    pub alert_colors: String,

    /// Colors that count as recovery.
    #[arg(long, default_value = "green", env = "VIGILD_OK_COLORS")]
    pub ok_colors: String,

    /// Default status validity in minutes.
    #[arg(long, default_value_t = 30, env = "VIGILD_DEFAULT_VALIDITY")]
    pub default_validity: i64,

    /// Ack-cookie lifetime in seconds.
    #[arg(long, default_value_t = 86_400, env = "VIGILD_COOKIE_LIFETIME")]
    pub cookie_lifetime: i64,

    /// Hard ceiling on one inbound message, bytes.
    #[arg(long, default_value_t = crate::codec::DEFAULT_MAX_MSG_SIZE, env = "VIGILD_MAX_MSG_SIZE")]
    pub max_msg_size: usize,

    /// Bound for one fan-out channel message, bytes.
    #[arg(long, default_value_t = crate::bus::DEFAULT_CHANNEL_MAX, env = "VIGILD_CHANNEL_SIZE")]
    pub channel_size: usize,

    /// Test name of the ping column.
    #[arg(long, default_value = "conn", env = "VIGILD_CONN_TEST")]
    pub conn_test: String,

    /// Per-connection deadline, seconds.
    #[arg(long, default_value_t = 30, env = "VIGILD_CONN_TIMEOUT")]
    pub conn_timeout: u64,

    /// Directory served by `config` / `clientconfig` requests.
    #[arg(long, env = "VIGILD_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Alert recipient rules file.
    #[arg(long, env = "VIGILD_ALERT_RULES")]
    pub alert_rules: Option<PathBuf>,

    /// Alert manager checkpoint file (JSONL).
    #[arg(long, env = "VIGILD_ALERT_CHECKPOINT")]
    pub alert_checkpoint: Option<PathBuf>,

    /// Script invoked to deliver one alert (the send_alert hook).
    #[arg(long, env = "VIGILD_ALERT_SCRIPT")]
    pub alert_script: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn checkpoint_every(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval.max(1))
    }

    pub fn reload_every(&self) -> Duration {
        Duration::from_secs(self.reload_interval.max(1))
    }

    pub fn purple_every(&self) -> Duration {
        Duration::from_secs(self.purple_interval.max(1))
    }

    pub fn stats_every(&self) -> Duration {
        Duration::from_secs(self.stats_interval.max(1))
    }

    pub fn conn_deadline(&self) -> Duration {
        Duration::from_secs(self.conn_timeout.max(1))
    }

    pub fn bfq_socket(&self) -> Option<PathBuf> {
        if self.no_bfq {
            return None;
        }
        let chan = self.bfq.unwrap_or(0).min(9);
        Some(self.bfq_dir.join(format!("vigild_bfq.{chan}")))
    }

    pub fn color_policy(&self) -> crate::color::ColorPolicy {
        crate::color::ColorPolicy {
            alert: crate::color::ColorSet::parse(&self.alert_colors),
            ok: crate::color::ColorSet::parse(&self.ok_colors),
        }
    }

    /// Does this test forward client logs on alert transitions?
    pub fn clientsave(&self, test: &str) -> bool {
        match self.store_clientlogs.as_deref() {
            None => false,
            Some("") => true,
            Some(list) => list.split(',').any(|t| t.trim() == test),
        }
    }

    pub fn sender_classes(&self) -> SenderClasses {
        SenderClasses {
            status: self.status_senders.as_deref().map(SenderList::parse),
            maint: self.maint_senders.as_deref().map(SenderList::parse),
            admin: self.admin_senders.as_deref().map(SenderList::parse),
            www: self.www_senders.as_deref().map(SenderList::parse),
        }
    }
}

// -- Sender allow-lists -------------------------------------------------------

/// Authorization classes for the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderClass {
    Status,
    Maint,
    Admin,
    Www,
    Any,
}

/// One allow-list: exact IPs and/or CIDR prefixes.
#[derive(Debug, Clone, Default)]
pub struct SenderList {
    patterns: Vec<IpPattern>,
}

#[derive(Debug, Clone)]
enum IpPattern {
    Exact(IpAddr),
    Cidr { net: IpAddr, bits: u8 },
}

impl SenderList {
    pub fn parse(csv: &str) -> Self {
        let mut patterns = Vec::new();
        for tok in csv.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            if let Some((addr, bits)) = tok.split_once('/') {
                if let (Ok(net), Ok(bits)) = (addr.parse::<IpAddr>(), bits.parse::<u8>()) {
                    patterns.push(IpPattern::Cidr { net, bits });
                    continue;
                }
            }
            if let Ok(ip) = tok.parse::<IpAddr>() {
                patterns.push(IpPattern::Exact(ip));
            } else {
                tracing::warn!(pattern = tok, "ignoring unparseable sender pattern");
            }
        }
        Self { patterns }
    }

    pub fn allows(&self, sender: &str) -> bool {
        let Ok(ip) = sender.parse::<IpAddr>() else {
            return false;
        };
        self.patterns.iter().any(|p| match p {
            IpPattern::Exact(a) => *a == ip,
            IpPattern::Cidr { net, bits } => cidr_match(*net, *bits, ip),
        })
    }
}

fn cidr_match(net: IpAddr, bits: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(n), IpAddr::V4(i)) => {
            let bits = bits.min(32);
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits as u32);
            (u32::from(n) & mask) == (u32::from(i) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(i)) => {
            let bits = bits.min(128);
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits as u32);
            (u128::from(n) & mask) == (u128::from(i) & mask)
        }
        _ => false,
    }
}

/// The four allow-lists; an unset list admits everyone.
#[derive(Debug, Clone, Default)]
pub struct SenderClasses {
    pub status: Option<SenderList>,
    pub maint: Option<SenderList>,
    pub admin: Option<SenderList>,
    pub www: Option<SenderList>,
}

impl SenderClasses {
    /// Authorization check for one verb class. Back-feed messages come from
    /// trusted local producers and bypass the lists.
    pub fn allowed(&self, class: SenderClass, sender: &str, via_bfq: bool) -> bool {
        if via_bfq {
            return true;
        }
        let list = match class {
            SenderClass::Status => &self.status,
            SenderClass::Maint => &self.maint,
            SenderClass::Admin => &self.admin,
            SenderClass::Www => &self.www,
            SenderClass::Any => &None,
        };
        match list {
            Some(l) => l.allows(sender),
            None => true,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
