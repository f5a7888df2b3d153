// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operator-facing statistics.
//!
//! Counters are updated inline by the core task; every stats interval they
//! are rendered into a synthetic `status` message the daemon feeds to itself.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bus::ChannelBus;
use crate::registry::Registry;

/// Per-connection-state timeout counters, shared with the listener tasks.
#[derive(Debug, Default)]
pub struct ConnCounters {
    pub receiving: AtomicU64,
    pub responding: AtomicU64,
    pub starttls: AtomicU64,
}

impl ConnCounters {
    pub fn bump_receiving(&self) {
        self.receiving.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_responding(&self) {
        self.responding.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bump_starttls(&self) {
        self.starttls.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bounded tail of recent error lines, reported in the stats message.
const ERROR_BUFFER_LINES: usize = 25;

#[derive(Debug)]
pub struct Stats {
    pub started: i64,
    tcp_counts: BTreeMap<String, u64>,
    bfq_counts: BTreeMap<String, u64>,
    total: u64,
    total_at_last_report: u64,
    last_report: i64,
    errors: VecDeque<String>,
}

impl Stats {
    pub fn new(now: i64) -> Self {
        Self {
            started: now,
            tcp_counts: BTreeMap::new(),
            bfq_counts: BTreeMap::new(),
            total: 0,
            total_at_last_report: 0,
            last_report: now,
            errors: VecDeque::new(),
        }
    }

    /// Count one incoming message, split by transport.
    pub fn update(&mut self, verb: &str, via_bfq: bool) {
        self.total += 1;
        let table = if via_bfq { &mut self.bfq_counts } else { &mut self.tcp_counts };
        *table.entry(verb.to_owned()).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Keep an error line for the running error buffer.
    pub fn record_error(&mut self, line: impl Into<String>) {
        if self.errors.len() == ERROR_BUFFER_LINES {
            self.errors.pop_front();
        }
        self.errors.push_back(line.into());
    }

    /// Render the synthetic status message body for `{host}.vigild`.
    pub fn generate(
        &mut self,
        host: &str,
        now: i64,
        registry: &Registry,
        bus: &ChannelBus,
        conn: &ConnCounters,
    ) -> String {
        let elapsed = (now - self.last_report).max(1);
        let rate = (self.total - self.total_at_last_report) / elapsed as u64;
        self.last_report = now;
        self.total_at_last_report = self.total;

        let mut out = format!(
            "status {host}.vigild green {now} - vigild up since {started}\n\nStatistics for the Vigil daemon\n\nIncoming messages      : {total} ({rate} msgs/sec)\n",
            started = self.started,
            total = self.total,
        );

        let mut verbs: Vec<&String> = self.tcp_counts.keys().chain(self.bfq_counts.keys()).collect();
        verbs.sort();
        verbs.dedup();
        for verb in verbs {
            let tcp = self.tcp_counts.get(verb).copied().unwrap_or(0);
            let bfq = self.bfq_counts.get(verb).copied().unwrap_or(0);
            out.push_str(&format!("- {verb:<20} : {tcp}"));
            if bfq > 0 {
                out.push_str(&format!(" (BFQ: {bfq})"));
            }
            out.push('\n');
        }

        out.push_str("\nChannels:\n");
        for chan in bus.channels() {
            out.push_str(&format!(
                "- {name:<8} : subscribers={subs} messages={msgs} dropped={dropped} truncated={trunc}\n",
                name = chan.id.as_str(),
                subs = chan.receiver_count(),
                msgs = chan.msg_count(),
                dropped = chan.dropped(),
                trunc = chan.truncated(),
            ));
        }

        out.push_str(&format!(
            "\nConnection timeouts: receiving={} responding={} starttls={}\n",
            conn.receiving.load(Ordering::Relaxed),
            conn.responding.load(Ordering::Relaxed),
            conn.starttls.load(Ordering::Relaxed),
        ));

        if !registry.ghosts.is_empty() {
            out.push_str("\nGhost reports:\n");
            for g in registry.ghosts.values() {
                out.push_str(&format!(
                    "- {} reported by {} ({}s ago)\n",
                    g.hostname,
                    g.sender,
                    now - g.last_seen
                ));
            }
        }

        if !registry.multi_sources.is_empty() {
            out.push_str("\nMulti-source statuses:\n");
            for m in registry.multi_sources.values() {
                out.push_str(&format!(
                    "- {}:{} reported by both {} and {}\n",
                    m.hostname, m.test, m.old_sender, m.new_sender
                ));
            }
        }

        if !self.errors.is_empty() {
            out.push_str("\nLatest errors:\n");
            for e in &self.errors {
                out.push_str(e);
                out.push('\n');
            }
        }

        out
    }
}

#[cfg(test)]
#[path = "stats_tests.rs"]
mod tests;
