// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host-configuration records.
//!
//! The daemon consumes host records loaded from a flat hosts file: one
//! `IP hostname # tag tag …` line per host, plus `page NAME TITLE` lines that
//! set the page path for the hosts that follow. Tags carry the per-host
//! policy knobs the status pipeline consults (downtime windows, delayed
//! colors, flap exemptions, dialup/noclear markers).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// One downtime window. Times are minutes of the UTC day; `days` holds
/// weekday digits (`0` = Sunday) or `*` for all days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowntimeWindow {
    pub test: String,
    pub days: String,
    pub start: u32,
    pub end: u32,
    pub cause: String,
}

impl DowntimeWindow {
    /// Whether this window covers `now` (unix seconds) for `test`.
    pub fn covers(&self, test: &str, now: i64) -> bool {
        if self.test != "*" && self.test != test {
            return false;
        }
        // 1970-01-01 was a Thursday; day 0 of the cycle below is Sunday.
        let weekday = ((now / 86_400) + 4) % 7;
        let digit = char::from_digit(weekday as u32, 10).unwrap_or('*');
        if self.days != "*" && !self.days.contains(digit) {
            return false;
        }
        let minute = ((now % 86_400) / 60) as u32;
        if self.start <= self.end {
            minute >= self.start && minute < self.end
        } else {
            // Window wraps midnight.
            minute >= self.start || minute < self.end
        }
    }
}

/// One configured host.
#[derive(Debug, Clone, Default)]
pub struct HostInfo {
    pub hostname: String,
    pub ip: String,
    pub page_path: String,
    pub class: String,
    pub os: String,
    pub net: String,
    /// All tags, verbatim, in file order.
    pub tags: Vec<String>,
    flags: HashSet<String>,
    noflap_tests: Vec<String>,
    delay_red: Vec<(String, i64)>,
    delay_yellow: Vec<(String, i64)>,
    downtime: Vec<DowntimeWindow>,
}

impl HostInfo {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// Per-test flap exemption: the bare `noflap` tag covers every test,
    /// `noflap:t1,t2` only the named ones.
    pub fn noflap(&self, test: &str) -> bool {
        if self.flags.contains("noflap") {
            return true;
        }
        self.noflap_tests.iter().any(|t| t == test)
    }

    /// Delay (seconds) a color must sustain before taking effect, 0 if none.
    /// A `*` entry applies to every test.
    pub fn change_delay(&self, color: crate::color::Color, test: &str) -> i64 {
        let list = match color {
            crate::color::Color::Red => &self.delay_red,
            crate::color::Color::Yellow => &self.delay_yellow,
            _ => return 0,
        };
        for (t, minutes) in list {
            if t == "*" || t == test {
                return minutes * 60;
            }
        }
        0
    }

    /// Downtime cause if a configured window covers `now` for `test`.
    pub fn downtime_cause(&self, test: &str, now: i64) -> Option<&str> {
        self.downtime.iter().find(|w| w.covers(test, now)).map(|w| w.cause.as_str())
    }

    /// Look up a host-info item by its `XMH_…` name, as the board filters do.
    pub fn item(&self, name: &str) -> Option<String> {
        match name {
            "XMH_HOSTNAME" => Some(self.hostname.clone()),
            "XMH_IP" => Some(self.ip.clone()),
            "XMH_CLASS" => Some(self.class.clone()),
            "XMH_OS" => Some(self.os.clone()),
            "XMH_NET" => Some(self.net.clone()),
            "XMH_PAGEPATH" | "XMH_ALLPAGEPATHS" => Some(self.page_path.clone()),
            "XMH_RAW" => Some(self.tags.join(" ")),
            "XMH_DOWNTIME" if !self.downtime.is_empty() => Some(
                self.downtime
                    .iter()
                    .map(|w| format!("{}:{}:{:04}:{:04}", w.test, w.days, w.start, w.end))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => name
                .strip_prefix("XMH_FLAG_")
                .and_then(|f| self.flags.contains(&f.to_ascii_lowercase()).then(|| "yes".to_owned())),
        }
    }
}

/// The loaded host configuration, plus a short-name index for ghost matching.
#[derive(Debug, Default)]
pub struct HostsConfig {
    path: Option<PathBuf>,
    mtime: Option<std::time::SystemTime>,
    hosts: BTreeMap<String, HostInfo>,
    short_index: HashMap<String, String>,
}

impl HostsConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut cfg = Self::parse(&contents);
        cfg.path = Some(path.to_owned());
        cfg.mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok(cfg)
    }

    /// Re-read the backing file if it changed since the last load. Returns
    /// true when fresh data was taken in.
    pub fn reload(&mut self) -> anyhow::Result<bool> {
        let Some(ref path) = self.path else {
            return Ok(false);
        };
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if mtime.is_some() && mtime == self.mtime {
            return Ok(false);
        }
        let fresh = Self::load(path)?;
        self.hosts = fresh.hosts;
        self.short_index = fresh.short_index;
        self.mtime = fresh.mtime;
        Ok(true)
    }

    pub fn parse(contents: &str) -> Self {
        let mut hosts = BTreeMap::new();
        let mut short_index = HashMap::new();
        let mut page_path = String::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("page ") {
                page_path = rest.split_ascii_whitespace().next().unwrap_or("").to_owned();
                continue;
            }
            let (addr_part, tag_part) = match line.split_once('#') {
                Some((a, t)) => (a.trim(), t.trim()),
                None => (line, ""),
            };
            let mut toks = addr_part.split_ascii_whitespace();
            let (Some(ip), Some(hostname)) = (toks.next(), toks.next()) else {
                continue;
            };
            let mut info = HostInfo {
                hostname: hostname.to_owned(),
                ip: ip.to_owned(),
                page_path: page_path.clone(),
                ..Default::default()
            };
            for tag in tag_part.split_ascii_whitespace() {
                Self::apply_tag(&mut info, tag);
                info.tags.push(tag.to_owned());
            }
            if let Some(short) = hostname.split('.').next() {
                if short != hostname {
                    short_index.entry(short.to_owned()).or_insert_with(|| hostname.to_owned());
                }
            }
            hosts.insert(hostname.to_owned(), info);
        }

        Self { path: None, mtime: None, hosts, short_index }
    }

    fn apply_tag(info: &mut HostInfo, tag: &str) {
        if let Some(v) = tag.strip_prefix("CLASS:") {
            info.class = v.to_owned();
        } else if let Some(v) = tag.strip_prefix("OS:") {
            info.os = v.to_owned();
        } else if let Some(v) = tag.strip_prefix("NET:") {
            info.net = v.to_owned();
        } else if let Some(v) = tag.strip_prefix("noflap:") {
            info.noflap_tests.extend(v.split(',').map(str::to_owned));
        } else if let Some(v) = tag.strip_prefix("delayred=") {
            info.delay_red = Self::parse_delays(v);
        } else if let Some(v) = tag.strip_prefix("delayyellow=") {
            info.delay_yellow = Self::parse_delays(v);
        } else if let Some(v) = tag.strip_prefix("DOWNTIME=") {
            if let Some(w) = Self::parse_downtime(v) {
                info.downtime.push(w);
            }
        } else {
            info.flags.insert(tag.to_ascii_lowercase());
        }
    }

    /// `delayred=10` (all tests) or `delayred=cpu:10,disk:5`.
    fn parse_delays(spec: &str) -> Vec<(String, i64)> {
        let mut out = Vec::new();
        for part in spec.split(',') {
            match part.split_once(':') {
                Some((test, minutes)) => {
                    if let Ok(m) = minutes.parse() {
                        out.push((test.to_owned(), m));
                    }
                }
                None => {
                    if let Ok(m) = part.parse() {
                        out.push(("*".to_owned(), m));
                    }
                }
            }
        }
        out
    }

    /// `DOWNTIME=tests:days:HHMM:HHMM[:cause]`.
    fn parse_downtime(spec: &str) -> Option<DowntimeWindow> {
        let mut parts = spec.splitn(5, ':');
        let test = parts.next()?.to_owned();
        let days = parts.next()?.to_owned();
        let start = parse_hhmm(parts.next()?)?;
        let end = parse_hhmm(parts.next()?)?;
        let cause = parts.next().unwrap_or("Scheduled downtime").replace('_', " ");
        Some(DowntimeWindow { test, days, start, end, cause })
    }

    pub fn get(&self, hostname: &str) -> Option<&HostInfo> {
        self.hosts.get(hostname)
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.hosts.contains_key(hostname)
    }

    /// Resolve a short (unqualified) name to its configured FQDN record.
    pub fn find_by_short(&self, short: &str) -> Option<&HostInfo> {
        self.short_index.get(short).and_then(|fqdn| self.hosts.get(fqdn))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostInfo> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn parse_hhmm(s: &str) -> Option<u32> {
    if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: u32 = s[..2].parse().ok()?;
    let minutes: u32 = s[2..].parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

#[cfg(test)]
#[path = "hosts_tests.rs"]
mod tests;
