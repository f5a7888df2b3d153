// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host / test / origin / cookie registries.
//!
//! Everything here is owned by the core task and touched from nowhere else.
//! Status records live inside their host record, keyed by (test, origin);
//! the cookie table points back at them by key.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::hosts::HostsConfig;
use crate::status::StatusRecord;

/// How unknown hostnames seen in traffic are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum GhostMode {
    /// Auto-create host records for unknown hosts.
    Allow,
    /// Silently drop messages from unknown hosts.
    Drop,
    /// Record the ghost, drop the message.
    #[default]
    Log,
    /// Try a short-name match against configured hosts, else record + drop.
    Match,
}

impl GhostMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Drop => "drop",
            Self::Log => "log",
            Self::Match => "match",
        }
    }
}

impl std::fmt::Display for GhostMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ghosts are reported for this long after last being seen.
pub const GHOST_LIFETIME: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Normal,
    Summary,
}

/// One stored client-message section, keyed by collector id.
#[derive(Debug, Clone)]
pub struct ClientSection {
    pub collector: String,
    pub msg: String,
    pub tstamp: i64,
}

/// Key of a status record within its host: (test, origin).
pub type StatusKey = (Arc<str>, Arc<str>);

#[derive(Debug)]
pub struct HostRecord {
    pub hostname: String,
    pub ip: String,
    pub kind: HostKind,
    pub statuses: BTreeMap<StatusKey, StatusRecord>,
    /// Cached key of the ping ("conn") status, if one exists.
    pub ping_status: Option<StatusKey>,
    pub client_msgs: Vec<ClientSection>,
    pub client_tstamp: i64,
}

impl HostRecord {
    pub fn new(hostname: String, ip: String, kind: HostKind) -> Self {
        Self {
            hostname,
            ip,
            kind,
            statuses: BTreeMap::new(),
            ping_status: None,
            client_msgs: Vec::new(),
            client_tstamp: 0,
        }
    }

    /// First status record for `test`, regardless of origin.
    pub fn status_by_test(&self, test: &str) -> Option<&StatusRecord> {
        self.statuses.iter().find(|((t, _), _)| t.as_ref() == test).map(|(_, s)| s)
    }

    pub fn status_by_test_mut(&mut self, test: &str) -> Option<&mut StatusRecord> {
        self.statuses.iter_mut().find(|((t, _), _)| t.as_ref() == test).map(|(_, s)| s)
    }

    /// Concatenated client sections with `[collector:ID]` separators, the
    /// form the clichg channel carries.
    pub fn total_client_msg(&self) -> String {
        let mut out = String::new();
        for s in &self.client_msgs {
            if !s.collector.is_empty() {
                out.push_str(&format!("[collector:{}]\n", s.collector));
            }
            out.push_str(&s.msg);
            if !s.msg.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

#[derive(Debug)]
pub struct TestRecord {
    pub name: Arc<str>,
    /// Does this test trigger client-log persistence on alert transitions.
    pub clientsave: bool,
}

/// An unknown host observed in traffic.
#[derive(Debug, Clone)]
pub struct Ghost {
    pub hostname: String,
    pub sender: String,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Advisory record of two senders reporting the same status.
#[derive(Debug, Clone)]
pub struct MultiSource {
    pub hostname: String,
    pub test: String,
    pub old_sender: String,
    pub new_sender: String,
    pub last_seen: i64,
}

/// The daemon's in-memory state trees.
#[derive(Debug, Default)]
pub struct Registry {
    pub hosts: BTreeMap<String, HostRecord>,
    pub tests: BTreeMap<Arc<str>, TestRecord>,
    pub origins: BTreeMap<Arc<str>, Arc<str>>,
    /// cookie → (hostname, test, origin)
    pub cookies: HashMap<String, (String, Arc<str>, Arc<str>)>,
    pub ghosts: BTreeMap<String, Ghost>,
    pub multi_sources: BTreeMap<String, MultiSource>,
    /// sender IP → messages received.
    pub senders: BTreeMap<String, u64>,
}

/// Outcome of the ghost check for an incoming hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostResolution {
    /// Use this canonical hostname and IP.
    Known { hostname: String, ip: String },
    /// Unknown host; the message is dropped.
    Dropped,
}

impl Registry {
    pub fn intern_test(&mut self, name: &str, clientsave: bool) -> Arc<str> {
        if let Some(t) = self.tests.get(name) {
            return Arc::clone(&t.name);
        }
        let arc: Arc<str> = Arc::from(name);
        self.tests.insert(Arc::clone(&arc), TestRecord { name: Arc::clone(&arc), clientsave });
        arc
    }

    pub fn intern_origin(&mut self, name: &str) -> Arc<str> {
        if let Some(o) = self.origins.get(name) {
            return Arc::clone(o);
        }
        let arc: Arc<str> = Arc::from(name);
        self.origins.insert(Arc::clone(&arc), Arc::clone(&arc));
        arc
    }

    /// Ghost check (§ status pipeline step 1). Internal senders bypass it so
    /// the daemon's own synthetic statuses always land.
    pub fn resolve_host(
        &mut self,
        hostname: &str,
        sender: &str,
        hosts: &HostsConfig,
        mode: GhostMode,
        internal_sender: &str,
        now: i64,
    ) -> HostResolution {
        if let Some(info) = hosts.get(hostname) {
            return HostResolution::Known { hostname: info.hostname.clone(), ip: info.ip.clone() };
        }
        if sender == internal_sender || self.hosts.contains_key(hostname) {
            // Already known to the registry (e.g. created before a reload).
            let ip = self.hosts.get(hostname).map(|h| h.ip.clone()).unwrap_or_default();
            return HostResolution::Known { hostname: hostname.to_owned(), ip };
        }
        match mode {
            GhostMode::Allow => {
                HostResolution::Known { hostname: hostname.to_owned(), ip: "0.0.0.0".to_owned() }
            }
            GhostMode::Drop => HostResolution::Dropped,
            GhostMode::Log => {
                self.record_ghost(hostname, sender, now);
                HostResolution::Dropped
            }
            GhostMode::Match => match hosts.find_by_short(hostname) {
                Some(info) => {
                    HostResolution::Known { hostname: info.hostname.clone(), ip: info.ip.clone() }
                }
                None => {
                    self.record_ghost(hostname, sender, now);
                    HostResolution::Dropped
                }
            },
        }
    }

    pub fn record_ghost(&mut self, hostname: &str, sender: &str, now: i64) {
        let g = self.ghosts.entry(hostname.to_owned()).or_insert_with(|| Ghost {
            hostname: hostname.to_owned(),
            sender: sender.to_owned(),
            first_seen: now,
            last_seen: now,
        });
        g.sender = sender.to_owned();
        g.last_seen = now;
    }

    pub fn prune_ghosts(&mut self, now: i64) {
        self.ghosts.retain(|_, g| now - g.last_seen < GHOST_LIFETIME);
    }

    pub fn record_multi_source(&mut self, hostname: &str, test: &str, old: String, new: String, now: i64) {
        let key = format!("{hostname}:{test}");
        self.multi_sources.insert(
            key,
            MultiSource {
                hostname: hostname.to_owned(),
                test: test.to_owned(),
                old_sender: old,
                new_sender: new,
                last_seen: now,
            },
        );
    }

    pub fn count_sender(&mut self, sender: &str) {
        *self.senders.entry(sender.to_owned()).or_insert(0) += 1;
    }

    pub fn get_or_create_host(&mut self, hostname: &str, ip: &str, kind: HostKind) -> &mut HostRecord {
        self.hosts
            .entry(hostname.to_owned())
            .or_insert_with(|| HostRecord::new(hostname.to_owned(), ip.to_owned(), kind))
    }

    /// Fetch a status for update, creating it if needed.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_create_status(
        &mut self,
        hostname: &str,
        ip: &str,
        kind: HostKind,
        test: &Arc<str>,
        origin: &Arc<str>,
        color: crate::color::Color,
        now: i64,
        flap_count: usize,
        ping_test: &str,
    ) -> &mut StatusRecord {
        let host = self
            .hosts
            .entry(hostname.to_owned())
            .or_insert_with(|| HostRecord::new(hostname.to_owned(), ip.to_owned(), kind));
        let key = (Arc::clone(test), Arc::clone(origin));
        if test.as_ref() == ping_test {
            host.ping_status = Some(key.clone());
        }
        host.statuses.entry(key).or_insert_with(|| {
            StatusRecord::new(Arc::clone(test), Arc::clone(origin), color, now, flap_count)
        })
    }

    /// Assign a fresh unique cookie to the given status record.
    pub fn assign_cookie(
        &mut self,
        hostname: &str,
        key: &StatusKey,
        now: i64,
        lifetime: i64,
    ) -> Option<String> {
        let cookie = loop {
            // Random numeric cookie from a 63-bit domain, re-rolled on collision.
            let candidate = (rand::random::<u64>() >> 1).to_string();
            if !self.cookies.contains_key(&candidate) {
                break candidate;
            }
        };
        let rec = self.hosts.get_mut(hostname)?.statuses.get_mut(key)?;
        if let Some(old) = rec.cookie.take() {
            self.cookies.remove(&old);
        }
        rec.cookie = Some(cookie.clone());
        rec.cookie_expires = now + lifetime;
        self.cookies
            .insert(cookie.clone(), (hostname.to_owned(), Arc::clone(&key.0), Arc::clone(&key.1)));
        Some(cookie)
    }

    /// Drop a status' cookie (recovery or expiry).
    pub fn clear_cookie(&mut self, hostname: &str, key: &StatusKey) {
        if let Some(rec) = self.hosts.get_mut(hostname).and_then(|h| h.statuses.get_mut(key)) {
            if let Some(c) = rec.cookie.take() {
                self.cookies.remove(&c);
            }
            rec.cookie_expires = 0;
        }
    }

    /// Resolve a cookie back to its status location.
    pub fn find_cookie(&self, cookie: &str) -> Option<(String, StatusKey)> {
        self.cookies
            .get(cookie)
            .map(|(h, t, o)| (h.clone(), (Arc::clone(t), Arc::clone(o))))
    }

    /// Remove one status record, cleaning up its cookie.
    pub fn remove_status(&mut self, hostname: &str, key: &StatusKey) -> Option<StatusRecord> {
        let host = self.hosts.get_mut(hostname)?;
        let removed = host.statuses.remove(key)?;
        if host.ping_status.as_ref() == Some(key) {
            host.ping_status = None;
        }
        if let Some(ref c) = removed.cookie {
            self.cookies.remove(c);
        }
        Some(removed)
    }

    /// Drop every status for a host; optionally the host record itself.
    pub fn drop_host(&mut self, hostname: &str, keep_host: bool) {
        let keys: Vec<StatusKey> = match self.hosts.get(hostname) {
            Some(h) => h.statuses.keys().cloned().collect(),
            None => return,
        };
        for key in keys {
            self.remove_status(hostname, &key);
        }
        if !keep_host {
            self.hosts.remove(hostname);
        }
    }

    /// Drop the statuses for one test on a host.
    pub fn drop_test(&mut self, hostname: &str, test: &str) {
        let keys: Vec<StatusKey> = match self.hosts.get(hostname) {
            Some(h) => h
                .statuses
                .keys()
                .filter(|(t, _)| t.as_ref() == test)
                .cloned()
                .collect(),
            None => return,
        };
        for key in keys {
            self.remove_status(hostname, &key);
        }
    }

    /// Rename a host in place, fixing the cookie table.
    pub fn rename_host(&mut self, old: &str, new: &str) -> bool {
        if self.hosts.contains_key(new) {
            return false;
        }
        let Some(mut host) = self.hosts.remove(old) else {
            return false;
        };
        host.hostname = new.to_owned();
        self.hosts.insert(new.to_owned(), host);
        for loc in self.cookies.values_mut() {
            if loc.0 == old {
                loc.0 = new.to_owned();
            }
        }
        true
    }

    /// Rename one test on a host in place.
    pub fn rename_test(&mut self, hostname: &str, old: &str, new_test: &Arc<str>) -> bool {
        let Some(host) = self.hosts.get_mut(hostname) else {
            return false;
        };
        let keys: Vec<StatusKey> =
            host.statuses.keys().filter(|(t, _)| t.as_ref() == old).cloned().collect();
        if keys.is_empty() {
            return false;
        }
        for key in keys {
            if let Some(mut rec) = host.statuses.remove(&key) {
                rec.test = Arc::clone(new_test);
                let new_key = (Arc::clone(new_test), Arc::clone(&key.1));
                if host.ping_status.as_ref() == Some(&key) {
                    host.ping_status = Some(new_key.clone());
                }
                host.statuses.insert(new_key.clone(), rec);
                for loc in self.cookies.values_mut() {
                    if loc.0 == hostname && loc.1 == key.0 && loc.2 == key.1 {
                        loc.1 = Arc::clone(&new_key.0);
                    }
                }
            }
        }
        true
    }

    /// Total live status records.
    pub fn status_count(&self) -> usize {
        self.hosts.values().map(|h| h.statuses.len()).sum()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
