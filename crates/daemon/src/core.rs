// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The daemon core: one task that owns every registry and runs the dispatch
//! table. Connection tasks and the back-feed reader hand complete messages
//! in through an mpsc; replies travel back on a oneshot. Periodic work
//! (purple sweep, stats, checkpoint, reload, scheduled tasks) runs from the
//! same loop, so none of the state needs a lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::board;
use crate::bus::{self, ChannelBus, ChannelId};
use crate::checkpoint::{self, ScheduledTask};
use crate::codec::{
    self, duration_minutes, first_line, nlencode, parse_address, split_combo, split_extcombo,
    split_verb, Framing,
};
use crate::color::{Color, ColorPolicy};
use crate::config::{DaemonConfig, SenderClass, SenderClasses};
use crate::hosts::HostsConfig;
use crate::registry::{HostKind, HostResolution, Registry, StatusKey};
use crate::stats::{ConnCounters, Stats};
use crate::status::{
    apply_status, install_modifier, parse_modify, Ack, UpdateMode, UpdateParams, DISABLED_UNTIL_OK,
};

/// Sender name the daemon uses for its own messages.
pub const INTERNAL_SENDER: &str = "vigild";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A complete inbound message, framing already removed.
#[derive(Debug)]
pub struct IngestMessage {
    pub buf: Bytes,
    pub sender: String,
    pub sender_cn: Option<String>,
    pub via_bfq: bool,
}

/// Commands into the core task.
#[derive(Debug)]
pub enum CoreCmd {
    Message { msg: IngestMessage, reply: Option<oneshot::Sender<Bytes>> },
    Reload,
    Rotate,
    Checkpoint,
}

/// Everything the daemon owns, rehomed into one aggregate.
pub struct Daemon {
    pub config: DaemonConfig,
    pub classes: SenderClasses,
    pub policy: ColorPolicy,
    pub hosts: HostsConfig,
    pub registry: Registry,
    pub bus: Arc<ChannelBus>,
    pub stats: Stats,
    pub conn_counters: Arc<ConnCounters>,
    pub tasks: Vec<ScheduledTask>,
    next_task_id: i32,
    file_cache: HashMap<PathBuf, String>,
    stats_host: String,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        let now = crate::epoch_secs();
        let hosts = match config.hosts {
            Some(ref path) => HostsConfig::load(path)?,
            None => HostsConfig::empty(),
        };
        let policy = config.color_policy();
        let classes = config.sender_classes();
        let bus = Arc::new(ChannelBus::new(64, config.channel_size));
        let mut registry = Registry::default();

        let mut tasks = Vec::new();
        if let Some(ref path) = config.checkpoint_file {
            if path.exists() {
                let (restored, loaded) = checkpoint::load(
                    path,
                    &hosts,
                    &mut registry,
                    now,
                    config.flap_count,
                    &config.conn_test,
                )?;
                info!(restored, tasks = loaded.len(), "checkpoint restored");
                tasks = loaded;
            }
        }
        let next_task_id = tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1;

        let stats_host = std::env::var("HOSTNAME").unwrap_or_else(|_| INTERNAL_SENDER.to_owned());

        Ok(Self {
            config,
            classes,
            policy,
            hosts,
            registry,
            bus,
            stats: Stats::new(now),
            conn_counters: Arc::new(ConnCounters::default()),
            tasks,
            next_task_id,
            file_cache: HashMap::new(),
            stats_host,
        })
    }

    // -- Dispatch -------------------------------------------------------------

    /// Top-level message dispatch, re-entered for container payloads.
    pub fn dispatch(
        &mut self,
        buf: &[u8],
        sender: &str,
        cn: Option<&str>,
        via_bfq: bool,
    ) -> Option<Bytes> {
        // Nested framing can arrive via containers or the back-feed queue.
        match Framing::detect(buf) {
            Some(Ok(Framing::Sized { header_len, body })) => {
                let payload = buf.get(header_len..header_len + body.min(buf.len() - header_len))?;
                return self.dispatch(payload, sender, cn, via_bfq);
            }
            Some(Ok(Framing::Compressed { header_len, algo, inflated })) => {
                match codec::inflate(&algo, &buf[header_len..], inflated, self.config.max_msg_size)
                {
                    Ok(plain) => return self.dispatch(&plain, sender, cn, via_bfq),
                    Err(e) => {
                        warn!(sender, %e, "dropping garbled compressed message");
                        self.stats.record_error(format!("bad compressed message from {sender}: {e}"));
                        return None;
                    }
                }
            }
            _ => {}
        }

        if buf.starts_with(b"extcombo ") {
            match split_extcombo(buf) {
                Ok(parts) => {
                    for part in parts {
                        let owned = part.to_vec();
                        self.dispatch(&owned, sender, cn, via_bfq);
                    }
                }
                Err(e) => {
                    warn!(sender, %e, "invalid extcombo");
                    self.stats.record_error(format!("invalid extcombo from {sender}: {e}"));
                }
            }
            return None;
        }

        let text = String::from_utf8_lossy(buf).into_owned();
        let line = first_line(&text);
        let token = line.split_ascii_whitespace().next().unwrap_or("");
        let verb_token = token.split('/').next().unwrap_or("");
        let (verb, _suffix) = split_verb(verb_token);
        if verb.is_empty() {
            return None;
        }

        self.registry.count_sender(sender);
        self.stats.update(verb, via_bfq);

        let Some((class, _responds)) = verb_class(verb, line) else {
            debug!(sender, verb, "unknown message verb");
            self.stats.record_error(format!("unknown verb from {sender}: {}", clip(line, 100)));
            return None;
        };
        if !self.classes.allowed(class, sender, via_bfq || sender == INTERNAL_SENDER) {
            warn!(sender, verb, "sender not allowed for this verb class");
            self.stats.record_error(format!("unauthorized {verb} from {sender}"));
            return None;
        }

        match verb {
            "combo" => {
                let body = text.strip_prefix("combo\n").unwrap_or(&text);
                for part in split_combo(body, "status") {
                    self.handle_status_text(part, sender, cn);
                }
                None
            }
            "combodata" => {
                let body = text.strip_prefix("combodata\n").unwrap_or(&text);
                for part in split_combo(body, "data") {
                    self.handle_data(part, sender);
                }
                None
            }
            "status" | "summary" => {
                self.handle_status_text(&text, sender, cn);
                None
            }
            "data" => {
                self.handle_data(&text, sender);
                None
            }
            "notes" => {
                self.handle_hostmsg(ChannelId::Notes, &text, sender);
                None
            }
            "usermsg" => {
                self.handle_hostmsg(ChannelId::User, &text, sender);
                None
            }
            "modify" | "modifyup" | "modifydown" => {
                self.handle_modify(&text, sender);
                None
            }
            "enable" => {
                self.handle_enadis(true, &text, sender);
                None
            }
            "disable" => {
                self.handle_enadis(false, &text, sender);
                None
            }
            "ack" | "xymondack" => {
                self.handle_ack(&text, sender);
                None
            }
            "ackinfo" => {
                self.handle_ackinfo(&text, sender);
                None
            }
            "notify" => {
                self.handle_notify(&text, sender);
                None
            }
            "drop" | "drophost" | "droptest" | "dropstate" | "rename" | "renamehost"
            | "renametest" => {
                self.handle_drop_rename(&text, sender);
                None
            }
            "config" => self.handle_config(line),
            "schedule" => self.handle_schedule(&text, sender),
            "xymondlog" => self.handle_log_query(line, false),
            "xymondxlog" => self.handle_log_query(line, true),
            "xymondboard" => {
                let args = line.strip_prefix("xymondboard").unwrap_or("");
                Some(Bytes::from(board::render_board(&self.registry, &self.hosts, &self.config, args)))
            }
            "xymondxboard" => {
                let args = line.strip_prefix("xymondxboard").unwrap_or("");
                Some(Bytes::from(board::render_xboard(&self.registry, &self.hosts, args)))
            }
            "hostinfo" => {
                let args = line.strip_prefix("hostinfo").unwrap_or("");
                Some(Bytes::from(board::render_hostinfo(&self.hosts, args)))
            }
            "ghostlist" => {
                let now = crate::epoch_secs();
                self.registry.prune_ghosts(now);
                let mut out = String::new();
                for g in self.registry.ghosts.values() {
                    out.push_str(&format!("{}|{}|{}\n", g.hostname, g.sender, g.last_seen));
                }
                Some(Bytes::from(out))
            }
            "senderstats" => {
                let mut out = String::new();
                for (ip, count) in &self.registry.senders {
                    out.push_str(&format!("{ip}|{count}\n"));
                }
                Some(Bytes::from(out))
            }
            "clientlog" => self.handle_clientlog(line),
            "query" => self.handle_query(line),
            "histsync" => self.handle_histsync(line),
            "ping" | "proxyping" => Some(Bytes::from(format!("vigild {VERSION}\n"))),
            "dummy" => None,
            "client" | "clientsubmit" => self.handle_client(token, &text, sender),
            "clientconfig" => {
                let host = line.split_ascii_whitespace().nth(1)?;
                self.client_config(host)
            }
            "reload" => {
                self.reload();
                None
            }
            "rotate" => {
                self.bus.post_to_all("logrotate", INTERNAL_SENDER);
                None
            }
            "flush" => {
                if line.contains("filecache") {
                    self.file_cache.clear();
                }
                None
            }
            _ => None,
        }
    }

    // -- Status handling ------------------------------------------------------

    fn handle_status_text(&mut self, text: &str, sender: &str, cn: Option<&str>) {
        let now = crate::epoch_secs();
        let line = first_line(text);
        let mut toks = line.split_ascii_whitespace();
        let Some(token0) = toks.next() else { return };
        let (Some(addr), Some(colstr)) = (toks.next(), toks.next()) else {
            debug!(sender, "status message without address/color");
            self.stats.record_error(format!("bogus status from {sender}: {}", clip(line, 100)));
            return;
        };

        let (verb_part, grouplist) = match token0.split_once("/group:") {
            Some((v, g)) => (v, Some(g.to_owned())),
            None => (token0, None),
        };
        let (verb, suffix) = split_verb(verb_part);
        let is_summary = verb == "summary";
        let validity = suffix.and_then(duration_minutes).unwrap_or(self.config.default_validity);

        let Some(color) = Color::parse(colstr) else {
            debug!(sender, colstr, "bad color in status message");
            self.stats.record_error(format!("bad color '{colstr}' from {sender}"));
            return;
        };
        if color == Color::Purple && sender != INTERNAL_SENDER {
            warn!(sender, "ignored external PURPLE status update");
            self.stats.record_error(format!("ignored PURPLE status from {sender}"));
            return;
        }

        let (hostname, testname, kind) = if is_summary {
            match addr.split_once('.') {
                Some((h, t)) => (h.to_owned(), t.to_owned(), HostKind::Summary),
                None => return,
            }
        } else {
            match parse_address(addr) {
                Some(a) => (a.host, a.test, HostKind::Normal),
                None => return,
            }
        };

        let (hostname, ip) = if is_summary {
            (hostname, String::new())
        } else {
            match self.registry.resolve_host(
                &hostname,
                sender,
                &self.hosts,
                self.config.ghosts,
                INTERNAL_SENDER,
                now,
            ) {
                HostResolution::Known { hostname, ip } => (hostname, ip),
                HostResolution::Dropped => return,
            }
        };

        // Summary pseudo-tests carry dots; real test names are restricted.
        if !is_summary && !valid_test_name(&testname) {
            warn!(sender, test = testname, "invalid test name rejected");
            return;
        }

        // Downtime check: a would-be alert inside a configured window is
        // forced blue, with the window's cause as the disable text.
        let mut incoming = color;
        let mut downcause = None;
        if matches!(color, Color::Red | Color::Yellow | Color::Purple) {
            if let Some(cause) = self.hosts.get(&hostname).and_then(|i| {
                i.downtime_cause(&testname, now).map(str::to_owned)
            }) {
                incoming = Color::Blue;
                downcause = Some(cause);
            }
        }

        let clientsave = self.config.clientsave(&testname);
        let test = self.registry.intern_test(&testname, clientsave);
        let origin = self.registry.intern_origin("");
        let log = self.registry.get_or_create_status(
            &hostname,
            &ip,
            kind,
            &test,
            &origin,
            incoming,
            now,
            self.config.flap_count,
            &self.config.conn_test,
        );
        log.downtime_active = downcause.is_some();

        let key: StatusKey = (test, origin);
        self.run_update(
            &hostname,
            &key,
            text,
            sender,
            cn,
            grouplist.as_deref(),
            incoming,
            downcause.as_deref(),
            UpdateMode::Status,
            validity,
            true,
        );
    }

    /// Run the pipeline on one record and carry out the registry-level and
    /// channel-level effects it reports.
    #[allow(clippy::too_many_arguments)]
    fn run_update(
        &mut self,
        hostname: &str,
        key: &StatusKey,
        msg: &str,
        sender: &str,
        cn: Option<&str>,
        grouplist: Option<&str>,
        incoming: Color,
        downcause: Option<&str>,
        mode: UpdateMode,
        validity: i64,
        store_message: bool,
    ) {
        let now = crate::epoch_secs();
        let info = self.hosts.get(hostname);
        let is_summary = self
            .registry
            .hosts
            .get(hostname)
            .map(|h| h.kind == HostKind::Summary)
            .unwrap_or(false);

        let params = UpdateParams {
            now,
            validity_min: validity,
            flap_count: self.config.flap_count,
            flap_threshold: self.config.flap_seconds,
            ack_each_color: self.config.ack_each_color,
            policy: self.policy,
            host_info: info,
            internal_sender: INTERNAL_SENDER,
            mode,
            is_summary,
            store_message,
            host_name: hostname,
        };

        let Some(log) =
            self.registry.hosts.get_mut(hostname).and_then(|h| h.statuses.get_mut(key))
        else {
            return;
        };
        let outcome = apply_status(log, msg, sender, cn, grouplist, incoming, downcause, &params);

        if outcome.need_cookie {
            self.registry.assign_cookie(hostname, key, now, self.config.cookie_lifetime);
        }
        if outcome.clear_cookie {
            self.registry.clear_cookie(hostname, key);
        }
        if let Some((old, new)) = outcome.multi_source.clone() {
            warn!(host = hostname, test = %key.0, old, new, "multiple sources for one status");
            self.registry.record_multi_source(hostname, &key.0, old, new, now);
        }

        let info = self.hosts.get(hostname);
        let Some(host) = self.registry.hosts.get(hostname) else { return };
        let Some(log) = host.statuses.get(key) else { return };
        let clientsave = self.registry.tests.get(&key.0).map(|t| t.clientsave).unwrap_or(false);

        if outcome.post_enadis {
            self.bus.channel(ChannelId::Enadis).post(
                "enadis",
                Some(hostname),
                sender,
                &bus::enadis_fields(log, host),
            );
        }
        if outcome.post_stachg {
            self.bus.channel(ChannelId::Stachg).post(
                "stachg",
                Some(hostname),
                sender,
                &bus::stachg_fields(log, host, msg),
            );
        }
        if outcome.maybe_clichg && clientsave && !host.client_msgs.is_empty() {
            self.bus.channel(ChannelId::Clichg).post(
                "clichg",
                Some(hostname),
                sender,
                &bus::clichg_fields(host),
            );
        }
        if outcome.post_page {
            self.bus.channel(ChannelId::Page).post(
                "page",
                Some(hostname),
                sender,
                &bus::page_fields(log, host, info, msg),
            );
        }
        if outcome.post_status {
            self.bus.channel(ChannelId::Status).post(
                "status",
                Some(hostname),
                sender,
                &bus::status_fields(log, host, info, msg),
            );
        }
    }

    // -- Other verb handlers --------------------------------------------------

    fn handle_data(&mut self, text: &str, sender: &str) {
        let now = crate::epoch_secs();
        let line = first_line(text);
        let Some(addr) = line.split_ascii_whitespace().nth(1) else { return };
        let Some(a) = parse_address(addr) else { return };
        let resolution = self.registry.resolve_host(
            &a.host,
            sender,
            &self.hosts,
            self.config.ghosts,
            INTERNAL_SENDER,
            now,
        );
        let HostResolution::Known { hostname, .. } = resolution else { return };
        let info = self.hosts.get(&hostname);
        let fields = bus::data_fields("", &hostname, &a.test, info, text);
        self.bus.channel(ChannelId::Data).post("data", Some(&hostname), sender, &fields);
    }

    fn handle_hostmsg(&mut self, id: ChannelId, text: &str, sender: &str) {
        let line = first_line(text);
        let Some(hostname) = line.split_ascii_whitespace().nth(1) else { return };
        let hostname = hostname.replace(',', ".");
        let marker = id.as_str().to_owned();
        let fields = bus::hostmsg_fields(&hostname, text);
        self.bus.channel(id).post(&marker, Some(&hostname), sender, &fields);
    }

    fn handle_modify(&mut self, text: &str, sender: &str) {
        let now = crate::epoch_secs();
        let Some(spec) = parse_modify(text, now) else {
            debug!(sender, "garbled modify statement");
            self.stats.record_error(format!("garbled modify from {sender}"));
            return;
        };
        let Some(a) = parse_address(&spec.address) else { return };
        let Some(host) = self.registry.hosts.get_mut(&a.host) else { return };
        let Some(log) = host.status_by_test_mut(&a.test) else { return };

        let is_new = install_modifier(log, &spec);
        let mode = if is_new { UpdateMode::ModifyNew } else { UpdateMode::ModifyExisting };
        let key: StatusKey = (log.test.clone(), log.origin.clone());
        let msg = log.message.clone();
        let stored_sender = log.sender.clone();
        let grouplist = log.group_list.clone();
        let color = log.color;
        self.run_update(
            &a.host,
            &key,
            &msg,
            &stored_sender,
            None,
            grouplist.as_deref(),
            color,
            None,
            mode,
            self.config.default_validity,
            false,
        );
    }

    fn handle_enadis(&mut self, enable: bool, text: &str, sender: &str) {
        let now = crate::epoch_secs();
        let line = first_line(text);
        let mut toks = line.split_ascii_whitespace();
        let _verb = toks.next();
        let Some(hosttest) = toks.next() else {
            debug!(sender, "enable/disable without host.test");
            return;
        };

        let mut expires = 0;
        let mut dismsg = String::new();
        if !enable {
            let Some(durstr) = toks.next() else {
                debug!(sender, "disable without duration");
                return;
            };
            if durstr == "-1" {
                expires = DISABLED_UNTIL_OK;
            } else {
                let minutes = duration_minutes(durstr).unwrap_or(0);
                expires = now + minutes * 60;
                // Round up to the next whole minute.
                let rounding = 60 - expires.rem_euclid(60);
                if rounding < 60 {
                    expires += rounding;
                }
            }
            // Find the duration token after the address, so a duration-like
            // substring inside the hostname cannot confuse the text capture.
            let search_from = line.find(hosttest).map(|p| p + hosttest.len()).unwrap_or(0);
            let after_dur = match line[search_from..].find(durstr) {
                Some(pos) => &line[search_from + pos + durstr.len()..],
                None => "",
            };
            let rest_of_msg = &text[line.len()..];
            dismsg = format!("{}{}", after_dur.trim_start(), rest_of_msg);
            let trimmed = dismsg.trim();
            dismsg = if trimmed.is_empty() { "(No reason given)".to_owned() } else { trimmed.to_owned() };
        }

        let (hostpart, testpart) = if let Some(h) = hosttest.strip_suffix(".*").or_else(|| hosttest.strip_suffix('*')) {
            (h.to_owned(), None)
        } else {
            match parse_address(hosttest) {
                Some(a) => (a.host.replace('.', ","), Some(a.test)),
                None => return,
            }
        };
        let hostname = hostpart.replace(',', ".");
        if !self.registry.hosts.contains_key(&hostname) {
            return;
        }

        let keys: Vec<StatusKey> = {
            let Some(host) = self.registry.hosts.get(&hostname) else { return };
            host.statuses
                .keys()
                .filter(|(t, _)| testpart.as_deref().is_none_or(|tp| t.as_ref() == tp))
                .cloned()
                .collect()
        };

        for key in keys {
            {
                let Some(log) =
                    self.registry.hosts.get_mut(&hostname).and_then(|h| h.statuses.get_mut(&key))
                else {
                    continue;
                };
                if enable {
                    log.enable_time = 0;
                    log.dis_msg = None;
                } else {
                    log.enable_time = expires;
                    if expires == DISABLED_UNTIL_OK {
                        log.valid_time = i64::MAX;
                    }
                    log.dis_msg = Some(dismsg.clone());
                }
            }
            {
                let Some(host) = self.registry.hosts.get(&hostname) else { continue };
                let Some(log) = host.statuses.get(&key) else { continue };
                self.bus.channel(ChannelId::Enadis).post(
                    "enadis",
                    Some(&hostname),
                    sender,
                    &bus::enadis_fields(log, host),
                );
            }
            if !enable {
                // Trigger an immediate re-evaluation so the status goes blue.
                let (msg, grouplist) = {
                    let Some(log) =
                        self.registry.hosts.get(&hostname).and_then(|h| h.statuses.get(&key))
                    else {
                        continue;
                    };
                    (log.message.clone(), log.group_list.clone())
                };
                self.run_update(
                    &hostname,
                    &key,
                    &msg,
                    sender,
                    None,
                    grouplist.as_deref(),
                    Color::Blue,
                    None,
                    UpdateMode::Status,
                    self.config.default_validity,
                    false,
                );
            }
        }
    }

    fn handle_ack(&mut self, text: &str, sender: &str) {
        let now = crate::epoch_secs();
        let line = first_line(text);
        let mut toks = line.split_ascii_whitespace();
        let _verb = toks.next();
        let Some(mut cookie) = toks.next() else { return };
        // Legacy form: "ack ack_event COOKIE DURATION TEXT".
        if cookie == "ack_event" {
            match toks.next() {
                Some(c) => cookie = c,
                None => return,
            }
        }
        let Some(durstr) = toks.next() else { return };
        let duration = duration_minutes(durstr).unwrap_or(0);
        let ackmsg: String = {
            let rest: Vec<&str> = toks.collect();
            format!("{}{}", rest.join(" "), &text[line.len()..])
        };

        // A leading '-' acks every alerting test on the same host.
        let (all_tests, cookie) = match cookie.strip_prefix('-') {
            Some(c) => (true, c),
            None => (false, cookie),
        };
        let Some((hostname, key)) = self.registry.find_cookie(cookie) else {
            debug!(sender, cookie, "ack for unknown cookie");
            return;
        };

        let keys: Vec<StatusKey> = if all_tests {
            self.registry
                .hosts
                .get(&hostname)
                .map(|h| {
                    h.statuses
                        .iter()
                        .filter(|(_, log)| log.active_alert)
                        .map(|(k, _)| k.clone())
                        .collect()
                })
                .unwrap_or_default()
        } else {
            vec![key]
        };

        for key in keys {
            {
                let Some(log) =
                    self.registry.hosts.get_mut(&hostname).and_then(|h| h.statuses.get_mut(&key))
                else {
                    continue;
                };
                log.ack_time = now + duration * 60;
                if log.color > log.max_acked_color {
                    log.max_acked_color = log.color;
                }
                if log.valid_time < log.ack_time {
                    log.valid_time = log.ack_time;
                }
                log.ack_msg = Some(ackmsg.trim().to_owned());
            }
            let Some(host) = self.registry.hosts.get(&hostname) else { continue };
            let Some(log) = host.statuses.get(&key) else { continue };
            self.bus.channel(ChannelId::Page).post(
                "ack",
                Some(&hostname),
                sender,
                &bus::ack_fields(log, host, log.ack_msg.as_deref().unwrap_or("")),
            );
        }
    }

    fn handle_ackinfo(&mut self, text: &str, sender: &str) {
        let now = crate::epoch_secs();
        // Either one line of `ackinfo host.test LEVEL VALIDSECS ACKEDBY MSG`
        // or the same items on separate lines.
        let mut items: Vec<String> = Vec::new();
        let line = first_line(text);
        let line_toks: Vec<&str> = line.split_ascii_whitespace().collect();
        if line_toks.len() >= 6 {
            items.push(line_toks[1].to_owned());
            items.push(line_toks[2].to_owned());
            items.push(line_toks[3].to_owned());
            items.push(line_toks[4].to_owned());
            items.push(line_toks[5..].join(" "));
        } else {
            for (i, l) in text.lines().enumerate() {
                let l = if i == 0 {
                    l.split_ascii_whitespace().nth(1).unwrap_or("")
                } else {
                    l.trim()
                };
                items.push(l.to_owned());
            }
        }
        if items.len() < 5 {
            return;
        }

        let Some(a) = parse_address(&items[0]) else { return };
        let Ok(level) = items[1].parse::<i32>() else { return };
        let valid_secs: i64 = match items[2].parse::<i64>() {
            Ok(-1) => 365 * 24 * 60 * 60,
            Ok(v) => v,
            Err(_) => return,
        };
        let acked_by = items[3].clone();
        let msg = items[4].clone();
        let valid_until = now + valid_secs;
        if valid_until <= now || acked_by.is_empty() || msg.is_empty() {
            return;
        }

        let Some(host) = self.registry.hosts.get_mut(&a.host) else { return };
        let Some(log) = host.status_by_test_mut(&a.test) else { return };

        match log.acks.iter_mut().find(|x| x.level == level && x.acked_by == acked_by) {
            Some(existing) => {
                existing.received = now;
                existing.valid_until = valid_until;
                existing.clear_time = valid_until;
                existing.msg = msg.clone();
            }
            None => log.acks.push(Ack {
                received: now,
                valid_until,
                clear_time: valid_until,
                level,
                acked_by: acked_by.clone(),
                msg: msg.clone(),
            }),
        }

        debug!(sender, host = %a.host, test = %a.test, level, "ackinfo recorded");
        let lastchange = log.last_change.first().copied().unwrap_or(0);
        if let Some(ref path) = self.config.ack_log {
            let entry = format!(
                "{now} {host} {test} {acked_by} {level} {lastchange} {now} {valid_until} {msg}\n",
                host = a.host,
                test = a.test,
                msg = nlencode(&msg),
            );
            if let Err(e) = append_line(path, &entry) {
                error!(%e, "cannot write ack-info log");
            }
        }
    }

    fn handle_notify(&mut self, text: &str, sender: &str) {
        let line = first_line(text);
        let Some(addr) = line.split_ascii_whitespace().nth(1) else { return };
        let Some(a) = parse_address(addr) else { return };
        let info = self.hosts.get(&a.host);
        let msgtext = match line.find(addr) {
            Some(pos) => &text[pos + addr.len()..],
            None => text,
        };
        let fields = bus::notify_fields(&a.host, &a.test, info, msgtext.trim_start());
        self.bus.channel(ChannelId::Page).post("notify", Some(&a.host), sender, &fields);
    }

    fn handle_drop_rename(&mut self, text: &str, sender: &str) {
        let line = first_line(text);
        let toks: Vec<&str> = line.split_ascii_whitespace().collect();
        if toks.len() < 2 {
            return;
        }
        let verb = toks[0];
        let host = toks[1].replace(',', ".");

        // Downstream workers clean their own persistence from the broadcast.
        self.bus.post_to_all(line, sender);

        match (verb, toks.len()) {
            ("drophost", _) | ("drop", 2) => self.registry.drop_host(&host, false),
            ("dropstate", _) => self.registry.drop_host(&host, true),
            ("droptest", 3) | ("drop", 3) => self.registry.drop_test(&host, toks[2]),
            ("renamehost", 3) | ("rename", 3) => {
                if !self.registry.rename_host(&host, toks[2]) {
                    warn!(old = %host, new = toks[2], "rename failed");
                }
            }
            ("renametest", 4) | ("rename", 4) => {
                let newname = self.registry.intern_test(toks[3], self.config.clientsave(toks[3]));
                self.registry.rename_test(&host, toks[2], &newname);
            }
            _ => debug!(verb, "garbled drop/rename command"),
        }
    }

    fn handle_config(&mut self, line: &str) -> Option<Bytes> {
        let name = line.split_ascii_whitespace().nth(1)?;
        self.cached_file(name)
    }

    fn client_config(&mut self, hostname: &str) -> Option<Bytes> {
        let name = format!("{}.cfg", hostname.replace(',', "."));
        self.cached_file(&name)
    }

    /// Read a file below the configuration directory through the file cache.
    fn cached_file(&mut self, name: &str) -> Option<Bytes> {
        if name.contains("..") || name.starts_with('/') {
            warn!(name, "rejecting config path outside the configuration directory");
            return None;
        }
        let dir = self.config.config_dir.clone()?;
        let path = dir.join(name);
        if let Some(cached) = self.file_cache.get(&path) {
            return Some(Bytes::from(cached.clone()));
        }
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                self.file_cache.insert(path, contents.clone());
                Some(Bytes::from(contents))
            }
            Err(_) => None,
        }
    }

    fn handle_schedule(&mut self, text: &str, sender: &str) -> Option<Bytes> {
        let now = crate::epoch_secs();
        let line = first_line(text);
        let mut toks = line.split_ascii_whitespace();
        let _verb = toks.next();
        match toks.next() {
            None => {
                let mut out = String::new();
                for t in &self.tasks {
                    out.push_str(&format!(
                        "{}|{}|{}|{}\n",
                        t.id,
                        t.execution_time,
                        t.sender,
                        nlencode(&t.command)
                    ));
                }
                Some(Bytes::from(out))
            }
            Some("cancel") => {
                if let Some(id) = toks.next().and_then(|t| t.parse::<i32>().ok()) {
                    self.tasks.retain(|t| t.id != id);
                }
                None
            }
            Some(when) => {
                let execution_time = if let Some(rel) = when.strip_prefix('+') {
                    now + duration_minutes(rel).unwrap_or(0) * 60
                } else {
                    when.parse().unwrap_or(0)
                };
                let command = match line.find(when) {
                    Some(pos) => line[pos + when.len()..].trim().to_owned(),
                    None => return None,
                };
                if execution_time <= now || command.is_empty() {
                    return None;
                }
                let id = self.next_task_id;
                self.next_task_id += 1;
                info!(id, execution_time, command, "task scheduled");
                self.tasks.push(ScheduledTask {
                    id,
                    execution_time,
                    sender: sender.to_owned(),
                    command,
                });
                None
            }
        }
    }

    fn handle_client(&mut self, verb_token: &str, text: &str, sender: &str) -> Option<Bytes> {
        let now = crate::epoch_secs();
        let line = first_line(text);
        let collector = verb_token.split_once('/').map(|(_, c)| c.to_owned()).unwrap_or_default();
        let addr = line.split_ascii_whitespace().nth(1)?;
        let mut parts = addr.split('.');
        let hostpart = parts.next()?;
        let _ostype = parts.next();
        let hostname = hostpart.replace(',', ".");

        let resolution = self.registry.resolve_host(
            &hostname,
            sender,
            &self.hosts,
            self.config.ghosts,
            INTERNAL_SENDER,
            now,
        );
        let HostResolution::Known { hostname, ip } = resolution else { return None };

        if !self.config.no_clientlog {
            let host = self.registry.get_or_create_host(&hostname, &ip, HostKind::Normal);
            let body = text.split_once('\n').map(|(_, b)| b.to_owned()).unwrap_or_default();
            match host.client_msgs.iter_mut().find(|s| s.collector == collector) {
                Some(s) => {
                    s.msg = body;
                    s.tstamp = now;
                }
                None => host.client_msgs.push(crate::registry::ClientSection {
                    collector: collector.clone(),
                    msg: body,
                    tstamp: now,
                }),
            }
            host.client_tstamp = now;
        }

        let info = self.hosts.get(&hostname);
        let fields = format!(
            "{hostname}|{collector}|{class}\n{text}",
            class = info.map(|i| i.class.as_str()).unwrap_or(""),
        );
        self.bus.channel(ChannelId::Client).post("client", Some(&hostname), sender, &fields);

        if verb_token.starts_with("clientsubmit") {
            return None;
        }
        self.client_config(&hostname)
    }

    fn handle_clientlog(&mut self, line: &str) -> Option<Bytes> {
        let mut toks = line.split_ascii_whitespace();
        let _verb = toks.next();
        let hostname = toks.next()?.replace(',', ".");
        let sections: Option<Vec<String>> = toks
            .find_map(|t| t.strip_prefix("section=").map(str::to_owned))
            .map(|csv| csv.split(',').map(str::to_owned).collect());

        let host = self.registry.hosts.get(&hostname)?;
        let mut out = String::new();
        for s in &host.client_msgs {
            if let Some(ref wanted) = sections {
                if !wanted.iter().any(|w| *w == s.collector) {
                    continue;
                }
            }
            if !s.collector.is_empty() {
                out.push_str(&format!("[collector:{}]\n", s.collector));
            }
            out.push_str(&s.msg);
            if !s.msg.ends_with('\n') {
                out.push('\n');
            }
        }
        Some(Bytes::from(out))
    }

    fn handle_log_query(&mut self, line: &str, xml: bool) -> Option<Bytes> {
        let mut toks = line.split_ascii_whitespace();
        let _verb = toks.next();
        let addr = toks.next()?;
        let a = parse_address(addr)?;
        let args: Vec<&str> = toks.collect();
        let args = args.join(" ");
        let now = crate::epoch_secs();

        // Acks past their clear time are flushed before reporting.
        if let Some(log) =
            self.registry.hosts.get_mut(&a.host).and_then(|h| h.status_by_test_mut(&a.test))
        {
            log.flush_acks(now, false);
        }

        let out = if xml {
            board::render_xlog(&self.registry, &a.host, &a.test, now)?
        } else {
            board::render_log(&self.registry, &self.hosts, &a.host, &a.test, &args)?
        };
        Some(Bytes::from(out))
    }

    fn handle_query(&mut self, line: &str) -> Option<Bytes> {
        let addr = line.split_ascii_whitespace().nth(1)?;
        let a = parse_address(addr)?;
        let host = self.registry.hosts.get(&a.host)?;
        let log = host.status_by_test(&a.test)?;
        Some(Bytes::from(format!("{} {}\n", log.color, log.line1)))
    }

    fn handle_histsync(&mut self, line: &str) -> Option<Bytes> {
        let addr = line.split_ascii_whitespace().nth(1)?;
        let a = parse_address(addr)?;
        let log = self.registry.hosts.get_mut(&a.host)?.status_by_test_mut(&a.test)?;
        log.hist_synced = false;
        Some(Bytes::from("OK\n"))
    }

    // -- Periodic work --------------------------------------------------------

    /// The purple sweeper: statuses past their validity are coerced.
    pub fn sweep_purple(&mut self) {
        let now = crate::epoch_secs();
        let mut expired: Vec<(String, StatusKey, bool)> = Vec::new();
        for host in self.registry.hosts.values() {
            for (key, log) in &host.statuses {
                if log.valid_time < now {
                    expired.push((
                        host.hostname.clone(),
                        key.clone(),
                        host.kind == HostKind::Summary,
                    ));
                }
            }
        }

        for (hostname, key, is_summary) in expired {
            if is_summary {
                // Summaries are write-expiring: a stale one is dropped.
                self.registry.remove_status(&hostname, &key);
                continue;
            }

            let info = self.hosts.get(&hostname);
            let mut newcolor = Color::Purple;
            if let Some(host) = self.registry.hosts.get(&hostname) {
                let ping_color = host
                    .ping_status
                    .as_ref()
                    .and_then(|pk| host.statuses.get(pk))
                    .map(|l| l.color);
                let no_clear = info.is_some_and(|i| i.has_flag("noclear"));
                if matches!(
                    ping_color,
                    Some(Color::Red | Color::Yellow | Color::Blue | Color::Clear)
                ) && !no_clear
                {
                    newcolor = Color::Clear;
                }
            }
            if newcolor == Color::Purple && info.is_some_and(|i| i.has_flag("dialup")) {
                newcolor = Color::Clear;
            }

            let mut downcause = None;
            if let Some(cause) = info.and_then(|i| i.downtime_cause(&key.0, now)) {
                newcolor = Color::Blue;
                downcause = Some(cause.to_owned());
            }

            let (msg, grouplist) = {
                let Some(log) =
                    self.registry.hosts.get_mut(&hostname).and_then(|h| h.statuses.get_mut(&key))
                else {
                    continue;
                };
                log.downtime_active = downcause.is_some();
                (log.message.clone(), log.group_list.clone())
            };
            debug!(host = %hostname, test = %key.0, color = %newcolor, "status expired");
            self.run_update(
                &hostname,
                &key,
                &msg,
                INTERNAL_SENDER,
                None,
                grouplist.as_deref(),
                newcolor,
                downcause.as_deref(),
                UpdateMode::Status,
                self.config.default_validity,
                false,
            );
        }
    }

    /// Execute scheduled tasks that have come due.
    pub fn run_scheduled(&mut self) {
        let now = crate::epoch_secs();
        let (due, later): (Vec<ScheduledTask>, Vec<ScheduledTask>) =
            std::mem::take(&mut self.tasks).into_iter().partition(|t| t.execution_time <= now);
        self.tasks = later;
        for task in due {
            info!(id = task.id, command = %task.command, "running scheduled task");
            let buf = task.command.clone().into_bytes();
            self.dispatch(&buf, &task.sender, None, true);
        }
    }

    /// Feed the periodic statistics report through the normal status path.
    pub fn stats_tick(&mut self) {
        let now = crate::epoch_secs();
        let host = self.stats_host.clone();
        let body =
            self.stats.generate(&host, now, &self.registry, &self.bus, &self.conn_counters);
        self.handle_status_text(&body, INTERNAL_SENDER, None);
    }

    /// Render the checkpoint; the caller writes it off the core task.
    pub fn checkpoint_render(&mut self) -> Option<(PathBuf, String)> {
        let path = self.config.checkpoint_file.clone()?;
        let now = crate::epoch_secs();
        let contents = checkpoint::render(&mut self.registry, &self.tasks, now);
        Some((path, contents))
    }

    /// Reload the hosts configuration; statuses for hosts that are gone are
    /// dropped the same way an explicit drophost would.
    pub fn reload(&mut self) {
        match self.hosts.reload() {
            Ok(true) => info!(hosts = self.hosts.len(), "host configuration reloaded"),
            Ok(false) => return,
            Err(e) => {
                error!(%e, "host configuration reload failed");
                self.stats.record_error(format!("hosts reload failed: {e}"));
                return;
            }
        }
        if self.hosts.is_empty() {
            return;
        }
        let gone: Vec<String> = self
            .registry
            .hosts
            .values()
            .filter(|h| h.kind == HostKind::Normal && !self.hosts.contains(&h.hostname))
            .map(|h| h.hostname.clone())
            .collect();
        for hostname in gone {
            info!(host = %hostname, "dropping host no longer in configuration");
            self.bus.post_to_all(&format!("drophost {hostname}"), INTERNAL_SENDER);
            self.registry.drop_host(&hostname, false);
        }
        self.bus.post_to_all("reload", INTERNAL_SENDER);
    }
}

/// The dispatch table: verb → (authorization class, responds).
fn verb_class(verb: &str, line: &str) -> Option<(SenderClass, bool)> {
    Some(match verb {
        "status" | "combo" | "extcombo" | "combodata" | "data" | "summary" | "modify"
        | "modifyup" | "modifydown" | "usermsg" | "clientsubmit" => (SenderClass::Status, false),
        "client" | "clientconfig" => (SenderClass::Status, true),
        "enable" | "disable" | "ack" | "xymondack" | "ackinfo" | "notes" | "notify" => {
            (SenderClass::Maint, false)
        }
        "drop" | "drophost" | "droptest" | "dropstate" | "rename" | "renamehost" | "renametest"
        | "schedule" => (SenderClass::Admin, verb == "schedule"),
        "config" => (SenderClass::Admin, true),
        "xymondlog" | "xymondxlog" | "xymondboard" | "xymondxboard" | "hostinfo" | "ghostlist"
        | "senderstats" | "clientlog" | "query" | "histsync" => (SenderClass::Www, true),
        "ping" | "proxyping" => (SenderClass::Any, true),
        "dummy" | "reload" | "rotate" => (SenderClass::Any, false),
        "flush" if line.contains("filecache") => (SenderClass::Any, false),
        _ => return None,
    })
}

/// Truncate on a char boundary, for bounded error logging.
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn valid_test_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b':' | b'\\' | b'/' | b'_' | b'-'))
}

fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())
}

// -- The core loop ------------------------------------------------------------

/// Run the core task until shutdown. Consumes commands and drives the
/// periodic ticks; on shutdown drains with a final checkpoint.
pub async fn core_loop(
    mut daemon: Daemon,
    mut rx: mpsc::Receiver<CoreCmd>,
    shutdown: CancellationToken,
) {
    use tokio::time::{interval_at, Duration, Instant};

    let start = Instant::now();
    let mut purple = interval_at(start + daemon.config.purple_every(), daemon.config.purple_every());
    let mut stats = interval_at(start + daemon.config.stats_every(), daemon.config.stats_every());
    let mut save =
        interval_at(start + daemon.config.checkpoint_every(), daemon.config.checkpoint_every());
    let mut reload =
        interval_at(start + daemon.config.reload_every(), daemon.config.reload_every());
    let mut sched = interval_at(start + Duration::from_secs(1), Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            cmd = rx.recv() => {
                match cmd {
                    Some(CoreCmd::Message { msg, reply }) => {
                        let resp = daemon.dispatch(&msg.buf, &msg.sender, msg.sender_cn.as_deref(), msg.via_bfq);
                        if let Some(tx) = reply {
                            let _ = tx.send(resp.unwrap_or_default());
                        }
                    }
                    Some(CoreCmd::Reload) => daemon.reload(),
                    Some(CoreCmd::Rotate) => daemon.bus.post_to_all("logrotate", INTERNAL_SENDER),
                    Some(CoreCmd::Checkpoint) => spawn_checkpoint(&mut daemon),
                    None => break,
                }
            }
            _ = purple.tick() => {
                if !daemon.config.no_purple {
                    daemon.sweep_purple();
                }
            }
            _ = stats.tick() => daemon.stats_tick(),
            _ = save.tick() => spawn_checkpoint(&mut daemon),
            _ = reload.tick() => daemon.reload(),
            _ = sched.tick() => daemon.run_scheduled(),
        }
    }

    info!("core loop draining");
    daemon.bus.post_to_all("shutdown", INTERNAL_SENDER);
    if let Some((path, contents)) = daemon.checkpoint_render() {
        if let Err(e) = checkpoint::save_to(&path, &contents) {
            error!(%e, "final checkpoint failed");
            std::process::exit(1);
        }
    }
}

/// Serialize on the core task, write on a blocking worker. A write failure
/// is fatal so the supervisor restarts us with intact state on disk.
fn spawn_checkpoint(daemon: &mut Daemon) {
    let Some((path, contents)) = daemon.checkpoint_render() else {
        return;
    };
    tokio::task::spawn_blocking(move || {
        if let Err(e) = checkpoint::save_to(&path, &contents) {
            error!(%e, path = %path.display(), "checkpoint write failed");
            std::process::exit(1);
        }
        debug!(path = %path.display(), bytes = contents.len(), "checkpoint written");
    });
}

#[cfg(test)]
#[path = "core_tests.rs"]
mod tests;
