// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-(host, test) status record and its update pipeline.
//!
//! [`apply_status`] is the heart of the daemon: every incoming status, modify
//! re-evaluation, enable/disable fallout, and purple sweep runs through it.
//! The function owns everything that can be decided from the record itself;
//! registry-level effects (cookie assignment, multi-source bookkeeping,
//! channel posts) are reported back through [`UpdateOutcome`] for the caller
//! to carry out.

use std::sync::Arc;

use crate::codec::{extract_test_flags, nlencode};
use crate::color::{AlertState, Color, ColorPolicy};
use crate::hosts::HostInfo;

/// Lingering acks self-clean this many seconds after a recovery.
pub const ACK_CLEAR_DELAY: i64 = 720;

/// Sentinel for a disable that lasts until the first OK status.
pub const DISABLED_UNTIL_OK: i64 = -1;

/// Modifier message budget when a `modify` names neither `+N` nor `+Nv`.
pub const DEFAULT_MODIFY_VALIDITY: i32 = 3;

/// Stored first-line excerpt cap.
pub const MAX_LINE1: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierKind {
    Normal,
    Down,
    Up,
}

/// An out-of-band color override, budgeted by message count and/or wall clock.
#[derive(Debug, Clone)]
pub struct Modifier {
    pub source: String,
    /// Pre-formatted cause line, `&color cause\n`.
    pub cause: String,
    pub color: Color,
    pub kind: ModifierKind,
    /// Remaining message budget; `None` means duration-only.
    pub valid: Option<i32>,
    /// Wall-clock expiry, 0 if unset.
    pub valid_until: i64,
}

/// One acknowledgement entry in a status' acklist.
#[derive(Debug, Clone)]
pub struct Ack {
    pub received: i64,
    pub valid_until: i64,
    pub clear_time: i64,
    pub level: i32,
    pub acked_by: String,
    pub msg: String,
}

/// The central entity: state of one (host, test, origin).
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub test: Arc<str>,
    pub origin: Arc<str>,
    pub color: Color,
    pub old_color: Color,
    pub active_alert: bool,
    pub hist_synced: bool,
    pub downtime_active: bool,
    pub flapping: bool,
    pub old_flap_color: Color,
    pub curr_flap_color: Color,
    pub test_flags: Option<String>,
    pub group_list: Option<String>,
    pub sender: String,
    pub sender_cn: Option<String>,
    /// Ring of the most recent transition wall-clocks; index 0 is newest.
    pub last_change: Vec<i64>,
    pub log_time: i64,
    pub valid_time: i64,
    /// 0 = enabled, `DISABLED_UNTIL_OK` = until first OK, else expiry time.
    pub enable_time: i64,
    pub ack_time: i64,
    pub red_start: i64,
    pub yellow_start: i64,
    pub max_acked_color: Color,
    pub message: String,
    pub line1: String,
    pub dis_msg: Option<String>,
    pub ack_msg: Option<String>,
    pub cookie: Option<String>,
    pub cookie_expires: i64,
    pub modifiers: Vec<Modifier>,
    /// Newline-encoded concatenation of the live modifier causes.
    pub modifier_cache: String,
    pub acks: Vec<Ack>,
    pub status_change_count: u64,
}

impl StatusRecord {
    pub fn new(test: Arc<str>, origin: Arc<str>, color: Color, now: i64, flap_count: usize) -> Self {
        let mut last_change = vec![0; flap_count.max(1)];
        last_change[0] = now;
        Self {
            test,
            origin,
            color,
            old_color: color,
            active_alert: false,
            hist_synced: false,
            downtime_active: false,
            flapping: false,
            old_flap_color: color,
            curr_flap_color: color,
            test_flags: None,
            group_list: None,
            sender: String::new(),
            sender_cn: None,
            last_change,
            log_time: 0,
            valid_time: 0,
            enable_time: 0,
            ack_time: 0,
            red_start: 0,
            yellow_start: 0,
            max_acked_color: Color::Green,
            message: String::new(),
            line1: String::new(),
            dis_msg: None,
            ack_msg: None,
            cookie: None,
            cookie_expires: 0,
            modifiers: Vec::new(),
            modifier_cache: String::new(),
            acks: Vec::new(),
            status_change_count: 1,
        }
    }

    /// Drop acks whose clear time or validity has passed (all of them when
    /// `flush_all` is set).
    pub fn flush_acks(&mut self, now: i64, flush_all: bool) {
        self.acks.retain(|a| !flush_all && a.clear_time >= now && a.valid_until >= now);
    }

    /// Render the acklist for board output: one `received:validuntil:level:
    /// ackedby:msg` line per entry, optionally restricted to one level.
    pub fn acklist_string(&self, level: Option<i32>) -> String {
        let mut out = String::new();
        for a in &self.acks {
            if level.is_some_and(|l| a.level != l) {
                continue;
            }
            out.push_str(&format!(
                "{}:{}:{}:{}:{}\n",
                a.received, a.valid_until, a.level, a.acked_by, a.msg
            ));
        }
        out
    }

    /// Human-readable flap summary for board output.
    pub fn flap_info(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            if self.flapping { "1" } else { "0" },
            self.last_change.first().copied().unwrap_or(0),
            self.last_change.last().copied().unwrap_or(0),
            self.old_flap_color.as_str(),
            self.curr_flap_color.as_str()
        )
    }
}

/// How [`apply_status`] was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// A real status arrival; modifier budgets are decremented.
    Status,
    /// Re-evaluation triggered by updating an existing modifier.
    ModifyExisting,
    /// Re-evaluation triggered by installing a new modifier cause.
    ModifyNew,
}

/// Knobs and context for one pipeline run.
pub struct UpdateParams<'a> {
    pub now: i64,
    pub validity_min: i64,
    pub flap_count: usize,
    pub flap_threshold: i64,
    pub ack_each_color: bool,
    pub policy: ColorPolicy,
    pub host_info: Option<&'a HostInfo>,
    pub internal_sender: &'a str,
    pub mode: UpdateMode,
    pub is_summary: bool,
    /// False when the message is the record's own stored message (purple
    /// sweep, enable/disable re-evaluation).
    pub store_message: bool,
    pub host_name: &'a str,
}

/// Registry-level effects decided by the pipeline, for the caller to apply.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub color_changed: bool,
    pub post_status: bool,
    pub post_stachg: bool,
    pub post_page: bool,
    pub post_enadis: bool,
    /// Alerting transition happened and the caller should post to clichg if
    /// the host has client data and the test saves it.
    pub maybe_clichg: bool,
    pub need_cookie: bool,
    pub clear_cookie: bool,
    /// (previous sender, new sender) when a multi-source situation was seen.
    pub multi_source: Option<(String, String)>,
    pub old_state: Option<AlertState>,
    pub new_state: Option<AlertState>,
}

fn is_null_ip(sender: &str) -> bool {
    sender.is_empty() || sender == "0.0.0.0" || sender == "::"
}

fn rotate_ring(ring: &mut [i64]) {
    for i in (1..ring.len()).rev() {
        ring[i] = ring[i - 1];
    }
}

/// Run the full status update pipeline against one record.
#[allow(clippy::too_many_arguments)]
pub fn apply_status(
    log: &mut StatusRecord,
    msg: &str,
    sender: &str,
    sender_cn: Option<&str>,
    grouplist: Option<&str>,
    incoming: Color,
    downcause: Option<&str>,
    p: &UpdateParams<'_>,
) -> UpdateOutcome {
    let now = p.now;
    let mut newcolor = incoming;
    let mut out = UpdateOutcome::default();
    let modifyonly = p.mode != UpdateMode::Status;
    let mut modifychanged = p.mode == UpdateMode::ModifyNew;

    // Modifier evaluation: expire stale entries, then combine what is left.
    if !log.modifiers.is_empty() {
        let mut mcolor: Option<Color> = None;
        let mut mdown: Option<Color> = None;
        let mut mup: Option<Color> = None;
        let mut causes = String::new();
        log.modifiers.retain_mut(|m| {
            if m.valid == Some(0) || (m.valid_until != 0 && m.valid_until < now) {
                modifychanged = true;
                return false;
            }
            // The budget pays for this evaluation; only a real status arrival
            // consumes it.
            if !modifyonly {
                if let Some(v) = m.valid.as_mut() {
                    *v -= 1;
                }
            }
            causes.push_str(&m.cause);
            match m.kind {
                ModifierKind::Down => {
                    mdown = Some(mdown.map_or(m.color, |c: Color| c.min(m.color)));
                }
                ModifierKind::Up => {
                    mup = Some(mup.map_or(m.color, |c: Color| c.max(m.color)));
                }
                ModifierKind::Normal => {
                    mcolor = Some(mcolor.map_or(m.color, |c: Color| c.max(m.color)));
                }
            }
            true
        });
        if !causes.is_empty() || modifychanged {
            log.modifier_cache = nlencode(&causes);
        }
        if let Some(c) = mcolor {
            newcolor = c;
        }
        if let Some(d) = mdown {
            if d < newcolor {
                newcolor = d;
            }
        }
        if let Some(u) = mup {
            if u > newcolor {
                newcolor = u;
            }
        }
    }

    // Flap check: more than flap_count changes inside the threshold window
    // keeps the status at the more severe of prior/current color.
    let noflap = p.host_info.is_some_and(|h| h.noflap(&log.test));
    if modifyonly || p.is_summary {
        // Not a real arrival.
    } else if p.flap_count > 0
        && log
            .last_change
            .get(p.flap_count - 1)
            .is_some_and(|oldest| now - *oldest < p.flap_threshold)
        && !noflap
    {
        if !log.flapping {
            tracing::info!(
                host = p.host_name,
                test = %log.test,
                window = p.flap_threshold,
                "flapping detected"
            );
            log.flapping = true;
            log.old_flap_color = log.color;
            log.curr_flap_color = newcolor;
        } else {
            log.old_flap_color = log.curr_flap_color;
            log.curr_flap_color = newcolor;
        }
        if newcolor < log.color {
            newcolor = log.color;
        }
        // The change is suppressed, so the ring must be rotated here; the
        // status-change path below will not see a color change.
        if log.old_flap_color != log.curr_flap_color && newcolor == log.color {
            rotate_ring(&mut log.last_change);
            log.last_change[0] = now;
        }
    } else {
        log.flapping = false;
    }

    // Disable state machine.
    if log.enable_time == DISABLED_UNTIL_OK {
        if newcolor != Color::Blue && p.policy.decide(newcolor) == AlertState::Ok {
            log.enable_time = 0;
            log.dis_msg = None;
            out.post_enadis = true;
        } else {
            newcolor = Color::Blue;
        }
    } else if log.enable_time > now {
        newcolor = Color::Blue;
    } else if log.enable_time != 0 {
        log.enable_time = 0;
        log.dis_msg = None;
        out.post_enadis = true;
    } else {
        log.dis_msg = None;
        if newcolor == Color::Blue {
            if let Some(cause) = downcause {
                log.dis_msg = Some(cause.to_owned());
            }
        }
    }

    // Ack lifecycle on the simple ack (acktime/ackmsg) fields.
    if log.ack_time != 0 {
        if p.policy.decide(newcolor) == AlertState::Ok {
            log.ack_time = 0;
            log.max_acked_color = Color::Green;
        }
        if p.ack_each_color && log.max_acked_color < newcolor {
            log.ack_time = 0;
        }
        if log.ack_time <= now {
            log.ack_time = 0;
            log.max_acked_color = Color::Green;
            log.ack_msg = None;
        }
    }

    if !modifyonly {
        log.log_time = now;
        log.valid_time = now + p.validity_min * 60;
        if log.ack_time > log.valid_time {
            log.valid_time = log.ack_time;
        }
        if log.enable_time != 0 {
            if log.enable_time == DISABLED_UNTIL_OK {
                log.valid_time = i64::MAX;
            } else if log.enable_time > log.valid_time {
                log.valid_time = log.enable_time;
            }
        } else if newcolor == Color::Purple
            && p.host_info.is_some_and(|h| h.item("XMH_DOWNTIME").is_some())
        {
            // Re-scan soon so a configured downtime window picks it up.
            log.valid_time = now + 60;
        }

        if !log.sender.is_empty()
            && log.sender != sender
            && log.sender != p.internal_sender
            && sender != p.internal_sender
            && !is_null_ip(sender)
            && !p.host_info.is_some_and(|h| h.has_flag("multihomed") || h.has_flag("pulldata"))
        {
            out.multi_source = Some((log.sender.clone(), sender.to_owned()));
        }
        log.sender = sender.to_owned();
        log.sender_cn = sender_cn.map(str::to_owned);
    }

    // Track when red/yellow began, for the delayed-color policy. A yellow
    // keeps its start across an excursion to red; red resets when leaving.
    match newcolor {
        Color::Red => {
            if log.red_start == 0 {
                log.red_start = now;
            }
            if log.yellow_start == 0 {
                log.yellow_start = now;
            }
        }
        Color::Yellow => {
            if log.yellow_start == 0 {
                log.yellow_start = now;
            }
            log.red_start = 0;
        }
        _ => {
            log.red_start = 0;
            log.yellow_start = 0;
        }
    }

    // Delayed red/yellow. Ignored when the current color is purple.
    let delay = |c: Color| -> i64 {
        if log.color == Color::Purple {
            0
        } else {
            p.host_info.map_or(0, |h| h.change_delay(c, &log.test))
        }
    };
    if newcolor == Color::Red {
        let dr = delay(Color::Red);
        if dr > 0 && now - log.red_start < dr {
            let dy = delay(Color::Yellow);
            if now - log.red_start >= dy {
                newcolor = Color::Yellow;
            } else {
                newcolor = log.color;
            }
        }
    } else if newcolor == Color::Yellow {
        let dy = delay(Color::Yellow);
        if dy > 0 && now - log.yellow_start < dy {
            newcolor = log.color;
        }
    }

    log.old_color = log.color;
    log.color = newcolor;
    let old_state = p.policy.decide(log.old_color);
    let new_state = p.policy.decide(newcolor);
    out.old_state = Some(old_state);
    out.new_state = Some(new_state);
    out.color_changed = log.old_color != newcolor;

    log.group_list = grouplist.map(str::to_owned);

    // Acklist entries follow the alert state: recovery schedules them for
    // self-cleaning, a new failure revives them.
    if !log.acks.is_empty() {
        if old_state != AlertState::Ok && new_state == AlertState::Ok {
            if !log.downtime_active {
                for a in &mut log.acks {
                    a.clear_time = now + ACK_CLEAR_DELAY;
                }
            }
        } else if old_state == AlertState::Ok && new_state != AlertState::Ok {
            for a in &mut log.acks {
                a.clear_time = a.valid_until;
            }
        }
    }

    if p.store_message {
        log.message = msg.to_owned();
        let line1 = first_line_data(msg);
        log.line1 = line1.chars().take(MAX_LINE1).collect();
        if let Some(flags) = extract_test_flags(&log.line1) {
            log.test_flags = Some(flags.to_owned());
        }
    }

    // Cookie lifecycle: alerting statuses own a live cookie, others don't.
    if new_state == AlertState::Alert {
        if log.cookie_expires < now {
            out.need_cookie = true;
        }
    } else if log.cookie.is_some() {
        out.clear_cookie = true;
    }

    if !p.is_summary && (!log.hist_synced || out.color_changed || modifychanged) {
        out.post_stachg = true;
        log.hist_synced = true;

        // lastchange is not advanced while a downtime window forces blue.
        if !log.downtime_active && (out.color_changed || modifychanged) {
            out.maybe_clichg = new_state == AlertState::Alert;
            if out.color_changed && p.flap_count > 0 {
                rotate_ring(&mut log.last_change);
            }
            log.last_change[0] = now;
            log.status_change_count += 1;
        }
    }

    if !p.is_summary {
        if new_state == AlertState::Alert {
            log.active_alert = true;
            out.post_page = true;
        } else if log.active_alert && old_state != AlertState::Ok && new_state == AlertState::Ok {
            log.active_alert = false;
            out.post_page = true;
        } else if log.active_alert && (out.color_changed || modifychanged) {
            out.post_page = true;
        }
    }

    out.post_status = !modifyonly || modifychanged;
    out
}

/// Strip the verb and address tokens from the first line of a status
/// message, leaving `color rest-of-line`.
fn first_line_data(msg: &str) -> &str {
    let line = crate::codec::first_line(msg);
    let mut rest = line;
    for _ in 0..2 {
        rest = rest.trim_start();
        match rest.find(|c: char| c.is_ascii_whitespace()) {
            Some(pos) => rest = &rest[pos..],
            None => return "",
        }
    }
    rest.trim_start()
}

// -- Modify parsing -----------------------------------------------------------

/// A parsed `modify` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifySpec {
    pub address: String,
    pub color: Color,
    pub kind: ModifierKind,
    pub source: String,
    pub cause: String,
    pub valid: Option<i32>,
    pub valid_until: i64,
}

/// Parse `modify[up|down][+N][+Nv] host.test COLOR SOURCE CAUSE…`.
/// `+N` is a message budget, `+Nv` a wall-clock validity in minutes.
pub fn parse_modify(msg: &str, now: i64) -> Option<ModifySpec> {
    let line = crate::codec::first_line(msg);
    let mut toks = line.split_ascii_whitespace();
    let verb = toks.next()?;
    let address = toks.next()?.to_owned();
    let color = Color::parse(toks.next()?)?;
    let source = toks.next()?.to_owned();
    let cause = {
        let rest: Vec<&str> = toks.collect();
        if rest.is_empty() {
            return None;
        }
        rest.join(" ")
    };

    let mut parts = verb.split('+');
    let base = parts.next()?;
    let kind = if base.starts_with("modifydown") {
        ModifierKind::Down
    } else if base.starts_with("modifyup") {
        ModifierKind::Up
    } else if base.starts_with("modify") {
        ModifierKind::Normal
    } else {
        return None;
    };

    let mut valid: Option<i32> = None;
    let mut valid_until: i64 = 0;
    for spec in parts {
        if let Some(mins) = spec.strip_suffix('v') {
            if let Some(m) = crate::codec::duration_minutes(mins) {
                valid_until = now + m * 60;
            }
        } else if let Ok(n) = spec.parse::<i32>() {
            if n > 0 {
                valid = Some(n);
            }
        }
    }
    if valid.is_none() && valid_until == 0 {
        valid = Some(DEFAULT_MODIFY_VALIDITY);
    }

    Some(ModifySpec { address, color, kind, source, cause, valid, valid_until })
}

/// Install or refresh the modifier named by `spec`. Returns true when this
/// created a new cause.
pub fn install_modifier(log: &mut StatusRecord, spec: &ModifySpec) -> bool {
    let cause = format!("&{} {}\n", spec.color, spec.cause);
    if let Some(m) = log.modifiers.iter_mut().find(|m| m.source == spec.source) {
        m.color = spec.color;
        m.kind = spec.kind;
        m.valid = spec.valid;
        m.valid_until = spec.valid_until;
        m.cause = cause;
        false
    } else {
        log.modifiers.push(Modifier {
            source: spec.source.clone(),
            cause,
            color: spec.color,
            kind: spec.kind,
            valid: spec.valid,
            valid_until: spec.valid_until,
        });
        true
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
