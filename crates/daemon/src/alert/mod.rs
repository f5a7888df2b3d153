// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Alert manager: consumes the page channel, tracks active alerts, and
//! triggers delivery through the send-alert hook.
//!
//! The worker runs in-process but reads the same text envelopes an external
//! page-channel worker would, so the wire contract stays the interface.

pub mod checkpoint;
pub mod evaluator;
pub mod rules;

use serde::{Deserialize, Serialize};

use crate::color::Color;

/// Lifecycle of one active alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPhase {
    /// Actively paging; re-fires at `next_alert_time`.
    Paging,
    /// No recipient rule matches; parked until rules change.
    NoRecip,
    /// Held by an acknowledgement until it expires.
    Acked,
    /// Recovery notice pending; dispatched once, then dead.
    Recovered,
    /// One-shot informational notice.
    Notify,
    /// Finished; removed at the end of the tick.
    Dead,
}

/// One tracked alert, keyed by (host, test).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub hostname: String,
    pub testname: String,
    /// Page path of the host, for location-scoped recipient rules.
    pub location: String,
    pub ip: String,
    pub color: Color,
    pub max_color: Color,
    pub page_message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ack_message: Option<String>,
    pub event_start: i64,
    pub next_alert_time: i64,
    pub phase: AlertPhase,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cookie: Option<String>,
}

/// A parsed page-channel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    Page {
        host: String,
        test: String,
        ip: String,
        color: Color,
        old_color: Color,
        page_path: String,
        cookie: Option<String>,
        body: String,
    },
    Ack {
        host: String,
        test: String,
        ack_time: i64,
        body: String,
    },
    Notify {
        host: String,
        test: String,
        body: String,
    },
    DropHost(String),
    DropTest(String, String),
    RenameHost(String),
    RenameTest(String, String),
    Shutdown,
}

/// Parse one envelope off the page channel. Returns `None` for markers this
/// worker does not care about (reload, logrotate, …).
pub fn parse_event(envelope: &str) -> Option<PageEvent> {
    let envelope = envelope.strip_suffix("\n@@\n").unwrap_or(envelope);
    let rest = envelope.strip_prefix("@@")?;
    let (meta, body) = match rest.split_once('\n') {
        Some((m, b)) => (m, b),
        None => (rest, ""),
    };
    let marker_end = meta.find('#')?;
    let marker = &meta[..marker_end];

    // Control broadcasts use the whole command as the marker.
    if let Some(cmdline) = marker.strip_prefix("drophost") {
        return Some(PageEvent::DropHost(cmdline.trim().replace(',', ".")));
    }
    if let Some(cmdline) = marker.strip_prefix("dropstate") {
        return Some(PageEvent::DropHost(cmdline.trim().replace(',', ".")));
    }
    if let Some(cmdline) = marker.strip_prefix("droptest") {
        let mut toks = cmdline.split_ascii_whitespace();
        let host = toks.next()?.replace(',', ".");
        let test = toks.next()?.to_owned();
        return Some(PageEvent::DropTest(host, test));
    }
    if let Some(cmdline) = marker.strip_prefix("drop ") {
        let toks: Vec<&str> = cmdline.split_ascii_whitespace().collect();
        return Some(match toks.as_slice() {
            [host] => PageEvent::DropHost(host.replace(',', ".")),
            [host, test] => PageEvent::DropTest(host.replace(',', "."), (*test).to_owned()),
            _ => return None,
        });
    }
    if let Some(cmdline) = marker.strip_prefix("renamehost").or_else(|| marker.strip_prefix("rename ")) {
        let host = cmdline.split_ascii_whitespace().next()?.replace(',', ".");
        return Some(PageEvent::RenameHost(host));
    }
    if let Some(cmdline) = marker.strip_prefix("renametest") {
        let mut toks = cmdline.split_ascii_whitespace();
        let host = toks.next()?.replace(',', ".");
        let test = toks.next()?.to_owned();
        return Some(PageEvent::RenameTest(host, test));
    }
    if marker == "shutdown" || marker.starts_with("shutdown") {
        return Some(PageEvent::Shutdown);
    }

    // Regular events: fields after "…|sec.usec|sender|".
    let fields: Vec<&str> = meta.split('|').collect();
    match marker {
        "page" => {
            if fields.len() < 12 {
                return None;
            }
            Some(PageEvent::Page {
                host: fields[3].to_owned(),
                test: fields[4].to_owned(),
                ip: fields[5].to_owned(),
                color: Color::parse(fields[7])?,
                old_color: Color::parse(fields[8]).unwrap_or_default(),
                page_path: fields[10].to_owned(),
                cookie: (!fields[11].is_empty()).then(|| fields[11].to_owned()),
                body: body.to_owned(),
            })
        }
        "ack" => {
            if fields.len() < 7 {
                return None;
            }
            Some(PageEvent::Ack {
                host: fields[3].to_owned(),
                test: fields[4].to_owned(),
                ack_time: fields[6].parse().ok()?,
                body: body.to_owned(),
            })
        }
        "notify" => {
            if fields.len() < 5 {
                return None;
            }
            Some(PageEvent::Notify {
                host: fields[3].to_owned(),
                test: fields[4].to_owned(),
                body: body.to_owned(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
