// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Query surfaces: `xymondlog`, `xymondxlog`, `xymondboard`, `xymondxboard`,
//! `hostinfo`, plus the filter and field vocabulary they share.
//!
//! Records are pipe-separated, newline-terminated; multi-line fields are
//! newline-encoded. Three synthetic green logs (`info`, `trends`,
//! `clientlog`) are injected per host during a board scan unless host flags
//! or configuration suppress them.

use regex::Regex;

use crate::codec::nlencode;
use crate::color::{Color, ColorSet};
use crate::config::DaemonConfig;
use crate::hosts::{HostInfo, HostsConfig};
use crate::registry::{HostKind, HostRecord, Registry};
use crate::status::StatusRecord;

pub const DEFAULT_BOARD_FIELDS: &str =
    "hostname,testname,color,flags,lastchange,logtime,validtime,acktime,disabletime,sender,cookie,line1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardField {
    Hostname,
    Testname,
    MatchedTag,
    Color,
    Flags,
    LastChange,
    LogTime,
    ValidTime,
    AckTime,
    DisableTime,
    Sender,
    Cookie,
    Line1,
    AckMsg,
    DisMsg,
    Msg,
    Client,
    ClientTstamp,
    Acklist,
    FlapInfo,
    Stats,
    Modifiers,
    HostInfo(String),
}

impl BoardField {
    fn parse(name: &str) -> Option<BoardField> {
        Some(match name {
            "hostname" => Self::Hostname,
            "testname" => Self::Testname,
            "matchedtag" | "matchedtags" => Self::MatchedTag,
            "color" => Self::Color,
            "flags" => Self::Flags,
            "lastchange" => Self::LastChange,
            "logtime" => Self::LogTime,
            "validtime" => Self::ValidTime,
            "acktime" => Self::AckTime,
            "disabletime" => Self::DisableTime,
            "sender" => Self::Sender,
            "cookie" => Self::Cookie,
            "line1" => Self::Line1,
            "ackmsg" => Self::AckMsg,
            "dismsg" => Self::DisMsg,
            "msg" => Self::Msg,
            "client" => Self::Client,
            "clntstamp" => Self::ClientTstamp,
            "acklist" => Self::Acklist,
            "flapinfo" => Self::FlapInfo,
            "stats" => Self::Stats,
            "modifiers" => Self::Modifiers,
            other if other.starts_with("XMH_") => Self::HostInfo(other.to_owned()),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    LastChange,
    LogTime,
    ValidTime,
    AckTime,
    DisableTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Msg,
    AckMsg,
    DisMsg,
}

#[derive(Debug)]
pub enum Filter {
    Host(Regex),
    Net(String),
    Ip(Regex),
    Page(Regex),
    Test(Regex),
    Tag(Regex),
    Color(ColorSet),
    Time { field: TimeField, op: CmpOp, value: i64 },
    Text { field: TextField, re: Regex },
    Down(Regex),
    NotDown(Regex),
    Xmh { item: String, re: Regex },
}

/// One parsed board/log query.
#[derive(Debug, Default)]
pub struct BoardQuery {
    pub filters: Vec<Filter>,
    pub fields: Vec<BoardField>,
    pub acklevel: Option<i32>,
}

impl BoardQuery {
    /// Parse the criteria tokens following the query verb.
    pub fn parse(args: &str) -> BoardQuery {
        let mut q = BoardQuery::default();
        let mut fields_csv: Option<String> = None;

        for tok in args.split_ascii_whitespace() {
            if let Some(v) = tok.strip_prefix("fields=") {
                fields_csv = Some(v.to_owned());
            } else if let Some(v) = tok.strip_prefix("acklevel=") {
                q.acklevel = v.parse().ok();
            } else if let Some(v) = tok.strip_prefix("color=") {
                q.filters.push(Filter::Color(ColorSet::parse(v)));
            } else if let Some(v) = tok.strip_prefix("host=").or_else(|| tok.strip_prefix("hostname=")) {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::Host(re));
                }
            } else if let Some(v) = tok.strip_prefix("net=") {
                q.filters.push(Filter::Net(v.to_owned()));
            } else if let Some(v) = tok.strip_prefix("ip=") {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::Ip(re));
                }
            } else if let Some(v) = tok.strip_prefix("page=") {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::Page(re));
                }
            } else if let Some(v) = tok.strip_prefix("test=").or_else(|| tok.strip_prefix("testname=")) {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::Test(re));
                }
            } else if let Some(v) = tok.strip_prefix("tag=") {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::Tag(re));
                }
            } else if let Some(v) = tok.strip_prefix("msg=") {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::Text { field: TextField::Msg, re });
                }
            } else if let Some(v) = tok.strip_prefix("ackmsg=") {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::Text { field: TextField::AckMsg, re });
                }
            } else if let Some(v) = tok.strip_prefix("dismsg=") {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::Text { field: TextField::DisMsg, re });
                }
            } else if let Some(v) = tok.strip_prefix("down=") {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::Down(re));
                }
            } else if let Some(v) = tok.strip_prefix("notdown=") {
                if let Ok(re) = Regex::new(v) {
                    q.filters.push(Filter::NotDown(re));
                }
            } else if tok.starts_with("XMH_") {
                if let Some((item, v)) = tok.split_once('=') {
                    if let Ok(re) = Regex::new(v) {
                        q.filters.push(Filter::Xmh { item: item.to_owned(), re });
                    }
                }
            } else if let Some(f) = parse_time_filter(tok) {
                q.filters.push(f);
            }
        }

        let csv = fields_csv.unwrap_or_else(|| DEFAULT_BOARD_FIELDS.to_owned());
        q.fields = csv.split(',').filter_map(BoardField::parse).collect();
        q
    }

    /// Host-level filter pass. Returns the matched tag (for `matchedtag`)
    /// when the host passes.
    fn host_matches(
        &self,
        host: &HostRecord,
        info: Option<&HostInfo>,
        policy_down: impl Fn(&Regex) -> bool,
    ) -> Option<String> {
        let mut matched_tag = String::new();
        for f in &self.filters {
            match f {
                Filter::Host(re) => {
                    if !re.is_match(&host.hostname) {
                        return None;
                    }
                }
                Filter::Net(net) => {
                    if info.map(|i| i.net.as_str()) != Some(net.as_str()) {
                        return None;
                    }
                }
                Filter::Ip(re) => {
                    if !re.is_match(&host.ip) {
                        return None;
                    }
                }
                Filter::Page(re) => {
                    let page = info.map(|i| i.page_path.as_str()).unwrap_or("");
                    if !re.is_match(page) {
                        return None;
                    }
                }
                Filter::Tag(re) => {
                    let tag = info.and_then(|i| i.tags.iter().find(|t| re.is_match(t)));
                    match tag {
                        Some(t) => matched_tag = t.clone(),
                        None => return None,
                    }
                }
                Filter::Xmh { item, re } => {
                    let value = info.and_then(|i| i.item(item)).unwrap_or_default();
                    if !re.is_match(&value) {
                        return None;
                    }
                }
                Filter::Down(re) => {
                    if !policy_down(re) {
                        return None;
                    }
                }
                Filter::NotDown(re) => {
                    if policy_down(re) {
                        return None;
                    }
                }
                _ => {}
            }
        }
        Some(matched_tag)
    }

    /// Test-level filter pass.
    fn log_matches(&self, log: &StatusRecord) -> bool {
        if let Some(level) = self.acklevel {
            if !log.acks.iter().any(|a| a.level == level) {
                return false;
            }
        }
        for f in &self.filters {
            match f {
                Filter::Test(re) => {
                    if !re.is_match(&log.test) {
                        return false;
                    }
                }
                Filter::Color(set) => {
                    if !set.contains(log.color) {
                        return false;
                    }
                }
                Filter::Time { field, op, value } => {
                    let v = match field {
                        TimeField::LastChange => log.last_change.first().copied().unwrap_or(0),
                        TimeField::LogTime => log.log_time,
                        TimeField::ValidTime => log.valid_time,
                        TimeField::AckTime => log.ack_time,
                        TimeField::DisableTime => log.enable_time,
                    };
                    let pass = match op {
                        CmpOp::Gt => v > *value,
                        CmpOp::Ge => v >= *value,
                        CmpOp::Lt => v < *value,
                        CmpOp::Le => v <= *value,
                    };
                    if !pass {
                        return false;
                    }
                }
                Filter::Text { field, re } => {
                    let empty = String::new();
                    let v = match field {
                        TextField::Msg => &log.message,
                        TextField::AckMsg => log.ack_msg.as_ref().unwrap_or(&empty),
                        TextField::DisMsg => log.dis_msg.as_ref().unwrap_or(&empty),
                    };
                    if !re.is_match(v) {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }
}

fn parse_time_filter(tok: &str) -> Option<Filter> {
    for (name, field) in [
        ("lastchange", TimeField::LastChange),
        ("logtime", TimeField::LogTime),
        ("validtime", TimeField::ValidTime),
        ("acktime", TimeField::AckTime),
        ("disabletime", TimeField::DisableTime),
    ] {
        if let Some(rest) = tok.strip_prefix(name) {
            let (op, numstr) = if let Some(r) = rest.strip_prefix(">=") {
                (CmpOp::Ge, r)
            } else if let Some(r) = rest.strip_prefix("<=") {
                (CmpOp::Le, r)
            } else if let Some(r) = rest.strip_prefix('>') {
                (CmpOp::Gt, r)
            } else if let Some(r) = rest.strip_prefix('<') {
                (CmpOp::Lt, r)
            } else {
                continue;
            };
            let value = numstr.parse().ok()?;
            return Some(Filter::Time { field, op, value });
        }
    }
    None
}

/// One rendered record.
fn render_fields(
    fields: &[BoardField],
    acklevel: Option<i32>,
    host: &HostRecord,
    info: Option<&HostInfo>,
    log: &StatusRecord,
    matched_tag: &str,
) -> String {
    let mut cols = Vec::with_capacity(fields.len());
    for f in fields {
        let v = match f {
            BoardField::Hostname => host.hostname.clone(),
            BoardField::Testname => log.test.to_string(),
            BoardField::MatchedTag => matched_tag.to_owned(),
            BoardField::Color => log.color.to_string(),
            BoardField::Flags => log.test_flags.clone().unwrap_or_default(),
            BoardField::LastChange => log.last_change.first().copied().unwrap_or(0).to_string(),
            BoardField::LogTime => log.log_time.to_string(),
            BoardField::ValidTime => log.valid_time.to_string(),
            BoardField::AckTime => log.ack_time.to_string(),
            BoardField::DisableTime => log.enable_time.to_string(),
            BoardField::Sender => log.sender.clone(),
            BoardField::Cookie => log.cookie.clone().unwrap_or_default(),
            BoardField::Line1 => log.line1.clone(),
            BoardField::AckMsg => nlencode(log.ack_msg.as_deref().unwrap_or("")),
            BoardField::DisMsg => nlencode(log.dis_msg.as_deref().unwrap_or("")),
            BoardField::Msg => nlencode(&log.message),
            BoardField::Client => {
                if host.client_msgs.is_empty() { "N".into() } else { "Y".into() }
            }
            BoardField::ClientTstamp => host.client_tstamp.to_string(),
            BoardField::Acklist => nlencode(&log.acklist_string(acklevel)),
            BoardField::FlapInfo => log.flap_info(),
            BoardField::Stats => log.status_change_count.to_string(),
            BoardField::Modifiers => log.modifier_cache.clone(),
            BoardField::HostInfo(item) => info.and_then(|i| i.item(item)).unwrap_or_default(),
        };
        cols.push(v);
    }
    cols.join("|")
}

fn any_matching_test_red(host: &HostRecord, re: &Regex) -> bool {
    host.statuses
        .iter()
        .any(|((t, _), log)| re.is_match(t) && log.color == Color::Red)
}

/// The synthetic per-host logs injected during board scans.
fn synthetic_logs(
    cfg: &DaemonConfig,
    info: Option<&HostInfo>,
) -> Vec<StatusRecord> {
    let mut out = Vec::new();
    let mut add = |name: &str| {
        out.push(StatusRecord::new(name.into(), "".into(), Color::Green, 0, 1));
    };
    if !info.is_some_and(|i| i.has_flag("noinfo")) {
        add("info");
    }
    if !info.is_some_and(|i| i.has_flag("notrends")) {
        add("trends");
    }
    if !cfg.no_clientlog && !info.is_some_and(|i| i.has_flag("noclient")) {
        add("clientlog");
    }
    out
}

/// `xymondboard [criteria] [fields=…]`: stream all matching records.
pub fn render_board(
    registry: &Registry,
    hosts: &HostsConfig,
    cfg: &DaemonConfig,
    args: &str,
) -> String {
    let q = BoardQuery::parse(args);
    let mut out = String::new();

    for host in registry.hosts.values() {
        let info = hosts.get(&host.hostname);
        let Some(matched_tag) =
            q.host_matches(host, info, |re| any_matching_test_red(host, re))
        else {
            continue;
        };

        for log in host.statuses.values() {
            if !q.log_matches(log) {
                continue;
            }
            out.push_str(&render_fields(&q.fields, q.acklevel, host, info, log, &matched_tag));
            out.push('\n');
        }

        if host.kind == HostKind::Normal {
            for fake in synthetic_logs(cfg, info) {
                if !q.log_matches(&fake) {
                    continue;
                }
                out.push_str(&render_fields(&q.fields, q.acklevel, host, info, &fake, &matched_tag));
                out.push('\n');
            }
        }
    }
    out
}

/// `xymondlog host.test [fields=…]`: one record.
pub fn render_log(
    registry: &Registry,
    hosts: &HostsConfig,
    hostname: &str,
    testname: &str,
    args: &str,
) -> Option<String> {
    let host = registry.hosts.get(hostname)?;
    let log = host.status_by_test(testname)?;
    let info = hosts.get(hostname);

    let mut q = BoardQuery::parse(args);
    if !args.contains("fields=") {
        // The single-log query historically returns the full message too.
        q.fields.push(BoardField::Msg);
    }
    let mut line = render_fields(&q.fields, q.acklevel, host, info, log, "");
    line.push('\n');
    Some(line)
}

/// `xymondxlog host.test`: the XML rendition of one record.
pub fn render_xlog(registry: &Registry, hostname: &str, testname: &str, now: i64) -> Option<String> {
    let host = registry.hosts.get(hostname)?;
    let log = host.status_by_test(testname)?;

    let cookie = match (&log.cookie, log.cookie_expires > now) {
        (Some(c), true) => c.clone(),
        _ => "N/A".into(),
    };
    let ackmsg = match (&log.ack_msg, log.ack_time > now) {
        (Some(m), true) => format!("<![CDATA[{m}]]>"),
        _ => "N/A".into(),
    };
    let dismsg = match (&log.dis_msg, log.enable_time > now || log.enable_time == crate::status::DISABLED_UNTIL_OK) {
        (Some(m), true) => format!("<![CDATA[{m}]]>"),
        _ => "N/A".into(),
    };

    Some(format!(
        "<?xml version='1.0' encoding='ISO-8859-1'?>\n<ServerStatus>\n  <ServerName>{host}</ServerName>\n  <Type>{test}</Type>\n  <Status>{color}</Status>\n  <TestFlags>{flags}</TestFlags>\n  <LastChange>{lastchange}</LastChange>\n  <LogTime>{logtime}</LogTime>\n  <ValidTime>{validtime}</ValidTime>\n  <AckTime>{acktime}</AckTime>\n  <DisableTime>{distime}</DisableTime>\n  <Sender>{sender}</Sender>\n  <Cookie>{cookie}</Cookie>\n  <AckMsg>{ackmsg}</AckMsg>\n  <DisMsg>{dismsg}</DisMsg>\n  <Message><![CDATA[{msg}]]></Message>\n</ServerStatus>\n",
        host = host.hostname,
        test = log.test,
        color = log.color,
        flags = log.test_flags.as_deref().unwrap_or(""),
        lastchange = log.last_change.first().copied().unwrap_or(0),
        logtime = log.log_time,
        validtime = log.valid_time,
        acktime = log.ack_time,
        distime = log.enable_time,
        sender = log.sender,
        msg = log.message,
    ))
}

/// `xymondxboard [criteria]`: the XML rendition of the board.
pub fn render_xboard(
    registry: &Registry,
    hosts: &HostsConfig,
    args: &str,
) -> String {
    let q = BoardQuery::parse(args);
    let mut out = String::from("<?xml version='1.0' encoding='ISO-8859-1'?>\n<StatusBoard>\n");
    for host in registry.hosts.values() {
        let info = hosts.get(&host.hostname);
        let Some(_tag) = q.host_matches(host, info, |re| any_matching_test_red(host, re)) else {
            continue;
        };
        for log in host.statuses.values() {
            if !q.log_matches(log) {
                continue;
            }
            out.push_str(&format!(
                "  <ServerStatus><ServerName>{}</ServerName><Type>{}</Type><Status>{}</Status><LastChange>{}</LastChange></ServerStatus>\n",
                host.hostname,
                log.test,
                log.color,
                log.last_change.first().copied().unwrap_or(0),
            ));
        }
    }
    out.push_str("</StatusBoard>\n");
    out
}

/// `hostinfo [criteria]`: host-configuration records.
pub fn render_hostinfo(hosts: &HostsConfig, args: &str) -> String {
    let q = BoardQuery::parse(args);
    let mut out = String::new();
    for info in hosts.iter() {
        let pass = q.filters.iter().all(|f| match f {
            Filter::Host(re) => re.is_match(&info.hostname),
            Filter::Net(net) => info.net == *net,
            Filter::Ip(re) => re.is_match(&info.ip),
            Filter::Page(re) => re.is_match(&info.page_path),
            Filter::Tag(re) => info.tags.iter().any(|t| re.is_match(t)),
            Filter::Xmh { item, re } => re.is_match(&info.item(item).unwrap_or_default()),
            _ => true,
        });
        if !pass {
            continue;
        }
        out.push_str(&format!(
            "{}|{}|{}|{}|{}|{}|{}\n",
            info.hostname,
            info.ip,
            info.class,
            info.os,
            info.net,
            info.page_path,
            info.tags.join(" ")
        ));
    }
    out
}

#[cfg(test)]
#[path = "board_tests.rs"]
mod tests;
