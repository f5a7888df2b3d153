// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon checkpoint: flat-text save/restore of the status registry.
//!
//! One `@@XYMONDCHK-V1|…` line per status record, `.acklist.` lines per ack
//! and `.task.` lines per scheduled task. The file is written to a temp name
//! and renamed over the target; rendering happens on the core task but file
//! I/O runs on a blocking worker so the main loop never waits on disk.

use std::path::{Path, PathBuf};

use crate::codec::{nldecode, nlencode};
use crate::color::Color;
use crate::hosts::HostsConfig;
use crate::registry::{HostKind, Registry};
use crate::status::{Ack, DISABLED_UNTIL_OK};

pub const CHECKPOINT_MARKER: &str = "@@XYMONDCHK-V1";

/// A command scheduled for later execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub id: i32,
    pub execution_time: i64,
    pub sender: String,
    pub command: String,
}

/// Render the whole registry into checkpoint format. Expired disable/ack
/// state is cleaned up as a side effect, exactly as a save has always done.
pub fn render(registry: &mut Registry, tasks: &[ScheduledTask], now: i64) -> String {
    let mut out = String::new();

    for host in registry.hosts.values_mut() {
        for log in host.statuses.values_mut() {
            if log.dis_msg.is_some() && log.enable_time < now && log.enable_time != DISABLED_UNTIL_OK
            {
                log.dis_msg = None;
                log.enable_time = 0;
            }
            if log.ack_msg.is_some() && log.ack_time < now {
                log.ack_msg = None;
                log.ack_time = 0;
            }
            log.flush_acks(now, false);

            out.push_str(&format!(
                "{marker}|{origin}|{host}|{test}|{sender}|{color}|{flags}|{oldcolor}|{logtime}|{lastchange}|{validtime}|{enabletime}|{acktime}|{cookie}|{cookieexp}|{msg}|{dismsg}|{ackmsg}|{redstart}|{yellowstart}\n",
                marker = CHECKPOINT_MARKER,
                origin = log.origin,
                host = host.hostname,
                test = log.test,
                sender = log.sender,
                color = log.color,
                flags = log.test_flags.as_deref().unwrap_or(""),
                oldcolor = log.old_color,
                logtime = log.log_time,
                lastchange = log.last_change.first().copied().unwrap_or(0),
                validtime = log.valid_time,
                enabletime = log.enable_time,
                acktime = log.ack_time,
                cookie = log.cookie.as_deref().unwrap_or(""),
                cookieexp = log.cookie_expires,
                msg = nlencode(&log.message),
                dismsg = nlencode(log.dis_msg.as_deref().unwrap_or("")),
                ackmsg = nlencode(log.ack_msg.as_deref().unwrap_or("")),
                redstart = log.red_start,
                yellowstart = log.yellow_start,
            ));

            for ack in &log.acks {
                out.push_str(&format!(
                    "{marker}|.acklist.|{host}|{test}|{received}|{validuntil}|{cleartime}|{level}|{ackedby}|{msg}\n",
                    marker = CHECKPOINT_MARKER,
                    host = host.hostname,
                    test = log.test,
                    received = ack.received,
                    validuntil = ack.valid_until,
                    cleartime = ack.clear_time,
                    level = ack.level,
                    ackedby = ack.acked_by,
                    msg = ack.msg,
                ));
            }
        }
    }

    for task in tasks {
        out.push_str(&format!(
            "{marker}|.task.|{id}|{when}|{sender}|{command}\n",
            marker = CHECKPOINT_MARKER,
            id = task.id,
            when = task.execution_time,
            sender = task.sender,
            command = nlencode(&task.command),
        ));
    }

    out
}

/// Write checkpoint contents to `path` via a temp file and atomic rename.
pub fn save_to(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp: PathBuf = {
        let mut name = path.as_os_str().to_owned();
        name.push(".tmp");
        name.into()
    };
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// Restore a checkpoint into the registry. Records for hosts no longer in
/// the configuration are dropped (when a configuration is present at all).
/// Returns the number of restored status records and the surviving tasks.
pub fn load(
    path: &Path,
    hosts: &HostsConfig,
    registry: &mut Registry,
    now: i64,
    flap_count: usize,
    ping_test: &str,
) -> anyhow::Result<(usize, Vec<ScheduledTask>)> {
    let contents = std::fs::read_to_string(path)?;
    let mut restored = 0;
    let mut tasks: Vec<ScheduledTask> = Vec::new();

    for line in contents.lines() {
        let Some(rest) = line.strip_prefix(CHECKPOINT_MARKER) else {
            continue;
        };
        let Some(rest) = rest.strip_prefix('|') else {
            continue;
        };

        if let Some(taskline) = rest.strip_prefix(".task.|") {
            let f: Vec<&str> = taskline.split('|').collect();
            if f.len() < 4 {
                continue;
            }
            let (Ok(id), Ok(when)) = (f[0].parse::<i32>(), f[1].parse::<i64>()) else {
                continue;
            };
            if when > now {
                tasks.push(ScheduledTask {
                    id,
                    execution_time: when,
                    sender: f[2].to_owned(),
                    command: nldecode(f[3]),
                });
            }
            continue;
        }

        if let Some(ackline) = rest.strip_prefix(".acklist.|") {
            let f: Vec<&str> = ackline.split('|').collect();
            if f.len() < 8 {
                continue;
            }
            let (host, test) = (f[0], f[1]);
            let ack = Ack {
                received: f[2].parse().unwrap_or(0),
                valid_until: f[3].parse().unwrap_or(0),
                clear_time: f[4].parse().unwrap_or(0),
                level: f[5].parse().unwrap_or(0),
                acked_by: f[6].to_owned(),
                msg: f[7].to_owned(),
            };
            if ack.valid_until < now {
                continue;
            }
            if let Some(log) =
                registry.hosts.get_mut(host).and_then(|h| h.status_by_test_mut(test))
            {
                log.acks.push(ack);
            }
            continue;
        }

        let f: Vec<&str> = rest.split('|').collect();
        if f.len() < 19 {
            tracing::warn!(fields = f.len(), "short checkpoint line skipped");
            continue;
        }
        let (origin, hostname, testname, sender) = (f[0], f[1], f[2], f[3]);
        if !hosts.is_empty() && !hosts.contains(hostname) {
            tracing::info!(host = hostname, "dropping checkpointed status for unknown host");
            continue;
        }
        let Some(color) = Color::parse(f[4]) else {
            continue;
        };
        let old_color = Color::parse(f[6]).unwrap_or(color);

        let test = registry.intern_test(testname, false);
        let origin = registry.intern_origin(origin);
        let ip = hosts.get(hostname).map(|h| h.ip.clone()).unwrap_or_default();
        let log = registry.get_or_create_status(
            hostname,
            &ip,
            HostKind::Normal,
            &test,
            &origin,
            color,
            now,
            flap_count,
            ping_test,
        );

        log.sender = sender.to_owned();
        log.color = color;
        log.test_flags = (!f[5].is_empty()).then(|| f[5].to_owned());
        log.old_color = old_color;
        log.log_time = f[7].parse().unwrap_or(0);
        log.last_change[0] = f[8].parse().unwrap_or(0);
        log.valid_time = f[9].parse().unwrap_or(0);
        log.enable_time = f[10].parse().unwrap_or(0);
        log.ack_time = f[11].parse().unwrap_or(0);
        log.cookie_expires = f[13].parse().unwrap_or(0);
        log.message = nldecode(f[14]);
        log.line1 = crate::codec::first_line(&log.message)
            .split_ascii_whitespace()
            .skip(2)
            .collect::<Vec<_>>()
            .join(" ");
        log.dis_msg = (!f[15].is_empty()).then(|| nldecode(f[15]));
        log.ack_msg = (!f[16].is_empty()).then(|| nldecode(f[16]));
        log.red_start = f[17].parse().unwrap_or(0);
        log.yellow_start = f[18].parse().unwrap_or(0);

        let key = (test, origin);
        if !f[12].is_empty() && log.cookie_expires > now {
            let cookie = f[12].to_owned();
            if let Some(rec) = registry.hosts.get_mut(hostname).and_then(|h| h.statuses.get_mut(&key)) {
                rec.cookie = Some(cookie.clone());
            }
            registry
                .cookies
                .insert(cookie, (hostname.to_owned(), key.0.clone(), key.1.clone()));
        }
        restored += 1;
    }

    Ok((restored, tasks))
}

#[cfg(test)]
#[path = "checkpoint_tests.rs"]
mod tests;
