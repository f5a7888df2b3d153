// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fan-out channel bus.
//!
//! Each named channel carries envelope-formatted text messages from the core
//! task (the single writer) to any number of attached workers. The contract
//! kept from the shared-memory original: per-channel ordering, a bounded slot
//! with truncation, drop-when-no-readers, and sequence numbers in the
//! envelope so a lagging worker can detect gaps.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::hosts::HostInfo;
use crate::registry::HostRecord;
use crate::status::StatusRecord;

/// Fixed sequence terminating every channel message.
pub const CHANNEL_TERMINATOR: &str = "\n@@\n";

/// Default bound for one channel message.
pub const DEFAULT_CHANNEL_MAX: usize = 1024 * 1024;

/// Sequence numbers wrap here.
const SEQ_WRAP: u32 = 999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Status,
    Stachg,
    Page,
    Data,
    Notes,
    Enadis,
    Client,
    Clichg,
    User,
}

impl ChannelId {
    pub const ALL: [ChannelId; 9] = [
        ChannelId::Status,
        ChannelId::Stachg,
        ChannelId::Page,
        ChannelId::Data,
        ChannelId::Notes,
        ChannelId::Enadis,
        ChannelId::Client,
        ChannelId::Clichg,
        ChannelId::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Stachg => "stachg",
            Self::Page => "page",
            Self::Data => "data",
            Self::Notes => "notes",
            Self::Enadis => "enadis",
            Self::Client => "client",
            Self::Clichg => "clichg",
            Self::User => "user",
        }
    }
}

/// One channel: a broadcast slot plus its counters.
pub struct Channel {
    pub id: ChannelId,
    tx: broadcast::Sender<Bytes>,
    seq: AtomicU32,
    msg_count: AtomicU64,
    dropped: AtomicU64,
    truncated: AtomicU64,
    max_size: usize,
}

impl Channel {
    fn new(id: ChannelId, depth: usize, max_size: usize) -> Self {
        let (tx, _) = broadcast::channel(depth);
        Self {
            id,
            tx,
            seq: AtomicU32::new(0),
            msg_count: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
            max_size,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn msg_count(&self) -> u64 {
        self.msg_count.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn truncated(&self) -> u64 {
        self.truncated.load(Ordering::Relaxed)
    }

    /// Post one message. `marker` is the envelope tag (usually the channel
    /// name, but `ack`/`notify` and broadcast control commands differ);
    /// `rest` is everything after the sender field, body included.
    ///
    /// Returns false when the message was dropped for lack of readers.
    pub fn post(&self, marker: &str, hostname: Option<&str>, sender: &str, rest: &str) -> bool {
        if self.tx.receiver_count() == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let seq = self
            .seq
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                Some(if s >= SEQ_WRAP { 1 } else { s + 1 })
            })
            .map(|s| if s >= SEQ_WRAP { 1 } else { s + 1 })
            .unwrap_or(1);
        self.msg_count.fetch_add(1, Ordering::Relaxed);

        let (sec, usec) = tv_now();
        let mut env = format!(
            "@@{marker}#{seq}/{host}|{sec}.{usec:06}|{sender}|",
            host = hostname.unwrap_or("*"),
        );
        env.push_str(rest);

        let cap = self.max_size - CHANNEL_TERMINATOR.len();
        if env.len() > cap {
            tracing::error!(
                channel = self.id.as_str(),
                size = env.len(),
                limit = self.max_size,
                "oversize channel message truncated"
            );
            self.truncated.fetch_add(1, Ordering::Relaxed);
            let mut cut = cap;
            while !env.is_char_boundary(cut) {
                cut -= 1;
            }
            env.truncate(cut);
        }
        env.push_str(CHANNEL_TERMINATOR);
        let _ = self.tx.send(Bytes::from(env));
        true
    }
}

/// The set of named channels.
pub struct ChannelBus {
    channels: Vec<Channel>,
}

impl ChannelBus {
    pub fn new(depth: usize, max_size: usize) -> Self {
        let channels = ChannelId::ALL.iter().map(|id| Channel::new(*id, depth, max_size)).collect();
        Self { channels }
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        // ALL is ordered to match construction.
        &self.channels[ChannelId::ALL.iter().position(|c| *c == id).unwrap_or(0)]
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn subscribe(&self, id: ChannelId) -> broadcast::Receiver<Bytes> {
        self.channel(id).subscribe()
    }

    /// Broadcast a control command (drop/rename/reload/shutdown…) to every
    /// channel so downstream workers can clean up their own persistence.
    /// The raw command is the envelope marker, as workers expect.
    pub fn post_to_all(&self, command: &str, sender: &str) {
        tracing::info!(command, "broadcasting to all channels");
        for chan in &self.channels {
            chan.post(command, None, sender, "");
        }
    }
}

fn tv_now() -> (i64, u32) {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_micros()),
        Err(_) => (0, 0),
    }
}

// -- Per-channel field layouts ------------------------------------------------

fn nl(opt: Option<&str>) -> String {
    crate::codec::nlencode(opt.unwrap_or(""))
}

/// `status` channel: the full record state ahead of the body.
pub fn status_fields(
    log: &StatusRecord,
    host: &HostRecord,
    info: Option<&HostInfo>,
    msg: &str,
) -> String {
    format!(
        "{origin}|{host}|{test}|{validtime}|{color}|{flags}|{oldcolor}|{lastchange}|{acktime}|{ackmsg}|{enabletime}|{dismsg}|{clienttstamp}|{class}|{pagepath}|{flapping}|{modifiers}\n{msg}",
        origin = log.origin,
        host = host.hostname,
        test = log.test,
        validtime = log.valid_time,
        color = log.color,
        flags = log.test_flags.as_deref().unwrap_or(""),
        oldcolor = log.old_color,
        lastchange = log.last_change.first().copied().unwrap_or(0),
        acktime = log.ack_time,
        ackmsg = nl(log.ack_msg.as_deref()),
        enabletime = log.enable_time,
        dismsg = nl(log.dis_msg.as_deref()),
        clienttstamp = host.client_tstamp,
        class = info.map(|i| i.class.as_str()).unwrap_or(""),
        pagepath = info.map(|i| i.page_path.as_str()).unwrap_or(""),
        flapping = i32::from(log.flapping),
        modifiers = log.modifier_cache,
    )
}

/// `stachg` channel: state-change event for history workers.
pub fn stachg_fields(log: &StatusRecord, host: &HostRecord, msg: &str) -> String {
    format!(
        "{origin}|{host}|{test}|{validtime}|{color}|{oldcolor}|{lastchange}|{enabletime}|{dismsg}|{downtime}|{clienttstamp}|{modifiers}\n{msg}",
        origin = log.origin,
        host = host.hostname,
        test = log.test,
        validtime = log.valid_time,
        color = log.color,
        oldcolor = log.old_color,
        lastchange = log.last_change.first().copied().unwrap_or(0),
        enabletime = log.enable_time,
        dismsg = nl(log.dis_msg.as_deref()),
        downtime = i32::from(log.downtime_active),
        clienttstamp = host.client_tstamp,
        modifiers = log.modifier_cache,
    )
}

/// `page` channel: alert event for the alert manager.
pub fn page_fields(
    log: &StatusRecord,
    host: &HostRecord,
    info: Option<&HostInfo>,
    msg: &str,
) -> String {
    format!(
        "{host}|{test}|{ip}|{validtime}|{color}|{oldcolor}|{lastchange}|{pagepath}|{cookie}|{os}|{class}|{grouplist}|{modifiers}\n{msg}",
        host = host.hostname,
        test = log.test,
        ip = host.ip,
        validtime = log.valid_time,
        color = log.color,
        oldcolor = log.old_color,
        lastchange = log.last_change.first().copied().unwrap_or(0),
        pagepath = info.map(|i| i.page_path.as_str()).unwrap_or(""),
        cookie = log.cookie.as_deref().unwrap_or(""),
        os = info.map(|i| i.os.as_str()).unwrap_or(""),
        class = info.map(|i| i.class.as_str()).unwrap_or(""),
        grouplist = log.group_list.as_deref().unwrap_or(""),
        modifiers = log.modifier_cache,
    )
}

/// `page` channel, `ack` marker variant.
pub fn ack_fields(log: &StatusRecord, host: &HostRecord, ackmsg: &str) -> String {
    format!(
        "{host}|{test}|{ip}|{acktime}\n{ackmsg}",
        host = host.hostname,
        test = log.test,
        ip = host.ip,
        acktime = log.ack_time,
    )
}

/// `page` channel, `notify` marker variant.
pub fn notify_fields(hostname: &str, testname: &str, info: Option<&HostInfo>, msgtext: &str) -> String {
    format!(
        "{hostname}|{testname}|{pagepath}\n{msgtext}",
        pagepath = info.map(|i| i.page_path.as_str()).unwrap_or(""),
    )
}

/// `enadis` channel. No body.
pub fn enadis_fields(log: &StatusRecord, host: &HostRecord) -> String {
    format!(
        "{host}|{test}|{enabletime}|{dismsg}",
        host = host.hostname,
        test = log.test,
        enabletime = log.enable_time,
        dismsg = nl(log.dis_msg.as_deref()),
    )
}

/// `data` channel passthrough.
pub fn data_fields(
    origin: &str,
    hostname: &str,
    testname: &str,
    info: Option<&HostInfo>,
    msg: &str,
) -> String {
    format!(
        "{origin}|{hostname}|{testname}|{class}|{pagepath}\n{msg}",
        class = info.map(|i| i.class.as_str()).unwrap_or(""),
        pagepath = info.map(|i| i.page_path.as_str()).unwrap_or(""),
    )
}

/// `notes` / `user` channel passthrough.
pub fn hostmsg_fields(hostname: &str, msg: &str) -> String {
    format!("{hostname}\n{msg}")
}

/// `clichg` channel: the host's concatenated client sections.
pub fn clichg_fields(host: &HostRecord) -> String {
    format!(
        "{host}|{tstamp}\n{clientmsg}",
        host = host.hostname,
        tstamp = host.client_tstamp,
        clientmsg = host.total_client_msg(),
    )
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
