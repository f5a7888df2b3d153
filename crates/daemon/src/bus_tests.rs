// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::color::Color;
use crate::registry::HostKind;

fn sample_log() -> StatusRecord {
    let mut log = StatusRecord::new("cpu".into(), "vigild".into(), Color::Red, 1000, 5);
    log.valid_time = 2800;
    log.ack_time = 0;
    log.test_flags = Some("OdT".into());
    log.old_color = Color::Green;
    log.modifier_cache = String::new();
    log
}

fn sample_host() -> HostRecord {
    HostRecord::new("host1".into(), "10.0.0.1".into(), HostKind::Normal)
}

#[tokio::test]
async fn post_is_dropped_without_readers() {
    let bus = ChannelBus::new(16, DEFAULT_CHANNEL_MAX);
    let chan = bus.channel(ChannelId::Status);
    assert!(!chan.post("status", Some("h"), "1.2.3.4", "x\nbody"));
    assert_eq!(chan.dropped(), 1);
    assert_eq!(chan.msg_count(), 0);
}

#[tokio::test]
async fn envelope_shape_and_terminator() {
    let bus = ChannelBus::new(16, DEFAULT_CHANNEL_MAX);
    let mut rx = bus.subscribe(ChannelId::Status);
    let chan = bus.channel(ChannelId::Status);
    assert!(chan.post("status", Some("host1"), "10.0.0.5", "f1|f2\nbody line"));

    let msg = rx.recv().await.unwrap();
    let text = std::str::from_utf8(&msg).unwrap();
    assert!(text.starts_with("@@status#1/host1|"), "got: {text}");
    assert!(text.ends_with("\n@@\n"));
    assert!(text.contains("|10.0.0.5|f1|f2\nbody line"));
}

#[tokio::test]
async fn sequence_numbers_increment_in_order() {
    let bus = ChannelBus::new(16, DEFAULT_CHANNEL_MAX);
    let mut rx = bus.subscribe(ChannelId::Page);
    let chan = bus.channel(ChannelId::Page);
    for _ in 0..3 {
        chan.post("page", Some("h"), "s", "x\n");
    }
    for expected in 1..=3 {
        let msg = rx.recv().await.unwrap();
        let text = std::str::from_utf8(&msg).unwrap().to_owned();
        let seq: u32 = text
            .split('#')
            .nth(1)
            .and_then(|t| t.split('/').next())
            .and_then(|t| t.parse().ok())
            .unwrap();
        assert_eq!(seq, expected);
    }
}

#[tokio::test]
async fn oversize_message_is_truncated() {
    let bus = ChannelBus::new(16, 512);
    let mut rx = bus.subscribe(ChannelId::Data);
    let chan = bus.channel(ChannelId::Data);
    let body = "x".repeat(4096);
    chan.post("data", Some("h"), "s", &body);
    let msg = rx.recv().await.unwrap();
    assert_eq!(msg.len(), 512);
    assert!(msg.ends_with(CHANNEL_TERMINATOR.as_bytes()));
    assert_eq!(chan.truncated(), 1);
}

#[tokio::test]
async fn post_to_all_reaches_every_channel() {
    let bus = ChannelBus::new(16, DEFAULT_CHANNEL_MAX);
    let mut rxs: Vec<_> = ChannelId::ALL.iter().map(|id| bus.subscribe(*id)).collect();
    bus.post_to_all("drophost host1", "vigild");
    for rx in &mut rxs {
        let msg = rx.recv().await.unwrap();
        let text = std::str::from_utf8(&msg).unwrap();
        assert!(text.starts_with("@@drophost host1#"), "got: {text}");
        assert!(text.contains("/*|"), "no-host messages use the * wildcard");
    }
}

#[test]
fn status_field_layout() {
    let log = sample_log();
    let host = sample_host();
    let rest = status_fields(&log, &host, None, "red Trouble\nDetails");
    let (head, body) = rest.split_once('\n').unwrap();
    let fields: Vec<&str> = head.split('|').collect();
    assert_eq!(fields[0], "vigild"); // origin
    assert_eq!(fields[1], "host1");
    assert_eq!(fields[2], "cpu");
    assert_eq!(fields[3], "2800"); // validtime
    assert_eq!(fields[4], "red");
    assert_eq!(fields[5], "OdT");
    assert_eq!(fields[6], "green"); // prior color
    assert_eq!(fields[7], "1000"); // lastchange
    assert_eq!(fields[15], "0"); // flapping
    assert_eq!(body, "red Trouble");
}

#[test]
fn page_field_layout_carries_cookie() {
    let mut log = sample_log();
    log.cookie = Some("12345".into());
    let host = sample_host();
    let rest = page_fields(&log, &host, None, "red Trouble");
    let head = rest.split('\n').next().unwrap();
    let fields: Vec<&str> = head.split('|').collect();
    assert_eq!(fields[0], "host1");
    assert_eq!(fields[1], "cpu");
    assert_eq!(fields[2], "10.0.0.1");
    assert_eq!(fields[8], "12345");
}

#[test]
fn enadis_fields_have_no_body() {
    let mut log = sample_log();
    log.enable_time = 999;
    log.dis_msg = Some("down for\nrepairs".into());
    let rest = enadis_fields(&log, &sample_host());
    assert_eq!(rest, "host1|cpu|999|down for\\nrepairs");
}

#[test]
fn stachg_encodes_dismsg() {
    let mut log = sample_log();
    log.dis_msg = Some("a|b\nc".into());
    let rest = stachg_fields(&log, &sample_host(), "body");
    let head = rest.split('\n').next().unwrap();
    assert!(head.contains("a\\pb\\nc"));
}
