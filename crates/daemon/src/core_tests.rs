// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use clap::Parser;

fn daemon() -> Daemon {
    let cfg = DaemonConfig::parse_from(["vigild", "--ghosts", "allow"]);
    Daemon::new(cfg).unwrap()
}

fn send(d: &mut Daemon, text: &str) -> Option<Bytes> {
    d.dispatch(text.as_bytes(), "10.0.0.5", None, false)
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Bytes>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(String::from_utf8_lossy(&msg).into_owned());
    }
    out
}

#[test]
fn basic_status_update_posts_status_and_stachg() {
    let mut d = daemon();
    let mut status_rx = d.bus.subscribe(ChannelId::Status);
    let mut stachg_rx = d.bus.subscribe(ChannelId::Stachg);
    let mut page_rx = d.bus.subscribe(ChannelId::Page);

    assert!(send(&mut d, "status host1.cpu green\nAll fine\n").is_none());

    let log = d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap();
    assert_eq!(log.color, Color::Green);
    assert_eq!(drain(&mut status_rx).len(), 1);
    assert_eq!(drain(&mut stachg_rx).len(), 1, "first-time sync posts stachg");
    assert_eq!(drain(&mut page_rx).len(), 0);

    // Identical update: status channel only.
    send(&mut d, "status host1.cpu green\nAll fine\n");
    assert_eq!(drain(&mut status_rx).len(), 1);
    assert_eq!(drain(&mut stachg_rx).len(), 0);
    assert_eq!(drain(&mut page_rx).len(), 0);
}

#[test]
fn escalation_assigns_cookie_and_pages() {
    let mut d = daemon();
    let mut page_rx = d.bus.subscribe(ChannelId::Page);
    let mut stachg_rx = d.bus.subscribe(ChannelId::Stachg);

    send(&mut d, "status host1.cpu green\nok\n");
    send(&mut d, "status host1.cpu red\nBad\n");

    let log = d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap();
    assert_eq!(log.color, Color::Red);
    assert_eq!(log.old_color, Color::Green);
    assert!(log.active_alert);
    assert_eq!(log.max_acked_color, Color::Green);
    let cookie = log.cookie.clone().unwrap();
    assert!(cookie.bytes().all(|b| b.is_ascii_digit()));

    assert_eq!(drain(&mut stachg_rx).len(), 2);
    let pages = drain(&mut page_rx);
    assert_eq!(pages.len(), 1);
    assert!(pages[0].starts_with("@@page#"));
    assert!(pages[0].contains(&cookie));
}

#[test]
fn ack_by_cookie_holds_the_page_channel() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu red\nBad\n");
    let cookie =
        d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap().cookie.clone().unwrap();

    let mut page_rx = d.bus.subscribe(ChannelId::Page);
    let before = crate::epoch_secs();
    send(&mut d, &format!("xymondack {cookie} 10 took it"));

    let log = d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap();
    assert!(log.ack_time >= before + 600 && log.ack_time <= before + 602);
    assert!(log.valid_time >= log.ack_time);
    assert_eq!(log.ack_msg.as_deref(), Some("took it"));
    assert_eq!(log.max_acked_color, Color::Red);

    let pages = drain(&mut page_rx);
    assert_eq!(pages.len(), 1);
    assert!(pages[0].starts_with("@@ack#"), "ack event on the page channel: {}", pages[0]);
}

#[test]
fn extcombo_updates_two_records_in_order() {
    let mut d = daemon();
    let mut status_rx = d.bus.subscribe(ChannelId::Status);

    let inner1 = b"status a.t red\nBad\n";
    let inner2 = b"status b.t green\nOk\n";
    let start = 40;
    let mut header = format!(
        "extcombo {} {} {}",
        start,
        start + inner1.len(),
        start + inner1.len() + inner2.len()
    );
    while header.len() < start - 1 {
        header.push(' ');
    }
    header.push('\n');
    let mut buf = header.into_bytes();
    buf.extend_from_slice(inner1);
    buf.extend_from_slice(inner2);

    d.dispatch(&buf, "10.0.0.5", None, false);

    assert_eq!(d.registry.hosts.get("a").unwrap().status_by_test("t").unwrap().color, Color::Red);
    assert_eq!(d.registry.hosts.get("b").unwrap().status_by_test("t").unwrap().color, Color::Green);
    let posts = drain(&mut status_rx);
    assert_eq!(posts.len(), 2);
    assert!(posts[0].contains("/a|"));
    assert!(posts[1].contains("/b|"));
}

#[test]
fn combo_splits_sub_statuses() {
    let mut d = daemon();
    send(&mut d, "combo\nstatus a.cpu green\nok\n\nstatus b.cpu yellow\nmeh\n");
    assert!(d.registry.hosts.contains_key("a"));
    assert_eq!(d.registry.hosts.get("b").unwrap().status_by_test("cpu").unwrap().color, Color::Yellow);
}

#[test]
fn disable_until_ok_and_recovery() {
    let mut d = daemon();
    let mut enadis_rx = d.bus.subscribe(ChannelId::Enadis);

    send(&mut d, "status host1.cpu red\nBad\n");
    send(&mut d, "disable host1.cpu -1 planned maintenance\n");
    {
        let log = d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap();
        assert_eq!(log.color, Color::Blue);
        assert_eq!(log.enable_time, DISABLED_UNTIL_OK);
        assert_eq!(log.dis_msg.as_deref(), Some("planned maintenance"));
        assert_eq!(log.valid_time, i64::MAX);
    }
    let first = drain(&mut enadis_rx);
    assert_eq!(first.len(), 1, "disable posts an enadis event");

    // Red again: stays blue.
    send(&mut d, "status host1.cpu red\nstill bad\n");
    assert_eq!(
        d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap().color,
        Color::Blue
    );

    // First OK clears the disable.
    send(&mut d, "status host1.cpu green\nrecovered\n");
    let log = d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap();
    assert_eq!(log.color, Color::Green);
    assert_eq!(log.enable_time, 0);
    assert!(log.dis_msg.is_none());
    assert_eq!(drain(&mut enadis_rx).len(), 1, "clearing the disable posts enadis");
}

#[test]
fn enable_clears_timed_disable() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu red\nBad\n");
    send(&mut d, "disable host1.cpu 60 fixing\n");
    assert_ne!(
        d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap().enable_time,
        0
    );
    send(&mut d, "enable host1.cpu\n");
    let log = d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap();
    assert_eq!(log.enable_time, 0);
    assert!(log.dis_msg.is_none());
}

#[test]
fn modify_command_clamps_reported_color() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu red\nBad\n");
    send(&mut d, "modifydown+3 host1.cpu yellow scheduler maintenance window\n");
    // The modify itself re-evaluates the status.
    assert_eq!(
        d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap().color,
        Color::Yellow
    );
    let log = d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap();
    assert!(log.modifier_cache.contains("maintenance window"));
}

#[test]
fn drophost_removes_and_broadcasts() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu red\nBad\n");
    let mut page_rx = d.bus.subscribe(ChannelId::Page);
    send(&mut d, "drophost host1\n");
    assert!(!d.registry.hosts.contains_key("host1"));
    let posts = drain(&mut page_rx);
    assert_eq!(posts.len(), 1);
    assert!(posts[0].starts_with("@@drophost host1#"));
}

#[test]
fn rename_host_keeps_state() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu yellow\nmeh\n");
    send(&mut d, "renamehost host1 host2\n");
    assert!(d.registry.hosts.get("host2").unwrap().status_by_test("cpu").is_some());
    assert!(!d.registry.hosts.contains_key("host1"));
}

#[test]
fn purple_sweep_uses_ping_status() {
    let mut d = daemon();
    send(&mut d, "status host1.conn green\nup\n");
    send(&mut d, "status host1.cpu yellow\nmeh\n");
    send(&mut d, "status host2.conn red\ndown\n");
    send(&mut d, "status host2.cpu green\nok\n");

    // Age the cpu statuses past their validity.
    for host in ["host1", "host2"] {
        let log = d.registry.hosts.get_mut(host).unwrap().status_by_test_mut("cpu").unwrap();
        log.valid_time = crate::epoch_secs() - 5;
    }
    let mut page_rx = d.bus.subscribe(ChannelId::Page);
    d.sweep_purple();

    // Ping OK: stale status goes purple (and purple is an alert color).
    assert_eq!(
        d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap().color,
        Color::Purple
    );
    // Ping down: stale status goes clear, no page.
    assert_eq!(
        d.registry.hosts.get("host2").unwrap().status_by_test("cpu").unwrap().color,
        Color::Clear
    );
    let pages = drain(&mut page_rx);
    assert_eq!(pages.len(), 1);
    assert!(pages[0].contains("/host1|"));
}

#[test]
fn summary_statuses_expire_by_deletion() {
    let mut d = daemon();
    send(&mut d, "summary summary.row.col red\nsome summary\n");
    let log_exists = d
        .registry
        .hosts
        .get("summary")
        .map(|h| h.status_by_test("row.col").is_some())
        .unwrap_or(false);
    assert!(log_exists);
    {
        let log =
            d.registry.hosts.get_mut("summary").unwrap().status_by_test_mut("row.col").unwrap();
        log.valid_time = crate::epoch_secs() - 5;
    }
    d.sweep_purple();
    assert!(d.registry.hosts.get("summary").unwrap().status_by_test("row.col").is_none());
}

#[test]
fn board_and_log_queries_respond() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu red\nBad stuff\n");
    let board = send(&mut d, "xymondboard color=red fields=hostname,testname,color\n").unwrap();
    assert_eq!(std::str::from_utf8(&board).unwrap(), "host1|cpu|red\n");

    let log = send(&mut d, "xymondlog host1.cpu\n").unwrap();
    assert!(std::str::from_utf8(&log).unwrap().starts_with("host1|cpu|red|"));

    let q = send(&mut d, "query host1.cpu\n").unwrap();
    assert!(std::str::from_utf8(&q).unwrap().starts_with("red "));
}

#[test]
fn ping_answers_with_version() {
    let mut d = daemon();
    let resp = send(&mut d, "ping\n").unwrap();
    assert!(std::str::from_utf8(&resp).unwrap().starts_with("vigild "));
}

#[test]
fn ghost_mode_log_drops_and_records() {
    let cfg = DaemonConfig::parse_from(["vigild"]); // default ghosts=log
    let mut d = Daemon::new(cfg).unwrap();
    send(&mut d, "status phantom.cpu red\nBad\n");
    assert!(!d.registry.hosts.contains_key("phantom"));
    assert!(d.registry.ghosts.contains_key("phantom"));
    let resp = send(&mut d, "ghostlist\n").unwrap();
    assert!(std::str::from_utf8(&resp).unwrap().starts_with("phantom|10.0.0.5|"));
}

#[test]
fn unauthorized_sender_is_rejected() {
    let cfg = DaemonConfig::parse_from([
        "vigild",
        "--ghosts",
        "allow",
        "--status-senders",
        "192.168.1.1",
    ]);
    let mut d = Daemon::new(cfg).unwrap();
    d.dispatch(b"status host1.cpu green\nok\n", "10.0.0.5", None, false);
    assert!(!d.registry.hosts.contains_key("host1"));
    // The same sender via the back-feed queue is trusted.
    d.dispatch(b"status host1.cpu green\nok\n", "10.0.0.5", None, true);
    assert!(d.registry.hosts.contains_key("host1"));
}

#[test]
fn schedule_list_and_cancel() {
    let mut d = daemon();
    let when = crate::epoch_secs() + 600;
    send(&mut d, &format!("schedule {when} disable host1.cpu 60 planned\n"));
    let listing = send(&mut d, "schedule\n").unwrap();
    let text = String::from_utf8_lossy(&listing).into_owned();
    assert!(text.contains(&format!("|{when}|")));
    let id: i32 = text.split('|').next().unwrap().parse().unwrap();
    send(&mut d, &format!("schedule cancel {id}\n"));
    let listing = send(&mut d, "schedule\n").unwrap();
    assert!(listing.is_empty());
}

#[test]
fn scheduled_task_runs_when_due() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu red\nBad\n");
    d.tasks.push(ScheduledTask {
        id: 99,
        execution_time: crate::epoch_secs() - 1,
        sender: "10.0.0.5".into(),
        command: "drophost host1".into(),
    });
    d.run_scheduled();
    assert!(!d.registry.hosts.contains_key("host1"));
    assert!(d.tasks.is_empty());
}

#[test]
fn stats_message_feeds_back_as_status() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu green\nok\n");
    d.stats_tick();
    let found = d
        .registry
        .hosts
        .values()
        .any(|h| h.statuses.keys().any(|(t, _)| t.as_ref() == "vigild"));
    assert!(found, "the daemon reports its own statistics as a status");
}

#[test]
fn oversize_declared_compress_is_dropped() {
    let cfg = DaemonConfig::parse_from(["vigild", "--ghosts", "allow", "--max-msg-size", "1024"]);
    let mut d = Daemon::new(cfg).unwrap();
    d.dispatch(b"compress:zlib 99999\ngarbage", "10.0.0.5", None, false);
    assert!(d.registry.hosts.is_empty());
}

#[test]
fn histsync_clears_sync_flag() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu green\nok\n");
    assert!(d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap().hist_synced);
    let resp = send(&mut d, "histsync host1.cpu\n").unwrap();
    assert_eq!(&resp[..], b"OK\n");
    assert!(!d.registry.hosts.get("host1").unwrap().status_by_test("cpu").unwrap().hist_synced);
}

#[test]
fn client_message_stored_and_queryable() {
    let mut d = daemon();
    send(&mut d, "status host1.cpu green\nok\n");
    send(&mut d, "client host1.linux\n[df]\nFilesystem use 93%\n");
    let host = d.registry.hosts.get("host1").unwrap();
    assert_eq!(host.client_msgs.len(), 1);
    assert!(host.client_tstamp > 0);

    let resp = send(&mut d, "clientlog host1\n").unwrap();
    assert!(std::str::from_utf8(&resp).unwrap().contains("Filesystem use 93%"));
}
