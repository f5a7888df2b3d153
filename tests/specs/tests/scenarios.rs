// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios over the real TCP surface.

use vigil_specs::TestDaemon;
use vigild::bus::ChannelId;

async fn recv_until_quiet(
    rx: &mut tokio::sync::broadcast::Receiver<bytes::Bytes>,
) -> Vec<String> {
    let mut out = Vec::new();
    loop {
        match tokio::time::timeout(std::time::Duration::from_millis(300), rx.recv()).await {
            Ok(Ok(msg)) => out.push(String::from_utf8_lossy(&msg).into_owned()),
            _ => return out,
        }
    }
}

fn board_field<'a>(line: &'a str, idx: usize) -> &'a str {
    line.split('|').nth(idx).unwrap_or("")
}

#[tokio::test]
async fn basic_status_update() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    let mut status_rx = d.bus.subscribe(ChannelId::Status);
    let mut stachg_rx = d.bus.subscribe(ChannelId::Stachg);
    let mut page_rx = d.bus.subscribe(ChannelId::Page);

    d.send("status host1.cpu green\nMsg\n").await.unwrap();

    let board = d.talk("xymondboard test=^cpu$ fields=hostname,testname,color,lastchange\n").await.unwrap();
    let line = board.lines().next().unwrap();
    assert_eq!(board_field(line, 0), "host1");
    assert_eq!(board_field(line, 2), "green");
    let lastchange: i64 = board_field(line, 3).parse().unwrap();
    assert!((vigild::epoch_secs() - lastchange).abs() < 10);

    assert_eq!(recv_until_quiet(&mut status_rx).await.len(), 1);
    assert_eq!(recv_until_quiet(&mut stachg_rx).await.len(), 1, "first-time sync posts stachg");
    assert!(recv_until_quiet(&mut page_rx).await.is_empty());

    // Second identical message: one status post, no stachg.
    d.send("status host1.cpu green\nMsg\n").await.unwrap();
    assert_eq!(recv_until_quiet(&mut status_rx).await.len(), 1);
    assert!(recv_until_quiet(&mut stachg_rx).await.is_empty());
}

#[tokio::test]
async fn escalation_scenario() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    d.send("status host1.cpu green\nMsg\n").await.unwrap();

    let mut stachg_rx = d.bus.subscribe(ChannelId::Stachg);
    let mut page_rx = d.bus.subscribe(ChannelId::Page);
    d.send("status host1.cpu red\nBad\n").await.unwrap();

    assert_eq!(recv_until_quiet(&mut stachg_rx).await.len(), 1);
    let pages = recv_until_quiet(&mut page_rx).await;
    assert_eq!(pages.len(), 1);

    let board = d
        .talk("xymondboard test=^cpu$ fields=hostname,color,cookie\n")
        .await
        .unwrap();
    let line = board.lines().next().unwrap();
    assert_eq!(board_field(line, 1), "red");
    let cookie = board_field(line, 2);
    assert!(!cookie.is_empty() && cookie.bytes().all(|b| b.is_ascii_digit()));
    assert!(pages[0].contains(cookie), "the page event carries the cookie");
}

#[tokio::test]
async fn ack_by_cookie_scenario() {
    use vigild::alert::evaluator::AlertEvaluator;
    use vigild::alert::rules::AlertRules;
    use vigild::alert::{parse_event, AlertPhase};
    use vigild::color::ColorPolicy;

    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    let mut page_rx = d.bus.subscribe(ChannelId::Page);
    d.send("status host1.cpu red\nBad\n").await.unwrap();

    let board = d.talk("xymondboard fields=cookie test=^cpu$\n").await.unwrap();
    let cookie = board.trim().to_owned();
    assert!(!cookie.is_empty());

    d.send(&format!("xymondack {cookie} 10 took it\n")).await.unwrap();

    let board = d.talk("xymondboard test=^cpu$ fields=acktime,validtime,ackmsg\n").await.unwrap();
    let line = board.lines().next().unwrap();
    let acktime: i64 = board_field(line, 0).parse().unwrap();
    let validtime: i64 = board_field(line, 1).parse().unwrap();
    let now = vigild::epoch_secs();
    assert!((acktime - (now + 600)).abs() < 10, "ack for 10 minutes");
    assert!(validtime >= acktime);
    assert!(board_field(line, 2).contains("took it"));

    // Run the observed page events through the alert manager: the first red
    // fires once, the ack holds everything after it.
    d.send("status host1.cpu red\nstill bad\n").await.unwrap();
    d.send("status host1.cpu red\nstill bad\n").await.unwrap();
    let events = recv_until_quiet(&mut page_rx).await;
    assert!(events[0].starts_with("@@page#"));
    assert!(events.iter().any(|e| e.starts_with("@@ack#")));

    let mut ev = AlertEvaluator::new(
        AlertRules::parse(".* red,yellow,purple 5 ops@example.com\n"),
        ColorPolicy::default(),
    );
    let mut fired = 0;
    for envelope in &events {
        if let Some(event) = parse_event(envelope) {
            ev.handle_event(event, vigild::epoch_secs());
        }
        fired += ev.tick(vigild::epoch_secs()).len();
    }
    assert_eq!(fired, 1, "one dispatch before the ack, none after");
    assert_eq!(ev.alerts().next().map(|a| a.phase), Some(AlertPhase::Acked));
}

#[tokio::test]
async fn modify_narrowing_scenario() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    d.send("status host1.cpu red\nBad\n").await.unwrap();
    d.send("modifydown+3 host1.cpu yellow src1 reason\n").await.unwrap();

    for _ in 0..3 {
        d.send("status host1.cpu red\nBad\n").await.unwrap();
        let board = d.talk("xymondboard test=^cpu$ fields=color\n").await.unwrap();
        assert_eq!(board.trim(), "yellow", "clamped while the budget lasts");
    }
    d.send("status host1.cpu red\nBad\n").await.unwrap();
    let board = d.talk("xymondboard test=^cpu$ fields=color\n").await.unwrap();
    assert_eq!(board.trim(), "red", "fourth arrival is unaffected");
}

#[tokio::test]
async fn extcombo_scenario() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    let mut status_rx = d.bus.subscribe(ChannelId::Status);

    let inner1 = b"status a.t red\nBad\n".to_vec();
    let inner2 = b"status b.t green\nOk\n".to_vec();
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
    let mut msg = header.into_bytes();
    msg.extend_from_slice(&inner1);
    msg.extend_from_slice(&inner2);

    use tokio::io::AsyncWriteExt;
    let mut conn = tokio::net::TcpStream::connect(&d.addr).await.unwrap();
    conn.write_all(&msg).await.unwrap();
    conn.shutdown().await.unwrap();
    drop(conn);

    let posts = recv_until_quiet(&mut status_rx).await;
    assert_eq!(posts.len(), 2);
    assert!(posts[0].contains("/a|"));
    assert!(posts[1].contains("/b|"));

    let board = d.talk("xymondboard test=^t$ fields=hostname,color\n").await.unwrap();
    let lines: Vec<&str> = board.lines().collect();
    assert!(lines.contains(&"a|red"));
    assert!(lines.contains(&"b|green"));
}

#[tokio::test]
async fn size_framed_query_without_half_close() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    d.send("status host1.cpu green\nMsg\n").await.unwrap();

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let query = "query host1.cpu\n";
    let framed = format!("size:{}\n{}", query.len(), query);
    let mut conn = tokio::net::TcpStream::connect(&d.addr).await.unwrap();
    conn.write_all(framed.as_bytes()).await.unwrap();
    // No half-close: the frame length delimits the message.
    let mut out = vec![0u8; 6];
    conn.read_exact(&mut out).await.unwrap();
    assert_eq!(&out, b"green ");
}

#[tokio::test]
async fn disable_wildcard_covers_all_tests() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    d.send("status host1.cpu red\nBad\n").await.unwrap();
    d.send("status host1.disk yellow\nFullish\n").await.unwrap();
    d.send("disable host1.* 60 planned work\n").await.unwrap();

    let board = d.talk("xymondboard host=^host1$ fields=testname,color,dismsg\n").await.unwrap();
    for line in board.lines() {
        let test = board_field(line, 0);
        if test == "cpu" || test == "disk" {
            assert_eq!(board_field(line, 1), "blue", "disabled: {line}");
            assert!(board_field(line, 2).contains("planned work"));
        }
    }
}

#[tokio::test]
async fn drophost_scenario() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    d.send("status host1.cpu red\nBad\n").await.unwrap();
    d.send("drophost host1\n").await.unwrap();
    let board = d.talk("xymondboard host=^host1$ fields=hostname\n").await.unwrap();
    assert!(board.is_empty());
}

#[tokio::test]
async fn ghostlist_reports_unknown_hosts() {
    let d = TestDaemon::spawn(vec![]).await.unwrap(); // default ghosts=log
    d.send("status phantom.cpu red\nBad\n").await.unwrap();
    let ghosts = d.talk("ghostlist\n").await.unwrap();
    assert!(ghosts.starts_with("phantom|127.0.0.1|"));
    let board = d.talk("xymondboard fields=hostname\n").await.unwrap();
    assert!(board.is_empty(), "ghost status was dropped");
}
