// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Proxy building blocks talking to a real daemon.

use vigil_proxy::combine::Combiner;
use vigil_proxy::upstream;
use vigil_specs::TestDaemon;

#[tokio::test]
async fn oneway_status_reaches_the_daemon() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    assert!(upstream::send_oneway(&d.addr, b"status host1.cpu green\nok\n").await);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let board = d.talk("xymondboard test=^cpu$ fields=hostname,color\n").await.unwrap();
    assert_eq!(board.trim(), "host1|green");
}

#[tokio::test]
async fn request_response_through_the_proxy_path() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    let reply = upstream::request(&d.addr, b"ping\n").await.unwrap();
    assert!(String::from_utf8_lossy(&reply).starts_with("vigild "));
}

#[tokio::test]
async fn combined_batch_is_unpacked_by_the_daemon() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();

    let mut combiner = Combiner::new();
    combiner.push(b"status a.cpu green\nok\n");
    combiner.push(b"status b.cpu red\nbad\n");
    combiner.push(b"status c.cpu yellow\nmeh\n");
    let (combo, count) = combiner.flush().unwrap();
    assert_eq!(count, 3);

    assert!(upstream::send_oneway(&d.addr, &combo).await);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let board = d.talk("xymondboard test=^cpu$ fields=hostname,color\n").await.unwrap();
    let lines: Vec<&str> = board.lines().collect();
    assert!(lines.contains(&"a|green"));
    assert!(lines.contains(&"b|red"));
    assert!(lines.contains(&"c|yellow"));
}
