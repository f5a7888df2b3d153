// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Universal invariants checked against a live daemon.

use vigil_specs::TestDaemon;
use vigild::status::DISABLED_UNTIL_OK;

fn fields(line: &str) -> Vec<&str> {
    line.split('|').collect()
}

#[tokio::test]
async fn validtime_dominates_ack_and_enable() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    d.send("status host1.cpu red\nBad\n").await.unwrap();
    d.send("status host1.disk red\nFull\n").await.unwrap();

    // Long ack on cpu, timed disable on disk.
    let cookie = d.talk("xymondboard test=^cpu$ fields=cookie\n").await.unwrap().trim().to_owned();
    d.send(&format!("xymondack {cookie} 120 later\n")).await.unwrap();
    d.send("disable host1.disk 120 maintenance\n").await.unwrap();

    let board = d
        .talk("xymondboard host=^host1$ fields=testname,validtime,acktime,disabletime\n")
        .await
        .unwrap();
    for line in board.lines() {
        let f = fields(line);
        if f[0] != "cpu" && f[0] != "disk" {
            continue;
        }
        let validtime: i64 = f[1].parse().unwrap();
        let acktime: i64 = f[2].parse().unwrap();
        let enabletime: i64 = f[3].parse().unwrap();
        if enabletime != DISABLED_UNTIL_OK {
            assert!(validtime >= acktime.max(enabletime), "invariant broken: {line}");
        }
    }
}

#[tokio::test]
async fn cookies_are_unique_across_statuses() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    for i in 0..20 {
        d.send(&format!("status host{i}.cpu red\nBad\n")).await.unwrap();
    }
    let board = d.talk("xymondboard test=^cpu$ fields=cookie\n").await.unwrap();
    let mut cookies: Vec<&str> = board.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(cookies.len(), 20);
    cookies.sort_unstable();
    let before = cookies.len();
    cookies.dedup();
    assert_eq!(cookies.len(), before, "cookies must be unique");
}

#[tokio::test]
async fn one_record_per_host_test_origin() {
    let d = TestDaemon::spawn(vec!["--ghosts", "allow"]).await.unwrap();
    for _ in 0..5 {
        d.send("status host1.cpu green\nok\n").await.unwrap();
    }
    let board = d.talk("xymondboard test=^cpu$ fields=hostname,testname\n").await.unwrap();
    assert_eq!(board.lines().count(), 1);
}

#[tokio::test]
async fn checkpoint_round_trip_preserves_the_board() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chk");
    let path_arg: &'static str = Box::leak(path.to_string_lossy().into_owned().into_boxed_str());

    let board_before;
    {
        let d = TestDaemon::spawn(vec!["--ghosts", "allow", "--checkpoint-file", path_arg])
            .await
            .unwrap();
        d.send("status host1.cpu red\nBad\n").await.unwrap();
        d.send("status host1.conn green\nup\n").await.unwrap();
        d.send("status host2.disk yellow\nFullish\n").await.unwrap();
        board_before = d
            .talk("xymondboard fields=hostname,testname,color test=cpu|conn|disk\n")
            .await
            .unwrap();
        d.core_tx.send(vigild::core::CoreCmd::Checkpoint).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    }

    let d = TestDaemon::spawn(vec!["--ghosts", "allow", "--checkpoint-file", path_arg])
        .await
        .unwrap();
    let board_after = d
        .talk("xymondboard fields=hostname,testname,color test=cpu|conn|disk\n")
        .await
        .unwrap();
    assert_eq!(board_before, board_after);
}
