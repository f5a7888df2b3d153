// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::hosts::HostsConfig;

const NOW: i64 = 1_700_000_000;

fn params<'a>(now: i64) -> UpdateParams<'a> {
    UpdateParams {
        now,
        validity_min: 30,
        flap_count: 5,
        flap_threshold: 1800,
        ack_each_color: false,
        policy: ColorPolicy::default(),
        host_info: None,
        internal_sender: "vigild",
        mode: UpdateMode::Status,
        is_summary: false,
        store_message: true,
        host_name: "host1",
    }
}

fn fresh(color: Color) -> StatusRecord {
    StatusRecord::new("cpu".into(), "vigild".into(), color, NOW, 5)
}

#[test]
fn first_update_posts_status_and_stachg() {
    let mut log = fresh(Color::Green);
    let out = apply_status(
        &mut log,
        "status host1.cpu green\nAll fine\n",
        "10.0.0.5",
        None,
        None,
        Color::Green,
        None,
        &params(NOW),
    );
    assert!(out.post_status);
    assert!(out.post_stachg, "first-time sync posts stachg");
    assert!(!out.post_page);
    assert!(!out.need_cookie);
    assert_eq!(log.color, Color::Green);
    assert_eq!(log.last_change[0], NOW);
    assert_eq!(log.valid_time, NOW + 30 * 60);
    assert_eq!(log.line1, "green All fine");
}

#[test]
fn identical_update_skips_stachg() {
    let mut log = fresh(Color::Green);
    apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW));
    let count = log.status_change_count;
    let out = apply_status(
        &mut log,
        "status host1.cpu green\nok\n",
        "10.0.0.5",
        None,
        None,
        Color::Green,
        None,
        &params(NOW + 10),
    );
    assert!(out.post_status);
    assert!(!out.post_stachg);
    assert_eq!(log.status_change_count, count);
}

#[test]
fn escalation_pages_and_needs_cookie() {
    let mut log = fresh(Color::Green);
    apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW));
    let out = apply_status(
        &mut log,
        "status host1.cpu red\nBad\n",
        "10.0.0.5",
        None,
        None,
        Color::Red,
        None,
        &params(NOW + 60),
    );
    assert_eq!(log.color, Color::Red);
    assert_eq!(log.old_color, Color::Green);
    assert!(out.post_stachg);
    assert!(out.post_page);
    assert!(out.need_cookie);
    assert!(log.active_alert);
    assert_eq!(log.max_acked_color, Color::Green);
    assert_eq!(log.last_change[0], NOW + 60);
    assert_eq!(log.last_change[1], NOW);
}

#[test]
fn recovery_clears_alert_and_cookie() {
    let mut log = fresh(Color::Green);
    apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &params(NOW));
    log.cookie = Some("123".into());
    log.cookie_expires = NOW + 86_400;
    let out = apply_status(
        &mut log,
        "status host1.cpu green\nok\n",
        "10.0.0.5",
        None,
        None,
        Color::Green,
        None,
        &params(NOW + 120),
    );
    assert!(out.post_page, "recovery posts to the page channel");
    assert!(out.clear_cookie);
    assert!(!log.active_alert);
}

#[test]
fn modify_narrowing_lasts_three_messages() {
    let mut log = fresh(Color::Green);
    let spec = parse_modify("modifydown+3 host1.cpu yellow src1 maintenance window", NOW).unwrap();
    assert!(install_modifier(&mut log, &spec));

    for i in 1..=3 {
        let out = apply_status(
            &mut log,
            "status host1.cpu red\nbad\n",
            "10.0.0.5",
            None,
            None,
            Color::Red,
            None,
            &params(NOW + i * 60),
        );
        assert_eq!(log.color, Color::Yellow, "clamped on arrival {i}");
        assert!(out.post_status);
    }
    // Budget exhausted: fourth arrival is unaffected.
    apply_status(
        &mut log,
        "status host1.cpu red\nbad\n",
        "10.0.0.5",
        None,
        None,
        Color::Red,
        None,
        &params(NOW + 300),
    );
    assert_eq!(log.color, Color::Red);
    assert!(log.modifiers.is_empty());
}

#[test]
fn modify_up_raises_color() {
    let mut log = fresh(Color::Green);
    let spec = parse_modify("modifyup+5 host1.cpu yellow watcher disk trend", NOW).unwrap();
    install_modifier(&mut log, &spec);
    apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW));
    assert_eq!(log.color, Color::Yellow);
}

#[test]
fn modify_does_not_decrement_its_own_budget() {
    let mut log = fresh(Color::Green);
    let spec = parse_modify("modify+2 host1.cpu yellow src cause text", NOW).unwrap();
    install_modifier(&mut log, &spec);
    let mut p = params(NOW);
    p.mode = UpdateMode::ModifyNew;
    p.store_message = false;
    apply_status(&mut log, "", "10.0.0.5", None, None, Color::Green, None, &p);
    assert_eq!(log.modifiers[0].valid, Some(2), "modify-triggered runs keep the budget");
}

#[test]
fn duration_modifier_expires_by_clock() {
    let mut log = fresh(Color::Green);
    let spec = parse_modify("modify+5v host1.cpu red probe outage", NOW).unwrap();
    assert_eq!(spec.valid, None);
    assert_eq!(spec.valid_until, NOW + 300);
    install_modifier(&mut log, &spec);

    apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW + 60));
    assert_eq!(log.color, Color::Red);

    apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW + 400));
    assert_eq!(log.color, Color::Green);
    assert!(log.modifiers.is_empty());
}

#[test]
fn flap_damping_keeps_worse_color() {
    let mut log = fresh(Color::Green);
    let mut t = NOW;
    // Burn through the ring with rapid changes.
    for _ in 0..3 {
        t += 10;
        apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &params(t));
        t += 10;
        apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(t));
    }
    assert!(log.flapping);
    // Damped: the green update could not lower the color.
    assert_eq!(log.color, Color::Red);
}

#[test]
fn flap_disabled_with_zero_count() {
    let mut p = params(NOW);
    p.flap_count = 0;
    let mut log = StatusRecord::new("cpu".into(), "vigild".into(), Color::Green, NOW, 0);
    assert_eq!(log.last_change.len(), 1);
    let mut t = NOW;
    for _ in 0..5 {
        t += 5;
        apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &{
            let mut p2 = params(t);
            p2.flap_count = 0;
            p2
        });
        t += 5;
        apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &{
            let mut p2 = params(t);
            p2.flap_count = 0;
            p2
        });
    }
    assert!(!log.flapping);
    assert_eq!(log.color, Color::Green, "changes apply unconditionally");
}

#[test]
fn disable_until_ok_holds_blue() {
    let mut log = fresh(Color::Red);
    log.enable_time = DISABLED_UNTIL_OK;
    log.dis_msg = Some("planned".into());

    let out = apply_status(&mut log, "status host1.cpu red\nstill bad\n", "10.0.0.5", None, None, Color::Red, None, &params(NOW));
    assert_eq!(log.color, Color::Blue);
    assert_eq!(log.valid_time, i64::MAX);
    assert!(!out.post_enadis);

    let out = apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW + 60));
    assert_eq!(log.color, Color::Green);
    assert_eq!(log.enable_time, 0);
    assert!(out.post_enadis, "clearing the disable emits an enadis event");
}

#[test]
fn timed_disable_expires() {
    let mut log = fresh(Color::Green);
    log.enable_time = NOW + 600;
    log.dis_msg = Some("maintenance".into());

    apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &params(NOW));
    assert_eq!(log.color, Color::Blue);
    assert!(log.valid_time >= log.enable_time);

    let out = apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &params(NOW + 700));
    assert_eq!(log.color, Color::Red);
    assert_eq!(log.enable_time, 0);
    assert!(log.dis_msg.is_none());
    assert!(out.post_enadis);
}

#[test]
fn ack_expires_and_recovery_clears_it() {
    let mut log = fresh(Color::Red);
    log.ack_time = NOW + 600;
    log.ack_msg = Some("on it".into());
    log.max_acked_color = Color::Red;

    apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &params(NOW + 60));
    assert_eq!(log.ack_time, NOW + 600, "ack survives while valid");
    assert!(log.valid_time >= log.ack_time);

    apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW + 120));
    assert_eq!(log.ack_time, 0);
    assert_eq!(log.max_acked_color, Color::Green);
}

#[test]
fn ack_each_color_reacks_on_escalation() {
    let mut log = fresh(Color::Yellow);
    log.ack_time = NOW + 3600;
    log.max_acked_color = Color::Yellow;
    let mut p = params(NOW + 30);
    p.ack_each_color = true;
    apply_status(&mut log, "status host1.cpu red\nworse\n", "10.0.0.5", None, None, Color::Red, None, &p);
    assert_eq!(log.ack_time, 0, "escalation above the acked color clears the ack");
}

#[test]
fn delayed_red_keeps_prior_color_until_sustained() {
    let cfg = HostsConfig::parse("10.0.0.1 host1 # delayred=cpu:5\n");
    let info = cfg.get("host1");

    let mut log = fresh(Color::Green);
    let mut p = params(NOW);
    p.host_info = info;
    apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &p);
    // With no yellow delay configured, a delayed red shows as yellow while
    // it is sustaining.
    assert_eq!(log.color, Color::Yellow, "red must sustain for 5 minutes");
    assert_eq!(log.red_start, NOW);

    let mut p = params(NOW + 360);
    p.host_info = info;
    apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &p);
    assert_eq!(log.color, Color::Red, "delay passed");
}

#[test]
fn yellow_owns_duration_across_red_flap() {
    let mut log = fresh(Color::Green);
    apply_status(&mut log, "status host1.cpu yellow\nmeh\n", "10.0.0.5", None, None, Color::Yellow, None, &params(NOW));
    assert_eq!(log.yellow_start, NOW);
    assert_eq!(log.red_start, 0);

    apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &params(NOW + 60));
    assert_eq!(log.red_start, NOW + 60);
    assert_eq!(log.yellow_start, NOW, "yellow keeps its start through a red excursion");

    apply_status(&mut log, "status host1.cpu yellow\nmeh\n", "10.0.0.5", None, None, Color::Yellow, None, &params(NOW + 120));
    assert_eq!(log.red_start, 0);
    assert_eq!(log.yellow_start, NOW);
}

#[test]
fn multi_source_detection() {
    let mut log = fresh(Color::Green);
    apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW));
    let out = apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.9", None, None, Color::Green, None, &params(NOW + 30));
    assert_eq!(out.multi_source, Some(("10.0.0.5".into(), "10.0.0.9".into())));
}

#[test]
fn internal_sender_is_not_multi_source() {
    let mut log = fresh(Color::Green);
    apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW));
    let out = apply_status(&mut log, "status host1.cpu purple\nstale\n", "vigild", None, None, Color::Purple, None, &params(NOW + 30));
    assert_eq!(out.multi_source, None);
}

#[test]
fn acklist_revived_on_new_failure() {
    let mut log = fresh(Color::Red);
    log.active_alert = true;
    log.acks.push(Ack {
        received: NOW - 100,
        valid_until: NOW + 3600,
        clear_time: NOW + 3600,
        level: 1,
        acked_by: "ops".into(),
        msg: "looking".into(),
    });

    apply_status(&mut log, "status host1.cpu green\nok\n", "10.0.0.5", None, None, Color::Green, None, &params(NOW));
    assert_eq!(log.acks[0].clear_time, NOW + ACK_CLEAR_DELAY, "recovery schedules self-clean");

    apply_status(&mut log, "status host1.cpu red\nbad\n", "10.0.0.5", None, None, Color::Red, None, &params(NOW + 60));
    assert_eq!(log.acks[0].clear_time, NOW + 3600, "new failure revives the ack");
}

#[test]
fn test_flags_are_stored_verbatim() {
    let mut log = fresh(Color::Green);
    apply_status(
        &mut log,
        "status host1.cpu green <!-- [flags:OdT] --> up\nok\n",
        "10.0.0.5",
        None,
        None,
        Color::Green,
        None,
        &params(NOW),
    );
    assert_eq!(log.test_flags.as_deref(), Some("OdT"));
}

#[test]
fn parse_modify_variants() {
    let m = parse_modify("modify host1.cpu yellow src some cause", NOW).unwrap();
    assert_eq!(m.kind, ModifierKind::Normal);
    assert_eq!(m.valid, Some(DEFAULT_MODIFY_VALIDITY));
    assert_eq!(m.valid_until, 0);
    assert_eq!(m.cause, "some cause");

    let m = parse_modify("modifydown+7 host1.cpu yellow src c", NOW).unwrap();
    assert_eq!(m.kind, ModifierKind::Down);
    assert_eq!(m.valid, Some(7));

    let m = parse_modify("modifyup+2+10v host1.cpu red src c", NOW).unwrap();
    assert_eq!(m.kind, ModifierKind::Up);
    assert_eq!(m.valid, Some(2));
    assert_eq!(m.valid_until, NOW + 600);

    assert!(parse_modify("modify host1.cpu chartreuse src c", NOW).is_none());
    assert!(parse_modify("modify host1.cpu red src", NOW).is_none());
}

#[test]
fn flush_acks_drops_expired() {
    let mut log = fresh(Color::Red);
    for (i, clear) in [(1, NOW - 10), (2, NOW + 100)] {
        log.acks.push(Ack {
            received: NOW - 500,
            valid_until: NOW + 100,
            clear_time: clear,
            level: i,
            acked_by: "ops".into(),
            msg: "m".into(),
        });
    }
    log.flush_acks(NOW, false);
    assert_eq!(log.acks.len(), 1);
    assert_eq!(log.acks[0].level, 2);
    log.flush_acks(NOW, true);
    assert!(log.acks.is_empty());
}
