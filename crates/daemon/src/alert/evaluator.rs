// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The alert state machine and its worker task.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::rules::AlertRules;
use super::{checkpoint, parse_event, ActiveAlert, AlertPhase, PageEvent};
use crate::color::{AlertState, ColorPolicy};
use crate::core::CoreCmd;

/// One delivery the evaluator decided on; executed by the send-alert hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub alert: ActiveAlert,
    pub recipient: String,
}

pub struct AlertEvaluator {
    alerts: HashMap<(String, String), ActiveAlert>,
    rules: AlertRules,
    policy: ColorPolicy,
}

impl AlertEvaluator {
    pub fn new(rules: AlertRules, policy: ColorPolicy) -> Self {
        Self { alerts: HashMap::new(), rules, policy }
    }

    pub fn alerts(&self) -> impl Iterator<Item = &ActiveAlert> {
        self.alerts.values()
    }

    pub fn restore(&mut self, alerts: Vec<ActiveAlert>) {
        for a in alerts {
            self.alerts.insert((a.hostname.clone(), a.testname.clone()), a);
        }
    }

    /// Drop restored alerts that a live board query no longer confirms.
    pub fn discard_stale(&mut self, live: &[(String, String)]) {
        let before = self.alerts.len();
        self.alerts.retain(|key, _| live.contains(key));
        let dropped = before - self.alerts.len();
        if dropped > 0 {
            info!(dropped, "discarded stale checkpointed alerts");
        }
    }

    pub fn handle_event(&mut self, event: PageEvent, now: i64) {
        match event {
            PageEvent::Page { host, test, ip, color, old_color: _, page_path, cookie, body } => {
                let key = (host.clone(), test.clone());
                match self.policy.decide(color) {
                    AlertState::Alert => {
                        let entry = self.alerts.entry(key).or_insert_with(|| ActiveAlert {
                            hostname: host,
                            testname: test,
                            location: page_path.clone(),
                            ip: ip.clone(),
                            color,
                            max_color: color,
                            page_message: String::new(),
                            ack_message: None,
                            event_start: now,
                            next_alert_time: now,
                            phase: AlertPhase::Paging,
                            cookie: None,
                        });
                        entry.color = color;
                        entry.max_color = entry.max_color.max(color);
                        entry.page_message = body;
                        entry.location = page_path;
                        entry.ip = ip;
                        entry.cookie = cookie;
                        if entry.phase == AlertPhase::Recovered || entry.phase == AlertPhase::Dead {
                            entry.phase = AlertPhase::Paging;
                            entry.event_start = now;
                            entry.next_alert_time = now;
                        }
                    }
                    AlertState::Ok => {
                        if let Some(entry) = self.alerts.get_mut(&key) {
                            entry.color = color;
                            entry.page_message = body;
                            entry.phase = AlertPhase::Recovered;
                        }
                    }
                    AlertState::Undecided => {
                        // Color moved between non-alerting states; nothing to do.
                    }
                }
            }
            PageEvent::Ack { host, test, ack_time, body } => {
                if let Some(entry) = self.alerts.get_mut(&(host, test)) {
                    if entry.phase == AlertPhase::Paging {
                        entry.phase = AlertPhase::Acked;
                        entry.next_alert_time = ack_time;
                        entry.ack_message = Some(body);
                    }
                }
            }
            PageEvent::Notify { host, test, body } => {
                let key = (host.clone(), test.clone());
                self.alerts.entry(key).or_insert_with(|| ActiveAlert {
                    hostname: host,
                    testname: test,
                    location: String::new(),
                    ip: String::new(),
                    color: crate::color::Color::Green,
                    max_color: crate::color::Color::Green,
                    page_message: body,
                    ack_message: None,
                    event_start: now,
                    next_alert_time: now,
                    phase: AlertPhase::Notify,
                    cookie: None,
                });
            }
            PageEvent::DropHost(host) | PageEvent::RenameHost(host) => {
                for a in self.alerts.values_mut().filter(|a| a.hostname == host) {
                    a.phase = AlertPhase::Dead;
                }
            }
            PageEvent::DropTest(host, test) | PageEvent::RenameTest(host, test) => {
                if let Some(a) = self.alerts.get_mut(&(host, test)) {
                    a.phase = AlertPhase::Dead;
                }
            }
            PageEvent::Shutdown => {}
        }
    }

    /// One evaluator pass: decide what to dispatch, advance repeat timers,
    /// and sweep dead entries.
    pub fn tick(&mut self, now: i64) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();

        for alert in self.alerts.values_mut() {
            match alert.phase {
                AlertPhase::Paging if alert.next_alert_time <= now => {
                    let matched = self.rules.matches(
                        &alert.hostname,
                        &alert.testname,
                        &alert.location,
                        alert.color,
                        false,
                    );
                    if matched.is_empty() {
                        debug!(host = %alert.hostname, test = %alert.testname, "no recipients");
                        alert.phase = AlertPhase::NoRecip;
                        continue;
                    }
                    // The repeat interval is the shortest among matched rules.
                    let interval = matched.iter().map(|r| r.interval_min).min().unwrap_or(30);
                    for rule in matched {
                        dispatches.push(Dispatch {
                            alert: alert.clone(),
                            recipient: rule.recipient.clone(),
                        });
                    }
                    alert.next_alert_time = now + interval * 60;
                }
                AlertPhase::Acked if alert.next_alert_time <= now => {
                    // The ack expired: resume paging immediately.
                    alert.phase = AlertPhase::Paging;
                    alert.next_alert_time = now;
                    alert.ack_message = None;
                }
                AlertPhase::Recovered | AlertPhase::Notify => {
                    let matched = self.rules.matches(
                        &alert.hostname,
                        &alert.testname,
                        &alert.location,
                        alert.color,
                        true,
                    );
                    for rule in matched {
                        dispatches.push(Dispatch {
                            alert: alert.clone(),
                            recipient: rule.recipient.clone(),
                        });
                    }
                    alert.phase = AlertPhase::Dead;
                }
                _ => {}
            }
        }

        self.alerts.retain(|_, a| a.phase != AlertPhase::Dead);
        dispatches
    }
}

/// Ask the daemon for the currently-alerting statuses, to validate a
/// restored checkpoint.
async fn query_live_alerts(core_tx: &mpsc::Sender<CoreCmd>) -> Option<Vec<(String, String)>> {
    let (tx, rx) = oneshot::channel();
    let msg = crate::core::IngestMessage {
        buf: Bytes::from_static(b"xymondboard color=red,yellow,purple,blue,clear fields=hostname,testname"),
        sender: crate::core::INTERNAL_SENDER.to_owned(),
        sender_cn: None,
        via_bfq: true,
    };
    core_tx.send(CoreCmd::Message { msg, reply: Some(tx) }).await.ok()?;
    let reply = rx.await.ok()?;
    let text = String::from_utf8_lossy(&reply);
    Some(
        text.lines()
            .filter_map(|l| l.split_once('|'))
            .map(|(h, t)| (h.to_owned(), t.to_owned()))
            .collect(),
    )
}

/// Run one alert delivery through the send-alert hook. With no script
/// configured the delivery is just logged.
fn send_alert(script: Option<&PathBuf>, dispatch: &Dispatch) {
    let phase = match dispatch.alert.phase {
        AlertPhase::Recovered => "recovered",
        AlertPhase::Notify => "notify",
        _ => "paging",
    };
    let Some(script) = script else {
        info!(
            host = %dispatch.alert.hostname,
            test = %dispatch.alert.testname,
            color = %dispatch.alert.color,
            recipient = %dispatch.recipient,
            phase,
            "alert"
        );
        return;
    };
    let mut cmd = tokio::process::Command::new(script);
    cmd.env("ALERT_HOSTNAME", &dispatch.alert.hostname)
        .env("ALERT_TESTNAME", &dispatch.alert.testname)
        .env("ALERT_COLOR", dispatch.alert.color.as_str())
        .env("ALERT_RECIPIENT", &dispatch.recipient)
        .env("ALERT_PHASE", phase)
        .env("ALERT_EVENTSTART", dispatch.alert.event_start.to_string())
        .env("ALERT_MESSAGE", &dispatch.alert.page_message)
        .env("ALERT_COOKIE", dispatch.alert.cookie.clone().unwrap_or_default())
        .stdin(std::process::Stdio::null());
    match cmd.spawn() {
        Ok(mut child) => {
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if !status.success() => {
                        warn!(%status, "alert script exited non-zero");
                    }
                    Err(e) => warn!(%e, "alert script wait failed"),
                    _ => {}
                }
            });
        }
        Err(e) => error!(%e, "cannot spawn alert script"),
    }
}

/// The alert worker task.
pub async fn run(
    mut evaluator: AlertEvaluator,
    mut rx: broadcast::Receiver<Bytes>,
    core_tx: mpsc::Sender<CoreCmd>,
    script: Option<PathBuf>,
    checkpoint_path: Option<PathBuf>,
    shutdown: CancellationToken,
) {
    if let Some(ref path) = checkpoint_path {
        if path.exists() {
            let restored = checkpoint::load(path);
            info!(count = restored.len(), "alert checkpoint restored");
            evaluator.restore(restored);
            if let Some(live) = query_live_alerts(&core_tx).await {
                evaluator.discard_stale(&live);
            }
        }
    }

    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut save = tokio::time::interval(std::time::Duration::from_secs(300));
    save.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Ok(envelope) => {
                    let text = String::from_utf8_lossy(&envelope);
                    if let Some(event) = parse_event(&text) {
                        if event == PageEvent::Shutdown {
                            break;
                        }
                        evaluator.handle_event(event, crate::epoch_secs());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "alert worker lagged behind the page channel");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tick.tick() => {
                for dispatch in evaluator.tick(crate::epoch_secs()) {
                    send_alert(script.as_ref(), &dispatch);
                }
            }
            _ = save.tick() => {
                if let Some(ref path) = checkpoint_path {
                    if let Err(e) = checkpoint::save(path, evaluator.alerts()) {
                        error!(%e, "alert checkpoint save failed");
                    }
                }
            }
        }
    }

    if let Some(ref path) = checkpoint_path {
        if let Err(e) = checkpoint::save(path, evaluator.alerts()) {
            error!(%e, "final alert checkpoint failed");
        }
    }
}

#[cfg(test)]
#[path = "evaluator_tests.rs"]
mod tests;
