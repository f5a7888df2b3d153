// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Alert manager checkpoint: one JSON line per active alert.

use std::io::Write;
use std::path::Path;

use super::{ActiveAlert, AlertPhase};

/// Save the alert list; dead entries are not worth persisting.
pub fn save<'a>(path: &Path, alerts: impl Iterator<Item = &'a ActiveAlert>) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    {
        let mut f = std::fs::File::create(&tmp)?;
        for alert in alerts {
            if alert.phase == AlertPhase::Dead {
                continue;
            }
            let Ok(line) = serde_json::to_string(alert) else {
                continue;
            };
            f.write_all(line.as_bytes())?;
            f.write_all(b"\n")?;
        }
    }
    std::fs::rename(&tmp, path)
}

/// Load a checkpoint. `NoRecip` entries come back as `Paging` so newly
/// configured recipients get a chance; unparsable lines are skipped.
pub fn load(path: &Path) -> Vec<ActiveAlert> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter_map(|line| serde_json::from_str::<ActiveAlert>(line).ok())
        .map(|mut a| {
            if a.phase == AlertPhase::NoRecip {
                a.phase = AlertPhase::Paging;
            }
            a
        })
        .filter(|a| a.phase != AlertPhase::Dead)
        .collect()
}

#[cfg(test)]
#[path = "checkpoint_tests.rs"]
mod tests;
