// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Alert recipient rules.
//!
//! One rule per line: `PATTERN COLORS INTERVAL RECIPIENT`, where PATTERN is
//! a regex matched against `host.test` (and against the host's page path
//! when prefixed with `page:`), COLORS restricts the triggering colors and
//! INTERVAL is the repeat interval in minutes. Blank lines and `#` comments
//! are skipped.

use std::path::Path;

use regex::Regex;

use crate::color::{Color, ColorSet};

#[derive(Debug)]
pub struct AlertRule {
    pub pattern: Regex,
    pub location: bool,
    pub colors: ColorSet,
    pub interval_min: i64,
    pub recipient: String,
}

#[derive(Debug, Default)]
pub struct AlertRules {
    rules: Vec<AlertRule>,
}

impl AlertRules {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn parse(contents: &str) -> Self {
        let mut rules = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let toks: Vec<&str> = line.split_ascii_whitespace().collect();
            if toks.len() < 4 {
                tracing::warn!(lineno = lineno + 1, "short alert rule skipped");
                continue;
            }
            let (location, pat) = match toks[0].strip_prefix("page:") {
                Some(p) => (true, p),
                None => (false, toks[0]),
            };
            let Ok(pattern) = Regex::new(pat) else {
                tracing::warn!(lineno = lineno + 1, pattern = pat, "bad alert rule pattern");
                continue;
            };
            let colors = if toks[1] == "*" {
                ColorSet::of(&Color::ALL)
            } else {
                ColorSet::parse(toks[1])
            };
            let Ok(interval_min) = toks[2].parse::<i64>() else {
                tracing::warn!(lineno = lineno + 1, "bad alert rule interval");
                continue;
            };
            rules.push(AlertRule {
                pattern,
                location,
                colors,
                interval_min,
                recipient: toks[3..].join(" "),
            });
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All rules matching one alert. Color is ignored for recovery/notify
    /// dispatch when `any_color` is set.
    pub fn matches(
        &self,
        hostname: &str,
        testname: &str,
        location: &str,
        color: Color,
        any_color: bool,
    ) -> Vec<&AlertRule> {
        let subject = format!("{hostname}.{testname}");
        self.rules
            .iter()
            .filter(|r| {
                let target = if r.location { location } else { subject.as_str() };
                r.pattern.is_match(target) && (any_color || r.colors.contains(color))
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "rules_tests.rs"]
mod tests;
