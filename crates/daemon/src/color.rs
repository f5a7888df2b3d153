// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Status colors, severity ordering, and the alert/OK color policy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status colors in increasing severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Color {
    #[default]
    Green = 0,
    Blue = 1,
    Clear = 2,
    Yellow = 3,
    Red = 4,
    Purple = 5,
}

impl Color {
    pub const ALL: [Color; 6] =
        [Color::Green, Color::Blue, Color::Clear, Color::Yellow, Color::Red, Color::Purple];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Blue => "blue",
            Self::Clear => "clear",
            Self::Yellow => "yellow",
            Self::Red => "red",
            Self::Purple => "purple",
        }
    }

    pub fn parse(s: &str) -> Option<Color> {
        match s {
            "green" => Some(Self::Green),
            "blue" => Some(Self::Blue),
            "clear" => Some(Self::Clear),
            "yellow" => Some(Self::Yellow),
            "red" => Some(Self::Red),
            "purple" => Some(Self::Purple),
            _ => None,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of colors, stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorSet(u8);

impl ColorSet {
    pub const EMPTY: ColorSet = ColorSet(0);

    pub fn of(colors: &[Color]) -> ColorSet {
        let mut set = ColorSet(0);
        for c in colors {
            set.insert(*c);
        }
        set
    }

    /// Parse a comma-separated color list; unknown names are ignored.
    pub fn parse(csv: &str) -> ColorSet {
        let mut set = ColorSet(0);
        for tok in csv.split(',') {
            if let Some(c) = Color::parse(tok.trim()) {
                set.insert(c);
            }
        }
        set
    }

    pub fn insert(&mut self, c: Color) {
        self.0 |= 1 << (c as u8);
    }

    pub fn contains(&self, c: Color) -> bool {
        self.0 & (1 << (c as u8)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Color> + '_ {
        Color::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

/// Whether a color raises alerts, counts as recovery, or neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    Ok,
    Alert,
    Undecided,
}

/// Configured alert/OK color sets.
#[derive(Debug, Clone, Copy)]
pub struct ColorPolicy {
    pub alert: ColorSet,
    pub ok: ColorSet,
}

impl Default for ColorPolicy {
    fn default() -> Self {
        Self {
            alert: ColorSet::of(&[Color::Red, Color::Yellow, Color::Purple]),
            ok: ColorSet::of(&[Color::Green]),
        }
    }
}

impl ColorPolicy {
    pub fn decide(&self, color: Color) -> AlertState {
        if self.alert.contains(color) {
            AlertState::Alert
        } else if self.ok.contains(color) {
            AlertState::Ok
        } else {
            AlertState::Undecided
        }
    }
}

#[cfg(test)]
#[path = "color_tests.rs"]
mod tests;
