//! Per-user mood vector and the bounded step used to move it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lowest value an axis can hold.
pub const AXIS_MIN: u8 = 0;
/// Highest value an axis can hold.
pub const AXIS_MAX: u8 = 100;
/// Value every axis starts at.
pub const AXIS_DEFAULT: u8 = 50;

/// One of the six tracked mood dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Love,
    Joy,
    Surprise,
    Anger,
    Sadness,
    Fear,
}

impl Axis {
    pub const ALL: [Axis; 6] = [
        Axis::Love,
        Axis::Joy,
        Axis::Surprise,
        Axis::Anger,
        Axis::Sadness,
        Axis::Fear,
    ];

    /// Column name in the `emotions` table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::Love => "love",
            Axis::Joy => "joy",
            Axis::Surprise => "surprise",
            Axis::Anger => "anger",
            Axis::Sadness => "sadness",
            Axis::Fear => "fear",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mood of one user. Every axis is within `[AXIS_MIN, AXIS_MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmotionState {
    pub love: u8,
    pub joy: u8,
    pub surprise: u8,
    pub anger: u8,
    pub sadness: u8,
    pub fear: u8,
}

impl Default for EmotionState {
    fn default() -> Self {
        Self {
            love: AXIS_DEFAULT,
            joy: AXIS_DEFAULT,
            surprise: AXIS_DEFAULT,
            anger: AXIS_DEFAULT,
            sadness: AXIS_DEFAULT,
            fear: AXIS_DEFAULT,
        }
    }
}

impl EmotionState {
    /// Build a state, clamping each value into range.
    pub fn new(love: i64, joy: i64, surprise: i64, anger: i64, sadness: i64, fear: i64) -> Self {
        Self {
            love: clamp_axis(love),
            joy: clamp_axis(joy),
            surprise: clamp_axis(surprise),
            anger: clamp_axis(anger),
            sadness: clamp_axis(sadness),
            fear: clamp_axis(fear),
        }
    }

    pub fn axis(&self, axis: Axis) -> u8 {
        match axis {
            Axis::Love => self.love,
            Axis::Joy => self.joy,
            Axis::Surprise => self.surprise,
            Axis::Anger => self.anger,
            Axis::Sadness => self.sadness,
            Axis::Fear => self.fear,
        }
    }

    fn axis_mut(&mut self, axis: Axis) -> &mut u8 {
        match axis {
            Axis::Love => &mut self.love,
            Axis::Joy => &mut self.joy,
            Axis::Surprise => &mut self.surprise,
            Axis::Anger => &mut self.anger,
            Axis::Sadness => &mut self.sadness,
            Axis::Fear => &mut self.fear,
        }
    }

    /// Move each targeted axis toward its target by at most `delta`.
    ///
    /// Never overshoots a target and never leaves the axis range. Axes without a
    /// target are untouched.
    pub fn stepped_toward(&self, targets: &EmotionTargets, delta: u8) -> Self {
        let mut next = *self;
        for (axis, target) in targets.iter() {
            let current = next.axis(axis);
            let target = target.min(AXIS_MAX);
            let value = if target > current {
                current.saturating_add(delta).min(target)
            } else {
                current.saturating_sub(delta).max(target)
            };
            *next.axis_mut(axis) = value;
        }
        next
    }
}

fn clamp_axis(value: i64) -> u8 {
    value.clamp(AXIS_MIN as i64, AXIS_MAX as i64) as u8
}

/// Partial mapping of axis to target value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmotionTargets {
    targets: [Option<u8>; 6],
}

impl EmotionTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target for one axis. Values above `AXIS_MAX` are clamped.
    pub fn set(mut self, axis: Axis, target: u8) -> Self {
        self.targets[index(axis)] = Some(target.min(AXIS_MAX));
        self
    }

    pub fn love(self, target: u8) -> Self {
        self.set(Axis::Love, target)
    }

    pub fn joy(self, target: u8) -> Self {
        self.set(Axis::Joy, target)
    }

    pub fn surprise(self, target: u8) -> Self {
        self.set(Axis::Surprise, target)
    }

    pub fn anger(self, target: u8) -> Self {
        self.set(Axis::Anger, target)
    }

    pub fn sadness(self, target: u8) -> Self {
        self.set(Axis::Sadness, target)
    }

    pub fn fear(self, target: u8) -> Self {
        self.set(Axis::Fear, target)
    }

    pub fn get(&self, axis: Axis) -> Option<u8> {
        self.targets[index(axis)]
    }

    pub fn is_empty(&self) -> bool {
        self.targets.iter().all(Option::is_none)
    }

    /// Targeted axes with their target values.
    pub fn iter(&self) -> impl Iterator<Item = (Axis, u8)> + '_ {
        Axis::ALL
            .into_iter()
            .filter_map(|axis| self.get(axis).map(|target| (axis, target)))
    }
}

fn index(axis: Axis) -> usize {
    match axis {
        Axis::Love => 0,
        Axis::Joy => 1,
        Axis::Surprise => 2,
        Axis::Anger => 3,
        Axis::Sadness => 4,
        Axis::Fear => 5,
    }
}
