//! `NetworkProfile` is the input schema a caller pushes into a running
//! [`crate::router::Router`]; [`EffectiveProfile`] is what a
//! [`crate::shaper::Shaper`] actually samples from. The two are kept
//! separate so the parser normalises the "maybe present, maybe split" input
//! shapes exactly once, and the shaper's hot path never re-derives them.

use serde::{Deserialize, Serialize};

/// Which leg of the link a value applies to. `Up` is client -> network
/// ("outbound"); `Down` is network -> client ("inbound").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// A value that may be symmetric across both directions or explicitly
/// split. Mirrors the source's `PercentileValue{value?, up?, down?}`
/// data-class, re-expressed here as a proper sum type instead of three
/// independently-optional fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SplitValue<T> {
    Symmetric(T),
    Split { up: T, down: T },
}

impl<T: Copy> SplitValue<T> {
    fn up(&self) -> T {
        match self {
            SplitValue::Symmetric(v) => *v,
            SplitValue::Split { up, .. } => *up,
        }
    }
    fn down(&self) -> T {
        match self {
            SplitValue::Symmetric(v) => *v,
            SplitValue::Split { down, .. } => *down,
        }
    }
}

/// One entry of a percentile delay table, e.g. `p50 = 80ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PercentileEntry {
    pub percentile: f64,
    pub value: SplitValue<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelayConfig {
    Fixed(SplitValue<u32>),
    Percentiles(Vec<PercentileEntry>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LossConfig {
    Symmetric(f64),
    Split { up: f64, down: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BandwidthConfig {
    Symmetric(u32),
    Split { up: u32, down: u32 },
}

/// Immutable bundle of delay/loss/bandwidth sub-configs pushed into the
/// router as a whole. Replaced atomically: no packet ever observes a
/// partial update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub delay: Option<DelayConfig>,
    pub loss: Option<LossConfig>,
    pub bandwidth: Option<BandwidthConfig>,
}

/// The shape a [`crate::shaper::Shaper`] samples delay from, normalised
/// once when a profile is applied.
#[derive(Debug, Clone)]
pub enum DelayModel {
    Fixed(u32),
    /// Sorted ascending by percentile, e.g. `[(25.0, 60), (50.0, 80), ...]`.
    Percentiles(Vec<(f64, u32)>),
}

impl DelayModel {
    /// Maps a uniform sample `v in [0, 1)` through the configured delay
    /// distribution by linear interpolation between bracketing
    /// percentiles, extrapolating linearly past either end of the table.
    pub fn sample(&self, v: f64) -> u32 {
        match self {
            DelayModel::Fixed(ms) => *ms,
            DelayModel::Percentiles(table) => sample_percentile_table(table, v),
        }
    }
}

fn sample_percentile_table(table: &[(f64, u32)], v: f64) -> u32 {
    debug_assert!(!table.is_empty());
    let x = v * 100.0;
    let (p_min, y_min) = table[0];
    if x <= p_min {
        // Below the minimum configured percentile: scale linearly from the
        // origin through (p_min, y_min).
        if p_min <= 0.0 {
            return y_min;
        }
        return (y_min as f64 * x / p_min) as u32;
    }
    let (p_max, y_max) = table[table.len() - 1];
    if x >= p_max {
        if table.len() < 2 {
            return y_max;
        }
        let (p_prev, y_prev) = table[table.len() - 2];
        let slope = (y_max as f64 - y_prev as f64) / (p_max - p_prev);
        return (y_max as f64 + slope * (x - p_max)).max(0.0) as u32;
    }
    for window in table.windows(2) {
        let (p_lo, y_lo) = window[0];
        let (p_hi, y_hi) = window[1];
        if x >= p_lo && x <= p_hi {
            let y = y_lo as f64 + (x - p_lo) / (p_hi - p_lo) * (y_hi as f64 - y_lo as f64);
            return y as u32;
        }
    }
    y_max
}

/// The shaper-facing, already-normalised profile. A fresh value is computed
/// once per [`crate::shaper::Shaper::set_profile`] call; sampling never
/// re-derives it.
#[derive(Debug, Clone)]
pub struct EffectiveProfile {
    pub delay_up: DelayModel,
    pub delay_down: DelayModel,
    /// Percentages in `[0, 100]`.
    pub loss_up_pct: f64,
    pub loss_down_pct: f64,
    pub bandwidth_up_kbps: Option<u32>,
    pub bandwidth_down_kbps: Option<u32>,
}

impl Default for EffectiveProfile {
    fn default() -> Self {
        Self {
            delay_up: DelayModel::Fixed(0),
            delay_down: DelayModel::Fixed(0),
            loss_up_pct: 0.0,
            loss_down_pct: 0.0,
            bandwidth_up_kbps: None,
            bandwidth_down_kbps: None,
        }
    }
}

impl EffectiveProfile {
    pub fn delay_model(&self, dir: Direction) -> &DelayModel {
        match dir {
            Direction::Up => &self.delay_up,
            Direction::Down => &self.delay_down,
        }
    }

    pub fn loss_pct(&self, dir: Direction) -> f64 {
        match dir {
            Direction::Up => self.loss_up_pct,
            Direction::Down => self.loss_down_pct,
        }
    }

    pub fn bandwidth_kbps(&self, dir: Direction) -> Option<u32> {
        match dir {
            Direction::Up => self.bandwidth_up_kbps,
            Direction::Down => self.bandwidth_down_kbps,
        }
    }
}

impl From<&NetworkProfile> for EffectiveProfile {
    fn from(profile: &NetworkProfile) -> Self {
        let (delay_up, delay_down) = match &profile.delay {
            None => (DelayModel::Fixed(0), DelayModel::Fixed(0)),
            Some(DelayConfig::Fixed(SplitValue::Symmetric(ms))) => {
                // The source splits a single delay value 60/40 up/down with
                // no documented justification. Preserved for compatibility.
                let up = (*ms as f64 * 0.6) as u32;
                let down = (*ms as f64 * 0.4) as u32;
                (DelayModel::Fixed(up), DelayModel::Fixed(down))
            }
            Some(DelayConfig::Fixed(SplitValue::Split { up, down })) => {
                (DelayModel::Fixed(*up), DelayModel::Fixed(*down))
            }
            Some(DelayConfig::Percentiles(entries)) => {
                let mut up: Vec<(f64, u32)> =
                    entries.iter().map(|e| (e.percentile, e.value.up())).collect();
                let mut down: Vec<(f64, u32)> = entries
                    .iter()
                    .map(|e| (e.percentile, e.value.down()))
                    .collect();
                up.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
                down.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
                (DelayModel::Percentiles(up), DelayModel::Percentiles(down))
            }
        };
        let (loss_up_pct, loss_down_pct) = match &profile.loss {
            None => (0.0, 0.0),
            // Loss-rate doubling guard: a single symmetric
            // rate L is split L/2 to each direction so the end-to-end
            // observed loss is ~L, not ~2L. An explicit up/down map is
            // used verbatim.
            Some(LossConfig::Symmetric(l)) => (l / 2.0, l / 2.0),
            Some(LossConfig::Split { up, down }) => (*up, *down),
        };
        let (bandwidth_up_kbps, bandwidth_down_kbps) = match &profile.bandwidth {
            None => (None, None),
            Some(BandwidthConfig::Symmetric(kbps)) => (Some(*kbps), Some(*kbps)),
            Some(BandwidthConfig::Split { up, down }) => (Some(*up), Some(*down)),
        };
        Self {
            delay_up,
            delay_down,
            loss_up_pct,
            loss_down_pct,
            bandwidth_up_kbps,
            bandwidth_down_kbps,
        }
    }
}
