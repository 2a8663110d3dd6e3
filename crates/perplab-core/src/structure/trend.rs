//! Trend classification from swing-pivot sequences.

use super::{Detector, FieldClass, StructureKind, SwingState};
use crate::bar::Bar;
use crate::error::Result;
use crate::params::{ParamReader, Params};

pub(super) const FIELDS: &[&str] = &["direction", "strength", "bars_in_trend", "version"];

/// Direction values exposed through `get_field("direction")`.
pub const DIR_UP: f64 = 1.0;
pub const DIR_DOWN: f64 = -1.0;
pub const DIR_NEUTRAL: f64 = 0.0;

/// Classifies direction from the last two same-kind pivots of its swing
/// dependency: higher high + higher low is up, lower low + lower high is
/// down, anything else neutral. `strength` counts consecutive confirming
/// classifications; `bars_in_trend` counts bars since the direction last
/// changed.
pub struct TrendDetector {
    direction: i8,
    strength: u32,
    bars_in_trend: u64,
    seen_swing_version: u64,
    version: u64,
}

impl TrendDetector {
    pub fn new(key: &str, params: &Params) -> Result<Self> {
        // Trend has no parameters of its own; reject stray ones loudly.
        ParamReader::new(key, params).check_known(&[])?;
        Ok(Self {
            direction: 0,
            strength: 0,
            bars_in_trend: 0,
            seen_swing_version: 0,
            version: 0,
        })
    }

    fn classify(dep: &SwingState) -> i8 {
        if !dep.has_pair() {
            return 0;
        }
        let hh = dep.prev_high_level.is_finite() && dep.high_level > dep.prev_high_level;
        let hl = dep.prev_low_level.is_finite() && dep.low_level > dep.prev_low_level;
        let ll = dep.prev_low_level.is_finite() && dep.low_level < dep.prev_low_level;
        let lh = dep.prev_high_level.is_finite() && dep.high_level < dep.prev_high_level;

        if hh && hl {
            1
        } else if ll && lh {
            -1
        } else {
            0
        }
    }
}

impl Detector for TrendDetector {
    fn kind(&self) -> StructureKind {
        StructureKind::Trend
    }

    fn warmup_bars(&self) -> usize {
        // Needs two pivot pairs from its dependency; pivots arrive on the
        // dependency's schedule, so the static lower bound is zero.
        0
    }

    fn update(&mut self, _bar_idx: usize, _bar: &Bar, dep: Option<&SwingState>, _aux: f64) {
        if self.direction != 0 {
            self.bars_in_trend += 1;
        }

        let dep = match dep {
            Some(d) => d,
            None => return,
        };
        if dep.version == self.seen_swing_version {
            return;
        }
        self.seen_swing_version = dep.version;

        let new_dir = Self::classify(dep);
        if new_dir == self.direction {
            if new_dir != 0 {
                self.strength += 1;
                self.version += 1;
            }
            return;
        }

        self.direction = new_dir;
        self.strength = if new_dir == 0 { 0 } else { 1 };
        self.bars_in_trend = 0;
        self.version += 1;
    }

    fn get_field(&self, name: &str) -> Option<f64> {
        let v = match name {
            "direction" => self.direction as f64,
            "strength" => self.strength as f64,
            "bars_in_trend" => self.bars_in_trend as f64,
            "version" => self.version as f64,
            _ => return None,
        };
        Some(v)
    }

    fn fields(&self) -> &'static [&'static str] {
        FIELDS
    }

    fn field_class(&self, _name: &str) -> FieldClass {
        // Every trend output is discrete.
        FieldClass::Discrete
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar() -> Bar {
        Bar::new(0, 3_600_000, 100.0, 101.0, 99.0, 100.0, 1_000.0)
    }

    fn swing(high: f64, prev_high: f64, low: f64, prev_low: f64, version: u64) -> SwingState {
        SwingState {
            high_level: high,
            low_level: low,
            prev_high_level: prev_high,
            prev_low_level: prev_low,
            high_idx: Some(0),
            low_idx: Some(0),
            last_pivot_dir: 1,
            version,
        }
    }

    #[test]
    fn hh_hl_is_up() {
        let mut det = TrendDetector::new("t", &Params::new()).unwrap();
        let dep = swing(110.0, 105.0, 100.0, 95.0, 1);
        det.update(0, &bar(), Some(&dep), f64::NAN);
        assert_eq!(det.get_field("direction"), Some(DIR_UP));
        assert_eq!(det.get_field("strength"), Some(1.0));
    }

    #[test]
    fn ll_lh_is_down() {
        let mut det = TrendDetector::new("t", &Params::new()).unwrap();
        let dep = swing(105.0, 110.0, 95.0, 100.0, 1);
        det.update(0, &bar(), Some(&dep), f64::NAN);
        assert_eq!(det.get_field("direction"), Some(DIR_DOWN));
    }

    #[test]
    fn mixed_is_neutral() {
        let mut det = TrendDetector::new("t", &Params::new()).unwrap();
        // Higher high but lower low
        let dep = swing(110.0, 105.0, 95.0, 100.0, 1);
        det.update(0, &bar(), Some(&dep), f64::NAN);
        assert_eq!(det.get_field("direction"), Some(DIR_NEUTRAL));
    }

    #[test]
    fn strength_accumulates_and_resets() {
        let mut det = TrendDetector::new("t", &Params::new()).unwrap();
        det.update(0, &bar(), Some(&swing(110.0, 105.0, 100.0, 95.0, 1)), f64::NAN);
        det.update(1, &bar(), Some(&swing(115.0, 110.0, 104.0, 100.0, 2)), f64::NAN);
        assert_eq!(det.get_field("strength"), Some(2.0));

        // Reversal resets both strength and bars_in_trend
        det.update(2, &bar(), Some(&swing(108.0, 115.0, 98.0, 104.0, 3)), f64::NAN);
        assert_eq!(det.get_field("direction"), Some(DIR_DOWN));
        assert_eq!(det.get_field("strength"), Some(1.0));
        assert_eq!(det.get_field("bars_in_trend"), Some(0.0));
    }

    #[test]
    fn bars_in_trend_counts_between_pivots() {
        let mut det = TrendDetector::new("t", &Params::new()).unwrap();
        let dep = swing(110.0, 105.0, 100.0, 95.0, 1);
        det.update(0, &bar(), Some(&dep), f64::NAN);
        // Same swing version: nothing reclassifies, the counter ticks.
        det.update(1, &bar(), Some(&dep), f64::NAN);
        det.update(2, &bar(), Some(&dep), f64::NAN);
        assert_eq!(det.get_field("bars_in_trend"), Some(2.0));
    }

    #[test]
    fn unknown_params_rejected() {
        let mut p = Params::new();
        p.insert("period".into(), crate::params::ParamValue::from(5_i64));
        assert!(TrendDetector::new("t", &p).is_err());
    }
}
