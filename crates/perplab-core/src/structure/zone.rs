//! Supply/demand zones anchored to confirmed swing pivots.

use super::{Detector, FieldClass, StructureKind, SwingState};
use crate::bar::Bar;
use crate::error::{PerpLabError, Result};
use crate::params::{ParamReader, Params};

pub(super) const FIELDS: &[&str] = &[
    "state",
    "upper",
    "lower",
    "age",
    "touch_count",
    "instance_id",
    "side",
    "version",
];

/// Zone lifecycle states exposed through `get_field("state")`.
pub const STATE_NONE: f64 = 0.0;
pub const STATE_ACTIVE: f64 = 1.0;
pub const STATE_BROKEN: f64 = 2.0;

/// Side values: +1 demand (under price), -1 supply (over price).
pub const SIDE_DEMAND: f64 = 1.0;
pub const SIDE_SUPPLY: f64 = -1.0;

/// Zone band width policy. Fallbacks are deliberate configuration, never
/// implicit: `atr` mode requires both the multiplier and the ATR column.
enum WidthMode {
    /// `width_atr_mult × ATR` sampled at the confirmation bar.
    Atr { mult: f64, atr_key: String },
    /// Body of the confirmation bar.
    Body,
}

/// Tracks the most recent supply or demand zone from its swing dependency.
///
/// A confirmed swing high emits a supply zone `[high - width, high]`; a
/// confirmed swing low emits a demand zone `[low, low + width]`. The band
/// goes ACTIVE on creation, and BROKEN when a close crosses through it.
/// Price entering the band without closing through counts a touch. Each new
/// zone takes a monotonically increasing `instance_id`.
pub struct ZoneDetector {
    width: WidthMode,
    state: f64,
    upper: f64,
    lower: f64,
    age: u64,
    touch_count: u64,
    instance_id: u64,
    side: f64,
    seen_swing_version: u64,
    version: u64,
}

impl ZoneDetector {
    pub fn new(key: &str, params: &Params) -> Result<Self> {
        let r = ParamReader::new(key, params);
        r.check_known(&["width_mode", "width_atr_mult", "atr_key"])?;

        let width = match r.require_str("width_mode")? {
            "atr" => WidthMode::Atr {
                mult: r.require_f64("width_atr_mult")?,
                atr_key: r.require_str("atr_key")?.to_string(),
            },
            "body" => WidthMode::Body,
            other => {
                return Err(PerpLabError::Config(format!(
                    "{key}: unknown width_mode '{other}' (expected atr or body)"
                )))
            }
        };
        if let WidthMode::Atr { mult, .. } = &width {
            if *mult <= 0.0 {
                return Err(PerpLabError::Config(format!(
                    "{key}: width_atr_mult must be positive"
                )));
            }
        }

        Ok(Self {
            width,
            state: STATE_NONE,
            upper: f64::NAN,
            lower: f64::NAN,
            age: 0,
            touch_count: 0,
            instance_id: 0,
            side: 0.0,
            seen_swing_version: 0,
            version: 0,
        })
    }

    fn band_width(&self, bar: &Bar, aux: f64) -> Option<f64> {
        match &self.width {
            WidthMode::Atr { mult, .. } => {
                if aux.is_finite() {
                    Some(mult * aux)
                } else {
                    // ATR not warm yet: no zone is emitted. An explicit gap,
                    // not a downgraded width.
                    None
                }
            }
            WidthMode::Body => {
                let body = bar.body();
                if body > 0.0 {
                    Some(body)
                } else {
                    Some(bar.range().max(f64::MIN_POSITIVE))
                }
            }
        }
    }

    fn open_zone(&mut self, side: f64, anchor: f64, width: f64) {
        self.side = side;
        if side == SIDE_SUPPLY {
            self.upper = anchor;
            self.lower = anchor - width;
        } else {
            self.lower = anchor;
            self.upper = anchor + width;
        }
        self.state = STATE_ACTIVE;
        self.age = 0;
        self.touch_count = 0;
        self.instance_id += 1;
        self.version += 1;
    }
}

impl Detector for ZoneDetector {
    fn kind(&self) -> StructureKind {
        StructureKind::Zone
    }

    fn warmup_bars(&self) -> usize {
        0
    }

    fn aux_column(&self) -> Option<&str> {
        match &self.width {
            WidthMode::Atr { atr_key, .. } => Some(atr_key),
            WidthMode::Body => None,
        }
    }

    fn update(&mut self, _bar_idx: usize, bar: &Bar, dep: Option<&SwingState>, aux: f64) {
        // Age and lifecycle of the current zone first.
        if self.state == STATE_ACTIVE {
            self.age += 1;

            let closed_through = if self.side == SIDE_DEMAND {
                bar.close < self.lower
            } else {
                bar.close > self.upper
            };
            if closed_through {
                self.state = STATE_BROKEN;
                self.version += 1;
            } else if bar.low <= self.upper && bar.high >= self.lower {
                self.touch_count += 1;
                self.version += 1;
            }
        }

        // A fresh pivot replaces the zone, broken or not.
        let dep = match dep {
            Some(d) => d,
            None => return,
        };
        if dep.version == self.seen_swing_version {
            return;
        }
        self.seen_swing_version = dep.version;

        let (side, anchor) = match dep.last_pivot_dir {
            1 if dep.high_level.is_finite() => (SIDE_SUPPLY, dep.high_level),
            -1 if dep.low_level.is_finite() => (SIDE_DEMAND, dep.low_level),
            _ => return,
        };

        if let Some(width) = self.band_width(bar, aux) {
            self.open_zone(side, anchor, width);
        }
    }

    fn get_field(&self, name: &str) -> Option<f64> {
        let v = match name {
            "state" => self.state,
            "upper" => self.upper,
            "lower" => self.lower,
            "age" => self.age as f64,
            "touch_count" => self.touch_count as f64,
            "instance_id" => self.instance_id as f64,
            "side" => self.side,
            "version" => self.version as f64,
            _ => return None,
        };
        Some(v)
    }

    fn fields(&self) -> &'static [&'static str] {
        FIELDS
    }

    fn field_class(&self, name: &str) -> FieldClass {
        match name {
            "upper" | "lower" => FieldClass::Numeric,
            _ => FieldClass::Discrete,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;

    fn body_params() -> Params {
        let mut p = Params::new();
        p.insert("width_mode".into(), ParamValue::from("body"));
        p
    }

    fn atr_params(mult: f64) -> Params {
        let mut p = Params::new();
        p.insert("width_mode".into(), ParamValue::from("atr"));
        p.insert("width_atr_mult".into(), ParamValue::from(mult));
        p.insert("atr_key".into(), ParamValue::from("atr_14"));
        p
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(0, 3_600_000, open, high, low, close, 1_000.0)
    }

    fn low_pivot(level: f64, version: u64) -> SwingState {
        SwingState {
            high_level: level + 20.0,
            low_level: level,
            prev_high_level: f64::NAN,
            prev_low_level: f64::NAN,
            high_idx: Some(0),
            low_idx: Some(1),
            last_pivot_dir: -1,
            version,
        }
    }

    #[test]
    fn atr_mode_requires_mult_and_key() {
        let mut p = Params::new();
        p.insert("width_mode".into(), ParamValue::from("atr"));
        assert!(ZoneDetector::new("z", &p).is_err());
        assert!(ZoneDetector::new("z", &atr_params(1.5)).is_ok());
    }

    #[test]
    fn demand_zone_from_low_pivot_with_atr_width() {
        let mut det = ZoneDetector::new("z", &atr_params(2.0)).unwrap();
        det.update(0, &bar(101.0, 102.0, 100.0, 101.5), Some(&low_pivot(100.0, 1)), 1.5);
        assert_eq!(det.get_field("state"), Some(STATE_ACTIVE));
        assert_eq!(det.get_field("side"), Some(SIDE_DEMAND));
        assert_eq!(det.get_field("lower"), Some(100.0));
        assert_eq!(det.get_field("upper"), Some(103.0));
        assert_eq!(det.get_field("instance_id"), Some(1.0));
    }

    #[test]
    fn atr_not_warm_emits_no_zone() {
        let mut det = ZoneDetector::new("z", &atr_params(2.0)).unwrap();
        det.update(0, &bar(101.0, 102.0, 100.0, 101.5), Some(&low_pivot(100.0, 1)), f64::NAN);
        assert_eq!(det.get_field("state"), Some(STATE_NONE));
    }

    #[test]
    fn close_through_breaks_demand_zone() {
        let mut det = ZoneDetector::new("z", &atr_params(2.0)).unwrap();
        det.update(0, &bar(101.0, 102.0, 100.5, 101.5), Some(&low_pivot(100.0, 1)), 1.0);
        // Zone [100, 102]; close below 100 breaks it.
        det.update(1, &bar(101.0, 101.0, 99.0, 99.5), None, 1.0);
        assert_eq!(det.get_field("state"), Some(STATE_BROKEN));
    }

    #[test]
    fn touch_without_close_through_counts() {
        let mut det = ZoneDetector::new("z", &atr_params(2.0)).unwrap();
        det.update(0, &bar(104.0, 105.0, 103.0, 104.0), Some(&low_pivot(100.0, 1)), 1.0);
        // Zone [100, 102]; bar dips into the band but closes above it.
        det.update(1, &bar(104.0, 104.5, 101.0, 103.0), None, 1.0);
        assert_eq!(det.get_field("state"), Some(STATE_ACTIVE));
        assert_eq!(det.get_field("touch_count"), Some(1.0));
    }

    #[test]
    fn new_pivot_replaces_zone_and_bumps_instance_id() {
        let mut det = ZoneDetector::new("z", &body_params()).unwrap();
        det.update(0, &bar(101.0, 102.0, 100.0, 101.5), Some(&low_pivot(100.0, 1)), f64::NAN);
        assert_eq!(det.get_field("instance_id"), Some(1.0));
        det.update(1, &bar(103.0, 104.0, 102.0, 103.5), Some(&low_pivot(102.0, 2)), f64::NAN);
        assert_eq!(det.get_field("instance_id"), Some(2.0));
        assert_eq!(det.get_field("lower"), Some(102.0));
        assert_eq!(det.get_field("age"), Some(0.0));
    }

    #[test]
    fn age_increments_per_bar() {
        let mut det = ZoneDetector::new("z", &body_params()).unwrap();
        det.update(0, &bar(104.0, 105.0, 103.0, 104.5), Some(&low_pivot(100.0, 1)), f64::NAN);
        det.update(1, &bar(104.0, 105.0, 103.0, 104.5), None, f64::NAN);
        det.update(2, &bar(104.0, 105.0, 103.0, 104.5), None, f64::NAN);
        assert_eq!(det.get_field("age"), Some(2.0));
    }
}
