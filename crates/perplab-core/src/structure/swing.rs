//! Fractal swing-pivot detector.

use super::{Detector, FieldClass, StructureKind, SwingState};
use crate::bar::Bar;
use crate::error::{PerpLabError, Result};
use crate::params::{ParamReader, Params};
use std::collections::VecDeque;

pub(super) const FIELDS: &[&str] = &[
    "high_level",
    "low_level",
    "prev_high_level",
    "prev_low_level",
    "high_idx",
    "low_idx",
    "last_pivot_dir",
    "version",
];

/// Confirms local extrema using `left`/`right` surrounding bars.
///
/// A pivot high at bar `p` is confirmed once `right` further bars have
/// closed and `high[p]` exceeds the highs of the `left` bars before and the
/// `right` bars after it. Comparison is strict by default; `strict: false`
/// relaxes it to allow equal extremes on the flanks.
///
/// Confirmed highs and lows alternate. A same-kind pivot replaces the
/// current one only when more extreme. With `zigzag_atr_mult` set, an
/// opposite-kind pivot additionally requires the reversal from the previous
/// pivot level to exceed `mult × ATR` (sampled from the declared `atr_key`
/// column at the confirmation bar).
pub struct SwingDetector {
    left: usize,
    right: usize,
    strict: bool,
    zigzag_mult: Option<f64>,
    atr_key: Option<String>,
    // (bar_idx, high, low) for the last left+right+1 bars
    window: VecDeque<(usize, f64, f64)>,
    state: SwingState,
}

impl SwingDetector {
    pub fn new(key: &str, params: &Params) -> Result<Self> {
        let r = ParamReader::new(key, params);
        r.check_known(&["left", "right", "strict", "zigzag_atr_mult", "atr_key"])?;

        let left = r.require_usize("left")?;
        let right = r.require_usize("right")?;
        if left == 0 || right == 0 {
            return Err(PerpLabError::Config(format!(
                "{key}: swing left/right windows must be at least 1"
            )));
        }

        let strict = r.opt_bool("strict", true)?;
        let zigzag_mult = match params.get("zigzag_atr_mult") {
            None => None,
            Some(v) => Some(v.as_f64().ok_or_else(|| {
                PerpLabError::Config(format!("{key}: zigzag_atr_mult must be a number"))
            })?),
        };
        let atr_key = match params.get("atr_key") {
            None => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| {
                        PerpLabError::Config(format!("{key}: atr_key must be a string"))
                    })?
                    .to_string(),
            ),
        };
        if zigzag_mult.is_some() && atr_key.is_none() {
            return Err(PerpLabError::Config(format!(
                "{key}: zigzag_atr_mult requires atr_key naming a declared ATR feature"
            )));
        }

        Ok(Self {
            left,
            right,
            strict,
            zigzag_mult,
            atr_key,
            window: VecDeque::with_capacity(left + right + 2),
            state: SwingState::empty(),
        })
    }

    fn capacity(&self) -> usize {
        self.left + self.right + 1
    }

    fn beats(&self, candidate: f64, other: f64, looking_for_high: bool) -> bool {
        if looking_for_high {
            if self.strict {
                candidate > other
            } else {
                candidate >= other
            }
        } else if self.strict {
            candidate < other
        } else {
            candidate <= other
        }
    }

    fn confirm_high(&mut self, idx: usize, level: f64, atr: f64) {
        if self.state.last_pivot_dir == 1 {
            // Duplicate high: replace only when more extreme.
            if level > self.state.high_level {
                self.state.high_level = level;
                self.state.high_idx = Some(idx);
                self.state.version += 1;
            }
            return;
        }

        if let Some(mult) = self.zigzag_mult {
            if self.state.low_level.is_finite() {
                let reversal = level - self.state.low_level;
                if !(atr.is_finite() && reversal > mult * atr) {
                    return;
                }
            }
        }

        self.state.prev_high_level = self.state.high_level;
        self.state.high_level = level;
        self.state.high_idx = Some(idx);
        self.state.last_pivot_dir = 1;
        self.state.version += 1;
    }

    fn confirm_low(&mut self, idx: usize, level: f64, atr: f64) {
        if self.state.last_pivot_dir == -1 {
            if level < self.state.low_level {
                self.state.low_level = level;
                self.state.low_idx = Some(idx);
                self.state.version += 1;
            }
            return;
        }

        if let Some(mult) = self.zigzag_mult {
            if self.state.high_level.is_finite() {
                let reversal = self.state.high_level - level;
                if !(atr.is_finite() && reversal > mult * atr) {
                    return;
                }
            }
        }

        self.state.prev_low_level = self.state.low_level;
        self.state.low_level = level;
        self.state.low_idx = Some(idx);
        self.state.last_pivot_dir = -1;
        self.state.version += 1;
    }
}

impl Detector for SwingDetector {
    fn kind(&self) -> StructureKind {
        StructureKind::Swing
    }

    fn warmup_bars(&self) -> usize {
        self.left + self.right + 1
    }

    fn aux_column(&self) -> Option<&str> {
        self.atr_key.as_deref()
    }

    fn update(&mut self, bar_idx: usize, bar: &Bar, _dep: Option<&SwingState>, aux: f64) {
        self.window.push_back((bar_idx, bar.high, bar.low));
        if self.window.len() > self.capacity() {
            self.window.pop_front();
        }
        if self.window.len() < self.capacity() {
            return;
        }

        let center = self.window[self.left];
        let (center_idx, center_high, center_low) = center;

        let mut is_high = true;
        let mut is_low = true;
        for (pos, &(_, high, low)) in self.window.iter().enumerate() {
            if pos == self.left {
                continue;
            }
            if !self.beats(center_high, high, true) {
                is_high = false;
            }
            if !self.beats(center_low, low, false) {
                is_low = false;
            }
            if !is_high && !is_low {
                break;
            }
        }

        if is_high {
            self.confirm_high(center_idx, center_high, aux);
        }
        if is_low {
            self.confirm_low(center_idx, center_low, aux);
        }
    }

    fn get_field(&self, name: &str) -> Option<f64> {
        let v = match name {
            "high_level" => self.state.high_level,
            "low_level" => self.state.low_level,
            "prev_high_level" => self.state.prev_high_level,
            "prev_low_level" => self.state.prev_low_level,
            "high_idx" => self.state.high_idx.map(|i| i as f64).unwrap_or(f64::NAN),
            "low_idx" => self.state.low_idx.map(|i| i as f64).unwrap_or(f64::NAN),
            "last_pivot_dir" => self.state.last_pivot_dir as f64,
            "version" => self.state.version as f64,
            _ => return None,
        };
        Some(v)
    }

    fn fields(&self) -> &'static [&'static str] {
        FIELDS
    }

    fn field_class(&self, name: &str) -> FieldClass {
        match name {
            "last_pivot_dir" | "version" | "high_idx" | "low_idx" => FieldClass::Discrete,
            _ => FieldClass::Numeric,
        }
    }

    fn version(&self) -> u64 {
        self.state.version
    }

    fn swing_state(&self) -> Option<SwingState> {
        Some(self.state)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::params::ParamValue;

    pub fn swing_params(left: usize, right: usize) -> Params {
        let mut p = Params::new();
        p.insert("left".into(), ParamValue::from(left));
        p.insert("right".into(), ParamValue::from(right));
        p
    }

    /// Drive a detector over synthetic bars defined by (high, low) pairs.
    pub fn drive(det: &mut dyn Detector, hl: &[(f64, f64)]) {
        for (i, &(high, low)) in hl.iter().enumerate() {
            let ts = 1_704_067_200_000 + i as i64 * 3_600_000;
            let mid = (high + low) / 2.0;
            let bar = Bar::new(ts, ts + 3_600_000, mid, high, low, mid, 1_000.0);
            det.update(i, &bar, None, f64::NAN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{drive, swing_params};
    use super::*;

    #[test]
    fn confirms_fractal_high_after_right_bars() {
        let mut det = SwingDetector::new("s", &swing_params(2, 2)).unwrap();
        // Peak at index 2 (high 110), confirmed once bars 3 and 4 close.
        let hl = [
            (101.0, 99.0),
            (103.0, 100.0),
            (110.0, 104.0),
            (105.0, 101.0),
            (102.0, 98.0),
        ];
        drive(&mut det, &hl);
        assert_eq!(det.get_field("high_level"), Some(110.0));
        assert_eq!(det.get_field("high_idx"), Some(2.0));
        assert_eq!(det.get_field("last_pivot_dir"), Some(1.0));
        assert!(det.version() >= 1);
    }

    #[test]
    fn no_pivot_before_window_fills() {
        let mut det = SwingDetector::new("s", &swing_params(2, 2)).unwrap();
        let hl = [(101.0, 99.0), (103.0, 100.0), (110.0, 104.0), (105.0, 101.0)];
        drive(&mut det, &hl);
        assert!(det.get_field("high_level").unwrap().is_nan());
        assert_eq!(det.version(), 0);
    }

    #[test]
    fn strict_rejects_equal_flank_high() {
        let mut det = SwingDetector::new("s", &swing_params(1, 1)).unwrap();
        // Equal highs at indices 1 and 2: strict comparison refuses both.
        let hl = [(100.0, 98.0), (110.0, 100.0), (110.0, 100.0), (100.0, 96.0)];
        drive(&mut det, &hl);
        assert!(det.get_field("high_level").unwrap().is_nan());
    }

    #[test]
    fn non_strict_accepts_equal_flank_high() {
        let mut p = swing_params(1, 1);
        p.insert("strict".into(), crate::params::ParamValue::from(false));
        let mut det = SwingDetector::new("s", &p).unwrap();
        let hl = [(100.0, 98.0), (110.0, 100.0), (110.0, 100.0), (100.0, 96.0)];
        drive(&mut det, &hl);
        assert_eq!(det.get_field("high_level"), Some(110.0));
    }

    #[test]
    fn duplicate_high_replaced_only_if_more_extreme() {
        let mut det = SwingDetector::new("s", &swing_params(1, 1)).unwrap();
        // Two separated peaks with no intervening low pivot: 110 then 115.
        let hl = [
            (100.0, 99.0),
            (110.0, 103.0),
            (104.0, 103.5), // confirms high at idx 1
            (115.0, 105.0),
            (106.0, 104.0), // confirms higher high at idx 3, replaces
        ];
        drive(&mut det, &hl);
        assert_eq!(det.get_field("high_level"), Some(115.0));
        assert_eq!(det.get_field("high_idx"), Some(3.0));
        assert_eq!(det.get_field("last_pivot_dir"), Some(1.0));
    }

    #[test]
    fn highs_and_lows_alternate() {
        let mut det = SwingDetector::new("s", &swing_params(1, 1)).unwrap();
        let hl = [
            (100.0, 99.0),
            (110.0, 103.0), // high pivot at idx 1
            (104.0, 95.0),  // low pivot at idx 2
            (103.5, 99.0),
            (103.0, 98.0),
        ];
        drive(&mut det, &hl);
        assert_eq!(det.get_field("high_level"), Some(110.0));
        assert_eq!(det.get_field("low_level"), Some(95.0));
        assert_eq!(det.get_field("last_pivot_dir"), Some(-1.0));
    }

    #[test]
    fn requires_left_and_right() {
        let mut p = Params::new();
        p.insert("left".into(), crate::params::ParamValue::from(2_i64));
        assert!(SwingDetector::new("s", &p).is_err());
    }

    #[test]
    fn zigzag_requires_atr_key() {
        let mut p = swing_params(2, 2);
        p.insert("zigzag_atr_mult".into(), crate::params::ParamValue::from(1.5));
        assert!(SwingDetector::new("s", &p).is_err());
    }
}
