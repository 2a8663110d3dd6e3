//! Rolling min/max of a bar field, O(1) amortised.

use super::{Detector, FieldClass, StructureKind, SwingState};
use crate::bar::Bar;
use crate::error::{PerpLabError, Result};
use crate::params::{ParamReader, Params};
use std::collections::VecDeque;

pub(super) const FIELDS: &[&str] = &["value", "version"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl BarField {
    fn parse(key: &str, s: &str) -> Result<Self> {
        match s {
            "open" => Ok(BarField::Open),
            "high" => Ok(BarField::High),
            "low" => Ok(BarField::Low),
            "close" => Ok(BarField::Close),
            "volume" => Ok(BarField::Volume),
            other => Err(PerpLabError::Config(format!(
                "{key}: unknown bar field '{other}'"
            ))),
        }
    }

    fn extract(&self, bar: &Bar) -> f64 {
        match self {
            BarField::Open => bar.open,
            BarField::High => bar.high,
            BarField::Low => bar.low,
            BarField::Close => bar.close,
            BarField::Volume => bar.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Min,
    Max,
}

/// Maintains the min or max of one bar field over the last N bars with a
/// monotonic deque, the same trick the prep-time `rolling_max` uses, kept
/// incremental here because structures update bar by bar.
pub struct RollingWindowDetector {
    field: BarField,
    mode: Mode,
    window: usize,
    // (bar_idx, value), values kept in winning order
    deque: VecDeque<(usize, f64)>,
    seen_bars: usize,
    value: f64,
    version: u64,
}

impl RollingWindowDetector {
    pub fn new(key: &str, params: &Params) -> Result<Self> {
        let r = ParamReader::new(key, params);
        r.check_known(&["field", "mode", "window"])?;

        let field = BarField::parse(key, r.require_str("field")?)?;
        let mode = match r.require_str("mode")? {
            "min" => Mode::Min,
            "max" => Mode::Max,
            other => {
                return Err(PerpLabError::Config(format!(
                    "{key}: unknown mode '{other}' (expected min or max)"
                )))
            }
        };
        let window = r.require_usize("window")?;
        if window == 0 {
            return Err(PerpLabError::Config(format!(
                "{key}: window must be at least 1"
            )));
        }

        Ok(Self {
            field,
            mode,
            window,
            deque: VecDeque::new(),
            seen_bars: 0,
            value: f64::NAN,
            version: 0,
        })
    }

    fn wins(&self, candidate: f64, incumbent: f64) -> bool {
        match self.mode {
            Mode::Max => candidate >= incumbent,
            Mode::Min => candidate <= incumbent,
        }
    }
}

impl Detector for RollingWindowDetector {
    fn kind(&self) -> StructureKind {
        StructureKind::RollingWindow
    }

    fn warmup_bars(&self) -> usize {
        self.window
    }

    fn update(&mut self, bar_idx: usize, bar: &Bar, _dep: Option<&SwingState>, _aux: f64) {
        let v = self.field.extract(bar);
        self.seen_bars += 1;

        while let Some(&(_, back)) = self.deque.back() {
            if self.wins(v, back) {
                self.deque.pop_back();
            } else {
                break;
            }
        }
        self.deque.push_back((bar_idx, v));

        if let Some(&(front_idx, _)) = self.deque.front() {
            if bar_idx >= self.window && front_idx <= bar_idx - self.window {
                self.deque.pop_front();
            }
        }

        if self.seen_bars >= self.window {
            let new_value = self.deque.front().expect("deque never empty here").1;
            if new_value != self.value && !(new_value.is_nan() && self.value.is_nan()) {
                self.value = new_value;
                self.version += 1;
            }
        }
    }

    fn get_field(&self, name: &str) -> Option<f64> {
        match name {
            "value" => Some(self.value),
            "version" => Some(self.version as f64),
            _ => None,
        }
    }

    fn fields(&self) -> &'static [&'static str] {
        FIELDS
    }

    fn field_class(&self, name: &str) -> FieldClass {
        match name {
            "version" => FieldClass::Discrete,
            _ => FieldClass::Numeric,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}
