//! Parameter values shared by indicator and structure declarations.

use crate::error::{PerpLabError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Parameter value (number, string, or boolean).
///
/// Declarations carry parameters as an untagged map so that Play JSON stays
/// flat (`{"period": 20, "method": "wilder"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        match self {
            ParamValue::Integer(v) if *v >= 0 => Some(*v as usize),
            ParamValue::Float(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as usize),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::String(s) => write!(f, "{s}"),
            ParamValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Integer(v)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Integer(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

/// Declaration parameter map, ordered for canonical serialisation.
pub type Params = BTreeMap<String, ParamValue>;

/// Typed accessors over a declaration's parameter map.
///
/// All lookups fail loudly: a missing required parameter or a wrong type is
/// a configuration error, never a silent default.
pub struct ParamReader<'a> {
    owner: &'a str,
    params: &'a Params,
}

impl<'a> ParamReader<'a> {
    pub fn new(owner: &'a str, params: &'a Params) -> Self {
        Self { owner, params }
    }

    pub fn require_usize(&self, name: &str) -> Result<usize> {
        self.params
            .get(name)
            .and_then(|v| v.as_usize())
            .ok_or_else(|| self.missing(name, "positive integer"))
    }

    pub fn require_f64(&self, name: &str) -> Result<f64> {
        self.params
            .get(name)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| self.missing(name, "number"))
    }

    pub fn require_str(&self, name: &str) -> Result<&'a str> {
        self.params
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| self.missing(name, "string"))
    }

    pub fn opt_usize(&self, name: &str, default: usize) -> Result<usize> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => v
                .as_usize()
                .ok_or_else(|| self.missing(name, "positive integer")),
        }
    }

    pub fn opt_f64(&self, name: &str, default: f64) -> Result<f64> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| self.missing(name, "number")),
        }
    }

    pub fn opt_str(&self, name: &str, default: &'a str) -> Result<&'a str> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => v.as_str().ok_or_else(|| self.missing(name, "string")),
        }
    }

    pub fn opt_bool(&self, name: &str, default: bool) -> Result<bool> {
        match self.params.get(name) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| self.missing(name, "boolean")),
        }
    }

    /// Reject parameters outside the accepted set.
    pub fn check_known(&self, accepted: &[&str]) -> Result<()> {
        for key in self.params.keys() {
            if !accepted.contains(&key.as_str()) {
                return Err(PerpLabError::Config(format!(
                    "{}: unknown parameter '{key}' (accepted: {})",
                    self.owner,
                    accepted.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn missing(&self, name: &str, expected: &str) -> PerpLabError {
        PerpLabError::Config(format!(
            "{}: parameter '{name}' missing or not a {expected}",
            self.owner
        ))
    }
}
