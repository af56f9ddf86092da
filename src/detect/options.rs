//! Self-describing detector tunables.
//!
//! Every detector publishes an `OptionSet` (key -> `ConfigOption`) and accepts a
//! `ConfigMap` (key -> `ConfigValue`) at runtime. Applying a map never fails:
//! unknown keys are ignored, out-of-range numbers are clamped, and values of the
//! wrong type leave the current setting untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Runtime value for a tunable. Deserialises from plain TOML/JSON scalars.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Float(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

pub type ConfigMap = BTreeMap<String, ConfigValue>;
pub type OptionSet = BTreeMap<String, ConfigOption>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Bool,
    Int,
    Float,
    Enum,
}

/// Description of one tunable parameter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigOption {
    pub key: String,
    pub display_name: String,
    pub option_type: OptionType,
    pub default: ConfigValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Allowed values for `OptionType::Enum`.
    pub choices: Vec<String>,
}

impl ConfigOption {
    pub fn bool(key: &str, display_name: &str, default: bool) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            option_type: OptionType::Bool,
            default: ConfigValue::Bool(default),
            min: None,
            max: None,
            choices: Vec::new(),
        }
    }

    pub fn int(key: &str, display_name: &str, default: i64, min: i64, max: i64) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            option_type: OptionType::Int,
            default: ConfigValue::Int(default),
            min: Some(min as f64),
            max: Some(max as f64),
            choices: Vec::new(),
        }
    }

    pub fn float(key: &str, display_name: &str, default: f64, min: f64, max: f64) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            option_type: OptionType::Float,
            default: ConfigValue::Float(default),
            min: Some(min),
            max: Some(max),
            choices: Vec::new(),
        }
    }

    pub fn choice(key: &str, display_name: &str, default: &str, choices: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            option_type: OptionType::Enum,
            default: ConfigValue::Text(default.to_string()),
            min: None,
            max: None,
            choices: choices.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Same option under a namespaced key (`prefix` + key).
    pub fn prefixed(&self, prefix: &str) -> Self {
        Self {
            key: format!("{}{}", prefix, self.key),
            ..self.clone()
        }
    }

    /// Validate `value` against this option. Returns the value to apply, or `None` when it
    /// must be ignored.
    pub fn coerce(&self, value: &ConfigValue) -> Option<ConfigValue> {
        match self.option_type {
            OptionType::Bool => value.as_bool().map(ConfigValue::Bool),
            OptionType::Int => {
                let raw = match value {
                    ConfigValue::Int(i) => *i as f64,
                    ConfigValue::Float(f) if f.is_finite() => f.round(),
                    _ => return None,
                };
                Some(ConfigValue::Int(self.clamp(raw) as i64))
            }
            OptionType::Float => {
                let raw = value.as_f64().filter(|f| f.is_finite())?;
                Some(ConfigValue::Float(self.clamp(raw)))
            }
            OptionType::Enum => {
                let text = value.as_str()?;
                self.choices
                    .iter()
                    .any(|c| c == text)
                    .then(|| ConfigValue::Text(text.to_string()))
            }
        }
    }

    fn clamp(&self, value: f64) -> f64 {
        let lower = self.min.unwrap_or(f64::NEG_INFINITY);
        let upper = self.max.unwrap_or(f64::INFINITY);
        value.max(lower).min(upper)
    }
}

/// Default value of every option in a set.
pub fn defaults(options: &OptionSet) -> ConfigMap {
    options
        .iter()
        .map(|(key, option)| (key.clone(), option.default.clone()))
        .collect()
}

pub(crate) fn insert(options: &mut OptionSet, option: ConfigOption) {
    options.insert(option.key.clone(), option);
}

fn lookup(options: &OptionSet, config: &ConfigMap, key: &str) -> Option<ConfigValue> {
    let option = options.get(key)?;
    let value = config.get(key)?;
    let coerced = option.coerce(value);
    if coerced.is_none() {
        log::debug!("ignoring invalid value {:?} for option {}", value, key);
    }
    coerced
}

pub(crate) fn read_bool(options: &OptionSet, config: &ConfigMap, key: &str) -> Option<bool> {
    lookup(options, config, key).and_then(|v| v.as_bool())
}

pub(crate) fn read_i64(options: &OptionSet, config: &ConfigMap, key: &str) -> Option<i64> {
    lookup(options, config, key).and_then(|v| v.as_i64())
}

pub(crate) fn read_f64(options: &OptionSet, config: &ConfigMap, key: &str) -> Option<f64> {
    lookup(options, config, key).and_then(|v| v.as_f64())
}

pub(crate) fn read_text(options: &OptionSet, config: &ConfigMap, key: &str) -> Option<String> {
    lookup(options, config, key).and_then(|v| v.as_str().map(str::to_string))
}

/// Debug-log keys a detector does not understand. They are otherwise ignored.
pub(crate) fn log_unknown_keys(detector: &str, options: &OptionSet, config: &ConfigMap) {
    for key in config.keys().filter(|k| !options.contains_key(*k)) {
        log::debug!("{}: ignoring unknown option {}", detector, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_are_clamped() {
        let threshold = ConfigOption::int("motion_threshold", "Motion threshold", 30, 0, 255);
        assert_eq!(threshold.coerce(&ConfigValue::Int(400)), Some(ConfigValue::Int(255)));
        assert_eq!(threshold.coerce(&ConfigValue::Int(-3)), Some(ConfigValue::Int(0)));
        assert_eq!(threshold.coerce(&ConfigValue::Float(41.6)), Some(ConfigValue::Int(42)));

        let weight = ConfigOption::float("pose_weight", "Pose weight", 0.7, 0.0, 1.0);
        assert_eq!(weight.coerce(&ConfigValue::Float(3.5)), Some(ConfigValue::Float(1.0)));
        assert_eq!(weight.coerce(&ConfigValue::Int(0)), Some(ConfigValue::Float(0.0)));
        assert_eq!(weight.coerce(&ConfigValue::Float(f64::NAN)), None);
    }

    #[test]
    fn wrong_types_are_ignored() {
        let flag = ConfigOption::bool("require_both", "Require both", false);
        assert_eq!(flag.coerce(&ConfigValue::Int(1)), None);
        let mode = ConfigOption::choice("mode", "Mode", "fast", &["fast", "accurate"]);
        assert_eq!(mode.coerce(&ConfigValue::from("slow")), None);
        assert_eq!(
            mode.coerce(&ConfigValue::from("accurate")),
            Some(ConfigValue::Text("accurate".into()))
        );
    }

    #[test]
    fn unknown_keys_are_noops() {
        let mut options = OptionSet::new();
        insert(&mut options, ConfigOption::int("stride", "Stride", 4, 1, 16));
        let mut config = ConfigMap::new();
        config.insert("bogus".into(), ConfigValue::Int(9));
        assert_eq!(read_i64(&options, &config, "bogus"), None);
        assert_eq!(read_i64(&options, &config, "stride"), None);
    }

    #[test]
    fn config_values_deserialize_from_toml_scalars() {
        let map: ConfigMap = toml::from_str(
            "motion_threshold = 25\npose_weight = 0.5\nrequire_both = true\nmode = \"fast\"",
        )
        .unwrap();
        assert_eq!(map["motion_threshold"], ConfigValue::Int(25));
        assert_eq!(map["pose_weight"], ConfigValue::Float(0.5));
        assert_eq!(map["require_both"], ConfigValue::Bool(true));
        assert_eq!(map["mode"], ConfigValue::Text("fast".into()));
    }
}
