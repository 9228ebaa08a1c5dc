//! Adapter configuration.
//!
//! Adapters receive a loosely typed string-keyed map (usually straight out of
//! a JSON or YAML document). Each adapter declares a typed struct implementing
//! [`ProtocolConfig`]; [`ProtocolConfig::from_map`] turns the map into that
//! struct with a pure validation pass:
//!
//! 1. walk `KEYS` in declaration order and fail on the first absent mandatory key
//! 2. drop keys the adapter does not recognise
//! 3. deserialize, reporting the key whose value does not fit
//! 4. run the adapter's own semantic checks

use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One adapter configuration.
pub type ConfigMap = HashMap<String, Value>;

/// Configuration handed to `configure`: a single map, or a primary/backup pair
/// for composite clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSet {
    Single(ConfigMap),
    Pair(ConfigMap, ConfigMap),
}

impl ConfigSet {
    pub fn single(map: ConfigMap) -> Self {
        Self::Single(map)
    }

    pub fn pair(primary: ConfigMap, backup: ConfigMap) -> Self {
        Self::Pair(primary, backup)
    }

    /// The first (or only) map.
    pub fn primary(&self) -> &ConfigMap {
        match self {
            ConfigSet::Single(map) | ConfigSet::Pair(map, _) => map,
        }
    }

    /// The backup map, if this is a pair.
    pub fn secondary(&self) -> Option<&ConfigMap> {
        match self {
            ConfigSet::Single(_) => None,
            ConfigSet::Pair(_, backup) => Some(backup),
        }
    }

    /// Build from a JSON document: an object, or an array of one or two objects.
    pub fn from_json(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(map) => Ok(Self::Single(map.into_iter().collect())),
            Value::Array(items) => {
                let mut maps = items.into_iter().map(|item| match item {
                    Value::Object(map) => Ok(map.into_iter().collect::<ConfigMap>()),
                    other => Err(ConfigError::Invalid(format!(
                        "expected an object, got {}",
                        other
                    ))),
                });
                match (maps.next(), maps.next()) {
                    (None, _) => Err(ConfigError::Empty),
                    (Some(primary), None) => Ok(Self::Single(primary?)),
                    (Some(primary), Some(backup)) => Ok(Self::Pair(primary?, backup?)),
                }
            }
            Value::Null => Err(ConfigError::Empty),
            other => Err(ConfigError::Invalid(format!(
                "expected an object or array, got {}",
                other
            ))),
        }
    }
}

impl From<ConfigMap> for ConfigSet {
    fn from(map: ConfigMap) -> Self {
        Self::Single(map)
    }
}

/// Typed configuration of one adapter.
///
/// Implementors are plain serde structs with `#[serde(default)]`, so a partial
/// map always deserializes; presence of mandatory keys is checked separately.
pub trait ProtocolConfig: DeserializeOwned + Default {
    /// Every recognised key, in declaration order.
    const KEYS: &'static [&'static str];

    /// Keys that must be present.
    const MANDATORY: &'static [&'static str];

    /// Semantic checks beyond presence and type.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        check_mandatory(Self::KEYS, Self::MANDATORY, map)?;

        let known = known_entries(Self::KEYS, map);
        let config: Self = match serde_json::from_value(Value::Object(known)) {
            Ok(config) => config,
            Err(err) => return Err(locate_invalid::<Self>(map, err)),
        };

        config.validate()?;
        Ok(config)
    }
}

fn check_mandatory(
    keys: &[&str],
    mandatory: &[&str],
    map: &ConfigMap,
) -> Result<(), ConfigError> {
    // Declaration order decides which key gets reported.
    for key in keys.iter().chain(mandatory.iter().filter(|m| !keys.contains(m))) {
        if mandatory.contains(key) && !map.contains_key(*key) {
            return Err(ConfigError::MissingKey((*key).to_string()));
        }
    }
    Ok(())
}

fn known_entries(keys: &[&str], map: &ConfigMap) -> Map<String, Value> {
    keys.iter()
        .filter_map(|key| map.get(*key).map(|value| ((*key).to_string(), value.clone())))
        .collect()
}

/// Re-parse one key at a time to find which value broke deserialization.
fn locate_invalid<C: ProtocolConfig>(map: &ConfigMap, err: serde_json::Error) -> ConfigError {
    for key in C::KEYS {
        if let Some(value) = map.get(*key) {
            let mut single = Map::new();
            single.insert((*key).to_string(), value.clone());
            if let Err(field_err) = serde_json::from_value::<C>(Value::Object(single)) {
                return ConfigError::InvalidType {
                    key: (*key).to_string(),
                    details: field_err.to_string(),
                };
            }
        }
    }
    ConfigError::InvalidType {
        key: String::new(),
        details: err.to_string(),
    }
}

/// Lenient field deserializers: configuration often arrives with every value
/// as a string.
pub mod de {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Bool(bool),
        Int(i64),
        Float(f64),
        Str(String),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        List(Vec<String>),
        Str(String),
    }

    /// Accept a string or a number and keep it as a string (ports, db numbers).
    pub fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Scalar::deserialize(deserializer)? {
            Scalar::Str(s) => Ok(s),
            Scalar::Int(i) => Ok(i.to_string()),
            Scalar::Float(f) => Ok(f.to_string()),
            Scalar::Bool(b) => Ok(b.to_string()),
        }
    }

    /// Accept `true`/`false` or their string forms.
    pub fn boolean<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Scalar::deserialize(deserializer)? {
            Scalar::Bool(b) => Ok(b),
            Scalar::Int(i) => Ok(i != 0),
            Scalar::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" | "" => Ok(false),
                other => Err(serde::de::Error::custom(format!(
                    "expected a boolean, got '{}'",
                    other
                ))),
            },
            Scalar::Float(f) => Err(serde::de::Error::custom(format!(
                "expected a boolean, got {}",
                f
            ))),
        }
    }

    /// Accept a non-negative integer or its string form.
    pub fn unsigned<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Scalar::deserialize(deserializer)? {
            Scalar::Int(i) if i >= 0 => Ok(i as u64),
            Scalar::Str(s) => s.trim().parse().map_err(|_| {
                serde::de::Error::custom(format!("expected an unsigned integer, got '{}'", s))
            }),
            _ => Err(serde::de::Error::custom("expected an unsigned integer")),
        }
    }

    /// Accept a comma-separated string or an array of strings.
    pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match StringOrList::deserialize(deserializer)? {
            StringOrList::List(items) => items,
            StringOrList::Str(s) => s
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect(),
        })
    }
}

#[cfg(test)]
pub(crate) fn map_of(entries: &[(&str, Value)]) -> ConfigMap {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}
