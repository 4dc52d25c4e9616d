//! Data - Worker の入出力ペイロード
//!
//! # 設計
//! - キーは文字列、値は任意の JSON 値（`serde_json::Value`）
//! - BTreeMap なのでシリアライズ結果が安定する（snapshot の差分が読みやすい）
//! - シリアライズ後のサイズは [`MAX_DATA_BYTES`] 以下

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound of a serialized Data payload.
pub const MAX_DATA_BYTES: usize = 10 * 1024;

/// Data was larger than [`MAX_DATA_BYTES`] once serialized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("data payload is {size} bytes, limit is {limit} bytes")]
pub struct DataTooLarge {
    pub size: usize,
    pub limit: usize,
}

/// Opaque key/value payload handed to and returned from workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Data(BTreeMap<String, Value>);

impl Data {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Serialized JSON size in bytes.
    pub fn serialized_size(&self) -> usize {
        // BTreeMap<String, Value> の serialize は失敗しない
        serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    pub fn check_size(&self) -> Result<(), DataTooLarge> {
        let size = self.serialized_size();
        if size > MAX_DATA_BYTES {
            return Err(DataTooLarge {
                size,
                limit: MAX_DATA_BYTES,
            });
        }
        Ok(())
    }
}

impl FromIterator<(String, Value)> for Data {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How a work item's own input is combined with its prerequisites' outputs.
///
/// Inputs are merged in order: own input first, then each prerequisite output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMerger {
    /// Later values overwrite earlier ones.
    #[default]
    Overwriting,

    /// Values for the same key are collected into an array (arrays are concatenated).
    ArrayCreating,
}

impl InputMerger {
    pub fn merge(self, inputs: &[Data]) -> Data {
        match self {
            InputMerger::Overwriting => {
                let mut out = Data::empty();
                for input in inputs {
                    for (k, v) in input.iter() {
                        out.0.insert(k.clone(), v.clone());
                    }
                }
                out
            }
            InputMerger::ArrayCreating => {
                let mut out: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                for input in inputs {
                    for (k, v) in input.iter() {
                        let slot = out.entry(k.clone()).or_default();
                        match v {
                            Value::Array(items) => slot.extend(items.iter().cloned()),
                            other => slot.push(other.clone()),
                        }
                    }
                }
                out.into_iter()
                    .map(|(k, v)| (k, Value::Array(v)))
                    .collect()
            }
        }
    }
}
