//! Record projection applied to every fetched page: keep only selected
//! records and only the keys the pipeline reads.

use serde_json::{Map, Value};

use super::error::ProjectionError;

/// Filter/reshape a batch of records. The default is identity.
pub trait Projection: Send + Sync {
    fn project(&self, records: Vec<Value>) -> Result<Vec<Value>, ProjectionError> {
        Ok(records)
    }
}

/// Pass-through projection.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

#[cfg(test)]
impl Projection for Identity {}

/// Select records whose `key` equals one of a set of values, then keep a
/// fixed list of keys. Kept keys missing from a record become `null`.
#[derive(Debug, Clone, Default)]
pub struct SelectProject {
    select: Option<(String, Vec<Value>)>,
    keep: Vec<String>,
}

impl SelectProject {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty value set leaves the selection unrestricted.
    pub fn select_in(mut self, key: &str, values: impl IntoIterator<Item = Value>) -> Self {
        let values: Vec<Value> = values.into_iter().collect();
        self.select = (!values.is_empty()).then(|| (key.to_string(), values));
        self
    }

    pub fn keep_keys<S: AsRef<str>>(mut self, keys: &[S]) -> Self {
        self.keep = keys.iter().map(|k| k.as_ref().to_string()).collect();
        self
    }

    fn selects(&self, obj: &Map<String, Value>) -> bool {
        match &self.select {
            None => true,
            Some((key, values)) => obj.get(key).is_some_and(|v| values.contains(v)),
        }
    }
}

impl Projection for SelectProject {
    fn project(&self, records: Vec<Value>) -> Result<Vec<Value>, ProjectionError> {
        let mut out = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let Value::Object(mut obj) = record else {
                return Err(ProjectionError::NotAnObject { index });
            };
            if !self.selects(&obj) {
                continue;
            }
            if self.keep.is_empty() {
                out.push(Value::Object(obj));
                continue;
            }
            let mut kept = Map::with_capacity(self.keep.len());
            for key in &self.keep {
                kept.insert(key.clone(), obj.remove(key).unwrap_or(Value::Null));
            }
            out.push(Value::Object(kept));
        }
        Ok(out)
    }
}
