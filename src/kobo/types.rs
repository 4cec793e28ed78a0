//! Typed views of the KoBo payloads. Records are validated once here and
//! the rest of the pipeline works only with these types.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use super::error::StructuralError;

/// Fallback used when an asset has no usable name.
const DEFAULT_ASSET_NAME: &str = "asset";

/// Entry of the asset listing (stage 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSummary {
    pub uid: String,
    pub name: String,
    pub submission_count: u64,
}

impl AssetSummary {
    pub fn from_value(value: &Value) -> Result<Self, StructuralError> {
        let obj = value.as_object().ok_or_else(|| StructuralError::NotAnObject {
            context: "asset listing entry".to_string(),
        })?;
        let uid = non_empty_str(obj, "uid")
            .ok_or_else(|| StructuralError::field("asset listing entry", "uid", "non-empty string"))?;
        let name = non_empty_str(obj, "name").unwrap_or(DEFAULT_ASSET_NAME);
        let submission_count = match obj.get("deployment__submission_count") {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_u64().ok_or_else(|| {
                StructuralError::field(
                    format!("asset {uid}"),
                    "deployment__submission_count",
                    "non-negative integer",
                )
            })?,
        };
        Ok(Self {
            uid: uid.to_string(),
            name: name.to_string(),
            submission_count,
        })
    }
}

/// A form field of image type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageField {
    pub autoname: String,
}

/// Asset with its image fields (stage 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub uid: String,
    pub name: String,
    pub submission_count: u64,
    pub image_fields: Vec<ImageField>,
}

impl Asset {
    /// Combine a listing entry with the asset detail document, keeping the
    /// image-typed questions of `content.survey` in declaration order.
    pub fn from_detail(summary: AssetSummary, detail: &Value) -> Result<Self, StructuralError> {
        let context = format!("asset {}", summary.uid);
        let survey = detail
            .pointer("/content/survey")
            .and_then(Value::as_array)
            .ok_or_else(|| StructuralError::field(&context, "content.survey", "array"))?;

        let mut image_fields: Vec<ImageField> = Vec::new();
        for question in survey {
            if question.get("type").and_then(Value::as_str) != Some("image") {
                continue;
            }
            let autoname = question
                .get("$autoname")
                .or_else(|| question.get("name"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| StructuralError::field(&context, "$autoname", "non-empty string"))?;
            if image_fields.iter().any(|f| f.autoname == autoname) {
                return Err(StructuralError::field(&context, autoname, "unique autoname"));
            }
            image_fields.push(ImageField {
                autoname: autoname.to_string(),
            });
        }

        Ok(Self {
            uid: summary.uid,
            name: summary.name,
            submission_count: summary.submission_count,
            image_fields,
        })
    }
}

/// Binary file attached to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: i64,
    pub mimetype: String,
    pub filename: String,
    pub download_url: String,
    pub instance_id: i64,
}

impl Attachment {
    /// Parse one `_attachments` entry, returning the reason on rejection.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let obj = value.as_object().ok_or("expected object")?;
        let text = |key: &str| {
            non_empty_str(obj, key)
                .map(str::to_string)
                .ok_or(format!("expected string in '{key}'"))
        };
        let int = |key: &str| {
            obj.get(key)
                .and_then(Value::as_i64)
                .ok_or(format!("expected number in '{key}'"))
        };
        Ok(Self {
            id: int("id")?,
            mimetype: text("mimetype")?,
            filename: text("filename")?,
            download_url: text("download_url")?,
            instance_id: int("instance")?,
        })
    }

    /// Parse an `_attachments` array, skipping malformed entries with a
    /// logged exclusion.
    pub fn parse_list(values: &[Value], submission_id: i64) -> Vec<Self> {
        values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| match Self::from_value(v) {
                Ok(a) => Some(a),
                Err(reason) => {
                    tracing::warn!(
                        submission_id,
                        index = i,
                        "Attachment excluded: {}",
                        reason
                    );
                    None
                }
            })
            .collect()
    }
}

/// One `(submission key, value)` pair bound to an image field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageValue {
    pub submission_field_key: String,
    pub value: String,
}

/// Submission record annotated with its images map (stage 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: i64,
    pub attachments: Vec<Attachment>,
    /// Image field autoname to the values found for it. More than one
    /// value is an upstream inconsistency, reported when the action map
    /// is built.
    pub images_map: BTreeMap<String, Vec<ImageValue>>,
}

impl Submission {
    pub fn from_value(
        value: &Value,
        fields: &[ImageField],
        asset_uid: &str,
    ) -> Result<Self, StructuralError> {
        let context = format!("asset {asset_uid} submission");
        let obj = value
            .as_object()
            .ok_or_else(|| StructuralError::NotAnObject {
                context: context.clone(),
            })?;
        let id = obj
            .get("_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| StructuralError::field(&context, "_id", "integer"))?;
        let context = format!("asset {asset_uid} submission {id}");
        let raw_attachments = obj
            .get("_attachments")
            .and_then(Value::as_array)
            .ok_or_else(|| StructuralError::field(&context, "_attachments", "array"))?;

        let mut images_map = BTreeMap::new();
        for field in fields {
            let mut values = Vec::new();
            for (key, v) in obj {
                if !key_matches_field(key, &field.autoname) {
                    continue;
                }
                match v {
                    Value::Null => {}
                    Value::String(s) if s.is_empty() => {}
                    Value::String(s) => values.push(ImageValue {
                        submission_field_key: key.clone(),
                        value: s.clone(),
                    }),
                    _ => return Err(StructuralError::field(&context, key, "string")),
                }
            }
            images_map.insert(field.autoname.clone(), values);
        }

        Ok(Self {
            id,
            attachments: Attachment::parse_list(raw_attachments, id),
            images_map,
        })
    }
}

/// Submission keys carry the group path of nested questions, so a field
/// matches either exactly or as the last path segment.
fn key_matches_field(key: &str, autoname: &str) -> bool {
    key == autoname
        || key
            .strip_suffix(autoname)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}
