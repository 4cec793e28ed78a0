//! Stage 4: decide keep/delete/none for every submission and image field.
//! Pure: the result depends only on the current server state.

use serde::Serialize;

use super::resolver;
use crate::kobo::types::{Asset, Attachment, Submission};
use crate::kobo::StructuralError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Value present and backed by an attachment.
    Keep,
    /// No value: any local copy should be retired.
    Delete,
    /// Value present but no attachment backs it. Never executed.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub submission_id: i64,
    pub field: String,
    pub desired_value: Option<String>,
    pub attachment: Option<Attachment>,
    pub action: Action,
}

/// Action map of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPlan {
    pub uid: String,
    pub name: String,
    /// Every submission id returned this run, used for orphan pruning.
    pub submission_ids: Vec<i64>,
    pub entries: Vec<ActionEntry>,
    pub warnings: Vec<String>,
}

impl AssetPlan {
    pub fn count(&self, action: Action) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }
}

/// Build the action map of `asset`, submissions in input order and fields
/// in declaration order.
///
/// A field bound to more than one value is an upstream inconsistency and
/// fails the whole build.
pub fn build_action_map(
    asset: &Asset,
    submissions: &[Submission],
) -> Result<AssetPlan, StructuralError> {
    let mut entries = Vec::with_capacity(submissions.len() * asset.image_fields.len());
    let mut warnings = Vec::new();

    for submission in submissions {
        for field in &asset.image_fields {
            let values = submission
                .images_map
                .get(&field.autoname)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if values.len() > 1 {
                return Err(StructuralError::MultipleValues {
                    asset_uid: asset.uid.clone(),
                    submission_id: submission.id,
                    field: field.autoname.clone(),
                    count: values.len(),
                });
            }

            let entry = match values.first() {
                None => ActionEntry {
                    submission_id: submission.id,
                    field: field.autoname.clone(),
                    desired_value: None,
                    attachment: None,
                    action: Action::Delete,
                },
                Some(v) => {
                    let attachment =
                        resolver::resolve(&v.value, &submission.attachments, submission.id)
                            .cloned();
                    let action = if attachment.is_some() {
                        Action::Keep
                    } else {
                        let warning = format!(
                            "asset {}, submission {}: field '{}' names '{}' but no image attachment matches",
                            asset.uid, submission.id, field.autoname, v.value
                        );
                        tracing::warn!("{}", warning);
                        warnings.push(warning);
                        Action::None
                    };
                    ActionEntry {
                        submission_id: submission.id,
                        field: field.autoname.clone(),
                        desired_value: Some(v.value.clone()),
                        attachment,
                        action,
                    }
                }
            };
            entries.push(entry);
        }
    }

    Ok(AssetPlan {
        uid: asset.uid.clone(),
        name: asset.name.clone(),
        submission_ids: submissions.iter().map(|s| s.id).collect(),
        entries,
        warnings,
    })
}
