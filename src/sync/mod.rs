//! Stage 5: reconcile the local image tree with an action map.
//!
//! Every (submission, field) entry is checked against its manifest and
//! then confirmed, downloaded, or retired. Item failures are recorded in
//! the asset report and never stop sibling items.

pub mod action_map;
pub mod error;
pub mod file;
pub mod manifest;
pub mod paths;
pub mod resolver;

use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use self::action_map::{Action, ActionEntry, AssetPlan};
use self::error::SyncError;
use self::file::DownloadOptions;
use self::manifest::AttachmentManifest;
use crate::kobo::types::Attachment;
use crate::kobo::KoboApi;
use crate::store::{self, ContentHash, PathKind};

/// Roots of the trees owned by the executor.
#[derive(Debug, Clone)]
pub struct SyncDirs {
    pub manifests: PathBuf,
    pub images: PathBuf,
    /// Per-run holding area for retired images.
    pub deleted: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub dirs: SyncDirs,
    pub download: DownloadOptions,
    /// Remove retired images instead of moving them to the holding area.
    pub hard_delete: bool,
    pub prune_orphans: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOp {
    UpToDate,
    Download,
    Delete,
    SkipInconsistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub submission_id: i64,
    pub field: String,
    pub status: ItemStatus,
    pub op: SyncOp,
    pub path: Option<PathBuf>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
    pub kept: usize,
    pub downloaded: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub warnings: usize,
    pub errors: usize,
}

impl AddAssign for SyncCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.kept += rhs.kept;
        self.downloaded += rhs.downloaded;
        self.deleted += rhs.deleted;
        self.skipped += rhs.skipped;
        self.warnings += rhs.warnings;
        self.errors += rhs.errors;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetReport {
    pub uid: String,
    pub name: String,
    pub counters: SyncCounters,
    pub interrupted: bool,
    pub outcomes: Vec<ItemOutcome>,
}

impl AssetReport {
    fn new(plan: &AssetPlan) -> Self {
        Self {
            uid: plan.uid.clone(),
            name: plan.name.clone(),
            counters: SyncCounters {
                warnings: plan.warnings.len(),
                ..SyncCounters::default()
            },
            interrupted: false,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, outcome: ItemOutcome, warned: bool) {
        let c = &mut self.counters;
        match (outcome.status, outcome.op) {
            (ItemStatus::Error, _) => c.errors += 1,
            (ItemStatus::Ok, SyncOp::UpToDate) => c.kept += 1,
            (ItemStatus::Ok, SyncOp::Download) => c.downloaded += 1,
            (ItemStatus::Ok, SyncOp::Delete) => c.deleted += 1,
            (ItemStatus::Ok, SyncOp::SkipInconsistent) => c.skipped += 1,
        }
        if warned {
            c.warnings += 1;
        }
        self.outcomes.push(outcome);
    }
}

/// Successful end state of one item.
struct Done {
    op: SyncOp,
    path: Option<PathBuf>,
    detail: String,
    warned: bool,
}

pub struct SyncExecutor<'a> {
    api: &'a KoboApi,
    config: &'a SyncConfig,
    shutdown: CancellationToken,
}

impl<'a> SyncExecutor<'a> {
    pub fn new(api: &'a KoboApi, config: &'a SyncConfig, shutdown: CancellationToken) -> Self {
        Self {
            api,
            config,
            shutdown,
        }
    }

    /// Execute the action map of one asset. `prune` enables orphan pruning
    /// for this asset when the config allows it.
    pub async fn run_asset(&self, plan: &AssetPlan, prune: bool) -> AssetReport {
        let mut report = AssetReport::new(plan);
        let duplicates = duplicate_targets(&plan.entries);
        let claimed = claimed_names(&plan.entries);

        for entry in &plan.entries {
            if self.shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let (op, result) = match (&entry.action, &entry.attachment, &entry.desired_value) {
                (Action::Keep, Some(attachment), Some(value)) => {
                    match duplicates.get(&(entry.submission_id, entry.field.as_str())) {
                        Some(other) => (
                            SyncOp::Download,
                            Err(SyncError::DuplicateName {
                                name: paths::image_name(entry.submission_id, value),
                                other_field: other.to_string(),
                            }),
                        ),
                        None => (
                            SyncOp::Download,
                            self.keep(plan, entry, attachment, value, &claimed).await,
                        ),
                    }
                }
                (Action::Delete, _, _) => (
                    SyncOp::Delete,
                    self.delete(plan, entry.submission_id, &entry.field, &claimed)
                        .await,
                ),
                // Flagged when the map was built; nothing to execute.
                _ => continue,
            };
            let (outcome, warned) = self.outcome(plan, entry.submission_id, &entry.field, op, result);
            report.record(outcome, warned);
        }

        if prune && self.config.prune_orphans && !report.interrupted {
            self.prune_orphans(plan, &mut report, &claimed).await;
        }
        report
    }

    fn outcome(
        &self,
        plan: &AssetPlan,
        submission_id: i64,
        field: &str,
        op: SyncOp,
        result: Result<Done, SyncError>,
    ) -> (ItemOutcome, bool) {
        match result {
            Ok(done) => {
                match done.op {
                    SyncOp::UpToDate => tracing::debug!(
                        asset = %plan.uid,
                        submission_id,
                        field,
                        "{}",
                        done.detail
                    ),
                    _ => tracing::info!(
                        asset = %plan.uid,
                        submission_id,
                        field,
                        "{}",
                        done.detail
                    ),
                }
                (
                    ItemOutcome {
                        submission_id,
                        field: field.to_string(),
                        status: ItemStatus::Ok,
                        op: done.op,
                        path: done.path,
                        detail: done.detail,
                    },
                    done.warned,
                )
            }
            Err(e) => {
                tracing::error!(
                    asset = %plan.uid,
                    submission_id,
                    field,
                    "{}",
                    e
                );
                (
                    ItemOutcome {
                        submission_id,
                        field: field.to_string(),
                        status: ItemStatus::Error,
                        op,
                        path: None,
                        detail: e.to_string(),
                    },
                    false,
                )
            }
        }
    }

    fn image_path(&self, plan: &AssetPlan, image_name: &str) -> PathBuf {
        paths::image_path(&self.config.dirs.images, &plan.uid, &plan.name, image_name)
    }

    fn manifest_path(&self, plan: &AssetPlan, submission_id: i64, field: &str) -> PathBuf {
        paths::manifest_path(&self.config.dirs.manifests, &plan.uid, submission_id, field)
    }

    async fn keep(
        &self,
        plan: &AssetPlan,
        entry: &ActionEntry,
        attachment: &Attachment,
        value: &str,
        claimed: &HashSet<String>,
    ) -> Result<Done, SyncError> {
        let image_name = paths::image_name(entry.submission_id, value);
        let image_path = self.image_path(plan, &image_name);
        let manifest_path = self.manifest_path(plan, entry.submission_id, &entry.field);

        let prior = match manifest::read(&manifest_path).await {
            Ok(m) => m,
            Err(e @ SyncError::CorruptManifest { .. }) => {
                tracing::warn!("{}; downloading again", e);
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(m) = &prior {
            if m.describes(&image_name, attachment.id)
                && store::verify_hash(&image_path, &m.hash).await?
            {
                return Ok(Done {
                    op: SyncOp::UpToDate,
                    path: Some(image_path),
                    detail: format!("Up to date (attachment {})", attachment.id),
                    warned: false,
                });
            }
        }

        let url = self.api.media_url(&attachment.download_url);
        let hash =
            file::download_image(self.api.fetcher(), &url, &image_path, &self.config.download)
                .await?;
        let manifest = AttachmentManifest::new(
            image_name.clone(),
            value.to_string(),
            attachment.id,
            hash,
        );
        manifest::write(&manifest_path, &manifest).await?;

        let mut detail = format!("Downloaded attachment {} ({})", attachment.id, hash);
        let mut warned = false;
        if let Some(stale) = prior.filter(|m| m.image_name != image_name) {
            let stale_path = self.image_path(plan, &stale.image_name);
            // `Err(None)`: another field of this map now writes that name.
            let result = if claimed.contains(&stale.image_name) {
                Err(None)
            } else {
                self.retire(plan, &stale_path, &stale.hash).await.map_err(Some)
            };
            match result {
                Ok(true) => detail.push_str(&format!("; retired stale {}", stale.image_name)),
                Ok(false) => {}
                Err(None) => detail.push_str(&format!(
                    "; stale {} left in place, another field now targets it",
                    stale.image_name
                )),
                Err(Some(e)) => {
                    tracing::warn!("Stale image {} left in place: {}", stale_path.display(), e);
                    detail.push_str(&format!("; stale {} left in place: {}", stale.image_name, e));
                    warned = true;
                }
            }
        }

        Ok(Done {
            op: SyncOp::Download,
            path: Some(image_path),
            detail,
            warned,
        })
    }

    /// Retire the image and manifest of one field. An image another field
    /// of the current map targets is left in place; only the manifest goes.
    async fn delete(
        &self,
        plan: &AssetPlan,
        submission_id: i64,
        field: &str,
        claimed: &HashSet<String>,
    ) -> Result<Done, SyncError> {
        let manifest_path = self.manifest_path(plan, submission_id, field);
        let Some(m) = manifest::read(&manifest_path).await? else {
            return Ok(Done {
                op: SyncOp::SkipInconsistent,
                path: None,
                detail: "No manifest; nothing to delete".to_string(),
                warned: false,
            });
        };

        let image_path = self.image_path(plan, &m.image_name);
        let in_use = claimed.contains(&m.image_name);
        let retired = if in_use {
            false
        } else {
            self.retire(plan, &image_path, &m.hash).await?
        };
        store::remove(&manifest_path).await?;
        if let Some(dir) = manifest_path.parent() {
            store::remove_empty_dir(dir).await?;
        }

        let detail = match (retired, self.config.hard_delete) {
            _ if in_use => format!(
                "{} left in place, another field now targets it; manifest retired",
                m.image_name
            ),
            (false, _) => format!("{} already absent; manifest retired", m.image_name),
            (true, true) => format!("Deleted {}", m.image_name),
            (true, false) => format!("Moved {} to the deleted-images area", m.image_name),
        };
        Ok(Done {
            op: SyncOp::Delete,
            path: Some(image_path),
            detail,
            warned: false,
        })
    }

    /// Move (or remove) an image after proving it is the file its manifest
    /// describes. `Ok(false)` when the image is already gone.
    async fn retire(&self, plan: &AssetPlan, path: &Path, hash: &ContentHash) -> Result<bool, SyncError> {
        match store::exists(path).await? {
            PathKind::Missing => return Ok(false),
            PathKind::Dir => return Err(SyncError::NotAFile(path.display().to_string())),
            PathKind::File => {}
        }
        if !store::verify_hash(path, hash).await? {
            return Err(SyncError::Integrity {
                path: path.display().to_string(),
            });
        }
        if self.config.hard_delete {
            store::remove(path).await?;
        } else {
            let holding = paths::asset_dir(&self.config.dirs.deleted, &plan.uid, &plan.name)
                .join(path.file_name().unwrap_or_default());
            store::move_path(path, &holding).await?;
        }
        Ok(true)
    }

    /// Retire manifests of submissions the server no longer returns.
    async fn prune_orphans(
        &self,
        plan: &AssetPlan,
        report: &mut AssetReport,
        claimed: &HashSet<String>,
    ) {
        let asset_root = self
            .config
            .dirs
            .manifests
            .join(paths::clean_component(&plan.uid));
        let known: HashSet<i64> = plan.submission_ids.iter().copied().collect();

        let orphans = match orphan_manifests(&asset_root, &known).await {
            Ok(orphans) => orphans,
            Err(e) => {
                tracing::warn!("Orphan pruning skipped for {}: {}", plan.uid, e);
                report.counters.warnings += 1;
                return;
            }
        };
        if !orphans.is_empty() {
            tracing::info!(
                asset = %plan.uid,
                "Pruning {} manifest(s) of submissions no longer on the server",
                orphans.len()
            );
        }
        for (submission_id, field) in orphans {
            if self.shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let result = self.delete(plan, submission_id, &field, claimed).await;
            let (outcome, warned) = self.outcome(plan, submission_id, &field, SyncOp::Delete, result);
            report.record(outcome, warned);
        }
    }
}

/// `(submission id, field)` of every manifest under `asset_root` whose
/// submission id is not in `known`, in id then field order.
async fn orphan_manifests(
    asset_root: &Path,
    known: &HashSet<i64>,
) -> Result<Vec<(i64, String)>, store::StoreError> {
    let mut ids: Vec<i64> = store::list_dir(asset_root)
        .await?
        .into_iter()
        .filter(|(_, kind)| *kind == PathKind::Dir)
        .filter_map(|(name, _)| name.parse::<i64>().ok())
        .filter(|id| !known.contains(id))
        .collect();
    ids.sort_unstable();

    let mut orphans = Vec::new();
    for id in ids {
        for (name, kind) in store::list_dir(&asset_root.join(id.to_string())).await? {
            if kind != PathKind::File {
                continue;
            }
            if let Some(field) = name.strip_suffix(".json") {
                orphans.push((id, field.to_string()));
            }
        }
    }
    Ok(orphans)
}

/// Keep entries of one submission that would write the same file, mapped
/// to one of the other fields claiming that name.
fn duplicate_targets(entries: &[ActionEntry]) -> HashMap<(i64, &str), &str> {
    let mut claims: HashMap<(i64, String), Vec<&str>> = HashMap::new();
    for e in entries {
        if let (Action::Keep, Some(value)) = (e.action, &e.desired_value) {
            claims
                .entry((e.submission_id, paths::image_name(e.submission_id, value)))
                .or_default()
                .push(e.field.as_str());
        }
    }

    let mut duplicates = HashMap::new();
    for ((submission_id, _), fields) in claims {
        if fields.len() < 2 {
            continue;
        }
        for (i, field) in fields.iter().enumerate() {
            let other = fields[(i + 1) % fields.len()];
            duplicates.insert((submission_id, *field), other);
        }
    }
    duplicates
}

/// Image names that `Keep` entries of the map will write.
fn claimed_names(entries: &[ActionEntry]) -> HashSet<String> {
    entries
        .iter()
        .filter(|e| e.action == Action::Keep)
        .filter_map(|e| {
            e.desired_value
                .as_deref()
                .map(|value| paths::image_name(e.submission_id, value))
        })
        .collect()
}

/// Aggregate of every asset processed in stage 5.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub totals: SyncCounters,
    pub assets: Vec<AssetReport>,
}

impl SyncSummary {
    pub fn push(&mut self, report: AssetReport) {
        self.totals += report.counters;
        self.assets.push(report);
    }

    pub fn interrupted(&self) -> bool {
        self.assets.iter().any(|a| a.interrupted)
    }
}
