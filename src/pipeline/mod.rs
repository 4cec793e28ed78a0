//! The five-stage run: list assets, fetch their image fields, fetch
//! submissions, build action maps, and reconcile the image tree.
//!
//! Stages run strictly in order. Each stage's result is written to
//! `steps/step<N>.json` in the run directory before the next one starts.
//! An empty result ends the run early without error; a stage that cannot
//! produce any result aborts it.

pub mod error;
pub mod layout;

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use self::error::PipelineError;
use self::layout::OutputLayout;
use crate::config::Config;
use crate::kobo::paginator::ListingReport;
use crate::kobo::types::{Asset, AssetSummary, Submission};
use crate::kobo::{ApiError, KoboApi};
use crate::progress::create_progress_bar;
use crate::sync::action_map::{self, Action, AssetPlan};
use crate::sync::file::DownloadOptions;
use crate::sync::{SyncConfig, SyncCounters, SyncExecutor, SyncSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Complete,
    Failed,
    Interrupted,
}

/// An asset dropped by stage 2 or 3.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetFailure {
    pub uid: String,
    pub endpoint: Option<String>,
    pub error: String,
}

impl AssetFailure {
    fn new(uid: &str, error: &ApiError) -> Self {
        let endpoint = match error {
            ApiError::Network(e) => Some(e.endpoint().to_string()),
            _ => None,
        };
        Self {
            uid: uid.to_string(),
            endpoint,
            error: error.to_string(),
        }
    }
}

/// Stage 3 result for one asset.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSubmissions {
    pub asset: Asset,
    pub submissions: Vec<Submission>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StageSnapshot<'a, T: Serialize + ?Sized> {
    stage: u8,
    status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    listing: Option<&'a ListingReport>,
    failures: &'a [AssetFailure],
    results: &'a T,
}

/// How a run that did not abort ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed(SyncSummary),
    /// A stage produced nothing for the next one to work on.
    Stopped { stage: u8, reason: &'static str },
    /// Shutdown was requested between stages.
    Interrupted { stage: u8 },
}

pub struct Pipeline<'a> {
    api: &'a KoboApi,
    config: &'a Config,
    layout: OutputLayout,
    shutdown: CancellationToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        api: &'a KoboApi,
        config: &'a Config,
        layout: OutputLayout,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            config,
            layout,
            shutdown,
        }
    }

    pub async fn run(&self) -> Result<PipelineOutcome, PipelineError> {
        let started = Instant::now();
        tracing::info!("Run directory: {}", self.layout.run_dir().display());

        tracing::info!("── Stage 1: listing assets ──");
        let summaries = self.list_assets().await?;
        if summaries.is_empty() {
            return Ok(stopped(1, "no assets to process"));
        }
        if self.shutdown.is_cancelled() {
            return Ok(interrupted(1));
        }

        tracing::info!("── Stage 2: fetching image fields ──");
        let assets = self.fetch_assets(summaries).await?;
        if self.shutdown.is_cancelled() {
            return Ok(interrupted(2));
        }
        if assets.is_empty() {
            return Ok(stopped(2, "no assets with submissions"));
        }

        tracing::info!("── Stage 3: fetching submissions ──");
        let batches = self.fetch_submissions(assets).await?;
        if self.shutdown.is_cancelled() {
            return Ok(interrupted(3));
        }
        if batches.is_empty() {
            return Ok(stopped(3, "no assets with image fields"));
        }

        tracing::info!("── Stage 4: building action maps ──");
        let plans = self.build_plans(&batches).await?;
        if self.shutdown.is_cancelled() {
            return Ok(interrupted(4));
        }

        tracing::info!("── Stage 5: synchronizing images ──");
        let summary = self.sync_images(&plans).await?;
        log_totals(&summary.totals, started.elapsed());
        Ok(PipelineOutcome::Completed(summary))
    }

    async fn snapshot<T: Serialize + ?Sized>(
        &self,
        stage: u8,
        status: StageStatus,
        listing: Option<&ListingReport>,
        failures: &[AssetFailure],
        results: &T,
    ) -> Result<(), PipelineError> {
        self.layout
            .write_snapshot(
                stage,
                &StageSnapshot {
                    stage,
                    status,
                    listing,
                    failures,
                    results,
                },
            )
            .await?;
        Ok(())
    }

    fn status(&self, failures: &[AssetFailure], any_ok: bool) -> StageStatus {
        if self.shutdown.is_cancelled() {
            StageStatus::Interrupted
        } else if !failures.is_empty() && !any_ok {
            StageStatus::Failed
        } else {
            StageStatus::Complete
        }
    }

    /// Stage 1. An incomplete listing is snapshotted and then aborts the run.
    async fn list_assets(&self) -> Result<Vec<AssetSummary>, PipelineError> {
        let uids = self.config.asset_uids();
        let pb = create_progress_bar(self.config.no_progress_bar, 0);
        let listing = self.api.list_assets(&uids, &pb).await;
        pb.finish_and_clear();
        let listing = listing.map_err(PipelineError::Listing)?;

        let complete = listing.report.is_complete();
        let status = if complete {
            StageStatus::Complete
        } else {
            StageStatus::Failed
        };
        self.snapshot(1, status, Some(&listing.report), &[], &listing.assets)
            .await?;

        if !complete {
            return Err(PipelineError::ListingIncomplete {
                pages: listing.report.pages,
                fetched: listing.report.fetched,
                detail: listing.report.detail.clone().unwrap_or_default(),
            });
        }
        for uid in &uids {
            if !listing.assets.iter().any(|a| &a.uid == uid) {
                tracing::warn!("Asset {} was not returned by the server", uid);
            }
        }
        tracing::info!(
            "  {} asset(s) selected, {} on the server",
            listing.assets.len(),
            listing.report.advertised
        );
        Ok(listing.assets)
    }

    /// Stage 2. Assets without submissions are skipped; an asset whose
    /// detail cannot be fetched is dropped and recorded.
    async fn fetch_assets(&self, summaries: Vec<AssetSummary>) -> Result<Vec<Asset>, PipelineError> {
        let mut assets = Vec::new();
        let mut failures = Vec::new();

        for summary in summaries {
            if self.shutdown.is_cancelled() {
                break;
            }
            if summary.submission_count == 0 {
                tracing::info!("  Skipping {} ({}): no submissions", summary.uid, summary.name);
                continue;
            }
            let uid = summary.uid.clone();
            match self.api.asset(summary).await {
                Ok(asset) => {
                    tracing::info!(
                        "  {} ({}): {} image field(s), {} submission(s)",
                        asset.uid,
                        asset.name,
                        asset.image_fields.len(),
                        asset.submission_count
                    );
                    assets.push(asset);
                }
                Err(e) => {
                    tracing::error!("  {}: {}", uid, e);
                    failures.push(AssetFailure::new(&uid, &e));
                }
            }
        }

        let status = self.status(&failures, !assets.is_empty());
        self.snapshot(2, status, None, &failures, &assets).await?;
        all_failed_check(2, &failures, assets.is_empty())?;
        Ok(assets)
    }

    /// Stage 3. Assets without image fields are skipped; submission fetch
    /// failures drop the asset and are recorded.
    async fn fetch_submissions(
        &self,
        assets: Vec<Asset>,
    ) -> Result<Vec<AssetSubmissions>, PipelineError> {
        let mut batches = Vec::new();
        let mut failures = Vec::new();

        for asset in assets {
            if self.shutdown.is_cancelled() {
                break;
            }
            if asset.image_fields.is_empty() {
                tracing::info!("  Skipping {} ({}): no image fields", asset.uid, asset.name);
                continue;
            }
            let filter = self.config.submission_filter(&asset.uid);
            match self.api.submissions(&asset, filter).await {
                Ok(submissions) => {
                    for id in filter {
                        if !submissions.iter().any(|s| s.id == *id) {
                            tracing::warn!("  {}: submission {} was not returned", asset.uid, id);
                        }
                    }
                    tracing::info!("  {}: {} submission(s)", asset.uid, submissions.len());
                    batches.push(AssetSubmissions { asset, submissions });
                }
                Err(e) => {
                    tracing::error!("  {}: {}", asset.uid, e);
                    failures.push(AssetFailure::new(&asset.uid, &e));
                }
            }
        }

        let status = self.status(&failures, !batches.is_empty());
        self.snapshot(3, status, None, &failures, &batches).await?;
        all_failed_check(3, &failures, batches.is_empty())?;
        Ok(batches)
    }

    /// Stage 4. Pure; a structural inconsistency aborts the run.
    async fn build_plans(&self, batches: &[AssetSubmissions]) -> Result<Vec<AssetPlan>, PipelineError> {
        let mut plans = Vec::with_capacity(batches.len());
        for batch in batches {
            let plan = match action_map::build_action_map(&batch.asset, &batch.submissions) {
                Ok(plan) => plan,
                Err(e) => {
                    self.snapshot(4, StageStatus::Failed, None, &[], &plans)
                        .await?;
                    return Err(e.into());
                }
            };
            for warning in &plan.warnings {
                tracing::warn!("  {}: {}", plan.uid, warning);
            }
            tracing::info!(
                "  {}: {} keep, {} delete, {} unresolved",
                plan.uid,
                plan.count(Action::Keep),
                plan.count(Action::Delete),
                plan.count(Action::None)
            );
            plans.push(plan);
        }
        self.snapshot(4, StageStatus::Complete, None, &[], &plans)
            .await?;
        Ok(plans)
    }

    /// Stage 5. Item failures are counted in the summary and never abort.
    async fn sync_images(&self, plans: &[AssetPlan]) -> Result<SyncSummary, PipelineError> {
        let sync_config = SyncConfig {
            dirs: self.layout.sync_dirs(),
            download: DownloadOptions {
                max_attempts: self.config.max_download_retries,
                idle_timeout: self.config.download_timeout,
                no_progress_bar: self.config.no_progress_bar,
            },
            hard_delete: self.config.delete_images,
            prune_orphans: self.config.prune_orphans,
        };
        let executor = SyncExecutor::new(self.api, &sync_config, self.shutdown.clone());

        let mut summary = SyncSummary::default();
        for plan in plans {
            if self.shutdown.is_cancelled() {
                break;
            }
            // Pruning needs the full submission list to know what is gone.
            let prune = self.config.submission_filter(&plan.uid).is_empty();
            let report = executor.run_asset(plan, prune).await;
            tracing::info!("── Summary: {} ({}) ──", report.uid, report.name);
            log_counters(&report.counters);
            summary.push(report);
        }

        let status = if self.shutdown.is_cancelled() || summary.interrupted() {
            StageStatus::Interrupted
        } else {
            StageStatus::Complete
        };
        self.snapshot(5, status, None, &[], &summary).await?;
        Ok(summary)
    }
}

fn stopped(stage: u8, reason: &'static str) -> PipelineOutcome {
    PipelineOutcome::Stopped { stage, reason }
}

fn interrupted(stage: u8) -> PipelineOutcome {
    PipelineOutcome::Interrupted { stage }
}

fn all_failed_check(stage: u8, failures: &[AssetFailure], no_results: bool) -> Result<(), PipelineError> {
    match failures.first() {
        Some(first) if no_results => Err(PipelineError::AllAssetsFailed {
            stage,
            failed: failures.len(),
            first: match &first.endpoint {
                Some(endpoint) => format!("{} ({})", first.error, endpoint),
                None => first.error.clone(),
            },
        }),
        _ => Ok(()),
    }
}

fn log_counters(c: &SyncCounters) {
    tracing::info!(
        "  {} kept, {} downloaded, {} deleted, {} skipped",
        c.kept,
        c.downloaded,
        c.deleted,
        c.skipped
    );
    tracing::info!("  {} warning(s), {} error(s)", c.warnings, c.errors);
}

fn log_totals(totals: &SyncCounters, elapsed: Duration) {
    tracing::info!("── Summary ──");
    log_counters(totals);
    tracing::info!("  elapsed: {}", format_duration(elapsed));
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
