//! Remote calls for pipeline stages 1-3 and the download URL scheme of
//! stage 5.

use indicatif::ProgressBar;
use serde_json::Value;

use super::error::{ApiError, StructuralError};
use super::fetcher::Fetcher;
use super::paginator::{self, ListingReport, Page, PageError};
use super::projection::{Projection, SelectProject};
use super::types::{Asset, AssetSummary, Submission};

/// Page size requested from the asset listing endpoint.
pub const ASSET_PAGE_SIZE: u32 = 100;

/// Keys of a listing entry the pipeline reads.
const ASSET_LISTING_KEYS: [&str; 3] = ["uid", "name", "deployment__submission_count"];

#[derive(Debug)]
pub struct AssetListing {
    pub assets: Vec<AssetSummary>,
    pub report: ListingReport,
}

#[derive(Debug, Clone)]
pub struct KoboApi {
    fetcher: Fetcher,
    api_base: String,
    media_base: String,
}

impl KoboApi {
    pub fn new(fetcher: Fetcher, api_server_url: &str, media_server_url: &str) -> Self {
        Self {
            fetcher,
            api_base: api_server_url.trim_end_matches('/').to_string(),
            media_base: media_server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn assets_url(&self) -> String {
        format!(
            "{}/assets/?limit={}&offset=0",
            self.api_base, ASSET_PAGE_SIZE
        )
    }

    pub fn asset_url(&self, uid: &str) -> String {
        format!("{}/assets/{}/", self.api_base, uid)
    }

    pub fn submissions_url(&self, uid: &str) -> String {
        format!("{}/assets/{}/submissions/", self.api_base, uid)
    }

    /// Attachment URLs are usually relative to the media server.
    pub fn media_url(&self, download_url: &str) -> String {
        if download_url.starts_with("http://") || download_url.starts_with("https://") {
            download_url.to_string()
        } else {
            format!(
                "{}/{}",
                self.media_base,
                download_url.trim_start_matches('/')
            )
        }
    }

    /// Stage 1: walk the asset listing, keeping only `uids` when non-empty.
    ///
    /// A listing that stops early is returned with a failed report; the
    /// caller decides whether partial results are usable.
    pub async fn list_assets(
        &self,
        uids: &[String],
        pb: &ProgressBar,
    ) -> Result<AssetListing, ApiError> {
        let projection = SelectProject::new()
            .select_in("uid", uids.iter().map(|u| Value::String(u.clone())))
            .keep_keys(&ASSET_LISTING_KEYS);

        let listing = paginator::list_all(
            &self.assets_url(),
            |url| async move {
                let value = self.fetcher.json(&url).await?;
                Page::from_value(value).map_err(PageError::from)
            },
            &projection,
            pb,
        )
        .await?;

        let assets = listing
            .records
            .iter()
            .map(AssetSummary::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AssetListing {
            assets,
            report: listing.report,
        })
    }

    /// Stage 2: fetch the asset detail and extract its image fields.
    pub async fn asset(&self, summary: AssetSummary) -> Result<Asset, ApiError> {
        let detail = self.fetcher.json(&self.asset_url(&summary.uid)).await?;
        Ok(Asset::from_detail(summary, &detail)?)
    }

    /// Stage 3: fetch the submissions of `asset`, keeping only `ids` when
    /// non-empty, and build each submission's images map.
    ///
    /// Deployments either return a bare array or a listing page. Every page
    /// of a listing is followed; a listing that stops early is an error so
    /// no caller ever mistakes a partial list for the full one.
    pub async fn submissions(&self, asset: &Asset, ids: &[i64]) -> Result<Vec<Submission>, ApiError> {
        let context = format!("asset {} submissions", asset.uid);
        let projection = SelectProject::new().select_in("_id", ids.iter().map(|&id| Value::from(id)));

        let records = match self.fetcher.json(&self.submissions_url(&asset.uid)).await? {
            Value::Array(records) => projection.project(records)?,
            value @ Value::Object(_) => {
                let first = Page::from_value(value)?;
                let mut records = projection.project(first.records)?;
                if let Some(next) = first.next {
                    let rest = paginator::list_all(
                        &next,
                        |url| async move {
                            let value = self.fetcher.json(&url).await?;
                            Page::from_value(value).map_err(PageError::from)
                        },
                        &projection,
                        &ProgressBar::hidden(),
                    )
                    .await?;
                    if !rest.report.is_complete() {
                        return Err(ApiError::IncompleteListing {
                            context,
                            pages: rest.report.pages + 1,
                            detail: rest.report.detail.unwrap_or_default(),
                        });
                    }
                    records.extend(rest.records);
                }
                records
            }
            _ => return Err(StructuralError::NotAnObject { context }.into()),
        };

        let submissions = records
            .iter()
            .map(|r| Submission::from_value(r, &asset.image_fields, &asset.uid))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(
            asset = %asset.uid,
            count = submissions.len(),
            "Fetched submissions"
        );
        Ok(submissions)
    }
}
