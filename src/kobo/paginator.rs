//! Cursor-following listing: fetch pages until `next` is null, projecting
//! each page before accumulating it.

use std::future::Future;

use indicatif::ProgressBar;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::error::{NetworkError, ProjectionError, StructuralError};
use super::projection::Projection;

/// One page of a listing endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Value>,
    pub next: Option<String>,
    pub count: u64,
}

impl Page {
    pub fn from_value(value: Value) -> Result<Self, StructuralError> {
        let Value::Object(mut obj) = value else {
            return Err(StructuralError::NotAnObject {
                context: "listing page".to_string(),
            });
        };
        let records = match obj.remove("results") {
            Some(Value::Array(records)) => records,
            _ => return Err(StructuralError::field("listing page", "results", "array")),
        };
        let next = match obj.remove("next") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(StructuralError::field("listing page", "next", "url or null")),
        };
        let count = match obj.get("count") {
            None | Some(Value::Null) => records.len() as u64,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| StructuralError::field("listing page", "count", "integer"))?,
        };
        Ok(Self {
            records,
            next,
            count,
        })
    }
}

/// A page that could not be obtained. Stops the listing without failing it.
#[derive(Error, Debug)]
pub enum PageError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("malformed page: {0}")]
    Malformed(#[from] StructuralError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Complete,
    Failed,
}

/// Observability counters for a listing. `advertised` is the server's
/// `count`; `fetched` and `kept` count records before and after projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingReport {
    pub status: ListingStatus,
    pub detail: Option<String>,
    pub pages: u32,
    pub advertised: u64,
    pub fetched: u64,
    pub kept: u64,
}

#[derive(Debug)]
pub struct Listing {
    pub records: Vec<Value>,
    pub report: ListingReport,
}

impl ListingReport {
    pub fn is_complete(&self) -> bool {
        self.status == ListingStatus::Complete
    }
}

/// Follow `next` links from `start_url` until exhausted.
///
/// A page that cannot be fetched ends the walk and the partial result is
/// returned with [`ListingStatus::Failed`]. Projection failures are hard
/// errors.
pub async fn list_all<F, Fut>(
    start_url: &str,
    mut fetch_page: F,
    projection: &dyn Projection,
    pb: &ProgressBar,
) -> Result<Listing, ProjectionError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Page, PageError>>,
{
    let mut records = Vec::new();
    let mut report = ListingReport {
        status: ListingStatus::Complete,
        detail: None,
        pages: 0,
        advertised: 0,
        fetched: 0,
        kept: 0,
    };
    let mut url = Some(start_url.to_string());

    while let Some(current) = url.take() {
        let page = match fetch_page(current.clone()).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!("Listing stopped at {}: {}", current, e);
                report.status = ListingStatus::Failed;
                report.detail = Some(e.to_string());
                break;
            }
        };
        report.pages += 1;
        report.advertised = page.count;
        report.fetched += page.records.len() as u64;
        pb.set_length(page.count);
        pb.inc(page.records.len() as u64);

        let projected = projection.project(page.records)?;
        report.kept += projected.len() as u64;
        records.extend(projected);

        tracing::debug!(
            page = report.pages,
            fetched = report.fetched,
            advertised = report.advertised,
            kept = report.kept,
            "Fetched listing page"
        );
        url = page.next;
    }

    Ok(Listing { records, report })
}
