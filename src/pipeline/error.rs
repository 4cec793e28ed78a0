use thiserror::Error;

use crate::kobo::{ApiError, StructuralError};
use crate::store::StoreError;

/// A stage failure that aborts the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage 1: asset listing incomplete after {pages} page(s), {fetched} record(s): {detail}")]
    ListingIncomplete {
        pages: u32,
        fetched: u64,
        detail: String,
    },

    #[error("Stage 1: {0}")]
    Listing(#[source] ApiError),

    #[error("Stage {stage}: all {failed} asset(s) failed; first failure: {first}")]
    AllAssetsFailed {
        stage: u8,
        failed: usize,
        first: String,
    },

    #[error("Stage 4: {0}")]
    Structural(#[from] StructuralError),

    #[error("Failed to write snapshot {path}: {source}")]
    Snapshot {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
