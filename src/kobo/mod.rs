//! KoBoToolbox client: transport seam, retrying fetcher, listing and the
//! typed payloads the sync pipeline consumes.

pub mod api;
pub mod error;
pub mod fetcher;
pub mod paginator;
pub mod projection;
pub mod session;
pub mod types;

pub use api::KoboApi;
pub use error::{ApiError, NetworkError, StructuralError};
pub use fetcher::Fetcher;
