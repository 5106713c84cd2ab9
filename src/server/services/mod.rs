pub mod app_services;
pub mod manifest_services;
pub mod prefetch_services;
pub mod relay_cache_services;

pub use app_services::AppServices;
pub use manifest_services::DynManifestService;
pub use prefetch_services::SegmentStream;
