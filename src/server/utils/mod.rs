pub mod header_utils;
pub mod manifest_utils;
pub mod url_utils;

pub use header_utils::UpstreamHeaders;
