mod relay_context_extractor;

pub use relay_context_extractor::*;
