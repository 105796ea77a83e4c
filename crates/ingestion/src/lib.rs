mod pipeline;
mod pull;
mod webhook;

pub use pipeline::{BatchSummary, IngestPipeline};
pub use pull::{PullSummary, PullSync};
pub use webhook::parse_push_batch;
