pub mod canonical;
pub mod config;
pub mod error;
pub mod server;
pub mod sse;
pub mod translate;
pub mod upstream;
pub mod usage;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use server::{build_router, AppState, GatewayOptions};
pub use upstream::{ChunkStream, GenerationClient, ModelCatalog, RequestContext};
pub use usage::{UsageRecord, UsageSink};
