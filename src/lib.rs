pub mod changefeed;
pub mod cluster;
pub mod config;
pub mod entities;
pub mod fetcher;
pub mod fingerprint;
pub mod headline;
pub mod normalize;
pub mod parser;
pub mod scheduler;
pub mod similarity;
pub mod sources;
pub mod status;
pub mod store;
pub mod types;

pub use changefeed::ChangeFeedWorker;
pub use cluster::ClusteringEngine;
pub use config::PipelineConfig;
pub use headline::{HeadlineSynthesizer, MockHeadlineSynthesizer, ModelHeadlineSynthesizer};
pub use scheduler::IngestionScheduler;
pub use store::{DocumentStore, MemoryStore, PgStore};
pub use types::*;
