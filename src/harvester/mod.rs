//! Harvesting engine: scheduling, fetching, crawl jobs and repair

pub mod checkpoint;
pub mod fetcher;
pub mod orchestrator;
pub mod repair;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use checkpoint::{
    read_checkpoint, CheckpointSink, CrawlCheckpoint, CrawlStatus, FileCheckpointSink,
    MemoryCheckpointSink,
};
pub use fetcher::{FetcherConfig, FetcherMetrics, RecordFetcher};
pub use orchestrator::{CrawlOrchestrator, CrawlReport, CrawlSettings};
pub use repair::{RecordValidity, RepairReport, ScanReport, ValidationRepair};
pub use scheduler::{AdaptiveScheduler, SchedulerConfig, SchedulerSnapshot};
