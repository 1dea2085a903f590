//! Bronze-to-silver pipeline for the EU clinical trials register.

pub mod config;
pub mod fetch;
pub mod harvest;
pub mod loader;
pub mod orchestrator;
pub mod staging;
pub mod transform;

pub use config::PipelineConfig;
pub use fetch::{FetchOutcome, Fetcher};
pub use harvest::{HarvestRequest, Harvester};
pub use loader::{BigQueryLoader, BigQueryTarget, LoadError, LoadMode, Loader};
pub use orchestrator::{
    build_content_store, build_loader, BronzeOptions, BronzePhase, BronzeSummary, PendingLedger,
    SilverPhase, SilverSummary, WarehouseTarget,
};
pub use staging::LoadBatch;
pub use transform::{select_window, TransformOutput, TransformStage};

pub const CRATE_NAME: &str = "ctr-sync";
