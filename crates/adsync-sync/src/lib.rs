//! Destination side of the insights sync: schema growth, window-scoped upserts
//! and the pipeline that drives a whole run.

pub mod config;
pub mod destination;
pub mod memory;
pub mod pipeline;
pub mod postgres;
pub mod quality;
pub mod schema;
pub mod writer;

pub use config::{ReportConfig, ReportRegistry, SyncConfig};
pub use destination::{ColumnInfo, Destination, DestinationError, WindowWrite};
pub use memory::MemoryDestination;
pub use pipeline::{
    build_graph_api, load_saved_page, run_sync_once_from_env, run_sync_schema_from_env,
    AccountSummary, ReportRunSummary, SkipReason, SyncPipeline, SyncRunSummary,
};
pub use postgres::PgDestination;
pub use quality::QualitySummary;
pub use schema::{KnownColumns, SchemaSyncReport, SchemaSynchronizer};
pub use writer::{UpsertWriter, WriteOutcome};

pub const CRATE_NAME: &str = "adsync-sync";
