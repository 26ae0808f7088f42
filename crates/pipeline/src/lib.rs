//! camreel Pipeline
//!
//! The worker orchestrator and its two external collaborators:
//! - **Orchestrator:** owns the job queue, runs one stage at a time on the
//!   blocking pool, and reports progress as events
//! - **Stages:** download (fetch + fan-out), convert (drift scan, encoder
//!   resolution, transcode, publish copy, upload), merge
//! - **Fetch:** copying complete recordings off a camera
//! - **Publish:** handing finished files to an uploader

pub mod fetch;
pub mod publish;
pub mod stages;
pub mod worker;

pub use fetch::{CameraSource, DirectoryFetcher, FetchError, Fetcher};
pub use publish::{CommandPublisher, PublishError, Publisher};
pub use stages::{ConvertOutcome, DownloadOutcome, StageContext, StageUpdate};
pub use worker::{
    OrchestratorBuilder, OrchestratorHandle, PipelineError, PipelineResult, EVENT_CAPACITY,
};
