//! camreel Processing Core
//!
//! File-level analysis that runs before and after transcoding:
//! - **Drift Scanner:** count the frames a raw MJPEG recording really holds
//!   and derive the input frame rate that keeps it in sync with its audio
//! - **Merge Planner:** group multi-part recordings of one event and lay out
//!   the concatenation with title cards
//! - **Audio pairing:** find the WAV recorded next to a video
//!
//! Nothing here launches external processes; the transcode crate does.

pub mod audio;
pub mod drift;
pub mod merge_plan;

pub use audio::find_audio;
pub use drift::{
    DriftConfig, DriftReport, DriftScanner, DurationProbe, ScanError, ScanProgress, WavHeaderProbe,
};
pub use merge_plan::{
    plan, ConcatPlan, MergeCandidate, MergeGroup, MergePart, MergePlan, Segment, TitleCard,
};
