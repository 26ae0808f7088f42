//! camreel Transcode
//!
//! Everything that talks to the external transcoder:
//! - Capability probing for hardware encoding (four-step diagnosis, cached)
//! - Encoder resolution and codec argument construction
//! - Process supervision with progress parsing and cancellation
//! - Merge execution (title cards + stream-copy concatenation)
//! - ffprobe helpers

pub mod encoder;
pub mod media;
pub mod merge;
pub mod probe;
pub mod supervisor;

pub use encoder::{build_encoder_args, resolve, resolve_with_rate, EncoderChoice};
pub use media::{expected_duration, probe_duration, probe_resolution, FfprobeDurationProbe};
pub use merge::{MergeExecutor, MergeOutcome};
pub use probe::{CapabilityCache, CapabilityProber, CapabilityReport, ProbeStep};
pub use supervisor::{
    publish_copy_path, publish_copy_request, AudioSpec, InputSpec, Outcome, TranscodeProgress,
    TranscodeRequest, TranscodeSupervisor,
};
