//! camreel Job Model
//!
//! Defines the core data contracts of the job pipeline:
//! - **Job:** one unit of work (a camera download or a file conversion)
//! - **Status:** the state machine every job moves through
//! - **Queue:** the ordered, duplicate-free list of jobs with the
//!   single-active-job rule
//! - **Snapshot:** the opaque persisted form of the queue
//! - **Events:** the observation-only progress surface
//!
//! Jobs spawned from a download copy their publish metadata at spawn time;
//! no job holds a reference to another.

pub mod event;
pub mod job;
pub mod queue;
pub mod snapshot;

pub use event::*;
pub use job::*;
pub use queue::*;
pub use snapshot::*;
