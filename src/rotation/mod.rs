//! Rotation: batched, resumable re-encryption of the image population.

mod engine;
mod progress;
mod worker;

pub use engine::RotationEngine;
pub use progress::RotationProgressReporter;
