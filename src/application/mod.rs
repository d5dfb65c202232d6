//! Orchestration: the render queue, the engine pool and the workers.

pub mod error;
pub mod jobs;
pub mod render;
pub mod repos;
