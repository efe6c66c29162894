//! Network and filesystem stages of the pipeline.

pub mod extract;
pub mod fetch;
pub mod verify;
