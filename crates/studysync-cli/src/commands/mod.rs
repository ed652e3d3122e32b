pub mod common;
pub mod completions;
pub mod config;
pub mod doc;
pub mod queue;
pub mod sources;
pub mod sync;
