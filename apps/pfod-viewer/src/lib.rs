pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod protocol;
pub mod sync;
pub mod telemetry;
pub mod view;
