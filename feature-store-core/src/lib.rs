pub mod artifact_store;
pub mod config;
pub mod dataset;
pub mod error;
pub mod feature_store;
pub mod model;
pub mod observer;
pub mod profiler;
pub mod registry;
