// Multi-round tiled inference pipeline

pub mod backend;
pub mod combine;
pub mod config;
#[cfg(feature = "rtdetr")]
pub mod detection;
pub mod factory;
pub mod finalize;
pub mod generator;
pub mod geometry;
pub mod module;
pub mod operation;
pub mod orchestrator;
pub mod results;
pub mod run;
pub mod slicing;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod types;
