mod common;
mod features;

pub mod analysis;
pub mod calibration;
pub mod config;
pub mod data_model;
pub mod meta;
pub mod metrics;
pub mod model;
pub mod probe;
pub mod runtime;
pub mod settings;
pub mod writer;
