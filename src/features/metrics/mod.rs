pub(crate) mod stats;
mod speed;

pub use speed::{MeasurementQuality, analyze_speed_samples, compute_measurement_quality};
