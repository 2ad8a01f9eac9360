pub(crate) mod analysis;
pub(crate) mod metrics;
pub(crate) mod probe;
