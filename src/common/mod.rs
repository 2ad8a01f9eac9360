pub(crate) mod net;
pub(crate) mod time;
