//! Metrics reported by the flush engine and the consume loop.

mod prometheus;

pub use self::prometheus::{PersisterMetrics, MESSAGE_FORMAT_VERSION};
pub use ::prometheus::Registry;
