pub mod errors;
pub mod metrics;
pub mod telemetry;

pub use errors::*;
