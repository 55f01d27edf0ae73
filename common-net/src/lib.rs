pub mod message;
pub mod metrics;
pub mod shutdown;
pub mod telemetry;
