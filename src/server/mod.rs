pub mod handler;
pub mod telemetry;
