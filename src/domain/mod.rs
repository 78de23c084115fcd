pub mod models;
pub mod quaternion;
pub mod settings;
pub mod telemetry;
