pub mod config;
pub mod error;
pub mod model;
pub mod storage;
pub mod telemetry;

#[cfg(feature = "test-utils")]
pub mod test_utils;
