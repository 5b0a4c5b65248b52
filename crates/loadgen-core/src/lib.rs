//! Core engine for the chat-application load generator.
//!
//! Leaf-first: config, metrics, the chaos HTTP client, the cleanup tracker,
//! ramp pacing, per-service behaviors, the virtual user, and the generator
//! that owns a run.

pub mod behaviors;
pub mod chaos;
pub mod cleanup;
pub mod config;
pub mod generator;
pub mod metrics;
pub mod ramp;
pub mod user;

pub use chaos::{ChaosHttpClient, ChaosResponse};
pub use cleanup::{CleanupTracker, FailedMap, TEST_USER_PREFIX};
pub use config::{ChaosConfig, Config, ServiceConfig, ServicesConfig};
pub use generator::Generator;
pub use ramp::parse_ramp_rate;
pub use user::VirtualUser;
