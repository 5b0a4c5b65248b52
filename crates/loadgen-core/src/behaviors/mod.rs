//! Per-service behavior clients used by virtual users.
//!
//! Every outbound call wraps a duration timer and records a
//! `{service, method, status}` sample; failures count with status `error`
//! and never propagate out of an action.

mod auth;
mod chat;
mod posts;
mod profile;

pub use auth::AuthBehavior;
pub use chat::ChatBehavior;
pub use posts::{Post, PostsBehavior};
pub use profile::ProfileBehavior;
