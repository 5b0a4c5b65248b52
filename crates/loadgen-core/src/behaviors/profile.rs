use crate::chaos::ChaosHttpClient;
use crate::config::Config;
use crate::metrics;
use anyhow::Result;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct ProfileBehavior {
    base_url: String,
    http: ChaosHttpClient,
}

#[derive(Serialize)]
struct ProfileUpdateRequest<'a> {
    bio: &'a str,
    location: &'a str,
}

const BIOS: [&str; 4] = [
    "Load testing user",
    "Testing the profile service",
    "Automated user for testing",
    "Hello from the load generator!",
];

const LOCATIONS: [&str; 4] = [
    "Load Test City",
    "Testing Town",
    "Automation Land",
    "Virtual World",
];

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ProfileBehavior {
    pub fn new(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let service = &config.services.profile_service;
        Ok(Self {
            base_url: service.base_url.clone(),
            http: ChaosHttpClient::new(service.timeout, config.chaos.clone(), cancel)?,
        })
    }

    /// PUT a bio/location pair picked from small pools keyed by wall-clock
    /// seconds.
    pub async fn update_profile(&self, token: &str, user_id: &str) {
        let _timer = metrics::REQUEST_DURATION
            .with_label_values(&["profile", "update_profile"])
            .start_timer();
        let now = epoch_secs() as usize;
        let body = ProfileUpdateRequest {
            bio: BIOS[now % BIOS.len()],
            location: LOCATIONS[now % LOCATIONS.len()],
        };
        let request = self
            .http
            .client()
            .put(format!("{}/api/profile/{user_id}", self.base_url))
            .bearer_auth(token)
            .json(&body);

        match self.http.execute(request).await {
            Ok(response) => {
                let status = response.status().as_u16();
                metrics::observe_request("profile", "update_profile", &status.to_string());
                if status == 200 {
                    debug!(user_id, "updated profile");
                } else {
                    warn!(status, "failed to update profile");
                }
            }
            Err(e) => {
                metrics::observe_request("profile", "update_profile", "error");
                warn!("failed to update profile: {e}");
            }
        }
    }

    pub async fn get_profile(&self, token: &str, user_id: &str) {
        let _timer = metrics::REQUEST_DURATION
            .with_label_values(&["profile", "get_profile"])
            .start_timer();
        let request = self
            .http
            .client()
            .get(format!("{}/api/profile/{user_id}", self.base_url))
            .bearer_auth(token);

        match self.http.execute(request).await {
            Ok(response) => {
                metrics::observe_request("profile", "get_profile", response.status().as_str());
            }
            Err(_) => metrics::observe_request("profile", "get_profile", "error"),
        }
    }
}
