use crate::chaos::ChaosHttpClient;
use crate::config::Config;
use crate::metrics;
use anyhow::Result;
use reqwest::multipart;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct PostsBehavior {
    base_url: String,
    http: ChaosHttpClient,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub likes_count: u64,
}

impl Post {
    /// Path-segment form of the id, whatever JSON type the service used.
    pub fn id_string(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl PostsBehavior {
    pub fn new(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let service = &config.services.posts_service;
        Ok(Self {
            base_url: service.base_url.clone(),
            http: ChaosHttpClient::new(service.timeout, config.chaos.clone(), cancel)?,
        })
    }

    /// List posts. Returns an empty vec on any failure.
    pub async fn get_posts(&self, token: &str) -> Vec<Post> {
        let _timer = metrics::REQUEST_DURATION
            .with_label_values(&["posts", "get_posts"])
            .start_timer();
        let request = self
            .http
            .client()
            .get(format!("{}/api/posts", self.base_url))
            .bearer_auth(token);

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                metrics::observe_request("posts", "get_posts", "error");
                debug!("failed to fetch posts: {e}");
                return Vec::new();
            }
        };
        let status = response.status();
        metrics::observe_request("posts", "get_posts", status.as_str());
        if status.as_u16() != 200 {
            return Vec::new();
        }
        response.json().unwrap_or_default()
    }

    /// Create a post: multipart form with a caption and a dummy image file.
    pub async fn create_post(&self, token: &str, caption: &str) {
        let _timer = metrics::REQUEST_DURATION
            .with_label_values(&["posts", "create_post"])
            .start_timer();
        let form = multipart::Form::new().text("caption", caption.to_string()).part(
            "image",
            multipart::Part::bytes(&b"dummy image content for load test"[..])
                .file_name("test.txt"),
        );
        let request = self
            .http
            .client()
            .post(format!("{}/api/posts", self.base_url))
            .bearer_auth(token)
            .multipart(form);

        match self.http.execute(request).await {
            Ok(response) => {
                let status = response.status().as_u16();
                metrics::observe_request("posts", "create_post", &status.to_string());
                if status == 200 || status == 201 {
                    debug!(caption, "created post");
                } else {
                    warn!(status, "failed to create post");
                }
            }
            Err(e) => {
                metrics::observe_request("posts", "create_post", "error");
                warn!("failed to create post: {e}");
            }
        }
    }

    pub async fn like_post(&self, token: &str, post_id: &str) {
        let _timer = metrics::REQUEST_DURATION
            .with_label_values(&["posts", "like_post"])
            .start_timer();
        let request = self
            .http
            .client()
            .post(format!("{}/api/posts/{post_id}/like", self.base_url))
            .bearer_auth(token);

        match self.http.execute(request).await {
            Ok(response) => {
                metrics::observe_request("posts", "like_post", response.status().as_str());
            }
            Err(_) => metrics::observe_request("posts", "like_post", "error"),
        }
    }
}
