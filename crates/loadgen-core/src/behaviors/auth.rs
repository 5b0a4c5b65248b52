use crate::chaos::ChaosHttpClient;
use crate::config::Config;
use crate::metrics;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub struct AuthBehavior {
    base_url: String,
    http: ChaosHttpClient,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

impl AuthBehavior {
    pub fn new(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let service = &config.services.user_service;
        Ok(Self {
            base_url: service.base_url.clone(),
            http: ChaosHttpClient::new(service.timeout, config.chaos.clone(), cancel)?,
        })
    }

    /// Log in and return the bearer token. Any non-200 is an error so the
    /// caller can fall through to registration.
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let _timer = metrics::REQUEST_DURATION
            .with_label_values(&["user", "login"])
            .start_timer();
        let request = self
            .http
            .client()
            .post(format!("{}/api/users/login", self.base_url))
            .json(&LoginRequest { username, password });

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                metrics::observe_request("user", "login", "error");
                return Err(e);
            }
        };
        let status = response.status();
        metrics::observe_request("user", "login", status.as_str());
        if status.as_u16() != 200 {
            bail!("login failed: {}", status.as_u16());
        }

        let auth: AuthResponse = response.json()?;
        Ok(auth.token)
    }

    /// Register a new account. Success is 200 or 201.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<()> {
        let _timer = metrics::REQUEST_DURATION
            .with_label_values(&["user", "register"])
            .start_timer();
        let request = self
            .http
            .client()
            .post(format!("{}/api/users/register", self.base_url))
            .json(&RegisterRequest {
                username,
                email,
                password,
            });

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                metrics::observe_request("user", "register", "error");
                return Err(e);
            }
        };
        let status = response.status().as_u16();
        metrics::observe_request("user", "register", &status.to_string());
        if status != 200 && status != 201 {
            bail!("register failed: {status}");
        }
        Ok(())
    }
}
