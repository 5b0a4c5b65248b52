//! Tracked-user bookkeeping and selective bulk deletion.
//!
//! The tracker records every synthetic username a run creates and removes a
//! name only after the user service acknowledged its deletion with 200/204.
//! Usernames must carry the reserved `user_` prefix to be deletable.

use crate::config::Config;
use crate::metrics;
use anyhow::Result;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reserved prefix for synthetic usernames.
pub const TEST_USER_PREFIX: &str = "user_";

/// Failed deletions, username to HTTP status (0 for transport errors).
pub type FailedMap = HashMap<String, u16>;

#[derive(Clone)]
pub struct CleanupTracker {
    config: Arc<Config>,
    client: reqwest::Client,
    users: Arc<Mutex<Vec<String>>>,
}

impl CleanupTracker {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            config,
            client,
            users: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Track a username. Duplicates are rejected; insertion order is kept.
    pub fn add_user(&self, username: &str) -> bool {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        if users.iter().any(|u| u == username) {
            return false;
        }
        users.push(username.to_string());
        true
    }

    /// Snapshot of the tracked usernames.
    pub fn tracked_users(&self) -> Vec<String> {
        self.users.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn tracked_count(&self) -> usize {
        self.users.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn untrack(&self, username: &str) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.retain(|u| u != username);
    }

    /// Delete a single test user. Returns `(deleted, status)`.
    ///
    /// Usernames outside the `user_` namespace are refused locally with a
    /// 400 and never reach the network.
    pub async fn delete_one(&self, username: &str, cancel: &CancellationToken) -> (bool, u16) {
        if username.is_empty() || !username.starts_with(TEST_USER_PREFIX) {
            return (false, 400);
        }

        let url = format!(
            "{}/api/users/{}",
            self.config.services.user_service.base_url, username
        );
        debug!(%url, "deleting user");
        let response = tokio::select! {
            r = self.client.delete(&url).send() => r,
            _ = cancel.cancelled() => {
                warn!(username, "user deletion cancelled");
                return (false, 0);
            }
        };

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                metrics::observe_request("user", "delete_user", &status.to_string());
                if status == 200 || status == 204 {
                    self.untrack(username);
                    info!(username, "deleted user account");
                    (true, 200)
                } else {
                    warn!(username, status, "could not delete user");
                    (false, status)
                }
            }
            Err(e) => {
                metrics::observe_request("user", "delete_user", "error");
                warn!(username, "failed to delete user: {e}");
                (false, 0)
            }
        }
    }

    /// Delete up to `count` tracked users chosen uniformly at random, then
    /// make a best-effort sweep of their chat messages and posts.
    pub async fn reduce_load(
        &self,
        count: usize,
        cancel: &CancellationToken,
    ) -> (Vec<String>, FailedMap) {
        if count == 0 {
            return (Vec::new(), FailedMap::new());
        }

        let mut selected = self.tracked_users();
        {
            let mut rng = rand::thread_rng();
            selected.shuffle(&mut rng);
        }
        selected.truncate(count);

        info!(
            selected = selected.len(),
            tracked = self.tracked_count(),
            "reducing load"
        );

        let (deleted, failed) = self.delete_usernames(&selected, cancel).await;

        // Best-effort cascade: failures are swallowed.
        let victims: HashSet<&str> = deleted.iter().map(String::as_str).collect();
        self.sweep_chat_messages(&victims, cancel).await;
        self.sweep_posts(&victims, cancel).await;

        info!(
            deleted = deleted.len(),
            remaining = self.tracked_count(),
            "load reduction completed"
        );
        (deleted, failed)
    }

    /// Delete up to `count` test users discovered through the user-service
    /// dashboard, falling back to the tracked list when the dashboard is
    /// unreachable or empty.
    pub async fn delete_test_users(
        &self,
        count: usize,
        cancel: &CancellationToken,
    ) -> (Vec<String>, FailedMap) {
        if count == 0 {
            return (Vec::new(), FailedMap::new());
        }

        let mut candidates = self.test_user_candidates(cancel).await;
        if candidates.is_empty() {
            info!("no test users found to delete (prefix {TEST_USER_PREFIX:?})");
            return (Vec::new(), FailedMap::new());
        }
        candidates.truncate(count);

        let (deleted, failed) = self.delete_usernames(&candidates, cancel).await;
        for (username, status) in &failed {
            warn!(username, status, "failed to delete test user");
        }
        (deleted, failed)
    }

    /// Like [`delete_test_users`], but runs deletions through a bounded pool
    /// of at most `concurrency` in-flight requests. Once `cancel` fires no
    /// new deletions are launched; in-flight ones run to completion.
    ///
    /// `deleted_users` is in completion order, which is unordered.
    ///
    /// [`delete_test_users`]: Self::delete_test_users
    pub async fn delete_concurrent(
        &self,
        count: usize,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> (Vec<String>, FailedMap) {
        if count == 0 {
            return (Vec::new(), FailedMap::new());
        }

        let mut candidates = self.test_user_candidates(cancel).await;
        if candidates.is_empty() {
            info!("no test users found to delete (prefix {TEST_USER_PREFIX:?})");
            return (Vec::new(), FailedMap::new());
        }
        candidates.truncate(count);

        let workers = if concurrency == 0 { 5 } else { concurrency };
        let workers = workers.min(candidates.len());
        let semaphore = Arc::new(Semaphore::new(workers));
        let results = Arc::new(Mutex::new((Vec::new(), FailedMap::new())));

        let mut tasks = JoinSet::new();
        for username in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };
            let tracker = self.clone();
            let cancel = cancel.clone();
            let results = results.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let (deleted, status) = tracker.delete_one(&username, &cancel).await;
                let mut results = results.lock().unwrap_or_else(|e| e.into_inner());
                if deleted {
                    results.0.push(username);
                } else {
                    results.1.insert(username, status);
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        let results = results.lock().unwrap_or_else(|e| e.into_inner());
        for (username, status) in &results.1 {
            warn!(username, status, "failed to delete test user");
        }
        (results.0.clone(), results.1.clone())
    }

    /// Candidate usernames for bulk deletion: dashboard users with the test
    /// prefix, deduplicated and shuffled; tracked users as the fallback.
    async fn test_user_candidates(&self, cancel: &CancellationToken) -> Vec<String> {
        let mut candidates = self.dashboard_test_users(cancel).await;
        if candidates.is_empty() {
            candidates = self
                .tracked_users()
                .into_iter()
                .filter(|u| u.starts_with(TEST_USER_PREFIX))
                .collect();
        }

        let mut seen = HashSet::new();
        candidates.retain(|u| seen.insert(u.clone()));
        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates
    }

    async fn dashboard_test_users(&self, cancel: &CancellationToken) -> Vec<String> {
        let url = format!(
            "{}/api/users/dashboard",
            self.config.services.user_service.base_url
        );
        let response = tokio::select! {
            r = self.client.get(&url).send() => r,
            _ = cancel.cancelled() => return Vec::new(),
        };
        let response = match response {
            Ok(response) => {
                metrics::observe_request("user", "dashboard", response.status().as_str());
                response
            }
            Err(e) => {
                metrics::observe_request("user", "dashboard", "error");
                warn!("failed to fetch dashboard: {e}");
                return Vec::new();
            }
        };
        let data: serde_json::Value = match response.json().await {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to decode dashboard response: {e}");
                return Vec::new();
            }
        };

        // Entries may be plain strings or objects with a "username" field.
        let mut users = Vec::new();
        if let Some(entries) = data.get("users").and_then(|u| u.as_array()) {
            for entry in entries {
                let username = match entry {
                    serde_json::Value::String(s) => Some(s.as_str()),
                    serde_json::Value::Object(map) => {
                        map.get("username").and_then(|u| u.as_str())
                    }
                    _ => None,
                };
                if let Some(username) = username {
                    if username.starts_with(TEST_USER_PREFIX) {
                        users.push(username.to_string());
                    }
                }
            }
        }
        users
    }

    /// Sequential deletion over the single-user path.
    async fn delete_usernames(
        &self,
        usernames: &[String],
        cancel: &CancellationToken,
    ) -> (Vec<String>, FailedMap) {
        let mut deleted = Vec::new();
        let mut failed = FailedMap::new();
        for username in usernames {
            let (ok, status) = self.delete_one(username, cancel).await;
            if ok {
                deleted.push(username.clone());
            } else {
                failed.insert(username.clone(), status);
            }
        }
        (deleted, failed)
    }

    async fn sweep_chat_messages(&self, victims: &HashSet<&str>, cancel: &CancellationToken) {
        let base = &self.config.services.chat_service.base_url;
        let swept = self
            .sweep_items(
                &format!("{base}/api/messages"),
                |id| format!("{base}/api/messages/{id}"),
                ("chat", "delete_message"),
                victims,
                cancel,
            )
            .await;
        if swept > 0 {
            info!(swept, "cleaned up chat messages from deleted users");
        }
    }

    async fn sweep_posts(&self, victims: &HashSet<&str>, cancel: &CancellationToken) {
        let base = &self.config.services.posts_service.base_url;
        let swept = self
            .sweep_items(
                &format!("{base}/api/posts"),
                |id| format!("{base}/api/posts/{id}"),
                ("posts", "delete_post"),
                victims,
                cancel,
            )
            .await;
        if swept > 0 {
            info!(swept, "cleaned up posts from deleted users");
        }
    }

    /// List `list_url`, then delete every item owned by a victim username.
    /// All failures are swallowed; only metrics record them.
    async fn sweep_items(
        &self,
        list_url: &str,
        delete_url: impl Fn(&str) -> String,
        labels: (&str, &str),
        victims: &HashSet<&str>,
        cancel: &CancellationToken,
    ) -> usize {
        let response = tokio::select! {
            r = self.client.get(list_url).send() => r,
            _ = cancel.cancelled() => return 0,
        };
        let items: Vec<serde_json::Value> = match response {
            Ok(response) => response.json().await.unwrap_or_default(),
            Err(_) => return 0,
        };

        let mut swept = 0;
        for item in items {
            let owner = item.get("username").and_then(|u| u.as_str());
            if !owner.is_some_and(|u| victims.contains(u)) {
                continue;
            }
            let Some(id) = item.get("id") else { continue };
            let id = match id {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if cancel.is_cancelled() {
                break;
            }
            match self.client.delete(delete_url(&id)).send().await {
                Ok(response) => {
                    metrics::observe_request(labels.0, labels.1, response.status().as_str());
                    if response.status().is_success() {
                        swept += 1;
                    }
                }
                Err(_) => metrics::observe_request(labels.0, labels.1, "error"),
            }
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tracker_for(server: &MockServer) -> CleanupTracker {
        let mut config = Config::default();
        config.services.user_service.base_url = server.uri();
        config.services.chat_service.base_url = server.uri();
        config.services.posts_service.base_url = server.uri();
        CleanupTracker::new(Arc::new(config)).unwrap()
    }

    #[test]
    fn add_user_is_idempotent_and_ordered() {
        let tracker =
            CleanupTracker::new(Arc::new(Config::default())).unwrap();
        assert!(tracker.add_user("user_1"));
        assert!(tracker.add_user("user_2"));
        assert!(!tracker.add_user("user_1"));
        assert!(tracker.add_user("user_3"));
        assert_eq!(tracker.tracked_users(), vec!["user_1", "user_2", "user_3"]);
    }

    #[tokio::test]
    async fn delete_one_refuses_foreign_prefix_without_io() {
        let server = MockServer::start().await;
        let tracker = tracker_for(&server);
        let cancel = CancellationToken::new();

        assert_eq!(tracker.delete_one("bob", &cancel).await, (false, 400));
        assert_eq!(tracker.delete_one("", &cancel).await, (false, 400));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_one_untracks_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/users/user_7"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let tracker = tracker_for(&server);
        tracker.add_user("user_7");
        let cancel = CancellationToken::new();

        assert_eq!(tracker.delete_one("user_7", &cancel).await, (true, 200));
        assert!(tracker.tracked_users().is_empty());
    }

    #[tokio::test]
    async fn delete_one_keeps_tracking_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/users/user_9"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tracker = tracker_for(&server);
        tracker.add_user("user_9");
        let cancel = CancellationToken::new();

        assert_eq!(tracker.delete_one("user_9", &cancel).await, (false, 500));
        assert_eq!(tracker.tracked_users(), vec!["user_9"]);
    }

    #[tokio::test]
    async fn delete_test_users_reports_partial_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/dashboard"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "users": ["user_1", "user_2", "bob", "user_3"]
            })))
            .mount(&server)
            .await;
        for user in ["user_1", "user_3"] {
            Mock::given(method("DELETE"))
                .and(path(format!("/api/users/{user}")))
                .respond_with(ResponseTemplate::new(200))
                .mount(&server)
                .await;
        }
        Mock::given(method("DELETE"))
            .and(path("/api/users/user_2"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let tracker = tracker_for(&server);
        let cancel = CancellationToken::new();
        let (deleted, failed) = tracker.delete_test_users(10, &cancel).await;

        let deleted: HashSet<_> = deleted.into_iter().collect();
        assert_eq!(
            deleted,
            HashSet::from(["user_1".to_string(), "user_3".to_string()])
        );
        assert_eq!(failed.get("user_2"), Some(&500));
        // "bob" has the wrong prefix and must never be attempted
        let attempted: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.to_string() == "DELETE")
            .map(|r| r.url.path().to_string())
            .collect();
        assert!(!attempted.iter().any(|p| p.contains("bob")));
    }

    #[tokio::test]
    async fn delete_test_users_falls_back_to_tracked_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/dashboard"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/users/user_4"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let tracker = tracker_for(&server);
        tracker.add_user("user_4");
        tracker.add_user("intruder");
        let cancel = CancellationToken::new();

        let (deleted, failed) = tracker.delete_test_users(10, &cancel).await;
        assert_eq!(deleted, vec!["user_4"]);
        assert!(failed.is_empty());
        assert_eq!(tracker.tracked_users(), vec!["intruder"]);
    }

    #[tokio::test]
    async fn reduce_load_zero_is_a_noop() {
        let server = MockServer::start().await;
        let tracker = tracker_for(&server);
        tracker.add_user("user_1");
        let cancel = CancellationToken::new();

        let (deleted, failed) = tracker.reduce_load(0, &cancel).await;
        assert!(deleted.is_empty());
        assert!(failed.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reduce_load_caps_at_tracked_count() {
        let server = MockServer::start().await;
        for user in ["user_1", "user_2", "user_3"] {
            Mock::given(method("DELETE"))
                .and(path(format!("/api/users/{user}")))
                .respond_with(ResponseTemplate::new(200))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/posts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let tracker = tracker_for(&server);
        for user in ["user_1", "user_2", "user_3"] {
            tracker.add_user(user);
        }
        let cancel = CancellationToken::new();

        let (deleted, failed) = tracker.reduce_load(50, &cancel).await;
        assert_eq!(deleted.len(), 3);
        assert!(failed.is_empty());
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[tokio::test]
    async fn reduce_load_cascades_to_owned_items() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/users/user_1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 11, "username": "user_1", "message": "hi"},
                {"id": 12, "username": "someone_else", "message": "yo"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/messages/11"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/posts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "p1", "username": "user_1"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/posts/p1"))
            // cascade failures are swallowed
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let tracker = tracker_for(&server);
        tracker.add_user("user_1");
        let cancel = CancellationToken::new();

        let (deleted, failed) = tracker.reduce_load(1, &cancel).await;
        assert_eq!(deleted, vec!["user_1"]);
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn delete_concurrent_deletes_all_candidates() {
        let server = MockServer::start().await;
        let usernames: Vec<String> = (0..20).map(|i| format!("user_{i}")).collect();
        Mock::given(method("GET"))
            .and(path("/api/users/dashboard"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "users": usernames })),
            )
            .mount(&server)
            .await;
        for user in &usernames {
            Mock::given(method("DELETE"))
                .and(path(format!("/api/users/{user}")))
                .respond_with(ResponseTemplate::new(200))
                .mount(&server)
                .await;
        }

        let tracker = tracker_for(&server);
        let cancel = CancellationToken::new();
        let (deleted, failed) = tracker.delete_concurrent(20, 5, &cancel).await;

        assert_eq!(deleted.len(), 20);
        assert!(failed.is_empty());
        let expected: HashSet<_> = usernames.into_iter().collect();
        let got: HashSet<_> = deleted.into_iter().collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn delete_concurrent_launches_nothing_after_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/dashboard"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "users": ["user_1", "user_2"]
            })))
            .mount(&server)
            .await;

        let tracker = tracker_for(&server);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (deleted, failed) = tracker.delete_concurrent(2, 2, &cancel).await;

        assert!(deleted.is_empty());
        assert!(failed.is_empty());
        let attempted = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.to_string() == "DELETE")
            .count();
        assert_eq!(attempted, 0);
    }
}
