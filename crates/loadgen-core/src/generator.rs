//! Run owner: ramp-up pacing, user fan-out, cancellation, tracker handoff.

use crate::cleanup::CleanupTracker;
use crate::config::Config;
use crate::metrics;
use crate::ramp::{self, parse_ramp_rate};
use crate::user::VirtualUser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Generator {
    config: Arc<Config>,
    users: usize,
    duration: Duration,
    ramp_rate: u64,
    cleanup: CleanupTracker,
}

impl Generator {
    pub fn new(
        config: Arc<Config>,
        users: usize,
        duration: Duration,
        ramp: &str,
        cleanup: CleanupTracker,
    ) -> Self {
        Self {
            config,
            users,
            duration,
            ramp_rate: parse_ramp_rate(ramp),
            cleanup,
        }
    }

    /// Run the test to completion, duration expiry, or cancellation of
    /// `cancel`, whichever comes first.
    ///
    /// Users still winding down after expiry finish in the background;
    /// their gauges drain as cancellation propagates. Tracked users are
    /// never cleaned up here; they persist as real load until an explicit
    /// reduce or delete call.
    pub async fn run(&self, cancel: CancellationToken) {
        let run_cancel = cancel.child_token();

        let (slot_tx, slot_rx) = mpsc::channel::<usize>(self.users.max(1));
        let slot_rx = Arc::new(tokio::sync::Mutex::new(slot_rx));

        let mut tasks = JoinSet::new();
        for _ in 0..self.users {
            let slot_rx = slot_rx.clone();
            let config = self.config.clone();
            let cleanup = self.cleanup.clone();
            let cancel = run_cancel.clone();
            tasks.spawn(async move {
                // wait for the pacer to release a slot; the slot value is
                // the user id, so ids start in ramp order
                let slot = tokio::select! {
                    slot = async { slot_rx.lock().await.recv().await } => slot,
                    _ = cancel.cancelled() => None,
                };
                let Some(id) = slot else { return };
                match VirtualUser::new(id, &config, &cancel) {
                    Ok(user) => {
                        cleanup.add_user(user.username());
                        user.run(cancel).await;
                    }
                    Err(e) => {
                        warn!("failed to construct user {id}: {e:#}");
                        metrics::ACTIVE_USERS.dec();
                    }
                }
            });
        }

        tokio::spawn(ramp::run_pacer(
            self.ramp_rate,
            self.users,
            slot_tx,
            run_cancel.clone(),
        ));

        info!(
            users = self.users,
            ramp_rate = self.ramp_rate,
            duration = ?self.duration,
            "load test started"
        );

        let all_done = async {
            while tasks.join_next().await.is_some() {}
        };
        tokio::select! {
            _ = all_done => info!("all users completed"),
            _ = tokio::time::sleep(self.duration) => info!("test duration reached"),
            _ = run_cancel.cancelled() => info!("test cancelled"),
        }
        run_cancel.cancel();
        // leave the remaining user tasks to observe cancellation and unwind
        tasks.detach_all();

        info!(
            tracked_users = self.cleanup.tracked_count(),
            "load test finished; created users remain as persistent load"
        );
    }

    pub fn tracked_users(&self) -> Vec<String> {
        self.cleanup.tracked_users()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn stub_services(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/users/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "tok",
                "user": {"id": 0, "username": "user_0"}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    fn config_for(server: &MockServer) -> Arc<Config> {
        let mut config = Config::default();
        config.services.user_service.base_url = server.uri();
        config.services.chat_service.base_url = server.uri();
        config.services.posts_service.base_url = server.uri();
        config.services.profile_service.base_url = server.uri();
        config.chaos.error_rate = 0.0;
        config.chaos.delay_rate = 0.0;
        Arc::new(config)
    }

    #[tokio::test]
    async fn run_tracks_every_spawned_user() {
        let server = MockServer::start().await;
        stub_services(&server).await;
        let config = config_for(&server);
        let cleanup = CleanupTracker::new(config.clone()).unwrap();
        let generator = Generator::new(
            config,
            3,
            Duration::from_millis(600),
            "0/s",
            cleanup.clone(),
        );

        generator.run(CancellationToken::new()).await;

        let tracked: HashSet<_> = cleanup.tracked_users().into_iter().collect();
        assert_eq!(
            tracked,
            HashSet::from([
                "user_0".to_string(),
                "user_1".to_string(),
                "user_2".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn cancellation_stops_the_run_early() {
        let server = MockServer::start().await;
        stub_services(&server).await;
        let config = config_for(&server);
        let cleanup = CleanupTracker::new(config.clone()).unwrap();
        // 1/s ramp: with an immediate cancel almost nobody should start
        let generator = Generator::new(
            config,
            50,
            Duration::from_secs(60),
            "1/s",
            cleanup.clone(),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        generator.run(cancel).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(cleanup.tracked_count() <= 2);
    }
}
