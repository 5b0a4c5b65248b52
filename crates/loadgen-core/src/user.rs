//! The per-user behavior driver.
//!
//! Each virtual user owns its own behavior clients (and therefore its own
//! chaos randomization) and a seeded PRNG so an individual user's action
//! sequence is reproducible.

use crate::behaviors::{AuthBehavior, ChatBehavior, PostsBehavior, ProfileBehavior};
use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct VirtualUser {
    id: usize,
    username: String,
    token: String,
    user_id: String,
    auth: AuthBehavior,
    chat: Arc<ChatBehavior>,
    posts: PostsBehavior,
    profile: ProfileBehavior,
    rng: SmallRng,
}

/// Per-cycle record of which services already saw traffic.
#[derive(Debug, Default, Clone, Copy)]
struct Coverage {
    posts: bool,
    chat: bool,
    profile: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Posts,
    Chat,
    Profile,
    ViewPosts,
    ReadChat,
}

const ACTION_WEIGHTS: [(Action, f32); 5] = [
    (Action::Posts, 0.35),
    (Action::Chat, 0.25),
    (Action::Profile, 0.15),
    (Action::ViewPosts, 0.15),
    (Action::ReadChat, 0.10),
];

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl VirtualUser {
    pub fn new(id: usize, config: &Config, cancel: &CancellationToken) -> Result<Self> {
        let username = format!("user_{id}");
        Ok(Self {
            id,
            username,
            token: String::new(),
            user_id: String::new(),
            auth: AuthBehavior::new(config, cancel.clone())?,
            chat: Arc::new(ChatBehavior::new(config, cancel.clone())?),
            posts: PostsBehavior::new(config, cancel.clone())?,
            profile: ProfileBehavior::new(config, cancel.clone())?,
            rng: SmallRng::seed_from_u64(epoch_secs() ^ id as u64),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Drive the user until cancellation. The active-users gauge (bumped by
    /// the pacer when the slot was released) is dropped exactly once here.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("user {} starting simulation", self.username);
        self.simulate(&cancel).await;
        metrics::ACTIVE_USERS.dec();
    }

    async fn simulate(&mut self, cancel: &CancellationToken) {
        if let Err(e) = self.authenticate().await {
            warn!("user {} auth failed: {e:#}", self.username);
            return;
        }

        // Hold the chat socket open for the whole session.
        let chat = self.chat.clone();
        let chat_cancel = cancel.clone();
        let chat_task = tokio::spawn(async move { chat.connect(chat_cancel).await });

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = cancel.cancelled() => {}
        }

        // At least one chat message per user, immediately.
        self.send_chat_message().await;
        let mut coverage = Coverage {
            chat: true,
            ..Coverage::default()
        };

        let mut cycles: u64 = 0;
        while !cancel.is_cancelled() {
            if cycles % 4 == 0 {
                coverage = Coverage::default();
                self.send_chat_message().await;
                coverage.chat = true;
            }

            let action = self.select_action(&mut coverage);
            self.perform(action).await;
            cycles += 1;

            let idle = Duration::from_secs(self.rng.gen_range(2..8));
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("user {} stopping", self.username);
        let _ = chat_task.await;
    }

    /// Login first; on failure register and log in again. A user that never
    /// authenticates produces no chat or post traffic.
    async fn authenticate(&mut self) -> Result<()> {
        let token = match self.auth.login(&self.username, "password123").await {
            Ok(token) => token,
            Err(_) => {
                self.auth
                    .register(
                        &self.username,
                        &format!("{}@example.com", self.username),
                        "password123",
                    )
                    .await
                    .context("register failed")?;
                self.auth
                    .login(&self.username, "password123")
                    .await
                    .context("login after register failed")?
            }
        };
        self.token = token;
        self.user_id = self.id.to_string();
        info!("user {} authenticated", self.username);
        Ok(())
    }

    /// Coverage-biased selection: uncovered services get a shot first, then
    /// a weighted draw over the full action set.
    fn select_action(&mut self, coverage: &mut Coverage) -> Action {
        if !coverage.posts && self.rng.gen::<f32>() < 0.4 {
            coverage.posts = true;
            return Action::Posts;
        }
        if !coverage.chat && self.rng.gen::<f32>() < 0.3 {
            coverage.chat = true;
            return Action::Chat;
        }
        if !coverage.profile && self.rng.gen::<f32>() < 0.2 {
            coverage.profile = true;
            return Action::Profile;
        }

        let total: f32 = ACTION_WEIGHTS.iter().map(|(_, w)| w).sum();
        let mut draw = self.rng.gen::<f32>() * total;
        for (action, weight) in ACTION_WEIGHTS {
            draw -= weight;
            if draw <= 0.0 {
                return action;
            }
        }
        Action::ViewPosts
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::Posts => match self.rng.gen_range(0..3) {
                0 => self.create_post().await,
                1 => self.like_random_post().await,
                _ => {
                    let _ = self.posts.get_posts(&self.token).await;
                }
            },
            Action::Chat => {
                if self.rng.gen::<f32>() < 0.7 {
                    self.send_chat_message().await;
                } else {
                    self.chat.get_messages(&self.token).await;
                }
            }
            Action::Profile => {
                if self.rng.gen::<f32>() < 0.7 {
                    self.profile.update_profile(&self.token, &self.user_id).await;
                } else {
                    self.profile.get_profile(&self.token, &self.user_id).await;
                }
            }
            Action::ViewPosts => {
                let _ = self.posts.get_posts(&self.token).await;
            }
            Action::ReadChat => self.chat.get_messages(&self.token).await,
        }
    }

    async fn create_post(&mut self) {
        let captions = [
            format!("Just posted from {}!", self.username),
            format!("Hello everyone! - {}", self.username),
            format!("Testing the app - {} at {}", self.username, clock_hhmm()),
            format!("Random post by {}", self.username),
            format!("{} checking in!", self.username),
        ];
        let caption = &captions[self.rng.gen_range(0..captions.len())];
        self.posts.create_post(&self.token, caption).await;
    }

    async fn like_random_post(&mut self) {
        let posts = self.posts.get_posts(&self.token).await;
        if posts.is_empty() {
            return;
        }
        let post = &posts[self.rng.gen_range(0..posts.len())];
        self.posts.like_post(&self.token, &post.id_string()).await;
    }

    async fn send_chat_message(&mut self) {
        let messages = [
            format!("Hey everyone! {} here", self.username),
            format!("{} says hello to the chat!", self.username),
            format!("Good day from {}", self.username),
            format!("Testing public chat - {}", self.username),
            format!("{} is online and chatting!", self.username),
            format!("Random message from {} at {}", self.username, clock_hhmm()),
        ];
        let message = &messages[self.rng.gen_range(0..messages.len())];
        self.chat.send_message(message).await;
    }
}

fn clock_hhmm() -> String {
    let secs = epoch_secs();
    format!("{:02}:{:02}", (secs / 3600) % 24, (secs / 60) % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quiet_config(server: &MockServer) -> Config {
        let mut config = Config::default();
        config.services.user_service.base_url = server.uri();
        config.chaos.error_rate = 0.0;
        config.chaos.delay_rate = 0.0;
        config
    }

    fn seeded_user() -> VirtualUser {
        let config = Config::default();
        let mut user = VirtualUser::new(3, &config, &CancellationToken::new()).unwrap();
        user.rng = SmallRng::seed_from_u64(42);
        user
    }

    #[test]
    fn usernames_carry_the_reserved_prefix() {
        let config = Config::default();
        let user = VirtualUser::new(17, &config, &CancellationToken::new()).unwrap();
        assert_eq!(user.username(), "user_17");
    }

    #[test]
    fn selection_is_reproducible_for_a_fixed_seed() {
        let mut a = seeded_user();
        let mut b = seeded_user();
        let mut coverage_a = Coverage::default();
        let mut coverage_b = Coverage::default();
        for _ in 0..32 {
            assert_eq!(
                a.select_action(&mut coverage_a),
                b.select_action(&mut coverage_b)
            );
        }
    }

    #[test]
    fn coverage_flags_are_marked_when_a_service_is_picked() {
        let mut user = seeded_user();
        let mut coverage = Coverage::default();
        for _ in 0..64 {
            let action = user.select_action(&mut coverage);
            match action {
                Action::Posts => assert!(coverage.posts),
                Action::Chat if !coverage.chat => panic!("chat picked but not marked"),
                _ => {}
            }
            if coverage.posts && coverage.chat && coverage.profile {
                break;
            }
        }
    }

    #[test]
    fn covered_services_fall_through_to_weighted_draw() {
        let mut user = seeded_user();
        let mut coverage = Coverage {
            posts: true,
            chat: true,
            profile: true,
        };
        // with everything covered the draw may pick any action, and the
        // coverage map must not change
        for _ in 0..32 {
            let _ = user.select_action(&mut coverage);
            assert!(coverage.posts && coverage.chat && coverage.profile);
        }
    }

    #[tokio::test]
    async fn authenticate_falls_back_to_register() {
        let server = MockServer::start().await;
        // first login fails, register succeeds, second login succeeds
        Mock::given(method("POST"))
            .and(path("/api/users/login"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/users/register"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/users/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "tok-2",
                "user": {"id": 3, "username": "user_3"}
            })))
            .mount(&server)
            .await;

        let config = quiet_config(&server);
        let mut user = VirtualUser::new(3, &config, &CancellationToken::new()).unwrap();
        user.authenticate().await.unwrap();
        assert_eq!(user.token, "tok-2");
        assert_eq!(user.user_id, "3");
    }

    #[tokio::test]
    async fn repeated_login_failure_terminates_authentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/users/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/users/register"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = quiet_config(&server);
        let mut user = VirtualUser::new(4, &config, &CancellationToken::new()).unwrap();
        assert!(user.authenticate().await.is_err());
    }
}
