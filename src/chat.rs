use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::db::Database;
use crate::models::{ChatReply, ChatRequest, SessionResetRequest, SessionResetResponse};
use crate::openai::{ChatMessage, ContentPart, ImageUrl, OpenAiClient, Role};
use crate::prompt::{self, DEFAULT_IMAGE_PROMPT};
use crate::tutor::{is_bare_number, Rewriter, SessionKey, TurnContext};

const UNLOCKED_REPLY: &str = "🔓 Unlocked! How many total questions are in this exercise, and which level: 🐣 Apprentice / 🦸 Rising Hero / 🧠 Master?";
const LOCKED_REPLY: &str = "🔒 Please type the access password to begin.";

#[derive(Clone)]
pub struct ChatService {
    config: AppConfig,
    db: Database,
    gateway: OpenAiClient,
    rewriter: Rewriter,
    generation_limit: Arc<Semaphore>,
}

impl ChatService {
    pub fn new(
        config: AppConfig,
        db: Database,
        gateway: OpenAiClient,
        rewriter: Rewriter,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            config,
            db,
            gateway,
            rewriter,
            generation_limit,
        }
    }

    pub fn is_authorized(&self, auth: &str) -> bool {
        auth == self.config.password
    }

    /// Answers one learner turn. The request is expected to have passed
    /// [`ChatRequest::validate`] already.
    pub async fn answer(&self, request: ChatRequest, auth: &str) -> Result<ChatReply> {
        if !self.is_authorized(auth) {
            return Ok(ChatReply::plain(gate_reply(
                &request.message,
                &self.config.password,
            )));
        }

        let started = Instant::now();
        let bare_number = is_bare_number(&request.message);
        let turn = TurnContext::new(
            &request.level,
            &request.focus,
            &request.grade,
            auth,
            bare_number,
        );
        let session = turn.key.fingerprint();

        let history = self
            .db
            .latest_messages(&session, self.config.limits.history_turns as i64)
            .await
            .context("failed to load conversation history")?;

        let messages = assemble_messages(
            &turn,
            self.gateway.structured_judgment(),
            history,
            &request,
        );

        let completion = {
            let _permit = self.generation_limit.acquire().await?;
            self.gateway.complete(&messages).await?
        };

        let turn = turn.with_judgment(completion.judgment);
        let reply = self.rewriter.rewrite_turn(&completion.text, &turn);

        self.db
            .save_message(&session, "user", &history_entry(&request))
            .await
            .context("failed to store learner turn")?;
        self.db
            .save_message(&session, "assistant", &reply)
            .await
            .context("failed to store tutor reply")?;

        tracing::info!(
            session = &session[..12],
            band = %turn.band,
            bare_number,
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            total_tokens = completion.usage.total(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tutor reply"
        );

        Ok(ChatReply {
            reply,
            usage: Some(completion.usage),
        })
    }

    /// Forgets both the rewrite memory and the stored history for one session key.
    pub async fn reset_session(
        &self,
        request: SessionResetRequest,
        auth: &str,
    ) -> Result<SessionResetResponse> {
        let key = SessionKey::new(&request.level, &request.focus, &request.grade, auth);
        let session = key.fingerprint();

        self.rewriter.store().forget(&key);
        let cleared_messages = self
            .db
            .delete_session_messages(&session)
            .await
            .context("failed to clear conversation history")?;

        tracing::info!(session = &session[..12], cleared_messages, "session reset");
        Ok(SessionResetResponse { cleared_messages })
    }
}

fn gate_reply(message: &str, password: &str) -> &'static str {
    if message.trim().to_lowercase() == password.to_lowercase() {
        UNLOCKED_REPLY
    } else {
        LOCKED_REPLY
    }
}

/// System policy, per-turn directives, rolling history, then the learner's turn.
fn assemble_messages(
    turn: &TurnContext,
    structured_judgment: bool,
    history: Vec<(String, String)>,
    request: &ChatRequest,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 3);
    messages.push(ChatMessage::text(Role::System, prompt::system_policy()));
    messages.push(ChatMessage::text(
        Role::System,
        prompt::turn_directives(&turn.key, turn.band, structured_judgment),
    ));
    messages.extend(
        history
            .into_iter()
            .map(|(role, content)| ChatMessage::text(Role::from_db(&role), content)),
    );
    messages.push(ChatMessage::user_parts(user_parts(request)));
    messages
}

fn user_parts(request: &ChatRequest) -> Vec<ContentPart> {
    let text = request.message.trim();
    let text = if text.is_empty() {
        DEFAULT_IMAGE_PROMPT
    } else {
        text
    };

    let mut parts = vec![ContentPart::Text {
        text: text.to_string(),
    }];
    parts.extend(request.images.iter().map(|url| ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: url.trim().to_string(),
        },
    }));
    parts
}

/// Images are not kept in history; only a marker that they were sent.
fn history_entry(request: &ChatRequest) -> String {
    let text = request.message.trim();
    match (text.is_empty(), request.images.len()) {
        (_, 0) => text.to_string(),
        (true, n) => format!("[{n} image(s) attached]"),
        (false, n) => format!("{text}\n[{n} image(s) attached]"),
    }
}
