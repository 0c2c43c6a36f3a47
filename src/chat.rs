//! The chat loop.
//!
//! Each session moves through `Idle → AwaitingInput → Processing →
//! AwaitingInput`. One input is handled to completion, including the
//! completion call, before the next one is accepted; callers enforce that
//! by holding the session lock across [`ChatLoop::handle_input`].
//!
//! In `Processing` the loop either unlocks admin (exact secret match while
//! the admin context is active, no completion call), short-circuits when no
//! knowledge is uploaded, or assembles a prompt and asks the completion
//! client. Every non-blank input yields exactly one assistant message.

use chrono::Utc;
use serde::Serialize;

use crate::completion::{CompletionClient, ReplySource};
use crate::config::{AdminConfig, Config, UnlockMethod};
use crate::knowledge::KnowledgeStore;
use crate::prompt::{assemble, recent_window, PromptMode};
use crate::session::{Message, Session, UnlockError, UnlockStatus};

pub const UNLOCK_ACK: &str = "🔐 Admin panel unlocked.";
pub const NO_KNOWLEDGE: &str =
    "No knowledge has been uploaded yet, so I can't answer questions right now. Please check back later!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Idle,
    AwaitingInput,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Blank input; nothing recorded.
    Ignored,
    AdminUnlocked { acknowledgement: String },
    Answered { reply: String, source: ReplySource },
}

impl TurnOutcome {
    pub fn reply(&self) -> Option<&str> {
        match self {
            TurnOutcome::Ignored => None,
            TurnOutcome::AdminUnlocked { acknowledgement } => Some(acknowledgement),
            TurnOutcome::Answered { reply, .. } => Some(reply),
        }
    }
}

pub struct ChatLoop {
    knowledge: KnowledgeStore,
    client: CompletionClient,
    system_instruction: String,
    history_turns: usize,
    admin_secret: String,
    admin: AdminConfig,
}

impl ChatLoop {
    pub fn new(
        config: &Config,
        knowledge: KnowledgeStore,
        client: CompletionClient,
        admin_secret: String,
    ) -> Self {
        let system_instruction =
            instruction_for(config.chat.mode, config.chat.system_instruction.as_deref());

        Self {
            knowledge,
            client,
            system_instruction,
            history_turns: config.chat.history_turns,
            admin_secret,
            admin: config.admin.clone(),
        }
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    pub fn unlock_method(&self) -> UnlockMethod {
        self.admin.unlock
    }

    /// Handles one user input. `admin_context` marks requests coming from
    /// the admin page, where the secret may be typed inline.
    pub async fn handle_input(
        &self,
        session: &mut Session,
        input: &str,
        admin_context: bool,
    ) -> TurnOutcome {
        if input.trim().is_empty() {
            return TurnOutcome::Ignored;
        }

        session.state = ChatState::Processing;
        let outcome = self.process(session, input, admin_context).await;
        session.state = ChatState::AwaitingInput;
        outcome
    }

    async fn process(&self, session: &mut Session, input: &str, admin_context: bool) -> TurnOutcome {
        if admin_context
            && self.admin.unlock == UnlockMethod::Chat
            && !self.admin_secret.is_empty()
            && input == self.admin_secret
        {
            if session.unlock_admin() {
                tracing::info!(session = %session.id(), "admin unlocked from chat");
            }
            session.push_message(Message::assistant(UNLOCK_ACK));
            return TurnOutcome::AdminUnlocked {
                acknowledgement: UNLOCK_ACK.to_string(),
            };
        }

        session.push_message(Message::user(input));
        session.begin_turn(input);

        let knowledge = match self.knowledge.load() {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "knowledge unreadable, treating as empty");
                String::new()
            }
        };

        let (reply, source) = if knowledge.is_empty() {
            (NO_KNOWLEDGE.to_string(), ReplySource::NoKnowledge)
        } else {
            let recent = recent_window(session.turns(), self.history_turns);
            let content = assemble(&knowledge, recent, input);
            let reply = self.client.respond(&self.system_instruction, &content).await;
            (reply.text, reply.source)
        };

        session.push_message(Message::assistant(reply.clone()));
        session.complete_turn(&reply);
        tracing::debug!(session = %session.id(), ?source, "turn answered");

        TurnOutcome::Answered { reply, source }
    }

    /// Dedicated password-field unlock with attempt throttling.
    pub fn unlock_with_password(
        &self,
        session: &mut Session,
        attempt: &str,
    ) -> Result<UnlockStatus, UnlockError> {
        session.try_unlock(attempt, &self.admin_secret, &self.admin, Utc::now())
    }
}

/// A configured instruction wins over the mode's built-in text.
pub fn instruction_for(mode: PromptMode, custom: Option<&str>) -> String {
    custom
        .map(str::to_string)
        .unwrap_or_else(|| mode.system_instruction().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionRequest, CompletionService, APOLOGY};
    use crate::session::Role;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Replies with a fixed result and records every request.
    struct Recorder {
        reply: Option<String>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionService for Recorder {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone().ok_or_else(|| anyhow!("operation timed out"))
        }
    }

    struct Harness {
        _tmp: TempDir,
        chat: ChatLoop,
        service: Arc<Recorder>,
    }

    fn harness(knowledge: &str, reply: Option<&str>, mode: PromptMode) -> Harness {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.knowledge.path = tmp.path().join("knowledge.txt");
        config.chat.mode = mode;

        let store = KnowledgeStore::from_config(&config.knowledge);
        if !knowledge.is_empty() {
            store.save(knowledge).unwrap();
        }

        let service = Arc::new(Recorder {
            reply: reply.map(str::to_string),
            seen: Mutex::new(Vec::new()),
        });
        let client = CompletionClient::new(service.clone(), &config.completion);
        let chat = ChatLoop::new(&config, store, client, "@supersecret".to_string());
        Harness {
            _tmp: tmp,
            chat,
            service,
        }
    }

    #[tokio::test]
    async fn strict_mode_answer_updates_session() {
        let h = harness(
            "Bilal is a software engineer.",
            Some("He is a software engineer."),
            PromptMode::Strict,
        );
        let mut session = Session::new("Hi!", 100);

        let outcome = h
            .chat
            .handle_input(&mut session, "What does Bilal do?", false)
            .await;
        assert_eq!(
            outcome,
            TurnOutcome::Answered {
                reply: "He is a software engineer.".to_string(),
                source: ReplySource::Completion,
            }
        );

        let seen = h.service.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages[0].content, PromptMode::Strict.system_instruction());
        let content = &seen[0].messages[1].content;
        assert!(content.contains("Bilal is a software engineer."));
        assert!(content.contains("Question:\nWhat does Bilal do?"));

        let last = session.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "He is a software engineer.");
        assert_eq!(session.turns().len(), 1);
        assert_eq!(session.turns()[0].question, "What does Bilal do?");
        assert_eq!(session.turns()[0].answer, "He is a software engineer.");
        assert_eq!(session.state(), ChatState::AwaitingInput);
    }

    #[tokio::test]
    async fn empty_knowledge_short_circuits() {
        let h = harness("", Some("should not be used"), PromptMode::Lenient);
        let mut session = Session::new("", 100);

        let outcome = h.chat.handle_input(&mut session, "anything?", false).await;
        assert_eq!(outcome.reply(), Some(NO_KNOWLEDGE));
        assert!(h.service.seen.lock().unwrap().is_empty());
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.turns()[0].answer, NO_KNOWLEDGE);
    }

    #[tokio::test]
    async fn timeout_yields_one_apology_and_session_recovers() {
        let h = harness("facts", None, PromptMode::Lenient);
        let mut session = Session::new("", 100);

        let outcome = h.chat.handle_input(&mut session, "first", false).await;
        assert_eq!(outcome.reply(), Some(APOLOGY));
        let assistant_count = session
            .messages()
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        assert_eq!(assistant_count, 1);

        let again = h.chat.handle_input(&mut session, "second", false).await;
        assert!(matches!(again, TurnOutcome::Answered { .. }));
        assert_eq!(session.turns().len(), 2);
        assert_eq!(session.state(), ChatState::AwaitingInput);
    }

    #[tokio::test]
    async fn exact_secret_in_admin_context_unlocks_without_completion() {
        let h = harness("facts", Some("reply"), PromptMode::Lenient);
        let mut session = Session::new("", 100);

        let outcome = h.chat.handle_input(&mut session, "@supersecret", true).await;
        assert!(matches!(outcome, TurnOutcome::AdminUnlocked { .. }));
        assert!(session.admin_unlocked());
        assert!(h.service.seen.lock().unwrap().is_empty());
        assert!(session.turns().is_empty());
        assert_eq!(session.messages(), &[Message::assistant(UNLOCK_ACK)]);
    }

    #[tokio::test]
    async fn other_inputs_leave_admin_locked() {
        let h = harness("facts", Some("reply"), PromptMode::Lenient);
        let mut session = Session::new("", 100);

        for input in ["@SUPERSECRET", " @supersecret", "supersecret", "hello"] {
            h.chat.handle_input(&mut session, input, true).await;
        }
        // Correct secret outside the admin context is just a question.
        h.chat.handle_input(&mut session, "@supersecret", false).await;

        assert!(!session.admin_unlocked());
        assert_eq!(h.service.seen.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let h = harness("facts", Some("reply"), PromptMode::Lenient);
        let mut session = Session::new("hi", 100);
        assert_eq!(
            h.chat.handle_input(&mut session, "   ", false).await,
            TurnOutcome::Ignored
        );
        assert_eq!(session.messages().len(), 1);
        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn prompt_carries_recent_turns_including_pending() {
        let h = harness("facts", Some("ok"), PromptMode::Lenient);
        let mut session = Session::new("", 100);
        for q in ["q1", "q2", "q3", "q4"] {
            h.chat.handle_input(&mut session, q, false).await;
        }

        let seen = h.service.seen.lock().unwrap();
        let last = &seen[3].messages[1].content;
        assert!(!last.contains("User: q1"));
        assert!(last.contains("User: q2\nBot: ok\nUser: q3\nBot: ok\nUser: q4\nBot: \n"));
    }

    #[tokio::test]
    async fn password_mode_ignores_inline_secret() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.knowledge.path = tmp.path().join("knowledge.txt");
        config.admin.unlock = UnlockMethod::Password;
        config.admin.max_failed_attempts = 2;

        let service = Arc::new(Recorder {
            reply: Some("r".to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let chat = ChatLoop::new(
            &config,
            KnowledgeStore::from_config(&config.knowledge),
            CompletionClient::new(service, &config.completion),
            "pw".to_string(),
        );
        let mut session = Session::new("", 100);

        chat.handle_input(&mut session, "pw", true).await;
        assert!(!session.admin_unlocked());

        assert_eq!(
            chat.unlock_with_password(&mut session, "nope"),
            Err(UnlockError::WrongSecret { remaining: 1 })
        );
        assert_eq!(
            chat.unlock_with_password(&mut session, "pw"),
            Ok(UnlockStatus::Unlocked)
        );
        assert!(session.admin_unlocked());
    }

    #[test]
    fn custom_instruction_overrides_mode() {
        assert_eq!(instruction_for(PromptMode::Strict, Some("be brief")), "be brief");
        assert_eq!(
            instruction_for(PromptMode::Lenient, None),
            PromptMode::Lenient.system_instruction()
        );
    }
}
