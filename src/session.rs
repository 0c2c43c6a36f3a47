//! Per-session chat state and the process-wide session map.
//!
//! A [`Session`] owns the displayed [`Message`] log, the [`ChatTurn`]
//! question/answer log, and the admin-unlock flag. Sessions are shared
//! through [`SessionStore`] as `Arc<Mutex<Session>>`; holding the lock for a
//! whole turn serializes input within one session while different sessions
//! run concurrently.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chat::ChatState;
use crate::config::AdminConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One displayed chat bubble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One question/answer record. The answer is empty until the reply lands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub question: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(question: String, answer: String) -> Self {
        Self {
            question,
            answer,
            timestamp: Utc::now(),
        }
    }
}

/// Successful outcome of [`Session::try_unlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    Unlocked,
    AlreadyUnlocked,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnlockError {
    #[error("wrong admin secret ({remaining} attempts left)")]
    WrongSecret { remaining: u32 },
    #[error("too many failed attempts; try again after {until}")]
    LockedOut { until: DateTime<Utc> },
}

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    messages: Vec<Message>,
    turns: Vec<ChatTurn>,
    admin_unlocked: bool,
    failed_attempts: u32,
    locked_until: Option<DateTime<Utc>>,
    max_history: usize,
    pub(crate) state: ChatState,
}

impl Session {
    pub fn new(greeting: &str, max_history: usize) -> Self {
        let mut session = Self {
            id: Uuid::new_v4(),
            messages: Vec::new(),
            turns: Vec::new(),
            admin_unlocked: false,
            failed_attempts: 0,
            locked_until: None,
            max_history: max_history.max(1),
            state: ChatState::Idle,
        };
        if !greeting.is_empty() {
            session.push_message(Message::assistant(greeting));
        }
        session.state = ChatState::AwaitingInput;
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn admin_unlocked(&self) -> bool {
        self.admin_unlocked
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        evict_front(&mut self.messages, self.max_history);
    }

    /// Appends a pending turn (empty answer) for `question`.
    pub fn begin_turn(&mut self, question: &str) {
        self.turns
            .push(ChatTurn::new(question.to_string(), String::new()));
        evict_front(&mut self.turns, self.max_history);
    }

    /// Fills the answer of the most recent turn and refreshes its timestamp.
    pub fn complete_turn(&mut self, answer: &str) {
        if let Some(turn) = self.turns.last_mut() {
            turn.answer = answer.to_string();
            turn.timestamp = Utc::now();
        }
    }

    /// Sets the unlock flag. Returns `true` only on the false → true edge.
    pub fn unlock_admin(&mut self) -> bool {
        let changed = !self.admin_unlocked;
        self.admin_unlocked = true;
        self.failed_attempts = 0;
        self.locked_until = None;
        changed
    }

    /// Password-field unlock with attempt throttling.
    ///
    /// After `policy.max_failed_attempts` consecutive misses the session is
    /// locked for `policy.lockout_secs`; attempts during the lockout are
    /// rejected without comparing.
    pub fn try_unlock(
        &mut self,
        attempt: &str,
        secret: &str,
        policy: &AdminConfig,
        now: DateTime<Utc>,
    ) -> Result<UnlockStatus, UnlockError> {
        if self.admin_unlocked {
            return Ok(UnlockStatus::AlreadyUnlocked);
        }

        if let Some(until) = self.locked_until {
            if now < until {
                return Err(UnlockError::LockedOut { until });
            }
            self.locked_until = None;
            self.failed_attempts = 0;
        }

        if !secret.is_empty() && attempt == secret {
            self.unlock_admin();
            tracing::info!(session = %self.id, "admin unlocked");
            return Ok(UnlockStatus::Unlocked);
        }

        self.failed_attempts += 1;
        if self.failed_attempts >= policy.max_failed_attempts {
            let until = now + Duration::seconds(policy.lockout_secs as i64);
            self.locked_until = Some(until);
            self.failed_attempts = 0;
            tracing::warn!(session = %self.id, %until, "admin unlock locked out");
            return Err(UnlockError::LockedOut { until });
        }

        Err(UnlockError::WrongSecret {
            remaining: policy.max_failed_attempts - self.failed_attempts,
        })
    }
}

fn evict_front<T>(log: &mut Vec<T>, cap: usize) {
    if log.len() > cap {
        let excess = log.len() - cap;
        log.drain(..excess);
    }
}

struct Slot {
    session: Arc<Mutex<Session>>,
    last_seen: DateTime<Utc>,
}

/// Process-wide map of live sessions.
///
/// Every lookup refreshes a session's `last_seen`; [`SessionStore::sweep_idle`]
/// drops sessions nobody has touched for the idle window.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<Uuid, Slot>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, greeting: &str, max_history: usize) -> (Uuid, Arc<Mutex<Session>>) {
        let session = Session::new(greeting, max_history);
        let id = session.id();
        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(
            id,
            Slot {
                session: handle.clone(),
                last_seen: Utc::now(),
            },
        );
        (id, handle)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Mutex<Session>>> {
        let mut slot = self.sessions.get_mut(id)?;
        slot.last_seen = Utc::now();
        Some(slot.session.clone())
    }

    /// Removes sessions last seen at or before `now - idle`. Returns how many
    /// were dropped. Handles already held by in-flight requests stay valid.
    pub fn sweep_idle(&self, idle: Duration, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        let cutoff = now - idle;
        self.sessions.retain(|_, slot| slot.last_seen > cutoff);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Sweeps `store` once per `every`, dropping sessions idle for `idle`.
pub fn spawn_idle_sweeper(
    store: Arc<SessionStore>,
    idle: Duration,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let dropped = store.sweep_idle(idle, Utc::now());
            if dropped > 0 {
                tracing::debug!(dropped, live = store.len(), "expired idle sessions");
            }
        }
    })
}
