//! The session store: the collection of conversations and the turns that feed them.
//!
//! All state sits behind one mutex.  Every mutation is a short transaction that never spans
//! an `.await`, so a read after a write always sees the write while unrelated async
//! operations interleave freely.  A turn finds its session by id and its placeholder by
//! index, which lets other sessions be created or removed while a reply is streaming.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use time::OffsetDateTime;

use crate::chat::config::ChatConfig;
use crate::chat::storage::{
    MemoryStorage, PersistedState, STORAGE_KEY, StateStorage, decode_snapshot, encode_snapshot,
};
use crate::decoder::{StreamDecoder, StreamUpdate};
use crate::error::{Error, Result};
use crate::locale;
use crate::observability::{
    SESSION_REMOTE_ERRORS, SESSIONS_CREATED, SESSIONS_REMOVED, SUMMARIES, TURN_DURATION,
    TURN_ERRORS, TURNS,
};
use crate::transport::{self, CancelHandle, ChatTransport, TransportEvent};
use crate::types::{ChatSession, Message, MessageRole};

/// Above this many characters the summarization window is cut to the history length.
const MAX_SUMMARIZE_CHARS: usize = 4000;

/// Longest topic label kept, in characters.
const MAX_TOPIC_CHARS: usize = 50;

/// Characters stripped from the end of a generated topic.
const TOPIC_TRAILERS: &[char] = &[
    '.', ',', '!', '?', ';', ':', '"', '\'', '`', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}',
    '\u{3002}', '\u{ff0c}', '\u{ff01}', '\u{ff1f}', '\u{3001}',
];

/// Quote characters stripped from the start of a generated topic.
const TOPIC_OPENERS: &[char] = &['"', '\'', '`', '\u{201c}', '\u{2018}'];

/// Receives the progress of every turn run by a [`SessionStore`].
pub trait SessionObserver: Send + Sync {
    /// Full text of the reply so far; `done` is true exactly once per turn.
    fn on_message(&self, session_id: &str, text: &str, done: bool);

    /// The turn failed.  Called after the final `on_message`.
    fn on_error(&self, _session_id: &str, _error: &Error) {}
}

/// How a turn ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TurnOutcome {
    Completed,
    Cancelled,
    Failed,
}

struct StoreState {
    data: PersistedState,
    in_flight: HashMap<String, CancelHandle>,
}

impl StoreState {
    fn new(data: PersistedState) -> Self {
        Self {
            data,
            in_flight: HashMap::new(),
        }
    }

    fn session_mut(&mut self, session_id: &str) -> Option<&mut ChatSession> {
        self.data.sessions.iter_mut().find(|s| s.id == session_id)
    }

    fn current(&self) -> Option<&ChatSession> {
        let sessions = &self.data.sessions;
        let index = self.data.current_index.min(sessions.len().saturating_sub(1));
        sessions.get(index)
    }

    fn clamp_current_index(&mut self) {
        let last = self.data.sessions.len().saturating_sub(1);
        self.data.current_index = self.data.current_index.min(last);
    }
}

struct Inner<T> {
    transport: T,
    storage: Arc<dyn StateStorage>,
    state: Mutex<StoreState>,
    observers: Mutex<Vec<Arc<dyn SessionObserver>>>,
}

/// Owns the conversations and drives turns through a [`ChatTransport`].
///
/// Cloning is cheap and every clone refers to the same store.
pub struct SessionStore<T: ChatTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: ChatTransport> Clone for SessionStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ChatTransport> SessionStore<T> {
    /// Creates an empty store that keeps its snapshot in memory.
    pub fn new(transport: T) -> Self {
        Self::with_state(transport, Arc::new(MemoryStorage::new()), empty_state())
    }

    /// Restores a store from `storage`, or starts empty if nothing usable was saved.
    ///
    /// Replies that were still streaming when the snapshot was taken are closed with the
    /// error notice.
    pub fn load(transport: T, storage: Arc<dyn StateStorage>) -> Result<Self> {
        let restored = match storage.load(STORAGE_KEY)? {
            Some(blob) => match decode_snapshot(&blob) {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(error = %err, "discarding unreadable saved state");
                    None
                }
            },
            None => None,
        };
        let mut data = restored.unwrap_or_else(empty_state);
        for session in &mut data.sessions {
            if session.is_streaming() {
                tracing::info!(session_id = %session.id, "closing reply cut off by shutdown");
                for message in session.messages.iter_mut().filter(|m| m.streaming) {
                    message.content = with_error_notice(&message.content);
                    message.streaming = false;
                }
            }
            session.last_summarize_index = session.last_summarize_index.min(session.messages.len());
        }
        tracing::info!(sessions = data.sessions.len(), "loaded saved state");
        let store = Self::with_state(transport, storage, data);
        store.lock_state().clamp_current_index();
        Ok(store)
    }

    fn with_state(transport: T, storage: Arc<dyn StateStorage>, data: PersistedState) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                storage,
                state: Mutex::new(StoreState::new(data)),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The transport this store sends through.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Registers an observer for every later turn.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Ensures the collection holds at least one session.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_session().await
    }

    /// Creates a session on the backend and installs it at the front as the current session.
    ///
    /// Returns the new session's id.  If the backend refuses, the collection is unchanged.
    pub async fn new_session(&self) -> Result<String> {
        let id = self.create_remote_session().await?;
        let mut state = self.lock_state();
        state.data.sessions.insert(0, ChatSession::new(id.clone()));
        state.data.current_index = 0;
        self.save_locked(&state);
        Ok(id)
    }

    /// Deletes the session at `index` on the backend, then locally.
    ///
    /// Removing the only session replaces it with a fresh one.  Removing the current session
    /// selects the one before it; removing any other session keeps the selection.  A turn in
    /// flight for the removed session is cancelled.
    pub async fn remove_session(&self, index: usize) -> Result<()> {
        let (session_id, sole) = {
            let state = self.lock_state();
            let session = state
                .data
                .sessions
                .get(index)
                .ok_or_else(|| no_session_at(index))?;
            (session.id.clone(), state.data.sessions.len() == 1)
        };
        if let Err(err) = self.inner.transport.delete_session(&session_id).await {
            SESSION_REMOTE_ERRORS.click();
            tracing::warn!(session_id = %session_id, error = %err, "failed to delete session");
            return Err(err);
        }
        SESSIONS_REMOVED.click();
        tracing::info!(session_id = %session_id, "removed session");
        self.cancel_turn(&session_id);

        let replacement = if sole {
            self.create_remote_session().await.map(Some)
        } else {
            Ok(None)
        };

        let mut state = self.lock_state();
        if let Some(position) = state.data.sessions.iter().position(|s| s.id == session_id) {
            state.data.sessions.remove(position);
            let current = state.data.current_index;
            if position < current || (position == current && current > 0) {
                state.data.current_index = current - 1;
            }
        }
        if let Ok(Some(id)) = &replacement {
            state.data.sessions.insert(0, ChatSession::new(id.clone()));
            state.data.current_index = 0;
        }
        state.clamp_current_index();
        self.save_locked(&state);
        replacement.map(|_| ())
    }

    /// Selects the session at `index`.
    pub fn select_session(&self, index: usize) -> Result<()> {
        let mut state = self.lock_state();
        if index >= state.data.sessions.len() {
            return Err(no_session_at(index));
        }
        state.data.current_index = index;
        self.save_locked(&state);
        Ok(())
    }

    /// Returns a copy of the current session, creating one first if there are none.
    pub async fn current_session(&self) -> Result<ChatSession> {
        self.ensure_session().await?;
        self.lock_state()
            .current()
            .cloned()
            .ok_or_else(|| Error::session_not_found("no current session"))
    }

    /// Index of the current session.
    pub fn current_index(&self) -> usize {
        let state = self.lock_state();
        state
            .data
            .current_index
            .min(state.data.sessions.len().saturating_sub(1))
    }

    /// Copies of all sessions, most recent first.
    pub fn sessions(&self) -> Vec<ChatSession> {
        self.lock_state().data.sessions.clone()
    }

    /// A copy of the session with the given id.
    pub fn session(&self, session_id: &str) -> Option<ChatSession> {
        self.lock_state()
            .data
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
    }

    /// Returns true while a turn is outstanding for the session.
    pub fn is_turn_in_flight(&self, session_id: &str) -> bool {
        self.lock_state().in_flight.contains_key(session_id)
    }

    /// Sends `text` on the current session and streams the reply into it.
    ///
    /// Returns once the reply is complete.  Blank input is ignored.  Transport failures do
    /// not surface here: they are written into the reply and reported to observers.  A second
    /// submission while the session already has a turn outstanding is rejected with
    /// [`Error::TurnInFlight`].
    pub async fn on_user_input(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.ensure_session().await?;
        let (session_id, placeholder, cancel) = self.begin_turn(text)?;

        TURNS.click();
        let started = Instant::now();
        let outcome = self.run_turn(text, &session_id, placeholder, cancel).await;
        TURN_DURATION.add(started.elapsed().as_secs_f64());
        tracing::debug!(session_id = %session_id, ?outcome, "turn finished");

        {
            let mut state = self.lock_state();
            state.in_flight.remove(&session_id);
            self.save_locked(&state);
        }
        if outcome == TurnOutcome::Completed {
            self.summarize(&session_id).await;
        }
        Ok(())
    }

    /// Cancels the outstanding turn of a session.  Returns false if there was none.
    pub fn cancel_turn(&self, session_id: &str) -> bool {
        match self.lock_state().in_flight.get(session_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// The context window of the current session: the trailing history plus, when a summary
    /// exists, a leading system message carrying it.
    pub fn get_messages_with_memory(&self) -> Vec<Message> {
        let state = self.lock_state();
        match state.current() {
            Some(session) => messages_with_memory(session, &state.data.config),
            None => Vec::new(),
        }
    }

    /// The system message that carries the current session's summary.
    pub fn get_memory_prompt(&self) -> Message {
        let state = self.lock_state();
        let memory = state.current().map(|s| s.memory_prompt.as_str()).unwrap_or("");
        memory_prompt_message(memory)
    }

    /// Generates a topic for, and compresses the history of, the current session.
    pub async fn summarize_session(&self) -> Result<()> {
        let session = self.current_session().await?;
        self.summarize(&session.id).await;
        Ok(())
    }

    /// The current preferences.
    pub fn config(&self) -> ChatConfig {
        self.lock_state().data.config.clone()
    }

    /// Edits the preferences.  The edit is discarded if the result fails validation.
    pub fn update_config<F: FnOnce(&mut ChatConfig)>(&self, f: F) -> Result<()> {
        let mut state = self.lock_state();
        let mut config = state.data.config.clone();
        f(&mut config);
        config.validate()?;
        state.data.config = config;
        self.save_locked(&state);
        Ok(())
    }

    /// Restores the default preferences.
    pub fn reset_config(&self) {
        let mut state = self.lock_state();
        state.data.config = ChatConfig::default();
        self.save_locked(&state);
    }

    /// Cancels all turns, forgets every session and preference, and wipes the saved state.
    ///
    /// Sessions are not deleted on the backend.
    pub fn clear_all_data(&self) -> Result<()> {
        let mut state = self.lock_state();
        for handle in state.in_flight.values() {
            handle.cancel();
        }
        state.data = empty_state();
        tracing::info!("cleared all data");
        self.inner.storage.remove(STORAGE_KEY)
    }

    /// Writes the current state to storage.
    pub fn save(&self) -> Result<()> {
        let state = self.lock_state();
        self.write_snapshot(&state)
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_snapshot(&self, state: &StoreState) -> Result<()> {
        let blob = encode_snapshot(&state.data)?;
        self.inner.storage.save(STORAGE_KEY, &blob)
    }

    fn save_locked(&self, state: &StoreState) {
        if let Err(err) = self.write_snapshot(state) {
            tracing::warn!(error = %err, "failed to save state");
        }
    }

    async fn create_remote_session(&self) -> Result<String> {
        match self.inner.transport.create_session().await {
            Ok(id) => {
                SESSIONS_CREATED.click();
                tracing::info!(session_id = %id, "created session");
                Ok(id)
            }
            Err(err) => {
                SESSION_REMOTE_ERRORS.click();
                tracing::warn!(error = %err, "failed to create session");
                Err(err)
            }
        }
    }

    async fn ensure_session(&self) -> Result<()> {
        if !self.lock_state().data.sessions.is_empty() {
            return Ok(());
        }
        let id = self.create_remote_session().await?;
        let mut state = self.lock_state();
        if state.data.sessions.is_empty() {
            state.data.sessions.push(ChatSession::new(id));
            state.data.current_index = 0;
            self.save_locked(&state);
        } else {
            tracing::debug!(session_id = %id, "collection healed concurrently; leaving session unused");
        }
        Ok(())
    }

    /// Appends the user message and the placeholder, and claims the session for the turn.
    fn begin_turn(&self, text: &str) -> Result<(String, usize, CancelHandle)> {
        let mut state = self.lock_state();
        let StoreState { data, in_flight } = &mut *state;
        let index = data.current_index.min(data.sessions.len().saturating_sub(1));
        let session = data
            .sessions
            .get_mut(index)
            .ok_or_else(|| Error::session_not_found("no current session"))?;
        if in_flight.contains_key(&session.id) {
            return Err(Error::turn_in_flight(session.id.clone()));
        }

        let context = messages_with_memory(session, &data.config);
        tracing::debug!(
            session_id = %session.id,
            context_messages = context.len(),
            "starting turn"
        );
        session.messages.push(Message::user(text));
        session.messages.push(Message::placeholder());
        let placeholder = session.messages.len() - 1;
        let session_id = session.id.clone();

        let cancel = CancelHandle::new();
        in_flight.insert(session_id.clone(), cancel.clone());
        self.save_locked(&state);
        Ok((session_id, placeholder, cancel))
    }

    async fn run_turn(
        &self,
        text: &str,
        session_id: &str,
        placeholder: usize,
        cancel: CancelHandle,
    ) -> TurnOutcome {
        let transport = &self.inner.transport;
        let options = transport.turn_options();
        let mut turn = transport::send_with(transport, text, session_id, options, cancel);
        let mut decoder = StreamDecoder::new();
        while let Some(event) = turn.next_event().await {
            match event {
                TransportEvent::Chunk(bytes) => {
                    for update in decoder.push(&bytes) {
                        self.apply_update(session_id, placeholder, &update);
                    }
                }
                TransportEvent::Done => {
                    for update in decoder.end_of_input() {
                        self.apply_update(session_id, placeholder, &update);
                    }
                }
                TransportEvent::Cancelled => {
                    // A cut-short reply is kept but not counted.
                    if let Some(update) = decoder.finish() {
                        self.write_update(session_id, placeholder, &update, false);
                    }
                    return TurnOutcome::Cancelled;
                }
                TransportEvent::NetworkError(err) | TransportEvent::Timeout(err) => {
                    let partial = decoder.finish().map(|u| u.text).unwrap_or_default();
                    self.fail_turn(session_id, placeholder, &partial, &err);
                    return TurnOutcome::Failed;
                }
            }
            if decoder.is_finished() {
                // Dropping the turn aborts whatever the backend still sends.
                return TurnOutcome::Completed;
            }
        }
        if let Some(update) = decoder.finish() {
            self.apply_update(session_id, placeholder, &update);
        }
        TurnOutcome::Completed
    }

    fn apply_update(&self, session_id: &str, placeholder: usize, update: &StreamUpdate) {
        self.write_update(session_id, placeholder, update, true);
    }

    fn write_update(
        &self,
        session_id: &str,
        placeholder: usize,
        update: &StreamUpdate,
        record_stats: bool,
    ) {
        {
            let mut state = self.lock_state();
            let Some(session) = state.session_mut(session_id) else {
                tracing::debug!(session_id, "session removed during turn; dropping update");
                return;
            };
            let Some(message) = session.messages.get_mut(placeholder) else {
                return;
            };
            if !message.streaming {
                return;
            }
            message.content.clone_from(&update.text);
            if update.done {
                message.streaming = false;
                if record_stats {
                    session.stat.record(&update.text);
                }
                session.last_update = OffsetDateTime::now_utc();
            }
        }
        for observer in self.observers() {
            observer.on_message(session_id, &update.text, update.done);
        }
    }

    fn fail_turn(&self, session_id: &str, placeholder: usize, partial: &str, error: &Error) {
        TURN_ERRORS.click();
        tracing::warn!(session_id, error = %error, "turn failed");
        let content = with_error_notice(partial);
        {
            let mut state = self.lock_state();
            if let Some(session) = state.session_mut(session_id)
                && let Some(message) = session.messages.get_mut(placeholder)
                && message.streaming
            {
                message.content.clone_from(&content);
                message.streaming = false;
            }
        }
        for observer in self.observers() {
            observer.on_message(session_id, &content, true);
            observer.on_error(session_id, error);
        }
    }

    fn session_with_config(&self, session_id: &str) -> Option<(ChatSession, ChatConfig)> {
        let state = self.lock_state();
        let session = state.data.sessions.iter().find(|s| s.id == session_id)?;
        Some((session.clone(), state.data.config.clone()))
    }

    async fn summarize(&self, session_id: &str) {
        let Some((session, config)) = self.session_with_config(session_id) else {
            return;
        };

        if session.has_default_topic() && session.messages.len() >= 3 {
            let request = render_request(&session.messages, locale::TOPIC_PROMPT);
            match transport::collect_response(&self.inner.transport, &request, session_id).await {
                Ok(reply) => {
                    let topic = trim_topic(&reply);
                    if !topic.is_empty() {
                        tracing::info!(session_id, topic = %topic, "named session");
                        let mut state = self.lock_state();
                        if let Some(target) = state.session_mut(session_id) {
                            target.topic = topic;
                        }
                        self.save_locked(&state);
                    }
                }
                Err(err) => tracing::warn!(session_id, error = %err, "topic request failed"),
            }
        }

        let start = session.last_summarize_index.min(session.messages.len());
        let mut window = session.messages[start..].to_vec();
        let length: usize = window.iter().map(|m| m.content.chars().count()).sum();
        if length > MAX_SUMMARIZE_CHARS && config.history_message_count >= 0 {
            let keep = config.history_message_count as usize;
            window = window.split_off(window.len().saturating_sub(keep));
        }
        if length <= config.compress_message_length_threshold {
            return;
        }

        let mut messages = Vec::with_capacity(window.len() + 1);
        if !session.memory_prompt.is_empty() {
            messages.push(memory_prompt_message(&session.memory_prompt));
        }
        messages.extend(window);
        let request = render_request(&messages, locale::SUMMARIZE_PROMPT);
        let captured = session.messages.len();
        match transport::collect_response(&self.inner.transport, &request, session_id).await {
            Ok(summary) => {
                SUMMARIES.click();
                tracing::info!(session_id, length, "summarized session");
                let mut state = self.lock_state();
                if let Some(target) = state.session_mut(session_id) {
                    target.memory_prompt = summary;
                    target.last_summarize_index = captured.min(target.messages.len());
                }
                self.save_locked(&state);
            }
            Err(err) => tracing::warn!(session_id, error = %err, "summary request failed"),
        }
    }
}

fn empty_state() -> PersistedState {
    PersistedState {
        sessions: Vec::new(),
        current_index: 0,
        config: ChatConfig::default(),
    }
}

fn no_session_at(index: usize) -> Error {
    Error::session_not_found(format!("no session at index {index}"))
}

fn with_error_notice(partial: &str) -> String {
    if partial.is_empty() {
        locale::ERROR_NOTICE.to_string()
    } else {
        format!("{partial}\n\n{}", locale::ERROR_NOTICE)
    }
}

/// Builds the system message that carries a session summary.
pub fn memory_prompt_message(memory_prompt: &str) -> Message {
    Message::system(locale::history_prompt(memory_prompt))
}

/// The context window of `session` under `config`.
///
/// Takes the last `history_message_count` messages, or all of them when the count is
/// negative, and prepends the memory message when the session has a summary.  Assistant
/// messages are left out when `send_bot_messages` is off.
pub fn messages_with_memory(session: &ChatSession, config: &ChatConfig) -> Vec<Message> {
    let eligible: Vec<&Message> = session
        .messages
        .iter()
        .filter(|m| config.send_bot_messages || m.role != MessageRole::Assistant)
        .collect();
    let keep = usize::try_from(config.history_message_count).unwrap_or(eligible.len());
    let start = eligible.len().saturating_sub(keep);

    let mut window = Vec::with_capacity(eligible.len() - start + 1);
    if !session.memory_prompt.is_empty() {
        window.push(memory_prompt_message(&session.memory_prompt));
    }
    window.extend(eligible[start..].iter().map(|m| (*m).clone()));
    window
}

/// Cleans a generated topic label: surrounding whitespace, leading quotes and trailing
/// punctuation or quotes are removed, and the result is capped at fifty characters.
pub fn trim_topic(topic: &str) -> String {
    let trimmed = topic
        .trim()
        .trim_start_matches(TOPIC_OPENERS)
        .trim_end_matches(TOPIC_TRAILERS)
        .trim();
    let capped: String = trimmed.chars().take(MAX_TOPIC_CHARS).collect();
    capped.trim_end().to_string()
}

/// Flattens messages and a closing instruction into the single text the backend accepts.
fn render_request(messages: &[Message], instruction: &str) -> String {
    let mut request = String::new();
    for message in messages {
        request.push_str(&format!("{}: {}\n\n", message.role, message.content));
    }
    request.push_str(instruction);
    request
}
