//! The conversation/message state controller.
//!
//! `ChatController` owns the signed-in user's conversation set, the message
//! log of the active conversation, and the lifecycle of in-flight reply
//! requests. All durable state is mirrored into the injected
//! [`StorageAdapter`]; the UI observes the controller through the snapshot
//! getters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::REPLY_ERROR_MESSAGE;
use crate::models::{Conversation, Feedback, Message, Sender};
use crate::services::conversation::{derive_title, last_user_message, plan_regeneration};
use crate::services::identity::IdentitySource;
use crate::services::preferences::PreferencesService;
use crate::services::reply::{ReplyError, ReplyProvider};
use crate::services::storage::{
    active_conversation_key, conversations_key, messages_key, user_prefix, StorageAdapter,
};

/// At most one of these exists per conversation id at any instant. The
/// sequence number lets a completing request recognize whether it is still
/// the registered one before touching the pending map.
#[derive(Debug, Clone)]
struct PendingRequest {
    seq: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct ControllerState {
    user_id: Option<String>,
    conversations: Vec<Conversation>,
    active: Option<Conversation>,
    /// Ordered log of the active conversation, oldest first.
    messages: Vec<Message>,
    last_user_message: String,
    pending: HashMap<String, PendingRequest>,
}

fn is_focused(st: &ControllerState, conversation_id: &str) -> bool {
    st.active.as_ref().is_some_and(|c| c.id == conversation_id)
}

pub struct ChatController {
    storage: Arc<dyn StorageAdapter>,
    identity: Arc<dyn IdentitySource>,
    replier: Arc<dyn ReplyProvider>,
    state: Arc<Mutex<ControllerState>>,
    next_request_seq: AtomicU64,
}

impl ChatController {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        identity: Arc<dyn IdentitySource>,
        replier: Arc<dyn ReplyProvider>,
    ) -> Self {
        Self {
            storage,
            identity,
            replier,
            state: Arc::new(Mutex::new(ControllerState::default())),
            next_request_seq: AtomicU64::new(1),
        }
    }

    // --- Observed state ---

    pub fn current_user(&self) -> Option<String> {
        self.state.lock().unwrap().user_id.clone()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().unwrap().conversations.clone()
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn last_user_message(&self) -> String {
        self.state.lock().unwrap().last_user_message.clone()
    }

    /// Whether the active conversation has a reply request in flight. This is
    /// the loading indicator: it follows the user across conversation
    /// switches and clears the instant a request is stopped, while a
    /// background request finishing elsewhere leaves it untouched.
    pub fn is_loading(&self) -> bool {
        let st = self.state.lock().unwrap();
        match &st.active {
            Some(conv) => st.pending.contains_key(&conv.id),
            None => false,
        }
    }

    pub fn is_pending(&self, conversation_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .pending
            .contains_key(conversation_id)
    }

    // --- Identity binding ---

    /// Re-read the identity source and reconcile. Loads the user's persisted
    /// conversations on sign-in (creating one if none exist), tears down
    /// in-memory state on sign-out. Persisted data is never touched by
    /// sign-out.
    pub async fn sync_identity(&self) -> Result<()> {
        let user = if self.identity.is_authenticated() {
            self.identity.current_user()
        } else {
            None
        };
        let previous = self.state.lock().unwrap().user_id.clone();

        match (user, previous) {
            (Some(uid), Some(prev)) if uid == prev => Ok(()),
            (Some(uid), _) => {
                self.teardown();
                self.load_user(&uid).await
            }
            (None, Some(_)) => {
                self.teardown();
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    /// Cancel everything in flight and drop in-memory state.
    fn teardown(&self) {
        let mut st = self.state.lock().unwrap();
        for (_, pending) in st.pending.drain() {
            pending.token.cancel();
        }
        st.user_id = None;
        st.conversations.clear();
        st.active = None;
        st.messages.clear();
        st.last_user_message.clear();
    }

    async fn load_user(&self, user_id: &str) -> Result<()> {
        let conversations = self.load_conversations(user_id).await;
        let stored_active = match self.storage.get(&active_conversation_key(user_id)).await {
            Ok(Some(value)) => serde_json::from_value::<String>(value).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to read active conversation for {}: {}", user_id, e);
                None
            }
        };

        // A stored pointer only counts if it names a conversation that still
        // exists; otherwise fall back to the first of the sequence.
        let active = stored_active
            .and_then(|id| conversations.iter().find(|c| c.id == id).cloned())
            .or_else(|| conversations.first().cloned());

        {
            let mut st = self.state.lock().unwrap();
            st.user_id = Some(user_id.to_string());
            st.conversations = conversations;
            st.active = active.clone();
            st.messages.clear();
            st.last_user_message.clear();
        }

        match active {
            Some(conv) => {
                self.storage
                    .set(&active_conversation_key(user_id), json!(conv.id))
                    .await?;
                let messages = self.load_messages(user_id, &conv.id).await;
                let mut st = self.state.lock().unwrap();
                if is_focused(&st, &conv.id) {
                    st.last_user_message = last_user_message(&messages);
                    st.messages = messages;
                }
                Ok(())
            }
            None => {
                self.create_conversation(None).await?;
                Ok(())
            }
        }
    }

    // --- Conversation store ---

    pub async fn new_conversation(&self) -> Result<Conversation> {
        self.create_conversation(None).await
    }

    /// Create a fresh conversation, prepend it to `base` (or the current
    /// sequence), make it active, and persist the result. `base` exists so
    /// delete-all can seed a brand-new single-conversation sequence without
    /// racing against the state it is clearing.
    async fn create_conversation(&self, base: Option<Vec<Conversation>>) -> Result<Conversation> {
        let (user_id, conv, sequence) = {
            let mut st = self.state.lock().unwrap();
            let Some(user_id) = st.user_id.clone() else {
                bail!("No signed-in user");
            };
            let conv = Conversation::new(&user_id);
            let mut sequence = base.unwrap_or_else(|| st.conversations.clone());
            sequence.insert(0, conv.clone());
            st.conversations = sequence.clone();
            st.active = Some(conv.clone());
            st.messages.clear();
            st.last_user_message.clear();
            (user_id, conv, sequence)
        };

        self.persist_conversations(&user_id, &sequence).await?;
        self.storage
            .set(&active_conversation_key(&user_id), json!(conv.id))
            .await?;
        Ok(conv)
    }

    /// Switch focus. A no-op when the conversation is already active, so
    /// redundant selections do not trigger redundant log reloads.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<()> {
        let (user_id, conv) = {
            let mut st = self.state.lock().unwrap();
            if is_focused(&st, conversation_id) {
                return Ok(());
            }
            let Some(conv) = st
                .conversations
                .iter()
                .find(|c| c.id == conversation_id)
                .cloned()
            else {
                tracing::warn!("Ignoring selection of unknown conversation {}", conversation_id);
                return Ok(());
            };
            let Some(user_id) = st.user_id.clone() else {
                return Ok(());
            };
            st.active = Some(conv.clone());
            st.messages.clear();
            st.last_user_message.clear();
            (user_id, conv)
        };

        self.storage
            .set(&active_conversation_key(&user_id), json!(conv.id))
            .await?;

        let messages = self.load_messages(&user_id, &conv.id).await;
        let mut st = self.state.lock().unwrap();
        if is_focused(&st, &conv.id) {
            st.last_user_message = last_user_message(&messages);
            st.messages = messages;
        }
        Ok(())
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let (user_id, sequence, next_active) = {
            let mut st = self.state.lock().unwrap();
            let Some(user_id) = st.user_id.clone() else {
                return Ok(());
            };
            // An in-flight request for a deleted conversation must be
            // discarded, not applied.
            if let Some(pending) = st.pending.remove(conversation_id) {
                pending.token.cancel();
            }
            let before = st.conversations.len();
            st.conversations.retain(|c| c.id != conversation_id);
            if st.conversations.len() == before {
                return Ok(());
            }
            let next_active = if is_focused(&st, conversation_id) {
                let next = st.conversations.first().cloned();
                st.active = next.clone();
                st.messages.clear();
                st.last_user_message.clear();
                Some(next)
            } else {
                None
            };
            (user_id, st.conversations.clone(), next_active)
        };

        self.persist_conversations(&user_id, &sequence).await?;
        self.storage
            .remove(&messages_key(&user_id, conversation_id))
            .await?;

        match next_active {
            Some(Some(conv)) => {
                self.storage
                    .set(&active_conversation_key(&user_id), json!(conv.id))
                    .await?;
                let messages = self.load_messages(&user_id, &conv.id).await;
                let mut st = self.state.lock().unwrap();
                if is_focused(&st, &conv.id) {
                    st.last_user_message = last_user_message(&messages);
                    st.messages = messages;
                }
            }
            Some(None) => {
                self.storage
                    .remove(&active_conversation_key(&user_id))
                    .await?;
            }
            None => {}
        }
        Ok(())
    }

    /// Remove every conversation and every persisted key belonging to the
    /// current user, then leave them with exactly one fresh conversation.
    pub async fn delete_all_conversations(&self) -> Result<Conversation> {
        let user_id = {
            let mut st = self.state.lock().unwrap();
            let Some(user_id) = st.user_id.clone() else {
                bail!("No signed-in user");
            };
            for (_, pending) in st.pending.drain() {
                pending.token.cancel();
            }
            st.conversations.clear();
            st.active = None;
            st.messages.clear();
            st.last_user_message.clear();
            user_id
        };

        self.storage.remove_prefixed(&user_prefix(&user_id)).await?;
        self.create_conversation(Some(Vec::new())).await
    }

    /// Set an explicit title, updating the active snapshot when it matches.
    pub async fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<()> {
        let (user_id, sequence) = {
            let mut st = self.state.lock().unwrap();
            let Some(user_id) = st.user_id.clone() else {
                return Ok(());
            };
            let Some(conv) = st
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            else {
                return Ok(());
            };
            conv.title = title.to_string();
            if let Some(active) = st.active.as_mut() {
                if active.id == conversation_id {
                    active.title = title.to_string();
                }
            }
            (user_id, st.conversations.clone())
        };
        self.persist_conversations(&user_id, &sequence).await
    }

    /// Title a conversation after its first message.
    pub async fn rename_from_first_message(&self, conversation_id: &str, text: &str) -> Result<()> {
        self.rename_conversation(conversation_id, &derive_title(text)).await
    }

    // --- Response controller ---

    /// Send `content` to the active conversation, creating one if needed.
    ///
    /// The target conversation id and its log are captured by value here;
    /// whatever the UI navigates to afterwards, the eventual reply is
    /// persisted under the captured id and applied to the visible log only
    /// if it is still focused.
    pub async fn send_message(&self, content: &str) -> Result<()> {
        if self.state.lock().unwrap().active.is_none() {
            self.create_conversation(None).await?;
        }

        let (user_id, conv, history, pending) = {
            let mut st = self.state.lock().unwrap();
            let Some(user_id) = st.user_id.clone() else {
                bail!("No signed-in user");
            };
            let Some(conv) = st.active.clone() else {
                bail!("No active conversation");
            };
            let history = st.messages.clone();
            let pending = self.register_pending(&mut st, &conv.id);
            (user_id, conv, history, pending)
        };

        // Persist the user's own message up front so a reload mid-request
        // still shows it.
        let mut appended = history.clone();
        appended.push(Message::user(content));
        if let Err(e) = self.persist_messages(&user_id, &conv.id, &appended).await {
            self.finish_pending(&conv.id, pending.seq);
            return Err(e);
        }

        if history.is_empty() {
            if let Err(e) = self.rename_from_first_message(&conv.id, content).await {
                tracing::error!("Failed to set conversation title: {}", e);
            }
        }

        {
            let mut st = self.state.lock().unwrap();
            if is_focused(&st, &conv.id) {
                st.messages = appended.clone();
                st.last_user_message = content.to_string();
            }
        }

        self.run_reply_exchange(
            pending,
            user_id,
            conv.id.clone(),
            content.to_string(),
            history,
            appended,
        )
        .await
    }

    /// Replace an assistant message with a freshly generated reply to the
    /// user message preceding it, discarding everything from the target
    /// onward. No-op for unknown or non-assistant ids; fails when no user
    /// message precedes the target, without mutating anything.
    pub async fn regenerate_message(&self, message_id: &str) -> Result<()> {
        let (user_id, conv, plan) = {
            let st = self.state.lock().unwrap();
            let (Some(user_id), Some(conv)) = (st.user_id.clone(), st.active.clone()) else {
                return Ok(());
            };
            match plan_regeneration(&st.messages, message_id)? {
                Some(plan) => (user_id, conv, plan),
                None => return Ok(()),
            }
        };

        // The truncated log is the persisted and visible state until the new
        // reply lands.
        self.persist_messages(&user_id, &conv.id, &plan.truncated).await?;
        {
            let mut st = self.state.lock().unwrap();
            if is_focused(&st, &conv.id) {
                st.messages = plan.truncated.clone();
            }
        }

        let pending = {
            let mut st = self.state.lock().unwrap();
            self.register_pending(&mut st, &conv.id)
        };

        self.run_reply_exchange(
            pending,
            user_id,
            conv.id.clone(),
            plan.user_content,
            plan.history,
            plan.truncated,
        )
        .await
    }

    /// Stop whatever the active conversation has in flight.
    pub fn stop_generation(&self) {
        let active_id = self
            .state
            .lock()
            .unwrap()
            .active
            .as_ref()
            .map(|c| c.id.clone());
        if let Some(id) = active_id {
            self.stop_conversation(&id);
        }
    }

    /// Cancel a pending request and clear its marker immediately, without
    /// waiting for the cancelled call to unwind.
    pub fn stop_conversation(&self, conversation_id: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(pending) = st.pending.remove(conversation_id) {
            pending.token.cancel();
        }
    }

    // --- Annotators ---

    /// Rate an assistant message in the active conversation. No-op for
    /// unknown ids and user messages.
    pub async fn set_feedback(&self, message_id: &str, feedback: Feedback) -> Result<()> {
        let (user_id, conversation_id, messages) = {
            let mut st = self.state.lock().unwrap();
            let (Some(user_id), Some(conv_id)) = (
                st.user_id.clone(),
                st.active.as_ref().map(|c| c.id.clone()),
            ) else {
                return Ok(());
            };
            let Some(message) = st.messages.iter_mut().find(|m| m.id == message_id) else {
                return Ok(());
            };
            if message.sender != Sender::Assistant {
                return Ok(());
            }
            message.feedback = Some(feedback);
            (user_id, conv_id, st.messages.clone())
        };
        self.persist_messages(&user_id, &conversation_id, &messages).await
    }

    // --- Preferences ---

    pub async fn preferred_language(&self) -> String {
        PreferencesService::preferred_language(self.storage.as_ref()).await
    }

    pub async fn set_preferred_language(&self, tag: &str) -> Result<()> {
        PreferencesService::set_preferred_language(self.storage.as_ref(), tag).await
    }

    // --- Request plumbing ---

    /// Register a fresh pending request for a conversation. A newer request
    /// supersedes a still-pending one, which gets cancelled.
    fn register_pending(&self, st: &mut ControllerState, conversation_id: &str) -> PendingRequest {
        let seq = self.next_request_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let pending = PendingRequest { seq, token };
        if let Some(prior) = st
            .pending
            .insert(conversation_id.to_string(), pending.clone())
        {
            prior.token.cancel();
        }
        pending
    }

    /// Clear the pending marker, but only if it still belongs to this
    /// request; stop, delete, and superseding sends may already have
    /// replaced or removed it.
    fn finish_pending(&self, conversation_id: &str, seq: u64) {
        let mut st = self.state.lock().unwrap();
        if st.pending.get(conversation_id).map(|p| p.seq) == Some(seq) {
            st.pending.remove(conversation_id);
        }
    }

    /// The shared tail of send and regenerate: invoke the reply operation
    /// and reconcile its outcome. `base` is the already-persisted sequence
    /// the assistant reply appends onto; `history` is the context handed to
    /// the replier.
    async fn run_reply_exchange(
        &self,
        pending: PendingRequest,
        user_id: String,
        conversation_id: String,
        content: String,
        history: Vec<Message>,
        base: Vec<Message>,
    ) -> Result<()> {
        let language = PreferencesService::preferred_language(self.storage.as_ref()).await;
        let token = pending.token.clone();

        // The token is advisory to the replier but authoritative here: once
        // cancelled, the cancelled outcome is taken even if the call later
        // resolves.
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(ReplyError::Cancelled),
            result = self.replier.reply(
                &conversation_id,
                &content,
                &history,
                &language,
                token.clone(),
            ) => {
                if token.is_cancelled() {
                    Err(ReplyError::Cancelled)
                } else {
                    result
                }
            }
        };

        let result = match outcome {
            Ok(reply) => {
                self.apply_reply(&user_id, &conversation_id, &content, base, &reply, &language)
                    .await
            }
            Err(ReplyError::Cancelled) => {
                tracing::debug!("Reply for conversation {} cancelled", conversation_id);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Reply failed for conversation {}: {}", conversation_id, e);
                self.record_reply_failure(&user_id, &conversation_id).await
            }
        };

        self.finish_pending(&conversation_id, pending.seq);
        result
    }

    async fn apply_reply(
        &self,
        user_id: &str,
        conversation_id: &str,
        content: &str,
        base: Vec<Message>,
        reply: &str,
        language: &str,
    ) -> Result<()> {
        let mut final_sequence = base;
        final_sequence.push(Message::assistant(reply, language));

        let sequence = {
            let mut st = self.state.lock().unwrap();
            let now = Utc::now();
            if let Some(conv) = st
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                conv.timestamp = now;
            }
            if let Some(active) = st.active.as_mut() {
                if active.id == conversation_id {
                    active.timestamp = now;
                }
            }
            if is_focused(&st, conversation_id) {
                st.messages = final_sequence.clone();
                st.last_user_message = content.to_string();
            }
            st.conversations.clone()
        };

        self.persist_conversations(user_id, &sequence).await?;
        self.persist_messages(user_id, conversation_id, &final_sequence).await?;
        Ok(())
    }

    /// Record a failed exchange as a synthetic assistant message. The base is
    /// the currently persisted log, not the request's snapshot, which may be
    /// stale if the user navigated away mid-request.
    async fn record_reply_failure(&self, user_id: &str, conversation_id: &str) -> Result<()> {
        let mut persisted = self.load_messages(user_id, conversation_id).await;
        persisted.push(Message::error(REPLY_ERROR_MESSAGE));
        self.persist_messages(user_id, conversation_id, &persisted).await?;

        let mut st = self.state.lock().unwrap();
        if is_focused(&st, conversation_id) {
            st.messages = persisted;
        }
        Ok(())
    }

    // --- Storage plumbing ---

    async fn load_conversations(&self, user_id: &str) -> Vec<Conversation> {
        match self.storage.get(&conversations_key(user_id)).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse stored conversations for {}: {}", user_id, e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to load conversations for {}: {}", user_id, e);
                Vec::new()
            }
        }
    }

    async fn load_messages(&self, user_id: &str, conversation_id: &str) -> Vec<Message> {
        match self.storage.get(&messages_key(user_id, conversation_id)).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!(
                    "Failed to parse stored messages for conversation {}: {}",
                    conversation_id,
                    e
                );
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(
                    "Failed to load messages for conversation {}: {}",
                    conversation_id,
                    e
                );
                Vec::new()
            }
        }
    }

    async fn persist_conversations(
        &self,
        user_id: &str,
        conversations: &[Conversation],
    ) -> Result<()> {
        self.storage
            .set(&conversations_key(user_id), serde_json::to_value(conversations)?)
            .await
    }

    async fn persist_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
        messages: &[Message],
    ) -> Result<()> {
        self.storage
            .set(
                &messages_key(user_id, conversation_id),
                serde_json::to_value(messages)?,
            )
            .await
    }
}
