//! One chat session's visible state and the turn that drives it.
//!
//! Network results are applied through [`ChatController::commit`], which checks
//! the caller's [`Ticket`] against the session epoch while holding the state
//! lock. Navigating to another chat advances the epoch, so anything still in
//! flight for the previous chat is dropped instead of shown.

mod epoch;

pub use epoch::{ SessionEpoch, Ticket };

use log::{ debug, error, info, warn };
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::config::framework;
use crate::generation::{ GenerationError, Generator };
use crate::models::api::GenerateRequest;
use crate::models::chat::{
    chat_title_from,
    Chat,
    ChatUpdate,
    ChatWithMessages,
    DisplayMessage,
    MessageRole,
    PromptMessage,
};
use crate::models::profile::{ BusinessProfile, ProfileContext };
use crate::models::user::Caller;
use crate::store::{ CopyStore, StoreError };

const EMPTY_MESSAGE: &str = "Message cannot be empty";
const CREATE_FAILED: &str = "Failed to create new chat. Please try again.";
const LOAD_FAILED: &str = "Failed to load chat. Please try again.";
const CHAT_NOT_FOUND: &str = "Chat not found";
const TURN_FAILED: &str = "Failed to process your message. Please try again.";

#[derive(Debug, ThisError)]
pub enum ControllerError {
    #[error("{}", EMPTY_MESSAGE)]
    EmptyMessage,

    #[error("failed to create chat: {0}")]
    CreateChat(#[source] StoreError),

    #[error("failed to load chat: {0}")]
    LoadChat(#[source] StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// The active chat changed before the turn finished.
    Abandoned,
    /// Another turn was still generating.
    Ignored,
}

/// The chat a message was sent to, fixed at the moment it was sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendTarget {
    ticket: Ticket,
    chat_id: Option<String>,
}

impl SendTarget {
    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }
}

/// Changes to the visible state, in the order they were applied.
#[derive(Clone, Debug, PartialEq)]
pub enum ViewEvent {
    Reset,
    ChatLoaded {
        chat: Chat,
        messages: Vec<DisplayMessage>,
    },
    Appended(DisplayMessage),
    Reconciled {
        temp_id: String,
        message: DisplayMessage,
    },
    Generating(bool),
    ProfileSelected(Option<BusinessProfile>),
    Error(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ViewState {
    /// Set as soon as navigation starts, before the chat has loaded.
    pub active_chat_id: Option<String>,
    pub chat: Option<Chat>,
    pub messages: Vec<DisplayMessage>,
    pub generating: bool,
    pub error: Option<String>,
    pub profile: Option<BusinessProfile>,
    pub framework: String,
}

impl ViewState {
    fn new(framework_id: &str) -> Self {
        Self {
            active_chat_id: None,
            chat: None,
            messages: Vec::new(),
            generating: false,
            error: None,
            profile: None,
            framework: framework::legacy_convert(framework_id).to_string(),
        }
    }

    fn reset_for(&mut self, chat_id: Option<String>) {
        self.active_chat_id = chat_id;
        self.chat = None;
        self.messages.clear();
        self.generating = false;
        self.error = None;
    }

    fn fail(&mut self, message: &str) -> Vec<ViewEvent> {
        self.error = Some(message.to_string());
        let mut events = vec![ViewEvent::Error(message.to_string())];
        if self.generating {
            self.generating = false;
            events.push(ViewEvent::Generating(false));
        }
        events
    }
}

struct Inner {
    epoch: SessionEpoch,
    view: ViewState,
}

pub struct ChatController {
    caller: Caller,
    store: Arc<dyn CopyStore>,
    generator: Arc<dyn Generator>,
    inner: Mutex<Inner>,
    events: Option<UnboundedSender<ViewEvent>>,
}

impl ChatController {
    pub fn new(
        caller: Caller,
        store: Arc<dyn CopyStore>,
        generator: Arc<dyn Generator>,
        default_framework: &str
    ) -> Self {
        Self {
            caller,
            store,
            generator,
            inner: Mutex::new(Inner {
                epoch: SessionEpoch::new(),
                view: ViewState::new(default_framework),
            }),
            events: None,
        }
    }

    /// Applied changes are also sent to `events`.
    pub fn with_events(mut self, events: UnboundedSender<ViewEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub async fn snapshot(&self) -> ViewState {
        self.inner.lock().await.view.clone()
    }

    pub async fn ticket(&self) -> Ticket {
        self.inner.lock().await.epoch.ticket()
    }

    async fn is_current(&self, ticket: Ticket) -> bool {
        self.inner.lock().await.epoch.is_current(ticket)
    }

    fn emit(&self, events: Vec<ViewEvent>) {
        if let Some(tx) = &self.events {
            for event in events {
                // a closed receiver just means nobody is watching any more
                let _ = tx.send(event);
            }
        }
    }

    fn apply<F>(&self, inner: &mut Inner, ticket: Ticket, f: F) -> bool
        where F: FnOnce(&mut ViewState) -> Vec<ViewEvent>
    {
        if !inner.epoch.is_current(ticket) {
            return false;
        }
        let events = f(&mut inner.view);
        self.emit(events);
        true
    }

    /// Runs `f` against the visible state if `ticket` is still current.
    /// Returns whether it ran.
    pub async fn commit<F>(&self, ticket: Ticket, f: F) -> bool
        where F: FnOnce(&mut ViewState) -> Vec<ViewEvent>
    {
        let mut inner = self.inner.lock().await;
        self.apply(&mut inner, ticket, f)
    }

    fn enter(&self, inner: &mut Inner, chat_id: Option<String>) -> Ticket {
        let ticket = inner.epoch.advance();
        inner.view.reset_for(chat_id);
        self.emit(vec![ViewEvent::Reset]);
        ticket
    }

    async fn navigate(&self, chat_id: Option<String>) -> Ticket {
        let mut inner = self.inner.lock().await;
        self.enter(&mut inner, chat_id)
    }

    /// Switches to an existing chat and loads its history.
    pub async fn open_chat(&self, chat_id: &str) -> Result<(), ControllerError> {
        let ticket = self.navigate(Some(chat_id.to_string())).await;
        self.load_chat(ticket, chat_id).await.map(|_| ())
    }

    /// Loads `chat_id` into the view. Returns whether the result was shown.
    async fn load_chat(&self, ticket: Ticket, chat_id: &str) -> Result<bool, ControllerError> {
        let loaded = match self.store.get_chat(&self.caller, chat_id).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Error loading chat {}: {}", chat_id, e);
                let message = match e {
                    StoreError::NotFound(_) => CHAT_NOT_FOUND,
                    _ => LOAD_FAILED,
                };
                self.commit(ticket, |view| view.fail(message)).await;
                return Err(ControllerError::LoadChat(e));
            }
        };

        let profile = match loaded.chat.business_profile_id.as_deref() {
            Some(profile_id) =>
                match self.store.get_profile(&self.caller, profile_id).await {
                    Ok(profile) => Some(profile),
                    Err(e) => {
                        warn!("Could not load profile {} for chat {}: {}", profile_id, chat_id, e);
                        None
                    }
                }
            None => None,
        };

        let ChatWithMessages { chat, messages } = loaded;
        let messages: Vec<DisplayMessage> = messages.into_iter().map(DisplayMessage::persisted).collect();
        let applied = self.commit(ticket, move |view| {
            view.framework = framework::legacy_convert(&chat.framework).to_string();
            let mut events = Vec::new();
            if profile.is_some() && view.profile != profile {
                view.profile = profile.clone();
                events.push(ViewEvent::ProfileSelected(profile));
            }
            view.chat = Some(chat.clone());
            view.messages = messages.clone();
            events.insert(0, ViewEvent::ChatLoaded { chat, messages });
            events
        }).await;
        if !applied {
            info!("Discarding load of chat {} because the active chat changed", chat_id);
        }
        Ok(applied)
    }

    /// Leaves the active chat; the next message starts a new one.
    pub async fn new_chat(&self) {
        self.navigate(None).await;
    }

    /// Pins a message to the chat that is active right now.
    ///
    /// Navigation that happens after this call makes the target stale, so a
    /// message can never land in a chat the user opened later.
    pub async fn begin_send(&self) -> SendTarget {
        let inner = self.inner.lock().await;
        SendTarget {
            ticket: inner.epoch.ticket(),
            chat_id: inner.view.active_chat_id.clone(),
        }
    }

    /// Submits to the active chat, or starts one when there is none.
    pub async fn send(&self, content: &str) -> Result<TurnOutcome, ControllerError> {
        let target = self.begin_send().await;
        self.send_to(target, content).await
    }

    pub async fn send_to(&self, target: SendTarget, content: &str) -> Result<TurnOutcome, ControllerError> {
        match target.chat_id {
            Some(chat_id) => self.submit_on(target.ticket, &chat_id, content, false).await,
            None => self.start_chat_on(target.ticket, content).await,
        }
    }

    async fn reject_empty(&self) -> ControllerError {
        let ticket = self.ticket().await;
        self.commit(ticket, |view| {
            view.error = Some(EMPTY_MESSAGE.to_string());
            vec![ViewEvent::Error(EMPTY_MESSAGE.to_string())]
        }).await;
        ControllerError::EmptyMessage
    }

    /// Creates a chat titled after `content`, opens it and runs the first turn.
    async fn start_chat_on(&self, ticket: Ticket, content: &str) -> Result<TurnOutcome, ControllerError> {
        if content.trim().is_empty() {
            return Err(self.reject_empty().await);
        }

        let (framework_id, profile_id) = {
            let mut inner = self.inner.lock().await;
            if !inner.epoch.is_current(ticket) {
                info!("Dropping first message because the view changed before it was sent");
                return Ok(TurnOutcome::Abandoned);
            }
            if inner.view.generating {
                return Ok(TurnOutcome::Ignored);
            }
            self.apply(&mut inner, ticket, |view| {
                view.generating = true;
                view.error = None;
                vec![ViewEvent::Generating(true)]
            });
            (inner.view.framework.clone(), inner.view.profile.as_ref().map(|p| p.id.clone()))
        };

        let title = chat_title_from(content);
        let chat = match
            self.store.create_chat(&self.caller, &title, &framework_id, profile_id.as_deref()).await
        {
            Ok(chat) => chat,
            Err(e) => {
                error!("Error creating chat: {}", e);
                self.commit(ticket, |view| view.fail(CREATE_FAILED)).await;
                return Err(ControllerError::CreateChat(e));
            }
        };
        info!("Created chat {} titled '{}'", chat.id, chat.title);

        let chat_ticket = {
            let mut inner = self.inner.lock().await;
            if !inner.epoch.is_current(ticket) {
                info!("Not opening chat {} because the active chat changed", chat.id);
                return Ok(TurnOutcome::Abandoned);
            }
            let chat_ticket = self.enter(&mut inner, Some(chat.id.clone()));
            // the first turn still owns the indicator while the chat loads
            inner.view.generating = true;
            self.emit(vec![ViewEvent::Generating(true)]);
            chat_ticket
        };

        if !self.load_chat(chat_ticket, &chat.id).await? {
            info!("Abandoning first message for chat {} because the active chat changed", chat.id);
            return Ok(TurnOutcome::Abandoned);
        }
        self.submit_on(chat_ticket, &chat.id, content, true).await
    }

    /// Runs one turn against `chat_id` as long as `ticket` stays current.
    /// `claimed` means the caller already raised the generating flag for it.
    async fn submit_on(
        &self,
        ticket: Ticket,
        chat_id: &str,
        content: &str,
        claimed: bool
    ) -> Result<TurnOutcome, ControllerError> {
        if content.trim().is_empty() {
            return Err(self.reject_empty().await);
        }

        let (user_temp_id, request) = {
            let mut inner = self.inner.lock().await;
            if !inner.epoch.is_current(ticket) {
                info!("Dropping message for chat {} because the active chat changed", chat_id);
                return Ok(TurnOutcome::Abandoned);
            }
            if inner.view.generating && !claimed {
                debug!("Ignoring submission while a response is generating");
                return Ok(TurnOutcome::Ignored);
            }
            let pending = DisplayMessage::pending(Some(chat_id.to_string()), MessageRole::User, content);
            let temp_id = pending.id().to_string();

            let view = &inner.view;
            let mut previous: Vec<PromptMessage> = view.messages
                .iter()
                .map(DisplayMessage::to_prompt_message)
                .collect();
            previous.push(pending.to_prompt_message());
            let request = GenerateRequest {
                prompt: content.to_string(),
                framework: view.framework.clone(),
                business_profile: view.profile.as_ref().map(ProfileContext::from),
                previous_messages: previous,
            };

            self.apply(&mut inner, ticket, |view| {
                let mut events = Vec::new();
                if !view.generating {
                    view.generating = true;
                    events.push(ViewEvent::Generating(true));
                }
                view.error = None;
                view.messages.push(pending.clone());
                events.push(ViewEvent::Appended(pending));
                events
            });
            (temp_id, request)
        };

        self.persist(ticket, chat_id, MessageRole::User, content, &user_temp_id).await;
        if !self.is_current(ticket).await {
            info!("Abandoning AI response because chat changed");
            return Ok(TurnOutcome::Abandoned);
        }

        let response = match self.generator.generate(&request).await {
            Ok(text) => text,
            Err(e) => {
                error!("Error in chat submission: {}", e);
                self.commit(ticket, |view| view.fail(TURN_FAILED)).await;
                return Err(e.into());
            }
        };

        let assistant = DisplayMessage::pending(Some(chat_id.to_string()), MessageRole::Assistant, &response);
        let assistant_temp_id = assistant.id().to_string();
        let shown = self.commit(ticket, |view| {
            view.messages.push(assistant.clone());
            vec![ViewEvent::Appended(assistant)]
        }).await;
        if !shown {
            info!("Abandoning AI response update because chat changed");
            return Ok(TurnOutcome::Abandoned);
        }

        self.persist(ticket, chat_id, MessageRole::Assistant, &response, &assistant_temp_id).await;
        self.commit(ticket, |view| {
            view.generating = false;
            vec![ViewEvent::Generating(false)]
        }).await;
        Ok(TurnOutcome::Completed)
    }

    /// Saves a message; failures leave the pending copy in place.
    async fn persist(&self, ticket: Ticket, chat_id: &str, role: MessageRole, content: &str, temp_id: &str) {
        let saved = match self.store.add_message(&self.caller, chat_id, role, content).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!("Failed to save {} message to chat {}: {}", role, chat_id, e);
                return;
            }
        };
        let applied = self.commit(ticket, |view| {
            let Some(message) = view.messages.iter_mut().find(|m| m.temp_id() == Some(temp_id)) else {
                return Vec::new();
            };
            if !message.reconcile(temp_id, &saved) {
                return Vec::new();
            }
            vec![ViewEvent::Reconciled {
                temp_id: temp_id.to_string(),
                message: message.clone(),
            }]
        }).await;
        if !applied {
            debug!("Dropping reconcile of {} because the active chat changed", temp_id);
        }
    }

    /// Picks the profile used for the next turns. `None` clears it.
    pub async fn select_profile(&self, profile_id: Option<&str>) -> Result<(), ControllerError> {
        let ticket = self.ticket().await;
        let profile = match profile_id {
            Some(id) => Some(self.store.get_profile(&self.caller, id).await?),
            None => None,
        };
        self.commit(ticket, |view| {
            view.profile = profile.clone();
            vec![ViewEvent::ProfileSelected(profile)]
        }).await;
        Ok(())
    }

    /// Preselects the user's default business profile, or their newest one
    /// when none is marked default. An explicit choice is left alone.
    pub async fn load_default_profile(&self) -> Result<(), ControllerError> {
        let ticket = self.ticket().await;
        let profile = match self.store.get_default_profile(&self.caller).await? {
            Some(profile) => Some(profile),
            None => self.store.list_profiles(&self.caller).await?.into_iter().next(),
        };
        let Some(profile) = profile else {
            debug!("User {} has no business profiles", self.caller.user_id);
            return Ok(());
        };
        self.commit(ticket, |view| {
            if view.profile.is_some() {
                return Vec::new();
            }
            view.profile = Some(profile.clone());
            vec![ViewEvent::ProfileSelected(Some(profile))]
        }).await;
        Ok(())
    }

    /// Picks the framework; an active chat is updated in the store too.
    pub async fn select_framework(&self, framework_id: &str) {
        let framework_id = framework::legacy_convert(framework_id);
        let ticket = self.ticket().await;
        let mut chat_id = None;
        self.commit(ticket, |view| {
            view.framework = framework_id.to_string();
            chat_id = view.chat.as_ref().map(|c| c.id.clone());
            Vec::new()
        }).await;

        let Some(chat_id) = chat_id else {
            return;
        };
        let update = ChatUpdate { framework: Some(framework_id.to_string()), ..Default::default() };
        match self.store.update_chat(&self.caller, &chat_id, &update).await {
            Ok(chat) => {
                self.commit(ticket, |view| {
                    view.chat = Some(chat);
                    Vec::new()
                }).await;
            }
            Err(e) => warn!("Failed to save framework for chat {}: {}", chat_id, e),
        }
    }
}
