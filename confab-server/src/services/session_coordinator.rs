//! Per-message orchestration of a chat turn.
//!
//! A turn registers the conversation, takes the conversation's generation
//! gate, refreshes the system prompt, persists and buffers the user message,
//! streams the reply to the room and always finishes with a `<done>` marker
//! while the gate is still held.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::StreamExt;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use shared::{
    config::server::GenerationConfig,
    models::{
        ChatTitle, ContentPart, Message, StatusMessage, TurnOptions,
        events::{
            ABORT, ABORT_NOT_FOUND, ABORT_OK, AUTOGEN_CHAT_TITLE, CHAT_BROADCAST, SERVER_MESSAGE,
        },
    },
};
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use super::{
    chat_store::{ChatStore, StoreError},
    faithfulness::score_faithfulness,
    generation_manager::{GateClosed, GenerationManager, GenerationPermit},
    generation_supervisor::{GenerationSupervisor, StopReason},
    generator::{
        GenerationEvent, GenerationRequest, Generator, GeneratorError, ToolContext,
        render_tool_start,
    },
    history::HistoryHandler,
    room_hub::{Outbound, Transport},
    system_prompt::{build_system_prompt, has_new_documents},
    title::derive_title,
};

/// Failures that end a turn before or around generation.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The inbound message is missing required fields.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    /// A store call failed during the named step.
    #[error("failed to {stage}: {source}")]
    Store {
        /// Step that failed.
        stage: &'static str,
        /// Underlying failure.
        #[source]
        source: StoreError,
    },
    /// The conversation's gate went away while waiting for it.
    #[error(transparent)]
    Gate(#[from] GateClosed),
}

fn stage(stage: &'static str) -> impl FnOnce(StoreError) -> CoordinatorError {
    move |source| CoordinatorError::Store { stage, source }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The generator finished its reply.
    Completed,
    /// An abort request stopped the generation.
    Cancelled,
    /// The generation ran past its configured cap.
    TimedOut,
    /// A store or generator failure ended the turn.
    Failed,
}

struct FinishedTurn {
    outcome: TurnOutcome,
    reply: Message,
    model: String,
}

/// Entry point for socket events that touch conversations.
pub struct SessionCoordinator {
    history: HistoryHandler,
    generation: GenerationManager,
    supervisor: Arc<GenerationSupervisor>,
    store: Arc<dyn ChatStore>,
    generator: Arc<dyn Generator>,
    transport: Arc<dyn Transport>,
    settings: GenerationConfig,
    background: TaskTracker,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("history", &self.history)
            .field("generation", &self.generation)
            .field("default_model", &self.settings.default_model)
            .finish_non_exhaustive()
    }
}

impl SessionCoordinator {
    /// Wires the coordinator to its collaborators.
    #[must_use]
    pub fn new(
        history: HistoryHandler,
        store: Arc<dyn ChatStore>,
        generator: Arc<dyn Generator>,
        transport: Arc<dyn Transport>,
        settings: GenerationConfig,
    ) -> Self {
        Self {
            history,
            generation: GenerationManager::new(),
            supervisor: Arc::new(GenerationSupervisor::new(settings.max_generation())),
            store,
            generator,
            transport,
            settings,
            background: TaskTracker::new(),
        }
    }

    /// Conversation registry.
    #[must_use]
    pub fn history(&self) -> &HistoryHandler {
        &self.history
    }

    /// Per-conversation generation gates.
    #[must_use]
    pub fn generation(&self) -> &GenerationManager {
        &self.generation
    }

    /// Running generations, keyed by conversation.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<GenerationSupervisor> {
        &self.supervisor
    }

    /// Waits for background work such as title generation to finish.
    pub async fn drain(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Runs one chat turn for `message`, sent by `connection_id`.
    ///
    /// Never returns an error: failures are reported to the room and every
    /// path ends with a `<done>` marker.
    #[instrument(
        name = "coordinator.chat_message",
        skip(self, message),
        fields(chat_id = %message.chat_id, user_id = %message.user_id, message_id = %message.id)
    )]
    pub async fn handle_chat_message(&self, connection_id: &str, message: Message) -> TurnOutcome {
        if let Err(err) = validate(&message) {
            warn!(error = %err, "rejected chat message");
            let chat_id = message.chat_id.as_str();
            self.transport
                .emit_to(connection_id, status(StatusMessage::new(chat_id, err.to_string())))
                .await;
            self.transport
                .emit_to(connection_id, status(StatusMessage::done(chat_id)))
                .await;
            return TurnOutcome::Failed;
        }

        let chat_id = message.chat_id.clone();
        let options = message.turn_options();
        let mut permit = None;

        let finished = match self
            .run_turn(connection_id, &message, &options, &mut permit)
            .await
        {
            Ok(finished) => Some(finished),
            Err(err) => {
                counter!("confab_generation_failures_total").increment(1);
                error!(error = %err, "chat turn failed");
                self.notify_turn(
                    connection_id,
                    &chat_id,
                    status(StatusMessage::new(&chat_id, err.to_string())),
                )
                .await;
                None
            }
        };

        self.notify_turn(connection_id, &chat_id, status(StatusMessage::done(&chat_id)))
            .await;
        drop(permit);

        // The sender may have disconnected while this turn was queued or running.
        let live = self.transport.room_members(&chat_id).await;
        self.history.reconcile_subscribers(&chat_id, &live).await;

        let Some(finished) = finished else {
            return TurnOutcome::Failed;
        };
        if options.first_message
            && self.settings.title_generation
            && finished.outcome != TurnOutcome::Failed
        {
            self.spawn_title(connection_id, message, finished.reply, finished.model);
        }
        finished.outcome
    }

    /// Sends a turn status to the room and to the sender, which may not have
    /// joined the room yet.
    async fn notify_turn(&self, connection_id: &str, chat_id: &str, outbound: Outbound) {
        self.transport
            .broadcast(chat_id, outbound.clone(), Some(connection_id))
            .await;
        self.transport.emit_to(connection_id, outbound).await;
    }

    async fn run_turn(
        &self,
        connection_id: &str,
        message: &Message,
        options: &TurnOptions,
        permit: &mut Option<GenerationPermit>,
    ) -> Result<FinishedTurn, CoordinatorError> {
        let chat_id = message.chat_id.as_str();
        let user_id = message.user_id.as_str();

        if options.first_message {
            self.store
                .create_chat(chat_id, user_id)
                .await
                .map_err(stage("create chat"))?;
            let mut session = self.transport.get_session(connection_id).await;
            session.chat_id = Some(chat_id.to_string());
            session.user_id = Some(user_id.to_string());
            self.transport.save_session(connection_id, session).await;
            info!("chat created");
        }
        self.history.add_chat(chat_id, None).await;
        self.transport.join(connection_id, chat_id).await;

        *permit = Some(self.acquire_gate(connection_id, chat_id).await?);
        counter!("confab_generation_started_total").increment(1);

        if let Some(system_message) = self
            .refresh_system_message(connection_id, message, options)
            .await?
        {
            self.history.add_system_message(chat_id, system_message).await;
        }

        self.transport
            .broadcast(
                chat_id,
                Outbound::reliable(CHAT_BROADCAST, to_payload(message)),
                Some(connection_id),
            )
            .await;
        self.store
            .create_message(message)
            .await
            .map_err(stage("persist user message"))?;
        self.history
            .add_message(chat_id, message.clone(), connection_id)
            .await;

        let model = self.resolve_model(chat_id, user_id).await?;
        let request = GenerationRequest {
            conversation_id: chat_id.to_string(),
            model: model.clone(),
            history: self.history.transcript(chat_id).await,
            tools: options.personality.tools.clone(),
        };
        let (outcome, mut reply, contexts) = self
            .stream_reply(request, Message::assistant(chat_id, user_id))
            .await;
        if outcome == TurnOutcome::Completed && options.detect_hallucination {
            reply.score =
                score_faithfulness(self.generator.as_ref(), &model, message, &reply, &contexts)
                    .await;
        }

        let keep = match outcome {
            TurnOutcome::Completed => true,
            TurnOutcome::Cancelled | TurnOutcome::TimedOut => !reply.is_blank(),
            TurnOutcome::Failed => false,
        };
        if keep {
            self.transport
                .broadcast(chat_id, Outbound::reliable(SERVER_MESSAGE, to_payload(&reply)), None)
                .await;
            self.store
                .create_message(&reply)
                .await
                .map_err(stage("persist response"))?;
            self.history.record_reply(chat_id, reply.clone()).await;
        }
        info!(?outcome, model = %model, "chat turn finished");

        Ok(FinishedTurn {
            outcome,
            reply,
            model,
        })
    }

    async fn acquire_gate(
        &self,
        connection_id: &str,
        chat_id: &str,
    ) -> Result<GenerationPermit, CoordinatorError> {
        if let Some(permit) = self.generation.try_acquire(chat_id) {
            return Ok(permit);
        }

        counter!("confab_generation_queued_total").increment(1);
        debug!("turn queued behind a running generation");
        self.transport
            .emit_to(connection_id, status(StatusMessage::queued(chat_id)))
            .await;
        let permit = self.generation.acquire(chat_id).await?;
        self.transport
            .emit_to(connection_id, status(StatusMessage::start(chat_id)))
            .await;
        Ok(permit)
    }

    /// Returns the system message to use for this turn, rebuilding and
    /// persisting it when nothing is cached or new documents were attached.
    async fn refresh_system_message(
        &self,
        connection_id: &str,
        message: &Message,
        options: &TurnOptions,
    ) -> Result<Option<Message>, CoordinatorError> {
        let chat_id = message.chat_id.as_str();
        let mut session = self.transport.get_session(connection_id).await;

        let rebuild = session.system_message.is_none()
            || (!options.docs.is_empty()
                && self
                    .has_additional_docs(chat_id, session.docs.as_ref(), &options.docs)
                    .await?);
        if !rebuild {
            return Ok(session.system_message);
        }

        let Some(prompt) = build_system_prompt(
            self.store.as_ref(),
            chat_id,
            &message.user_id,
            &options.personality,
            &options.docs,
        )
        .await
        .map_err(stage("create system prompt"))?
        else {
            return Ok(session.system_message);
        };

        tokio::try_join!(
            self.store.create_message(&prompt.message),
            self.store
                .update_chat(chat_id, &options.personality, &options.docs),
        )
        .map_err(stage("persist system prompt"))?;

        session.system_message = Some(prompt.message.clone());
        session.docs = Some(options.docs.iter().cloned().collect());
        session.docs_token_count = prompt.token_count;
        self.transport.save_session(connection_id, session).await;
        info!(
            documents = prompt.document_ids.len(),
            tokens = prompt.token_count,
            "system prompt rebuilt"
        );

        Ok(Some(prompt.message))
    }

    async fn has_additional_docs(
        &self,
        chat_id: &str,
        cached: Option<&HashSet<String>>,
        docs: &[String],
    ) -> Result<bool, CoordinatorError> {
        let fresh = match cached.filter(|known| !known.is_empty()) {
            Some(known) => has_new_documents(known, docs),
            None => {
                let known = self
                    .store
                    .get_chat_document_ids(chat_id)
                    .await
                    .map_err(stage("load chat documents"))?;
                has_new_documents(&known, docs)
            }
        };
        if fresh {
            info!("additional documents attached");
        }
        Ok(fresh)
    }

    /// Pinned chat model if still supported, else the user's selection, else
    /// the configured default. Pins the result when the chat had no model.
    async fn resolve_model(&self, chat_id: &str, user_id: &str) -> Result<String, CoordinatorError> {
        let pinned = self
            .store
            .get_chat_model(chat_id)
            .await
            .map_err(stage("get chat model"))?;
        if let Some(model) = pinned.as_deref().filter(|model| self.settings.supports(model)) {
            return Ok(model.to_string());
        }

        let selection = self
            .store
            .get_model_selection(user_id)
            .await
            .map_err(stage("resolve chat model"))?;
        let model = selection
            .filter(|model| self.settings.supports(model))
            .unwrap_or_else(|| self.settings.default_model.clone());

        if pinned.is_none() {
            self.store
                .set_chat_model(chat_id, &model)
                .await
                .map_err(stage("resolve chat model"))?;
        }
        Ok(model)
    }

    async fn stream_reply(
        &self,
        request: GenerationRequest,
        mut reply: Message,
    ) -> (TurnOutcome, Message, Vec<ToolContext>) {
        let chat_id = request.conversation_id.clone();
        let session = self.supervisor.create_session();
        self.supervisor.register(&chat_id, Arc::clone(&session)).await;

        let mut contexts = Vec::new();
        let result = self
            .pump(request, &session.cancellation_token(), &mut reply, &mut contexts)
            .await;
        session.mark_completed();
        self.supervisor.unregister(&chat_id, &session).await;

        let outcome = match (result, session.stop_reason()) {
            (_, StopReason::Cancelled) => TurnOutcome::Cancelled,
            (_, StopReason::TimedOut) => TurnOutcome::TimedOut,
            (Ok(()), _) => TurnOutcome::Completed,
            (Err(err), _) => {
                counter!("confab_generation_failures_total").increment(1);
                error!(error = %err, "generation failed");
                reply.content = vec![ContentPart::text(format!(
                    "Internal error: {err}.\n\n**Please include this error message when reporting the error.**"
                ))];
                self.transport
                    .broadcast(&chat_id, Outbound::reliable(SERVER_MESSAGE, to_payload(&reply)), None)
                    .await;
                TurnOutcome::Failed
            }
        };
        if !contexts.is_empty() {
            reply.context = serde_json::to_string(&contexts).ok();
        }
        (outcome, reply, contexts)
    }

    /// Feeds generator events into `reply`, broadcasting a snapshot after
    /// every visible change, and collects finished tool calls into
    /// `contexts`. Stops early once `token` is cancelled.
    async fn pump(
        &self,
        request: GenerationRequest,
        token: &CancellationToken,
        reply: &mut Message,
        contexts: &mut Vec<ToolContext>,
    ) -> Result<(), GeneratorError> {
        let chat_id = request.conversation_id.clone();
        let mut pending: HashMap<String, Value> = HashMap::new();
        let opened = tokio::select! {
            biased;
            () = token.cancelled() => None,
            opened = self.generator.generate(request) => Some(opened?),
        };
        let Some(mut stream) = opened else {
            return Ok(());
        };

        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => None,
                next = stream.next() => next,
            };
            let Some(event) = next else {
                return Ok(());
            };

            match event? {
                GenerationEvent::Token(text) => reply.push_text(&text),
                GenerationEvent::ToolStart { name, input } => {
                    let rendered = render_tool_start(&name, &input);
                    pending.insert(name, input);
                    if reply.text().is_empty() {
                        reply.push_text(&rendered);
                    } else {
                        reply.push_text(&format!("\n{rendered}"));
                    }
                }
                GenerationEvent::ToolEnd { name, output } => {
                    debug!(tool = %name, "tool finished");
                    let input = pending.remove(&name).unwrap_or(Value::Null);
                    contexts.push(ToolContext {
                        tool_input: input.to_string(),
                        tool_name: name,
                        tool_output: output,
                    });
                    continue;
                }
            }
            self.transport
                .broadcast(&chat_id, Outbound::snapshot(SERVER_MESSAGE, to_payload(reply)), None)
                .await;
        }
    }

    fn spawn_title(&self, connection_id: &str, question: Message, reply: Message, model: String) {
        let generator = Arc::clone(&self.generator);
        let store = Arc::clone(&self.store);
        let transport = Arc::clone(&self.transport);
        let connection_id = connection_id.to_string();
        let span = info_span!("coordinator.title", chat_id = %question.chat_id);

        self.background.spawn(
            async move {
                let title = derive_title(generator.as_ref(), &model, &question, &reply).await;
                if let Err(err) = store.update_chat_title(&question.chat_id, &title).await {
                    error!(error = %err, "failed to store chat title");
                    return;
                }
                let payload = ChatTitle {
                    new_title: title,
                    chat_id: question.chat_id,
                    user_id: question.user_id,
                };
                transport
                    .emit_to(
                        &connection_id,
                        Outbound::reliable(AUTOGEN_CHAT_TITLE, to_payload(&payload)),
                    )
                    .await;
            }
            .instrument(span),
        );
    }

    /// Joins `connection_id` to the room of `chat_id` and tracks it as a
    /// subscriber, dropping cached subscribers the room no longer has.
    #[instrument(name = "coordinator.join", skip(self))]
    pub async fn join_chat_room(&self, connection_id: &str, chat_id: &str) {
        let rooms = self.transport.rooms_of(connection_id).await;
        if !rooms.iter().any(|room| room == chat_id) {
            self.transport.join(connection_id, chat_id).await;
        }
        self.history.add_chat(chat_id, None).await;
        self.history.add_subscriber(chat_id, connection_id).await;

        let live = self.transport.room_members(chat_id).await;
        self.history.reconcile_subscribers(chat_id, &live).await;
    }

    /// Cancels the running generation of `chat_id` and acknowledges to the room.
    #[instrument(name = "coordinator.abort", skip(self))]
    pub async fn abort(&self, connection_id: &str, chat_id: &str) -> StopReason {
        let reason = self.supervisor.cancel(chat_id).await;
        let ack = if reason == StopReason::None {
            ABORT_NOT_FOUND
        } else {
            ABORT_OK
        };
        info!(?reason, "abort requested");
        self.transport
            .broadcast(chat_id, Outbound::reliable(ABORT, Value::from(ack)), None)
            .await;
        reason
    }

    /// Drops a closed connection from the transport, then arms eviction for
    /// conversations it was the last subscriber of.
    ///
    /// Turns still in flight for the connection cannot rejoin it afterwards;
    /// they reconcile the conversation's subscribers when they finish.
    #[instrument(name = "coordinator.disconnect", skip(self))]
    pub async fn disconnect(&self, connection_id: &str) {
        for room in self.transport.disconnect(connection_id).await {
            self.history.unload_chat(&room, connection_id).await;
        }
    }
}

fn validate(message: &Message) -> Result<(), CoordinatorError> {
    if message.chat_id.trim().is_empty() {
        return Err(CoordinatorError::InvalidMessage("chatId is required"));
    }
    if message.user_id.trim().is_empty() {
        return Err(CoordinatorError::InvalidMessage("userId is required"));
    }
    Ok(())
}

fn status(message: StatusMessage) -> Outbound {
    Outbound::reliable(SERVER_MESSAGE, to_payload(&message))
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex as StdMutex, time::Duration};

    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use shared::models::{
        MessageRole, Personality, ServerFrame,
        events::{DONE_MARKER, QUEUED_MARKER, START_MARKER},
    };
    use tokio::sync::mpsc;

    use super::*;
    use crate::services::{
        faithfulness::FAITHFULNESS_INSTRUCTIONS, generator::GenerationStream,
        history::HistorySettings, memory_store::MemoryChatStore,
        room_hub::RoomHub,
    };

    #[derive(Default)]
    struct Scripted {
        events: Vec<GenerationEvent>,
        hang: bool,
        break_after: bool,
        refuse: bool,
        judge: Option<&'static str>,
        requests: StdMutex<Vec<GenerationRequest>>,
    }

    impl Scripted {
        fn tokens(tokens: &[&str]) -> Self {
            Self {
                events: tokens
                    .iter()
                    .map(|token| GenerationEvent::Token((*token).to_string()))
                    .collect(),
                ..Self::default()
            }
        }

        fn hanging(tokens: &[&str]) -> Self {
            Self {
                hang: true,
                ..Self::tokens(tokens)
            }
        }

        fn requests(&self) -> Vec<GenerationRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream, GeneratorError> {
            let judging = request
                .history
                .first()
                .is_some_and(|first| first.text() == FAITHFULNESS_INSTRUCTIONS);
            self.requests.lock().unwrap().push(request);
            if let Some(answer) = self.judge.filter(|_| judging) {
                return Ok(Box::pin(stream::iter([Ok(GenerationEvent::Token(
                    answer.to_string(),
                ))])));
            }
            if self.refuse {
                return Err(GeneratorError::Upstream {
                    status: 503,
                    body: "overloaded".into(),
                });
            }
            let events = stream::iter(self.events.clone().into_iter().map(Ok));
            if self.hang {
                Ok(Box::pin(events.chain(stream::pending())))
            } else if self.break_after {
                let broken = stream::iter([Err(GeneratorError::Protocol("stream reset".into()))]);
                Ok(Box::pin(events.chain(broken)))
            } else {
                Ok(Box::pin(events))
            }
        }
    }

    struct Harness {
        coordinator: Arc<SessionCoordinator>,
        hub: Arc<RoomHub>,
        store: Arc<MemoryChatStore>,
        generator: Arc<Scripted>,
    }

    fn harness_with(generator: Scripted, settings: GenerationConfig) -> Harness {
        let hub = Arc::new(RoomHub::new(256));
        let store = Arc::new(MemoryChatStore::new());
        let generator = Arc::new(generator);
        let coordinator = Arc::new(SessionCoordinator::new(
            HistoryHandler::new(HistorySettings::default()),
            Arc::clone(&store) as Arc<dyn ChatStore>,
            Arc::clone(&generator) as Arc<dyn Generator>,
            Arc::clone(&hub) as Arc<dyn Transport>,
            settings,
        ));
        Harness {
            coordinator,
            hub,
            store,
            generator,
        }
    }

    fn harness(generator: Scripted) -> Harness {
        harness_with(generator, GenerationConfig::default())
    }

    fn user_message(id: &str, chat_id: &str, text: &str, data: Value) -> Message {
        let mut message = Message::user(id, chat_id, "u1", text);
        message.data = Some(data);
        message
    }

    fn drain(receiver: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = receiver.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn status_texts(frames: &[ServerFrame]) -> Vec<String> {
        frames
            .iter()
            .filter(|frame| frame.event == SERVER_MESSAGE)
            .filter_map(|frame| frame.data["content"][0]["text"].as_str().map(str::to_string))
            .collect()
    }

    async fn wait_for_text(receiver: &mut mpsc::Receiver<ServerFrame>, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = receiver.recv().await.expect("connection closed");
                if frame.data["content"][0]["text"].as_str() == Some(needle) {
                    return;
                }
            }
        })
        .await
        .expect("frame never arrived");
    }

    #[tokio::test]
    async fn first_turn_streams_persists_and_finishes_with_done() {
        let h = harness(Scripted::tokens(&["Hello", " there"]));
        let mut sender = h.hub.connect("conn-a", "u1").await;

        let outcome = h
            .coordinator
            .handle_chat_message(
                "conn-a",
                user_message("m1", "c1", "hi", json!({ "first_message": true })),
            )
            .await;

        assert_eq!(outcome, TurnOutcome::Completed);
        let texts = status_texts(&drain(&mut sender));
        assert_eq!(texts.last().map(String::as_str), Some(DONE_MARKER));
        assert!(texts.iter().any(|text| text == "Hello there"));

        let stored = h.store.messages("c1").await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, "m1");
        assert_eq!(stored[1].role, MessageRole::Assistant);
        assert_eq!(stored[1].text(), "Hello there");

        let buffered = h.coordinator.history().transcript("c1").await;
        assert_eq!(buffered.len(), 2);
        let chat = h.coordinator.history().get("c1").await.unwrap();
        assert!(chat.subscribers().await.contains("conn-a"));
        assert!(!h.coordinator.generation().is_busy("c1"));
        assert!(!h.coordinator.supervisor().is_running("c1").await);
    }

    #[tokio::test]
    async fn first_turn_titles_chat_for_sender_only() {
        let h = harness(Scripted::tokens(&["Postgres ", "tuning"]));
        let mut sender = h.hub.connect("conn-a", "u1").await;
        let mut watcher = h.hub.connect("conn-b", "u2").await;
        h.coordinator.join_chat_room("conn-b", "c1").await;

        h.coordinator
            .handle_chat_message(
                "conn-a",
                user_message("m1", "c1", "vacuum?", json!({ "first_message": true })),
            )
            .await;
        h.coordinator.drain().await;

        assert_eq!(
            h.store.chat("c1").await.unwrap().title.as_deref(),
            Some("Postgres tuning")
        );
        let titles: Vec<ServerFrame> = drain(&mut sender)
            .into_iter()
            .filter(|frame| frame.event == AUTOGEN_CHAT_TITLE)
            .collect();
        assert_eq!(titles.len(), 1);
        assert_eq!(
            titles[0].data,
            json!({ "new_title": "Postgres tuning", "chat_id": "c1", "user_id": "u1" })
        );
        assert!(
            drain(&mut watcher)
                .iter()
                .all(|frame| frame.event != AUTOGEN_CHAT_TITLE)
        );
    }

    #[tokio::test]
    async fn other_room_members_receive_broadcast_and_stream() {
        let h = harness(Scripted::tokens(&["ok"]));
        let mut sender = h.hub.connect("conn-a", "u1").await;
        let mut watcher = h.hub.connect("conn-b", "u2").await;
        h.coordinator.join_chat_room("conn-b", "c1").await;

        h.coordinator
            .handle_chat_message(
                "conn-a",
                user_message("m1", "c1", "hi", json!({ "first_message": true })),
            )
            .await;

        let seen = drain(&mut watcher);
        assert_eq!(seen[0].event, CHAT_BROADCAST);
        assert_eq!(seen[0].data["id"], "m1");
        assert_eq!(status_texts(&seen).last().map(String::as_str), Some(DONE_MARKER));
        assert!(
            drain(&mut sender)
                .iter()
                .all(|frame| frame.event != CHAT_BROADCAST)
        );
    }

    #[tokio::test]
    async fn store_failure_reports_error_then_done_and_releases_gate() {
        let h = harness(Scripted::tokens(&["never"]));
        h.store.create_chat("c1", "u1").await.unwrap();
        h.store.fail_on("create_message");
        let mut sender = h.hub.connect("conn-a", "u1").await;

        let outcome = h
            .coordinator
            .handle_chat_message("conn-a", user_message("m1", "c1", "hi", json!({})))
            .await;

        assert_eq!(outcome, TurnOutcome::Failed);
        let texts = status_texts(&drain(&mut sender));
        assert_eq!(texts.len(), 2);
        assert!(texts[0].starts_with("failed to persist user message"));
        assert_eq!(texts[1], DONE_MARKER);
        assert!(h.generator.requests().is_empty());
        assert!(h.coordinator.generation().try_acquire("c1").is_some());
    }

    #[tokio::test]
    async fn failure_before_joining_still_reaches_sender_and_room() {
        let h = harness(Scripted::tokens(&["never"]));
        h.store.fail_on("create_chat");
        let mut sender = h.hub.connect("conn-a", "u1").await;
        let mut watcher = h.hub.connect("conn-b", "u2").await;
        h.coordinator.join_chat_room("conn-b", "c1").await;

        let outcome = h
            .coordinator
            .handle_chat_message(
                "conn-a",
                user_message("m1", "c1", "hi", json!({ "first_message": true })),
            )
            .await;

        assert_eq!(outcome, TurnOutcome::Failed);
        assert!(h.hub.rooms_of("conn-a").await.is_empty());
        for receiver in [&mut sender, &mut watcher] {
            let texts = status_texts(&drain(receiver));
            assert_eq!(texts.len(), 2);
            assert!(texts[0].starts_with("failed to create chat"));
            assert_eq!(texts[1], DONE_MARKER);
        }
    }

    #[tokio::test]
    async fn generator_failure_becomes_visible_reply() {
        let h = harness(Scripted {
            refuse: true,
            ..Scripted::default()
        });
        h.store.create_chat("c1", "u1").await.unwrap();
        let mut sender = h.hub.connect("conn-a", "u1").await;

        let outcome = h
            .coordinator
            .handle_chat_message("conn-a", user_message("m1", "c1", "hi", json!({})))
            .await;

        assert_eq!(outcome, TurnOutcome::Failed);
        let texts = status_texts(&drain(&mut sender));
        assert!(texts[0].starts_with("Internal error: generation endpoint returned 503"));
        assert_eq!(texts.last().map(String::as_str), Some(DONE_MARKER));
        assert_eq!(h.store.messages("c1").await.len(), 1);
        assert!(!h.coordinator.generation().is_busy("c1"));
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_out_of_the_store() {
        let h = harness(Scripted {
            break_after: true,
            ..Scripted::tokens(&["par", "tial"])
        });
        h.store.create_chat("c1", "u1").await.unwrap();
        let _sender = h.hub.connect("conn-a", "u1").await;

        let outcome = h
            .coordinator
            .handle_chat_message("conn-a", user_message("m1", "c1", "hi", json!({})))
            .await;

        assert_eq!(outcome, TurnOutcome::Failed);
        let stored = h.store.messages("c1").await;
        assert!(stored.iter().all(|message| message.role == MessageRole::User));
    }

    #[tokio::test]
    async fn abort_cancels_running_generation_and_persists_partial() {
        let h = harness(Scripted::hanging(&["partial"]));
        h.store.create_chat("c1", "u1").await.unwrap();
        let mut sender = h.hub.connect("conn-a", "u1").await;

        let coordinator = Arc::clone(&h.coordinator);
        let turn = tokio::spawn(async move {
            coordinator
                .handle_chat_message("conn-a", user_message("m1", "c1", "hi", json!({})))
                .await
        });
        wait_for_text(&mut sender, "partial").await;

        assert_eq!(h.coordinator.abort("conn-a", "c1").await, StopReason::Cancelled);
        assert_eq!(turn.await.unwrap(), TurnOutcome::Cancelled);

        let frames = drain(&mut sender);
        assert!(
            frames
                .iter()
                .any(|frame| frame.event == ABORT && frame.data == json!(ABORT_OK))
        );
        assert_eq!(status_texts(&frames).last().map(String::as_str), Some(DONE_MARKER));
        let stored = h.store.messages("c1").await;
        assert_eq!(stored.last().unwrap().text(), "partial");
        assert!(h.coordinator.generation().try_acquire("c1").is_some());
    }

    #[tokio::test]
    async fn abort_without_running_generation_reports_not_found() {
        let h = harness(Scripted::default());
        let mut member = h.hub.connect("conn-a", "u1").await;
        h.coordinator.join_chat_room("conn-a", "c9").await;

        assert_eq!(h.coordinator.abort("conn-a", "c9").await, StopReason::None);

        let frames = drain(&mut member);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, ABORT);
        assert_eq!(frames[0].data, json!(ABORT_NOT_FOUND));
    }

    #[tokio::test]
    async fn contended_turn_is_queued_then_started() {
        let h = harness(Scripted::hanging(&["first"]));
        h.store.create_chat("c1", "u1").await.unwrap();
        let mut first = h.hub.connect("conn-a", "u1").await;
        let mut second = h.hub.connect("conn-b", "u1").await;

        let coordinator = Arc::clone(&h.coordinator);
        let running = tokio::spawn(async move {
            coordinator
                .handle_chat_message("conn-a", user_message("m1", "c1", "one", json!({})))
                .await
        });
        wait_for_text(&mut first, "first").await;

        let coordinator = Arc::clone(&h.coordinator);
        let queued = tokio::spawn(async move {
            coordinator
                .handle_chat_message("conn-b", user_message("m2", "c1", "two", json!({})))
                .await
        });
        wait_for_text(&mut second, QUEUED_MARKER).await;
        assert!(drain(&mut first)
            .iter()
            .all(|frame| frame.data["content"][0]["text"] != QUEUED_MARKER));

        h.coordinator.abort("conn-a", "c1").await;
        assert_eq!(running.await.unwrap(), TurnOutcome::Cancelled);
        wait_for_text(&mut second, START_MARKER).await;
        wait_for_text(&mut second, "first").await;

        h.coordinator.abort("conn-b", "c1").await;
        assert_eq!(queued.await.unwrap(), TurnOutcome::Cancelled);
        assert!(!h.coordinator.generation().is_busy("c1"));
    }

    #[tokio::test]
    async fn system_prompt_rebuilds_only_for_new_documents() {
        let settings = GenerationConfig {
            title_generation: false,
            ..GenerationConfig::default()
        };
        let h = harness_with(Scripted::tokens(&["ok"]), settings);
        h.store.insert_document("d1", "first doc", 4).await;
        h.store.insert_document("d2", "second doc", 6).await;
        let _sender = h.hub.connect("conn-a", "u1").await;
        let personality = Personality {
            instructions: Some("Be brief.".into()),
            ..Personality::default()
        };
        let turn = |id: &str, first: bool, docs: Vec<&str>| {
            user_message(
                id,
                "c1",
                "hi",
                json!({ "first_message": first, "personality": personality, "docs": docs }),
            )
        };

        h.coordinator.handle_chat_message("conn-a", turn("m1", true, vec!["d1"])).await;
        h.coordinator.handle_chat_message("conn-a", turn("m2", false, vec!["d1"])).await;
        h.coordinator
            .handle_chat_message("conn-a", turn("m3", false, vec!["d1", "d2"]))
            .await;

        let system: Vec<Message> = h
            .store
            .messages("c1")
            .await
            .into_iter()
            .filter(|message| message.role == MessageRole::System)
            .collect();
        assert_eq!(system.len(), 2);
        assert_eq!(
            system[1].text(),
            "Be brief.\n\nDOCUMENTS:\n\nfirst doc\n\nsecond doc"
        );
        assert_eq!(
            h.store.chat("c1").await.unwrap().document_ids,
            vec!["d1", "d2"]
        );

        let session = h.hub.get_session("conn-a").await;
        assert_eq!(session.docs_token_count, 10);
        let requests = h.generator.requests();
        let last = requests.iter().rev().find(|r| r.conversation_id == "c1").unwrap();
        assert_eq!(last.history[0].text(), system[1].text());
    }

    #[tokio::test]
    async fn model_falls_back_to_default_when_selection_is_unsupported() {
        let settings = GenerationConfig {
            default_model: "small".into(),
            supported_models: vec!["small".into(), "large".into()],
            title_generation: false,
            ..GenerationConfig::default()
        };
        let h = harness_with(Scripted::tokens(&["ok"]), settings);
        h.store.set_model_selection("u1", "retired").await;
        let _sender = h.hub.connect("conn-a", "u1").await;

        h.coordinator
            .handle_chat_message(
                "conn-a",
                user_message("m1", "c1", "hi", json!({ "first_message": true })),
            )
            .await;

        assert_eq!(h.generator.requests()[0].model, "small");
        assert_eq!(h.store.chat("c1").await.unwrap().model.as_deref(), Some("small"));
    }

    #[tokio::test]
    async fn pinned_model_wins_over_user_selection() {
        let h = harness(Scripted::tokens(&["ok"]));
        h.store.create_chat("c1", "u1").await.unwrap();
        h.store.set_chat_model("c1", "pinned").await.unwrap();
        h.store.set_model_selection("u1", "preferred").await;
        let _sender = h.hub.connect("conn-a", "u1").await;

        h.coordinator
            .handle_chat_message("conn-a", user_message("m1", "c1", "hi", json!({})))
            .await;

        assert_eq!(h.generator.requests()[0].model, "pinned");
    }

    #[tokio::test]
    async fn tool_invocations_are_rendered_into_the_reply() {
        let h = harness(Scripted {
            events: vec![
                GenerationEvent::Token("Looking.".into()),
                GenerationEvent::ToolStart {
                    name: "search".into(),
                    input: json!({ "query": "rust" }),
                },
                GenerationEvent::ToolEnd {
                    name: "search".into(),
                    output: "Rust 1.0 shipped in May 2015.".into(),
                },
                GenerationEvent::Token("Found it.".into()),
            ],
            ..Scripted::default()
        });
        h.store.create_chat("c1", "u1").await.unwrap();
        let _sender = h.hub.connect("conn-a", "u1").await;

        h.coordinator
            .handle_chat_message("conn-a", user_message("m1", "c1", "hi", json!({})))
            .await;

        let reply = h.store.messages("c1").await.pop().unwrap();
        assert_eq!(
            reply.text(),
            "Looking.\n**Tool invocation**: search <- ```query=rust```\n\nFound it."
        );
        let contexts: Value = serde_json::from_str(reply.context.as_deref().unwrap()).unwrap();
        assert_eq!(contexts[0]["tool_name"], "search");
        assert_eq!(contexts[0]["tool_input"], r#"{"query":"rust"}"#);
        assert_eq!(contexts[0]["tool_output"], "Rust 1.0 shipped in May 2015.");
        assert!(reply.score.is_none());
        assert_eq!(h.generator.requests().len(), 1);
    }

    fn searching_generator(judge: &'static str) -> Scripted {
        Scripted {
            events: vec![
                GenerationEvent::ToolStart {
                    name: "search".into(),
                    input: json!({ "query": "rust 1.0" }),
                },
                GenerationEvent::ToolEnd {
                    name: "search".into(),
                    output: "Rust 1.0 shipped in May 2015.".into(),
                },
                GenerationEvent::Token("May 2015.".into()),
            ],
            judge: Some(judge),
            ..Scripted::default()
        }
    }

    #[tokio::test]
    async fn faithfulness_score_is_attached_when_requested() {
        let h = harness(searching_generator("0.8"));
        h.store.create_chat("c1", "u1").await.unwrap();
        let mut sender = h.hub.connect("conn-a", "u1").await;

        let outcome = h
            .coordinator
            .handle_chat_message(
                "conn-a",
                user_message("m1", "c1", "when?", json!({ "detect_hallucination": true })),
            )
            .await;

        assert_eq!(outcome, TurnOutcome::Completed);
        let reply = h.store.messages("c1").await.pop().unwrap();
        assert_eq!(reply.score, Some(80.0));
        let judged = &h.generator.requests()[1];
        assert!(judged.history[1].text().contains("Rust 1.0 shipped in May 2015."));

        let frames = drain(&mut sender);
        let final_reply = frames
            .iter()
            .rev()
            .find(|frame| frame.event == SERVER_MESSAGE && frame.data["role"] == "assistant")
            .unwrap();
        assert_eq!(final_reply.data["score"], 80.0);
    }

    #[tokio::test]
    async fn faithfulness_is_skipped_unless_requested() {
        let h = harness(searching_generator("0.8"));
        h.store.create_chat("c1", "u1").await.unwrap();
        let _sender = h.hub.connect("conn-a", "u1").await;

        h.coordinator
            .handle_chat_message("conn-a", user_message("m1", "c1", "when?", json!({})))
            .await;

        let reply = h.store.messages("c1").await.pop().unwrap();
        assert!(reply.score.is_none());
        assert!(reply.context.is_some());
        assert_eq!(h.generator.requests().len(), 1);
    }

    #[tokio::test]
    async fn message_without_chat_id_is_rejected_to_sender() {
        let h = harness(Scripted::default());
        let mut sender = h.hub.connect("conn-a", "u1").await;

        let outcome = h
            .coordinator
            .handle_chat_message("conn-a", Message::user("m1", "", "u1", "hi"))
            .await;

        assert_eq!(outcome, TurnOutcome::Failed);
        let texts = status_texts(&drain(&mut sender));
        assert_eq!(texts, vec!["invalid message: chatId is required", DONE_MARKER]);
        assert!(h.coordinator.history().is_empty().await);
    }

    #[tokio::test]
    async fn disconnect_unloads_every_joined_conversation() {
        let h = harness(Scripted::default());
        let _a = h.hub.connect("conn-a", "u1").await;
        h.coordinator.join_chat_room("conn-a", "c1").await;
        h.coordinator.join_chat_room("conn-a", "c2").await;

        h.coordinator.disconnect("conn-a").await;

        for id in ["c1", "c2"] {
            let chat = h.coordinator.history().get(id).await.unwrap();
            assert!(chat.subscribers().await.is_empty());
            assert!(chat.deletion_deadline().await.is_some());
        }
        assert!(h.hub.rooms_of("conn-a").await.is_empty());
    }

    #[tokio::test]
    async fn queued_turn_of_a_closed_connection_does_not_pin_the_conversation() {
        let h = harness(Scripted::hanging(&["first"]));
        h.store.create_chat("c1", "u1").await.unwrap();
        let mut first = h.hub.connect("conn-a", "u1").await;
        let mut second = h.hub.connect("conn-b", "u1").await;

        let coordinator = Arc::clone(&h.coordinator);
        let running = tokio::spawn(async move {
            coordinator
                .handle_chat_message("conn-a", user_message("m1", "c1", "one", json!({})))
                .await
        });
        wait_for_text(&mut first, "first").await;
        let coordinator = Arc::clone(&h.coordinator);
        let queued = tokio::spawn(async move {
            coordinator
                .handle_chat_message("conn-b", user_message("m2", "c1", "two", json!({})))
                .await
        });
        wait_for_text(&mut second, QUEUED_MARKER).await;

        h.coordinator.disconnect("conn-a").await;
        h.coordinator.disconnect("conn-b").await;
        assert!(h.hub.room_members("c1").await.is_empty());

        h.coordinator.abort("conn-a", "c1").await;
        assert_eq!(running.await.unwrap(), TurnOutcome::Cancelled);
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.generator.requests().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queued turn never started");
        h.coordinator.abort("conn-b", "c1").await;
        assert_eq!(queued.await.unwrap(), TurnOutcome::Cancelled);

        let chat = h.coordinator.history().get("c1").await.unwrap();
        assert!(chat.subscribers().await.is_empty());
        assert!(chat.deletion_deadline().await.is_some());
        assert_eq!(
            h.coordinator
                .history()
                .sweep_at(chrono::Utc::now() + chrono::TimeDelta::days(1))
                .await,
            1
        );
        h.coordinator.history().shutdown();
    }

    #[tokio::test]
    async fn join_drops_subscribers_that_left_the_room() {
        let h = harness(Scripted::default());
        let _a = h.hub.connect("conn-a", "u1").await;
        let _b = h.hub.connect("conn-b", "u2").await;
        h.coordinator.history().add_chat("c1", None).await;
        h.coordinator.history().add_subscriber("c1", "ghost").await;

        h.coordinator.join_chat_room("conn-a", "c1").await;
        h.coordinator.join_chat_room("conn-b", "c1").await;

        let subscribers = h.coordinator.history().get("c1").await.unwrap().subscribers().await;
        assert_eq!(subscribers.len(), 2);
        assert!(!subscribers.contains("ghost"));
    }
}
