use std::sync::Arc;

use shared::config::server::Config;

use crate::services::{
    ChatStore, EchoGenerator, Generator, HistoryHandler, HistorySettings, MemoryChatStore,
    RoomHub, SessionCoordinator, Transport,
};

/// Application state shared across all routes and socket tasks.
#[derive(Clone)]
pub struct AppState {
    pub(crate) coordinator: Arc<SessionCoordinator>,
    pub(crate) hub: Arc<RoomHub>,
    pub(crate) store: Arc<dyn ChatStore>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("coordinator", &self.coordinator)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Builds the conversation registry, room hub and coordinator around the
    /// given store and generator.
    #[must_use]
    pub fn new(config: &Config, store: Arc<dyn ChatStore>, generator: Arc<dyn Generator>) -> Self {
        let hub = Arc::new(
            RoomHub::new(config.sessions.outbound_channel_capacity)
                .with_send_timeout(config.sessions.send_timeout()),
        );
        let history = HistoryHandler::new(HistorySettings::from(&config.sessions));
        let coordinator = Arc::new(SessionCoordinator::new(
            history,
            Arc::clone(&store),
            generator,
            Arc::clone(&hub) as Arc<dyn Transport>,
            config.generation.clone(),
        ));

        Self {
            coordinator,
            hub,
            store,
        }
    }

    /// State backed by the in-memory store and the echo generator.
    #[must_use]
    pub fn in_memory(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(MemoryChatStore::new()),
            Arc::new(EchoGenerator),
        )
    }

    /// Conversation coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    /// Connection and room registry.
    #[must_use]
    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }
}
