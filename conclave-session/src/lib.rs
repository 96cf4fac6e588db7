mod authorize;
mod broadcast;
mod db;
mod events;
mod provider;
mod rooms;
mod scheduler;
mod webhooks;

use std::sync::Arc;

pub use authorize::*;
pub use broadcast::*;
pub use db::*;
pub use events::*;
pub use provider::*;
pub use rooms::*;
pub use scheduler::*;
pub use webhooks::*;

use conclave_core::{Bus, CoordinationStore, FabricConfig, Presence, PresenceBackend};
use crossbeam::channel::unbounded;

/// One node's view of the session-coordination fabric, wiring the callout,
/// broadcaster, notifier, lifecycle managers, and scheduler together.
pub struct Conclave {
    pub authorize: AuthCallout,
    pub broadcaster: PresenceBroadcaster,
    pub webhooks: Arc<WebhookNotifier>,
    pub rooms: RoomManager,
    pub breakouts: BreakoutManager,
    pub scheduler: Scheduler,

    context: SessionContext,
    event_receiver: EventReceiver,
}

/// A type passed to every component of the fabric, to access the shared
/// stores, emit events, and read config.
#[derive(Clone)]
pub struct SessionContext {
    pub config: FabricConfig,
    pub bus: Arc<dyn Bus>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub presence: Presence,
    pub database: Arc<dyn Database>,
    pub provider: Arc<dyn MediaProvider>,

    event_sender: EventSender,
}

impl Conclave {
    pub fn new(
        config: FabricConfig,
        bus: Arc<dyn Bus>,
        coordination: Arc<dyn CoordinationStore>,
        presence_backend: Arc<dyn PresenceBackend>,
        database: Arc<dyn Database>,
        provider: Arc<dyn MediaProvider>,
    ) -> Self {
        let (event_sender, event_receiver) = unbounded();

        let context = SessionContext {
            config,
            bus,
            coordination,
            presence: Presence::new(presence_backend),
            database,
            provider,
            event_sender,
        };

        let webhooks = Arc::new(WebhookNotifier::new(&context));
        let broadcaster = PresenceBroadcaster::new(&context, &webhooks);
        let rooms = RoomManager::new(&context, &webhooks);
        let breakouts = BreakoutManager::new(&context, &rooms, &broadcaster);
        let scheduler = Scheduler::new(&context, &rooms);

        Self {
            authorize: AuthCallout::new(&context),
            broadcaster,
            webhooks,
            rooms,
            breakouts,
            scheduler,
            context,
            event_receiver,
        }
    }

    /// Starts the background subscriptions and periodic loops
    pub async fn start(&self) -> Result<(), conclave_core::BusError> {
        self.broadcaster.start().await?;
        self.webhooks.start().await?;
        self.scheduler.start();

        Ok(())
    }

    /// Stops loops and subscriptions, releasing held locks where possible
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.broadcaster.shutdown();
        self.webhooks.shutdown();
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Receive events from the fabric.
    pub fn wait_for_event(&self) -> SessionEvent {
        self.event_receiver
            .recv()
            .expect("event is received without error")
    }

    pub fn try_next_event(&self) -> Option<SessionEvent> {
        self.event_receiver.try_recv().ok()
    }
}

impl SessionContext {
    pub fn emit(&self, event: SessionEvent) {
        // The channel is unbounded and the receiver lives as long as the node
        let _ = self.event_sender.send(event);
    }
}
