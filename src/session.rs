use std::sync::Arc;

use crate::config::Config;
use crate::events::EventBus;
use crate::friends::Friends;
use crate::identity::{FetchError, Identity, IdentityService};
use crate::names::Authors;
use crate::state::Store;

/// One client's state: the store, the event bus and the components writing to them.
#[derive(Clone)]
pub struct Session {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub authors: Authors,
    pub friends: Friends,
    service: Arc<dyn IdentityService>,
}

impl Session {
    /// wire a session around `service`; starts the event bus
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: &Config, service: Arc<dyn IdentityService>) -> Self {
        let store = Arc::new(Store::new());
        let bus = EventBus::start(config.flush_interval, config.channel_capacity);
        let authors = Authors::new(Arc::clone(&store), bus.clone(), Arc::clone(&service));
        let friends = Friends::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&service),
            Arc::new(authors.clone()),
        );
        Session {
            store,
            bus,
            authors,
            friends,
            service,
        }
    }

    /// ask the service who the local user is and remember it
    pub async fn init(&self) -> Result<Identity, FetchError> {
        let me = self.service.whoami().await?;
        self.store.set_me(&me);
        tracing::info!("session: local identity is {}", me);
        Ok(me)
    }

    /// deliver pending notifications and stop the event bus
    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
    }
}
