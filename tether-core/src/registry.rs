//! Service registry: which app services are currently running.
//!
//! One registry per process, owned by the host's event loop and passed by `&mut`; there is
//! no global state. Create it at startup, `start` each service as it comes up, `stop` it on
//! teardown.

use std::collections::HashMap;

use uuid::Uuid;

/// Where an inbound event for an app should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The service is running; hand the event to it.
    Deliver,
    /// No running instance; start one and hand it the event.
    Start,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("service {0} is already running")]
    AlreadyRunning(Uuid),
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    running: HashMap<Uuid, bool>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `app` as running. Fails if an instance is already live.
    pub fn start(&mut self, app: Uuid) -> Result<(), RegistryError> {
        if self.is_running(app) {
            return Err(RegistryError::AlreadyRunning(app));
        }
        self.running.insert(app, true);
        tracing::debug!(%app, "service started");
        Ok(())
    }

    pub fn stop(&mut self, app: Uuid) {
        if let Some(live) = self.running.get_mut(&app) {
            *live = false;
            tracing::debug!(%app, "service stopped");
        }
    }

    pub fn is_running(&self, app: Uuid) -> bool {
        self.running.get(&app).copied().unwrap_or(false)
    }

    pub fn route(&self, app: Uuid) -> Route {
        if self.is_running(app) {
            Route::Deliver
        } else {
            Route::Start
        }
    }

    /// Apps that have a live instance.
    pub fn running(&self) -> Vec<Uuid> {
        self.running
            .iter()
            .filter(|(_, &live)| live)
            .map(|(&app, _)| app)
            .collect()
    }
}
