//! Aggregate root: owns every [`Service`], keeps the persisted document in
//! step with the live collection, and tracks the running session.

use crate::config::{AppState, ConfigDocument, ServiceId, SessionState};
use crate::error::{Result, ServiceError};
use crate::events::{Event, EventBus, Subscription, Topic};
use crate::models::{LogLine, ServiceSnapshot, ServiceSummary};
use crate::port::PortAllocator;
use crate::process::ProcessTable;
use crate::service::Service;
use crate::settings::Settings;
use crate::store::{AutoSaver, ConfigStore, SaveFn, SecretCipher};
use crate::tunnel::TunnelInstaller;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::task::JoinHandle;

mod lifecycle;
mod policy;
mod reconcile;
mod session;
mod storage;
#[cfg(test)]
mod tests;

/// Supervisor for a collection of file-server services.
#[derive(Debug, Clone)]
pub struct ServiceManager {
    settings: Arc<Settings>,
    services: Arc<RwLock<Vec<Arc<Service>>>>,
    store: Arc<ConfigStore>,
    allocator: PortAllocator,
    bus: EventBus,
    autosaver: AutoSaver,
    installer: Arc<TunnelInstaller>,
    processes: ProcessTable,
    /// Serializes add/edit/remove so name and port checks see a stable collection.
    collection: Arc<tokio::sync::Mutex<()>>,
    shutting_down: Arc<AtomicBool>,
    /// Session as it was on disk when this manager opened.
    previous_session: Arc<SessionState>,
    background: Arc<StdMutex<Background>>,
}

#[derive(Debug, Default)]
struct Background {
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceManager {
    /// Load the configuration under `settings.data_dir` and build the collection.
    ///
    /// Unreadable configuration never fails this call; it degrades to the
    /// backup or an empty document. Duplicate names and ports left behind by
    /// hand edits are repaired and written back.
    pub async fn open(settings: Settings) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.data_dir).await?;
        let settings = Arc::new(settings);
        let cipher = SecretCipher::for_this_machine()?;
        let store = Arc::new(ConfigStore::open(settings.config_path(), cipher).await);
        let bus = EventBus::new();
        let allocator = PortAllocator::new(settings.ports.clone());
        let installer = Arc::new(TunnelInstaller::new(
            settings.tunnel.binary_path.clone(),
            settings.tunnel.download_url.clone(),
            settings.timeouts.download,
        ));
        let processes = ProcessTable::new();

        let mut doc = store.snapshot().await;
        let previous_session = doc.session.clone();
        let repairs = policy::repair_document(&mut doc, &allocator);
        if repairs > 0 {
            tracing::warn!(repairs, "repaired duplicate names or ports in configuration");
        }
        // cleared again by a clean shutdown
        doc.session.normal_exit = false;

        let services = doc
            .services
            .iter()
            .cloned()
            .map(|config| {
                Service::new(
                    config,
                    settings.clone(),
                    bus.clone(),
                    installer.clone(),
                    processes.clone(),
                )
            })
            .collect();

        if let Err(e) = store.save(&doc).await {
            tracing::warn!(error = %e, "failed to write configuration on open");
            notify_persistence(&bus, &e);
        }

        let autosaver = AutoSaver::spawn(
            settings.timeouts.autosave_debounce,
            save_fn(store.clone(), bus.clone()),
        );

        let manager = Self {
            settings,
            services: Arc::new(RwLock::new(services)),
            store,
            allocator,
            bus,
            autosaver,
            installer,
            processes,
            collection: Arc::new(tokio::sync::Mutex::new(())),
            shutting_down: Arc::new(AtomicBool::new(false)),
            previous_session: Arc::new(previous_session),
            background: Arc::new(StdMutex::new(Background::default())),
        };
        manager.track_session();
        tracing::info!(
            path = %manager.store.path().display(),
            services = manager.services().len(),
            "service manager ready"
        );
        Ok(manager)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Shorthand for [`EventBus::subscribe`].
    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: FnMut(Event) + Send + 'static,
    {
        self.bus.subscribe(topic, callback)
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    pub fn previous_session(&self) -> &SessionState {
        &self.previous_session
    }

    fn services(&self) -> Vec<Arc<Service>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Look up a live service by id.
    pub fn service(&self, id: &ServiceId) -> Result<Arc<Service>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Summaries in configuration order.
    pub fn list_services(&self) -> Vec<ServiceSummary> {
        self.services()
            .iter()
            .map(|s| ServiceSummary {
                id: s.id().clone(),
                name: s.name(),
                port: s.port(),
                state: s.state(),
                tunnel: s.tunnel_state(),
            })
            .collect()
    }

    pub fn snapshots(&self) -> Vec<ServiceSnapshot> {
        self.services().iter().map(|s| s.snapshot()).collect()
    }

    pub fn snapshot(&self, id: &ServiceId) -> Result<ServiceSnapshot> {
        Ok(self.service(id)?.snapshot())
    }

    /// Last `lines` captured lines of a service's output.
    pub fn logs(&self, id: &ServiceId, lines: usize) -> Result<Vec<LogLine>> {
        Ok(self.service(id)?.logs(lines))
    }

    /// Copy of the persisted document as currently held in memory.
    pub async fn document(&self) -> ConfigDocument {
        self.store.snapshot().await
    }

    pub async fn app_state(&self) -> AppState {
        self.store.snapshot().await.app_state
    }

    /// Replace the front-end blob; written out by the debounced autosave.
    pub async fn update_app_state(&self, value: serde_json::Value) {
        self.store.update(|doc| doc.app_state = AppState(value)).await;
        self.autosaver.mark();
    }

    /// Write the document now. Failures are reported on the bus and returned.
    pub async fn persist(&self) -> Result<()> {
        persist_and_notify(&self.store, &self.bus).await
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn keep_task(&self, task: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tasks
            .push(task);
    }

    fn keep_subscription(&self, subscription: Subscription) {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscriptions
            .push(subscription);
    }

    fn stop_background(&self) {
        let background = std::mem::take(&mut *self.background.lock().unwrap_or_else(|e| e.into_inner()));
        for task in background.tasks {
            task.abort();
        }
        drop(background.subscriptions);
    }
}

async fn persist_and_notify(store: &ConfigStore, bus: &EventBus) -> Result<()> {
    match store.persist().await {
        Ok(()) => {
            bus.publish(Event::ConfigSaved {
                at: chrono::Utc::now(),
            });
            Ok(())
        }
        Err(e) => {
            notify_persistence(bus, &e);
            Err(e)
        }
    }
}

fn notify_persistence(bus: &EventBus, err: &ServiceError) {
    bus.publish(Event::Notice {
        service_id: None,
        kind: err.kind(),
        message: format!("changes could not be saved: {}", err.message()),
    });
}

fn save_fn(store: Arc<ConfigStore>, bus: EventBus) -> SaveFn {
    Arc::new(move || {
        let store = store.clone();
        let bus = bus.clone();
        async move { persist_and_notify(&store, &bus).await }.boxed()
    })
}
