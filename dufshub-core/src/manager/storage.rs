use super::*;
use crate::config::{ServiceConfig, ServiceDefinition};
use tracing::instrument;

impl ServiceManager {
    /// Validate and register a new service, then write the configuration.
    ///
    /// The service starts out Stopped. A failed save does not undo the add;
    /// it is reported as a notice and retried by the next save.
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    pub async fn add_service(&self, definition: ServiceDefinition) -> Result<ServiceConfig> {
        let _guard = self.collection.lock().await;

        let name = self.check_name(&definition.name, None)?;
        let root_path = self.check_root(&definition.root_path)?;
        let port = self.resolve_port(definition.port, None)?;

        let config = ServiceConfig::from_definition(
            ServiceId::generate(),
            ServiceDefinition {
                name,
                root_path,
                ..definition
            },
            port,
        );
        let service = Service::new(
            config.clone(),
            self.settings.clone(),
            self.bus.clone(),
            self.installer.clone(),
            self.processes.clone(),
        );
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(service);
        self.store
            .update(|doc| doc.services.push(config.clone()))
            .await;

        tracing::info!(service_id = %config.id, port, "service added");
        self.bus.publish(Event::ServiceAdded {
            service_id: config.id.clone(),
        });
        let _ = self.persist().await;
        Ok(config)
    }

    /// Replace a stopped service's definition.
    ///
    /// `definition.port == None` keeps the current port.
    #[instrument(skip(self, definition), fields(service_id = %id))]
    pub async fn edit_service(&self, id: &ServiceId, definition: ServiceDefinition) -> Result<ServiceConfig> {
        let _guard = self.collection.lock().await;
        let service = self.service(id)?;
        let config = service
            .reconfigure(|current| {
                let name = self.check_name(&definition.name, Some(id))?;
                let root_path = self.check_root(&definition.root_path)?;
                let port = match definition.port {
                    None => current.port,
                    Some(port) if port == current.port => port,
                    Some(port) => self.resolve_port(Some(port), Some(id))?,
                };
                Ok(ServiceConfig {
                    id: current.id.clone(),
                    name,
                    root_path,
                    port,
                    bind: definition.bind,
                    permissions: definition.permissions,
                    auth: definition.auth,
                    created_at: current.created_at,
                })
            })
            .await?;
        let port = config.port;
        self.store
            .update(|doc| {
                if let Some(entry) = doc.services.iter_mut().find(|c| &c.id == id) {
                    *entry = config.clone();
                }
            })
            .await;

        tracing::info!(port, "service edited");
        self.bus.publish(Event::ServiceEdited {
            service_id: id.clone(),
        });
        let _ = self.persist().await;
        Ok(config)
    }

    /// Stop (forcing if needed) and delete a service.
    #[instrument(skip(self), fields(service_id = %id))]
    pub async fn remove_service(&self, id: &ServiceId) -> Result<()> {
        let _guard = self.collection.lock().await;
        let service = self.service(id)?;

        match tokio::time::timeout(self.settings.timeouts.remove, service.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "stop before removal failed; forcing"),
            Err(_) => tracing::warn!("stop before removal timed out; forcing"),
        }
        if service.pid().is_some() {
            service.force_kill();
        }

        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| s.id() != id);
        self.store
            .update(|doc| {
                doc.services.retain(|c| &c.id != id);
                doc.session.running.retain(|r| r != id);
                doc.session.tunneled.retain(|r| r != id);
            })
            .await;

        tracing::info!("service removed");
        self.bus.publish(Event::ServiceRemoved {
            service_id: id.clone(),
        });
        let _ = self.persist().await;
        Ok(())
    }
}
