use super::*;
use crate::models::{BatchItem, BatchReport, ServiceState, TunnelState};
use futures::future::join_all;
use std::future::Future;
use tracing::instrument;

impl ServiceManager {
    pub async fn start_service(&self, id: &ServiceId) -> Result<ServiceState> {
        self.service(id)?.start().await
    }

    pub async fn stop_service(&self, id: &ServiceId) -> Result<()> {
        self.service(id)?.stop().await
    }

    pub async fn restart_service(&self, id: &ServiceId) -> Result<ServiceState> {
        self.service(id)?.restart().await
    }

    /// Clear a recorded failure, moving Error back to Stopped.
    pub async fn acknowledge_error(&self, id: &ServiceId) -> Result<ServiceState> {
        self.service(id)?.acknowledge().await
    }

    pub async fn enable_tunnel(&self, id: &ServiceId) -> Result<TunnelState> {
        self.service(id)?.enable_tunnel().await
    }

    pub async fn disable_tunnel(&self, id: &ServiceId) -> Result<()> {
        self.service(id)?.disable_tunnel().await;
        Ok(())
    }

    /// Start every service concurrently.
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> BatchReport {
        let report = batch(self.services(), |svc| async move { svc.start().await.map(|_| ()) }).await;
        tracing::info!(
            total = report.items.len(),
            failed = report.failures().count(),
            "start all finished"
        );
        report
    }

    /// Stop every service concurrently.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> BatchReport {
        let report = batch(self.services(), |svc| async move { svc.stop().await }).await;
        tracing::info!(
            total = report.items.len(),
            failed = report.failures().count(),
            "stop all finished"
        );
        report
    }

    /// Stop everything within the shutdown grace, force-kill what is left,
    /// and write the final session.
    ///
    /// The session keeps listing what was running so the next launch can
    /// restore it.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> BatchReport {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::debug!("shutdown already in progress");
        }

        let grace = self.settings.timeouts.shutdown_grace;
        let report = match tokio::time::timeout(grace, self.stop_all()).await {
            Ok(report) => report,
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "graceful stop exceeded grace period");
                BatchReport::default()
            }
        };

        for svc in self.services() {
            if svc.pid().is_some() || svc.tunnel_state() != TunnelState::Inactive {
                svc.force_kill();
            }
        }

        self.store
            .update(|doc| {
                doc.session.normal_exit = true;
                doc.session.last_exit = Some(chrono::Utc::now());
            })
            .await;
        if let Err(e) = self.autosaver.flush().await {
            tracing::error!(error = %e, "final save failed");
        }
        self.stop_background();
        tracing::info!("service manager shut down");
        report
    }
}

async fn batch<F, Fut>(services: Vec<Arc<Service>>, op: F) -> BatchReport
where
    F: Fn(Arc<Service>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let results = join_all(services.iter().cloned().map(&op)).await;
    let items = services
        .iter()
        .zip(results)
        .map(|(svc, result)| BatchItem {
            service_id: svc.id().clone(),
            name: svc.name(),
            error: result.err().map(|e| e.record()),
        })
        .collect();
    BatchReport { items }
}
