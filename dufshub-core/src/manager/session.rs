use super::*;
use crate::models::{BatchItem, BatchReport, ServiceState, TunnelState};
use futures::StreamExt;
use tracing::instrument;

impl ServiceManager {
    /// Mirror state and tunnel transitions into `session.running` and
    /// `session.tunneled`. Stops caused by shutdown are not recorded.
    pub(super) fn track_session(&self) {
        let mut events = self.bus.stream();
        let store = self.store.clone();
        let autosaver = self.autosaver.clone();
        let shutting_down = self.shutting_down.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let change = match event {
                    Event::StateChanged { service_id, to, .. } => match to {
                        ServiceState::Running => Some((service_id, Track::Running, true)),
                        ServiceState::Stopped | ServiceState::Error => {
                            Some((service_id, Track::Running, false))
                        }
                        _ => None,
                    },
                    Event::TunnelChanged { service_id, to, .. } => match to {
                        TunnelState::Active => Some((service_id, Track::Tunneled, true)),
                        TunnelState::Inactive | TunnelState::Error => {
                            Some((service_id, Track::Tunneled, false))
                        }
                        TunnelState::Connecting => None,
                    },
                    _ => None,
                };
                let Some((id, track, present)) = change else {
                    continue;
                };
                if !present && shutting_down.load(Ordering::SeqCst) {
                    continue;
                }
                let changed = store
                    .update(|doc| {
                        let list = match track {
                            Track::Running => &mut doc.session.running,
                            Track::Tunneled => &mut doc.session.tunneled,
                        };
                        set_membership(list, id, present)
                    })
                    .await;
                if changed {
                    autosaver.mark();
                }
            }
        });
        self.keep_task(task);
    }

    /// Bring back the services (and tunnels) of the previous session when
    /// [`SessionState::should_restore`] says so. Services that no longer exist
    /// are skipped.
    #[instrument(skip(self))]
    pub async fn restore_session(&self) -> BatchReport {
        let session = self.previous_session.clone();
        let now = chrono::Utc::now();
        if !session.should_restore(now) {
            tracing::info!("previous session ended recently and cleanly; not restoring");
            return BatchReport::default();
        }

        let targets: Vec<Arc<Service>> = session
            .running
            .iter()
            .filter_map(|id| self.service(id).ok())
            .collect();
        tracing::info!(services = targets.len(), "restoring previous session");

        let settle = self.settings.timeouts.readiness + std::time::Duration::from_secs(1);
        let results = futures::future::join_all(targets.iter().map(|svc| {
            let tunneled = session.tunneled.contains(svc.id());
            async move {
                svc.start().await?;
                if tunneled {
                    let settled = svc
                        .wait_for(settle, |s| s != ServiceState::Starting)
                        .await;
                    if settled == Some(ServiceState::Running) {
                        svc.enable_tunnel().await?;
                    }
                }
                Ok::<_, ServiceError>(())
            }
        }))
        .await;

        let items = targets
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
}

impl ServiceManager {
    /// Flush and release background work without ending the session.
    ///
    /// For short-lived front-ends that only edit the collection: the exit
    /// markers of the previous session are written back, so a later launch
    /// decides about restoring exactly as it would have before.
    pub async fn close(&self) -> Result<()> {
        let previous = self.previous_session.clone();
        self.store
            .update(|doc| {
                doc.session.normal_exit = previous.normal_exit;
                doc.session.last_exit = previous.last_exit;
            })
            .await;
        let saved = self.autosaver.flush().await;
        self.stop_background();
        saved
    }
}

#[derive(Debug, Clone, Copy)]
enum Track {
    Running,
    Tunneled,
}

fn set_membership(list: &mut Vec<ServiceId>, id: ServiceId, present: bool) -> bool {
    let position = list.iter().position(|existing| existing == &id);
    match (position, present) {
        (None, true) => {
            list.push(id);
            true
        }
        (Some(index), false) => {
            list.remove(index);
            true
        }
        _ => false,
    }
}
