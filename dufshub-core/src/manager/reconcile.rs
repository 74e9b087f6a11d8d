use super::*;
use std::time::Duration;

impl ServiceManager {
    /// One pass comparing believed state with the OS. Returns how many
    /// services were corrected.
    pub fn reconcile(&self) -> usize {
        let corrected = self
            .services()
            .iter()
            .filter(|svc| svc.reconcile())
            .count();
        if corrected > 0 {
            tracing::info!(corrected, "reconciled service state with the OS");
        }
        corrected
    }

    /// Run [`reconcile`](Self::reconcile) every `interval` until shutdown.
    pub fn spawn_reconciler(&self, interval: Duration) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if manager.is_shutting_down() {
                    break;
                }
                manager.reconcile();
            }
        });
        self.keep_task(task);
    }
}
