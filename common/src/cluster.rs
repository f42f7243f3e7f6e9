// Cluster manager: heartbeat writer and failed-instance detector. Runs
// beside the scheduling loop, checking in at a fixed interval and taking
// over the in-flight fires of peers that stop checking in.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::retry::DbRetryPolicy;
use crate::store::sql::ClusteredJobStore;

pub struct ClusterManager {
    stop_tx: watch::Sender<bool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Start the checkin/failover loop for this instance.
    #[instrument(skip(store, retry), fields(instance = %store.instance_id()))]
    pub fn start(store: Arc<ClusteredJobStore>, retry: DbRetryPolicy) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let interval = store
                .cluster_checkin_interval()
                .to_std()
                .unwrap_or_else(|_| Duration::from_millis(7_500));
            info!(interval_ms = interval.as_millis() as u64, "Cluster manager started");

            loop {
                match store.cluster_checkin().await {
                    Ok(failed) if !failed.is_empty() => {
                        warn!(
                            failed = failed.len(),
                            "Detected failed cluster instances, recovering"
                        );
                        if let Err(e) = store.cluster_recover(&failed).await {
                            warn!(error = %e, "Cluster recovery failed, will retry next pass");
                        }
                    }
                    Ok(_) => {
                        debug!("Cluster checkin complete");
                    }
                    Err(e) if e.is_transient() => {
                        let delay = retry.next_delay();
                        warn!(
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Cluster checkin failed transiently"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Cluster checkin failed");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Cluster manager stopped");
        });

        Self {
            stop_tx,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Stop the loop; the instance's state row is removed by the store's
    /// shutdown, letting peers recover anything still in flight.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = {
            let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cluster manager task ended abnormally");
            }
        }
    }
}
