//! Periodic background probe of the exchange API credentials. A signed
//! account-info call is the cheapest authenticated endpoint available, so
//! it doubles as the liveness probe that feeds the supervisor's heartbeat
//! classification.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::events::{AlertSeverity, BusEvent, EventBus, SystemAlert};
use crate::exchange::client::ExchangeClient;
use crate::supervisor::BotSupervisor;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);

pub struct CredentialValidator {
    client: Arc<ExchangeClient>,
    supervisor: Arc<BotSupervisor>,
    bus: Arc<EventBus>,
    interval: Duration,
}

impl CredentialValidator {
    pub fn new(client: Arc<ExchangeClient>, supervisor: Arc<BotSupervisor>, bus: Arc<EventBus>) -> Self {
        Self {
            client,
            supervisor,
            bus,
            interval: PROBE_INTERVAL,
        }
    }

    async fn probe_once(&self) {
        match self.client.get_account_info().await {
            Ok(_) => {
                self.supervisor.record_probe_result(true);
            }
            Err(e) => {
                warn!(error = %e, "credential probe failed");
                self.supervisor.record_probe_result(false);
                self.bus.publish(BusEvent::SystemAlert(SystemAlert {
                    severity: AlertSeverity::High,
                    component: "credential_validator".to_string(),
                    message: format!("account-info probe failed: {e}"),
                    action: Some("verify API key/secret and exchange connectivity".to_string()),
                }));
            }
        }
    }

    /// Runs the periodic probe loop until `shutdown` resolves.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.interval.as_secs(), "credential validator started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("credential validator shutting down");
                        break;
                    }
                }
            }
        }
    }
}
