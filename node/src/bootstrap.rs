use std::time::Duration;

use letslive_p2p::{Dht, Host, PeerInfo};
use tracing::{info, warn};

use crate::config::BootstrapSettings;
use crate::error::NodeError;

/// Doubling delay capped at a maximum.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }

    /// The delay to wait now; later calls return longer ones.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

/// Join the network through `peer`.
///
/// Each attempt dials the bootstrap node and runs the self-lookup. Attempts
/// are spaced by an exponential backoff; running out of attempts is fatal.
pub(crate) async fn join(
    host: &Host,
    dht: &Dht,
    peer: PeerInfo,
    settings: &BootstrapSettings,
) -> Result<usize, NodeError> {
    let mut backoff = Backoff::new(settings.initial_backoff(), settings.max_backoff());
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=settings.max_attempts {
        let result = match host.dial_with_timeout(&peer, settings.dial_timeout()).await {
            Ok(()) => dht.bootstrap(peer.clone()).await.map_err(NodeError::from),
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(known) => {
                info!(bootstrap = %peer.peer_id, attempt, peers = known, "joined network");
                return Ok(known);
            }
            Err(err) => {
                warn!(bootstrap = %peer.peer_id, attempt, max_attempts = settings.max_attempts, "bootstrap attempt failed: {err}");
                last_error = err.to_string();
            }
        }

        if attempt < settings.max_attempts {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    Err(NodeError::BootstrapFailed {
        attempts: settings.max_attempts,
        reason: last_error,
    })
}
