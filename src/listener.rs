// New-block Listener
//
// Polls the ledger tip and sends each new height to the orchestrator. Heights
// are only sent when they grow; a full channel drops the notification since
// the next one covers the same blocks.

use crate::ledger::Ledger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BlockListener {
    ledger: Arc<dyn Ledger>,
    interval: Duration,
    cancel: CancellationToken,
}

impl BlockListener {
    pub fn new(ledger: Arc<dyn Ledger>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            ledger,
            interval,
            cancel,
        }
    }

    pub async fn run(self, tx: mpsc::Sender<u64>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_seen: Option<u64> = None;

        info!("Block listener polling every {:?}", self.interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let tip = match self.ledger.latest_block_number().await {
                Ok(tip) => tip,
                Err(e) => {
                    warn!("Failed to poll block number: {:#}", e);
                    continue;
                }
            };
            if last_seen.is_some_and(|seen| tip <= seen) {
                continue;
            }
            last_seen = Some(tip);

            match tx.try_send(tip) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Notification for block {} dropped, receiver busy", tip);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        debug!("Block listener stopped");
    }
}
