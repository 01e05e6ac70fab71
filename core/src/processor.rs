use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::event::{self, current_timestamp};
use crate::keys::Keys;
use crate::lease::ProcessingLease;
use crate::outbox::DeliveryQueue;
use crate::relay::RelayPool;
use crate::storage::KeyValueStore;
use crate::types::{DmQueueItem, ProcessReport, SentLogEntry};

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

/// キューを1パスずつ処理する
pub struct QueueProcessor {
    queue: DeliveryQueue,
    pool: RelayPool,
    keys: Keys,
    store: Arc<dyn KeyValueStore>,
    lease_ttl: Duration,
    cancel: Arc<AtomicBool>,
}

impl QueueProcessor {
    pub fn new(store: Arc<dyn KeyValueStore>, queue: DeliveryQueue, pool: RelayPool, keys: Keys) -> Self {
        Self {
            queue,
            pool,
            keys,
            store,
            lease_ttl: DEFAULT_LEASE_TTL,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// true にすると処理中のパスは次のアイテムの前で止まる
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// キューを1回処理
    ///
    /// 別の処理がリースを持っていれば `LeaseHeld` を返し、何もしない。
    pub async fn process_once(&self) -> Result<ProcessReport> {
        let mut lease = ProcessingLease::acquire(self.store.clone(), self.lease_ttl).await?;
        let result = self.run_pass(&mut lease).await;
        if let Err(e) = lease.release().await {
            log::error!("Failed to release processing lease: {}", e);
        }
        result
    }

    async fn run_pass(&self, lease: &mut ProcessingLease) -> Result<ProcessReport> {
        let items = self.queue.list_all().await?;
        let mut report = ProcessReport::default();
        if items.is_empty() {
            return Ok(report);
        }
        log::info!("Processing {} queued DM(s)", items.len());

        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                report.skipped_cancelled = total - index;
                log::info!("Queue pass cancelled, {} item(s) left", report.skipped_cancelled);
                break;
            }
            // 長いパスでもリースを切らさない。奪われていたら残りは相手に任せる
            match lease.renew().await {
                Ok(()) => {}
                Err(CoreError::LeaseLost(owner)) => {
                    report.skipped_cancelled = total - index;
                    log::warn!(
                        "Processing lease {} lost, stopping pass with {} item(s) left",
                        owner,
                        report.skipped_cancelled
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
            report.attempted += 1;

            let entry = match self.deliver(&item).await {
                Ok(entry) => entry,
                Err(e) => {
                    if e.is_transport() {
                        log::warn!("Failed to deliver {}: {}", item.id, e);
                    } else {
                        log::error!("Failed to deliver {}: {}", item.id, e);
                    }
                    report.failed += 1;
                    continue;
                }
            };

            // 記録してから削除（途中で落ちてもログ重複で済む）
            self.queue.record_sent(entry).await?;
            if !self.queue.remove_by_id(&item.id).await? {
                log::warn!("Delivered item {} was already removed", item.id);
            }
            report.sent += 1;
        }

        log::info!(
            "Queue pass done: {} sent, {} failed, {} skipped",
            report.sent,
            report.failed,
            report.skipped_cancelled
        );
        Ok(report)
    }

    async fn deliver(&self, item: &DmQueueItem) -> Result<SentLogEntry> {
        let event = event::encrypted_dm(&self.keys, &item.recipient_pubkey, &item.plaintext)?;
        let report = self.pool.publish(&event).await;
        if !report.is_success() {
            let reasons: Vec<String> = report.failed.iter().map(|(url, e)| format!("{}: {}", url, e)).collect();
            return Err(CoreError::RelayTransportError(format!(
                "no relay accepted the event ({})",
                reasons.join(", ")
            )));
        }

        Ok(SentLogEntry {
            recipient_pubkey: item.recipient_pubkey,
            subject: item.subject.clone(),
            display_name: item.display_name.clone(),
            sent_at: current_timestamp(),
            event_id: event.id,
        })
    }
}
