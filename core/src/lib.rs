pub mod bech32;
pub mod config;
pub mod crypto;
pub mod error;
pub mod event;
pub mod keys;
pub mod lease;
pub mod lnurl;
pub mod nwc;
pub mod outbox;
pub mod processor;
pub mod relay;
pub mod scheduler;
pub mod storage;
pub mod types;

use std::sync::Arc;

pub use config::EngineConfig;
pub use error::{CoreError, Result};
pub use event::NostrEvent;
pub use keys::{Keys, PublicKey, SecretKey};

use crate::lnurl::{HttpClient, PaymentVerifier, PendingInvoice, VerificationMethod};
use crate::nwc::NwcClient;
use crate::outbox::DeliveryQueue;
use crate::processor::QueueProcessor;
use crate::relay::{RelayPool, TransportFactory};
use crate::scheduler::Scheduler;
use crate::storage::KeyValueStore;
use crate::types::{DmQueueItem, ProcessReport, SentLogEntry};

/// Engine: アプリケーションから使用されるメインAPI
pub struct Engine {
    config: EngineConfig,
    keys: Keys,
    queue: DeliveryQueue,
    processor: Arc<QueueProcessor>,
    nwc: Option<Arc<NwcClient>>,
    http: Option<Arc<dyn HttpClient>>,
}

impl Engine {
    /// 初期化（サイト鍵が必須）
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        factory: Arc<dyn TransportFactory>,
        http: Option<Arc<dyn HttpClient>>,
    ) -> Result<Self> {
        config.validate()?;
        let keys = config
            .site_keys()?
            .ok_or_else(|| CoreError::InvalidKeyFormat("site_secret_key is not configured".to_string()))?;

        let queue = DeliveryQueue::with_capacity(store.clone(), config.sent_log_capacity);
        let pool = RelayPool::new(factory.clone(), config.relays.clone());
        let processor = QueueProcessor::new(store, queue.clone(), pool, keys.clone()).with_lease_ttl(config.lease_ttl());

        let nwc = match config.nwc_connection()? {
            Some(connection) => Some(Arc::new(NwcClient::new(connection, factory)?.with_timeout(config.nwc_timeout()))),
            None => None,
        };

        log::info!(
            "Engine ready: {} relay(s), NWC {}",
            config.relays.len(),
            if nwc.is_some() { "configured" } else { "not configured" }
        );

        Ok(Self {
            config,
            keys,
            queue,
            processor: Arc::new(processor),
            nwc,
            http,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn site_public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// DM をキューに追加（宛先は hex / npub）
    pub async fn queue_dm(&self, recipient: &str, subject: &str, message: &str, display_name: &str) -> Result<DmQueueItem> {
        let recipient = PublicKey::parse(recipient)?;
        self.queue.enqueue_dm(recipient, message, subject, display_name).await
    }

    /// キューを1回処理
    pub async fn process_queue(&self) -> Result<ProcessReport> {
        self.processor.process_once().await
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn processor(&self) -> Arc<QueueProcessor> {
        self.processor.clone()
    }

    /// 設定の間隔で動くスケジューラー
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.processor.clone(), self.config.queue_interval())
    }

    pub fn nwc_client(&self) -> Result<Arc<NwcClient>> {
        self.nwc
            .clone()
            .ok_or_else(|| CoreError::InvalidConnectionUri("NWC is not configured".to_string()))
    }

    pub fn payment_verifier(&self) -> PaymentVerifier {
        PaymentVerifier::new(self.nwc.clone(), self.http.clone())
    }

    pub fn verification_method(&self, invoice: &PendingInvoice) -> VerificationMethod {
        self.payment_verifier().method_for(invoice)
    }

    /// 送信済みログ（新しい順）
    pub async fn sent_log(&self) -> Result<Vec<SentLogEntry>> {
        self.queue.sent_log().await
    }
}
