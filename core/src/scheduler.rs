//! 定期キュー処理

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{CoreError, Result};
use crate::processor::QueueProcessor;
use crate::types::ProcessReport;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// 一定間隔で `process_once` を呼ぶ
pub struct Scheduler {
    processor: Arc<QueueProcessor>,
    interval: Duration,
}

/// 起動中のスケジューラー
pub struct SchedulerHandle {
    trigger: mpsc::Sender<oneshot::Sender<Result<ProcessReport>>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    processor: Arc<QueueProcessor>,
}

impl Scheduler {
    pub fn new(processor: Arc<QueueProcessor>, interval: Duration) -> Self {
        Self { processor, interval }
    }

    /// タスクを起動。最初のパスは即時に走る
    pub fn spawn(self) -> SchedulerHandle {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<oneshot::Sender<Result<ProcessReport>>>(8);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let processor = self.processor.clone();
        let period = self.interval.max(Duration::from_secs(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        log_outcome(&run(&processor).await);
                    }
                    Some(reply) = trigger_rx.recv() => {
                        let outcome = run(&processor).await;
                        log_outcome(&outcome);
                        let _ = reply.send(outcome);
                    }
                }
            }
            log::info!("Queue scheduler stopped");
        });

        log::info!("Queue scheduler started (every {:?})", period);
        SchedulerHandle {
            trigger: trigger_tx,
            shutdown: Some(shutdown_tx),
            task,
            processor: self.processor,
        }
    }
}

impl SchedulerHandle {
    /// 手動で1パス実行して結果を待つ（定期実行と同じリースを使う）
    pub async fn trigger_now(&self) -> Result<ProcessReport> {
        let (tx, rx) = oneshot::channel();
        self.trigger
            .send(tx)
            .await
            .map_err(|_| CoreError::Other("scheduler is not running".to_string()))?;
        rx.await
            .map_err(|_| CoreError::Other("scheduler stopped before the pass finished".to_string()))?
    }

    /// 実行中のパスを次のアイテムの前で止め、タスクの終了を待つ
    pub async fn shutdown(mut self) {
        self.processor.cancel_flag().store(true, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            log::error!("Queue scheduler task failed: {}", e);
        }
        self.processor.cancel_flag().store(false, Ordering::SeqCst);
    }
}

async fn run(processor: &QueueProcessor) -> Result<ProcessReport> {
    processor.process_once().await
}

fn log_outcome(outcome: &Result<ProcessReport>) {
    match outcome {
        Ok(_) => {}
        Err(CoreError::LeaseHeld { owner, expires_at }) => {
            log::info!("Queue pass skipped, lease held by {} until {}", owner, expires_at);
        }
        Err(e) => log::error!("Queue pass failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Keys, PublicKey};
    use crate::outbox::DeliveryQueue;
    use crate::relay::mock::MockRelayFactory;
    use crate::relay::RelayPool;
    use crate::storage::memory::MemoryStore;

    fn processor(factory: &MockRelayFactory) -> Arc<QueueProcessor> {
        let store = Arc::new(MemoryStore::new());
        let pool = RelayPool::new(Arc::new(factory.clone()), vec!["wss://r".to_string()])
            .with_ack_wait(Duration::from_millis(10));
        Arc::new(QueueProcessor::new(
            store.clone(),
            DeliveryQueue::new(store),
            pool,
            Keys::parse(&"33".repeat(32)).unwrap(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_now_runs_a_pass() {
        let factory = MockRelayFactory::new();
        let processor = processor(&factory);
        let handle = Scheduler::new(processor.clone(), Duration::from_secs(300)).spawn();

        // 起動直後の tick を消化させる
        tokio::time::sleep(Duration::from_millis(100)).await;

        processor
            .queue()
            .enqueue_dm(PublicKey::from_hex(&"ab".repeat(32)).unwrap(), "hi", "s", "")
            .await
            .unwrap();
        let report = handle.trigger_now().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(factory.sent_events().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_tick_processes_queue() {
        let factory = MockRelayFactory::new();
        let processor = processor(&factory);
        let handle = Scheduler::new(processor.clone(), Duration::from_secs(60)).spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;

        processor
            .queue()
            .enqueue_dm(PublicKey::from_hex(&"ab".repeat(32)).unwrap(), "hi", "s", "")
            .await
            .unwrap();
        assert_eq!(processor.queue().len().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(processor.queue().is_empty().await.unwrap());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_after_shutdown_fails() {
        let factory = MockRelayFactory::new();
        let handle = Scheduler::new(processor(&factory), Duration::from_secs(300)).spawn();
        let trigger = handle.trigger.clone();
        handle.shutdown().await;

        let (tx, _rx) = oneshot::channel();
        assert!(trigger.send(tx).await.is_err());
    }
}
