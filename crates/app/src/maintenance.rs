use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use serde_json::json;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use storefront_storage::Database;

use crate::reconcile::Clock;
use crate::tap::{StageEvent, StageKind, StagePayload, TapHub};

const DELIVERY_TTL_HOURS: i64 = 72;
const MESSAGE_TTL_DAYS: i64 = 30;
const BATCH_LIMIT: i64 = 1000;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Background worker responsible for TTL deletion and WAL checkpoints.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    tap: TapHub,
    clock: Clock,
    interval: Duration,
}

#[derive(Debug, Clone, Copy)]
enum SweptTable {
    WebhookDeliveries,
    PushMessages,
}

impl SweptTable {
    fn name(self) -> &'static str {
        match self {
            Self::WebhookDeliveries => "webhook_deliveries",
            Self::PushMessages => "push_messages",
        }
    }

    fn retention(self) -> ChronoDuration {
        match self {
            Self::WebhookDeliveries => ChronoDuration::hours(DELIVERY_TTL_HOURS),
            Self::PushMessages => ChronoDuration::days(MESSAGE_TTL_DAYS),
        }
    }
}

impl MaintenanceWorker {
    pub fn new(database: Database, tap: TapHub) -> Self {
        Self {
            database,
            tap,
            clock: Arc::new(Utc::now),
            interval: DEFAULT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle (TTL sweeps, then checkpoint).
    pub async fn run_once(&self) -> Result<(), MaintenanceError> {
        let now = (self.clock)();
        for table in [SweptTable::WebhookDeliveries, SweptTable::PushMessages] {
            self.sweep(table, now - table.retention()).await?;
        }
        self.run_checkpoint().await
    }

    async fn sweep(&self, table: SweptTable, threshold: DateTime<Utc>) -> Result<(), MaintenanceError> {
        let name = table.name();
        let mut deleted = 0u64;
        let mut busy = false;

        loop {
            let batch = match table {
                SweptTable::WebhookDeliveries => {
                    self.database
                        .webhook_deliveries()
                        .delete_older_than_batch(threshold, BATCH_LIMIT)
                        .await
                }
                SweptTable::PushMessages => {
                    self.database
                        .push_messages()
                        .delete_older_than_batch(threshold, BATCH_LIMIT)
                        .await
                }
            };
            match batch {
                Ok(0) => break,
                Ok(count) => {
                    deleted += count;
                    counter!("db_ttl_deleted_total", "table" => name).increment(count);
                }
                Err(err) if is_sqlite_busy(&err) => {
                    busy = true;
                    counter!("db_busy_total", "op" => "ttl").increment(1);
                    warn!(stage = "storage", table = name, error = %err, "ttl delete hit busy timeout");
                    break;
                }
                Err(err) => {
                    return Err(MaintenanceError::TtlDelete {
                        table: name,
                        source: err,
                    })
                }
            }
        }

        info!(
            stage = "storage",
            table = name,
            deleted,
            busy,
            threshold = %threshold.to_rfc3339(),
            "TTL sweep completed"
        );
        self.publish_storage_event(
            &format!("ttl.{name}"),
            json!({
                "table": name,
                "deleted": deleted,
                "threshold": threshold.to_rfc3339(),
                "busy": busy,
            }),
        );
        Ok(())
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();
        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                let busy = stats.busy_frames > 0;
                if busy {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
                self.publish_storage_event(
                    "wal.checkpoint",
                    json!({
                        "busy_frames": stats.busy_frames,
                        "log_frames": stats.log_frames,
                        "checkpointed_frames": stats.checkpointed_frames,
                        "busy": busy,
                        "duration_secs": duration,
                    }),
                );
                Ok(())
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                self.publish_storage_event(
                    "wal.checkpoint",
                    json!({ "busy": true, "error": "database busy" }),
                );
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }

    fn publish_storage_event(&self, message: &str, payload: serde_json::Value) {
        let mut event = StageEvent::new((self.clock)(), StageKind::Storage);
        event.meta.message = Some(message.to_string());
        event.out = StagePayload::plain(payload);
        self.tap.publish(event);
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired rows from {table}")]
    TtlDelete {
        table: &'static str,
        #[source]
        source: SqlxError,
    },
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storefront_storage::{NewPushMessage, NewWebhookDelivery, SignatureCheck};
    use tokio::time::timeout;

    use crate::{telemetry, test_support};

    #[tokio::test]
    async fn run_once_deletes_old_rows_and_emits_events() {
        telemetry::init_metrics().expect("metrics");
        let db = test_support::database().await;
        let now = test_support::fixed_now();

        for received_at in [now - ChronoDuration::hours(80), now] {
            db.webhook_deliveries()
                .insert(NewWebhookDelivery {
                    provider: "yalidine",
                    event_type: "parcel_status_updated",
                    event_count: 1,
                    signature: SignatureCheck::Skipped,
                    payload_json: "{}",
                    received_at,
                })
                .await
                .expect("insert delivery");
        }
        for created_at in [now - ChronoDuration::days(31), now - ChronoDuration::days(2)] {
            db.push_messages()
                .insert(NewPushMessage {
                    user_id: None,
                    title: "t",
                    body: "b",
                    url: None,
                    created_at,
                })
                .await
                .expect("insert message");
        }

        let tap = TapHub::new();
        let mut tap_rx = tap.subscribe();
        let worker = MaintenanceWorker::new(db.clone(), tap.clone()).with_clock(Arc::new(move || now));
        worker.run_once().await.expect("run_once");

        let deliveries: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM webhook_deliveries")
            .fetch_one(db.pool())
            .await
            .expect("count deliveries");
        assert_eq!(deliveries.0, 1);

        let messages: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM push_messages")
            .fetch_one(db.pool())
            .await
            .expect("count messages");
        assert_eq!(messages.0, 1);

        let mut names = Vec::new();
        for _ in 0..3 {
            let event = timeout(Duration::from_secs(1), tap_rx.recv())
                .await
                .expect("tap event")
                .expect("event value");
            assert_eq!(event.stage, StageKind::Storage);
            names.push(event.meta.message.unwrap_or_default());
        }
        assert_eq!(
            names,
            ["ttl.webhook_deliveries", "ttl.push_messages", "wal.checkpoint"]
        );
    }
}
