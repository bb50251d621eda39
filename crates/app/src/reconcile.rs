use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use storefront_core::normalizer::ParcelUpdate;
use storefront_core::status::{is_regression, DeliveryStage};
use storefront_storage::{Database, OrderError};

use crate::tap::{StageEvent, StageKind, StagePayload, TapHub};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Mirrors carrier delivery statuses onto stored orders.
///
/// Each update is an independent read-then-write: the first order carrying
/// the tracking number gets its status overwritten, whatever it was before.
#[derive(Clone)]
pub struct OrderReconciler {
    database: Database,
    tap: TapHub,
    clock: Clock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Updated {
        order_id: String,
        previous: Option<String>,
        regressed: bool,
    },
    NoMatch,
}

impl ReconcileOutcome {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Updated { .. } => "updated",
            Self::NoMatch => "no_match",
        }
    }
}

impl OrderReconciler {
    pub fn new(database: Database, tap: TapHub, clock: Clock) -> Self {
        Self {
            database,
            tap,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Applies one status update.
    pub async fn apply(&self, update: &ParcelUpdate) -> Result<ReconcileOutcome, ReconcileError> {
        let orders = self.database.orders();
        let order = orders
            .find_by_tracking(&update.tracking)
            .await
            .map_err(ReconcileError::Lookup)?;

        let Some(order) = order else {
            info!(
                stage = "reconcile",
                tracking = %update.tracking,
                status = %update.status,
                "no order matches tracking number"
            );
            let outcome = ReconcileOutcome::NoMatch;
            self.record(update, None, &outcome);
            return Ok(outcome);
        };

        let previous = order.delivery_status;
        let regressed = previous
            .as_deref()
            .is_some_and(|prev| is_regression(prev, &update.status));
        if regressed {
            counter!("order_status_regressions_total").increment(1);
            warn!(
                stage = "reconcile",
                order_id = %order.id,
                tracking = %update.tracking,
                previous = previous.as_deref().unwrap_or_default(),
                status = %update.status,
                "delivery status moved backwards; overwriting anyway"
            );
        }

        let updated = orders
            .update_delivery_status(&order.id, &update.status, self.now())
            .await
            .map_err(ReconcileError::Update)?;
        if !updated {
            warn!(
                stage = "reconcile",
                order_id = %order.id,
                tracking = %update.tracking,
                "order disappeared before its status could be updated"
            );
            let outcome = ReconcileOutcome::NoMatch;
            self.record(update, Some(&order.id), &outcome);
            return Ok(outcome);
        }

        info!(
            stage = "reconcile",
            order_id = %order.id,
            tracking = %update.tracking,
            previous = previous.as_deref().unwrap_or_default(),
            status = %update.status,
            reason = update.reason.as_deref().unwrap_or_default(),
            "delivery status updated"
        );
        let outcome = ReconcileOutcome::Updated {
            order_id: order.id.clone(),
            previous,
            regressed,
        };
        self.record(update, Some(&order.id), &outcome);
        Ok(outcome)
    }

    fn record(&self, update: &ParcelUpdate, order_id: Option<&str>, outcome: &ReconcileOutcome) {
        counter!("orders_reconciled_total", "outcome" => outcome.metric_label()).increment(1);

        let mut event = StageEvent::new(self.now(), StageKind::Reconcile);
        event.order_id = order_id.map(str::to_string);
        event.meta.tracking = Some(update.tracking.clone());
        event.meta.message = Some(outcome.metric_label().to_string());
        event.r#in = StagePayload::plain(json!({
            "status": update.status,
            "stage": DeliveryStage::classify(&update.status),
            "reason": update.reason,
        }));
        event.out = StagePayload::plain(match outcome {
            ReconcileOutcome::Updated {
                previous,
                regressed,
                ..
            } => json!({
                "previous": previous,
                "regressed": regressed,
            }),
            ReconcileOutcome::NoMatch => json!({ "matched": false }),
        });
        self.tap.publish(event);
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to look up order by tracking number: {0}")]
    Lookup(#[source] OrderError),
    #[error("failed to update delivery status: {0}")]
    Update(#[source] OrderError),
}
