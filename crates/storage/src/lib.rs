use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use storefront_core::types::{Order, PushMessage, PushSubscription};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Pragmas are set on the connect options so every pooled connection gets
    /// them, not only the first one.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for reading and reconciling orders.
    pub fn orders(&self) -> OrderRepository {
        OrderRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the push subscription registry.
    pub fn push_subscriptions(&self) -> PushSubscriptionRepository {
        PushSubscriptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for stored notification contents.
    pub fn push_messages(&self) -> PushMessageRepository {
        PushMessageRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the raw webhook delivery log.
    pub fn webhook_deliveries(&self) -> WebhookDeliveryRepository {
        WebhookDeliveryRepository {
            pool: self.pool.clone(),
        }
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports the frame counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;
        Ok(CheckpointStats {
            busy_frames: row.try_get::<i64, _>(0)?,
            log_frames: row.try_get::<i64, _>(1)?,
            checkpointed_frames: row.try_get::<i64, _>(2)?,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Counters returned by a WAL checkpoint. In-memory databases report `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the order columns touched by delivery reconciliation.
#[derive(Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Inserts an order row with its initial statuses.
    pub async fn insert(&self, order: &NewOrder<'_>) -> Result<(), OrderError> {
        sqlx::query(
            "INSERT INTO orders (id, tracking, delivery_status, call_center_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(order.id)
        .bind(order.tracking)
        .bind(order.delivery_status)
        .bind(order.call_center_status)
        .bind(to_rfc3339(order.created_at))
        .bind(to_rfc3339(order.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads an order by primary key.
    pub async fn fetch(&self, id: &str) -> Result<Option<Order>, OrderError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, tracking, delivery_status, call_center_status, created_at, updated_at \
             FROM orders WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(OrderRow::into_domain))
    }

    /// Returns the first order carrying the tracking number.
    ///
    /// Tracking numbers are not unique; the oldest order wins.
    pub async fn find_by_tracking(&self, tracking: &str) -> Result<Option<Order>, OrderError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, tracking, delivery_status, call_center_status, created_at, updated_at \
             FROM orders WHERE tracking = ? \
             ORDER BY created_at ASC, id ASC \
             LIMIT 1",
        )
        .bind(tracking)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(OrderRow::into_domain))
    }

    /// Overwrites the delivery status unconditionally. Returns `false` when the
    /// order vanished between lookup and update.
    pub async fn update_delivery_status(
        &self,
        id: &str,
        status: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, OrderError> {
        let result =
            sqlx::query("UPDATE orders SET delivery_status = ?, updated_at = ? WHERE id = ?")
                .bind(status)
                .bind(to_rfc3339(updated_at))
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Data required to insert an order.
pub struct NewOrder<'a> {
    pub id: &'a str,
    pub tracking: Option<&'a str>,
    pub delivery_status: Option<&'a str>,
    pub call_center_status: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: String,
    tracking: Option<String>,
    delivery_status: Option<String>,
    call_center_status: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_domain(self) -> Order {
        Order {
            id: self.id,
            tracking: self.tracking,
            delivery_status: self.delivery_status,
            call_center_status: self.call_center_status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Errors raised by the order repository.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for browser push subscriptions, keyed by endpoint.
#[derive(Clone)]
pub struct PushSubscriptionRepository {
    pool: SqlitePool,
}

impl PushSubscriptionRepository {
    /// Creates the subscription or refreshes the keys and owner of an existing endpoint.
    pub async fn upsert(
        &self,
        record: &NewPushSubscription<'_>,
    ) -> Result<UpsertOutcome, PushSubscriptionError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT 1 FROM push_subscriptions WHERE endpoint = ?")
            .bind(record.endpoint)
            .fetch_optional(&mut *tx)
            .await?;

        let now = to_rfc3339(record.at);
        sqlx::query(
            "INSERT INTO push_subscriptions (endpoint, user_id, p256dh, auth, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(endpoint) DO UPDATE \
             SET user_id = excluded.user_id, \
                 p256dh = excluded.p256dh, \
                 auth = excluded.auth, \
                 updated_at = excluded.updated_at",
        )
        .bind(record.endpoint)
        .bind(record.user_id)
        .bind(record.p256dh)
        .bind(record.auth)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    /// Loads a single subscription.
    pub async fn fetch(
        &self,
        endpoint: &str,
    ) -> Result<Option<PushSubscription>, PushSubscriptionError> {
        let row = sqlx::query_as::<_, PushSubscriptionRow>(
            "SELECT endpoint, user_id, p256dh, auth, created_at, updated_at \
             FROM push_subscriptions WHERE endpoint = ?",
        )
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(PushSubscriptionRow::into_domain))
    }

    /// Lists the subscriptions of a user, or every subscription when `user_id` is `None`.
    pub async fn list(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<PushSubscription>, PushSubscriptionError> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query_as::<_, PushSubscriptionRow>(
                    "SELECT endpoint, user_id, p256dh, auth, created_at, updated_at \
                     FROM push_subscriptions WHERE user_id = ? ORDER BY created_at, endpoint",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PushSubscriptionRow>(
                    "SELECT endpoint, user_id, p256dh, auth, created_at, updated_at \
                     FROM push_subscriptions ORDER BY created_at, endpoint",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(PushSubscriptionRow::into_domain).collect())
    }

    /// Removes a subscription the push service no longer accepts.
    pub async fn delete(&self, endpoint: &str) -> Result<bool, PushSubscriptionError> {
        let result = sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = ?")
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Whether an upsert created a new row or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Data required to upsert a push subscription.
pub struct NewPushSubscription<'a> {
    pub endpoint: &'a str,
    pub user_id: Option<&'a str>,
    pub p256dh: &'a str,
    pub auth: &'a str,
    pub at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct PushSubscriptionRow {
    endpoint: String,
    user_id: Option<String>,
    p256dh: String,
    auth: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PushSubscriptionRow {
    fn into_domain(self) -> PushSubscription {
        PushSubscription {
            endpoint: self.endpoint,
            user_id: self.user_id,
            p256dh: self.p256dh,
            auth: self.auth,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Errors raised by the push subscription repository.
#[derive(Debug, Error)]
pub enum PushSubscriptionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for notification contents.
#[derive(Clone)]
pub struct PushMessageRepository {
    pool: SqlitePool,
}

impl PushMessageRepository {
    /// Stores a message and returns it with its generated identifier.
    pub async fn insert(&self, record: NewPushMessage<'_>) -> Result<PushMessage, PushMessageError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO push_messages (id, user_id, title, body, url, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(record.user_id)
        .bind(record.title)
        .bind(record.body)
        .bind(record.url)
        .bind(to_rfc3339(record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(PushMessage {
            id,
            user_id: record.user_id.map(str::to_string),
            title: record.title.to_string(),
            body: record.body.to_string(),
            url: record.url.map(str::to_string),
            created_at: record.created_at,
        })
    }

    /// Lists the newest messages visible to a user: their own plus broadcasts.
    /// Anonymous callers only see broadcasts.
    pub async fn list_for_user(
        &self,
        user_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<PushMessage>, PushMessageError> {
        let rows = sqlx::query_as::<_, PushMessageRow>(
            "SELECT id, user_id, title, body, url, created_at \
             FROM push_messages \
             WHERE user_id IS NULL OR user_id = ? \
             ORDER BY created_at DESC, id DESC \
             LIMIT ?",
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PushMessageRow::into_domain).collect())
    }

    /// Deletes up to `limit` messages created before `threshold`.
    pub async fn delete_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM push_messages WHERE rowid IN \
             (SELECT rowid FROM push_messages WHERE created_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Data required to store a push message.
pub struct NewPushMessage<'a> {
    pub user_id: Option<&'a str>,
    pub title: &'a str,
    pub body: &'a str,
    pub url: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct PushMessageRow {
    id: String,
    user_id: Option<String>,
    title: String,
    body: String,
    url: Option<String>,
    created_at: DateTime<Utc>,
}

impl PushMessageRow {
    fn into_domain(self) -> PushMessage {
        PushMessage {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            body: self.body,
            url: self.url,
            created_at: self.created_at,
        }
    }
}

/// Errors raised by the push message repository.
#[derive(Debug, Error)]
pub enum PushMessageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the raw webhook delivery log.
#[derive(Clone)]
pub struct WebhookDeliveryRepository {
    pool: SqlitePool,
}

impl WebhookDeliveryRepository {
    /// Appends a delivery to the log.
    pub async fn insert(&self, record: NewWebhookDelivery<'_>) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO webhook_deliveries \
             (id, provider, event_type, event_count, signature, payload_json, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record.provider)
        .bind(record.event_type)
        .bind(record.event_count)
        .bind(record.signature.as_str())
        .bind(record.payload_json)
        .bind(to_rfc3339(record.received_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes up to `limit` deliveries received before `threshold`.
    pub async fn delete_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM webhook_deliveries WHERE rowid IN \
             (SELECT rowid FROM webhook_deliveries WHERE received_at < ? LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Outcome of signature verification recorded alongside a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    Invalid,
    Missing,
    Skipped,
}

impl SignatureCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Missing => "missing",
            Self::Skipped => "skipped",
        }
    }
}

/// Data required to log a webhook delivery.
pub struct NewWebhookDelivery<'a> {
    pub provider: &'a str,
    pub event_type: &'a str,
    pub event_count: i64,
    pub signature: SignatureCheck,
    pub payload_json: &'a str,
    pub received_at: DateTime<Utc>,
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    async fn insert_order(db: &Database, id: &str, tracking: Option<&str>, created_at: &str) {
        db.orders()
            .insert(&NewOrder {
                id,
                tracking,
                delivery_status: None,
                call_center_status: Some("confirmed"),
                created_at: at(created_at),
            })
            .await
            .expect("insert order");
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;

        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('orders', 'push_subscriptions', 'push_messages', 'webhook_deliveries')",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 4, "expected core tables to be created");
    }

    #[tokio::test]
    async fn find_by_tracking_returns_oldest_match() {
        let db = setup_db().await;
        insert_order(&db, "order-2", Some("yal-1"), "2024-01-02T00:00:00Z").await;
        insert_order(&db, "order-1", Some("yal-1"), "2024-01-01T00:00:00Z").await;
        insert_order(&db, "order-3", None, "2023-12-31T00:00:00Z").await;

        let order = db
            .orders()
            .find_by_tracking("yal-1")
            .await
            .expect("lookup")
            .expect("order found");
        assert_eq!(order.id, "order-1");
        assert_eq!(order.call_center_status.as_deref(), Some("confirmed"));

        let missing = db.orders().find_by_tracking("yal-404").await.expect("lookup");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn update_delivery_status_overwrites() {
        let db = setup_db().await;
        insert_order(&db, "order-1", Some("yal-1"), "2024-01-01T00:00:00Z").await;
        let repo = db.orders();

        let when = at("2024-01-05T10:00:00Z");
        assert!(repo
            .update_delivery_status("order-1", "Livré", when)
            .await
            .expect("update"));
        assert!(repo
            .update_delivery_status("order-1", "Expédié", when + ChronoDuration::seconds(1))
            .await
            .expect("update"));

        let order = repo.fetch("order-1").await.expect("fetch").expect("order");
        assert_eq!(order.delivery_status.as_deref(), Some("Expédié"));
        assert_eq!(order.updated_at, when + ChronoDuration::seconds(1));
        assert_eq!(order.created_at, at("2024-01-01T00:00:00Z"));

        assert!(!repo
            .update_delivery_status("missing", "Livré", when)
            .await
            .expect("update"));
    }

    #[tokio::test]
    async fn subscription_upsert_is_keyed_by_endpoint() {
        let db = setup_db().await;
        let repo = db.push_subscriptions();
        let first = at("2024-01-01T00:00:00Z");

        let outcome = repo
            .upsert(&NewPushSubscription {
                endpoint: "https://push.example/1",
                user_id: Some("user-1"),
                p256dh: "key-1",
                auth: "auth-1",
                at: first,
            })
            .await
            .expect("create");
        assert_eq!(outcome, UpsertOutcome::Created);

        let outcome = repo
            .upsert(&NewPushSubscription {
                endpoint: "https://push.example/1",
                user_id: Some("user-2"),
                p256dh: "key-2",
                auth: "auth-2",
                at: first + ChronoDuration::minutes(5),
            })
            .await
            .expect("update");
        assert_eq!(outcome, UpsertOutcome::Updated);

        let all = repo.list(None).await.expect("list");
        assert_eq!(all.len(), 1);
        let stored = &all[0];
        assert_eq!(stored.user_id.as_deref(), Some("user-2"));
        assert_eq!(stored.p256dh, "key-2");
        assert_eq!(stored.created_at, first);
        assert_eq!(stored.updated_at, first + ChronoDuration::minutes(5));

        assert!(repo.list(Some("user-1")).await.expect("list").is_empty());
        assert!(repo.delete("https://push.example/1").await.expect("delete"));
        assert!(repo.fetch("https://push.example/1").await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn messages_include_broadcasts_newest_first() {
        let db = setup_db().await;
        let repo = db.push_messages();
        let base = at("2024-01-01T00:00:00Z");

        for (offset, user_id, title) in [
            (0, None, "sale"),
            (1, Some("user-1"), "shipped"),
            (2, Some("user-2"), "other"),
            (3, Some("user-1"), "delivered"),
        ] {
            repo.insert(NewPushMessage {
                user_id,
                title,
                body: "body",
                url: None,
                created_at: base + ChronoDuration::minutes(offset),
            })
            .await
            .expect("insert message");
        }

        let titles: Vec<String> = repo
            .list_for_user(Some("user-1"), 10)
            .await
            .expect("list")
            .into_iter()
            .map(|message| message.title)
            .collect();
        assert_eq!(titles, vec!["delivered", "shipped", "sale"]);

        let anonymous = repo.list_for_user(None, 10).await.expect("list");
        assert_eq!(anonymous.len(), 1);

        let limited = repo.list_for_user(Some("user-1"), 1).await.expect("list");
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].title, "delivered");
    }

    #[tokio::test]
    async fn delivery_ttl_deletes_in_batches() {
        let db = setup_db().await;
        let repo = db.webhook_deliveries();
        let now = at("2024-02-01T00:00:00Z");

        for received_at in [
            now - ChronoDuration::days(40),
            now - ChronoDuration::days(35),
            now - ChronoDuration::days(31),
            now,
        ] {
            repo.insert(NewWebhookDelivery {
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

        let threshold = now - ChronoDuration::days(30);
        assert_eq!(repo.delete_older_than_batch(threshold, 2).await.expect("delete"), 2);
        assert_eq!(repo.delete_older_than_batch(threshold, 2).await.expect("delete"), 1);
        assert_eq!(repo.delete_older_than_batch(threshold, 2).await.expect("delete"), 0);

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM webhook_deliveries")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(remaining.0, 1);
    }
}
