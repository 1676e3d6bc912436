use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::to_rfc3339;

/// Repository for the change-event outbox. Events are appended inside the
/// transaction that persists the entities and read back by a relay in
/// sequence order.
#[derive(Clone)]
pub struct OutboxRepository {
    pool: SqlitePool,
}

impl OutboxRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Appends one event and returns its sequence number.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: &NewOutboxEvent<'_>,
    ) -> Result<i64, OutboxError> {
        let row = sqlx::query(
            "INSERT INTO outbox (id, topic, entity_type, entity_count, payload_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             RETURNING seq",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(event.topic)
        .bind(event.entity_type)
        .bind(event.entity_count as i64)
        .bind(event.payload_json)
        .bind(to_rfc3339(event.created_at))
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.get("seq"))
    }

    /// Lists events with a sequence number greater than `after`, oldest first.
    pub async fn list_after(&self, after: i64, limit: u32) -> Result<Vec<OutboxEvent>, OutboxError> {
        let events = sqlx::query_as::<_, OutboxEvent>(
            "SELECT seq, id, topic, entity_type, entity_count, payload_json, created_at \
             FROM outbox WHERE seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

/// Event payload to append.
pub struct NewOutboxEvent<'a> {
    pub topic: &'a str,
    pub entity_type: &'a str,
    pub entity_count: usize,
    pub payload_json: &'a str,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxEvent {
    pub seq: i64,
    pub id: String,
    pub topic: String,
    pub entity_type: String,
    pub entity_count: i64,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_database;

    #[tokio::test]
    async fn events_are_listed_after_cursor_in_order() {
        let (_dir, db) = test_database().await;
        let outbox = db.outbox();

        let mut tx = db.pool().begin().await.expect("begin");
        let mut seqs = Vec::new();
        for topic in ["save-referral-topic", "update-referral-topic"] {
            let seq = outbox
                .append(
                    &mut tx,
                    &NewOutboxEvent {
                        topic,
                        entity_type: "referral",
                        entity_count: 1,
                        payload_json: "[]",
                        created_at: Utc::now(),
                    },
                )
                .await
                .expect("append");
            seqs.push(seq);
        }
        tx.commit().await.expect("commit");

        let all = outbox.list_after(0, 10).await.expect("list");
        let topics: Vec<_> = all.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, vec!["save-referral-topic", "update-referral-topic"]);

        let rest = outbox.list_after(seqs[0], 10).await.expect("list");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].seq, seqs[1]);
    }

    #[tokio::test]
    async fn rolled_back_events_are_not_visible() {
        let (_dir, db) = test_database().await;
        let outbox = db.outbox();

        let mut tx = db.pool().begin().await.expect("begin");
        outbox
            .append(
                &mut tx,
                &NewOutboxEvent {
                    topic: "save-side-effect-topic",
                    entity_type: "side-effect",
                    entity_count: 2,
                    payload_json: "[]",
                    created_at: Utc::now(),
                },
            )
            .await
            .expect("append");
        tx.rollback().await.expect("rollback");

        assert!(outbox.list_after(0, 10).await.expect("list").is_empty());
    }
}
