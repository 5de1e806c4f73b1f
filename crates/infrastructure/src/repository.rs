use application::MessageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Message, MessageContent, MessageId, PairKey, RepositoryError, UserId};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};

const UNIQUE_VIOLATION: &str = "23505";

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return RepositoryError::Conflict;
        }
    }
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn to_db_id(value: u64, column: &str) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| invalid_data(format!("{column} {value} exceeds BIGINT range")))
}

fn from_db_id(value: i64, column: &str) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| invalid_data(format!("negative {column} {value}")))
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: i64,
    from_id: i64,
    to_id: i64,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let content =
            MessageContent::new(value.content).map_err(|err| invalid_data(err.to_string()))?;
        Ok(Message::new(
            MessageId(from_db_id(value.id, "id")?),
            UserId(from_db_id(value.from_id, "from_id")?),
            UserId(from_db_id(value.to_id, "to_id")?),
            content,
            value.created_at,
        ))
    }
}

/// PostgreSQL 消息日志
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert_message(&self, message: &Message) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO messages (pair_key, id, from_id, to_id, content, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.pair_key().to_string())
        .bind(to_db_id(message.id.as_u64(), "id")?)
        .bind(to_db_id(message.from_id.as_u64(), "from_id")?)
        .bind(to_db_id(message.to_id.as_u64(), "to_id")?)
        .bind(message.content.as_str())
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn list_messages(
        &self,
        user_a: UserId,
        user_b: UserId,
        before_id: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let before = before_id
            .map(|id| to_db_id(id.as_u64(), "before_id"))
            .transpose()?;

        // 先倒序取最近 limit 条，再按 ID 升序返回
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, from_id, to_id, content, created_at
            FROM (
                SELECT id, from_id, to_id, content, created_at
                FROM messages
                WHERE pair_key = $1
                  AND ($2::BIGINT IS NULL OR id < $2)
                ORDER BY id DESC
                LIMIT $3
            ) page
            ORDER BY id ASC
            "#,
        )
        .bind(PairKey::new(user_a, user_b).to_string())
        .bind(before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_outside_bigint_range_are_rejected() {
        assert_eq!(to_db_id(42, "id").unwrap(), 42);
        assert!(matches!(
            to_db_id(u64::MAX, "id"),
            Err(RepositoryError::Storage { .. })
        ));
        assert!(from_db_id(-1, "id").is_err());
    }

    #[test]
    fn record_converts_to_message() {
        let record = MessageRecord {
            id: 9,
            from_id: 2,
            to_id: 1,
            content: "hello".into(),
            created_at: Utc::now(),
        };
        let message = Message::try_from(record).unwrap();
        assert_eq!(message.id, MessageId(9));
        assert_eq!(message.pair_key().to_string(), "1.2");
    }

    #[test]
    fn blank_stored_content_is_invalid_data() {
        let record = MessageRecord {
            id: 9,
            from_id: 2,
            to_id: 1,
            content: "   ".into(),
            created_at: Utc::now(),
        };
        assert!(Message::try_from(record).is_err());
    }
}
