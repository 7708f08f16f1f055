use std::str::FromStr;

use application::ChatRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    AppendOutcome, Chat, ChatId, ChatMessage, ChatStatus, ChatSummary, CloseOutcome, EnsuredChat,
    RepositoryError, Timestamp,
};
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, PgPool};
use tracing::debug;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::storage(err.to_string())
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

#[derive(Debug, FromRow)]
struct ChatRecord {
    chat_id: String,
    owner_identity: String,
    status: String,
    messages: Json<Vec<ChatMessage>>,
    last_message: Option<Json<ChatMessage>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ChatRecord> for Chat {
    type Error = RepositoryError;

    fn try_from(value: ChatRecord) -> Result<Self, Self::Error> {
        let chat_id = ChatId::parse(value.chat_id).map_err(|err| invalid_data(err.to_string()))?;
        let status =
            ChatStatus::from_str(&value.status).map_err(|err| invalid_data(err.to_string()))?;

        Ok(Chat {
            chat_id,
            owner_identity: value.owner_identity,
            status,
            messages: value.messages.0,
            last_message: value.last_message.map(|json| json.0),
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SummaryRecord {
    chat_id: String,
    owner_identity: String,
    status: String,
    last_message: Option<Json<ChatMessage>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SummaryRecord> for ChatSummary {
    type Error = RepositoryError;

    fn try_from(value: SummaryRecord) -> Result<Self, Self::Error> {
        let chat_id = ChatId::parse(value.chat_id).map_err(|err| invalid_data(err.to_string()))?;
        let status =
            ChatStatus::from_str(&value.status).map_err(|err| invalid_data(err.to_string()))?;

        Ok(ChatSummary {
            chat_id,
            owner_identity: value.owner_identity,
            status,
            last_message: value.last_message.map(|json| json.0),
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

const SUMMARY_COLUMNS: &str =
    "chat_id, owner_identity, status, last_message, created_at, updated_at";

/// 会话文档存储在单表中，消息以 JSONB 数组内嵌
#[derive(Clone)]
pub struct PgChatRepository {
    pool: PgPool,
}

impl PgChatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_summary(&self, chat_id: &ChatId) -> Result<Option<ChatSummary>, RepositoryError> {
        let record = sqlx::query_as::<_, SummaryRecord>(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM chats WHERE chat_id = $1"
        ))
        .bind(chat_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(ChatSummary::try_from).transpose()
    }
}

#[async_trait]
impl ChatRepository for PgChatRepository {
    async fn create_if_absent(&self, chat: Chat) -> Result<EnsuredChat, RepositoryError> {
        let inserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO chats (chat_id, owner_identity, status, messages, last_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (chat_id) DO NOTHING
            RETURNING chat_id
            "#,
        )
        .bind(chat.chat_id.as_str())
        .bind(&chat.owner_identity)
        .bind(chat.status.as_str())
        .bind(Json(&chat.messages))
        .bind(chat.last_message.as_ref().map(Json))
        .bind(chat.created_at)
        .bind(chat.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if inserted.is_some() {
            return Ok(EnsuredChat {
                summary: chat.summary(),
                created: true,
            });
        }

        let summary = self
            .find_summary(&chat.chat_id)
            .await?
            .ok_or_else(|| invalid_data("chat vanished after conflicting insert"))?;
        Ok(EnsuredChat {
            summary,
            created: false,
        })
    }

    async fn find_status(&self, chat_id: &ChatId) -> Result<Option<ChatStatus>, RepositoryError> {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM chats WHERE chat_id = $1")
            .bind(chat_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        status
            .map(|raw| ChatStatus::from_str(&raw).map_err(|err| invalid_data(err.to_string())))
            .transpose()
    }

    async fn append_message(
        &self,
        chat_id: &ChatId,
        owner_identity: &str,
        message: ChatMessage,
    ) -> Result<AppendOutcome, RepositoryError> {
        // 文档缺失时连同该消息一起创建；已结束的会话不满足 WHERE，不返回行
        let appended = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO chats (chat_id, owner_identity, status, messages, last_message, created_at, updated_at)
            VALUES ($1, $2, 'active', jsonb_build_array($3::jsonb), $3::jsonb, $4, $4)
            ON CONFLICT (chat_id) DO UPDATE
            SET messages = chats.messages || jsonb_build_array(EXCLUDED.last_message),
                last_message = EXCLUDED.last_message,
                updated_at = EXCLUDED.updated_at
            WHERE chats.status = 'active'
            RETURNING chat_id
            "#,
        )
        .bind(chat_id.as_str())
        .bind(owner_identity)
        .bind(Json(&message))
        .bind(message.timestamp)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let outcome = match appended {
            Some(_) => AppendOutcome::Appended,
            None => AppendOutcome::ChatEnded,
        };
        debug!(chat_id = %chat_id, outcome = ?outcome, "消息追加完成");
        Ok(outcome)
    }

    async fn last_message_at(
        &self,
        chat_id: &ChatId,
    ) -> Result<Option<Timestamp>, RepositoryError> {
        let last = sqlx::query_scalar::<_, Option<Json<ChatMessage>>>(
            "SELECT last_message FROM chats WHERE chat_id = $1",
        )
        .bind(chat_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(last.flatten().map(|json| json.0.timestamp))
    }

    async fn mark_ended(
        &self,
        chat_id: &ChatId,
        at: Timestamp,
    ) -> Result<CloseOutcome, RepositoryError> {
        let transitioned = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE chats
            SET status = 'ended', updated_at = $2
            WHERE chat_id = $1 AND status <> 'ended'
            RETURNING chat_id
            "#,
        )
        .bind(chat_id.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if transitioned.is_some() {
            return Ok(CloseOutcome::Closed);
        }
        Ok(match self.find_status(chat_id).await? {
            Some(_) => CloseOutcome::AlreadyEnded,
            None => CloseOutcome::NotFound,
        })
    }

    async fn find_by_id(&self, chat_id: &ChatId) -> Result<Option<Chat>, RepositoryError> {
        let record = sqlx::query_as::<_, ChatRecord>(
            r#"SELECT chat_id, owner_identity, status, messages, last_message, created_at, updated_at FROM chats WHERE chat_id = $1"#,
        )
        .bind(chat_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Chat::try_from).transpose()
    }

    async fn list_by_status(
        &self,
        status: ChatStatus,
        owner_identity: Option<String>,
    ) -> Result<Vec<ChatSummary>, RepositoryError> {
        let records = sqlx::query_as::<_, SummaryRecord>(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM chats \
             WHERE status = $1 AND ($2::text IS NULL OR owner_identity = $2) \
             ORDER BY updated_at DESC"
        ))
        .bind(status.as_str())
        .bind(owner_identity)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(ChatSummary::try_from).collect()
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
