use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::{
    migrations::MIGRATOR,
    repository::{create_pg_pool, PgChatRepository},
};

#[derive(Debug, Clone)]
pub struct InfrastructureConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl From<&config::DatabaseConfig> for InfrastructureConfig {
    fn from(value: &config::DatabaseConfig) -> Self {
        Self {
            database_url: value.url.clone(),
            max_connections: value.max_connections,
        }
    }
}

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone)]
pub struct Infrastructure {
    pub chat_repository: Arc<PgChatRepository>,
}

impl Infrastructure {
    /// 建立连接池并执行迁移
    pub async fn connect(config: InfrastructureConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database_url, config.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        info!(max_connections = config.max_connections, "数据库已就绪");

        Ok(Self {
            chat_repository: Arc::new(PgChatRepository::new(pool)),
        })
    }
}
