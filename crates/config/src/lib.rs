//! 统一配置中心
//!
//! 加载顺序：内置默认值 → 可选配置文件（`RELAY_CONFIG_FILE`）→ 环境变量（`RELAY_*`，
//! 以 `__` 表示嵌套）。为兼容旧部署，还识别 `PORT` 与 `DATABASE_URL`。

use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 全局应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub relay: RelayConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    /// 允许的跨域来源，`*` 表示任意来源
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// 会话存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    /// 进程内存储，仅用于开发和测试
    Memory,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    #[serde(default)]
    pub url: String,
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

/// 实时中继配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RelayConfig {
    /// 等待握手帧的最长时间
    #[validate(range(min = 1))]
    pub handshake_timeout_ms: u64,
    /// 单个连接单次投递的最长时间，超时视为死连接
    #[validate(range(min = 1))]
    pub delivery_timeout_ms: u64,
    /// 每个连接的出站缓冲帧数
    #[validate(range(min = 1))]
    pub outbound_buffer: usize,
    /// 连接注册表的请求队列长度
    #[validate(range(min = 1))]
    pub registry_buffer: usize,
}

impl RelayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            delivery_timeout_ms: 2_000,
            outbound_buffer: 64,
            registry_buffer: 256,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8082,
                cors_origins: vec!["*".to_string()],
            },
            database: DatabaseConfig {
                backend: StorageBackend::Memory,
                url: String::new(),
                max_connections: 5,
            },
            relay: RelayConfig::default(),
        }
    }
}

impl AppConfig {
    /// 构建完整的配置来源链
    pub fn figment() -> Figment {
        let mut fig = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("RELAY_CONFIG_FILE") {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig.merge(Env::raw().only(&["PORT"]).map(|_| "server.port".into()))
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database.url".into()))
            .merge(Env::prefixed("RELAY_").ignore(&["CONFIG_FILE"]).split("__"))
    }

    /// 从环境加载并验证配置
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// 字段级校验加跨字段校验
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.database.backend == StorageBackend::Postgres && self.database.url.trim().is_empty()
        {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 用于日志输出的配置描述，隐藏连接串中的凭据
    pub fn sanitized(&self) -> String {
        let mut config = self.clone();
        config.database.url = redact_credentials(&config.database.url);
        format!("{config:?}")
    }
}

fn redact_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://[REDACTED]{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("database.url is required when database.backend = \"postgres\"")]
    MissingDatabaseUrl,
}
