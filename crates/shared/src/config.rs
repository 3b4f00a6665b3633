//! 配置管理模块
//!
//! 支持多格式配置文件加载（toml / yaml / json，按扩展名识别），环境变量覆盖，
//! 以及类型安全的配置反序列化。具体的配置结构由各服务自行定义。

use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Result;

/// 指定单个配置文件的环境变量，设置后该文件必须存在
pub const CONFIG_FILE_ENV: &str = "CONFIG_FILE";

/// 配置目录的环境变量，默认 `config`
pub const CONFIG_DIR_ENV: &str = "CONFIG_DIR";

/// 配置加载器
///
/// 加载顺序（后加载的会覆盖先加载的同名配置项）：
/// 1. {config_dir}/default.*（可选）
/// 2. {config_dir}/{service_name}.*（可选）
/// 3. CONFIG_FILE 指定的文件（必须存在）
/// 4. 环境变量（如 STREAM_KAFKA__GROUP_ID -> kafka.group_id）
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    service_name: String,
    env_prefix: String,
    config_dir: PathBuf,
    config_file: Option<PathBuf>,
    list_keys: Vec<String>,
}

impl ConfigLoader {
    pub fn new(service_name: impl Into<String>, env_prefix: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            env_prefix: env_prefix.into(),
            config_dir: PathBuf::from("config"),
            config_file: None,
            list_keys: Vec::new(),
        }
    }

    /// 从 CONFIG_DIR / CONFIG_FILE 环境变量读取文件位置
    pub fn from_env(service_name: impl Into<String>, env_prefix: impl Into<String>) -> Self {
        let mut loader = Self::new(service_name, env_prefix);
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
            && !dir.is_empty()
        {
            loader.config_dir = PathBuf::from(dir);
        }
        if let Ok(file) = std::env::var(CONFIG_FILE_ENV)
            && !file.is_empty()
        {
            loader.config_file = Some(PathBuf::from(file));
        }
        loader
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn with_config_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.config_file = Some(file.into());
        self
    }

    /// 声明按逗号拆分为列表的配置键（如 `kafka.topics`）
    pub fn with_list_key(mut self, key: impl Into<String>) -> Self {
        self.list_keys.push(key.into());
        self
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<T> {
        let mut builder = Config::builder()
            .set_default("service_name", self.service_name.as_str())?
            .add_source(File::from(self.config_dir.join("default")).required(false))
            .add_source(File::from(self.config_dir.join(&self.service_name)).required(false));

        if let Some(file) = &self.config_file {
            debug!(path = %file.display(), "加载指定配置文件");
            builder = builder.add_source(File::from(file.as_path()).required(true));
        }

        let mut environment = Environment::with_prefix(&self.env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        if !self.list_keys.is_empty() {
            environment = environment.list_separator(",");
            for key in &self.list_keys {
                environment = environment.with_list_parse_key(key);
            }
        }

        let config: T = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
