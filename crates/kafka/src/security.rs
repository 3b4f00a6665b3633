//! TLS / SASL 配置组装
//!
//! 把证书路径与 SASL 凭证写入 librdkafka 的客户端配置，
//! 并根据启用情况选择 `security.protocol`。

use std::fmt;
use std::path::Path;

use rdkafka::config::ClientConfig;
use serde::Deserialize;

use crate::error::{ConsumerError, Result};

pub const DEFAULT_SASL_MECHANISM: &str = "SCRAM-SHA-512";

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub tls_enabled: bool,
    pub client_key_file_path: String,
    pub client_cert_file_path: String,
    pub ca_file_path: String,
    pub enable_cert_verification: bool,
    pub sasl_user: String,
    pub sasl_password: String,
    pub sasl_mechanism: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            tls_enabled: false,
            client_key_file_path: String::new(),
            client_cert_file_path: String::new(),
            ca_file_path: String::new(),
            enable_cert_verification: false,
            sasl_user: String::new(),
            sasl_password: String::new(),
            sasl_mechanism: DEFAULT_SASL_MECHANISM.to_string(),
        }
    }
}

// 密码不进日志
impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("tls_enabled", &self.tls_enabled)
            .field("client_key_file_path", &self.client_key_file_path)
            .field("client_cert_file_path", &self.client_cert_file_path)
            .field("ca_file_path", &self.ca_file_path)
            .field("enable_cert_verification", &self.enable_cert_verification)
            .field("sasl_user", &self.sasl_user)
            .field("sasl_password", &"***")
            .field("sasl_mechanism", &self.sasl_mechanism)
            .finish()
    }
}

impl SecurityConfig {
    pub fn sasl_enabled(&self) -> bool {
        !self.sasl_user.is_empty()
    }

    /// 对应的 `security.protocol` 取值
    pub fn protocol(&self) -> &'static str {
        match (self.tls_enabled, self.sasl_enabled()) {
            (false, false) => "plaintext",
            (true, false) => "ssl",
            (false, true) => "sasl_plaintext",
            (true, true) => "sasl_ssl",
        }
    }

    /// 写入客户端配置
    ///
    /// 启用 TLS 时证书、私钥和 CA 文件都必须可读，错误信息带上出错的路径。
    pub fn apply(&self, client: &mut ClientConfig) -> Result<()> {
        if self.tls_enabled {
            check_readable("client cert", &self.client_cert_file_path)?;
            check_readable("client key", &self.client_key_file_path)?;
            check_readable("CA cert", &self.ca_file_path)?;

            client
                .set("ssl.certificate.location", &self.client_cert_file_path)
                .set("ssl.key.location", &self.client_key_file_path)
                .set("ssl.ca.location", &self.ca_file_path)
                .set(
                    "enable.ssl.certificate.verification",
                    self.enable_cert_verification.to_string(),
                )
                .set(
                    "ssl.endpoint.identification.algorithm",
                    if self.enable_cert_verification {
                        "https"
                    } else {
                        "none"
                    },
                );
        }

        if self.sasl_enabled() {
            if self.sasl_password.is_empty() {
                return Err(ConsumerError::Security(format!(
                    "SASL 用户 {} 未配置密码",
                    self.sasl_user
                )));
            }
            let mechanism = if self.sasl_mechanism.is_empty() {
                DEFAULT_SASL_MECHANISM
            } else {
                self.sasl_mechanism.as_str()
            };
            client
                .set("sasl.mechanisms", mechanism)
                .set("sasl.username", &self.sasl_user)
                .set("sasl.password", &self.sasl_password);
        }

        client.set("security.protocol", self.protocol());
        Ok(())
    }
}

fn check_readable(kind: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(ConsumerError::Security(format!("未配置 {kind} 文件路径")));
    }
    std::fs::File::open(Path::new(path))
        .map(|_| ())
        .map_err(|e| ConsumerError::Security(format!("读取 {kind} 文件 {path} 失败: {e}")))
}
