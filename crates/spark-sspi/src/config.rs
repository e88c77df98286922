//! 认证引擎的配置形态。
//!
//! 配置的加载（文件、环境变量、命令行）属于宿主职责；本模块只定义宿主反序列化的目标结构，
//! 以及从配置派生握手参数的辅助方法。
//!
//! ```toml
//! package = "Kerberos"
//! service_name = "mongodb"
//! service_realm = "EXAMPLE.COM"
//! protection = "encrypt"
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::probe::{self, DEFAULT_MAX_TOKEN_SIZE};
use crate::provider::{ContextRequirements, MessageProtection};

/// 认证引擎配置。缺省字段取默认值。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SspiConfig {
    /// 安全包名称。
    pub package: String,
    /// 目标服务名，构成 SPN 的第一段。
    pub service_name: String,
    /// 目标服务所在的 Kerberos 域。
    pub service_realm: Option<String>,
    /// 握手完成后的消息保护级别。
    pub protection: MessageProtection,
    /// 最大令牌尺寸探测失败时的回退值。
    pub fallback_max_token_size: usize,
    /// SASL 会话允许的最大往返轮数。
    pub max_rounds: usize,
}

impl Default for SspiConfig {
    fn default() -> Self {
        Self {
            package: "Kerberos".to_owned(),
            service_name: "mongodb".to_owned(),
            service_realm: None,
            protection: MessageProtection::Encrypt,
            fallback_max_token_size: DEFAULT_MAX_TOKEN_SIZE,
            max_rounds: 10,
        }
    }
}

impl SspiConfig {
    /// 针对 `host` 构造目标主体名。
    pub fn service_principal(&self, host: &str) -> ServicePrincipal {
        let principal = ServicePrincipal::new(&self.service_name, host);
        match &self.service_realm {
            Some(realm) => principal.with_realm(realm),
            None => principal,
        }
    }

    /// 派生上下文选项：始终请求双向认证、机密性与完整性。
    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            requirements: ContextRequirements::MUTUAL_AUTH
                | ContextRequirements::CONFIDENTIALITY
                | ContextRequirements::INTEGRITY,
            protection: self.protection,
        }
    }

    /// 把配置的回退值装入进程级令牌尺寸探测，需在首个上下文握手之前调用。
    ///
    /// 返回 `false` 表示探测已经发生或回退值已被设置过，本次配置未生效。
    pub fn install_token_size_fallback(&self) -> bool {
        probe::set_fallback_max_token_size(self.fallback_max_token_size)
    }
}

/// 服务主体名（SPN），渲染为 `service/host[@REALM]`。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServicePrincipal {
    service: String,
    host: String,
    realm: Option<String>,
}

impl ServicePrincipal {
    pub fn new(service: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            host: host.into(),
            realm: None,
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }
}

impl fmt::Display for ServicePrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.host)?;
        if let Some(realm) = &self.realm {
            write!(f, "@{realm}")?;
        }
        Ok(())
    }
}

/// 单个上下文的握手与消息保护参数。
///
/// `requirements` 是在双向认证之外追加的属性，握手总会请求
/// [`ContextRequirements::MUTUAL_AUTH`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextOptions {
    pub requirements: ContextRequirements,
    pub protection: MessageProtection,
}

impl Default for ContextOptions {
    fn default() -> Self {
        SspiConfig::default().context_options()
    }
}
