//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 把提供者返回的 [`SecurityStatus`] 在 `credential`/`context` 边界翻译为调用方可处理的错误分类；
//! - 为每个分类给出稳定错误码，便于宿主协议栈按码决定是否换用其他认证机制。
//!
//! ## 设计要求（What）
//! - 握手与消息保护错误原样向上传播，本 crate 不做任何重试；
//! - 探测失败（最大令牌尺寸）不在此列，由 `probe` 模块吸收；
//! - 资源释放失败只记录日志，永远不会构造成 [`SspiError`]。

use std::error::Error as StdError;

use thiserror::Error;

use crate::buffer::BufferError;
use crate::status::SecurityStatus;

/// 稳定错误码。
pub mod codes {
    pub const CREDENTIAL_UNAVAILABLE: &str = "spark.sspi.credential_unavailable";
    pub const HANDSHAKE_FAILED: &str = "spark.sspi.handshake_failed";
    pub const ENCRYPT_FAILED: &str = "spark.sspi.encrypt_failed";
    pub const DECRYPT_FAILED: &str = "spark.sspi.decrypt_failed";
    pub const BUFFER_INVALID: &str = "spark.sspi.buffer_invalid";
    pub const TRANSPORT_FAILED: &str = "spark.sspi.transport_failed";
}

/// 认证引擎错误域。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 携带 `status` 的变体保留提供者原始状态，`None` 表示错误由引擎自身的前置检查产生
///     （例如上下文尚未建立），此时没有调用提供者；
///   - `message` 为面向排障人员的英文描述，不包含令牌内容或口令。
/// - **执行逻辑 (How)**：`credential`/`context` 通过 [`SspiError::handshake`] 等构造函数把状态转换为
///   对应分类，描述优先取 [`SecurityStatus::describe`]。
#[derive(Debug, Error)]
pub enum SspiError {
    /// 身份被拒绝或安全包不可用。
    #[error("failed to acquire credential for package `{package}`: {message}")]
    CredentialAcquisition {
        package: String,
        status: SecurityStatus,
        message: String,
    },

    /// 握手被提供者拒绝或中止；上下文随之不可用。
    #[error("authentication handshake failed: {message}")]
    AuthenticationHandshake {
        status: Option<SecurityStatus>,
        message: String,
    },

    #[error("message encryption failed: {message}")]
    Encryption {
        status: Option<SecurityStatus>,
        message: String,
    },

    /// 包含签名校验失败。
    #[error("message decryption failed: {message}")]
    Decryption {
        status: Option<SecurityStatus>,
        message: String,
    },

    #[error("security buffer rejected: {0}")]
    Buffer(#[from] BufferError),

    /// 调用方提供的传输层失败，仅由 SASL 驱动产生。
    #[error("transport failed during authentication: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),
}

impl SspiError {
    pub(crate) fn credential(package: &str, status: SecurityStatus) -> Self {
        Self::CredentialAcquisition {
            package: package.to_owned(),
            status,
            message: describe(status),
        }
    }

    pub(crate) fn handshake(status: SecurityStatus) -> Self {
        Self::AuthenticationHandshake {
            status: Some(status),
            message: describe(status),
        }
    }

    pub(crate) fn handshake_rejected(message: impl Into<String>) -> Self {
        Self::AuthenticationHandshake {
            status: None,
            message: message.into(),
        }
    }

    pub(crate) fn encryption(status: SecurityStatus) -> Self {
        Self::Encryption {
            status: Some(status),
            message: describe(status),
        }
    }

    pub(crate) fn encryption_rejected(message: impl Into<String>) -> Self {
        Self::Encryption {
            status: None,
            message: message.into(),
        }
    }

    pub(crate) fn decryption(status: SecurityStatus) -> Self {
        Self::Decryption {
            status: Some(status),
            message: describe(status),
        }
    }

    pub(crate) fn decryption_rejected(message: impl Into<String>) -> Self {
        Self::Decryption {
            status: None,
            message: message.into(),
        }
    }

    /// 包装调用方传输层的错误。
    pub fn transport(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Transport(error.into())
    }

    /// 稳定错误码，见 [`codes`]。
    pub fn code(&self) -> &'static str {
        match self {
            Self::CredentialAcquisition { .. } => codes::CREDENTIAL_UNAVAILABLE,
            Self::AuthenticationHandshake { .. } => codes::HANDSHAKE_FAILED,
            Self::Encryption { .. } => codes::ENCRYPT_FAILED,
            Self::Decryption { .. } => codes::DECRYPT_FAILED,
            Self::Buffer(_) => codes::BUFFER_INVALID,
            Self::Transport(_) => codes::TRANSPORT_FAILED,
        }
    }

    /// 提供者原始状态（若有）。
    pub fn status(&self) -> Option<SecurityStatus> {
        match self {
            Self::CredentialAcquisition { status, .. } => Some(*status),
            Self::AuthenticationHandshake { status, .. }
            | Self::Encryption { status, .. }
            | Self::Decryption { status, .. } => *status,
            Self::Buffer(_) | Self::Transport(_) => None,
        }
    }
}

fn describe(status: SecurityStatus) -> String {
    status.to_string()
}

/// 本 crate 的结果别名。
pub type Result<T, E = SspiError> = core::result::Result<T, E>;
