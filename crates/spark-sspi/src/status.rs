//! 安全提供者状态码的类型化表示与分类。
//!
//! # 契约（What）
//! - [`SecurityStatus`] 以 32 位有符号整数承载提供者返回值，码值与 SSPI `SECURITY_STATUS` 一致，
//!   平台适配层可以直接透传；
//! - [`SecurityStatus::class`] 把码值归入 [`StatusClass`]，握手状态机只依据分类推进；
//! - 分类之外的细节（码值、描述）仅用于错误消息与日志，转换为 [`crate::SspiError`] 的动作
//!   只发生在 `context`/`credential` 边界。

use core::fmt;

/// 提供者调用的类型化状态。
///
/// 非负值表示成功或“需要继续”，负值表示失败，与 Win32 `SECURITY_STATUS` 的判定规则一致。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecurityStatus(i32);

#[allow(clippy::unreadable_literal)]
impl SecurityStatus {
    pub const OK: Self = Self(0);
    pub const CONTINUE_NEEDED: Self = Self(0x0009_0312);
    pub const COMPLETE_NEEDED: Self = Self(0x0009_0313);
    pub const COMPLETE_AND_CONTINUE: Self = Self(0x0009_0314);
    pub const CONTEXT_EXPIRED_INFO: Self = Self(0x0009_0317);

    pub const INSUFFICIENT_MEMORY: Self = Self::error(0x8009_0300);
    pub const INVALID_HANDLE: Self = Self::error(0x8009_0301);
    pub const UNSUPPORTED_FUNCTION: Self = Self::error(0x8009_0302);
    pub const TARGET_UNKNOWN: Self = Self::error(0x8009_0303);
    pub const INTERNAL_ERROR: Self = Self::error(0x8009_0304);
    pub const PACKAGE_NOT_FOUND: Self = Self::error(0x8009_0305);
    pub const INVALID_TOKEN: Self = Self::error(0x8009_0308);
    pub const QOP_NOT_SUPPORTED: Self = Self::error(0x8009_030A);
    pub const LOGON_DENIED: Self = Self::error(0x8009_030C);
    pub const UNKNOWN_CREDENTIALS: Self = Self::error(0x8009_030D);
    pub const NO_CREDENTIALS: Self = Self::error(0x8009_030E);
    pub const MESSAGE_ALTERED: Self = Self::error(0x8009_030F);
    pub const OUT_OF_SEQUENCE: Self = Self::error(0x8009_0310);
    pub const CONTEXT_EXPIRED: Self = Self::error(0x8009_0317);
    pub const INCOMPLETE_MESSAGE: Self = Self::error(0x8009_0318);
    pub const BUFFER_TOO_SMALL: Self = Self::error(0x8009_0321);
    pub const WRONG_PRINCIPAL: Self = Self::error(0x8009_0322);
    pub const TIME_SKEW: Self = Self::error(0x8009_0324);
    pub const DECRYPT_FAILURE: Self = Self::error(0x8009_0330);

    const fn error(code: u32) -> Self {
        Self(code as i32)
    }

    /// 以原始码值构造状态，供平台适配层透传。
    pub const fn from_raw(code: i32) -> Self {
        Self(code)
    }

    /// 原始码值。
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// 是否为成功类状态（含需要继续的信息码）。
    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// 将状态归类为握手状态机可理解的三分支（外加补全令牌的两个分支）。
    ///
    /// # 契约
    /// - `OK` 与其他未列出的非负信息码视为 [`StatusClass::Complete`]；
    /// - `CONTINUE_NEEDED` → [`StatusClass::ContinueNeeded`]；
    /// - `COMPLETE_NEEDED`/`COMPLETE_AND_CONTINUE` 需要先调用补全原语；
    /// - 任意负值 → [`StatusClass::Failure`]。
    pub const fn class(self) -> StatusClass {
        match self {
            Self::CONTINUE_NEEDED => StatusClass::ContinueNeeded,
            Self::COMPLETE_NEEDED => StatusClass::CompleteNeeded,
            Self::COMPLETE_AND_CONTINUE => StatusClass::CompleteAndContinue,
            status if status.is_success() => StatusClass::Complete,
            _ => StatusClass::Failure,
        }
    }

    /// 面向排障人员的简短描述；未登记的码值返回 `None`。
    pub fn describe(self) -> Option<&'static str> {
        let text = match self {
            Self::OK => "the operation completed successfully",
            Self::CONTINUE_NEEDED => "the handshake requires another round trip",
            Self::COMPLETE_NEEDED => "the token must be completed before it is sent",
            Self::COMPLETE_AND_CONTINUE => {
                "the token must be completed and the handshake requires another round trip"
            }
            Self::CONTEXT_EXPIRED_INFO => "the peer closed the security context",
            Self::INSUFFICIENT_MEMORY => "not enough memory to complete the request",
            Self::INVALID_HANDLE => "the handle passed to the provider is not valid",
            Self::UNSUPPORTED_FUNCTION => "the provider does not support this function",
            Self::TARGET_UNKNOWN => "the target principal is unknown",
            Self::INTERNAL_ERROR => "the provider reported an internal error",
            Self::PACKAGE_NOT_FOUND => "the requested security package does not exist",
            Self::INVALID_TOKEN => "the token supplied to the provider is not valid",
            Self::QOP_NOT_SUPPORTED => "the requested quality of protection is not supported",
            Self::LOGON_DENIED => "the logon attempt failed",
            Self::UNKNOWN_CREDENTIALS => "the credentials supplied were not recognized",
            Self::NO_CREDENTIALS => "no credentials are available in the security package",
            Self::MESSAGE_ALTERED => "the message or signature has been altered",
            Self::OUT_OF_SEQUENCE => "the message was received out of sequence",
            Self::CONTEXT_EXPIRED => "the security context has expired",
            Self::INCOMPLETE_MESSAGE => "the supplied message is incomplete",
            Self::BUFFER_TOO_SMALL => "the supplied buffer is too small",
            Self::WRONG_PRINCIPAL => "the target principal name is incorrect",
            Self::TIME_SKEW => "the clock skew between client and server is too great",
            Self::DECRYPT_FAILURE => "the message could not be decrypted",
            _ => return None,
        };
        Some(text)
    }
}

impl fmt::Debug for SecurityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityStatus({:#010x})", self.0 as u32)
    }
}

impl fmt::Display for SecurityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some(text) => write!(f, "{text} ({:#010x})", self.0 as u32),
            None => write!(f, "security status {:#010x}", self.0 as u32),
        }
    }
}

/// 状态分类，驱动握手状态机。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    /// 上下文已建立。
    Complete,
    /// 需要把输出令牌发给对端并等待下一轮输入。
    ContinueNeeded,
    /// 需先补全令牌，之后上下文即建立。
    CompleteNeeded,
    /// 需先补全令牌，之后仍需继续往返。
    CompleteAndContinue,
    /// 不可恢复的失败。
    Failure,
}

/// 提供者原语的返回形态：成功时携带结果，失败时携带状态码。
pub type ProviderResult<T> = Result<T, SecurityStatus>;
