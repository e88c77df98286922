//! 安全上下文：握手状态机与消息保护。
//!
//! # 教案式说明
//! - **意图 (Why)**：驱动多轮令牌交换直到与对端建立双向认证的会话，之后为协议报文提供加解密；
//! - **契约 (What)**：
//!   - 状态只沿 `Uninitialized → Negotiating → {Established | Failed}` 前进，`Negotiating` 可以自环；
//!   - `Failed` 是终态，之后的任何调用都会失败且不会触达提供者；
//!   - 加解密只在 `Established` 下可用；
//!   - 每次原生调用都被凭证租约与上下文租约包围，租约在所有退出路径上归还；
//!   - 原生上下文句柄由本类型独占，在终态失败或 `Drop` 时释放且只释放一次，释放失败只记录日志。
//! - **执行逻辑 (How)**：每次调用构造自己的 [`SecurityBufferDesc`]，调用结束即丢弃；尺寸信息在首次
//!   加密/解密时查询并按上下文缓存。
//! - **并发 (Trade-offs)**：上下文由拥有连接的单个任务顺序使用，所有操作取 `&mut self`，
//!   不支持同一上下文上的并发调用。

use core::fmt;
use std::sync::Arc;

use crate::buffer::{SecurityBuffer, SecurityBufferDesc, SecurityBufferType};
use crate::config::ContextOptions;
use crate::credential::Credential;
use crate::error::{Result, SspiError};
use crate::lease::{LeaseLedger, LeaseStats};
use crate::probe::process_probe;
use crate::provider::{
    ContextHandle, ContextRequirements, ContextSizes, InitializeRequest, SecurityProvider,
};
use crate::status::{ProviderResult, SecurityStatus, StatusClass};

/// 握手状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextState {
    Uninitialized,
    Negotiating,
    Established,
    Failed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Negotiating => "negotiating",
            Self::Established => "established",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 一次握手尝试的安全上下文。
///
/// 上下文非拥有地借用创建它的 [`Credential`]，借用检查保证凭证比上下文活得更久。
pub struct SecurityContext<'c> {
    credential: &'c Credential,
    options: ContextOptions,
    handle: Option<ContextHandle>,
    state: ContextState,
    granted: ContextRequirements,
    sizes: Option<ContextSizes>,
    ledger: LeaseLedger,
}

impl<'c> SecurityContext<'c> {
    /// 创建上下文；输出令牌按进程级最大令牌尺寸分配。
    pub fn new(credential: &'c Credential, options: ContextOptions) -> Self {
        Self {
            credential,
            options,
            handle: None,
            state: ContextState::Uninitialized,
            granted: ContextRequirements::NONE,
            sizes: None,
            ledger: LeaseLedger::new(),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ContextState::Established
    }

    /// 提供者最近一次报告的已授予属性。
    pub fn granted(&self) -> ContextRequirements {
        self.granted
    }

    pub fn options(&self) -> ContextOptions {
        self.options
    }

    pub fn credential(&self) -> &'c Credential {
        self.credential
    }

    /// 已缓存的尺寸信息；尚未加解密过时为 `None`。
    pub fn cached_sizes(&self) -> Option<ContextSizes> {
        self.sizes
    }

    /// 上下文租约的计数快照。
    pub fn lease_stats(&self) -> LeaseStats {
        self.ledger.stats()
    }

    /// 推进一轮握手。
    ///
    /// # 契约
    /// - `input` 为对端发来的令牌，全新握手的首轮传空切片；
    /// - 返回需要原样发给对端的令牌，握手的最后一轮可能为空；
    /// - 提供者报告失败时上下文转为 `Failed` 并立即释放原生句柄，返回
    ///   [`SspiError::AuthenticationHandshake`]；
    /// - 无论 `options` 如何，请求中总是包含 [`ContextRequirements::MUTUAL_AUTH`]，
    ///   提供者在建立时未授予双向认证同样视为握手失败；
    /// - 提供者写回的令牌超过分配长度时上下文转为 `Failed`，返回 [`SspiError::Buffer`]；
    /// - 对已建立的上下文调用会返回错误，状态保持 `Established`。
    pub fn initialize(&mut self, target: &str, input: &[u8]) -> Result<Vec<u8>> {
        match self.state {
            ContextState::Failed => {
                return Err(SspiError::handshake_rejected(
                    "security context has failed and cannot be reused",
                ));
            }
            ContextState::Established => {
                return Err(SspiError::handshake_rejected(
                    "security context is already established",
                ));
            }
            ContextState::Uninitialized | ContextState::Negotiating => {}
        }

        let credential = self.credential;
        let provider = credential.provider();
        let max_token = process_probe().max_token_size(provider.as_ref());
        let mut output =
            SecurityBufferDesc::single(SecurityBuffer::zeroed(SecurityBufferType::Token, max_token));
        let limits = output.limits();
        let mut input = (!input.is_empty())
            .then(|| SecurityBufferDesc::single(SecurityBuffer::token(input)));
        let requirements = self.options.requirements | ContextRequirements::MUTUAL_AUTH;

        let result = {
            let credential_lease = credential.lease();
            let _context_lease = self.ledger.lease();
            provider.initialize_context(InitializeRequest {
                credential: credential_lease.handle(),
                context: self.handle,
                target_name: target,
                requirements,
                input: input.as_mut(),
                output: &mut output,
            })
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(status) => return Err(self.fail(SspiError::handshake(status))),
        };
        self.handle = Some(outcome.context);
        self.granted = outcome.granted;
        if let Err(violation) = output.check_limits(&limits) {
            return Err(self.fail(violation.into()));
        }

        let next = match outcome.status.class() {
            StatusClass::Complete => ContextState::Established,
            StatusClass::ContinueNeeded => ContextState::Negotiating,
            class @ (StatusClass::CompleteNeeded | StatusClass::CompleteAndContinue) => {
                let completed = {
                    let _credential_lease = credential.lease();
                    let _context_lease = self.ledger.lease();
                    provider.complete_auth_token(outcome.context, &mut output)
                };
                if let Err(status) = completed {
                    return Err(self.fail(SspiError::handshake(status)));
                }
                if class == StatusClass::CompleteNeeded {
                    ContextState::Established
                } else {
                    ContextState::Negotiating
                }
            }
            StatusClass::Failure => return Err(self.fail(SspiError::handshake(outcome.status))),
        };

        if next == ContextState::Established
            && !self.granted.contains(ContextRequirements::MUTUAL_AUTH)
        {
            return Err(self.fail(SspiError::handshake_rejected(
                "mutual authentication was requested but not granted",
            )));
        }

        self.transition(next, outcome.status);
        Ok(output
            .find(SecurityBufferType::Token)
            .map(|token| token.as_slice().to_vec())
            .unwrap_or_default())
    }

    /// 加密一条协议报文。
    ///
    /// # 契约
    /// - 仅在 `Established` 下可用，否则返回 [`SspiError::Encryption`] 且不调用提供者；
    /// - 结果为 `尾部签名 || 密文 || 填充`，各段长度由提供者写回；
    /// - 任一段超过调用前分配的长度时返回 [`SspiError::Buffer`]，上下文状态不变。
    pub fn encrypt_message(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let handle = self
            .established_handle()
            .ok_or_else(|| SspiError::encryption_rejected("security context is not established"))?;
        let sizes = self.sizes(handle).map_err(SspiError::encryption)?;

        let mut message = SecurityBufferDesc::new(vec![
            SecurityBuffer::zeroed(SecurityBufferType::Token, sizes.security_trailer),
            SecurityBuffer::data(plaintext),
            SecurityBuffer::zeroed(SecurityBufferType::Padding, sizes.block_size),
        ]);
        let limits = message.limits();
        let protection = self.options.protection;
        self.call(|provider| provider.wrap(handle, protection, &mut message))
            .map_err(SspiError::encryption)?;
        message.check_limits(&limits)?;
        Ok(message.concat_all())
    }

    /// 解密一条协议报文。
    ///
    /// # 契约
    /// - 仅在 `Established` 下可用；
    /// - 前 `message_length` 字节作为数据段，其余作为签名/流段；`message_length` 超过密文长度时直接拒绝；
    /// - 签名不匹配或提供者失败时返回 [`SspiError::Decryption`]，绝不返回部分明文。
    pub fn decrypt_message(&mut self, ciphertext: &[u8], message_length: usize) -> Result<Vec<u8>> {
        let handle = self
            .established_handle()
            .ok_or_else(|| SspiError::decryption_rejected("security context is not established"))?;
        if message_length > ciphertext.len() {
            return Err(SspiError::decryption_rejected(format!(
                "message length {message_length} exceeds ciphertext length {}",
                ciphertext.len()
            )));
        }

        let (data, stream) = ciphertext.split_at(message_length);
        let mut message = SecurityBufferDesc::new(vec![
            SecurityBuffer::data(data),
            SecurityBuffer::stream(stream),
        ]);
        let protection = self
            .call(|provider| provider.unwrap(handle, &mut message))
            .map_err(SspiError::decryption)?;
        tracing::trace!(?protection, "unwrapped message");
        Ok(message.to_byte_array())
    }

    fn established_handle(&self) -> Option<ContextHandle> {
        match self.state {
            ContextState::Established => self.handle,
            _ => None,
        }
    }

    fn sizes(&mut self, handle: ContextHandle) -> ProviderResult<ContextSizes> {
        if let Some(sizes) = self.sizes {
            return Ok(sizes);
        }
        let sizes = self.call(|provider| provider.query_sizes(handle))?;
        tracing::debug!(
            trailer = sizes.security_trailer,
            block = sizes.block_size,
            "queried context sizes"
        );
        self.sizes = Some(sizes);
        Ok(sizes)
    }

    /// 在双租约窗口内执行一次原生调用。
    fn call<T>(
        &self,
        native: impl FnOnce(&dyn SecurityProvider) -> ProviderResult<T>,
    ) -> ProviderResult<T> {
        let _credential_lease = self.credential.lease();
        let _context_lease = self.ledger.lease();
        native(self.credential.provider().as_ref())
    }

    fn transition(&mut self, next: ContextState, status: SecurityStatus) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, %status, "security context transition");
        }
        self.state = next;
    }

    fn fail(&mut self, error: SspiError) -> SspiError {
        tracing::debug!(
            from = %self.state,
            to = %ContextState::Failed,
            code = error.code(),
            error = %error,
            "security context transition"
        );
        self.state = ContextState::Failed;
        self.sizes = None;
        self.release();
        error
    }

    fn release(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let provider: &Arc<dyn SecurityProvider> = self.credential.provider();
        if let Err(status) = provider.free_context(handle) {
            tracing::warn!(%status, state = %self.state, "failed to free security context");
        }
    }
}

impl fmt::Debug for SecurityContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("state", &self.state)
            .field("package", &self.credential.package())
            .field("granted", &self.granted)
            .finish()
    }
}

impl Drop for SecurityContext<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
