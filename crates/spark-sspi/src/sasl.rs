//! GSSAPI SASL 客户端机制（RFC 4752）。
//!
//! # 教案式说明
//! - **意图 (Why)**：数据库协议以 SASL 会话承载 Kerberos 握手，本模块把 [`SecurityContext`] 的令牌交换
//!   映射为 SASL 的 `start`/`step` 往返，并完成握手之后的安全层协商；
//! - **契约 (What)**：
//!   - 握手阶段每轮服务端载荷都直接喂给 [`SecurityContext::initialize`]；
//!   - 上下文建立后，服务端发来经封装的 4 字节安全层提议，必须提供“无安全层”位（`0x01`）；
//!     客户端回复封装后的 `[0x01, 0, 0, 0] || authzid`；
//!   - 机制不做任何重试，失败直接向调用方传播。
//! - **执行逻辑 (How)**：[`GssapiMechanism::authenticate`] 通过 [`SaslTransport`] 驱动完整会话，
//!   往返轮数受 `max_rounds` 约束，防止对端无限续轮。

use std::error::Error as StdError;

use crate::context::SecurityContext;
use crate::error::{Result, SspiError};

/// SASL 机制名。
pub const MECHANISM: &str = "GSSAPI";

/// 安全层位：不使用安全层。
const LAYER_NONE: u8 = 0x01;

/// 默认的最大往返轮数。
pub const DEFAULT_MAX_ROUNDS: usize = 10;

/// 单步的客户端输出。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaslStep {
    /// 发送载荷并等待服务端下一条消息。
    Continue(Vec<u8>),
    /// 发送载荷后客户端侧已完成，只等服务端确认。
    Complete(Vec<u8>),
}

impl SaslStep {
    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Self::Continue(payload) | Self::Complete(payload) => payload,
        }
    }
}

/// 服务端的一条 SASL 回复。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaslReply {
    pub payload: Vec<u8>,
    /// 服务端宣告会话结束。
    pub done: bool,
}

/// 承载 SASL 往返的传输层，由宿主的连接实现。
pub trait SaslTransport {
    type Error: Into<Box<dyn StdError + Send + Sync>>;

    /// 发送客户端载荷并等待服务端回复。首次调用对应 `saslStart`，之后对应 `saslContinue`。
    fn exchange(
        &mut self,
        mechanism: &str,
        payload: &[u8],
    ) -> core::result::Result<SaslReply, Self::Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Fresh,
    Handshake,
    SecurityLayer,
    Done,
}

/// 基于安全上下文的 GSSAPI 客户端机制。
#[derive(Debug)]
pub struct GssapiMechanism<'c> {
    context: SecurityContext<'c>,
    target: String,
    authorization_id: Option<String>,
    max_rounds: usize,
    phase: Phase,
}

impl<'c> GssapiMechanism<'c> {
    /// `target` 为服务主体名，例如 `mongodb/db.example.com@EXAMPLE.COM`。
    pub fn new(context: SecurityContext<'c>, target: impl Into<String>) -> Self {
        Self {
            context,
            target: target.into(),
            authorization_id: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            phase: Phase::Fresh,
        }
    }

    /// 以指定身份授权；缺省时由服务端使用认证身份。
    pub fn with_authorization_id(mut self, authorization_id: impl Into<String>) -> Self {
        self.authorization_id = Some(authorization_id.into());
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn context(&self) -> &SecurityContext<'c> {
        &self.context
    }

    pub fn into_context(self) -> SecurityContext<'c> {
        self.context
    }

    /// 客户端侧是否已经发出最终载荷。
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Done
    }

    /// 生成首条客户端载荷。
    pub fn start(&mut self) -> Result<Vec<u8>> {
        if self.phase != Phase::Fresh {
            return Err(SspiError::handshake_rejected("sasl conversation already started"));
        }
        let token = self.context.initialize(&self.target, &[])?;
        self.advance_handshake();
        Ok(token)
    }

    /// 处理一条服务端载荷，返回下一条客户端载荷。
    pub fn step(&mut self, server_payload: &[u8]) -> Result<SaslStep> {
        match self.phase {
            Phase::Fresh => Err(SspiError::handshake_rejected(
                "sasl conversation has not been started",
            )),
            Phase::Handshake => {
                let token = self.context.initialize(&self.target, server_payload)?;
                self.advance_handshake();
                Ok(SaslStep::Continue(token))
            }
            Phase::SecurityLayer => {
                let reply = self.negotiate_layer(server_payload)?;
                self.phase = Phase::Done;
                Ok(SaslStep::Complete(reply))
            }
            Phase::Done => Err(SspiError::handshake_rejected(
                "sasl conversation is already complete",
            )),
        }
    }

    /// 通过 `transport` 完成整个会话。
    ///
    /// # 契约
    /// - 服务端在客户端完成前宣告结束，或在客户端完成后仍要求继续，均视为握手失败；
    /// - 超过 `max_rounds` 轮仍未结束时返回握手失败；
    /// - 传输层错误包装为 [`SspiError::Transport`]。
    pub fn authenticate<T: SaslTransport>(&mut self, transport: &mut T) -> Result<()> {
        let mut outgoing = self.start()?;
        for round in 1..=self.max_rounds {
            let reply = transport
                .exchange(MECHANISM, &outgoing)
                .map_err(SspiError::transport)?;
            tracing::debug!(round, done = reply.done, "sasl round trip");

            if self.is_complete() {
                if reply.done {
                    tracing::debug!(rounds = round, target = %self.target, "sasl conversation complete");
                    return Ok(());
                }
                return Err(SspiError::handshake_rejected(
                    "server continued after the security layer was negotiated",
                ));
            }
            if reply.done {
                return Err(SspiError::handshake_rejected(
                    "server ended the conversation before the client completed",
                ));
            }
            outgoing = self.step(&reply.payload)?.into_payload();
        }
        Err(SspiError::handshake_rejected(format!(
            "sasl conversation exceeded {} round trips",
            self.max_rounds
        )))
    }

    fn advance_handshake(&mut self) {
        self.phase = if self.context.is_established() {
            Phase::SecurityLayer
        } else {
            Phase::Handshake
        };
    }

    fn negotiate_layer(&mut self, server_payload: &[u8]) -> Result<Vec<u8>> {
        let offer = self.context.decrypt_message(server_payload, 0)?;
        if offer.len() != 4 {
            return Err(SspiError::handshake_rejected(format!(
                "security layer offer must be 4 octets, got {}",
                offer.len()
            )));
        }
        if offer[0] & LAYER_NONE == 0 {
            return Err(SspiError::handshake_rejected(
                "server does not offer the no-security-layer option",
            ));
        }

        let mut reply = vec![LAYER_NONE, 0, 0, 0];
        if let Some(authorization_id) = &self.authorization_id {
            reply.extend_from_slice(authorization_id.as_bytes());
        }
        self.context.encrypt_message(&reply)
    }
}
