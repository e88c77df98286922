//! 已获取的安全凭证。
//!
//! # 教案式说明
//! - **意图 (Why)**：凭证句柄可被多个顺序创建的上下文复用（例如断线后的重新认证），必须比依赖它的
//!   每个上下文活得更久，且原生句柄只能被释放一次；
//! - **契约 (What)**：
//!   - [`Credential`] 的 `Clone` 即增加引用，`Drop` 即释放引用，原生句柄在最后一个持有者消失时释放；
//!   - 上下文以 `&Credential` 非拥有地借用凭证，仅在一次原生调用的窗口内通过 [`CredentialLease`]
//!     贡献一次引用计数；
//!   - 句柄本身从不对外暴露释放入口，重复释放与释放后使用在类型层面不可表达。
//! - **执行逻辑 (How)**：内部状态放在 [`Arc`] 中，最后一次 `Drop` 时调用提供者的释放原语；
//!   释放失败只记录 `warn` 日志。

use core::fmt;
use std::sync::Arc;

use crate::error::{Result, SspiError};
use crate::lease::{LeaseLedger, LeaseStats};
use crate::provider::{AuthIdentity, CredentialHandle, SecurityProvider};

/// 协商身份的引用计数凭证。
#[derive(Clone)]
pub struct Credential {
    inner: Arc<CredentialInner>,
}

struct CredentialInner {
    provider: Arc<dyn SecurityProvider>,
    handle: CredentialHandle,
    package: String,
    principal: Option<String>,
    ledger: LeaseLedger,
}

impl Credential {
    /// 为 `package` 获取出站凭证。
    ///
    /// # 契约
    /// - `identity` 为 `None` 时使用进程的环境身份；
    /// - 提供者拒绝身份或安全包不存在时返回 [`SspiError::CredentialAcquisition`]，此时没有
    ///   [`Credential`] 值产生，也就无从据此构造上下文。
    pub fn acquire(
        provider: Arc<dyn SecurityProvider>,
        package: &str,
        identity: Option<&AuthIdentity>,
    ) -> Result<Self> {
        let handle = provider
            .acquire_credential(package, identity)
            .map_err(|status| {
                tracing::debug!(package, %status, "credential acquisition rejected");
                SspiError::credential(package, status)
            })?;
        let principal = identity.map(AuthIdentity::principal);
        if principal.is_none() {
            tracing::debug!(package, "acquired credential for the ambient identity");
        } else {
            tracing::debug!(package, principal = ?principal, "acquired credential");
        }
        Ok(Self {
            inner: Arc::new(CredentialInner {
                provider,
                handle,
                package: package.to_owned(),
                principal,
                ledger: LeaseLedger::new(),
            }),
        })
    }

    pub fn package(&self) -> &str {
        &self.inner.package
    }

    /// 显式身份的主体名；环境身份为 `None`。
    pub fn principal(&self) -> Option<&str> {
        self.inner.principal.as_deref()
    }

    /// 当前持有者数量（含进行中的调用窗口）。
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// 调用窗口租约的计数快照。
    pub fn lease_stats(&self) -> LeaseStats {
        self.inner.ledger.stats()
    }

    pub(crate) fn provider(&self) -> &Arc<dyn SecurityProvider> {
        &self.inner.provider
    }

    /// 为一次原生调用打开租约窗口。
    pub(crate) fn lease(&self) -> CredentialLease {
        self.inner.ledger.enter();
        CredentialLease {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("package", &self.inner.package)
            .field("principal", &self.inner.principal)
            .field("holders", &self.holders())
            .finish()
    }
}

/// 原生调用窗口内对凭证的一次引用。
///
/// 持有期间凭证的原生句柄保证存活；离开作用域即归还。
#[must_use = "租约一旦丢弃即归还，必须在原生调用期间保持存活"]
pub(crate) struct CredentialLease {
    inner: Arc<CredentialInner>,
}

impl CredentialLease {
    pub(crate) fn handle(&self) -> CredentialHandle {
        self.inner.handle
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        self.inner.ledger.exit();
    }
}

impl Drop for CredentialInner {
    fn drop(&mut self) {
        match self.provider.free_credential(self.handle) {
            Ok(()) => tracing::debug!(package = %self.package, "released credential"),
            Err(status) => tracing::warn!(
                package = %self.package,
                %status,
                "failed to free credential handle"
            ),
        }
    }
}
