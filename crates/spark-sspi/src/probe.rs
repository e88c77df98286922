//! 最大令牌尺寸探测。
//!
//! # 契约（What）
//! - 枚举提供者已注册的安全包，选取 Kerberos 包报告的最大令牌尺寸；
//! - 进程生命周期内至多枚举一次，之后即使底层枚举结果改变也返回缓存值；
//! - 枚举失败或找不到 Kerberos 包时回退并缓存回退值，失败只记录 `debug` 日志，从不向调用方暴露；
//! - 回退值默认为 [`DEFAULT_MAX_TOKEN_SIZE`]，宿主可在首次探测前通过
//!   [`set_fallback_max_token_size`] 调整一次。

use std::sync::OnceLock;

use thiserror::Error;

use crate::provider::SecurityProvider;
use crate::status::SecurityStatus;

/// 探测失败时使用的最大令牌尺寸。
pub const DEFAULT_MAX_TOKEN_SIZE: usize = 12_000;

/// 被探测的安全包名称（大小写不敏感）。
pub const KERBEROS_PACKAGE: &str = "Kerberos";

static PROCESS_PROBE: TokenSizeProbe = TokenSizeProbe::new();

/// 进程级最大令牌尺寸，首次调用时探测并缓存。
pub fn max_token_size(provider: &dyn SecurityProvider) -> usize {
    process_probe().max_token_size(provider)
}

/// 设置进程级探测的回退值，`0` 表示使用 [`DEFAULT_MAX_TOKEN_SIZE`]。
///
/// 只有首次探测之前的第一次设置生效；返回值表示本次设置是否生效。
pub fn set_fallback_max_token_size(size: usize) -> bool {
    process_probe().set_fallback(size)
}

pub(crate) fn process_probe() -> &'static TokenSizeProbe {
    &PROCESS_PROBE
}

/// 记忆化的最大令牌尺寸探测器。
#[derive(Debug)]
pub(crate) struct TokenSizeProbe {
    fallback: OnceLock<usize>,
    value: OnceLock<usize>,
}

impl TokenSizeProbe {
    pub(crate) const fn new() -> Self {
        Self {
            fallback: OnceLock::new(),
            value: OnceLock::new(),
        }
    }

    fn set_fallback(&self, size: usize) -> bool {
        if self.value.get().is_some() {
            return false;
        }
        let size = if size == 0 { DEFAULT_MAX_TOKEN_SIZE } else { size };
        self.fallback.set(size).is_ok()
    }

    fn fallback(&self) -> usize {
        self.fallback
            .get()
            .copied()
            .unwrap_or(DEFAULT_MAX_TOKEN_SIZE)
    }

    /// 返回缓存值；尚未探测时先探测。
    pub(crate) fn max_token_size(&self, provider: &dyn SecurityProvider) -> usize {
        *self.value.get_or_init(|| match probe(provider) {
            Ok(size) => {
                tracing::debug!(max_token_size = size, "probed kerberos max token size");
                size
            }
            Err(failure) => {
                let fallback = self.fallback();
                tracing::debug!(
                    error = %failure,
                    fallback,
                    "max token size probe failed, using fallback"
                );
                fallback
            }
        })
    }
}

#[derive(Debug, Error)]
enum ProbeFailure {
    #[error("package enumeration failed: {0}")]
    Enumeration(SecurityStatus),
    #[error("package `Kerberos` is not registered")]
    PackageMissing,
    #[error("package `Kerberos` reports a zero max token size")]
    ZeroSize,
}

fn probe(provider: &dyn SecurityProvider) -> Result<usize, ProbeFailure> {
    let packages = provider
        .enumerate_packages()
        .map_err(ProbeFailure::Enumeration)?;
    let package = packages
        .iter()
        .find(|package| package.name.eq_ignore_ascii_case(KERBEROS_PACKAGE))
        .ok_or(ProbeFailure::PackageMissing)?;
    match package.max_token_size {
        0 => Err(ProbeFailure::ZeroSize),
        size => Ok(size),
    }
}
