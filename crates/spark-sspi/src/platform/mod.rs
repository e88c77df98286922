//! 平台安全提供者适配层。
//!
//! 每个目标平台一个 [`SecurityProvider`] 实现；握手引擎只依赖能力接口，与平台无关。
//! 目前只有 Windows SSPI 适配器，其他平台返回 `None`，由宿主注入自己的提供者。

use std::sync::Arc;

use crate::provider::SecurityProvider;

#[cfg(windows)]
pub mod windows;

/// 当前平台的原生提供者。
pub fn native_provider() -> Option<Arc<dyn SecurityProvider>> {
    #[cfg(windows)]
    {
        Some(Arc::new(windows::WindowsSspi::new()))
    }
    #[cfg(not(windows))]
    {
        None
    }
}
