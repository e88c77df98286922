#![doc = r#"
# spark-sspi

## 设计动机（Why）
- **认证入口**：数据库协议客户端需要借助平台原生安全提供者（Kerberos 等）与服务端完成双向认证，
  握手成功后还可能要求对协议报文加密；
- **资源安全**：原生凭证与上下文句柄必须在所有退出路径上对称地占用与归还，且只释放一次；
- **平台无关**：握手引擎只面向 [`SecurityProvider`] 能力接口编写，平台差异集中在 [`platform`]。

## 核心契约（What）
- [`Credential`]：引用计数的出站凭证，`Clone` 即增加引用，最后一个持有者离开时释放原生句柄；
- [`SecurityContext`]：握手状态机 `Uninitialized → Negotiating → {Established | Failed}`，建立后提供
  [`SecurityContext::encrypt_message`] 与 [`SecurityContext::decrypt_message`]；
- [`max_token_size`]：进程级记忆化的最大令牌尺寸，探测失败时回退到 12000；
- [`GssapiMechanism`]：RFC 4752 GSSAPI SASL 客户端机制，驱动上下文完成整个 SASL 会话；
- 错误统一为 [`SspiError`]，每个变体带稳定错误码。

## 实现策略（How）
- 提供者原语返回类型化的 [`SecurityStatus`]，只在 `credential`/`context` 边界翻译为 [`SspiError`]；
- 手工 AddRef/Release 由作用域租约替代：每次原生调用前打开租约，`Drop` 时归还；
- 每次调用构造并丢弃自己的 [`SecurityBufferDesc`]，需要跨 FFI 时编组为 `SecBufferDesc` 布局。

## 风险与考量（Trade-offs）
- 引擎不做任何自动重试，是否换用其他机制由调用方决定；
- 同一上下文只支持单任务顺序使用；
- 不自行实现任何密码学原语，全部委托给提供者。
"#]

pub mod buffer;
pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod lease;
pub mod platform;
pub mod probe;
pub mod provider;
pub mod sasl;
pub mod status;

pub use buffer::{BufferError, SecurityBuffer, SecurityBufferDesc, SecurityBufferType};
pub use config::{ContextOptions, ServicePrincipal, SspiConfig};
pub use context::{ContextState, SecurityContext};
pub use credential::Credential;
pub use error::{Result, SspiError};
pub use lease::{LeaseLedger, LeaseStats};
pub use probe::{DEFAULT_MAX_TOKEN_SIZE, max_token_size, set_fallback_max_token_size};
pub use provider::{
    AuthIdentity, ContextHandle, ContextRequirements, ContextSizes, CredentialHandle,
    InitializeOutcome, InitializeRequest, MessageProtection, NativeHandle, PackageInfo,
    SecurityProvider,
};
pub use sasl::{GssapiMechanism, SaslReply, SaslStep, SaslTransport};
pub use status::{ProviderResult, SecurityStatus, StatusClass};
