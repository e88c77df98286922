//! 安全提供者能力接口。
//!
//! # 契约（What）
//! - [`SecurityProvider`] 抽象平台原生安全包（SSPI、GSSAPI 等）的全部原语：获取凭证、初始化上下文、
//!   查询尺寸、封装/解封消息、枚举安全包以及释放资源；
//! - 所有原语返回类型化的 [`ProviderResult`]，不抛出异常也不做分类，分类与错误映射由调用方
//!   （`credential`/`context` 模块）在边界处完成；
//! - 句柄是不透明的值类型，提供者不得假设调用方会在释放后继续持有它们；释放时机完全由
//!   [`crate::Credential`] 与 [`crate::SecurityContext`] 的所有权决定。
//!
//! # 实现责任
//! - 实现必须 `Send + Sync`，同一提供者实例可被多个连接顺序或并发地使用；
//! - 原语内部不得阻塞等待网络：令牌往返属于外部传输层。

use core::{fmt, ops::BitOr};

use serde::{Deserialize, Serialize};

use crate::buffer::SecurityBufferDesc;
use crate::status::{ProviderResult, SecurityStatus};

/// 原生句柄的两段式表示，对应 SSPI `SecHandle { dwLower, dwUpper }`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    pub lower: usize,
    pub upper: usize,
}

impl NativeHandle {
    pub const fn new(lower: usize, upper: usize) -> Self {
        Self { lower, upper }
    }
}

/// 已获取凭证的原生句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CredentialHandle(NativeHandle);

impl CredentialHandle {
    pub const fn new(handle: NativeHandle) -> Self {
        Self(handle)
    }

    pub const fn native(self) -> NativeHandle {
        self.0
    }
}

/// 安全上下文的原生句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextHandle(NativeHandle);

impl ContextHandle {
    pub const fn new(handle: NativeHandle) -> Self {
        Self(handle)
    }

    pub const fn native(self) -> NativeHandle {
        self.0
    }
}

/// 上下文请求/授予的属性位，位值与 SSPI `ISC_REQ_*`/`ISC_RET_*` 一致。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextRequirements(u32);

impl ContextRequirements {
    pub const NONE: Self = Self(0);
    pub const MUTUAL_AUTH: Self = Self(0x0000_0002);
    pub const REPLAY_DETECT: Self = Self(0x0000_0004);
    pub const SEQUENCE_DETECT: Self = Self(0x0000_0008);
    pub const CONFIDENTIALITY: Self = Self(0x0000_0010);
    pub const INTEGRITY: Self = Self(0x0001_0000);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ContextRequirements {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for ContextRequirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ContextRequirements, &str); 5] = [
            (ContextRequirements::MUTUAL_AUTH, "MUTUAL_AUTH"),
            (ContextRequirements::REPLAY_DETECT, "REPLAY_DETECT"),
            (ContextRequirements::SEQUENCE_DETECT, "SEQUENCE_DETECT"),
            (ContextRequirements::CONFIDENTIALITY, "CONFIDENTIALITY"),
            (ContextRequirements::INTEGRITY, "INTEGRITY"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// 消息保护级别。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageProtection {
    /// 加密并签名。
    #[default]
    Encrypt,
    /// 仅签名（Kerberos `KERB_WRAP_NO_ENCRYPT`）。
    IntegrityOnly,
}

impl MessageProtection {
    /// 对应原生 `fQOP` 参数。
    pub const fn qop(self) -> u32 {
        match self {
            Self::Encrypt => 0,
            Self::IntegrityOnly => 0x8000_0001,
        }
    }

    pub const fn from_qop(qop: u32) -> Self {
        if qop & 0x8000_0001 == 0x8000_0001 {
            Self::IntegrityOnly
        } else {
            Self::Encrypt
        }
    }
}

/// 提供者为已建立上下文报告的尺寸信息。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextSizes {
    pub max_token: usize,
    pub max_signature: usize,
    pub block_size: usize,
    pub security_trailer: usize,
}

/// 已注册安全包的描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub comment: String,
    pub capabilities: u32,
    pub version: u16,
    pub max_token_size: usize,
}

impl PackageInfo {
    pub fn new(name: impl Into<String>, max_token_size: usize) -> Self {
        Self {
            name: name.into(),
            comment: String::new(),
            capabilities: 0,
            version: 1,
            max_token_size,
        }
    }
}

/// 显式身份。缺省时使用进程的环境身份。
///
/// `Debug` 输出会隐去口令。
#[derive(Clone, PartialEq, Eq)]
pub struct AuthIdentity {
    user: String,
    domain: Option<String>,
    password: Option<String>,
}

impl AuthIdentity {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            domain: None,
            password: None,
        }
    }

    /// 解析 `user@REALM` 形式的主体名，在最后一个 `@` 处拆分用户与域。
    ///
    /// # 契约
    /// - 不含 `@` 时整体视为用户名；
    /// - `@` 之后为空时忽略域。
    pub fn from_principal(principal: &str, password: Option<String>) -> Self {
        let (user, domain) = match principal.rsplit_once('@') {
            Some((user, realm)) if !realm.is_empty() => (user, Some(realm.to_owned())),
            Some((user, _)) => (user, None),
            None => (principal, None),
        };
        Self {
            user: user.to_owned(),
            domain,
            password,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// 渲染为 `user@DOMAIN`（无域时仅用户名），用于日志与授权标识。
    pub fn principal(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}@{}", self.user, domain),
            None => self.user.clone(),
        }
    }
}

impl fmt::Debug for AuthIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthIdentity")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// 一次上下文初始化调用的参数块。
#[derive(Debug)]
pub struct InitializeRequest<'a> {
    pub credential: CredentialHandle,
    /// 首轮为 `None`，之后为上一轮返回的句柄。
    pub context: Option<ContextHandle>,
    pub target_name: &'a str,
    pub requirements: ContextRequirements,
    /// 对端令牌；首轮没有输入时为 `None`。
    pub input: Option<&'a mut SecurityBufferDesc>,
    /// 预分配的输出令牌缓冲，提供者按实际长度截断。
    pub output: &'a mut SecurityBufferDesc,
}

/// 上下文初始化的成功结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitializeOutcome {
    pub context: ContextHandle,
    /// 非负状态：`OK`、`CONTINUE_NEEDED` 或需要补全令牌的信息码。
    pub status: SecurityStatus,
    pub granted: ContextRequirements,
}

/// 平台安全提供者的能力接口。
pub trait SecurityProvider: Send + Sync {
    /// 为指定安全包获取出站凭证；`identity` 为 `None` 时使用环境身份。
    fn acquire_credential(
        &self,
        package: &str,
        identity: Option<&AuthIdentity>,
    ) -> ProviderResult<CredentialHandle>;

    /// 推进一轮上下文建立。
    fn initialize_context(&self, request: InitializeRequest<'_>) -> ProviderResult<InitializeOutcome>;

    /// 补全输出令牌（`COMPLETE_NEEDED` 系列状态）。默认不支持。
    fn complete_auth_token(
        &self,
        context: ContextHandle,
        token: &mut SecurityBufferDesc,
    ) -> ProviderResult<()> {
        let _ = (context, token);
        Err(SecurityStatus::UNSUPPORTED_FUNCTION)
    }

    /// 查询已建立上下文的块大小与尾部签名长度。
    fn query_sizes(&self, context: ContextHandle) -> ProviderResult<ContextSizes>;

    /// 原地封装消息：`Token`（尾部签名）、`Data`（明文 → 密文）、`Padding`。
    fn wrap(
        &self,
        context: ContextHandle,
        protection: MessageProtection,
        message: &mut SecurityBufferDesc,
    ) -> ProviderResult<()>;

    /// 原地解封消息：`Data` + `Stream`，返回对端使用的保护级别。
    fn unwrap(
        &self,
        context: ContextHandle,
        message: &mut SecurityBufferDesc,
    ) -> ProviderResult<MessageProtection>;

    /// 枚举已注册的安全包。
    fn enumerate_packages(&self) -> ProviderResult<Vec<PackageInfo>>;

    fn free_context(&self, context: ContextHandle) -> ProviderResult<()>;

    fn free_credential(&self, credential: CredentialHandle) -> ProviderResult<()>;
}
