//! 集成测试共用的回环提供者与模拟服务端。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：在任何平台上复现原生安全提供者的可观察行为，使握手状态机、租约对称性与消息保护
//!   都能在不依赖 KDC 的情况下验证。
//! - **结构说明 (How)**：
//!   - `LoopbackProvider`：实现 `SecurityProvider`，按调用点计数，支持状态注入与 panic 注入，并跟踪
//!     存活/已释放的句柄，重复释放或在上下文存活时释放凭证都会被记录为违规；
//!   - `FakeServer`：握手对端，生成服务端令牌并使用与提供者相同的会话密钥封装/解封消息；
//!   - 消息格式：`trailer(16) || body || pad`，trailer 首字节为保护级别，其余为
//!     `sha256(key || flag || "mac" || body || pad)` 的前 15 字节；加密模式下 body 与 sha256 派生的密钥流异或。
//! - **合同与边界 (What)**：该模块只服务测试，不追求密码学强度，只保证任意单字节篡改都能被检出。

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use sha2::{Digest, Sha256};
use spark_sspi::{
    AuthIdentity, ContextHandle, ContextOptions, ContextRequirements, ContextSizes, Credential,
    CredentialHandle, InitializeOutcome, InitializeRequest, MessageProtection, NativeHandle,
    PackageInfo, ProviderResult, SecurityBufferDesc, SecurityBufferType, SecurityContext,
    SecurityProvider, SecurityStatus,
};

pub const TARGET: &str = "mongodb/db.example.com";
pub const PACKAGE: &str = "Kerberos";
pub const TRAILER: usize = 16;
pub const BLOCK: usize = 8;

const CLIENT_MAGIC: &[u8] = b"FAKE-KRB";
const SERVER_MAGIC: &[u8] = b"FAKE-SRV";
const CREDENTIAL_TAG: usize = 0xC7ED;
const CONTEXT_TAG: usize = 0xC07E;

/// 提供者调用点。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallSite {
    AcquireCredential,
    InitializeContext,
    CompleteAuthToken,
    QuerySizes,
    Wrap,
    Unwrap,
    EnumeratePackages,
    FreeContext,
    FreeCredential,
}

impl CallSite {
    /// 握手与消息保护路径上会被注入故障的调用点。
    pub const NATIVE_CALLS: [CallSite; 5] = [
        CallSite::InitializeContext,
        CallSite::CompleteAuthToken,
        CallSite::QuerySizes,
        CallSite::Wrap,
        CallSite::Unwrap,
    ];
}

#[derive(Clone, Copy, Debug)]
enum Injection {
    Status(SecurityStatus),
    Panic,
}

#[derive(Debug)]
struct FakeContext {
    credential: usize,
    target: String,
    leg: usize,
}

#[derive(Debug)]
struct FakeState {
    calls: HashMap<CallSite, usize>,
    injections: HashMap<CallSite, Injection>,
    next_id: usize,
    credentials: HashSet<usize>,
    contexts: HashMap<usize, FakeContext>,
    freed_contexts: Vec<usize>,
    freed_credentials: Vec<usize>,
    violations: Vec<String>,
    legs: usize,
    packages: Vec<PackageInfo>,
    sizes: ContextSizes,
    grant_mutual: bool,
    complete_needed: bool,
    requested: Vec<ContextRequirements>,
    trailer_overrun: usize,
}

/// 可观测、可注入故障的回环提供者。
#[derive(Debug)]
pub struct LoopbackProvider {
    state: Mutex<FakeState>,
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                calls: HashMap::new(),
                injections: HashMap::new(),
                next_id: 1,
                credentials: HashSet::new(),
                contexts: HashMap::new(),
                freed_contexts: Vec::new(),
                freed_credentials: Vec::new(),
                violations: Vec::new(),
                legs: 2,
                packages: vec![
                    PackageInfo::new("Negotiate", 48_256),
                    PackageInfo::new(PACKAGE, 48_000),
                    PackageInfo::new("NTLM", 2_888),
                ],
                sizes: ContextSizes {
                    max_token: 12_000,
                    max_signature: TRAILER,
                    block_size: BLOCK,
                    security_trailer: TRAILER,
                },
                grant_mutual: true,
                complete_needed: false,
                requested: Vec::new(),
                trailer_overrun: 0,
            }),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// 握手需要的客户端调用次数（至少 1）。
    pub fn set_legs(&self, legs: usize) {
        self.state.lock().legs = legs.max(1);
    }

    pub fn set_packages(&self, packages: Vec<PackageInfo>) {
        self.state.lock().packages = packages;
    }

    pub fn set_grant_mutual(&self, grant: bool) {
        self.state.lock().grant_mutual = grant;
    }

    /// 最后一轮返回 `COMPLETE_NEEDED`，要求补全令牌。
    pub fn set_complete_needed(&self, complete_needed: bool) {
        self.state.lock().complete_needed = complete_needed;
    }

    /// 封装时让尾部签名比分配长度多写 `extra` 字节。
    pub fn set_trailer_overrun(&self, extra: usize) {
        self.state.lock().trailer_overrun = extra;
    }

    /// 每次 `initialize_context` 请求的属性，按调用顺序。
    pub fn requested(&self) -> Vec<ContextRequirements> {
        self.state.lock().requested.clone()
    }

    pub fn inject(&self, site: CallSite, status: SecurityStatus) {
        self.state.lock().injections.insert(site, Injection::Status(status));
    }

    pub fn inject_panic(&self, site: CallSite) {
        self.state.lock().injections.insert(site, Injection::Panic);
    }

    pub fn clear_injections(&self) {
        self.state.lock().injections.clear();
    }

    pub fn calls(&self, site: CallSite) -> usize {
        self.state.lock().calls.get(&site).copied().unwrap_or(0)
    }

    pub fn live_credentials(&self) -> usize {
        self.state.lock().credentials.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn freed_contexts(&self) -> Vec<usize> {
        self.state.lock().freed_contexts.clone()
    }

    pub fn freed_credentials(&self) -> Vec<usize> {
        self.state.lock().freed_credentials.clone()
    }

    /// 重复释放、释放顺序错误等违规记录。
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    fn enter(&self, site: CallSite) -> ProviderResult<MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock();
        *state.calls.entry(site).or_insert(0) += 1;
        match state.injections.get(&site).copied() {
            None => Ok(state),
            Some(Injection::Status(status)) => Err(status),
            Some(Injection::Panic) => {
                drop(state);
                panic!("injected provider panic at {site:?}");
            }
        }
    }
}

fn established(state: &FakeState, context: ContextHandle) -> ProviderResult<&FakeContext> {
    let native = context.native();
    match state.contexts.get(&native.lower) {
        Some(ctx) if native.upper == CONTEXT_TAG && ctx.leg >= state.legs => Ok(ctx),
        _ => Err(SecurityStatus::INVALID_HANDLE),
    }
}

impl SecurityProvider for LoopbackProvider {
    fn acquire_credential(
        &self,
        package: &str,
        identity: Option<&AuthIdentity>,
    ) -> ProviderResult<CredentialHandle> {
        let mut state = self.enter(CallSite::AcquireCredential)?;
        if !state
            .packages
            .iter()
            .any(|info| info.name.eq_ignore_ascii_case(package))
        {
            return Err(SecurityStatus::PACKAGE_NOT_FOUND);
        }
        if identity.and_then(AuthIdentity::password) == Some("wrong") {
            return Err(SecurityStatus::LOGON_DENIED);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.credentials.insert(id);
        Ok(CredentialHandle::new(NativeHandle::new(id, CREDENTIAL_TAG)))
    }

    fn initialize_context(&self, request: InitializeRequest<'_>) -> ProviderResult<InitializeOutcome> {
        let mut state = self.enter(CallSite::InitializeContext)?;
        state.requested.push(request.requirements);
        let credential = request.credential.native();
        if credential.upper != CREDENTIAL_TAG || !state.credentials.contains(&credential.lower) {
            return Err(SecurityStatus::INVALID_HANDLE);
        }
        let input = request
            .input
            .as_deref()
            .and_then(|desc| desc.find(SecurityBufferType::Token))
            .map(|token| token.as_slice().to_vec())
            .unwrap_or_default();

        let (id, leg) = match request.context {
            None => {
                if !input.is_empty() {
                    return Err(SecurityStatus::INVALID_TOKEN);
                }
                (None, 0)
            }
            Some(context) => {
                let native = context.native();
                let ctx = state
                    .contexts
                    .get(&native.lower)
                    .filter(|_| native.upper == CONTEXT_TAG)
                    .ok_or(SecurityStatus::INVALID_HANDLE)?;
                if ctx.leg >= state.legs || ctx.target != request.target_name {
                    return Err(SecurityStatus::OUT_OF_SEQUENCE);
                }
                if input != server_token(ctx.leg, &ctx.target) {
                    return Err(SecurityStatus::INVALID_TOKEN);
                }
                (Some(native.lower), ctx.leg)
            }
        };

        let leg = leg + 1;
        let last = leg == state.legs;
        let token = if last {
            Vec::new()
        } else {
            client_token(leg, request.target_name)
        };
        let output = request
            .output
            .find_mut(SecurityBufferType::Token)
            .ok_or(SecurityStatus::INVALID_TOKEN)?;
        if token.len() > output.len() {
            return Err(SecurityStatus::BUFFER_TOO_SMALL);
        }
        let bytes = output.bytes_mut();
        bytes.clear();
        bytes.extend_from_slice(&token);

        let id = match id {
            Some(id) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };
        state.contexts.insert(
            id,
            FakeContext {
                credential: credential.lower,
                target: request.target_name.to_owned(),
                leg,
            },
        );

        let mut granted = request.requirements;
        if !state.grant_mutual {
            granted = ContextRequirements::from_bits(
                granted.bits() & !ContextRequirements::MUTUAL_AUTH.bits(),
            );
        }
        let status = match (last, state.complete_needed) {
            (false, _) => SecurityStatus::CONTINUE_NEEDED,
            (true, false) => SecurityStatus::OK,
            (true, true) => SecurityStatus::COMPLETE_NEEDED,
        };
        Ok(InitializeOutcome {
            context: ContextHandle::new(NativeHandle::new(id, CONTEXT_TAG)),
            status,
            granted,
        })
    }

    fn complete_auth_token(
        &self,
        context: ContextHandle,
        _token: &mut SecurityBufferDesc,
    ) -> ProviderResult<()> {
        let state = self.enter(CallSite::CompleteAuthToken)?;
        established(&state, context).map(drop)
    }

    fn query_sizes(&self, context: ContextHandle) -> ProviderResult<ContextSizes> {
        let state = self.enter(CallSite::QuerySizes)?;
        established(&state, context)?;
        Ok(state.sizes)
    }

    fn wrap(
        &self,
        context: ContextHandle,
        protection: MessageProtection,
        message: &mut SecurityBufferDesc,
    ) -> ProviderResult<()> {
        let state = self.enter(CallSite::Wrap)?;
        let key = session_key(&established(&state, context)?.target);
        let kinds: Vec<_> = message.buffers().iter().map(|buffer| buffer.kind()).collect();
        if kinds
            != [
                SecurityBufferType::Token,
                SecurityBufferType::Data,
                SecurityBufferType::Padding,
            ]
        {
            return Err(SecurityStatus::INVALID_TOKEN);
        }
        let buffers = message.buffers_mut();
        if buffers[0].len() < TRAILER || buffers[2].len() < BLOCK {
            return Err(SecurityStatus::BUFFER_TOO_SMALL);
        }
        let (mut trailer, body, pad) = seal(&key, protection, buffers[1].as_slice());
        trailer.resize(TRAILER + state.trailer_overrun, 0);
        *buffers[0].bytes_mut() = trailer;
        *buffers[1].bytes_mut() = body;
        *buffers[2].bytes_mut() = pad;
        Ok(())
    }

    fn unwrap(
        &self,
        context: ContextHandle,
        message: &mut SecurityBufferDesc,
    ) -> ProviderResult<MessageProtection> {
        let state = self.enter(CallSite::Unwrap)?;
        let key = session_key(&established(&state, context)?.target);
        let kinds: Vec<_> = message.buffers().iter().map(|buffer| buffer.kind()).collect();
        if kinds != [SecurityBufferType::Data, SecurityBufferType::Stream] {
            return Err(SecurityStatus::INVALID_TOKEN);
        }
        let mut wire = message.buffers()[0].as_slice().to_vec();
        wire.extend_from_slice(message.buffers()[1].as_slice());
        let (protection, plaintext) = open(&key, &wire)?;
        *message.buffers_mut()[0].bytes_mut() = plaintext;
        Ok(protection)
    }

    fn enumerate_packages(&self) -> ProviderResult<Vec<PackageInfo>> {
        let state = self.enter(CallSite::EnumeratePackages)?;
        Ok(state.packages.clone())
    }

    fn free_context(&self, context: ContextHandle) -> ProviderResult<()> {
        let mut state = self.enter(CallSite::FreeContext)?;
        let native = context.native();
        match state.contexts.remove(&native.lower) {
            Some(_) if native.upper == CONTEXT_TAG => {
                state.freed_contexts.push(native.lower);
                Ok(())
            }
            _ => {
                state
                    .violations
                    .push(format!("context {} freed while not live", native.lower));
                Err(SecurityStatus::INVALID_HANDLE)
            }
        }
    }

    fn free_credential(&self, credential: CredentialHandle) -> ProviderResult<()> {
        let mut state = self.enter(CallSite::FreeCredential)?;
        let native = credential.native();
        if state
            .contexts
            .values()
            .any(|ctx| ctx.credential == native.lower)
        {
            state.violations.push(format!(
                "credential {} freed while a context still depends on it",
                native.lower
            ));
        }
        if native.upper == CREDENTIAL_TAG && state.credentials.remove(&native.lower) {
            state.freed_credentials.push(native.lower);
            Ok(())
        } else {
            state
                .violations
                .push(format!("credential {} freed while not live", native.lower));
            Err(SecurityStatus::INVALID_HANDLE)
        }
    }
}

/// 握手与消息保护的对端。
#[derive(Clone, Debug)]
pub struct FakeServer {
    target: String,
}

impl FakeServer {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// 对客户端令牌给出服务端回复。
    pub fn reply(&self, client: &[u8]) -> Vec<u8> {
        let leg = parse_client_token(client, &self.target)
            .unwrap_or_else(|| panic!("unexpected client token ({} bytes)", client.len()));
        server_token(leg, &self.target)
    }

    pub fn wrap(&self, protection: MessageProtection, plaintext: &[u8]) -> Vec<u8> {
        let (mut trailer, body, pad) = seal(&session_key(&self.target), protection, plaintext);
        trailer.extend_from_slice(&body);
        trailer.extend_from_slice(&pad);
        trailer
    }

    pub fn unwrap(&self, wire: &[u8]) -> ProviderResult<Vec<u8>> {
        open(&session_key(&self.target), wire).map(|(_, plaintext)| plaintext)
    }
}

pub fn is_client_token(bytes: &[u8]) -> bool {
    bytes.starts_with(CLIENT_MAGIC)
}

fn client_token(leg: usize, target: &str) -> Vec<u8> {
    token(CLIENT_MAGIC, leg, target)
}

fn server_token(leg: usize, target: &str) -> Vec<u8> {
    token(SERVER_MAGIC, leg, target)
}

fn token(magic: &[u8], leg: usize, target: &str) -> Vec<u8> {
    let mut token = magic.to_vec();
    token.push(u8::try_from(leg).unwrap_or(u8::MAX));
    token.extend_from_slice(target.as_bytes());
    token
}

fn parse_client_token(bytes: &[u8], target: &str) -> Option<usize> {
    let rest = bytes.strip_prefix(CLIENT_MAGIC)?;
    let (&leg, name) = rest.split_first()?;
    (name == target.as_bytes()).then_some(usize::from(leg))
}

fn session_key(target: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"loopback-session");
    hasher.update(target.as_bytes());
    hasher.finalize().into()
}

fn keystream_xor(key: &[u8; 32], bytes: &mut [u8]) {
    for (counter, chunk) in bytes.chunks_mut(32).enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(b"stream");
        hasher.update((counter as u64).to_le_bytes());
        let block = hasher.finalize();
        for (byte, mask) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= mask;
        }
    }
}

fn protection_flag(protection: MessageProtection) -> u8 {
    match protection {
        MessageProtection::Encrypt => 0xE1,
        MessageProtection::IntegrityOnly => 0x51,
    }
}

fn mac(key: &[u8; 32], flag: u8, body: &[u8], pad: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update([flag]);
    hasher.update(b"mac");
    hasher.update(body);
    hasher.update(pad);
    hasher.finalize()[..TRAILER - 1].to_vec()
}

fn seal(key: &[u8; 32], protection: MessageProtection, plaintext: &[u8]) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut body = plaintext.to_vec();
    if protection == MessageProtection::Encrypt {
        keystream_xor(key, &mut body);
    }
    let pad_len = BLOCK - plaintext.len() % BLOCK;
    let pad = vec![pad_len as u8; pad_len];
    let flag = protection_flag(protection);
    let mut trailer = vec![flag];
    trailer.extend_from_slice(&mac(key, flag, &body, &pad));
    (trailer, body, pad)
}

fn open(key: &[u8; 32], wire: &[u8]) -> ProviderResult<(MessageProtection, Vec<u8>)> {
    if wire.len() < TRAILER + 1 {
        return Err(SecurityStatus::INCOMPLETE_MESSAGE);
    }
    let (trailer, rest) = wire.split_at(TRAILER);
    let pad_len = usize::from(rest[rest.len() - 1]);
    if pad_len == 0 || pad_len > BLOCK || pad_len > rest.len() {
        return Err(SecurityStatus::MESSAGE_ALTERED);
    }
    let (body, pad) = rest.split_at(rest.len() - pad_len);
    if pad.iter().any(|&byte| usize::from(byte) != pad_len) || body.len() % BLOCK + pad_len != BLOCK {
        return Err(SecurityStatus::MESSAGE_ALTERED);
    }
    let protection = match trailer[0] {
        0xE1 => MessageProtection::Encrypt,
        0x51 => MessageProtection::IntegrityOnly,
        _ => return Err(SecurityStatus::MESSAGE_ALTERED),
    };
    if trailer[1..] != mac(key, trailer[0], body, pad)[..] {
        return Err(SecurityStatus::MESSAGE_ALTERED);
    }
    let mut plaintext = body.to_vec();
    if protection == MessageProtection::Encrypt {
        keystream_xor(key, &mut plaintext);
    }
    Ok((protection, plaintext))
}

/// 获取回环凭证。
pub fn credential(provider: &Arc<LoopbackProvider>) -> Credential {
    Credential::acquire(Arc::clone(provider) as Arc<dyn SecurityProvider>, PACKAGE, None)
        .expect("loopback credential")
}

/// 与 [`FakeServer`] 完成整个握手。
pub fn establish<'c>(credential: &'c Credential, target: &str) -> SecurityContext<'c> {
    let server = FakeServer::new(target);
    let mut context = SecurityContext::new(credential, ContextOptions::default());
    let mut token = context.initialize(target, &[]).expect("first leg");
    while !context.is_established() {
        let reply = server.reply(&token);
        token = context.initialize(target, &reply).expect("next leg");
    }
    assert!(token.is_empty(), "final leg must not produce a token");
    context
}
