//! Windows SSPI（`secur32.dll`）适配器。
//!
//! # 教案式说明
//! - **契约 (What)**：
//!   - 以 [`SecurityBufferDesc::marshal`] 生成与 `SecBufferDesc` 同布局的参数块，调用返回后经
//!     [`crate::buffer::MarshalledDesc::finish`] 回写长度与重定向指针；
//!   - 负状态原样作为 [`SecurityStatus`] 返回，不在此处分类；
//!   - 从不请求 `ISC_REQ_ALLOCATE_MEMORY`，输出令牌总是写入调用方预分配的缓冲。
//! - **风险 (Trade-offs)**：编组阶段的违规（长度溢出、提供者越界写回）折算为
//!   `SEC_E_INTERNAL_ERROR` 并记录 `warn` 日志，细节不会继续向上传递。

use core::{ffi::c_void, ptr};

use crate::buffer::{BufferError, RawBufferDescriptor, SecurityBufferDesc};
use crate::provider::{
    AuthIdentity, ContextHandle, ContextRequirements, ContextSizes, CredentialHandle,
    InitializeOutcome, InitializeRequest, MessageProtection, NativeHandle, PackageInfo,
    SecurityProvider,
};
use crate::status::{ProviderResult, SecurityStatus};

const SECPKG_CRED_OUTBOUND: u32 = 0x2;
const SECURITY_NATIVE_DREP: u32 = 0x10;
const SECPKG_ATTR_SIZES: u32 = 0;
const SEC_WINNT_AUTH_IDENTITY_UNICODE: u32 = 0x2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct SecHandle {
    dw_lower: usize,
    dw_upper: usize,
}

impl From<NativeHandle> for SecHandle {
    fn from(handle: NativeHandle) -> Self {
        Self {
            dw_lower: handle.lower,
            dw_upper: handle.upper,
        }
    }
}

impl From<SecHandle> for NativeHandle {
    fn from(handle: SecHandle) -> Self {
        NativeHandle::new(handle.dw_lower, handle.dw_upper)
    }
}

#[repr(C)]
#[derive(Default)]
struct SecPkgContextSizes {
    cb_max_token: u32,
    cb_max_signature: u32,
    cb_block_size: u32,
    cb_security_trailer: u32,
}

#[repr(C)]
struct SecPkgInfoW {
    f_capabilities: u32,
    w_version: u16,
    w_rpcid: u16,
    cb_max_token: u32,
    name: *mut u16,
    comment: *mut u16,
}

#[repr(C)]
struct SecWinntAuthIdentityW {
    user: *mut u16,
    user_length: u32,
    domain: *mut u16,
    domain_length: u32,
    password: *mut u16,
    password_length: u32,
    flags: u32,
}

#[allow(non_snake_case)]
#[link(name = "secur32")]
unsafe extern "system" {
    fn AcquireCredentialsHandleW(
        pszPrincipal: *const u16,
        pszPackage: *const u16,
        fCredentialUse: u32,
        pvLogonId: *mut c_void,
        pAuthData: *mut c_void,
        pGetKeyFn: *mut c_void,
        pvGetKeyArgument: *mut c_void,
        phCredential: *mut SecHandle,
        ptsExpiry: *mut i64,
    ) -> i32;

    fn InitializeSecurityContextW(
        phCredential: *mut SecHandle,
        phContext: *mut SecHandle,
        pszTargetName: *const u16,
        fContextReq: u32,
        Reserved1: u32,
        TargetDataRep: u32,
        pInput: *mut RawBufferDescriptor,
        Reserved2: u32,
        phNewContext: *mut SecHandle,
        pOutput: *mut RawBufferDescriptor,
        pfContextAttr: *mut u32,
        ptsExpiry: *mut i64,
    ) -> i32;

    fn CompleteAuthToken(phContext: *mut SecHandle, pToken: *mut RawBufferDescriptor) -> i32;

    fn QueryContextAttributesW(
        phContext: *mut SecHandle,
        ulAttribute: u32,
        pBuffer: *mut c_void,
    ) -> i32;

    fn EncryptMessage(
        phContext: *mut SecHandle,
        fQOP: u32,
        pMessage: *mut RawBufferDescriptor,
        MessageSeqNo: u32,
    ) -> i32;

    fn DecryptMessage(
        phContext: *mut SecHandle,
        pMessage: *mut RawBufferDescriptor,
        MessageSeqNo: u32,
        pfQOP: *mut u32,
    ) -> i32;

    fn DeleteSecurityContext(phContext: *mut SecHandle) -> i32;

    fn FreeCredentialsHandle(phCredential: *mut SecHandle) -> i32;

    fn EnumerateSecurityPackagesW(pcPackages: *mut u32, ppPackageInfo: *mut *mut SecPkgInfoW)
    -> i32;

    fn FreeContextBuffer(pvContextBuffer: *mut c_void) -> i32;
}

/// `secur32.dll` 之上的 [`SecurityProvider`] 实现。
#[derive(Debug, Default)]
pub struct WindowsSspi {
    _private: (),
}

impl WindowsSspi {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check(status: i32) -> ProviderResult<SecurityStatus> {
    let status = SecurityStatus::from_raw(status);
    if status.is_success() {
        Ok(status)
    } else {
        Err(status)
    }
}

fn marshal_failed(error: BufferError) -> SecurityStatus {
    tracing::warn!(%error, "security buffer marshalling failed");
    SecurityStatus::INTERNAL_ERROR
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(Some(0)).collect()
}

fn wide_len(text: &[u16]) -> u32 {
    u32::try_from(text.len().saturating_sub(1)).unwrap_or(u32::MAX)
}

/// # Safety
/// `ptr` 为空或指向以 0 结尾的 UTF-16 串。
unsafe fn from_wide(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    // SAFETY: 调用方保证串以 0 结尾，遍历不会越过终止符。
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    // SAFETY: 前 `len` 个码元均已读取确认有效。
    String::from_utf16_lossy(unsafe { core::slice::from_raw_parts(ptr, len) })
}

impl SecurityProvider for WindowsSspi {
    fn acquire_credential(
        &self,
        package: &str,
        identity: Option<&AuthIdentity>,
    ) -> ProviderResult<CredentialHandle> {
        let package = wide(package);
        let mut user = identity.map(|id| wide(id.user())).unwrap_or_default();
        let mut domain = identity
            .and_then(AuthIdentity::domain)
            .map(wide)
            .unwrap_or_default();
        let mut password = identity
            .and_then(AuthIdentity::password)
            .map(wide)
            .unwrap_or_default();
        let mut auth = identity.map(|_| SecWinntAuthIdentityW {
            user: user.as_mut_ptr(),
            user_length: wide_len(&user),
            domain: if domain.is_empty() {
                ptr::null_mut()
            } else {
                domain.as_mut_ptr()
            },
            domain_length: wide_len(&domain),
            password: if password.is_empty() {
                ptr::null_mut()
            } else {
                password.as_mut_ptr()
            },
            password_length: wide_len(&password),
            flags: SEC_WINNT_AUTH_IDENTITY_UNICODE,
        });
        let auth_ptr = auth
            .as_mut()
            .map_or(ptr::null_mut(), |auth| ptr::from_mut(auth).cast::<c_void>());

        let mut handle = SecHandle::default();
        let mut expiry = 0i64;
        // SAFETY: 所有指针指向本帧内存活的缓冲，宽字符串均以 0 结尾。
        let status = unsafe {
            AcquireCredentialsHandleW(
                ptr::null(),
                package.as_ptr(),
                SECPKG_CRED_OUTBOUND,
                ptr::null_mut(),
                auth_ptr,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut handle,
                &mut expiry,
            )
        };
        password.fill(0);
        check(status)?;
        Ok(CredentialHandle::new(handle.into()))
    }

    fn initialize_context(&self, request: InitializeRequest<'_>) -> ProviderResult<InitializeOutcome> {
        let mut credential = SecHandle::from(request.credential.native());
        let mut existing = request.context.map(|context| SecHandle::from(context.native()));
        let mut new_context = existing.unwrap_or_default();
        let target = wide(request.target_name);

        let mut input = match request.input {
            Some(desc) => Some(desc.marshal().map_err(marshal_failed)?),
            None => None,
        };
        let mut output = request.output.marshal().map_err(marshal_failed)?;
        let input_ptr = input
            .as_mut()
            .map_or(ptr::null_mut(), |input| input.as_mut_ptr());
        let context_ptr = existing
            .as_mut()
            .map_or(ptr::null_mut(), |existing| ptr::from_mut(existing));

        let mut attributes = 0u32;
        let mut expiry = 0i64;
        // SAFETY: 描述符在调用期间由 `input`/`output` 持有且不移动；句柄与输出参数均指向本帧局部变量。
        let status = unsafe {
            InitializeSecurityContextW(
                &mut credential,
                context_ptr,
                target.as_ptr(),
                request.requirements.bits(),
                0,
                SECURITY_NATIVE_DREP,
                input_ptr,
                0,
                &mut new_context,
                output.as_mut_ptr(),
                &mut attributes,
                &mut expiry,
            )
        };
        let status = check(status)?;
        output.finish().map_err(marshal_failed)?;
        Ok(InitializeOutcome {
            context: ContextHandle::new(new_context.into()),
            status,
            granted: ContextRequirements::from_bits(attributes),
        })
    }

    fn complete_auth_token(
        &self,
        context: ContextHandle,
        token: &mut SecurityBufferDesc,
    ) -> ProviderResult<()> {
        let mut handle = SecHandle::from(context.native());
        let mut token = token.marshal().map_err(marshal_failed)?;
        // SAFETY: 句柄与描述符在调用期间存活。
        let status = unsafe { CompleteAuthToken(&mut handle, token.as_mut_ptr()) };
        check(status)?;
        token.finish().map_err(marshal_failed)
    }

    fn query_sizes(&self, context: ContextHandle) -> ProviderResult<ContextSizes> {
        let mut handle = SecHandle::from(context.native());
        let mut sizes = SecPkgContextSizes::default();
        // SAFETY: `SECPKG_ATTR_SIZES` 的输出结构即 `SecPkgContext_Sizes`。
        let status = unsafe {
            QueryContextAttributesW(
                &mut handle,
                SECPKG_ATTR_SIZES,
                ptr::from_mut(&mut sizes).cast::<c_void>(),
            )
        };
        check(status)?;
        Ok(ContextSizes {
            max_token: sizes.cb_max_token as usize,
            max_signature: sizes.cb_max_signature as usize,
            block_size: sizes.cb_block_size as usize,
            security_trailer: sizes.cb_security_trailer as usize,
        })
    }

    fn wrap(
        &self,
        context: ContextHandle,
        protection: MessageProtection,
        message: &mut SecurityBufferDesc,
    ) -> ProviderResult<()> {
        let mut handle = SecHandle::from(context.native());
        let mut message = message.marshal().map_err(marshal_failed)?;
        // SAFETY: 句柄与描述符在调用期间存活。
        let status =
            unsafe { EncryptMessage(&mut handle, protection.qop(), message.as_mut_ptr(), 0) };
        check(status)?;
        message.finish().map_err(marshal_failed)
    }

    fn unwrap(
        &self,
        context: ContextHandle,
        message: &mut SecurityBufferDesc,
    ) -> ProviderResult<MessageProtection> {
        let mut handle = SecHandle::from(context.native());
        let mut message = message.marshal().map_err(marshal_failed)?;
        let mut qop = 0u32;
        // SAFETY: 句柄与描述符在调用期间存活；流式解包会把 `Data` 指向 `Stream` 内部，由 `finish` 处理。
        let status = unsafe { DecryptMessage(&mut handle, message.as_mut_ptr(), 0, &mut qop) };
        check(status)?;
        message.finish().map_err(marshal_failed)?;
        Ok(MessageProtection::from_qop(qop))
    }

    fn enumerate_packages(&self) -> ProviderResult<Vec<PackageInfo>> {
        let mut count = 0u32;
        let mut infos: *mut SecPkgInfoW = ptr::null_mut();
        // SAFETY: 两个输出参数均指向本帧局部变量。
        let status = unsafe { EnumerateSecurityPackagesW(&mut count, &mut infos) };
        check(status)?;
        if infos.is_null() {
            return Ok(Vec::new());
        }
        // SAFETY: 成功时 `infos` 指向 `count` 个由提供者分配的 `SecPkgInfoW`。
        let entries = unsafe { core::slice::from_raw_parts(infos, count as usize) };
        let packages = entries
            .iter()
            .map(|info| PackageInfo {
                // SAFETY: 名称与注释为提供者分配的以 0 结尾宽字符串，在释放前有效。
                name: unsafe { from_wide(info.name) },
                comment: unsafe { from_wide(info.comment) },
                capabilities: info.f_capabilities,
                version: info.w_version,
                max_token_size: info.cb_max_token as usize,
            })
            .collect();
        // SAFETY: `infos` 由 `EnumerateSecurityPackagesW` 分配，只释放这一次。
        let freed = unsafe { FreeContextBuffer(infos.cast::<c_void>()) };
        if let Err(status) = check(freed) {
            tracing::warn!(%status, "failed to free security package list");
        }
        Ok(packages)
    }

    fn free_context(&self, context: ContextHandle) -> ProviderResult<()> {
        let mut handle = SecHandle::from(context.native());
        // SAFETY: 句柄由本适配器的 `InitializeSecurityContextW` 产生，调用方保证只释放一次。
        check(unsafe { DeleteSecurityContext(&mut handle) }).map(drop)
    }

    fn free_credential(&self, credential: CredentialHandle) -> ProviderResult<()> {
        let mut handle = SecHandle::from(credential.native());
        // SAFETY: 句柄由本适配器的 `AcquireCredentialsHandleW` 产生，调用方保证只释放一次。
        check(unsafe { FreeCredentialsHandle(&mut handle) }).map(drop)
    }
}
