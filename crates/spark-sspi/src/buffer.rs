//! 安全缓冲区与缓冲描述符：提供者调用的参数块形态。
//!
//! # 逻辑（How）
//! - [`SecurityBuffer`] 是带类型标签的字节区域，[`SecurityBufferDesc`] 是一次提供者调用的有序参数块；
//! - 描述符独占底层内存，随作用域结束被释放一次，成功、失败或 panic 展开路径都不例外；
//! - 需要跨越 FFI 时，[`SecurityBufferDesc::marshal`] 生成与 SSPI `SecBufferDesc` 同布局的
//!   指针+长度数组，调用结束后由 [`MarshalledDesc::finish`] 把提供者写回的长度、类型与重定向指针
//!   同步回托管缓冲。
//!
//! # 契约（What）
//! - 描述符只服务于单次调用，不跨调用保留，也不在线程间共享；
//! - [`SecurityBufferDesc::to_byte_array`] 按顺序拼接 `Data` 与 `Padding` 缓冲。

use core::{fmt, ptr, slice};
use std::ffi::c_void;

use thiserror::Error;

/// 缓冲区类型标签，取值与 SSPI `SECBUFFER_*` 常量一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SecurityBufferType {
    /// 未使用的占位缓冲。
    Empty = 0,
    /// 应用数据（明文或密文主体）。
    Data = 1,
    /// 握手令牌或消息保护的尾部签名。
    Token = 2,
    /// 提供者报告仍缺少的字节数。
    Missing = 4,
    /// 提供者未消费的剩余字节。
    Extra = 5,
    /// 块对齐填充。
    Padding = 9,
    /// 完整的流式报文（数据与签名混合）。
    Stream = 10,
}

/// 原生类型字段中的属性位（如只读标记），解析类型时需屏蔽。
const BUFFER_ATTRIBUTE_MASK: u32 = 0xF000_0000;

impl SecurityBufferType {
    /// 原生码值。
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// 从原生码值解析类型，忽略高位属性标记；未知类型返回 `None`。
    pub const fn from_raw(raw: u32) -> Option<Self> {
        let kind = match raw & !BUFFER_ATTRIBUTE_MASK {
            0 => Self::Empty,
            1 => Self::Data,
            2 => Self::Token,
            4 => Self::Missing,
            5 => Self::Extra,
            9 => Self::Padding,
            10 => Self::Stream,
            _ => return None,
        };
        Some(kind)
    }
}

/// 带类型标签的字节区域。
///
/// `Debug` 输出只包含类型与长度，令牌内容不会进入日志。
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityBuffer {
    kind: SecurityBufferType,
    bytes: Vec<u8>,
}

impl SecurityBuffer {
    pub fn new(kind: SecurityBufferType, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }

    /// 分配 `len` 字节的零值缓冲，供提供者写入。
    pub fn zeroed(kind: SecurityBufferType, len: usize) -> Self {
        Self::new(kind, vec![0; len])
    }

    pub fn empty() -> Self {
        Self::new(SecurityBufferType::Empty, Vec::new())
    }

    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(SecurityBufferType::Data, bytes.into())
    }

    pub fn token(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(SecurityBufferType::Token, bytes.into())
    }

    pub fn stream(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(SecurityBufferType::Stream, bytes.into())
    }

    pub fn padding(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(SecurityBufferType::Padding, bytes.into())
    }

    pub fn kind(&self) -> SecurityBufferType {
        self.kind
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// 提供者写入入口。
    ///
    /// # 契约
    /// - 提供者可以缩短缓冲（报告实际使用长度）或整体替换内容；
    /// - 调用方分配的长度即提供者可用的上限，越界增长由 [`SecurityBufferDesc::check_limits`]
    ///   与平台适配层的回写校验拒绝。
    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for SecurityBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityBuffer")
            .field("kind", &self.kind)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// 一次提供者调用的有序缓冲参数块。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityBufferDesc {
    buffers: Vec<SecurityBuffer>,
}

impl SecurityBufferDesc {
    /// `SECBUFFER_VERSION`。
    pub const VERSION: u32 = 0;

    pub fn new(buffers: Vec<SecurityBuffer>) -> Self {
        Self { buffers }
    }

    /// 仅包含一个缓冲的描述符，握手令牌的输入输出都使用这种形态。
    pub fn single(buffer: SecurityBuffer) -> Self {
        Self::new(vec![buffer])
    }

    pub fn buffers(&self) -> &[SecurityBuffer] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [SecurityBuffer] {
        &mut self.buffers
    }

    /// 第一个类型为 `kind` 的缓冲。
    pub fn find(&self, kind: SecurityBufferType) -> Option<&SecurityBuffer> {
        self.buffers.iter().find(|buffer| buffer.kind == kind)
    }

    pub fn find_mut(&mut self, kind: SecurityBufferType) -> Option<&mut SecurityBuffer> {
        self.buffers.iter_mut().find(|buffer| buffer.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// 按顺序拼接所有 `Data` 与 `Padding` 缓冲，得到解包后的明文视图。
    pub fn to_byte_array(&self) -> Vec<u8> {
        self.concat_where(|kind| {
            matches!(kind, SecurityBufferType::Data | SecurityBufferType::Padding)
        })
    }

    /// 按顺序拼接 `Token`、`Data`、`Padding`、`Stream` 缓冲，得到可直接发送的报文。
    pub fn concat_all(&self) -> Vec<u8> {
        self.concat_where(|kind| {
            matches!(
                kind,
                SecurityBufferType::Token
                    | SecurityBufferType::Data
                    | SecurityBufferType::Padding
                    | SecurityBufferType::Stream
            )
        })
    }

    /// 调用前各缓冲的长度，即提供者可写入的上限。
    pub(crate) fn limits(&self) -> Vec<usize> {
        self.buffers.iter().map(SecurityBuffer::len).collect()
    }

    /// 校验提供者写回后没有缓冲超过 `limits` 记录的长度。
    pub(crate) fn check_limits(&self, limits: &[usize]) -> Result<(), BufferError> {
        for (index, (buffer, &capacity)) in self.buffers.iter().zip(limits).enumerate() {
            if buffer.len() > capacity {
                return Err(BufferError::Grown {
                    index,
                    capacity,
                    reported: buffer.len(),
                });
            }
        }
        Ok(())
    }

    fn concat_where(&self, keep: impl Fn(SecurityBufferType) -> bool) -> Vec<u8> {
        let selected: Vec<&SecurityBuffer> = self
            .buffers
            .iter()
            .filter(|buffer| keep(buffer.kind))
            .collect();
        let total = selected.iter().map(|buffer| buffer.len()).sum();
        let mut out = Vec::with_capacity(total);
        for buffer in selected {
            out.extend_from_slice(&buffer.bytes);
        }
        out
    }

    /// 把描述符转换为原生调用约定的指针+长度数组。
    ///
    /// # 契约
    /// - 返回的 [`MarshalledDesc`] 可变借用 `self`，在它存活期间托管缓冲不会被移动或重新分配；
    /// - 原生调用结束后必须调用 [`MarshalledDesc::finish`] 才能看到提供者写回的结果；
    ///   直接丢弃则保持调用前的内容。
    pub fn marshal(&mut self) -> Result<MarshalledDesc<'_>, BufferError> {
        let mut raw = Vec::with_capacity(self.buffers.len());
        for (index, buffer) in self.buffers.iter_mut().enumerate() {
            let len = buffer.bytes.len();
            let cb_buffer = u32::try_from(len).map_err(|_| BufferError::TooLarge { index, len })?;
            let pv_buffer = if len == 0 {
                ptr::null_mut()
            } else {
                buffer.bytes.as_mut_ptr().cast::<c_void>()
            };
            raw.push(RawSecurityBuffer {
                cb_buffer,
                buffer_type: buffer.kind.raw(),
                pv_buffer,
            });
        }
        let count = raw.len();
        let c_buffers = u32::try_from(count).map_err(|_| BufferError::TooManyBuffers { count })?;
        tracing::trace!(buffers = count, "marshalled security buffer descriptor");
        Ok(MarshalledDesc {
            desc: self,
            raw,
            header: RawBufferDescriptor {
                ul_version: Self::VERSION,
                c_buffers,
                p_buffers: ptr::null_mut(),
            },
        })
    }
}

/// 与 SSPI `SecBuffer` 同布局的原生缓冲项。
#[repr(C)]
#[derive(Debug)]
pub struct RawSecurityBuffer {
    pub cb_buffer: u32,
    pub buffer_type: u32,
    pub pv_buffer: *mut c_void,
}

/// 与 SSPI `SecBufferDesc` 同布局的原生描述符头。
#[repr(C)]
#[derive(Debug)]
pub struct RawBufferDescriptor {
    pub ul_version: u32,
    pub c_buffers: u32,
    pub p_buffers: *mut RawSecurityBuffer,
}

/// 已编组的描述符，持有原生数组并可变借用托管缓冲。
#[derive(Debug)]
pub struct MarshalledDesc<'a> {
    desc: &'a mut SecurityBufferDesc,
    raw: Vec<RawSecurityBuffer>,
    header: RawBufferDescriptor,
}

enum Writeback {
    Truncate(usize),
    Replace(Vec<u8>),
}

impl MarshalledDesc<'_> {
    /// 原生调用使用的描述符指针，在 `self` 存活且未移动期间有效。
    pub fn as_mut_ptr(&mut self) -> *mut RawBufferDescriptor {
        self.header.p_buffers = self.raw.as_mut_ptr();
        &mut self.header
    }

    /// 把提供者写回的长度、类型与指针同步到托管缓冲。
    ///
    /// # 逻辑
    /// 1. 指针未变：按报告长度截断，长度超过原分配视为违规；
    /// 2. 指针被重定向到同一描述符内另一块托管内存（例如流式解包把 `Data` 指向 `Stream` 内部）：
    ///    先复制出内容，全部计算完成后再统一写回，避免别名读写；
    /// 3. 指向托管内存之外：拒绝，本 crate 不请求提供者代为分配内存。
    pub fn finish(self) -> Result<(), BufferError> {
        let MarshalledDesc { desc, raw, header } = self;
        if header.c_buffers as usize != raw.len() {
            return Err(BufferError::TooManyBuffers {
                count: header.c_buffers as usize,
            });
        }

        let spans: Vec<(usize, usize)> = desc
            .buffers
            .iter()
            .map(|buffer| (buffer.bytes.as_ptr() as usize, buffer.bytes.len()))
            .collect();

        let mut updates = Vec::with_capacity(raw.len());
        for (index, entry) in raw.iter().enumerate() {
            let kind = SecurityBufferType::from_raw(entry.buffer_type).ok_or(
                BufferError::UnknownType {
                    index,
                    raw: entry.buffer_type,
                },
            )?;
            let len = entry.cb_buffer as usize;
            let (start, capacity) = spans[index];
            let addr = entry.pv_buffer as usize;
            let writeback = if len == 0 {
                Writeback::Truncate(0)
            } else if !entry.pv_buffer.is_null() && addr == start {
                if len > capacity {
                    return Err(BufferError::Grown {
                        index,
                        capacity,
                        reported: len,
                    });
                }
                Writeback::Truncate(len)
            } else {
                let inside = !entry.pv_buffer.is_null()
                    && spans.iter().any(|&(owner, owner_len)| {
                        owner_len > 0
                            && addr >= owner
                            && addr
                                .checked_add(len)
                                .is_some_and(|end| end <= owner + owner_len)
                    });
                if !inside {
                    return Err(BufferError::ForeignPointer { index });
                }
                // SAFETY: 区间已确认完整落在本描述符某块存活的托管内存内，且此处只读。
                let bytes =
                    unsafe { slice::from_raw_parts(entry.pv_buffer.cast::<u8>(), len) }.to_vec();
                Writeback::Replace(bytes)
            };
            updates.push((kind, writeback));
        }

        for (buffer, (kind, writeback)) in desc.buffers.iter_mut().zip(updates) {
            buffer.kind = kind;
            match writeback {
                Writeback::Truncate(len) => buffer.bytes.truncate(len),
                Writeback::Replace(bytes) => buffer.bytes = bytes,
            }
        }
        Ok(())
    }
}

/// 编组与回写阶段的违规。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("security buffer #{index} is too large for the native calling convention ({len} bytes)")]
    TooLarge { index: usize, len: usize },
    #[error("descriptor holds too many buffers for the native calling convention ({count})")]
    TooManyBuffers { count: usize },
    #[error("provider reported unknown buffer type {raw:#x} for buffer #{index}")]
    UnknownType { index: usize, raw: u32 },
    #[error("provider grew buffer #{index} from {capacity} to {reported} bytes")]
    Grown {
        index: usize,
        capacity: usize,
        reported: usize,
    },
    #[error("provider pointed buffer #{index} outside of the descriptor's memory")]
    ForeignPointer { index: usize },
}
