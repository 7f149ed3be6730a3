use ash::vk;

use crate::device::GfxResourceHandle;

/// 设备层错误
///
/// 需要 Clone：同一个错误会被转交给上传事务的所有等待者
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GfxError {
    #[error("device out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("invalid resource handle {0:?}")]
    InvalidHandle(GfxResourceHandle),

    #[error("copy out of bounds: {offset} + {len} exceeds resource size {size}")]
    CopyOutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("subresource (mip {mip}, layer {layer}) does not exist in resource {handle:?}")]
    InvalidSubresource { handle: GfxResourceHandle, mip: u32, layer: u32 },

    #[error("unsupported format {0:?}")]
    UnsupportedFormat(vk::Format),

    #[error("resource size overflows: {0}")]
    SizeOverflow(String),

    #[error("timeline signal value {signal} is not greater than last submitted value {last}")]
    NonMonotonicSignal { signal: u64, last: u64 },
}

pub type GfxResult<T> = Result<T, GfxError>;
