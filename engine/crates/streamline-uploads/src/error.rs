use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use streamline_gfx::error::GfxError;

use crate::manager::TransactionId;
use crate::packet::SubResource;

/// 上传子系统的错误
///
/// 需要 Clone：失败原因保存在 Marker 中，所有等待者都会拿到同一个错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    /// 子资源超出 packet 声明的 mip / array 范围
    #[error("invalid subresource {sub}")]
    InvalidSubresource { sub: SubResource },

    /// 文件类的 packet 无法读取数据源
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// 纹理容器格式损坏或不支持
    #[error("failed to decode {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// 设备或资源池无法满足分配请求
    #[error("allocation failed: {0}")]
    AllocationFailed(#[source] GfxError),

    /// 阻塞等待超时，事务之后仍然可能完成
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown transaction {0:?}")]
    UnknownTransaction(TransactionId),

    /// 设备拒绝了拷贝提交
    #[error("device error: {0}")]
    Device(#[source] GfxError),

    /// 后台加载线程池无法启动，或者生产过程 panic
    #[error("background loader unavailable: {0}")]
    Loader(String),
}

impl UploadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn decode(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Decode {
            path: path.into(),
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
