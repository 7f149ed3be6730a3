use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use streamline_gfx::desc::BufferDesc;
use streamline_gfx::device::GfxResourceHandle;

use crate::pool::{PoolShared, PooledResourceKey};

/// 子分配区域在 page 中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

pub(crate) struct LocatorShared {
    pub(crate) pool: Arc<PoolShared>,
    pub(crate) key: PooledResourceKey,
    pub(crate) generation: u64,
    pub(crate) raw: GfxResourceHandle,
    /// 调用者请求的描述；实际分配可能更大 (尺寸档位、page)
    pub(crate) desc: BufferDesc,
    pub(crate) region: Option<Region>,
    /// 最后一次引用该资源的提交的 timeline 值
    pub(crate) last_use: AtomicU64,
    /// 已经通过 adopt_underlying 移出资源池
    pub(crate) adopted: AtomicBool,
}

impl Drop for LocatorShared {
    fn drop(&mut self) {
        if self.adopted.load(Ordering::Acquire) {
            return;
        }
        self.pool.release(self.key, self.region, self.last_use.load(Ordering::Acquire));
    }
}

/// 指向资源池中一块资源 (或 page 中一段区域) 的引用
///
/// 可以 clone；最后一个 clone 被 drop 时资源交还给资源池，
/// 等 GPU timeline 越过 [`ResourceLocator::mark_used`] 记录的值之后才会被再次分配。
#[derive(Clone)]
pub struct ResourceLocator {
    pub(crate) shared: Arc<LocatorShared>,
}

// getters
impl ResourceLocator {
    /// 底层设备资源；子分配的 locator 与同一 page 上的其他 locator 共享
    #[inline]
    pub fn raw(&self) -> GfxResourceHandle {
        self.shared.raw
    }

    #[inline]
    pub fn desc(&self) -> &BufferDesc {
        &self.shared.desc
    }

    /// 数据在底层资源中的起始位置
    #[inline]
    pub fn offset(&self) -> u64 {
        self.shared.region.map(|region| region.offset).unwrap_or(0)
    }

    /// 请求的字节数
    pub fn size(&self) -> u64 {
        self.shared.desc.byte_count().unwrap_or(0)
    }

    #[inline]
    pub fn region(&self) -> Option<Region> {
        self.shared.region
    }

    #[inline]
    pub fn is_sub_allocated(&self) -> bool {
        self.shared.region.is_some()
    }

    /// 资源每被回收再分配一次，generation 加 1
    #[inline]
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    #[inline]
    pub fn pool_key(&self) -> PooledResourceKey {
        self.shared.key
    }

    #[inline]
    pub fn last_use(&self) -> u64 {
        self.shared.last_use.load(Ordering::Acquire)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl ResourceLocator {
    /// 记录一次引用该资源的提交；只会增大
    #[inline]
    pub fn mark_used(&self, fence_value: u64) {
        self.shared.last_use.fetch_max(fence_value, Ordering::AcqRel);
    }

    /// 把底层资源移出资源池，之后由调用者负责销毁
    ///
    /// 只有唯一持有、且不是子分配的 locator 可以移出，否则原样返回
    pub fn adopt_underlying(self) -> Result<GfxResourceHandle, Self> {
        if self.is_sub_allocated() || Arc::strong_count(&self.shared) != 1 {
            return Err(self);
        }
        if !self.shared.pool.forget(self.shared.key) {
            return Err(self);
        }
        self.shared.adopted.store(true, Ordering::Release);
        Ok(self.shared.raw)
    }
}

impl std::fmt::Debug for ResourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLocator")
            .field("raw", &self.shared.raw)
            .field("offset", &self.offset())
            .field("size", &self.size())
            .field("generation", &self.shared.generation)
            .finish()
    }
}
