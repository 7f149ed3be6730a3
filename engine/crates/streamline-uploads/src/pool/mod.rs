//! 资源池：GPU 资源的分配、回收与子分配
//!
//! - 按 [`PoolKey`] (资源类型、尺寸档位或纹理描述、绑定与访问方式) 缓存空闲资源，
//!   同一个 key 下最近释放的资源优先被再次分配
//! - 小的线性 buffer 从共享的 page 中子分配
//! - 释放的资源要等 GPU timeline 越过最后一次使用的值才会进入空闲集合

mod locator;
mod region;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};
use streamline_gfx::desc::{BindFlags, BufferDesc, BufferKind, CpuAccess, GpuAccess, TextureDesc};
use streamline_gfx::device::{GfxDevice, GfxResourceHandle};
use streamline_gfx::error::GfxError;

pub use locator::{Region, ResourceLocator};
pub use region::RegionAllocator;

use crate::config::PoolConfig;
use crate::error::{UploadError, UploadResult};
use locator::LocatorShared;

new_key_type! {
    pub struct PooledResourceKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PoolKeyKind {
    Linear { size_class: u64, stride: u32 },
    Texture(TextureDesc),
}

/// 兼容性 key：只有 key 完全相同的请求才能复用同一个资源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    kind: PoolKeyKind,
    bind_flags: BindFlags,
    cpu_access: CpuAccess,
    gpu_access: GpuAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    InUse,
    Free,
}

enum EntryKind {
    Dedicated,
    Page(RegionAllocator),
}

struct PooledEntry {
    raw: GfxResourceHandle,
    key: PoolKey,
    /// 实际分配的字节数
    byte_size: u64,
    state: EntryState,
    generation: u64,
    kind: EntryKind,
}

/// 等待 GPU 完成的释放
struct Retirement {
    fence: u64,
    key: PooledResourceKey,
    region: Option<Region>,
}

/// 资源池的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 正在使用的独立资源与子分配区域
    pub live: usize,
    pub free: usize,
    pub retiring: usize,
    pub pages: usize,
    pub recycle_hits: u64,
    pub recycle_misses: u64,
    /// 设备上实际分配的字节数
    pub allocated_bytes: u64,
}

#[derive(Default)]
struct PoolState {
    entries: SlotMap<PooledResourceKey, PooledEntry>,
    /// 每个 key 的空闲资源，末尾是最近释放的
    free: HashMap<PoolKey, Vec<PooledResourceKey>>,
    /// 每个 key 的子分配 page
    pages: HashMap<PoolKey, Vec<PooledResourceKey>>,
    retiring: VecDeque<Retirement>,

    live_regions: usize,
    recycle_hits: u64,
    recycle_misses: u64,
}

pub(crate) struct PoolShared {
    device: Arc<dyn GfxDevice>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// 资源池
///
/// 可以 clone，所有 clone 共享同一份状态；内部状态由一个 mutex 保护
#[derive(Clone)]
pub struct ResourcePool {
    shared: Arc<PoolShared>,
}

// new & init
impl ResourcePool {
    pub fn new(device: Arc<dyn GfxDevice>, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                device,
                config,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }
}

// getters
impl ResourcePool {
    #[inline]
    pub fn device(&self) -> &Arc<dyn GfxDevice> {
        &self.shared.device
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let mut stats = PoolStats {
            live: state.live_regions,
            retiring: state.retiring.len(),
            recycle_hits: state.recycle_hits,
            recycle_misses: state.recycle_misses,
            ..Default::default()
        };
        for entry in state.entries.values() {
            stats.allocated_bytes += entry.byte_size;
            match (&entry.kind, entry.state) {
                (EntryKind::Page(_), _) => stats.pages += 1,
                (EntryKind::Dedicated, EntryState::InUse) => stats.live += 1,
                (EntryKind::Dedicated, EntryState::Free) => stats.free += 1,
            }
        }
        // 正在 retire 的资源与区域仍然计入了 live
        stats.live -= state.retiring.len();
        stats
    }
}

// Subsystem API
impl ResourcePool {
    /// 分配一个满足 `desc` 的资源
    ///
    /// 依次尝试：子分配 -> 复用空闲资源 -> 向设备申请；设备内存不足时清空空闲资源后重试一次
    pub fn allocate(&self, desc: &BufferDesc, debug_name: &str) -> UploadResult<ResourceLocator> {
        let _span = tracy_client::span!("ResourcePool::allocate");
        self.shared.allocate(desc, debug_name)
    }

    /// 回收 GPU 已经不再使用的资源
    pub fn update(&self) {
        let completed = self.shared.device.completed_value();
        let mut state = self.shared.state.lock();
        self.shared.retire_completed(&mut state, completed);
    }

    /// 销毁所有空闲资源与未使用的 page，返回销毁的资源数
    pub fn purge_free(&self) -> usize {
        let mut state = self.shared.state.lock();
        self.shared.purge_free(&mut state)
    }
}

// tools
impl PoolShared {
    fn allocate(self: &Arc<Self>, desc: &BufferDesc, debug_name: &str) -> UploadResult<ResourceLocator> {
        let mut state = self.state.lock();
        self.retire_completed(&mut state, self.device.completed_value());

        if let Some(linear) = desc.linear_desc()
            && self.can_sub_allocate(desc)
        {
            let (key, generation, raw, region) = self.allocate_region(&mut state, desc, linear.size_in_bytes)?;
            return Ok(self.make_locator(key, generation, raw, *desc, Some(region)));
        }

        let pool_key = self.pool_key(desc);
        if let Some(key) = state.free.get_mut(&pool_key).and_then(Vec::pop) {
            state.recycle_hits += 1;
            let entry = &mut state.entries[key];
            entry.state = EntryState::InUse;
            entry.generation += 1;
            let (raw, generation) = (entry.raw, entry.generation);
            log::debug!("pool: recycle {:?} for '{}' (generation {})", raw, debug_name, generation);
            return Ok(self.make_locator(key, generation, raw, *desc, None));
        }

        state.recycle_misses += 1;
        let alloc_desc = self.allocation_desc(desc);
        let raw = self.create_resource(&mut state, &alloc_desc, debug_name)?;
        let byte_size = self.device.resource_size(raw).unwrap_or(0);
        let key = state.entries.insert(PooledEntry {
            raw,
            key: pool_key,
            byte_size,
            state: EntryState::InUse,
            generation: 0,
            kind: EntryKind::Dedicated,
        });
        Ok(self.make_locator(key, 0, raw, *desc, None))
    }

    fn allocate_region(
        &self,
        state: &mut PoolState,
        desc: &BufferDesc,
        size: u64,
    ) -> UploadResult<(PooledResourceKey, u64, GfxResourceHandle, Region)> {
        let page_key = PoolKey {
            kind: PoolKeyKind::Linear {
                size_class: self.config.page_size,
                stride: 0,
            },
            ..self.pool_key(desc)
        };

        let pages = state.pages.get(&page_key).cloned().unwrap_or_default();
        for key in pages {
            let entry = &mut state.entries[key];
            if let EntryKind::Page(alloc) = &mut entry.kind
                && let Some(offset) = alloc.allocate(size)
            {
                let region = Region {
                    offset,
                    size: alloc.aligned_size(size),
                };
                let (raw, generation) = (entry.raw, entry.generation);
                state.live_regions += 1;
                return Ok((key, generation, raw, region));
            }
        }

        // 没有 page 放得下，新建一个
        let mut alloc = RegionAllocator::new(self.config.page_size, self.config.region_alignment);
        let offset = alloc.allocate(size).ok_or(UploadError::AllocationFailed(GfxError::OutOfMemory {
            requested: size,
            available: self.config.page_size,
        }))?;
        let region = Region {
            offset,
            size: alloc.aligned_size(size),
        };
        let page_desc = BufferDesc::linear(self.config.page_size, desc.bind_flags)
            .with_cpu_access(desc.cpu_access)
            .with_gpu_access(desc.gpu_access);
        let raw = self.create_resource(state, &page_desc, "pool-page")?;

        let key = state.entries.insert(PooledEntry {
            raw,
            key: page_key,
            byte_size: self.config.page_size,
            state: EntryState::InUse,
            generation: 0,
            kind: EntryKind::Page(alloc),
        });
        state.pages.entry(page_key).or_default().push(key);
        state.live_regions += 1;
        log::debug!("pool: new page {:?} ({} bytes) for {:?}", raw, self.config.page_size, desc.bind_flags);
        Ok((key, 0, raw, region))
    }

    /// 向设备申请资源；内存不足时清空空闲资源后重试一次
    fn create_resource(&self, state: &mut PoolState, desc: &BufferDesc, debug_name: &str) -> UploadResult<GfxResourceHandle> {
        match self.device.create_resource(desc, debug_name) {
            Ok(raw) => Ok(raw),
            Err(GfxError::OutOfMemory { .. }) => {
                let purged = self.purge_free(state);
                log::warn!("pool: device out of memory for '{}', purged {} free resources, retrying", debug_name, purged);
                self.device.create_resource(desc, debug_name).map_err(UploadError::AllocationFailed)
            }
            Err(e) => Err(UploadError::AllocationFailed(e)),
        }
    }

    fn make_locator(
        self: &Arc<Self>,
        key: PooledResourceKey,
        generation: u64,
        raw: GfxResourceHandle,
        desc: BufferDesc,
        region: Option<Region>,
    ) -> ResourceLocator {
        ResourceLocator {
            shared: Arc::new(LocatorShared {
                pool: self.clone(),
                key,
                generation,
                raw,
                desc,
                region,
                last_use: AtomicU64::new(0),
                adopted: AtomicBool::new(false),
            }),
        }
    }

    /// locator 的最后一个 clone 被 drop
    pub(crate) fn release(&self, key: PooledResourceKey, region: Option<Region>, last_use: u64) {
        let completed = self.device.completed_value();
        let mut state = self.state.lock();
        if last_use <= completed {
            Self::free_now(&mut state, key, region);
        } else {
            state.retiring.push_back(Retirement {
                fence: last_use,
                key,
                region,
            });
        }
    }

    /// 从资源池中移除，不销毁底层资源
    pub(crate) fn forget(&self, key: PooledResourceKey) -> bool {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(entry) if entry.state == EntryState::InUse && matches!(entry.kind, EntryKind::Dedicated) => {
                state.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    fn retire_completed(&self, state: &mut PoolState, completed: u64) {
        // fence 不一定有序 (不同 locator 的最后一次使用)，需要完整扫描
        let mut index = 0;
        while index < state.retiring.len() {
            if state.retiring[index].fence <= completed {
                if let Some(retirement) = state.retiring.remove(index) {
                    Self::free_now(state, retirement.key, retirement.region);
                }
            } else {
                index += 1;
            }
        }
    }

    fn free_now(state: &mut PoolState, key: PooledResourceKey, region: Option<Region>) {
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        match (region, &mut entry.kind) {
            (Some(region), EntryKind::Page(alloc)) => {
                alloc.free(region.offset, region.size);
                state.live_regions -= 1;
            }
            (None, EntryKind::Dedicated) => {
                entry.state = EntryState::Free;
                let pool_key = entry.key;
                state.free.entry(pool_key).or_default().push(key);
            }
            _ => log::error!("pool: mismatched release of {:?}", key),
        }
    }

    fn purge_free(&self, state: &mut PoolState) -> usize {
        let mut doomed: Vec<PooledResourceKey> = state.free.drain().flat_map(|(_, keys)| keys).collect();
        for pages in state.pages.values_mut() {
            pages.retain(|key| {
                let unused = matches!(&state.entries[*key].kind, EntryKind::Page(alloc) if alloc.is_unused());
                if unused {
                    doomed.push(*key);
                }
                !unused
            });
        }
        state.pages.retain(|_, pages| !pages.is_empty());

        for key in &doomed {
            if let Some(entry) = state.entries.remove(*key) {
                self.device.destroy_resource(entry.raw);
            }
        }
        if !doomed.is_empty() {
            log::info!("pool: purged {} free resources", doomed.len());
        }
        doomed.len()
    }

    fn can_sub_allocate(&self, desc: &BufferDesc) -> bool {
        let Some(linear) = desc.linear_desc() else {
            return false;
        };
        let shareable = BindFlags::VERTEX_BUFFER
            | BindFlags::INDEX_BUFFER
            | BindFlags::CONSTANT_BUFFER
            | BindFlags::SHADER_RESOURCE;
        linear.structure_byte_size == 0
            && linear.size_in_bytes > 0
            && linear.size_in_bytes <= self.config.suballocation_threshold
            && desc.cpu_access.is_empty()
            && shareable.contains(desc.bind_flags)
    }

    fn size_class(&self, size: u64) -> u64 {
        size.max(self.config.min_size_class).next_power_of_two()
    }

    fn pool_key(&self, desc: &BufferDesc) -> PoolKey {
        let kind = match &desc.kind {
            BufferKind::Linear(linear) => PoolKeyKind::Linear {
                size_class: self.size_class(linear.size_in_bytes),
                stride: linear.structure_byte_size,
            },
            BufferKind::Texture(tex) => PoolKeyKind::Texture(*tex),
        };
        PoolKey {
            kind,
            bind_flags: desc.bind_flags,
            cpu_access: desc.cpu_access,
            gpu_access: desc.gpu_access,
        }
    }

    /// 实际向设备申请的描述：线性 buffer 向上取整到尺寸档位
    fn allocation_desc(&self, desc: &BufferDesc) -> BufferDesc {
        let mut alloc_desc = *desc;
        if let BufferKind::Linear(linear) = &mut alloc_desc.kind {
            linear.size_in_bytes = self.size_class(linear.size_in_bytes);
        }
        alloc_desc
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let _span = tracy_client::span!("ResourcePool::destroy_all");
        let state = self.state.get_mut();
        // 所有 locator 都持有 PoolShared，这里剩下的只有空闲资源与 page
        for (_, entry) in state.entries.drain() {
            self.device.destroy_resource(entry.raw);
        }
        state.free.clear();
        state.pages.clear();
        state.retiring.clear();
    }
}
