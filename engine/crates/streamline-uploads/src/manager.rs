//! 上传事务管理
//!
//! 事务的状态变化：
//!
//! ```text
//! Queued -> Loading -> Staged -> Committed -> Completed
//!    \         \          \          \
//!     `---------`----------`----------`--> Failed
//! ```
//!
//! - Queued: 等待进入后台加载队列 (loader 队列已满)
//! - Loading: 后台正在生产 packet 数据
//! - Staged: 数据已经驻留内存，等待合并提交
//! - Committed: 拷贝已经提交给设备，等待 timeline 到达提交时的 fence 值
//!
//! 所有状态推进都发生在调用 [`UploadManager::update`] 的线程上。
//!
//! 调用者通过 [`Marker`] 持有事务：Marker 的所有 clone 都被丢弃后，事务被视为放弃，
//! 到达终态后由管理器回收，目标资源随之回到资源池。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use slotmap::{Key, KeyData, SlotMap, new_key_type};
use streamline_gfx::desc::{BufferDesc, BufferKind};
use streamline_gfx::device::{GfxCopyRegion, GfxDevice, GfxResourceHandle};
use streamline_gfx::error::GfxError;

use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::loader::{BackgroundLoader, LoadRequest, LoadResult};
use crate::marker::{Marker, MarkerState};
use crate::packet::{DataPacket, SharedPacket};
use crate::pool::{PoolStats, ResourceLocator, ResourcePool};

new_key_type! {
    pub struct TransactionId;
}

/// 阻塞等待时，每次最多睡眠的时间；醒来后会推进一次事务状态
const WAIT_SLICE: Duration = Duration::from_millis(2);

/// 销毁时等待已提交拷贝完成的最长时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Queued,
    Loading,
    Staged,
    Committed,
    Completed,
    Failed,
}

impl TransactionState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 上传子系统的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadMetrics {
    pub transactions_begun: u64,
    pub transactions_completed: u64,
    pub transactions_failed: u64,
    pub immediate_transactions: u64,
    /// 提交给设备的数据量
    pub bytes_uploaded: u64,
    /// 设备提交次数 (包括 immediate 事务)
    pub batches_submitted: u64,
}

/// 已经完成的上传：目标资源与一个处于 Completed 状态的 Marker
#[derive(Debug, Clone)]
pub struct CompletedResource {
    pub locator: ResourceLocator,
    pub marker: Marker,
}

struct Transaction {
    /// 提交之后释放
    packet: Option<SharedPacket>,
    locator: ResourceLocator,
    marker: Marker,
    state: TransactionState,
    /// 提交时的 timeline 值
    fence: u64,
    /// 调用者通过 `transaction_end` 放弃了事务，终态后直接回收
    detached: bool,
}

/// 同一个目标 (资源 + 偏移) 的事务按提交顺序完成
type DestinationKey = (GfxResourceHandle, u64);

fn destination_of(locator: &ResourceLocator) -> DestinationKey {
    (locator.raw(), locator.offset())
}

/// 一个准备合并提交的事务
struct StagedCopy {
    id: TransactionId,
    packet: SharedPacket,
    locator: ResourceLocator,
    bytes: u64,
}

/// 上传事务管理器
///
/// 由渲染线程持有：发起事务、每帧调用 [`Self::update`]、查询或者等待结果。
/// 数据生产在 [`BackgroundLoader`] 的线程上进行，拷贝只在这里提交。
///
/// 管理器必须是 `device` timeline 唯一的提交者。
pub struct UploadManager {
    device: Arc<dyn GfxDevice>,
    pool: ResourcePool,
    loader: BackgroundLoader,
    config: UploadConfig,

    transactions: SlotMap<TransactionId, Transaction>,

    /// loader 队列已满时等待投递的事务，FIFO
    loader_backlog: VecDeque<TransactionId>,
    /// 数据就绪、等待提交的事务，按就绪顺序
    staged: VecDeque<TransactionId>,
    /// 已经提交、等待 GPU 完成的事务，fence 递增
    committed: VecDeque<TransactionId>,
    /// 每个目标上尚未提交的事务，按发起顺序；只有队首可以提交
    destination_queues: HashMap<DestinationKey, VecDeque<TransactionId>>,

    /// 最后一次提交使用的 timeline 值
    last_fence_value: u64,
    metrics: UploadMetrics,
}

// new & init
impl UploadManager {
    pub fn new(device: Arc<dyn GfxDevice>, config: UploadConfig) -> UploadResult<Self> {
        let loader = BackgroundLoader::new(&config.loader)?;
        let pool = ResourcePool::new(device.clone(), config.pool.clone());
        let last_fence_value = device.completed_value();

        Ok(Self {
            device,
            pool,
            loader,
            config,

            transactions: SlotMap::with_key(),
            loader_backlog: VecDeque::new(),
            staged: VecDeque::new(),
            committed: VecDeque::new(),
            destination_queues: HashMap::new(),

            last_fence_value,
            metrics: UploadMetrics::default(),
        })
    }
}

// getters
impl UploadManager {
    #[inline]
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    #[inline]
    pub fn loader(&self) -> &BackgroundLoader {
        &self.loader
    }

    #[inline]
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    #[inline]
    pub fn metrics(&self) -> UploadMetrics {
        self.metrics
    }

    #[inline]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// 未到达终态的事务数 (包括已经 detach 的)
    pub fn pending_count(&self) -> usize {
        self.transactions.values().filter(|tx| !tx.state.is_terminal()).count()
    }

    pub fn state(&self, id: TransactionId) -> Option<TransactionState> {
        self.transactions.get(id).map(|tx| tx.state)
    }

    /// 未知的事务返回 false
    pub fn is_complete(&self, id: TransactionId) -> bool {
        self.state(id) == Some(TransactionState::Completed)
    }

    pub fn marker(&self, id: TransactionId) -> UploadResult<Marker> {
        self.transactions
            .get(id)
            .map(|tx| tx.marker.clone())
            .ok_or(UploadError::UnknownTransaction(id))
    }

    /// 完成的事务的目标资源
    pub fn resource(&self, id: TransactionId) -> Option<ResourceLocator> {
        self.transactions
            .get(id)
            .filter(|tx| tx.state == TransactionState::Completed)
            .map(|tx| tx.locator.clone())
    }
}

// 发起事务
impl UploadManager {
    /// 同步上传：分配资源、生产数据、提交拷贝并等待设备完成
    pub fn transaction_immediate(
        &mut self,
        desc: &BufferDesc,
        packet: impl Into<SharedPacket>,
    ) -> UploadResult<CompletedResource> {
        let _span = tracy_client::span!("UploadManager::transaction_immediate");
        let packet = packet.into();

        let locator = self.pool.allocate(desc, &packet.debug_name())?;
        let regions = build_copy_regions(&locator, &packet)?;
        let bytes = regions.iter().map(|region| region.data.len() as u64).sum::<u64>();

        let fence = self.next_fence_value();
        self.device.submit_copies(&regions, fence).map_err(UploadError::Device)?;
        locator.mark_used(fence);

        if !self.device.wait_value(fence, Duration::MAX) {
            return Err(UploadError::Timeout(Duration::MAX));
        }

        self.metrics.immediate_transactions += 1;
        self.metrics.batches_submitted += 1;
        self.metrics.bytes_uploaded += bytes;
        log::debug!("immediate upload of {} bytes to {:?} (fence {})", bytes, locator.raw(), fence);

        Ok(CompletedResource {
            locator,
            marker: Marker::completed(),
        })
    }

    /// 异步上传到新分配的资源，立即返回
    ///
    /// 分配失败同步返回；数据生产或拷贝的失败通过 Marker 报告。
    /// 丢弃返回的 Marker (以及它的所有 clone) 即放弃事务
    pub fn transaction_begin(
        &mut self,
        desc: &BufferDesc,
        packet: impl Into<SharedPacket>,
    ) -> UploadResult<(TransactionId, Marker)> {
        let packet = packet.into();
        let locator = self.pool.allocate(desc, &packet.debug_name())?;
        Ok(self.enqueue(locator, packet))
    }

    /// 异步上传到已有的资源
    ///
    /// 同一个目标上的事务按照发起顺序完成
    pub fn transaction_begin_update(
        &mut self,
        locator: &ResourceLocator,
        packet: impl Into<SharedPacket>,
    ) -> (TransactionId, Marker) {
        self.enqueue(locator.clone(), packet.into())
    }

    fn enqueue(&mut self, locator: ResourceLocator, packet: SharedPacket) -> (TransactionId, Marker) {
        let marker = Marker::new();
        let needs_load = packet.requires_background_load();
        let destination = destination_of(&locator);

        let id = self.transactions.insert(Transaction {
            packet: Some(packet),
            locator,
            marker: marker.clone(),
            state: TransactionState::Queued,
            fence: 0,
            detached: false,
        });
        self.destination_queues.entry(destination).or_default().push_back(id);
        self.metrics.transactions_begun += 1;

        if needs_load {
            self.loader_backlog.push_back(id);
            self.feed_loader_backlog();
        } else {
            self.transactions[id].state = TransactionState::Staged;
            marker.set_in_progress();
            self.staged.push_back(id);
        }
        (id, marker)
    }

    /// 结束对事务的跟踪
    ///
    /// 终态的事务立即回收；未完成的事务被 detach，完成后自动回收
    pub fn transaction_end(&mut self, id: TransactionId) -> UploadResult<()> {
        let tx = self.transactions.get_mut(id).ok_or(UploadError::UnknownTransaction(id))?;
        if tx.state.is_terminal() {
            self.transactions.remove(id);
        } else {
            tx.detached = true;
        }
        Ok(())
    }
}

// 推进
impl UploadManager {
    /// 每帧调用一次：回收资源、收取后台结果、合并提交、确认完成
    pub fn update(&mut self) {
        let _span = tracy_client::span!("UploadManager::update");

        self.pool.update();
        self.retire_committed();
        self.drain_load_results();
        self.feed_loader_backlog();
        self.commit_staged();
        self.retire_committed();
        self.collect_detached();
    }

    /// 阻塞等待事务到达终态
    ///
    /// 等待期间会推进所有事务；`timeout` 为 0 时只检查一次
    pub fn wait(&mut self, id: TransactionId, timeout: Duration) -> UploadResult<()> {
        let _span = tracy_client::span!("UploadManager::wait");
        let deadline = Instant::now().checked_add(timeout);
        // 等待期间持有 Marker，事务不会被当作放弃而回收
        let marker = self.marker(id)?;

        loop {
            match marker.state() {
                MarkerState::Completed => return Ok(()),
                MarkerState::Failed(err) => return Err(err),
                MarkerState::Pending | MarkerState::InProgress => {}
            }

            self.update();
            match marker.state() {
                MarkerState::Completed => return Ok(()),
                MarkerState::Failed(err) => return Err(err),
                MarkerState::Pending | MarkerState::InProgress => {}
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(UploadError::Timeout(timeout));
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            self.block_on(id, slice);
        }
    }

    /// 阻塞等待所有事务到达终态
    pub fn wait_all(&mut self, timeout: Duration) -> UploadResult<()> {
        let _span = tracy_client::span!("UploadManager::wait_all");
        let deadline = Instant::now().checked_add(timeout);

        loop {
            self.update();
            let Some(id) = self.oldest_pending() else {
                return Ok(());
            };

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(UploadError::Timeout(timeout));
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            self.block_on(id, slice);
        }
    }

    fn oldest_pending(&self) -> Option<TransactionId> {
        self.committed
            .iter()
            .chain(self.staged.iter())
            .chain(self.loader_backlog.iter())
            .copied()
            .next()
            .or_else(|| self.transactions.iter().find(|(_, tx)| !tx.state.is_terminal()).map(|(id, _)| id))
    }

    /// 按照事务当前所处的阶段，最多阻塞 `slice`
    fn block_on(&mut self, id: TransactionId, slice: Duration) {
        let Some(tx) = self.transactions.get(id) else {
            return;
        };
        match tx.state {
            TransactionState::Committed => {
                self.device.wait_value(tx.fence, slice);
            }
            // 被同一目标上更早的事务挡住时，等待那个事务的进度
            TransactionState::Queued | TransactionState::Loading | TransactionState::Staged => {
                if let Some(result) = self.loader.recv_result_timeout(slice) {
                    self.handle_load_result(result);
                }
            }
            TransactionState::Completed | TransactionState::Failed => {}
        }
    }

    fn next_fence_value(&mut self) -> u64 {
        self.last_fence_value += 1;
        self.last_fence_value
    }

    fn feed_loader_backlog(&mut self) {
        while let Some(&id) = self.loader_backlog.front() {
            let Some(packet) = self.transactions.get(id).and_then(|tx| tx.packet.clone()) else {
                self.loader_backlog.pop_front();
                continue;
            };

            match self.loader.try_request_load(LoadRequest::tracked(packet, id.data().as_ffi())) {
                Ok(()) => {
                    self.loader_backlog.pop_front();
                    let tx = &mut self.transactions[id];
                    tx.state = TransactionState::Loading;
                    tx.marker.set_in_progress();
                }
                // loader 队列已满，下一帧再试
                Err(_) => break,
            }
        }
    }

    fn drain_load_results(&mut self) {
        while let Some(result) = self.loader.try_recv_result() {
            self.handle_load_result(result);
        }
    }

    fn handle_load_result(&mut self, result: LoadResult) {
        let id = TransactionId::from(KeyData::from_ffi(result.ticket));
        let Some(tx) = self.transactions.get_mut(id) else {
            log::warn!("load result for unknown transaction {:?}", id);
            return;
        };
        if tx.state != TransactionState::Loading {
            return;
        }

        match result.outcome {
            Ok(()) => {
                tx.state = TransactionState::Staged;
                self.staged.push_back(id);
            }
            Err(err) => self.fail_transaction(id, err),
        }
    }

    fn is_destination_front(&self, id: TransactionId, locator: &ResourceLocator) -> bool {
        self.destination_queues
            .get(&destination_of(locator))
            .and_then(|queue| queue.front())
            .is_some_and(|front| *front == id)
    }

    fn leave_destination(&mut self, id: TransactionId, destination: DestinationKey) {
        if let Some(queue) = self.destination_queues.get_mut(&destination) {
            queue.retain(|queued| *queued != id);
            if queue.is_empty() {
                self.destination_queues.remove(&destination);
            }
        }
    }

    fn fail_transaction(&mut self, id: TransactionId, err: UploadError) {
        let Some(tx) = self.transactions.get_mut(id) else {
            return;
        };
        log::error!("upload transaction {:?} failed: {}", id, err);

        tx.state = TransactionState::Failed;
        tx.packet = None;
        tx.marker.fail(err);
        let destination = destination_of(&tx.locator);

        self.metrics.transactions_failed += 1;
        self.leave_destination(id, destination);
    }

    fn mark_committed(&mut self, id: TransactionId, fence: u64, bytes: u64) {
        let Some(tx) = self.transactions.get_mut(id) else {
            return;
        };
        tx.state = TransactionState::Committed;
        tx.fence = fence;
        tx.packet = None;
        tx.locator.mark_used(fence);
        let destination = destination_of(&tx.locator);

        self.committed.push_back(id);
        self.metrics.bytes_uploaded += bytes;
        self.leave_destination(id, destination);
    }

    /// 把就绪的事务合并成一次设备提交
    fn commit_staged(&mut self) {
        let _span = tracy_client::span!("UploadManager::commit_staged");
        if self.staged.is_empty() {
            return;
        }

        let max_transactions = self.config.max_transactions_per_batch.max(1);
        let byte_budget = self.config.max_upload_bytes_per_frame;

        let mut batch: Vec<StagedCopy> = Vec::new();
        let mut failed: Vec<(TransactionId, UploadError)> = Vec::new();
        let mut remaining = VecDeque::new();
        let mut batch_bytes = 0u64;
        let mut closed = false;

        while let Some(id) = self.staged.pop_front() {
            let Some(tx) = self.transactions.get(id) else {
                continue;
            };
            let Some(packet) = tx.packet.clone() else {
                continue;
            };
            if closed || !self.is_destination_front(id, &tx.locator) {
                remaining.push_back(id);
                continue;
            }

            let bytes = match packet.make_resident() {
                Ok(resident) => resident.layout().total_size() as u64,
                Err(err) => {
                    failed.push((id, err));
                    continue;
                }
            };
            // 超出预算的单个事务单独提交
            if batch.len() >= max_transactions || (!batch.is_empty() && batch_bytes + bytes > byte_budget) {
                closed = true;
                remaining.push_back(id);
                continue;
            }

            batch_bytes += bytes;
            batch.push(StagedCopy {
                id,
                packet,
                locator: tx.locator.clone(),
                bytes,
            });
        }
        self.staged = remaining;

        let mut regions: Vec<GfxCopyRegion<'_>> = Vec::new();
        let mut accepted: Vec<&StagedCopy> = Vec::new();
        for copy in &batch {
            match build_copy_regions(&copy.locator, &copy.packet) {
                Ok(copy_regions) => {
                    regions.extend(copy_regions);
                    accepted.push(copy);
                }
                Err(err) => failed.push((copy.id, err)),
            }
        }
        for (id, err) in failed {
            self.fail_transaction(id, err);
        }
        if accepted.is_empty() {
            return;
        }

        let fence = self.next_fence_value();
        match self.device.submit_copies(&regions, fence) {
            Ok(()) => {
                self.metrics.batches_submitted += 1;
                log::debug!(
                    "committed {} transactions ({} regions, {} bytes) at fence {}",
                    accepted.len(),
                    regions.len(),
                    batch_bytes,
                    fence
                );
                for copy in accepted {
                    self.mark_committed(copy.id, fence, copy.bytes);
                }
            }
            Err(err) => {
                // 找出出错的事务：逐个提交
                log::warn!("batched submission rejected ({}), submitting transactions one by one", err);
                drop(regions);
                for copy in accepted {
                    self.commit_single(copy);
                }
            }
        }
    }

    fn commit_single(&mut self, copy: &StagedCopy) {
        let result = build_copy_regions(&copy.locator, &copy.packet).and_then(|regions| {
            let fence = self.next_fence_value();
            self.device.submit_copies(&regions, fence).map(|()| fence).map_err(UploadError::Device)
        });
        match result {
            Ok(fence) => {
                self.metrics.batches_submitted += 1;
                self.mark_committed(copy.id, fence, copy.bytes);
            }
            Err(err) => self.fail_transaction(copy.id, err),
        }
    }

    /// timeline 已经越过 fence 的事务进入 Completed
    fn retire_committed(&mut self) {
        let completed = self.device.completed_value();
        while let Some(&id) = self.committed.front() {
            let Some(tx) = self.transactions.get_mut(id) else {
                self.committed.pop_front();
                continue;
            };
            if tx.fence > completed {
                break;
            }
            self.committed.pop_front();
            tx.state = TransactionState::Completed;
            tx.marker.complete();
            self.metrics.transactions_completed += 1;
        }
    }

    /// 回收到达终态、并且调用者已经放弃的事务
    fn collect_detached(&mut self) {
        self.transactions
            .retain(|_, tx| !(tx.state.is_terminal() && (tx.detached || !tx.marker.is_shared())));
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        // 资源回到资源池之前，GPU 必须已经完成对它们的拷贝
        if !self.device.wait_value(self.last_fence_value, SHUTDOWN_TIMEOUT) {
            log::warn!("UploadManager dropped while fence {} is still pending", self.last_fence_value);
        }
        let pending = self.pending_count();
        if pending > 0 {
            log::warn!("UploadManager dropped with {} pending transactions", pending);
        }
    }
}

/// packet 的所有子资源到目标资源的拷贝
///
/// - 线性目标：子资源按布局顺序依次写入 locator 的区域
/// - 纹理目标：每个子资源对应同 mip / array 的纹理子资源
fn build_copy_regions<'a>(locator: &ResourceLocator, packet: &'a DataPacket) -> UploadResult<Vec<GfxCopyRegion<'a>>> {
    let resident = packet.make_resident()?;
    let layout = resident.layout();
    let bytes = resident.bytes();

    match &locator.desc().kind {
        BufferKind::Linear(_) => {
            let total = layout.total_size() as u64;
            if total > locator.size() {
                return Err(UploadError::Device(GfxError::CopyOutOfBounds {
                    offset: 0,
                    len: total,
                    size: locator.size(),
                }));
            }
            Ok(layout
                .spans()
                .iter()
                .filter(|span| span.size > 0)
                .map(|span| {
                    GfxCopyRegion::linear(
                        locator.raw(),
                        locator.offset() + span.offset as u64,
                        &bytes[span.offset..span.offset + span.size],
                    )
                })
                .collect())
        }
        BufferKind::Texture(tex) => layout
            .spans()
            .iter()
            .map(|span| {
                let (mip, array) = (span.sub.mip_index(), span.sub.array_index());
                if mip >= tex.mip_count.max(1) || array >= tex.array_count.max(1) {
                    return Err(UploadError::InvalidSubresource { sub: span.sub });
                }
                // 紧密排列的数据至少要覆盖整个子资源
                let required = tex.mip_byte_size(mip).map_err(UploadError::Device)?;
                if span.pitches.is_unspecified() && (span.size as u64) < required {
                    return Err(UploadError::Device(GfxError::CopyOutOfBounds {
                        offset: 0,
                        len: required,
                        size: span.size as u64,
                    }));
                }
                Ok(GfxCopyRegion {
                    dst: locator.raw(),
                    dst_offset: 0,
                    mip_level: mip,
                    array_layer: array,
                    row_pitch: span.pitches.row_pitch,
                    slice_pitch: span.pitches.slice_pitch,
                    data: &bytes[span.offset..span.offset + span.size],
                })
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use streamline_gfx::desc::{BindFlags, TextureDesc};
    use streamline_gfx::host_device::{GfxHostDevice, GfxHostDeviceConfig};

    use super::*;
    use crate::config::LoaderConfig;
    use crate::packet::{SubResource, create_basic_packet, create_empty_packet};
    use crate::pitches::TexturePitches;

    fn manager_with(device_config: GfxHostDeviceConfig, config: UploadConfig) -> (Arc<GfxHostDevice>, UploadManager) {
        let device = Arc::new(GfxHostDevice::new(device_config));
        let manager = UploadManager::new(device.clone(), config).unwrap();
        (device, manager)
    }

    fn small_config() -> UploadConfig {
        UploadConfig {
            loader: LoaderConfig {
                worker_threads: 1,
                queue_capacity: 2,
            },
            ..Default::default()
        }
    }

    fn manager() -> (Arc<GfxHostDevice>, UploadManager) {
        manager_with(GfxHostDeviceConfig::default(), small_config())
    }

    fn read_all(device: &GfxHostDevice, locator: &ResourceLocator) -> Vec<u8> {
        device.read_resource(locator.raw(), locator.offset(), locator.size()).unwrap()
    }

    #[test]
    fn test_immediate_upload() {
        let (device, mut manager) = manager();
        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let desc = BufferDesc::linear(200, BindFlags::VERTEX_BUFFER);

        let done = manager.transaction_immediate(&desc, create_basic_packet(200, Some(&data), TexturePitches::default())).unwrap();
        assert!(done.marker.is_complete());
        assert_eq!(read_all(&device, &done.locator), data);
        assert_eq!(manager.metrics().immediate_transactions, 1);
    }

    #[test]
    fn test_begin_then_update_completes() {
        let (device, mut manager) = manager_with(
            GfxHostDeviceConfig {
                auto_retire: false,
                ..Default::default()
            },
            small_config(),
        );
        let desc = BufferDesc::linear(16, BindFlags::INDEX_BUFFER);
        let (id, marker) = manager.transaction_begin(&desc, create_basic_packet(16, Some(&[3; 16]), TexturePitches::default())).unwrap();
        assert_eq!(manager.state(id), Some(TransactionState::Staged));

        manager.update();
        assert_eq!(manager.state(id), Some(TransactionState::Committed));
        assert!(!marker.is_complete());
        assert!(manager.resource(id).is_none());

        device.retire_all();
        manager.update();
        assert!(marker.is_complete());
        assert!(manager.is_complete(id));
        let locator = manager.resource(id).unwrap();
        assert_eq!(read_all(&device, &locator), vec![3; 16]);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_staged_transactions_share_one_submission() {
        let (device, mut manager) = manager();
        let desc = BufferDesc::linear(64, BindFlags::VERTEX_BUFFER);
        let transactions: Vec<(TransactionId, Marker)> = (0..5)
            .map(|i| manager.transaction_begin(&desc, create_basic_packet(64, Some(&[i; 64]), TexturePitches::default())).unwrap())
            .collect();

        manager.update();
        assert_eq!(device.submission_count(), 1);
        assert_eq!(manager.metrics().batches_submitted, 1);
        for (i, (id, _)) in transactions.iter().enumerate() {
            assert!(manager.is_complete(*id));
            assert_eq!(read_all(&device, &manager.resource(*id).unwrap()), vec![i as u8; 64]);
        }
    }

    #[test]
    fn test_batch_respects_transaction_limit() {
        let (device, mut manager) = manager_with(
            GfxHostDeviceConfig::default(),
            UploadConfig {
                max_transactions_per_batch: 2,
                ..small_config()
            },
        );
        let desc = BufferDesc::linear(64, BindFlags::VERTEX_BUFFER);
        for _ in 0..5 {
            manager.transaction_begin(&desc, create_basic_packet(64, None, TexturePitches::default())).unwrap();
        }
        manager.update();
        assert_eq!(manager.pending_count(), 3);
        manager.update();
        manager.update();
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(device.submission_count(), 3);
    }

    #[test]
    fn test_same_destination_completes_in_order() {
        let (device, mut manager) = manager();
        let desc = BufferDesc::linear(4, BindFlags::VERTEX_BUFFER);
        let target = manager.transaction_immediate(&desc, create_basic_packet(4, None, TexturePitches::default())).unwrap().locator;

        let (first, m1) = manager.transaction_begin_update(&target, create_basic_packet(4, Some(&[1; 4]), TexturePitches::default()));
        let (second, m2) = manager.transaction_begin_update(&target, create_basic_packet(4, Some(&[2; 4]), TexturePitches::default()));

        // 一次 update 只能提交同一目标上的一个事务
        manager.update();
        assert!(m1.is_complete());
        assert!(!m2.is_complete());
        assert_eq!(manager.state(second), Some(TransactionState::Staged));

        manager.update();
        assert!(m2.is_complete());
        assert!(manager.is_complete(first));
        assert_eq!(read_all(&device, &target), vec![2; 4]);
    }

    #[test]
    fn test_wait_zero_on_completed() {
        let (_device, mut manager) = manager();
        let desc = BufferDesc::linear(8, BindFlags::VERTEX_BUFFER);
        let (id, _) = manager.transaction_begin(&desc, create_basic_packet(8, None, TexturePitches::default())).unwrap();
        manager.wait(id, Duration::from_secs(10)).unwrap();

        let start = Instant::now();
        manager.wait(id, Duration::ZERO).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out_while_gpu_is_busy() {
        let (device, mut manager) = manager_with(
            GfxHostDeviceConfig {
                auto_retire: false,
                ..Default::default()
            },
            small_config(),
        );
        let desc = BufferDesc::linear(8, BindFlags::VERTEX_BUFFER);
        let (id, marker) = manager.transaction_begin(&desc, create_basic_packet(8, None, TexturePitches::default())).unwrap();

        let err = manager.wait(id, Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
        assert!(!marker.is_terminal());

        device.retire_all();
        manager.wait(id, Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn test_texture_upload() {
        let (device, mut manager) = manager();
        let tex = TextureDesc::plain_2d(4, 4, vk::Format::R8G8B8A8_UNORM).with_mips(2);
        let desc = BufferDesc::texture(tex, BindFlags::SHADER_RESOURCE);

        let packet = create_empty_packet(&desc).unwrap();
        let done = manager.transaction_immediate(&desc, packet).unwrap();
        assert_eq!(device.read_resource(done.locator.raw(), 0, 80).unwrap(), vec![0; 80]);

        // 只写 mip 0，数据带 row padding
        let mut padded = vec![0u8; 4 * 32];
        for row in 0..4 {
            padded[row * 32..row * 32 + 16].fill(row as u8 + 1);
        }
        let packet = create_basic_packet(padded.len(), Some(&padded), TexturePitches::new(32, 128));
        let (id, _) = manager.transaction_begin_update(&done.locator, packet);
        manager.wait(id, Duration::from_secs(10)).unwrap();

        let mip0 = device.read_resource(done.locator.raw(), 0, 64).unwrap();
        for row in 0..4 {
            assert!(mip0[row * 16..row * 16 + 16].iter().all(|b| *b == row as u8 + 1));
        }
    }

    #[test]
    fn test_packet_larger_than_destination_fails() {
        let (_device, mut manager) = manager();
        let desc = BufferDesc::linear(4, BindFlags::VERTEX_BUFFER);
        let (id, marker) = manager.transaction_begin(&desc, create_basic_packet(8, None, TexturePitches::default())).unwrap();
        assert!(matches!(manager.wait(id, Duration::from_secs(10)), Err(UploadError::Device(_))));
        assert!(marker.is_failed());
        assert_eq!(manager.metrics().transactions_failed, 1);
    }

    #[test]
    fn test_missing_subresource_fails() {
        let (_device, mut manager) = manager();
        let tex = TextureDesc::plain_2d(2, 2, vk::Format::R8G8B8A8_UNORM);
        let bigger = BufferDesc::texture(tex.with_mips(2), BindFlags::SHADER_RESOURCE);
        let packet = create_empty_packet(&bigger).unwrap();
        let desc = BufferDesc::texture(tex, BindFlags::SHADER_RESOURCE);

        let err = manager.transaction_immediate(&desc, packet).unwrap_err();
        assert!(matches!(err, UploadError::InvalidSubresource { sub } if sub == SubResource::tex_sub_res(1, 0)));
    }

    #[test]
    fn test_transaction_end() {
        let (device, mut manager) = manager_with(
            GfxHostDeviceConfig {
                auto_retire: false,
                ..Default::default()
            },
            small_config(),
        );
        let desc = BufferDesc::linear(128 * 1024, BindFlags::VERTEX_BUFFER);
        let (id, marker) = manager.transaction_begin(&desc, create_basic_packet(16, None, TexturePitches::default())).unwrap();
        manager.update();

        // detach 未完成的事务
        manager.transaction_end(id).unwrap();
        assert_eq!(manager.state(id), Some(TransactionState::Committed));

        device.retire_all();
        manager.update();
        assert!(marker.is_complete());
        assert!(manager.state(id).is_none());
        assert!(matches!(manager.transaction_end(id), Err(UploadError::UnknownTransaction(_))));

        // 目标资源回到了资源池
        manager.update();
        assert_eq!(manager.pool_stats().free, 1);
    }

    #[test]
    fn test_discarded_transactions_return_resources() {
        let (device, mut manager) = manager();
        let desc = BufferDesc::linear(128 * 1024, BindFlags::VERTEX_BUFFER);
        for i in 0..4 {
            let _ = manager.transaction_begin(&desc, create_basic_packet(16, Some(&[i; 16]), TexturePitches::default())).unwrap();
        }

        manager.wait_all(Duration::from_secs(10)).unwrap();
        manager.update();
        let stats = manager.pool_stats();
        assert_eq!((stats.live, stats.free), (0, 4));
        assert_eq!(device.resource_count(), 4);
        assert_eq!(manager.metrics().transactions_completed, 4);

        // 空闲资源被新的事务复用
        let (id, marker) = manager.transaction_begin(&desc, create_basic_packet(16, None, TexturePitches::default())).unwrap();
        manager.wait(id, Duration::from_secs(10)).unwrap();
        assert!(marker.is_complete());
        assert_eq!(device.resource_count(), 4);
        assert_eq!(manager.pool_stats().recycle_hits, 1);
    }

    #[test]
    fn test_held_marker_keeps_transaction() {
        let (_device, mut manager) = manager();
        let desc = BufferDesc::linear(128 * 1024, BindFlags::VERTEX_BUFFER);
        let (id, marker) = manager.transaction_begin(&desc, create_basic_packet(16, None, TexturePitches::default())).unwrap();

        for _ in 0..4 {
            manager.update();
        }
        assert!(marker.is_complete());
        assert!(manager.resource(id).is_some());
        assert_eq!(manager.pool_stats().live, 1);

        drop(marker);
        manager.update();
        assert!(manager.state(id).is_none());
        assert_eq!(manager.pool_stats().free, 1);
    }

    #[test]
    fn test_wait_unknown_transaction() {
        let (_device, mut manager) = manager();
        assert!(matches!(
            manager.wait(TransactionId::default(), Duration::ZERO),
            Err(UploadError::UnknownTransaction(_))
        ));
        assert!(!manager.is_complete(TransactionId::default()));
    }
}
