use std::time::Duration;

use slotmap::new_key_type;

use crate::desc::BufferDesc;
use crate::error::GfxResult;

new_key_type! {
    /// 设备资源句柄 (Buffer 或 Image)
    pub struct GfxResourceHandle;
}

/// 一次 CPU -> GPU 的拷贝
///
/// - 线性资源：`data` 写入 `[dst_offset, dst_offset + data.len())`
/// - 纹理资源：`data` 是 (`mip_level`, `array_layer`) 子资源的内容，
///   源数据按照 `row_pitch` / `slice_pitch` 排列，设备负责转换到自己的布局
#[derive(Debug, Clone, Copy)]
pub struct GfxCopyRegion<'a> {
    pub dst: GfxResourceHandle,
    pub dst_offset: u64,
    pub mip_level: u32,
    pub array_layer: u32,
    pub row_pitch: u64,
    pub slice_pitch: u64,
    pub data: &'a [u8],
}

impl<'a> GfxCopyRegion<'a> {
    pub fn linear(dst: GfxResourceHandle, dst_offset: u64, data: &'a [u8]) -> Self {
        Self {
            dst,
            dst_offset,
            mip_level: 0,
            array_layer: 0,
            row_pitch: data.len() as u64,
            slice_pitch: data.len() as u64,
            data,
        }
    }
}

/// 上传子系统所需要的设备能力
///
/// 进度通过 timeline 表示：每次 [`GfxDevice::submit_copies`] 提交都会在完成时把 timeline
/// 推进到 `signal_value`，`signal_value` 必须严格递增。
/// 与 Vulkan 的 timeline semaphore 语义一致：查询不阻塞，等待可以带超时。
///
/// 拷贝只能由持有设备命令权限的线程 (渲染线程) 提交，但实现必须是 `Send + Sync`，
/// 因为资源的创建与销毁也会发生在后台回收路径上。
pub trait GfxDevice: Send + Sync {
    /// 创建资源，内容初始化为 0
    fn create_resource(&self, desc: &BufferDesc, debug_name: &str) -> GfxResult<GfxResourceHandle>;

    fn destroy_resource(&self, handle: GfxResourceHandle);

    /// 资源实际占用的字节数
    fn resource_size(&self, handle: GfxResourceHandle) -> Option<u64>;

    /// 将一批拷贝合并成一次提交，完成时 timeline 到达 `signal_value`
    fn submit_copies(&self, regions: &[GfxCopyRegion<'_>], signal_value: u64) -> GfxResult<()>;

    /// timeline 当前已经完成的值 (非阻塞)
    fn completed_value(&self) -> u64;

    /// 阻塞等待 timeline 到达 `value`，超时返回 false
    fn wait_value(&self, value: u64, timeout: Duration) -> bool;

    /// 读回资源内容，仅用于调试与测试
    fn read_resource(&self, handle: GfxResourceHandle, offset: u64, len: u64) -> GfxResult<Vec<u8>>;
}
