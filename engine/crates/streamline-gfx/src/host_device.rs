use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use slotmap::SlotMap;

use crate::desc::{BufferDesc, BufferKind};
use crate::device::{GfxCopyRegion, GfxDevice, GfxResourceHandle};
use crate::error::{GfxError, GfxResult};

#[derive(Debug, Clone, Copy)]
pub struct GfxHostDeviceConfig {
    /// 可分配的最大字节数，None 表示不限制
    pub memory_budget: Option<u64>,
    /// true: 提交后立即完成；false: 需要调用 [`GfxHostDevice::retire_to`] 推进 timeline，
    /// 用来模拟 GPU 的执行延迟
    pub auto_retire: bool,
}

impl Default for GfxHostDeviceConfig {
    fn default() -> Self {
        Self {
            memory_budget: None,
            auto_retire: true,
        }
    }
}

struct HostResource {
    desc: BufferDesc,
    bytes: Vec<u8>,
    #[allow(dead_code)]
    debug_name: String,
}

#[derive(Default)]
struct HostResources {
    pool: SlotMap<GfxResourceHandle, HostResource>,
    allocated_bytes: u64,
}

#[derive(Default)]
struct HostTimeline {
    /// 最后一次提交的 signal 值
    submitted: u64,
    /// 已经完成的值
    completed: u64,
}

/// 一段待写入的拷贝：先全部校验，再统一写入
struct CopySpan {
    dst: GfxResourceHandle,
    dst_offset: usize,
    src_offset: usize,
    len: usize,
}

/// 用 CPU 内存实现的设备
///
/// 拷贝在提交时立即写入内存；timeline 的推进可以是自动的，也可以手动控制，
/// 从而在没有 GPU 的环境 (工具链、测试) 中复现 "GPU 仍在使用资源" 的情况。
pub struct GfxHostDevice {
    config: GfxHostDeviceConfig,
    resources: Mutex<HostResources>,

    timeline: Mutex<HostTimeline>,
    timeline_cond: Condvar,

    submission_count: AtomicU64,
    region_count: AtomicU64,
}

impl Default for GfxHostDevice {
    fn default() -> Self {
        Self::new(GfxHostDeviceConfig::default())
    }
}

// new & init
impl GfxHostDevice {
    pub fn new(config: GfxHostDeviceConfig) -> Self {
        Self {
            config,
            resources: Mutex::new(HostResources::default()),
            timeline: Mutex::new(HostTimeline::default()),
            timeline_cond: Condvar::new(),
            submission_count: AtomicU64::new(0),
            region_count: AtomicU64::new(0),
        }
    }
}

// timeline 控制
impl GfxHostDevice {
    /// 将 timeline 推进到 `value`，不会超过已经提交的值
    pub fn retire_to(&self, value: u64) {
        let mut timeline = self.timeline.lock();
        let target = value.min(timeline.submitted);
        if target > timeline.completed {
            timeline.completed = target;
            self.timeline_cond.notify_all();
        }
    }

    /// 完成所有已提交的工作
    pub fn retire_all(&self) {
        let mut timeline = self.timeline.lock();
        timeline.completed = timeline.submitted;
        self.timeline_cond.notify_all();
    }

    #[inline]
    pub fn submitted_value(&self) -> u64 {
        self.timeline.lock().submitted
    }
}

// getters
impl GfxHostDevice {
    #[inline]
    pub fn submission_count(&self) -> u64 {
        self.submission_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn region_count(&self) -> u64 {
        self.region_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn resource_count(&self) -> usize {
        self.resources.lock().pool.len()
    }

    #[inline]
    pub fn allocated_bytes(&self) -> u64 {
        self.resources.lock().allocated_bytes
    }
}

// tools
impl GfxHostDevice {
    fn plan_region(resources: &HostResources, region: &GfxCopyRegion<'_>) -> GfxResult<Vec<CopySpan>> {
        let resource = resources.pool.get(region.dst).ok_or(GfxError::InvalidHandle(region.dst))?;
        let dst_size = resource.bytes.len() as u64;

        match &resource.desc.kind {
            BufferKind::Linear(_) => {
                let len = region.data.len() as u64;
                if region.dst_offset + len > dst_size {
                    return Err(GfxError::CopyOutOfBounds {
                        offset: region.dst_offset,
                        len,
                        size: dst_size,
                    });
                }
                Ok(vec![CopySpan {
                    dst: region.dst,
                    dst_offset: region.dst_offset as usize,
                    src_offset: 0,
                    len: region.data.len(),
                }])
            }
            BufferKind::Texture(tex) => {
                let base = tex.subresource_offset(region.mip_level, region.array_layer)?.ok_or(
                    GfxError::InvalidSubresource {
                        handle: region.dst,
                        mip: region.mip_level,
                        layer: region.array_layer,
                    },
                )?;

                let info = tex.format_info()?;
                let extent = tex.mip_extent(region.mip_level);
                let tight_row = info.row_pitch(extent.width);
                let row_count = info.row_count(extent.height);

                // pitch 为 0 表示源数据紧密排列
                let src_row_pitch = if region.row_pitch == 0 { tight_row } else { region.row_pitch };
                let src_slice_pitch = if region.slice_pitch == 0 {
                    src_row_pitch.saturating_mul(row_count)
                } else {
                    region.slice_pitch
                };

                let mut spans = Vec::with_capacity((row_count * extent.depth as u64) as usize);
                for z in 0..extent.depth as u64 {
                    for row in 0..row_count {
                        // 溢出的偏移一定超出了源数据
                        let src_offset = z.saturating_mul(src_slice_pitch).saturating_add(row.saturating_mul(src_row_pitch));
                        if src_offset.saturating_add(tight_row) > region.data.len() as u64 {
                            return Err(GfxError::CopyOutOfBounds {
                                offset: src_offset,
                                len: tight_row,
                                size: region.data.len() as u64,
                            });
                        }
                        let dst_offset = base + (z * row_count + row) * tight_row;
                        spans.push(CopySpan {
                            dst: region.dst,
                            dst_offset: dst_offset as usize,
                            src_offset: src_offset as usize,
                            len: tight_row as usize,
                        });
                    }
                }
                Ok(spans)
            }
        }
    }
}

impl GfxDevice for GfxHostDevice {
    fn create_resource(&self, desc: &BufferDesc, debug_name: &str) -> GfxResult<GfxResourceHandle> {
        let size = desc.byte_count()?;
        let mut resources = self.resources.lock();

        if let Some(budget) = self.config.memory_budget
            && resources.allocated_bytes + size > budget
        {
            return Err(GfxError::OutOfMemory {
                requested: size,
                available: budget.saturating_sub(resources.allocated_bytes),
            });
        }

        resources.allocated_bytes += size;
        let handle = resources.pool.insert(HostResource {
            desc: *desc,
            bytes: vec![0; size as usize],
            debug_name: debug_name.to_string(),
        });
        log::debug!("host device: create resource {:?} '{}' ({} bytes)", handle, debug_name, size);
        Ok(handle)
    }

    fn destroy_resource(&self, handle: GfxResourceHandle) {
        let mut resources = self.resources.lock();
        match resources.pool.remove(handle) {
            Some(resource) => {
                resources.allocated_bytes -= resource.bytes.len() as u64;
                log::debug!("host device: destroy resource {:?}", handle);
            }
            None => log::warn!("host device: destroy of unknown resource {:?}", handle),
        }
    }

    fn resource_size(&self, handle: GfxResourceHandle) -> Option<u64> {
        self.resources.lock().pool.get(handle).map(|res| res.bytes.len() as u64)
    }

    fn submit_copies(&self, regions: &[GfxCopyRegion<'_>], signal_value: u64) -> GfxResult<()> {
        let _span = tracy_client::span!("GfxHostDevice::submit_copies");

        let mut timeline = self.timeline.lock();
        if signal_value <= timeline.submitted {
            return Err(GfxError::NonMonotonicSignal {
                signal: signal_value,
                last: timeline.submitted,
            });
        }

        {
            let mut resources = self.resources.lock();
            let plans = regions
                .iter()
                .map(|region| Self::plan_region(&resources, region))
                .collect::<GfxResult<Vec<_>>>()?;

            for (region, spans) in regions.iter().zip(plans) {
                for span in spans {
                    // plan 阶段已经校验过 handle 与边界
                    if let Some(resource) = resources.pool.get_mut(span.dst) {
                        resource.bytes[span.dst_offset..span.dst_offset + span.len]
                            .copy_from_slice(&region.data[span.src_offset..span.src_offset + span.len]);
                    }
                }
            }
        }

        timeline.submitted = signal_value;
        if self.config.auto_retire {
            timeline.completed = signal_value;
            self.timeline_cond.notify_all();
        }

        self.submission_count.fetch_add(1, Ordering::Relaxed);
        self.region_count.fetch_add(regions.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.timeline.lock().completed
    }

    fn wait_value(&self, value: u64, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut timeline = self.timeline.lock();
        while timeline.completed < value {
            match deadline {
                Some(deadline) => {
                    if self.timeline_cond.wait_until(&mut timeline, deadline).timed_out() {
                        return timeline.completed >= value;
                    }
                }
                None => self.timeline_cond.wait(&mut timeline),
            }
        }
        true
    }

    fn read_resource(&self, handle: GfxResourceHandle, offset: u64, len: u64) -> GfxResult<Vec<u8>> {
        let resources = self.resources.lock();
        let resource = resources.pool.get(handle).ok_or(GfxError::InvalidHandle(handle))?;
        let size = resource.bytes.len() as u64;
        if offset + len > size {
            return Err(GfxError::CopyOutOfBounds { offset, len, size });
        }
        Ok(resource.bytes[offset as usize..(offset + len) as usize].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::desc::{BindFlags, TextureDesc};

    #[test]
    fn test_resources_are_zero_initialized() {
        let device = GfxHostDevice::default();
        let handle = device.create_resource(&BufferDesc::linear(32, BindFlags::VERTEX_BUFFER), "zero").unwrap();
        assert_eq!(device.resource_size(handle), Some(32));
        assert_eq!(device.read_resource(handle, 0, 32).unwrap(), vec![0; 32]);
    }

    #[test]
    fn test_budget_reports_out_of_memory() {
        let device = GfxHostDevice::new(GfxHostDeviceConfig {
            memory_budget: Some(100),
            auto_retire: true,
        });
        let desc = BufferDesc::linear(64, BindFlags::VERTEX_BUFFER);
        let first = device.create_resource(&desc, "a").unwrap();
        assert_eq!(
            device.create_resource(&desc, "b"),
            Err(GfxError::OutOfMemory {
                requested: 64,
                available: 36
            })
        );
        device.destroy_resource(first);
        assert!(device.create_resource(&desc, "c").is_ok());
    }

    #[test]
    fn test_texture_copy_strips_row_padding() {
        let device = GfxHostDevice::default();
        let tex = TextureDesc::plain_2d(2, 2, vk::Format::R8_UNORM).with_mips(2);
        let handle = device.create_resource(&BufferDesc::texture(tex, BindFlags::SHADER_RESOURCE), "tex").unwrap();

        // 每行 4 字节 pitch，实际只有 2 字节有效
        let mip0 = [1u8, 2, 0xAA, 0xAA, 3, 4, 0xAA, 0xAA];
        let region = GfxCopyRegion {
            dst: handle,
            dst_offset: 0,
            mip_level: 0,
            array_layer: 0,
            row_pitch: 4,
            slice_pitch: 8,
            data: &mip0,
        };
        let mip1 = [9u8];
        let region1 = GfxCopyRegion {
            mip_level: 1,
            row_pitch: 0,
            slice_pitch: 0,
            data: &mip1,
            ..region
        };
        device.submit_copies(&[region, region1], 1).unwrap();

        assert_eq!(device.read_resource(handle, 0, 5).unwrap(), vec![1, 2, 3, 4, 9]);
        assert_eq!(device.submission_count(), 1);
        assert_eq!(device.region_count(), 2);
    }

    #[test]
    fn test_huge_pitch_is_out_of_bounds() {
        let device = GfxHostDevice::default();
        let tex = TextureDesc::plain_2d(2, 2, vk::Format::R8_UNORM);
        let handle = device.create_resource(&BufferDesc::texture(tex, BindFlags::SHADER_RESOURCE), "tex").unwrap();

        let data = [0u8; 4];
        let region = GfxCopyRegion {
            dst: handle,
            dst_offset: 0,
            mip_level: 0,
            array_layer: 0,
            row_pitch: u64::MAX,
            slice_pitch: 0,
            data: &data,
        };
        assert!(matches!(device.submit_copies(&[region], 1), Err(GfxError::CopyOutOfBounds { .. })));
    }

    #[test]
    fn test_failed_validation_writes_nothing() {
        let device = GfxHostDevice::default();
        let handle = device.create_resource(&BufferDesc::linear(4, BindFlags::VERTEX_BUFFER), "small").unwrap();
        let ok = [7u8; 4];
        let too_big = [1u8; 8];
        let result = device.submit_copies(
            &[GfxCopyRegion::linear(handle, 0, &ok), GfxCopyRegion::linear(handle, 0, &too_big)],
            1,
        );
        assert!(matches!(result, Err(GfxError::CopyOutOfBounds { .. })));
        assert_eq!(device.read_resource(handle, 0, 4).unwrap(), vec![0; 4]);
        assert_eq!(device.submitted_value(), 0);
    }

    #[test]
    fn test_manual_timeline() {
        let device = GfxHostDevice::new(GfxHostDeviceConfig {
            memory_budget: None,
            auto_retire: false,
        });
        let handle = device.create_resource(&BufferDesc::linear(4, BindFlags::VERTEX_BUFFER), "buf").unwrap();
        let data = [1u8; 4];
        device.submit_copies(&[GfxCopyRegion::linear(handle, 0, &data)], 1).unwrap();
        device.submit_copies(&[GfxCopyRegion::linear(handle, 0, &data)], 2).unwrap();

        assert_eq!(device.completed_value(), 0);
        assert!(!device.wait_value(1, Duration::ZERO));

        device.retire_to(1);
        assert_eq!(device.completed_value(), 1);
        assert!(device.wait_value(1, Duration::ZERO));

        // 不能超过已提交的值
        device.retire_to(10);
        assert_eq!(device.completed_value(), 2);

        assert_eq!(
            device.submit_copies(&[], 2),
            Err(GfxError::NonMonotonicSignal { signal: 2, last: 2 })
        );
    }

    #[test]
    fn test_wait_is_woken_by_retire() {
        let device = std::sync::Arc::new(GfxHostDevice::new(GfxHostDeviceConfig {
            memory_budget: None,
            auto_retire: false,
        }));
        device.submit_copies(&[], 1).unwrap();

        let retirer = {
            let device = device.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                device.retire_all();
            })
        };
        assert!(device.wait_value(1, Duration::from_secs(5)));
        retirer.join().unwrap();
    }
}
