//! GPU 边界层
//!
//! 上传子系统只通过这里的类型和 [`device::GfxDevice`] trait 与设备交互：
//! - [`desc`]: Buffer / Texture 的描述，以及到 Vulkan usage flags 的映射
//! - [`format`]: 格式表 (block 尺寸、每个 block 的字节数)
//! - [`device`]: 设备抽象，timeline 语义的拷贝提交
//! - [`host_device`]: 用 CPU 内存实现的设备，用于工具链与测试

pub mod desc;
pub mod device;
pub mod error;
pub mod format;
pub mod host_device;
