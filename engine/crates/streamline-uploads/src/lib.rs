//! GPU 资源上传子系统
//!
//! CPU 端的数据 ([`packet::DataPacket`]) 通过上传事务 ([`manager::UploadManager`]) 写入 GPU 资源：
//! - 数据需要后台生产 (读文件、解码纹理) 时交给 [`loader::BackgroundLoader`]
//! - 目标资源由 [`pool::ResourcePool`] 分配或回收
//! - 完成状态通过 [`marker::Marker`] 观察
//!
//! 拷贝命令只在拥有 [`manager::UploadManager`] 的线程 (渲染线程) 上提交，
//! 后台线程只负责生产数据。

pub mod config;
pub mod error;
pub mod loader;
pub mod manager;
pub mod marker;
pub mod packet;
pub mod pitches;
pub mod pool;
pub mod texture_format;

pub use packet::{
    DataPacket, SharedPacket, SubResource, TextureLoadFlags, create_basic_packet, create_basic_packet_from,
    create_empty_packet, create_file_data_source, create_streaming_texture_source,
};
pub use texture_format::load_texture_format;
