//! DataPacket: 写入 GPU 资源的数据单元
//!
//! 三种来源：
//! - [`BasicPacket`]: 构造时就分配并拷贝好的内存数据
//! - [`FilePacket`]: 文件中的一段字节，延迟读取
//! - [`StreamingTexturePacket`]: 从纹理容器 (DDS / png / jpg ...) 解码出的完整 mip chain
//!
//! 延迟生产的数据只会生产一次，结果 (数据或错误) 之后不可变，可以被多个线程并发读取。

mod aligned;
mod file;
mod layout;
mod streaming;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use streamline_gfx::desc::{BufferDesc, BufferKind, TextureDesc};

pub use aligned::{AlignedBytes, PACKET_ALIGNMENT};
pub use file::FilePacket;
pub use layout::{PacketLayout, SubresourceSpan};
pub use streaming::StreamingTexturePacket;

use crate::error::{UploadError, UploadResult};
use crate::loader::{BackgroundLoader, LoadRequest};
use crate::marker::Marker;
use crate::pitches::TexturePitches;

/// 子资源索引：低 16 位为 mip，高 16 位为 array
///
/// 编码方式与序列化数据中保存的子资源索引保持一致，不能修改
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubResource(pub u32);

impl SubResource {
    #[inline]
    pub const fn tex_sub_res(mip_index: u32, array_index: u32) -> Self {
        Self((mip_index & 0xffff) | (array_index << 16))
    }

    #[inline]
    pub const fn mip_index(self) -> u32 {
        self.0 & 0xffff
    }

    #[inline]
    pub const fn array_index(self) -> u32 {
        self.0 >> 16
    }
}

impl fmt::Display for SubResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(mip {}, array {})", self.mip_index(), self.array_index())
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureLoadFlags: u32 {
        /// 源文件只有 mip 0 时，解码后生成完整的 mip chain
        const GENERATE_MIPMAPS = 1 << 0;
    }
}

/// 已经驻留在内存中的 packet 数据
#[derive(Debug)]
pub struct ResidentData {
    bytes: AlignedBytes,
    layout: PacketLayout,
    texture_desc: Option<TextureDesc>,
}

impl ResidentData {
    pub(crate) fn new(bytes: AlignedBytes, layout: PacketLayout, texture_desc: Option<TextureDesc>) -> Self {
        debug_assert!(layout.total_size() <= bytes.len());
        Self {
            bytes,
            layout,
            texture_desc,
        }
    }

    pub fn data(&self, sub: SubResource) -> UploadResult<&[u8]> {
        let span = self.layout.span(sub)?;
        Ok(&self.bytes[span.offset..span.offset + span.size])
    }

    #[inline]
    pub fn layout(&self) -> &PacketLayout {
        &self.layout
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        self.texture_desc.as_ref()
    }
}

/// 构造时就准备好数据的 packet
#[derive(Debug)]
pub struct BasicPacket {
    resident: ResidentData,
}

impl BasicPacket {
    pub fn new(size: usize, data: Option<&[u8]>, pitches: TexturePitches) -> Self {
        let bytes = match data {
            Some(data) => AlignedBytes::copy_from(size, data),
            None => AlignedBytes::zeroed(size),
        };
        Self {
            resident: ResidentData::new(bytes, PacketLayout::linear(size, pitches), None),
        }
    }
}

/// 数据单元
///
/// 创建后唯一持有；提交给上传事务或后台加载时包装为 [`SharedPacket`] 共享
#[derive(Debug)]
pub enum DataPacket {
    Basic(BasicPacket),
    File(FilePacket),
    StreamingTexture(StreamingTexturePacket),
}

pub type SharedPacket = Arc<DataPacket>;

// 数据访问
impl DataPacket {
    /// 子资源的数据
    ///
    /// 对延迟生产的 packet，如果数据还没有生产，会在当前线程同步生产。
    /// 同一个子资源多次调用返回同一段内存。
    pub fn data(&self, sub: SubResource) -> UploadResult<&[u8]> {
        self.make_resident()?.data(sub)
    }

    pub fn data_size(&self, sub: SubResource) -> UploadResult<usize> {
        match self {
            Self::File(file) => Ok(file.layout().span(sub)?.size),
            _ => Ok(self.make_resident()?.layout().span(sub)?.size),
        }
    }

    pub fn pitches(&self, sub: SubResource) -> UploadResult<TexturePitches> {
        match self {
            Self::File(file) => Ok(file.layout().span(sub)?.resolved_pitches()),
            _ => Ok(self.make_resident()?.layout().span(sub)?.resolved_pitches()),
        }
    }

    /// packet 包含的所有子资源
    pub fn subresources(&self) -> UploadResult<Vec<SubResource>> {
        match self {
            Self::File(file) => Ok(file.layout().subresources().collect()),
            _ => Ok(self.make_resident()?.layout().subresources().collect()),
        }
    }

    /// 解码得到的纹理描述；只有纹理来源且已经驻留时才有
    pub fn texture_desc(&self) -> Option<TextureDesc> {
        match self.resolved() {
            Some(Ok(resident)) => resident.texture_desc().copied(),
            _ => None,
        }
    }
}

// 生产
impl DataPacket {
    fn resident_cell(&self) -> Option<&OnceLock<UploadResult<ResidentData>>> {
        match self {
            Self::Basic(_) => None,
            Self::File(file) => Some(file.resident_cell()),
            Self::StreamingTexture(streaming) => Some(streaming.resident_cell()),
        }
    }

    /// 已经生产过的结果；None 表示尚未生产
    fn resolved(&self) -> Option<Result<&ResidentData, &UploadError>> {
        match self {
            Self::Basic(basic) => Some(Ok(&basic.resident)),
            _ => self.resident_cell().and_then(OnceLock::get).map(Result::as_ref),
        }
    }

    /// 数据是否已经可用
    #[inline]
    pub fn is_resident(&self) -> bool {
        matches!(self.resolved(), Some(Ok(_)))
    }

    /// 是否还需要 (后台) 生产数据
    #[inline]
    pub fn requires_background_load(&self) -> bool {
        self.resolved().is_none()
    }

    /// 在当前线程上生产数据 (如果还没有生产)
    ///
    /// 并发调用时只有一个线程执行生产，其余线程等待同一个结果；
    /// 失败的结果同样会被保留，不会自动重试。
    pub fn make_resident(&self) -> UploadResult<&ResidentData> {
        match self {
            Self::Basic(basic) => Ok(&basic.resident),
            Self::File(file) => file.resident_cell().get_or_init(|| file.produce()).as_ref().map_err(Clone::clone),
            Self::StreamingTexture(streaming) => {
                streaming.resident_cell().get_or_init(|| streaming.produce()).as_ref().map_err(Clone::clone)
            }
        }
    }

    /// 开始后台生产数据，立即返回 Marker
    ///
    /// 数据已经驻留 (或者已经失败) 时返回的 Marker 已经处于终态
    pub fn begin_background_load(self: &Arc<Self>, loader: &BackgroundLoader) -> Marker {
        match self.resolved() {
            Some(Ok(_)) => Marker::completed(),
            Some(Err(err)) => Marker::failed(err.clone()),
            None => {
                let marker = Marker::new();
                loader.request_load(LoadRequest::untracked(self.clone(), marker.clone()));
                marker
            }
        }
    }

    pub fn debug_name(&self) -> String {
        match self {
            Self::Basic(basic) => format!("basic-packet[{} bytes]", basic.resident.bytes.len()),
            Self::File(file) => format!("file-packet[{}]", file.path().display()),
            Self::StreamingTexture(streaming) => format!("texture-packet[{}]", streaming.path().display()),
        }
    }
}

impl From<BasicPacket> for DataPacket {
    fn from(packet: BasicPacket) -> Self {
        Self::Basic(packet)
    }
}

/// 创建内存数据 packet
///
/// 拷贝 `data` 的前 `size` 个字节，`data` 为 None 或者不足 `size` 时剩余部分填 0
pub fn create_basic_packet(size: usize, data: Option<&[u8]>, pitches: TexturePitches) -> DataPacket {
    DataPacket::Basic(BasicPacket::new(size, data, pitches))
}

/// 由 POD 切片创建内存数据 packet (顶点、索引、结构体数组)
pub fn create_basic_packet_from<T: bytemuck::Pod>(items: &[T]) -> DataPacket {
    let bytes: &[u8] = bytemuck::cast_slice(items);
    create_basic_packet(bytes.len(), Some(bytes), TexturePitches::default())
}

/// 按照资源描述创建全 0 的 packet
///
/// 纹理描述会得到包含所有 mip / array 子资源的布局
pub fn create_empty_packet(desc: &BufferDesc) -> UploadResult<DataPacket> {
    match &desc.kind {
        BufferKind::Linear(linear) => Ok(create_basic_packet(
            linear.size_in_bytes as usize,
            None,
            TexturePitches::default(),
        )),
        BufferKind::Texture(tex) => {
            let layout = PacketLayout::texture(tex).map_err(UploadError::Device)?;
            let bytes = AlignedBytes::zeroed(layout.total_size());
            Ok(DataPacket::Basic(BasicPacket {
                resident: ResidentData::new(bytes, layout, Some(*tex)),
            }))
        }
    }
}

/// 创建文件数据源：文件中 `[offset, offset + size)` 的字节，在后台或首次访问时读取
pub fn create_file_data_source(
    path: impl AsRef<Path>,
    offset: u64,
    size: usize,
    pitches: TexturePitches,
) -> DataPacket {
    DataPacket::File(FilePacket::new(path.as_ref().to_path_buf(), offset, size, pitches))
}

/// 创建纹理流式数据源，在后台或首次访问时解码
pub fn create_streaming_texture_source(path: impl AsRef<Path>, flags: TextureLoadFlags) -> DataPacket {
    DataPacket::StreamingTexture(StreamingTexturePacket::new(path.as_ref().to_path_buf(), flags))
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use streamline_gfx::desc::BindFlags;

    use super::*;

    #[test]
    fn test_tex_sub_res_packing() {
        assert_eq!(SubResource::tex_sub_res(0, 0).0, 0);
        assert_eq!(SubResource::tex_sub_res(3, 2).0, 3 | (2 << 16));
        // mip 只保留低 16 位
        assert_eq!(SubResource::tex_sub_res(0x1_0005, 1).0, 5 | (1 << 16));

        let sub = SubResource::tex_sub_res(7, 11);
        assert_eq!(sub.mip_index(), 7);
        assert_eq!(sub.array_index(), 11);
    }

    #[test]
    fn test_tex_sub_res_is_injective() {
        let mut seen = std::collections::HashSet::new();
        for mip in 0..16 {
            for array in 0..16 {
                let sub = SubResource::tex_sub_res(mip, array);
                assert_eq!(sub.0, (mip & 0xffff) | (array << 16));
                assert!(seen.insert(sub));
            }
        }
        for (mip, array) in [(0xffff, 0), (0, 0xffff), (0xffff, 0xffff)] {
            let sub = SubResource::tex_sub_res(mip, array);
            assert_eq!((sub.mip_index(), sub.array_index()), (mip, array));
        }
    }

    #[test]
    fn test_basic_packet_is_stable() {
        let source: Vec<u8> = (0..64).collect();
        let packet = create_basic_packet(64, Some(&source), TexturePitches::default());

        let first = packet.data(SubResource::default()).unwrap();
        let second = packet.data(SubResource::default()).unwrap();
        assert_eq!(first, &source[..]);
        assert_eq!(first.as_ptr(), second.as_ptr());
        assert_eq!(first.as_ptr() as usize % PACKET_ALIGNMENT, 0);
        assert_eq!(packet.data_size(SubResource::default()).unwrap(), 64);
        assert!(packet.is_resident());
        assert!(!packet.requires_background_load());
    }

    #[test]
    fn test_basic_packet_without_data_is_zero() {
        let packet = create_basic_packet(33, None, TexturePitches::default());
        assert!(packet.data(SubResource::default()).unwrap().iter().all(|b| *b == 0));
        // 线性数据的 pitch 等于大小
        assert_eq!(packet.pitches(SubResource::default()).unwrap(), TexturePitches::linear(33));
    }

    #[test]
    fn test_basic_packet_keeps_explicit_pitches() {
        let packet = create_basic_packet(64, None, TexturePitches::new(16, 64));
        assert_eq!(packet.pitches(SubResource::default()).unwrap(), TexturePitches::new(16, 64));
    }

    #[test]
    fn test_basic_packet_rejects_other_subresources() {
        let packet = create_basic_packet(4, None, TexturePitches::default());
        let sub = SubResource::tex_sub_res(1, 0);
        assert!(matches!(packet.data(sub), Err(UploadError::InvalidSubresource { sub: s }) if s == sub));
        assert!(packet.data_size(SubResource::tex_sub_res(0, 1)).is_err());
    }

    #[test]
    fn test_packet_from_pod() {
        let indices: [u16; 3] = [0, 1, 2];
        let packet = create_basic_packet_from(&indices);
        assert_eq!(packet.data(SubResource::default()).unwrap(), &[0, 0, 1, 0, 2, 0]);
    }

    #[test]
    fn test_empty_linear_packet() {
        let packet = create_empty_packet(&BufferDesc::linear(1024, BindFlags::VERTEX_BUFFER)).unwrap();
        let data = packet.data(SubResource::default()).unwrap();
        assert_eq!(data.len(), 1024);
        assert!(data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_empty_texture_packet_has_all_subresources() {
        let tex = TextureDesc::plain_2d(4, 4, vk::Format::R8G8B8A8_UNORM).with_mips(3).with_array_count(2);
        let packet = create_empty_packet(&BufferDesc::texture(tex, BindFlags::SHADER_RESOURCE)).unwrap();
        let subs = packet.subresources().unwrap();
        assert_eq!(subs.len(), 6);
        assert_eq!(packet.data_size(SubResource::tex_sub_res(1, 1)).unwrap(), 16);
        assert_eq!(packet.pitches(SubResource::tex_sub_res(0, 0)).unwrap(), TexturePitches::new(16, 64));
        assert_eq!(packet.texture_desc(), Some(tex));
    }

    #[test]
    fn test_empty_packet_with_unsupported_format() {
        let tex = TextureDesc::plain_2d(4, 4, vk::Format::ASTC_4X4_UNORM_BLOCK);
        assert!(matches!(
            create_empty_packet(&BufferDesc::texture(tex, BindFlags::SHADER_RESOURCE)),
            Err(UploadError::Device(_))
        ));
    }
}
