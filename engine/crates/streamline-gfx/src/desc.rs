use ash::vk;

use crate::error::{GfxError, GfxResult};
use crate::format::FormatInfo;

bitflags::bitflags! {
    /// 资源的绑定方式，决定创建时的 usage
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const CONSTANT_BUFFER = 1 << 2;
        const SHADER_RESOURCE = 1 << 3;
        const UNORDERED_ACCESS = 1 << 4;
        const STRUCTURED_BUFFER = 1 << 5;
        const RENDER_TARGET = 1 << 6;
        const DEPTH_STENCIL = 1 << 7;
        const TRANSFER_SRC = 1 << 8;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CpuAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// 每帧都会重写的数据 (例如 constant buffer)
        const WRITE_DYNAMIC = 1 << 2;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GpuAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimensionality {
    Tex1D,
    Tex2D,
    Tex3D,
    CubeMap,
}

/// 线性 Buffer 的描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinearBufferDesc {
    pub size_in_bytes: vk::DeviceSize,
    /// structured buffer 中每个元素的字节数，非 structured buffer 为 0
    pub structure_byte_size: u32,
}

/// 纹理描述
///
/// 子资源在内存中按照 array 优先、mip 其次的顺序紧密排列：
/// `[array0: mip0, mip1, ...][array1: mip0, mip1, ...]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: vk::Format,
    pub dimensionality: TextureDimensionality,
    pub mip_count: u32,
    pub array_count: u32,
}

// new & init
impl TextureDesc {
    pub fn plain_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            depth: 1,
            format,
            dimensionality: TextureDimensionality::Tex2D,
            mip_count: 1,
            array_count: 1,
        }
    }

    pub fn plain_3d(width: u32, height: u32, depth: u32, format: vk::Format) -> Self {
        Self {
            depth,
            dimensionality: TextureDimensionality::Tex3D,
            ..Self::plain_2d(width, height, format)
        }
    }

    pub fn cube_map(size: u32, format: vk::Format) -> Self {
        Self {
            dimensionality: TextureDimensionality::CubeMap,
            array_count: 6,
            ..Self::plain_2d(size, size, format)
        }
    }

    #[inline]
    pub fn with_mips(mut self, mip_count: u32) -> Self {
        self.mip_count = mip_count.max(1);
        self
    }

    #[inline]
    pub fn with_full_mip_chain(self) -> Self {
        let mip_count = self.full_mip_chain_count();
        self.with_mips(mip_count)
    }

    #[inline]
    pub fn with_array_count(mut self, array_count: u32) -> Self {
        self.array_count = array_count.max(1);
        self
    }
}
// tools
impl TextureDesc {
    /// 完整 mip chain 的层数: floor(log2(max_dim)) + 1
    pub fn full_mip_chain_count(&self) -> u32 {
        let max_dim = self.width.max(self.height).max(self.depth).max(1);
        32 - max_dim.leading_zeros()
    }

    /// `mip` 超出 32 时各维度都是 1
    pub fn mip_extent(&self, mip: u32) -> vk::Extent3D {
        let shrink = |dim: u32| dim.checked_shr(mip).unwrap_or(0).max(1);
        vk::Extent3D {
            width: shrink(self.width),
            height: shrink(self.height),
            depth: shrink(self.depth),
        }
    }

    #[inline]
    pub fn format_info(&self) -> GfxResult<FormatInfo> {
        FormatInfo::of(self.format)
    }

    fn overflow(&self) -> GfxError {
        GfxError::SizeOverflow(format!(
            "{}x{}x{} {:?}, {} mips, {} layers",
            self.width, self.height, self.depth, self.format, self.mip_count, self.array_count
        ))
    }

    pub fn row_pitch(&self, mip: u32) -> GfxResult<u64> {
        Ok(self.format_info()?.row_pitch(self.mip_extent(mip).width))
    }

    /// 一个深度切片的字节数
    pub fn slice_pitch(&self, mip: u32) -> GfxResult<u64> {
        let info = self.format_info()?;
        let extent = self.mip_extent(mip);
        info.row_pitch(extent.width)
            .checked_mul(info.row_count(extent.height))
            .ok_or_else(|| self.overflow())
    }

    /// 单个子资源 (一个 mip，一个 array layer) 的字节数，包含所有深度切片
    pub fn mip_byte_size(&self, mip: u32) -> GfxResult<u64> {
        self.slice_pitch(mip)?
            .checked_mul(self.mip_extent(mip).depth as u64)
            .ok_or_else(|| self.overflow())
    }

    /// 一个 array layer 的完整 mip chain 字节数
    pub fn layer_byte_size(&self) -> GfxResult<u64> {
        (0..self.mip_count.max(1)).try_fold(0u64, |total, mip| {
            total.checked_add(self.mip_byte_size(mip)?).ok_or_else(|| self.overflow())
        })
    }

    pub fn byte_count(&self) -> GfxResult<u64> {
        self.layer_byte_size()?
            .checked_mul(self.array_count.max(1) as u64)
            .ok_or_else(|| self.overflow())
    }

    /// 子资源在紧密排列的内存中的偏移；越界时返回 None
    pub fn subresource_offset(&self, mip: u32, array_layer: u32) -> GfxResult<Option<u64>> {
        if mip >= self.mip_count.max(1) || array_layer >= self.array_count.max(1) {
            return Ok(None);
        }
        let mut offset = self
            .layer_byte_size()?
            .checked_mul(array_layer as u64)
            .ok_or_else(|| self.overflow())?;
        for m in 0..mip {
            offset = offset.checked_add(self.mip_byte_size(m)?).ok_or_else(|| self.overflow())?;
        }
        Ok(Some(offset))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Linear(LinearBufferDesc),
    Texture(TextureDesc),
}

/// 完整描述一个 GPU 资源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub kind: BufferKind,
    pub bind_flags: BindFlags,
    pub cpu_access: CpuAccess,
    pub gpu_access: GpuAccess,
}

// new & init
impl BufferDesc {
    pub fn linear(size_in_bytes: vk::DeviceSize, bind_flags: BindFlags) -> Self {
        Self {
            kind: BufferKind::Linear(LinearBufferDesc {
                size_in_bytes,
                structure_byte_size: 0,
            }),
            bind_flags,
            cpu_access: CpuAccess::empty(),
            gpu_access: GpuAccess::READ,
        }
    }

    pub fn structured(element_count: u32, stride: u32, bind_flags: BindFlags) -> Self {
        Self {
            kind: BufferKind::Linear(LinearBufferDesc {
                size_in_bytes: element_count as u64 * stride as u64,
                structure_byte_size: stride,
            }),
            bind_flags: bind_flags | BindFlags::STRUCTURED_BUFFER,
            cpu_access: CpuAccess::empty(),
            gpu_access: GpuAccess::READ | GpuAccess::WRITE,
        }
    }

    pub fn texture(desc: TextureDesc, bind_flags: BindFlags) -> Self {
        Self {
            kind: BufferKind::Texture(desc),
            bind_flags,
            cpu_access: CpuAccess::empty(),
            gpu_access: GpuAccess::READ,
        }
    }

    #[inline]
    pub fn with_cpu_access(mut self, cpu_access: CpuAccess) -> Self {
        self.cpu_access = cpu_access;
        self
    }

    #[inline]
    pub fn with_gpu_access(mut self, gpu_access: GpuAccess) -> Self {
        self.gpu_access = gpu_access;
        self
    }
}
// getters
impl BufferDesc {
    #[inline]
    pub fn is_texture(&self) -> bool {
        matches!(self.kind, BufferKind::Texture(_))
    }

    #[inline]
    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        match &self.kind {
            BufferKind::Texture(tex) => Some(tex),
            BufferKind::Linear(_) => None,
        }
    }

    #[inline]
    pub fn linear_desc(&self) -> Option<&LinearBufferDesc> {
        match &self.kind {
            BufferKind::Linear(linear) => Some(linear),
            BufferKind::Texture(_) => None,
        }
    }

    /// 资源占用的总字节数
    pub fn byte_count(&self) -> GfxResult<u64> {
        match &self.kind {
            BufferKind::Linear(linear) => Ok(linear.size_in_bytes),
            BufferKind::Texture(tex) => tex.byte_count(),
        }
    }
}
// vulkan usage
impl BufferDesc {
    /// 映射到 Buffer usage，总是包含 TRANSFER_DST 以便上传
    pub fn vk_buffer_usage(&self) -> vk::BufferUsageFlags {
        let mut usage = vk::BufferUsageFlags::TRANSFER_DST;
        let flags = self.bind_flags;
        if flags.contains(BindFlags::VERTEX_BUFFER) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if flags.contains(BindFlags::INDEX_BUFFER) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if flags.contains(BindFlags::CONSTANT_BUFFER) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if flags.intersects(BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS | BindFlags::STRUCTURED_BUFFER) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if flags.contains(BindFlags::TRANSFER_SRC) {
            usage |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        usage
    }

    /// 映射到 Image usage，总是包含 TRANSFER_DST 以便上传
    pub fn vk_image_usage(&self) -> vk::ImageUsageFlags {
        let mut usage = vk::ImageUsageFlags::TRANSFER_DST;
        let flags = self.bind_flags;
        if flags.contains(BindFlags::SHADER_RESOURCE) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if flags.contains(BindFlags::UNORDERED_ACCESS) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        if flags.contains(BindFlags::RENDER_TARGET) {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if flags.contains(BindFlags::DEPTH_STENCIL) {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if flags.contains(BindFlags::TRANSFER_SRC) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        usage
    }
}
