use ash::vk;

use crate::error::{GfxError, GfxResult};

/// 格式的内存布局信息
///
/// 非压缩格式的 block 为 1x1；BCn 压缩格式的 block 为 4x4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub block_width: u32,
    pub block_height: u32,
    pub bytes_per_block: u32,
}

impl FormatInfo {
    const fn texel(bytes: u32) -> Self {
        Self {
            block_width: 1,
            block_height: 1,
            bytes_per_block: bytes,
        }
    }

    const fn block4x4(bytes: u32) -> Self {
        Self {
            block_width: 4,
            block_height: 4,
            bytes_per_block: bytes,
        }
    }

    /// 查询格式信息，不支持的格式返回 [`GfxError::UnsupportedFormat`]
    pub fn of(format: vk::Format) -> GfxResult<Self> {
        format_info(format).ok_or(GfxError::UnsupportedFormat(format))
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.block_width > 1 || self.block_height > 1
    }

    /// 一行 block 的字节数
    #[inline]
    pub fn row_pitch(&self, width: u32) -> u64 {
        width.max(1).div_ceil(self.block_width) as u64 * self.bytes_per_block as u64
    }

    /// 高度方向 block 的行数
    #[inline]
    pub fn row_count(&self, height: u32) -> u64 {
        height.max(1).div_ceil(self.block_height) as u64
    }
}

pub fn format_info(format: vk::Format) -> Option<FormatInfo> {
    let info = match format {
        // 8 bit
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SINT => {
            FormatInfo::texel(1)
        }
        // 16 bit
        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R8G8_UINT
        | vk::Format::R16_UNORM
        | vk::Format::R16_UINT
        | vk::Format::R16_SFLOAT
        | vk::Format::D16_UNORM => FormatInfo::texel(2),
        // 32 bit
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R16G16_UNORM
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => FormatInfo::texel(4),
        // 64 bit
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R32G32_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => FormatInfo::texel(8),
        // 96 / 128 bit
        vk::Format::R32G32B32_SFLOAT | vk::Format::R32G32B32_UINT => FormatInfo::texel(12),
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => FormatInfo::texel(16),

        // BCn: BC1 / BC4 每个 4x4 block 8 字节，其余 16 字节
        vk::Format::BC1_RGB_UNORM_BLOCK
        | vk::Format::BC1_RGB_SRGB_BLOCK
        | vk::Format::BC1_RGBA_UNORM_BLOCK
        | vk::Format::BC1_RGBA_SRGB_BLOCK
        | vk::Format::BC4_UNORM_BLOCK
        | vk::Format::BC4_SNORM_BLOCK => FormatInfo::block4x4(8),
        vk::Format::BC2_UNORM_BLOCK
        | vk::Format::BC2_SRGB_BLOCK
        | vk::Format::BC3_UNORM_BLOCK
        | vk::Format::BC3_SRGB_BLOCK
        | vk::Format::BC5_UNORM_BLOCK
        | vk::Format::BC5_SNORM_BLOCK
        | vk::Format::BC6H_UFLOAT_BLOCK
        | vk::Format::BC6H_SFLOAT_BLOCK
        | vk::Format::BC7_UNORM_BLOCK
        | vk::Format::BC7_SRGB_BLOCK => FormatInfo::block4x4(16),

        _ => return None,
    };
    Some(info)
}

#[inline]
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed_pitch() {
        let info = FormatInfo::of(vk::Format::R8G8B8A8_UNORM).unwrap();
        assert!(!info.is_compressed());
        assert_eq!(info.row_pitch(13), 52);
        assert_eq!(info.row_count(7), 7);
    }

    #[test]
    fn test_block_compressed_pitch_rounds_up() {
        let bc1 = FormatInfo::of(vk::Format::BC1_RGBA_UNORM_BLOCK).unwrap();
        assert!(bc1.is_compressed());
        // 5 texel 宽需要 2 个 block
        assert_eq!(bc1.row_pitch(5), 16);
        assert_eq!(bc1.row_count(1), 1);

        let bc7 = FormatInfo::of(vk::Format::BC7_UNORM_BLOCK).unwrap();
        assert_eq!(bc7.row_pitch(16), 64);
    }

    #[test]
    fn test_unsupported_format() {
        assert_eq!(
            FormatInfo::of(vk::Format::ASTC_4X4_UNORM_BLOCK),
            Err(GfxError::UnsupportedFormat(vk::Format::ASTC_4X4_UNORM_BLOCK))
        );
    }
}
