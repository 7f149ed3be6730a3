use streamline_gfx::desc::TextureDesc;
use streamline_gfx::error::GfxResult;

/// 纹理数据在线性内存中的步长
///
/// - `row_pitch`: 相邻两行 (压缩格式为两行 block) 之间的字节数
/// - `slice_pitch`: 相邻两个深度切片之间的字节数
///
/// 全 0 表示 "未指定"，线性数据会把它解释为 row = slice = 数据大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TexturePitches {
    pub row_pitch: u64,
    pub slice_pitch: u64,
}

impl TexturePitches {
    #[inline]
    pub const fn new(row_pitch: u64, slice_pitch: u64) -> Self {
        Self { row_pitch, slice_pitch }
    }

    /// 线性数据：row pitch 与 slice pitch 都等于总大小
    #[inline]
    pub const fn linear(size: u64) -> Self {
        Self::new(size, size)
    }

    /// 由纹理描述推导 mip 0 的 pitch
    pub fn from_texture_desc(desc: &TextureDesc) -> GfxResult<Self> {
        Self::for_mip(desc, 0)
    }

    pub fn for_mip(desc: &TextureDesc, mip: u32) -> GfxResult<Self> {
        Ok(Self::new(desc.row_pitch(mip)?, desc.slice_pitch(mip)?))
    }

    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.row_pitch == 0 && self.slice_pitch == 0
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;

    #[test]
    fn test_pitches_from_desc() {
        let desc = TextureDesc::plain_2d(16, 8, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(TexturePitches::from_texture_desc(&desc).unwrap(), TexturePitches::new(64, 512));

        let bc1 = TextureDesc::plain_2d(16, 8, vk::Format::BC1_RGBA_UNORM_BLOCK).with_mips(2);
        // 4 block * 8 字节，2 行 block
        assert_eq!(TexturePitches::from_texture_desc(&bc1).unwrap(), TexturePitches::new(32, 64));
        // mip1: 8x4 -> 2 block * 8 字节，1 行 block
        assert_eq!(TexturePitches::for_mip(&bc1, 1).unwrap(), TexturePitches::new(16, 16));
    }

    #[test]
    fn test_default_is_unspecified() {
        assert!(TexturePitches::default().is_unspecified());
        assert!(!TexturePitches::linear(4).is_unspecified());
    }
}
