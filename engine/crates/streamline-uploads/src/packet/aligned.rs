use std::ops::{Deref, DerefMut};

/// packet 数据的对齐要求，满足 SIMD 读取与 staging 拷贝
pub const PACKET_ALIGNMENT: usize = 16;

#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct AlignedChunk([u8; PACKET_ALIGNMENT]);

// SAFETY: 只包含 u8 数组，size == align，没有 padding，任意比特模式都合法
unsafe impl bytemuck::Zeroable for AlignedChunk {}
unsafe impl bytemuck::Pod for AlignedChunk {}

/// 按 [`PACKET_ALIGNMENT`] 对齐的字节缓冲区
///
/// 底层以 16 字节 chunk 分配，因此起始地址总是对齐的，与默认分配器的 `Vec<u8>` 不同
pub struct AlignedBytes {
    chunks: Vec<AlignedChunk>,
    len: usize,
}

impl AlignedBytes {
    pub fn zeroed(len: usize) -> Self {
        Self {
            chunks: vec![AlignedChunk([0; PACKET_ALIGNMENT]); len.div_ceil(PACKET_ALIGNMENT)],
            len,
        }
    }

    /// 拷贝 `data` 的前 `len` 个字节，不足的部分填 0
    pub fn copy_from(len: usize, data: &[u8]) -> Self {
        let mut bytes = Self::zeroed(len);
        let copy_len = len.min(data.len());
        bytes[..copy_len].copy_from_slice(&data[..copy_len]);
        bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for AlignedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &bytemuck::cast_slice::<AlignedChunk, u8>(&self.chunks)[..self.len]
    }
}

impl DerefMut for AlignedBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<AlignedChunk, u8>(&mut self.chunks)[..self.len]
    }
}

impl std::fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBytes").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        for len in [1, 15, 16, 17, 1000] {
            let bytes = AlignedBytes::zeroed(len);
            assert_eq!(bytes.len(), len);
            assert_eq!(bytes.as_ptr() as usize % PACKET_ALIGNMENT, 0);
            assert!(bytes.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_copy_from_pads_with_zero() {
        let bytes = AlignedBytes::copy_from(6, &[1, 2, 3]);
        assert_eq!(&bytes[..], &[1, 2, 3, 0, 0, 0]);

        let truncated = AlignedBytes::copy_from(2, &[1, 2, 3]);
        assert_eq!(&truncated[..], &[1, 2]);
    }

    #[test]
    fn test_empty() {
        let bytes = AlignedBytes::zeroed(0);
        assert!(bytes.is_empty());
        assert_eq!(&bytes[..], &[] as &[u8]);
    }
}
