use streamline_gfx::desc::TextureDesc;
use streamline_gfx::error::{GfxError, GfxResult};

use crate::error::{UploadError, UploadResult};
use crate::packet::SubResource;
use crate::pitches::TexturePitches;

/// 一个子资源在 packet 字节中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceSpan {
    pub sub: SubResource,
    pub offset: usize,
    pub size: usize,
    /// 创建时声明的 pitch；全 0 表示源数据紧密排列
    pub pitches: TexturePitches,
}

impl SubresourceSpan {
    /// 对外报告的 pitch：未指定时 row = slice = size
    pub fn resolved_pitches(&self) -> TexturePitches {
        if self.pitches.is_unspecified() { TexturePitches::linear(self.size as u64) } else { self.pitches }
    }
}

/// packet 的子资源布局
///
/// 纹理布局与 [`TextureDesc::subresource_offset`] 一致：array 优先、mip 其次、紧密排列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketLayout {
    spans: Vec<SubresourceSpan>,
}

impl PacketLayout {
    /// 只有一个子资源 (0) 的线性布局
    pub fn linear(size: usize, pitches: TexturePitches) -> Self {
        Self {
            spans: vec![SubresourceSpan {
                sub: SubResource::default(),
                offset: 0,
                size,
                pitches,
            }],
        }
    }

    pub fn texture(desc: &TextureDesc) -> GfxResult<Self> {
        let mip_count = desc.mip_count.max(1);
        let array_count = desc.array_count.max(1);
        // 总大小必须可以表示，之后的偏移累加不会溢出
        desc.byte_count()?;
        let mut spans = Vec::new();
        let mut offset = 0usize;
        for array in 0..array_count {
            for mip in 0..mip_count {
                let size = usize::try_from(desc.mip_byte_size(mip)?).map_err(|_| GfxError::SizeOverflow(format!("{:?}", desc)))?;
                spans.push(SubresourceSpan {
                    sub: SubResource::tex_sub_res(mip, array),
                    offset,
                    size,
                    pitches: TexturePitches::for_mip(desc, mip)?,
                });
                offset += size;
            }
        }
        Ok(Self { spans })
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.spans.last().map(|span| span.offset + span.size).unwrap_or(0)
    }

    pub fn span(&self, sub: SubResource) -> UploadResult<&SubresourceSpan> {
        self.spans
            .iter()
            .find(|span| span.sub == sub)
            .ok_or(UploadError::InvalidSubresource { sub })
    }

    #[inline]
    pub fn spans(&self) -> &[SubresourceSpan] {
        &self.spans
    }

    pub fn subresources(&self) -> impl Iterator<Item = SubResource> + '_ {
        self.spans.iter().map(|span| span.sub)
    }
}
