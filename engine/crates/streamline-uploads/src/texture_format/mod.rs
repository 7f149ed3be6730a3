//! 纹理容器的探测与解码
//!
//! - DDS: 解析头部，像素数据原样使用 (支持 BCn、cube map、volume、多 mip)
//! - 其余格式交给 `image` crate 解码，统一转换为 RGBA8

pub mod dds;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use ash::vk;
use image::RgbaImage;
use image::imageops::FilterType;
use streamline_gfx::desc::{TextureDesc, TextureDimensionality};

use crate::error::{UploadError, UploadResult};
use crate::packet::{AlignedBytes, TextureLoadFlags};

/// 解码结果：紧密排列的所有子资源
pub struct DecodedTexture {
    pub desc: TextureDesc,
    pub bytes: AlignedBytes,
}

/// 只读取头部，得到纹理描述，不解码像素
pub fn load_texture_format(path: impl AsRef<Path>) -> UploadResult<TextureDesc> {
    let _span = tracy_client::span!("load_texture_format");
    let path = path.as_ref();

    let mut head = Vec::with_capacity(dds::MAX_HEADER_BYTES);
    File::open(path)
        .and_then(|file| file.take(dds::MAX_HEADER_BYTES as u64).read_to_end(&mut head))
        .map_err(|err| UploadError::io(path, err))?;

    if dds::is_dds(&head) {
        return dds::parse_header(&head).map(|header| header.desc).map_err(|reason| UploadError::decode(path, reason));
    }

    let (width, height) = image::ImageReader::open(path)
        .map_err(|err| UploadError::io(path, err))?
        .with_guessed_format()
        .map_err(|err| UploadError::io(path, err))?
        .into_dimensions()
        .map_err(|err| UploadError::decode(path, err.to_string()))?;
    Ok(TextureDesc::plain_2d(width, height, vk::Format::R8G8B8A8_UNORM))
}

/// 解码完整的纹理文件内容
pub(crate) fn decode_texture(path: &Path, bytes: &[u8], flags: TextureLoadFlags) -> UploadResult<DecodedTexture> {
    let decoded = if dds::is_dds(bytes) { decode_dds(path, bytes)? } else { decode_image(path, bytes)? };

    if flags.contains(TextureLoadFlags::GENERATE_MIPMAPS) && decoded.desc.mip_count == 1 {
        if can_generate_mips(&decoded.desc) {
            return generate_mips(path, decoded);
        }
        log::warn!(
            "{:?}: mip generation is not supported for {:?} {:?}, keeping a single mip",
            path,
            decoded.desc.format,
            decoded.desc.dimensionality
        );
    }
    Ok(decoded)
}

fn decode_dds(path: &Path, bytes: &[u8]) -> UploadResult<DecodedTexture> {
    let header = dds::parse_header(bytes).map_err(|reason| UploadError::decode(path, reason))?;
    let size = header.desc.byte_count().map_err(|err| UploadError::decode(path, err.to_string()))?;

    let payload = &bytes[header.data_offset..];
    if (payload.len() as u64) < size {
        return Err(UploadError::decode(
            path,
            format!("pixel data truncated: expected {} bytes, found {}", size, payload.len()),
        ));
    }

    Ok(DecodedTexture {
        desc: header.desc,
        // size 不超过 payload 长度，转换不会截断
        bytes: AlignedBytes::copy_from(size as usize, payload),
    })
}

fn decode_image(path: &Path, bytes: &[u8]) -> UploadResult<DecodedTexture> {
    let img = image::load_from_memory(bytes).map_err(|err| UploadError::decode(path, err.to_string()))?;
    // 统一转为 RGBA8
    let img = img.into_rgba8();
    let desc = TextureDesc::plain_2d(img.width(), img.height(), vk::Format::R8G8B8A8_UNORM);
    Ok(DecodedTexture {
        desc,
        bytes: AlignedBytes::copy_from(img.as_raw().len(), img.as_raw()),
    })
}

/// 只对单层 2D 的 8bit 四通道格式生成 mip；每个通道独立滤波，RGBA / BGRA 都适用
fn can_generate_mips(desc: &TextureDesc) -> bool {
    matches!(
        desc.format,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB
    ) && desc.dimensionality == TextureDimensionality::Tex2D
        && desc.array_count == 1
        && desc.depth == 1
}

fn generate_mips(path: &Path, base: DecodedTexture) -> UploadResult<DecodedTexture> {
    let _span = tracy_client::span!("generate_mips");

    let desc = base.desc.with_full_mip_chain();
    let total = desc.byte_count().map_err(|err| UploadError::decode(path, err.to_string()))?;
    let total = usize::try_from(total).map_err(|_| UploadError::decode(path, "mip chain does not fit in memory"))?;

    let mut level = RgbaImage::from_raw(base.desc.width, base.desc.height, base.bytes.to_vec())
        .ok_or_else(|| UploadError::decode(path, "pixel buffer does not match extent"))?;

    let mut bytes = AlignedBytes::zeroed(total);
    let mut offset = 0;
    for mip in 0..desc.mip_count {
        if mip > 0 {
            let extent = desc.mip_extent(mip);
            level = image::imageops::resize(&level, extent.width, extent.height, FilterType::Triangle);
        }
        let raw = level.as_raw();
        bytes[offset..offset + raw.len()].copy_from_slice(raw);
        offset += raw.len();
    }
    debug_assert_eq!(offset, total);

    Ok(DecodedTexture { desc, bytes })
}
