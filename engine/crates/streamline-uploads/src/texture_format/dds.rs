//! DDS 容器解析
//!
//! 只解析头部，像素数据原样保留：DDS 的数据排列 (每个 array 元素依次存放完整 mip chain)
//! 与 [`TextureDesc`] 的紧密布局一致。

use ash::vk;
use streamline_gfx::desc::{TextureDesc, TextureDimensionality};

pub const DDS_MAGIC: &[u8; 4] = b"DDS ";

const HEADER_SIZE: usize = 124;
const DX10_HEADER_SIZE: usize = 20;

/// magic + header + DX10 扩展头，探测格式时最多需要读取的字节数
pub const MAX_HEADER_BYTES: usize = DDS_MAGIC.len() + HEADER_SIZE + DX10_HEADER_SIZE;

// header flags
const DDSD_MIPMAPCOUNT: u32 = 0x2_0000;
const DDSD_DEPTH: u32 = 0x80_0000;

// pixel format flags
const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;
const DDPF_LUMINANCE: u32 = 0x2_0000;

// caps2
const DDSCAPS2_CUBEMAP: u32 = 0x200;
const DDSCAPS2_VOLUME: u32 = 0x20_0000;

// DX10 扩展头
const DX10_DIMENSION_TEXTURE3D: u32 = 4;
const DX10_MISC_TEXTURECUBE: u32 = 0x4;

/// 解析出的 DDS 头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdsHeader {
    pub desc: TextureDesc,
    /// 像素数据在文件中的起始位置
    pub data_offset: usize,
}

#[inline]
pub fn is_dds(bytes: &[u8]) -> bool {
    bytes.starts_with(DDS_MAGIC)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

const fn four_cc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// DXGI_FORMAT -> vk::Format，只覆盖常用的采样格式
fn dxgi_to_vk(dxgi: u32) -> Option<vk::Format> {
    let format = match dxgi {
        2 => vk::Format::R32G32B32A32_SFLOAT,
        10 => vk::Format::R16G16B16A16_SFLOAT,
        28 => vk::Format::R8G8B8A8_UNORM,
        29 => vk::Format::R8G8B8A8_SRGB,
        41 => vk::Format::R32_SFLOAT,
        49 => vk::Format::R8G8_UNORM,
        61 => vk::Format::R8_UNORM,
        71 => vk::Format::BC1_RGBA_UNORM_BLOCK,
        72 => vk::Format::BC1_RGBA_SRGB_BLOCK,
        74 => vk::Format::BC2_UNORM_BLOCK,
        75 => vk::Format::BC2_SRGB_BLOCK,
        77 => vk::Format::BC3_UNORM_BLOCK,
        78 => vk::Format::BC3_SRGB_BLOCK,
        80 => vk::Format::BC4_UNORM_BLOCK,
        81 => vk::Format::BC4_SNORM_BLOCK,
        83 => vk::Format::BC5_UNORM_BLOCK,
        84 => vk::Format::BC5_SNORM_BLOCK,
        87 => vk::Format::B8G8R8A8_UNORM,
        91 => vk::Format::B8G8R8A8_SRGB,
        95 => vk::Format::BC6H_UFLOAT_BLOCK,
        96 => vk::Format::BC6H_SFLOAT_BLOCK,
        98 => vk::Format::BC7_UNORM_BLOCK,
        99 => vk::Format::BC7_SRGB_BLOCK,
        _ => return None,
    };
    Some(format)
}

/// 旧式 (非 DX10) 像素格式
fn legacy_format(bytes: &[u8]) -> Result<vk::Format, String> {
    // 像素格式结构在 header 中的偏移
    let pf = DDS_MAGIC.len() + 72;
    let flags = read_u32(bytes, pf + 4);
    let fourcc = read_u32(bytes, pf + 8);
    let bit_count = read_u32(bytes, pf + 12);
    let r_mask = read_u32(bytes, pf + 16);

    if flags & DDPF_FOURCC != 0 {
        return match fourcc {
            f if f == four_cc(b"DXT1") => Ok(vk::Format::BC1_RGBA_UNORM_BLOCK),
            f if f == four_cc(b"DXT2") || f == four_cc(b"DXT3") => Ok(vk::Format::BC2_UNORM_BLOCK),
            f if f == four_cc(b"DXT4") || f == four_cc(b"DXT5") => Ok(vk::Format::BC3_UNORM_BLOCK),
            f if f == four_cc(b"ATI1") || f == four_cc(b"BC4U") => Ok(vk::Format::BC4_UNORM_BLOCK),
            f if f == four_cc(b"ATI2") || f == four_cc(b"BC5U") => Ok(vk::Format::BC5_UNORM_BLOCK),
            other => Err(format!("unsupported fourCC {:?}", other.to_le_bytes().map(char::from))),
        };
    }
    if flags & DDPF_RGB != 0 && bit_count == 32 {
        return match r_mask {
            0x0000_00ff => Ok(vk::Format::R8G8B8A8_UNORM),
            0x00ff_0000 => Ok(vk::Format::B8G8R8A8_UNORM),
            mask => Err(format!("unsupported 32-bit RGB mask {:#010x}", mask)),
        };
    }
    if flags & DDPF_LUMINANCE != 0 && bit_count == 8 {
        return Ok(vk::Format::R8_UNORM);
    }
    Err(format!("unsupported pixel format (flags {:#x}, {} bits)", flags, bit_count))
}

/// 解析头部，`bytes` 至少需要包含完整的头部
pub fn parse_header(bytes: &[u8]) -> Result<DdsHeader, String> {
    if !is_dds(bytes) {
        return Err("missing DDS magic".to_string());
    }
    let header_end = DDS_MAGIC.len() + HEADER_SIZE;
    if bytes.len() < header_end {
        return Err(format!("truncated header: {} bytes", bytes.len()));
    }
    let h = DDS_MAGIC.len();
    if read_u32(bytes, h) as usize != HEADER_SIZE {
        return Err(format!("invalid header size {}", read_u32(bytes, h)));
    }

    let flags = read_u32(bytes, h + 4);
    let height = read_u32(bytes, h + 8);
    let width = read_u32(bytes, h + 12);
    let depth = if flags & DDSD_DEPTH != 0 { read_u32(bytes, h + 20).max(1) } else { 1 };
    let mip_count = if flags & DDSD_MIPMAPCOUNT != 0 { read_u32(bytes, h + 24).max(1) } else { 1 };
    let caps2 = read_u32(bytes, h + 108);
    let fourcc = read_u32(bytes, h + 72 + 8);

    if width == 0 || height == 0 {
        return Err(format!("invalid extent {}x{}", width, height));
    }

    let (format, dimensionality, array_count, data_offset) = if fourcc == four_cc(b"DX10") {
        let ext = header_end;
        if bytes.len() < ext + DX10_HEADER_SIZE {
            return Err("truncated DX10 header".to_string());
        }
        let dxgi = read_u32(bytes, ext);
        let resource_dimension = read_u32(bytes, ext + 4);
        let misc = read_u32(bytes, ext + 8);
        let array_size = read_u32(bytes, ext + 12).max(1);

        let format = dxgi_to_vk(dxgi).ok_or_else(|| format!("unsupported DXGI format {}", dxgi))?;
        let (dimensionality, array_count) = if misc & DX10_MISC_TEXTURECUBE != 0 {
            let faces = array_size.checked_mul(6).ok_or_else(|| format!("cube array size {} overflows", array_size))?;
            (TextureDimensionality::CubeMap, faces)
        } else if resource_dimension == DX10_DIMENSION_TEXTURE3D {
            (TextureDimensionality::Tex3D, 1)
        } else if height == 1 {
            (TextureDimensionality::Tex1D, array_size)
        } else {
            (TextureDimensionality::Tex2D, array_size)
        };
        (format, dimensionality, array_count, ext + DX10_HEADER_SIZE)
    } else {
        let format = legacy_format(bytes)?;
        let (dimensionality, array_count) = if caps2 & DDSCAPS2_CUBEMAP != 0 {
            (TextureDimensionality::CubeMap, 6)
        } else if caps2 & DDSCAPS2_VOLUME != 0 {
            (TextureDimensionality::Tex3D, 1)
        } else {
            (TextureDimensionality::Tex2D, 1)
        };
        (format, dimensionality, array_count, header_end)
    };

    let desc = TextureDesc {
        width,
        height,
        depth: if dimensionality == TextureDimensionality::Tex3D { depth } else { 1 },
        format,
        dimensionality,
        mip_count,
        array_count,
    };
    if mip_count > desc.full_mip_chain_count() {
        return Err(format!(
            "{} mips exceed the full chain of a {}x{}x{} texture",
            mip_count, width, height, desc.depth
        ));
    }
    desc.byte_count().map_err(|err| err.to_string())?;
    Ok(DdsHeader { desc, data_offset })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 构造一个旧式头部的 DDS 文件
    pub(crate) fn build_dds(width: u32, height: u32, mips: u32, fourcc: Option<&[u8; 4]>, payload: &[u8]) -> Vec<u8> {
        let mut header = [0u32; HEADER_SIZE / 4];
        header[0] = HEADER_SIZE as u32;
        header[1] = 0x1 | 0x2 | 0x4 | 0x1000 | DDSD_MIPMAPCOUNT;
        header[2] = height;
        header[3] = width;
        header[6] = mips;
        // pixel format
        header[18] = 32;
        match fourcc {
            Some(code) => {
                header[19] = DDPF_FOURCC;
                header[20] = four_cc(code);
            }
            None => {
                header[19] = DDPF_RGB | 0x1;
                header[21] = 32;
                header[22] = 0x0000_00ff;
                header[23] = 0x0000_ff00;
                header[24] = 0x00ff_0000;
                header[25] = 0xff00_0000;
            }
        }

        let mut bytes = DDS_MAGIC.to_vec();
        bytes.extend(header.iter().flat_map(|word| word.to_le_bytes()));
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_parse_rgba_header() {
        let bytes = build_dds(8, 4, 2, None, &[]);
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.desc, TextureDesc::plain_2d(8, 4, vk::Format::R8G8B8A8_UNORM).with_mips(2));
        assert_eq!(header.data_offset, 128);
    }

    #[test]
    fn test_parse_bc1_header() {
        let bytes = build_dds(16, 16, 1, Some(b"DXT1"), &[]);
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.desc.format, vk::Format::BC1_RGBA_UNORM_BLOCK);
        assert_eq!(header.desc.byte_count().unwrap(), 4 * 4 * 8);
    }

    #[test]
    fn test_parse_dx10_cube_header() {
        let mut bytes = build_dds(4, 4, 1, Some(b"DX10"), &[]);
        for word in [98u32, 3, DX10_MISC_TEXTURECUBE, 1, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.desc.format, vk::Format::BC7_UNORM_BLOCK);
        assert_eq!(header.desc.dimensionality, TextureDimensionality::CubeMap);
        assert_eq!(header.desc.array_count, 6);
        assert_eq!(header.data_offset, MAX_HEADER_BYTES);
    }

    #[test]
    fn test_reject_bad_headers() {
        assert!(parse_header(b"PNG!").is_err());
        assert!(parse_header(&DDS_MAGIC[..]).is_err());
        assert!(parse_header(&build_dds(4, 4, 1, Some(b"ABCD"), &[])).is_err());
        assert!(parse_header(&build_dds(0, 4, 1, None, &[])).is_err());
    }

    #[test]
    fn test_reject_mip_count_beyond_full_chain() {
        // 4x4 最多 3 个 mip
        assert!(parse_header(&build_dds(4, 4, 3, None, &[])).is_ok());
        assert!(parse_header(&build_dds(4, 4, 4, None, &[])).is_err());
        assert!(parse_header(&build_dds(4, 4, 40, None, &[])).is_err());
    }

    #[test]
    fn test_reject_oversized_cube_array() {
        let mut bytes = build_dds(4, 4, 1, Some(b"DX10"), &[]);
        for word in [98u32, 3, DX10_MISC_TEXTURECUBE, 0x3000_0000, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        assert!(parse_header(&bytes).unwrap_err().contains("overflows"));
    }

    #[test]
    fn test_reject_unrepresentable_size() {
        let mut bytes = build_dds(65536, 65536, 1, Some(b"DX10"), &[]);
        for word in [2u32, 3, 0, u32::MAX, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        assert!(parse_header(&bytes).is_err());
    }
}
