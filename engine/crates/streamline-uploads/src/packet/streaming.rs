use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{UploadError, UploadResult};
use crate::packet::{PacketLayout, ResidentData, TextureLoadFlags};
use crate::texture_format;

/// 纹理容器文件，解码后得到所有子资源
#[derive(Debug)]
pub struct StreamingTexturePacket {
    path: PathBuf,
    flags: TextureLoadFlags,
    resident: OnceLock<UploadResult<ResidentData>>,
}

impl StreamingTexturePacket {
    pub(crate) fn new(path: PathBuf, flags: TextureLoadFlags) -> Self {
        Self {
            path,
            flags,
            resident: OnceLock::new(),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn flags(&self) -> TextureLoadFlags {
        self.flags
    }

    #[inline]
    pub(crate) fn resident_cell(&self) -> &OnceLock<UploadResult<ResidentData>> {
        &self.resident
    }

    pub(crate) fn produce(&self) -> UploadResult<ResidentData> {
        let _span = tracy_client::span!("StreamingTexturePacket::produce");

        let bytes = std::fs::read(&self.path).map_err(|err| UploadError::io(&self.path, err))?;
        let decoded = texture_format::decode_texture(&self.path, &bytes, self.flags)?;
        let layout = PacketLayout::texture(&decoded.desc).map_err(|err| UploadError::decode(&self.path, err.to_string()))?;

        log::info!(
            "decoded texture {:?}: {}x{}x{} {:?}, {} mips, {} layers",
            self.path,
            decoded.desc.width,
            decoded.desc.height,
            decoded.desc.depth,
            decoded.desc.format,
            decoded.desc.mip_count,
            decoded.desc.array_count
        );
        Ok(ResidentData::new(decoded.bytes, layout, Some(decoded.desc)))
    }
}
