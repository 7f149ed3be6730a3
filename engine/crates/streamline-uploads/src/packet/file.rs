use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{UploadError, UploadResult};
use crate::packet::{AlignedBytes, PacketLayout, ResidentData};
use crate::pitches::TexturePitches;

/// 文件中的一段连续字节
///
/// 大小与 pitch 在创建时声明，因此不读文件也能回答 `data_size` / `pitches`
#[derive(Debug)]
pub struct FilePacket {
    path: PathBuf,
    offset: u64,
    layout: PacketLayout,
    resident: OnceLock<UploadResult<ResidentData>>,
}

impl FilePacket {
    pub(crate) fn new(path: PathBuf, offset: u64, size: usize, pitches: TexturePitches) -> Self {
        Self {
            path,
            offset,
            layout: PacketLayout::linear(size, pitches),
            resident: OnceLock::new(),
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub(crate) fn layout(&self) -> &PacketLayout {
        &self.layout
    }

    #[inline]
    pub(crate) fn resident_cell(&self) -> &OnceLock<UploadResult<ResidentData>> {
        &self.resident
    }

    /// 读取声明的字节范围；文件比声明的短视为错误
    pub(crate) fn produce(&self) -> UploadResult<ResidentData> {
        let _span = tracy_client::span!("FilePacket::produce");

        let size = self.layout.total_size();
        let mut file = File::open(&self.path).map_err(|err| UploadError::io(&self.path, err))?;
        file.seek(SeekFrom::Start(self.offset)).map_err(|err| UploadError::io(&self.path, err))?;

        let mut bytes = AlignedBytes::zeroed(size);
        file.read_exact(&mut bytes).map_err(|err| UploadError::io(&self.path, err))?;

        log::debug!("read {} bytes from {:?} at offset {}", size, self.path, self.offset);
        Ok(ResidentData::new(bytes, self.layout.clone(), None))
    }
}
