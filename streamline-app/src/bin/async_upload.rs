//! 异步上传演示
//!
//! 用法: `async-upload [--config upload.toml] [--latency N] [FILE...]`
//!
//! - 没有给出文件时，上传一张生成的棋盘格纹理
//! - 能识别的纹理文件 (DDS / png / jpg ...) 以流式纹理上传，其余文件整体作为线性 buffer 上传
//! - 使用 host device 模拟 GPU：每帧提交的拷贝要在 `latency` 帧之后才会完成

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use ash::vk;
use clap::Parser;
use streamline_crate_tools::init_log::init_log;
use streamline_gfx::desc::{BindFlags, BufferDesc, TextureDesc};
use streamline_gfx::host_device::{GfxHostDevice, GfxHostDeviceConfig};
use streamline_uploads::config::UploadConfig;
use streamline_uploads::manager::{TransactionId, UploadManager};
use streamline_uploads::marker::{Marker, MarkerState};
use streamline_uploads::pitches::TexturePitches;
use streamline_uploads::{
    TextureLoadFlags, create_basic_packet, create_basic_packet_from, create_file_data_source,
    create_streaming_texture_source, load_texture_format,
};

const MAX_FRAMES: u64 = 10_000;
const FRAME_TIME: Duration = Duration::from_millis(16);

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Vertex {
    pos: [f32; 3],
    uv: [f32; 2],
}

#[derive(Parser, Debug)]
#[command(name = "async-upload")]
#[command(about = "Streams files into GPU resources through the upload manager")]
struct CliArgs {
    /// TOML 格式的上传配置
    #[arg(long)]
    config: Option<PathBuf>,

    /// 模拟的 GPU 延迟 (帧)
    #[arg(long, default_value_t = 2)]
    latency: u64,

    /// 要上传的文件；为空时上传生成的棋盘格纹理
    files: Vec<PathBuf>,
}

fn create_quad(manager: &mut UploadManager) -> anyhow::Result<()> {
    let vertices = [
        Vertex {
            pos: [-0.5, -0.5, 0.0],
            uv: [0.0, 0.0],
        },
        Vertex {
            pos: [0.5, -0.5, 0.0],
            uv: [1.0, 0.0],
        },
        Vertex {
            pos: [0.5, 0.5, 0.0],
            uv: [1.0, 1.0],
        },
        Vertex {
            pos: [-0.5, 0.5, 0.0],
            uv: [0.0, 1.0],
        },
    ];
    let indices: [u32; 6] = [0, 1, 2, 2, 3, 0];

    let vb = manager.transaction_immediate(
        &BufferDesc::linear(size_of_val(&vertices) as u64, BindFlags::VERTEX_BUFFER),
        create_basic_packet_from(&vertices),
    )?;
    let ib = manager.transaction_immediate(
        &BufferDesc::linear(size_of_val(&indices) as u64, BindFlags::INDEX_BUFFER),
        create_basic_packet_from(&indices),
    )?;
    log::info!("quad uploaded: vb {:?}, ib {:?}", vb.locator, ib.locator);
    Ok(())
}

fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if ((x / cell) + (y / cell)) % 2 == 0 { [0xff, 0xff, 0xff, 0xff] } else { [0x20, 0x20, 0x20, 0xff] }
        })
        .collect()
}

/// 为每个输入发起一个异步事务
///
/// 返回的 Marker 需要一直持有，否则事务完成后会被当作放弃而回收
fn begin_uploads(
    manager: &mut UploadManager,
    files: &[PathBuf],
) -> anyhow::Result<Vec<(String, TransactionId, Marker)>> {
    let mut transactions = Vec::new();

    if files.is_empty() {
        let tex = TextureDesc::plain_2d(256, 256, vk::Format::R8G8B8A8_UNORM);
        let pixels = checkerboard(256, 32);
        let packet = create_basic_packet(pixels.len(), Some(&pixels), TexturePitches::from_texture_desc(&tex)?);
        let (id, marker) = manager.transaction_begin(&BufferDesc::texture(tex, BindFlags::SHADER_RESOURCE), packet)?;
        transactions.push(("checkerboard".to_string(), id, marker));
        return Ok(transactions);
    }

    for path in files {
        let name = path.display().to_string();
        let (id, marker) = match load_texture_format(path) {
            Ok(tex) => {
                let (tex, flags) = if tex.mip_count == 1 {
                    (tex.with_full_mip_chain(), TextureLoadFlags::GENERATE_MIPMAPS)
                } else {
                    (tex, TextureLoadFlags::empty())
                };
                log::info!("{}: texture {}x{} {:?}, {} mips", name, tex.width, tex.height, tex.format, tex.mip_count);
                let packet = create_streaming_texture_source(path, flags);
                manager.transaction_begin(&BufferDesc::texture(tex, BindFlags::SHADER_RESOURCE), packet)?
            }
            Err(_) => {
                let size = std::fs::metadata(path).with_context(|| format!("cannot stat {}", name))?.len();
                log::info!("{}: raw buffer, {} bytes", name, size);
                let packet = create_file_data_source(path, 0, size as usize, TexturePitches::default());
                manager.transaction_begin(&BufferDesc::linear(size, BindFlags::SHADER_RESOURCE), packet)?
            }
        };
        transactions.push((name, id, marker));
    }
    Ok(transactions)
}

fn main() -> anyhow::Result<()> {
    init_log();
    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => UploadConfig::from_toml_file(path)?,
        None => UploadConfig::default(),
    };
    log::info!("upload config: {:?}", config);

    let device = Arc::new(GfxHostDevice::new(GfxHostDeviceConfig {
        memory_budget: None,
        auto_retire: false,
    }));
    let mut manager = UploadManager::new(device.clone(), config)?;

    // immediate 事务会阻塞到设备完成，这期间由另一个线程推进 timeline
    {
        let _span = tracy_client::span!("create_quad");
        let stop = AtomicBool::new(false);
        let result = std::thread::scope(|s| {
            s.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    device.retire_all();
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
            let result = create_quad(&mut manager);
            stop.store(true, Ordering::Release);
            result
        });
        result?;
    }

    let transactions = begin_uploads(&mut manager, &args.files)?;
    let start = Instant::now();

    // 每帧提交的 timeline 值，latency 帧之后完成
    let mut in_flight: VecDeque<u64> = VecDeque::new();
    let mut frame = 0;
    while manager.pending_count() > 0 && frame < MAX_FRAMES {
        let _span = tracy_client::span!("frame");
        frame += 1;

        while in_flight.len() as u64 > args.latency {
            if let Some(value) = in_flight.pop_front() {
                device.retire_to(value);
            }
        }

        manager.update();
        in_flight.push_back(device.submitted_value());

        if frame % 30 == 0 {
            log::info!("frame {}: {} transactions pending", frame, manager.pending_count());
        }
        std::thread::sleep(FRAME_TIME);
    }
    device.retire_all();
    manager.update();

    for (name, id, marker) in &transactions {
        match marker.state() {
            MarkerState::Completed => {
                let locator = manager.resource(*id).context("completed transaction without resource")?;
                log::info!("{}: uploaded {} bytes into {:?}", name, locator.size(), locator.raw());
            }
            MarkerState::Failed(err) => log::error!("{}: failed: {}", name, err),
            state => log::warn!("{}: still {:?} after {} frames", name, state, frame),
        }
    }

    log::info!("finished in {} frames ({:?})", frame, start.elapsed());
    log::info!("upload metrics: {:?}", manager.metrics());
    log::info!("pool stats: {:?}", manager.pool_stats());
    Ok(())
}
