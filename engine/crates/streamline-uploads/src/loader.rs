use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use crossbeam_utils::sync::WaitGroup;

use crate::config::LoaderConfig;
use crate::error::{UploadError, UploadResult};
use crate::marker::Marker;
use crate::packet::SharedPacket;

/// 后台生产一个 packet 的请求
pub struct LoadRequest {
    pub packet: SharedPacket,
    /// 生产结束时推进的 Marker
    pub marker: Option<Marker>,
    /// 上传事务的编号；存在时生产结果会通过结果 channel 返回
    pub ticket: Option<u64>,
}

impl LoadRequest {
    /// 只通过 Marker 观察结果的请求
    pub fn untracked(packet: SharedPacket, marker: Marker) -> Self {
        Self {
            packet,
            marker: Some(marker),
            ticket: None,
        }
    }

    /// 由上传事务发起，结果从 [`BackgroundLoader::try_recv_result`] 取回
    pub(crate) fn tracked(packet: SharedPacket, ticket: u64) -> Self {
        Self {
            packet,
            marker: None,
            ticket: Some(ticket),
        }
    }
}

#[derive(Debug)]
pub struct LoadResult {
    pub ticket: u64,
    pub outcome: UploadResult<()>,
}

/// 负责执行后台的 packet 生产 (读文件、解码纹理)
///
/// ## 架构设计
/// - 内部的 dispatch 线程负责调度：接收加载请求，分发任务到 worker
/// - rayon 提供 worker 线程池，线程数由 [`LoaderConfig::worker_threads`] 决定
/// - 请求 channel 是有界的：worker 全部忙碌时请求在 channel 中排队，
///   channel 满了之后 [`BackgroundLoader::try_request_load`] 会把请求退回给调用者
/// - 生产结果通过结果 channel 交还给拥有 [`crate::manager::UploadManager`] 的线程，
///   拷贝命令只在那个线程上提交
pub struct BackgroundLoader {
    /// 用于向 dispatch 线程发送加载请求
    request_sender: Option<Sender<LoadRequest>>,
    /// 用于接收加载结果
    result_receiver: Receiver<LoadResult>,
    /// 请求无法投递时直接回报失败
    result_sender: Sender<LoadResult>,

    /// 已经接收但还没有完成的请求数
    in_flight: Arc<AtomicUsize>,

    /// 用于分发任务的后台线程
    dispatch_thread: Option<thread::JoinHandle<()>>,
}

// new & init
impl BackgroundLoader {
    pub fn new(config: &LoaderConfig) -> UploadResult<Self> {
        let worker_threads = config.worker_threads.max(1);
        let (req_tx, req_rx) = crossbeam_channel::bounded::<LoadRequest>(config.queue_capacity.max(1));
        let (res_tx, res_rx) = crossbeam_channel::unbounded::<LoadResult>();

        // 每个 token 代表一个空闲 worker，dispatch 线程拿到 token 才会派发任务
        let (token_tx, token_rx) = crossbeam_channel::bounded::<()>(worker_threads);
        for _ in 0..worker_threads {
            let _ = token_tx.send(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(|index| format!("Upload-Loader-{}", index))
            .panic_handler(|payload| log::error!("loader worker panicked: {}", panic_message(&*payload)))
            .build()
            .map_err(|e| UploadError::Loader(format!("failed to create loader thread pool: {}", e)))?;

        let in_flight = Arc::new(AtomicUsize::new(0));

        let dispatch_res_tx = res_tx.clone();
        let dispatch_in_flight = in_flight.clone();
        let dispatch_thread = thread::Builder::new()
            .name("Upload-IO-Dispatcher".to_string())
            .spawn(move || {
                let wait_group = WaitGroup::new();

                while let Ok(req) = req_rx.recv() {
                    let _span = tracy_client::span!("BackgroundLoader::dispatch");

                    // token channel 的发送端由任务持有，不会提前断开
                    if token_rx.recv().is_err() {
                        break;
                    }

                    let res_tx = dispatch_res_tx.clone();
                    let token_tx = token_tx.clone();
                    let in_flight = dispatch_in_flight.clone();
                    // 任务结束时闭包销毁，wg_task 随之 drop
                    let wg_task = wait_group.clone();

                    pool.spawn(move || {
                        if let Some(result) = load_packet_task(req) {
                            let _ = res_tx.send(result);
                        }
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                        let _ = token_tx.send(());

                        drop(wg_task);
                    });
                }

                // 等待所有任务完成
                wait_group.wait();
            })
            .map_err(|e| UploadError::Loader(format!("failed to spawn dispatcher thread: {}", e)))?;

        log::info!(
            "background loader started: {} workers, queue capacity {}",
            worker_threads,
            config.queue_capacity.max(1)
        );

        Ok(Self {
            request_sender: Some(req_tx),
            result_receiver: res_rx,
            result_sender: res_tx,
            in_flight,
            dispatch_thread: Some(dispatch_thread),
        })
    }
}

// 请求
impl BackgroundLoader {
    /// 投递请求，不阻塞；队列已满时把请求原样退回
    pub fn try_request_load(&self, req: LoadRequest) -> Result<(), LoadRequest> {
        let Some(sender) = &self.request_sender else {
            self.reject(req);
            return Ok(());
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(req) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(req)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                Err(req)
            }
            Err(TrySendError::Disconnected(req)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.reject(req);
                Ok(())
            }
        }
    }

    /// 投递请求，队列已满时阻塞直到有空位
    ///
    /// 渲染线程应该使用 [`Self::try_request_load`]
    pub fn request_load(&self, req: LoadRequest) {
        let Some(sender) = &self.request_sender else {
            self.reject(req);
            return;
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = sender.send(req) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            log::error!("Failed to send load request: dispatcher is gone");
            self.reject(e.into_inner());
        }
    }

    /// dispatch 线程已经退出，请求直接失败
    fn reject(&self, req: LoadRequest) {
        let err = UploadError::Loader("background loader is shut down".to_string());
        if let Some(marker) = &req.marker {
            marker.fail(err.clone());
        }
        if let Some(ticket) = req.ticket {
            let _ = self.result_sender.send(LoadResult {
                ticket,
                outcome: Err(err),
            });
        }
    }
}

// 结果
impl BackgroundLoader {
    pub fn try_recv_result(&self) -> Option<LoadResult> {
        self.result_receiver.try_recv().ok()
    }

    /// 最多阻塞 `timeout` 等待一个结果
    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<LoadResult> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    /// 已经接收、尚未生产完成的请求数
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 显式等待所有任务完成并销毁 loader
    /// 实际上只是消耗 self，触发 Drop
    pub fn join(self) {}
}

impl Drop for BackgroundLoader {
    fn drop(&mut self) {
        // 必须先 drop sender，否则 recv 会一直阻塞，导致 join 死锁
        self.request_sender = None;

        log::info!("BackgroundLoader is being dropped, waiting for tasks to complete...");
        if let Some(thread) = self.dispatch_thread.take()
            && let Err(_) = thread.join()
        {
            log::error!("Failed to join loader dispatcher thread");
        }
        log::info!("All load tasks completed, BackgroundLoader dropped.");
    }
}

/// 实际的加载任务 (运行在 rayon 线程池中)
fn load_packet_task(req: LoadRequest) -> Option<LoadResult> {
    let _span = tracy_client::span!("load_packet_task");

    if let Some(marker) = &req.marker {
        marker.set_in_progress();
    }

    log::debug!("Loading packet: {}", req.packet.debug_name());
    // 生产过程 panic 时 packet 保持未驻留，只让这一次加载失败
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| req.packet.make_resident().map(|_| ())))
        .unwrap_or_else(|payload| Err(UploadError::Loader(format!("producer panicked: {}", panic_message(&*payload)))));

    if let Err(e) = &outcome {
        log::error!("Failed to load {}: {}", req.packet.debug_name(), e);
    }

    if let Some(marker) = &req.marker {
        match &outcome {
            Ok(()) => marker.complete(),
            Err(e) => marker.fail(e.clone()),
        };
    }

    req.ticket.map(|ticket| LoadResult { ticket, outcome })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::error::UploadError;
    use crate::packet::{SubResource, create_basic_packet, create_file_data_source};
    use crate::pitches::TexturePitches;

    fn loader(workers: usize, capacity: usize) -> BackgroundLoader {
        BackgroundLoader::new(&LoaderConfig {
            worker_threads: workers,
            queue_capacity: capacity,
        })
        .unwrap()
    }

    fn temp_file(content: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("streamline-loader-{}.bin", uuid::Uuid::new_v4()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_resident_packet_is_completed_immediately() {
        let loader = loader(1, 4);
        let packet = Arc::new(create_basic_packet(16, None, TexturePitches::default()));
        let marker = packet.begin_background_load(&loader);
        assert!(marker.is_complete());
        assert_eq!(loader.in_flight(), 0);
    }

    #[test]
    fn test_background_file_load() {
        let path = temp_file(&[7; 32]);
        let loader = loader(2, 4);

        let packet = Arc::new(create_file_data_source(&path, 0, 32, TexturePitches::default()));
        let marker = packet.begin_background_load(&loader);
        marker.wait(Duration::from_secs(10)).unwrap();

        assert!(packet.is_resident());
        assert_eq!(packet.data(SubResource::default()).unwrap(), &[7; 32]);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_missing_file_fails_marker() {
        let path = std::env::temp_dir().join(format!("streamline-missing-{}.bin", uuid::Uuid::new_v4()));
        let loader = loader(1, 4);

        let packet = Arc::new(create_file_data_source(&path, 0, 8, TexturePitches::default()));
        let marker = packet.begin_background_load(&loader);
        assert!(matches!(marker.wait(Duration::from_secs(10)), Err(UploadError::Io { .. })));
        assert!(!marker.is_complete());

        // 已经失败的 packet 再次请求直接得到失败的 Marker
        assert!(packet.begin_background_load(&loader).is_failed());
    }

    #[test]
    fn test_tracked_results_are_published() {
        let path = temp_file(&[1, 2, 3, 4]);
        let loader = loader(2, 8);

        for ticket in 0..4u64 {
            let packet = Arc::new(create_file_data_source(&path, 0, 4, TexturePitches::default()));
            loader.request_load(LoadRequest::tracked(packet, ticket));
        }

        let mut tickets: Vec<u64> = (0..4)
            .map(|_| {
                let result = loader.recv_result_timeout(Duration::from_secs(10)).unwrap();
                assert!(result.outcome.is_ok());
                result.ticket
            })
            .collect();
        tickets.sort();
        assert_eq!(tickets, vec![0, 1, 2, 3]);
        assert!(loader.try_recv_result().is_none());

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_drop_drains_pending_requests() {
        let path = temp_file(&[9; 8]);
        let loader = loader(1, 16);

        let markers: Vec<Marker> = (0..8)
            .map(|_| {
                let packet = Arc::new(create_file_data_source(&path, 0, 8, TexturePitches::default()));
                packet.begin_background_load(&loader)
            })
            .collect();
        loader.join();

        assert!(markers.iter().all(Marker::is_complete));
        std::fs::remove_file(path).unwrap();
    }
}
