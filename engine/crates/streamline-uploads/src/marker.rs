use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{UploadError, UploadResult};

/// 异步操作的状态
///
/// 状态只会向前推进：Pending -> InProgress -> Completed / Failed，终态之后不再变化
#[derive(Debug, Clone)]
pub enum MarkerState {
    Pending,
    InProgress,
    Completed,
    Failed(UploadError),
}

impl MarkerState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed(_) => 2,
        }
    }
}

struct MarkerShared {
    state: Mutex<MarkerState>,
    cond: Condvar,
}

/// 可共享的完成标记
///
/// 生产者 (后台加载线程、上传管理器) 推进状态，任意数量的观察者查询或者阻塞等待
#[derive(Clone)]
pub struct Marker {
    shared: Arc<MarkerShared>,
}

// new & init
impl Marker {
    pub fn new() -> Self {
        Self::with_state(MarkerState::Pending)
    }

    /// 已经完成的 Marker
    pub fn completed() -> Self {
        Self::with_state(MarkerState::Completed)
    }

    pub fn failed(err: UploadError) -> Self {
        Self::with_state(MarkerState::Failed(err))
    }

    fn with_state(state: MarkerState) -> Self {
        Self {
            shared: Arc::new(MarkerShared {
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
        }
    }
}

impl Default for Marker {
    fn default() -> Self {
        Self::new()
    }
}

// getters
impl Marker {
    #[inline]
    pub fn state(&self) -> MarkerState {
        self.shared.state.lock().clone()
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        matches!(*self.shared.state.lock(), MarkerState::Completed)
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(*self.shared.state.lock(), MarkerState::Failed(_))
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.shared.state.lock().is_terminal()
    }

    /// 失败原因
    pub fn error(&self) -> Option<UploadError> {
        match &*self.shared.state.lock() {
            MarkerState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// 两个 Marker 是否观察同一个操作
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// 除了自己之外是否还有别的 clone
    #[inline]
    pub(crate) fn is_shared(&self) -> bool {
        Arc::strong_count(&self.shared) > 1
    }
}

// 状态推进
impl Marker {
    /// 只接受向前的状态变化，返回是否发生了变化
    fn advance(&self, next: MarkerState) -> bool {
        let mut state = self.shared.state.lock();
        if next.rank() <= state.rank() {
            return false;
        }
        let terminal = next.is_terminal();
        *state = next;
        if terminal {
            self.shared.cond.notify_all();
        }
        true
    }

    pub(crate) fn set_in_progress(&self) -> bool {
        self.advance(MarkerState::InProgress)
    }

    pub(crate) fn complete(&self) -> bool {
        self.advance(MarkerState::Completed)
    }

    pub(crate) fn fail(&self, err: UploadError) -> bool {
        self.advance(MarkerState::Failed(err))
    }
}

// 等待
impl Marker {
    /// 阻塞等待到终态
    ///
    /// - 完成返回 Ok
    /// - 失败返回失败原因
    /// - 超时返回 [`UploadError::Timeout`]；`timeout` 为 0 时只检查一次，不阻塞
    pub fn wait(&self, timeout: Duration) -> UploadResult<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                MarkerState::Completed => return Ok(()),
                MarkerState::Failed(err) => return Err(err.clone()),
                MarkerState::Pending | MarkerState::InProgress => {}
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(UploadError::Timeout(timeout));
                    }
                    // 超时后回到循环顶部，再检查一次状态
                    self.shared.cond.wait_until(&mut state, deadline);
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
    }
}

impl std::fmt::Debug for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Marker").field(&*self.shared.state.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_state_is_monotonic() {
        let marker = Marker::new();
        assert!(matches!(marker.state(), MarkerState::Pending));

        assert!(marker.set_in_progress());
        assert!(!marker.set_in_progress());
        assert!(marker.complete());

        // 终态之后不再变化
        assert!(!marker.fail(UploadError::Loader("late".to_string())));
        assert!(!marker.set_in_progress());
        assert!(marker.is_complete());
        assert!(marker.error().is_none());
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let marker = Marker::new();
        assert!(marker.fail(UploadError::decode(PathBuf::from("a.dds"), "bad")));
        assert!(marker.is_failed());
        assert!(!marker.complete());
        assert!(matches!(marker.wait(Duration::ZERO), Err(UploadError::Decode { .. })));
    }

    #[test]
    fn test_zero_timeout_does_not_block() {
        let marker = Marker::new();
        let start = Instant::now();
        assert!(matches!(marker.wait(Duration::ZERO), Err(UploadError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(Marker::completed().wait(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_wait_is_woken_by_other_thread() {
        let marker = Marker::new();
        let producer = marker.clone();
        assert!(marker.ptr_eq(&producer));

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.complete();
        });
        assert!(marker.wait(Duration::from_secs(10)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_without_deadline() {
        let marker = Marker::new();
        let producer = marker.clone();
        let handle = std::thread::spawn(move || producer.complete());
        assert!(marker.wait(Duration::MAX).is_ok());
        handle.join().unwrap();
    }
}
