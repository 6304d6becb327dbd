use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error};

const STATE_PENDING: u8 = 0;
const STATE_FIRED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

/// 延迟任务的可取消句柄。
/// 由创建它的注册表条目独占持有，被替换或删除时取消。
pub struct TaskHandle {
    state: Arc<AtomicU8>,
    cancel_notify: Arc<Notify>,
}

impl TaskHandle {
    /// 取消任务。幂等，触发后或重复调用均安全。
    /// 已经开始执行的回调不会被中断，只抑制尚未开始的触发。
    pub fn cancel(&self) {
        if self
            .state
            .compare_exchange(
                STATE_PENDING,
                STATE_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.cancel_notify.notify_one();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_FIRED
    }
}

/// 延迟任务引擎：在指定的未来时刻（或立即）在后台工作协程上
/// 执行一次回调。纯执行基底，自身没有任何业务副作用。
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskEngine;

impl TaskEngine {
    pub fn new() -> Self {
        Self
    }

    /// 在时刻 `at`（或尽快）执行一次 `task`，返回可取消句柄。
    /// 回调最多触发一次；取消与触发竞争时通过状态CAS决出唯一赢家。
    pub fn schedule(&self, at: DateTime<Utc>, task: BoxFuture<'static, ()>) -> TaskHandle {
        let state = Arc::new(AtomicU8::new(STATE_PENDING));
        let cancel_notify = Arc::new(Notify::new());

        let worker_state = Arc::clone(&state);
        let worker_notify = Arc::clone(&cancel_notify);
        tokio::spawn(async move {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = worker_notify.notified() => {
                    debug!("延迟任务在触发前被取消");
                    return;
                }
            }

            // 到点后与取消竞争：只有成功把状态从PENDING置为FIRED才执行
            if worker_state
                .compare_exchange(
                    STATE_PENDING,
                    STATE_FIRED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return;
            }

            // 回调panic必须被隔离：记录日志，不影响其他已调度任务
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("延迟任务回调发生panic，已隔离: {}", message);
            }
        });

        TaskHandle {
            state,
            cancel_notify,
        }
    }

    /// 立即执行一次 `task`
    pub fn schedule_now(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        self.schedule(Utc::now(), task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::advance;

    /// 推进虚拟时钟并让就绪任务运行完
    async fn advance_and_run(duration: Duration) {
        advance(duration).await;
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_fires_at_scheduled_time() {
        let engine = TaskEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        let handle = engine.schedule(
            Utc::now() + ChronoDuration::seconds(60),
            async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );

        advance_and_run(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.is_pending());

        advance_and_run(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handle.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_now_fires_immediately() {
        let engine = TaskEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        engine.schedule_now(
            async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );

        advance_and_run(Duration::from_millis(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_execution() {
        let engine = TaskEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        let handle = engine.schedule(
            Utc::now() + ChronoDuration::seconds(60),
            async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );

        handle.cancel();
        assert!(handle.is_cancelled());

        advance_and_run(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let engine = TaskEngine::new();
        let handle = engine.schedule(
            Utc::now() + ChronoDuration::seconds(60),
            async {}.boxed(),
        );

        handle.cancel();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_firing_is_noop() {
        let engine = TaskEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        let handle = engine.schedule(
            Utc::now() + ChronoDuration::seconds(1),
            async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );

        advance_and_run(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // 触发之后取消不得产生任何效果
        handle.cancel();
        assert!(handle.has_fired());
        assert!(!handle.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_does_not_affect_others() {
        let engine = TaskEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));

        engine.schedule(
            Utc::now() + ChronoDuration::seconds(1),
            async {
                panic!("回调内部错误");
            }
            .boxed(),
        );

        let fired_clone = Arc::clone(&fired);
        engine.schedule(
            Utc::now() + ChronoDuration::seconds(2),
            async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );

        advance_and_run(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_timestamp_fires_immediately() {
        let engine = TaskEngine::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        engine.schedule(
            Utc::now() - ChronoDuration::hours(1),
            async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );

        advance_and_run(Duration::from_millis(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
