use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::debug;

use exercise_scheduler_domain::{
    ExerciseLifecycle, LifecycleKey, ParticipationLifecycle, ParticipationLifecycleKey,
};

use crate::metrics::MetricsCollector;
use crate::task_engine::{TaskEngine, TaskHandle};

/// 生命周期任务回调：触发时被消费一次
pub type LifecycleTask = BoxFuture<'static, ()>;

#[derive(Default)]
struct RegistryState {
    exercise_tasks: HashMap<LifecycleKey, Vec<TaskHandle>>,
    participation_tasks: HashMap<ParticipationLifecycleKey, Vec<TaskHandle>>,
}

/// 生命周期注册表：键到未决任务句柄集合的唯一共享可变状态。
///
/// 不变量：每个键任何时刻最多存在一个活跃句柄集合；每次schedule调用
/// 隐含一个"先取消旧集合、再安装新集合"的事务。键级的替换在内部锁的
/// 保护下原子完成，并发的同键重调度不可能留下重复或孤儿定时器。
pub struct LifecycleRegistry {
    engine: TaskEngine,
    state: Mutex<RegistryState>,
    metrics: Arc<MetricsCollector>,
}

impl LifecycleRegistry {
    pub fn new(engine: TaskEngine, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            engine,
            state: Mutex::new(RegistryState::default()),
            metrics,
        }
    }

    /// 为练习生命周期调度单个任务，替换该键下已有的句柄集合
    pub fn schedule_exercise_task(
        &self,
        exercise_id: i64,
        lifecycle: ExerciseLifecycle,
        at: DateTime<Utc>,
        task: LifecycleTask,
    ) {
        self.schedule_exercise_tasks(exercise_id, lifecycle, vec![(at, task)]);
    }

    /// 同一逻辑生命周期下调度一组相互独立的任务（例如每个截止时间分组一个），
    /// 整组作为一个句柄集合被原子替换
    pub fn schedule_exercise_tasks(
        &self,
        exercise_id: i64,
        lifecycle: ExerciseLifecycle,
        tasks: Vec<(DateTime<Utc>, LifecycleTask)>,
    ) {
        let key = LifecycleKey::new(exercise_id, lifecycle);
        let mut state = self.state.lock().expect("registry lock poisoned");

        if let Some(old) = state.exercise_tasks.remove(&key) {
            cancel_handles(&old, &self.metrics);
        }

        let mut handles = Vec::with_capacity(tasks.len());
        for (at, task) in tasks {
            handles.push(self.engine.schedule(at, task));
            self.metrics.record_task_scheduled();
        }
        debug!(
            "练习 {} 的生命周期 {:?} 注册了 {} 个任务",
            exercise_id,
            lifecycle,
            handles.len()
        );
        state.exercise_tasks.insert(key, handles);
    }

    /// 为单个参与记录的生命周期调度任务，同键替换语义与练习级一致
    pub fn schedule_participation_task(
        &self,
        exercise_id: i64,
        participation_id: i64,
        lifecycle: ParticipationLifecycle,
        at: DateTime<Utc>,
        task: LifecycleTask,
    ) {
        let key = ParticipationLifecycleKey::new(exercise_id, participation_id, lifecycle);
        let mut state = self.state.lock().expect("registry lock poisoned");

        if let Some(old) = state.participation_tasks.remove(&key) {
            cancel_handles(&old, &self.metrics);
        }

        let handle = self.engine.schedule(at, task);
        self.metrics.record_task_scheduled();
        state.participation_tasks.insert(key, vec![handle]);
    }

    /// 注销练习生命周期的任务，并按生命周期映射级联注销该练习下
    /// 对应参与级生命周期的全部任务。级联由注册表结构性保证，
    /// 不依赖调用方自觉。
    pub fn cancel(&self, exercise_id: i64, lifecycle: ExerciseLifecycle) {
        let key = LifecycleKey::new(exercise_id, lifecycle);
        let mut state = self.state.lock().expect("registry lock poisoned");

        if let Some(handles) = state.exercise_tasks.remove(&key) {
            cancel_handles(&handles, &self.metrics);
            debug!("已注销练习 {} 的生命周期 {:?}", exercise_id, lifecycle);
        }

        if let Some(sub_lifecycle) = lifecycle.participation_lifecycle() {
            let matching: Vec<ParticipationLifecycleKey> = state
                .participation_tasks
                .keys()
                .filter(|k| k.exercise_id == exercise_id && k.lifecycle == sub_lifecycle)
                .copied()
                .collect();
            for sub_key in matching {
                if let Some(handles) = state.participation_tasks.remove(&sub_key) {
                    cancel_handles(&handles, &self.metrics);
                }
            }
        }
    }

    /// 注销单个参与记录的某个生命周期任务
    pub fn cancel_participation(
        &self,
        exercise_id: i64,
        participation_id: i64,
        lifecycle: ParticipationLifecycle,
    ) {
        let key = ParticipationLifecycleKey::new(exercise_id, participation_id, lifecycle);
        let mut state = self.state.lock().expect("registry lock poisoned");
        if let Some(handles) = state.participation_tasks.remove(&key) {
            cancel_handles(&handles, &self.metrics);
        }
    }

    /// 注销一个参与记录的全部生命周期任务（个人截止日期被移除时使用）
    pub fn cancel_all_participation_lifecycles(&self, exercise_id: i64, participation_id: i64) {
        for lifecycle in ParticipationLifecycle::ALL {
            self.cancel_participation(exercise_id, participation_id, lifecycle);
        }
    }

    /// 注销全部任务，仅供测试与进程关闭使用
    pub fn clear_all(&self) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        for handles in state.exercise_tasks.values() {
            cancel_handles(handles, &self.metrics);
        }
        for handles in state.participation_tasks.values() {
            cancel_handles(handles, &self.metrics);
        }
        state.exercise_tasks.clear();
        state.participation_tasks.clear();
    }

    /// 某练习生命周期键下当前注册的句柄数
    pub fn exercise_task_count(&self, exercise_id: i64, lifecycle: ExerciseLifecycle) -> usize {
        let state = self.state.lock().expect("registry lock poisoned");
        state
            .exercise_tasks
            .get(&LifecycleKey::new(exercise_id, lifecycle))
            .map_or(0, |handles| handles.len())
    }

    /// 某练习生命周期键下尚未触发也未取消的句柄数
    pub fn pending_exercise_task_count(
        &self,
        exercise_id: i64,
        lifecycle: ExerciseLifecycle,
    ) -> usize {
        let state = self.state.lock().expect("registry lock poisoned");
        state
            .exercise_tasks
            .get(&LifecycleKey::new(exercise_id, lifecycle))
            .map_or(0, |handles| {
                handles.iter().filter(|h| h.is_pending()).count()
            })
    }

    pub fn has_pending_participation_task(
        &self,
        exercise_id: i64,
        participation_id: i64,
        lifecycle: ParticipationLifecycle,
    ) -> bool {
        let state = self.state.lock().expect("registry lock poisoned");
        state
            .participation_tasks
            .get(&ParticipationLifecycleKey::new(
                exercise_id,
                participation_id,
                lifecycle,
            ))
            .is_some_and(|handles| handles.iter().any(|h| h.is_pending()))
    }

    /// 全部未决任务总数，关闭与健康日志使用
    pub fn total_pending_count(&self) -> usize {
        let state = self.state.lock().expect("registry lock poisoned");
        let exercise_pending: usize = state
            .exercise_tasks
            .values()
            .map(|handles| handles.iter().filter(|h| h.is_pending()).count())
            .sum();
        let participation_pending: usize = state
            .participation_tasks
            .values()
            .map(|handles| handles.iter().filter(|h| h.is_pending()).count())
            .sum();
        exercise_pending + participation_pending
    }
}

fn cancel_handles(handles: &[TaskHandle], metrics: &MetricsCollector) {
    let mut cancelled = 0u64;
    for handle in handles {
        if handle.is_pending() {
            cancelled += 1;
        }
        handle.cancel();
    }
    if cancelled > 0 {
        metrics.record_tasks_cancelled(cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{advance, sleep};

    fn new_registry() -> LifecycleRegistry {
        LifecycleRegistry::new(TaskEngine::new(), Arc::new(MetricsCollector::new()))
    }

    fn counting_task(counter: &Arc<AtomicUsize>) -> LifecycleTask {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    async fn advance_and_run(duration: Duration) {
        advance(duration).await;
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_handles() {
        let registry = new_registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let at = Utc::now() + ChronoDuration::seconds(60);

        // 相同日期调度两次，键下必须只剩一个活跃句柄集合
        registry.schedule_exercise_task(1, ExerciseLifecycle::Due, at, counting_task(&fired));
        registry.schedule_exercise_task(1, ExerciseLifecycle::Due, at, counting_task(&fired));

        assert_eq!(registry.exercise_task_count(1, ExerciseLifecycle::Due), 1);
        assert_eq!(
            registry.pending_exercise_task_count(1, ExerciseLifecycle::Due),
            1
        );

        advance_and_run(Duration::from_secs(61)).await;
        // 旧定时器已被取消，回调只执行一次
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_cascades_to_participation_tasks() {
        let registry = new_registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let at = Utc::now() + ChronoDuration::seconds(60);

        registry.schedule_exercise_task(1, ExerciseLifecycle::Due, at, counting_task(&fired));
        registry.schedule_participation_task(
            1,
            10,
            ParticipationLifecycle::Due,
            at,
            counting_task(&fired),
        );
        registry.schedule_participation_task(
            1,
            11,
            ParticipationLifecycle::Due,
            at,
            counting_task(&fired),
        );
        // 其他练习的参与任务不受影响
        registry.schedule_participation_task(
            2,
            20,
            ParticipationLifecycle::Due,
            at,
            counting_task(&fired),
        );

        registry.cancel(1, ExerciseLifecycle::Due);

        assert!(!registry.has_pending_participation_task(1, 10, ParticipationLifecycle::Due));
        assert!(!registry.has_pending_participation_task(1, 11, ParticipationLifecycle::Due));
        assert!(registry.has_pending_participation_task(2, 20, ParticipationLifecycle::Due));

        advance_and_run(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_release_does_not_cascade() {
        let registry = new_registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let at = Utc::now() + ChronoDuration::seconds(60);

        registry.schedule_participation_task(
            1,
            10,
            ParticipationLifecycle::Due,
            at,
            counting_task(&fired),
        );
        // Release 没有对应的参与级生命周期
        registry.cancel(1, ExerciseLifecycle::Release);

        assert!(registry.has_pending_participation_task(1, 10, ParticipationLifecycle::Due));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_task_group_under_one_key() {
        let registry = new_registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let now = Utc::now();

        registry.schedule_exercise_tasks(
            1,
            ExerciseLifecycle::Due,
            vec![
                (now + ChronoDuration::seconds(30), counting_task(&fired)),
                (now + ChronoDuration::seconds(60), counting_task(&fired)),
                (now + ChronoDuration::seconds(90), counting_task(&fired)),
            ],
        );
        assert_eq!(registry.exercise_task_count(1, ExerciseLifecycle::Due), 3);

        advance_and_run(Duration::from_secs(65)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // 整组替换：剩余的第三个任务也一并取消
        registry.schedule_exercise_tasks(1, ExerciseLifecycle::Due, vec![]);
        advance_and_run(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_participation_lifecycles() {
        let registry = new_registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let at = Utc::now() + ChronoDuration::seconds(60);

        registry.schedule_participation_task(
            1,
            10,
            ParticipationLifecycle::Due,
            at,
            counting_task(&fired),
        );
        registry.schedule_participation_task(
            1,
            10,
            ParticipationLifecycle::BuildAndTestAfterDueDate,
            at,
            counting_task(&fired),
        );

        registry.cancel_all_participation_lifecycles(1, 10);

        assert!(!registry.has_pending_participation_task(1, 10, ParticipationLifecycle::Due));
        assert!(!registry.has_pending_participation_task(
            1,
            10,
            ParticipationLifecycle::BuildAndTestAfterDueDate
        ));

        advance_and_run(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all() {
        let registry = new_registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let at = Utc::now() + ChronoDuration::seconds(60);

        registry.schedule_exercise_task(1, ExerciseLifecycle::Release, at, counting_task(&fired));
        registry.schedule_exercise_task(2, ExerciseLifecycle::Due, at, counting_task(&fired));
        registry.schedule_participation_task(
            1,
            10,
            ParticipationLifecycle::Due,
            at,
            counting_task(&fired),
        );
        assert_eq!(registry.total_pending_count(), 3);

        registry.clear_all();
        assert_eq!(registry.total_pending_count(), 0);

        advance_and_run(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reschedules_leave_single_handle_set() {
        let registry = Arc::new(new_registry());
        let fired = Arc::new(AtomicUsize::new(0));
        let at = Utc::now() + ChronoDuration::seconds(60);

        let mut join_handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let fired = Arc::clone(&fired);
            join_handles.push(tokio::spawn(async move {
                let task = {
                    let fired = Arc::clone(&fired);
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                    .boxed()
                };
                registry.schedule_exercise_task(1, ExerciseLifecycle::Due, at, task);
            }));
        }
        for handle in join_handles {
            handle.await.unwrap();
        }

        assert_eq!(
            registry.pending_exercise_task_count(1, ExerciseLifecycle::Due),
            1
        );

        advance_and_run(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
