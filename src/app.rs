use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::info;

use exercise_scheduler_core::AppConfig;
use exercise_scheduler_infrastructure::{
    InMemoryBuildTriggerGateway, InMemoryExamRepository, InMemoryExerciseRepository,
    InMemoryGradingGateway, InMemoryNotificationGateway, InMemoryParticipationRepository,
    InMemoryVersionControlGateway,
};
use exercise_scheduler_scheduling::{
    BulkOperationCoordinator, ExerciseScheduleService, LifecycleRegistry, MetricsCollector,
    SchedulingContext, TaskEngine,
};

/// 主应用程序：组装存储、外部协作方与调度编排器。
///
/// 持久化、版本控制、构建与通知都是本子系统边界之外的协作方，
/// 这里装配的是它们的内存实现。
pub struct Application {
    config: AppConfig,
    scheduler: Arc<ExerciseScheduleService>,
    registry: Arc<LifecycleRegistry>,
    exercise_repo: Arc<InMemoryExerciseRepository>,
    participation_repo: Arc<InMemoryParticipationRepository>,
    exam_repo: Arc<InMemoryExamRepository>,
    vcs: Arc<InMemoryVersionControlGateway>,
    builds: Arc<InMemoryBuildTriggerGateway>,
    grading: Arc<InMemoryGradingGateway>,
    notifications: Arc<InMemoryNotificationGateway>,
}

impl Application {
    /// 创建新的应用实例
    pub fn new(config: AppConfig) -> Result<Self> {
        info!(
            "初始化练习生命周期调度系统 (指标收集: {})",
            if config.observability.metrics_enabled {
                "开启"
            } else {
                "关闭"
            }
        );

        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(LifecycleRegistry::new(TaskEngine::new(), Arc::clone(&metrics)));

        let exercise_repo = Arc::new(InMemoryExerciseRepository::new());
        let participation_repo = Arc::new(InMemoryParticipationRepository::new());
        let exam_repo = Arc::new(InMemoryExamRepository::new());

        let vcs = Arc::new(InMemoryVersionControlGateway::new());
        let builds = Arc::new(InMemoryBuildTriggerGateway::new());
        let grading = Arc::new(InMemoryGradingGateway::new());
        let notifications = Arc::new(InMemoryNotificationGateway::new());

        let bulk = Arc::new(BulkOperationCoordinator::new(
            exercise_repo.clone(),
            participation_repo.clone(),
            notifications.clone(),
            config.scheduling.bulk_worker_count,
            Duration::from_secs(config.scheduling.bulk_timeout_seconds),
            Arc::clone(&metrics),
        ));

        let scheduler = Arc::new(ExerciseScheduleService::new(SchedulingContext {
            exercise_repo: exercise_repo.clone(),
            participation_repo: participation_repo.clone(),
            exam_repo: exam_repo.clone(),
            vcs: vcs.clone(),
            builds: builds.clone(),
            grading: grading.clone(),
            notifications: notifications.clone(),
            registry: Arc::clone(&registry),
            bulk,
            config: config.scheduling.clone(),
            metrics,
        }));

        Ok(Self {
            config,
            scheduler,
            registry,
            exercise_repo,
            participation_repo,
            exam_repo,
            vcs,
            builds,
            grading,
            notifications,
        })
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        // 启动重调度延后执行，避免拖慢应用就绪
        let delay_seconds = self.config.scheduling.startup_delay_seconds;
        let jitter_seconds = if self.config.scheduling.startup_jitter_seconds > 0 {
            rand::rng().random_range(0..=self.config.scheduling.startup_jitter_seconds)
        } else {
            0
        };
        info!(
            "启动重调度将在 {} 秒后执行 (含 {} 秒抖动)",
            delay_seconds + jitter_seconds,
            jitter_seconds
        );

        let scheduler = Arc::clone(&self.scheduler);
        let startup_handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_seconds + jitter_seconds)).await;
            scheduler.schedule_running_exercises_on_startup().await;
        });

        let _ = shutdown_rx.recv().await;
        info!(
            "收到关闭信号，注销全部定时任务 (当前未决任务: {})",
            self.registry.total_pending_count()
        );
        startup_handle.abort();
        // 尽力而为：进程重启后由启动重调度恢复
        self.registry.clear_all();
        Ok(())
    }

    pub fn scheduler(&self) -> Arc<ExerciseScheduleService> {
        Arc::clone(&self.scheduler)
    }

    pub fn registry(&self) -> Arc<LifecycleRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn exercise_repo(&self) -> Arc<InMemoryExerciseRepository> {
        Arc::clone(&self.exercise_repo)
    }

    pub fn participation_repo(&self) -> Arc<InMemoryParticipationRepository> {
        Arc::clone(&self.participation_repo)
    }

    pub fn exam_repo(&self) -> Arc<InMemoryExamRepository> {
        Arc::clone(&self.exam_repo)
    }

    pub fn vcs(&self) -> Arc<InMemoryVersionControlGateway> {
        Arc::clone(&self.vcs)
    }

    pub fn builds(&self) -> Arc<InMemoryBuildTriggerGateway> {
        Arc::clone(&self.builds)
    }

    pub fn grading(&self) -> Arc<InMemoryGradingGateway> {
        Arc::clone(&self.grading)
    }

    pub fn notifications(&self) -> Arc<InMemoryNotificationGateway> {
        Arc::clone(&self.notifications)
    }
}
