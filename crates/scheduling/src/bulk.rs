use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use exercise_scheduler_domain::{
    AuthContext, Exercise, ExerciseRepository, NotificationGateway, Participation,
    ParticipationRepository, SchedulerError, SchedulerResult,
};

use crate::metrics::MetricsCollector;

/// 批量操作的参与记录筛选谓词
pub type ParticipationPredicate = Arc<dyn Fn(&Participation) -> bool + Send + Sync>;

/// 对单个参与记录执行的操作。每次调用获得显式的安全上下文，
/// 工作协程不继承调用方的权限。
pub type ParticipationAction = Arc<
    dyn Fn(Exercise, Participation, AuthContext) -> BoxFuture<'static, SchedulerResult<()>>
        + Send
        + Sync,
>;

/// 一次批量操作的聚合通知文案
#[derive(Debug, Clone, Copy)]
pub struct NotificationTexts {
    pub success: &'static str,
    pub failure_prefix: &'static str,
}

pub const LOCK_NOTIFICATION: NotificationTexts = NotificationTexts {
    success: "截止日期已到，所有学生仓库与参与记录已成功锁定",
    failure_prefix: "截止日期已到，锁定失败的参与记录数: ",
};

pub const UNLOCK_NOTIFICATION: NotificationTexts = NotificationTexts {
    success: "所有学生仓库与参与记录已成功解锁",
    failure_prefix: "解锁失败的参与记录数: ",
};

pub const STASH_NOTIFICATION: NotificationTexts = NotificationTexts {
    success: "所有在线编辑器变更已成功暂存",
    failure_prefix: "暂存在线编辑器变更失败的参与记录数: ",
};

/// 一次批量操作的聚合结果
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub operation_id: Uuid,
    pub succeeded: usize,
    pub failed_participations: Vec<i64>,
}

impl BatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed_participations.is_empty()
    }
}

/// 批量操作协调器：对满足谓词的每个参与记录执行给定操作。
///
/// 并发度固定（与批量大小无关），用于限制对下游仓库托管系统的压力；
/// 单个参与记录的失败被隔离收集，绝不中断同批的其他记录；整批应用
/// 一个宽松但有限的超时，超时后仍未完成的记录按失败计入通知。
pub struct BulkOperationCoordinator {
    exercise_repo: Arc<dyn ExerciseRepository>,
    participation_repo: Arc<dyn ParticipationRepository>,
    notifications: Arc<dyn NotificationGateway>,
    worker_count: usize,
    batch_timeout: Duration,
    metrics: Arc<MetricsCollector>,
}

impl BulkOperationCoordinator {
    pub fn new(
        exercise_repo: Arc<dyn ExerciseRepository>,
        participation_repo: Arc<dyn ParticipationRepository>,
        notifications: Arc<dyn NotificationGateway>,
        worker_count: usize,
        batch_timeout: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            exercise_repo,
            participation_repo,
            notifications,
            worker_count,
            batch_timeout,
            metrics,
        }
    }

    /// 对练习下满足谓词的所有参与记录执行操作并聚合结果。
    ///
    /// 参与记录集合在执行时从存储重新拉取，不信任调用方传入的旧列表。
    /// 完成后发送且只发送一条聚合通知（成功或"N个操作失败"）。
    pub async fn run_on_participations(
        &self,
        exercise_id: i64,
        operation_name: &str,
        auth: AuthContext,
        predicate: ParticipationPredicate,
        action: ParticipationAction,
        texts: NotificationTexts,
    ) -> SchedulerResult<BatchResult> {
        let operation_id = Uuid::new_v4();
        let started = Instant::now();
        info!(
            "开始执行批量操作 '{}' (操作ID: {}), 练习: {}",
            operation_name, operation_id, exercise_id
        );

        let exercise = self
            .exercise_repo
            .find_by_id(exercise_id)
            .await?
            .ok_or(SchedulerError::ExerciseNotFound { id: exercise_id })?;

        let participations = self.participation_repo.find_by_exercise(exercise_id).await?;
        let candidates: Vec<Participation> = participations
            .into_iter()
            .filter(|p| predicate(p))
            .collect();
        let candidate_ids: Vec<i64> = candidates.iter().map(|p| p.id).collect();

        // 每个参与记录完成后立即记录结果，整批超时后据此区分未完成项
        let results: Arc<Mutex<Vec<(i64, SchedulerResult<()>)>>> =
            Arc::new(Mutex::new(Vec::with_capacity(candidates.len())));

        let drive = {
            let results = Arc::clone(&results);
            let item_futures = candidates.into_iter().map(|participation| {
                let action = Arc::clone(&action);
                let auth = auth.clone();
                let exercise = exercise.clone();
                async move {
                    let participation_id = participation.id;
                    let result = action(exercise, participation, auth).await;
                    (participation_id, result)
                }
            });
            async move {
                let mut completed = stream::iter(item_futures).buffer_unordered(self.worker_count);
                while let Some(outcome) = completed.next().await {
                    results.lock().expect("batch results lock poisoned").push(outcome);
                }
            }
        };

        let timed_out = timeout(self.batch_timeout, drive).await.is_err();
        if timed_out {
            warn!(
                "批量操作 '{}' (操作ID: {}) 超时，未完成的参与记录按失败处理",
                operation_name, operation_id
            );
        }

        let (succeeded, completed_ids, mut failed_participations) = {
            let completed = results.lock().expect("batch results lock poisoned");
            let completed_ids: HashSet<i64> = completed.iter().map(|(id, _)| *id).collect();
            let mut succeeded = 0usize;
            let mut failed_participations = Vec::new();

            for (participation_id, result) in completed.iter() {
                match result {
                    Ok(()) => succeeded += 1,
                    Err(e) => {
                        error!(
                            "批量操作 '{}' 对参与记录 {} 执行失败: {}",
                            operation_name, participation_id, e
                        );
                        failed_participations.push(*participation_id);
                    }
                }
            }
            (succeeded, completed_ids, failed_participations)
        };

        for participation_id in &candidate_ids {
            if !completed_ids.contains(participation_id) {
                failed_participations.push(*participation_id);
            }
        }

        if !failed_participations.is_empty() {
            let failed_ids = failed_participations
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            warn!(
                "批量操作 '{}' 在练习 {} 下对这 {} 个参与记录失败: {}",
                operation_name,
                exercise_id,
                failed_participations.len(),
                failed_ids
            );
        }
        info!(
            "批量操作 '{}' (操作ID: {}) 完成, 成功: {}, 失败: {}",
            operation_name,
            operation_id,
            succeeded,
            failed_participations.len()
        );
        self.metrics.record_batch_operation(
            started.elapsed().as_secs_f64(),
            failed_participations.len() as u64,
        );

        // 单条聚合通知，绝不按参与记录逐条发送
        let summary = if failed_participations.is_empty() {
            texts.success.to_string()
        } else {
            format!("{}{}", texts.failure_prefix, failed_participations.len())
        };
        if let Err(e) = self
            .notifications
            .notify_instructors(&auth, exercise_id, &summary)
            .await
        {
            error!("批量操作 '{}' 的聚合通知发送失败: {}", operation_name, e);
        }

        Ok(BatchResult {
            operation_id,
            succeeded,
            failed_participations,
        })
    }
}
