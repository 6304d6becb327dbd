use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use exercise_scheduler_core::config::SchedulingConfig;
use exercise_scheduler_domain::{
    AuthContext, BuildTriggerGateway, Exam, ExamRepository, Exercise, ExerciseLifecycle,
    ExerciseRepository, GradingGateway, NotificationGateway, ParticipationLifecycle,
    ParticipationRepository, SchedulerError, SchedulerResult, StudentExam, VersionControlGateway,
};

use crate::bulk::{
    BulkOperationCoordinator, ParticipationAction, ParticipationPredicate, LOCK_NOTIFICATION,
    STASH_NOTIFICATION, UNLOCK_NOTIFICATION,
};
use crate::metrics::MetricsCollector;
use crate::policy;
use crate::registry::LifecycleRegistry;

/// 评审截止任务发送给教师的通知文案
const ASSESSMENT_DUE_NOTIFICATION: &str = "评审截止日期已到，最新评审结果已对学生可见";

/// 调度编排所需的全部依赖。
/// 触发回调只捕获这里的Arc与不可变id，从不捕获实体快照。
pub struct SchedulingContext {
    pub exercise_repo: Arc<dyn ExerciseRepository>,
    pub participation_repo: Arc<dyn ParticipationRepository>,
    pub exam_repo: Arc<dyn ExamRepository>,
    pub vcs: Arc<dyn VersionControlGateway>,
    pub builds: Arc<dyn BuildTriggerGateway>,
    pub grading: Arc<dyn GradingGateway>,
    pub notifications: Arc<dyn NotificationGateway>,
    pub registry: Arc<LifecycleRegistry>,
    pub bulk: Arc<BulkOperationCoordinator>,
    pub config: SchedulingConfig,
    pub metrics: Arc<MetricsCollector>,
}

/// 练习调度编排器。
///
/// 在练习创建/更新/启动时计算哪些生命周期事件仍然相关，并通过生命周期
/// 注册表注册对应的回调（锁定、解锁、重新构建、成绩重算）。回调在触发
/// 时重新拉取权威状态，配置在注册与触发之间被修改时空转返回。
pub struct ExerciseScheduleService {
    ctx: Arc<SchedulingContext>,
}

impl ExerciseScheduleService {
    pub fn new(ctx: SchedulingContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// 练习保存或更新后由外部调用
    pub async fn on_exercise_saved(&self, exercise_id: i64) {
        match self.ctx.exercise_repo.find_by_id(exercise_id).await {
            Ok(Some(exercise)) => self.update_scheduling(&exercise).await,
            Ok(None) => {
                warn!("练习 {} 已不存在，注销其全部定时任务", exercise_id);
                self.cancel_all_scheduled_tasks(exercise_id);
            }
            Err(e) => error!("读取练习 {} 失败，跳过本次调度: {}", exercise_id, e),
        }
    }

    /// 练习删除后由外部调用
    pub fn on_exercise_deleted(&self, exercise_id: i64) {
        self.cancel_all_scheduled_tasks(exercise_id);
    }

    /// 为更新后的练习重建或注销定时任务
    pub async fn update_scheduling(&self, exercise: &Exercise) {
        let started = Instant::now();
        // 一次调度过程内使用统一的now
        let now = Utc::now();

        let (latest_individual_due_date, assume_needed) = match self
            .ctx
            .participation_repo
            .latest_individual_due_date(exercise.id)
            .await
        {
            Ok(date) => (date, false),
            Err(e) => {
                // 读不到个人截止日期时保守处理：宁可多调度也不能漏掉动作
                error!(
                    "读取练习 {} 的最晚个人截止日期失败，保守地继续调度: {}",
                    exercise.id, e
                );
                (None, true)
            }
        };

        if !assume_needed && !policy::needs_scheduling(exercise, latest_individual_due_date, now) {
            // 练习的任何调度都不再必要时，注销全部已注册的任务
            debug!("练习 {} 不再需要调度，注销全部定时任务", exercise.id);
            self.cancel_all_scheduled_tasks(exercise.id);
            return;
        }

        if let Err(e) = self.schedule_exercise(exercise, now).await {
            error!("调度练习 {} 失败: {}", exercise.id, e);
        }
        self.ctx
            .metrics
            .record_scheduling_pass(started.elapsed().as_secs_f64());
    }

    /// 启动时重调度所有仍然相关的练习。
    /// 单个练习的失败被隔离记录，不得中断其余练习。
    pub async fn schedule_running_exercises_on_startup(&self) {
        let now = Utc::now();

        match self.ctx.exercise_repo.find_all_needing_scheduling(now).await {
            Ok(exercises) => {
                let mut scheduled = 0usize;
                for exercise in &exercises {
                    match self.schedule_exercise(exercise, now).await {
                        Ok(()) => scheduled += 1,
                        Err(e) => error!("启动时调度练习 {} 失败: {}", exercise.id, e),
                    }
                }
                info!("启动时调度了 {} 个练习", scheduled);
            }
            Err(e) => error!("启动重调度失败，无法读取练习列表: {}", e),
        }

        match self
            .ctx
            .exercise_repo
            .find_exam_exercises_with_running_exam(now)
            .await
        {
            Ok(exercises) => {
                let mut scheduled = 0usize;
                for exercise in &exercises {
                    match self.schedule_exercise(exercise, now).await {
                        Ok(()) => scheduled += 1,
                        Err(e) => error!("启动时调度考试练习 {} 失败: {}", exercise.id, e),
                    }
                }
                info!("启动时调度了 {} 个考试练习", scheduled);
            }
            Err(e) => error!("启动重调度失败，无法读取考试练习列表: {}", e),
        }
    }

    /// 考试进行中被延长时，按最新的个人工作时间重建锁定分组
    pub async fn reschedule_exam_during_conduction(&self, exam_id: i64) {
        let result: SchedulerResult<()> = async {
            let exam = self
                .ctx
                .exam_repo
                .find_by_id(exam_id)
                .await?
                .ok_or(SchedulerError::ExamNotFound { id: exam_id })?;
            let student_exams = self.ctx.exam_repo.find_student_exams(exam_id).await?;
            let exercises = self.ctx.exercise_repo.find_by_exam(exam_id).await?;
            for exercise in &exercises {
                self.reschedule_exam_exercise_during_conduction(exercise, &exam, &student_exams)
                    .await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            error!("考试 {} 进行中的重调度失败: {}", exam_id, e);
        }
    }

    /// 单个学生的考试工作时间变化后重建锁定分组。
    /// 分组定时任务按键整组替换，因此这里重建整场考试的分组，
    /// 避免丢掉其他学生的定时任务。
    pub async fn reschedule_student_exam(&self, student_exam_id: i64) {
        match self.ctx.exam_repo.find_student_exam(student_exam_id).await {
            Ok(Some(student_exam)) => {
                self.reschedule_exam_during_conduction(student_exam.exam_id)
                    .await;
            }
            Ok(None) => warn!("学生考试记录 {} 不存在，跳过重调度", student_exam_id),
            Err(e) => error!("读取学生考试记录 {} 失败: {}", student_exam_id, e),
        }
    }

    /// 注销练习的全部生命周期任务（练习级与参与级）
    pub fn cancel_all_scheduled_tasks(&self, exercise_id: i64) {
        for lifecycle in ExerciseLifecycle::ALL {
            self.ctx.registry.cancel(exercise_id, lifecycle);
        }
    }

    async fn schedule_exercise(
        &self,
        exercise: &Exercise,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        if exercise.is_exam_exercise() {
            self.schedule_exam_exercise(exercise, now).await
        } else {
            self.schedule_course_exercise(exercise, now).await
        }
    }

    async fn schedule_course_exercise(
        &self,
        exercise: &Exercise,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let ctx = &self.ctx;

        // 发布日期在将来：发布前合并模板仓库提交。
        // 日期被改到过去时必须主动注销，而不是留着不管。
        if let Some(release) = exercise.release_date.filter(|d| now < *d) {
            let at = release - Duration::seconds(ctx.config.template_commit_lead_seconds);
            ctx.registry.schedule_exercise_task(
                exercise.id,
                ExerciseLifecycle::Release,
                at,
                release_task(Arc::clone(ctx), exercise.id, release).boxed(),
            );
            debug!(
                "已调度练习 '{}' (#{}) 发布前的模板提交合并, 发布时间 {}",
                exercise.title, exercise.id, release
            );
        } else {
            ctx.registry.cancel(exercise.id, ExerciseLifecycle::Release);
        }

        let update_scores = match self.is_score_update_after_due_date_needed(exercise).await {
            Ok(value) => value,
            Err(e) => {
                // 成绩端口不可用不能阻止锁定任务的注册
                warn!(
                    "无法判断练习 {} 是否需要截止后的成绩重算，按不需要处理: {}",
                    exercise.id, e
                );
                false
            }
        };

        // 截止日期在将来：锁定常规截止日期的参与记录
        match exercise.due_date {
            Some(due) if !policy::is_past_due_date(exercise, now) => {
                ctx.registry.schedule_exercise_task(
                    exercise.id,
                    ExerciseLifecycle::Due,
                    due,
                    due_date_task(Arc::clone(ctx), exercise.id, due, update_scores).boxed(),
                );
                debug!(
                    "已调度练习 '{}' (#{}) 截止日期的仓库锁定, 时间 {}",
                    exercise.title, exercise.id, due
                );
            }
            _ => ctx.registry.cancel(exercise.id, ExerciseLifecycle::Due),
        }

        // 截止后统一重新构建
        if let Some(build_date) = exercise.build_and_test_after_due_date.filter(|d| now < *d) {
            ctx.registry.schedule_exercise_task(
                exercise.id,
                ExerciseLifecycle::BuildAndTestAfterDueDate,
                build_date,
                build_and_test_task(Arc::clone(ctx), exercise.id, build_date).boxed(),
            );
            debug!(
                "已调度练习 '{}' (#{}) 截止后的重新构建, 时间 {}",
                exercise.title, exercise.id, build_date
            );
        } else {
            ctx.registry
                .cancel(exercise.id, ExerciseLifecycle::BuildAndTestAfterDueDate);
        }

        // 评审截止
        match exercise.assessment_due_date {
            Some(assessment_due) if !policy::is_past_assessment_due_date(exercise, now) => {
                ctx.registry.schedule_exercise_task(
                    exercise.id,
                    ExerciseLifecycle::AssessmentDue,
                    assessment_due,
                    assessment_due_task(Arc::clone(ctx), exercise.id, assessment_due).boxed(),
                );
            }
            _ => ctx
                .registry
                .cancel(exercise.id, ExerciseLifecycle::AssessmentDue),
        }

        self.schedule_participation_tasks(exercise, now, update_scores)
            .await
    }

    /// 为设置了个人截止日期的参与记录调度专属任务；
    /// 个人截止日期不复存在的参与记录注销其全部参与级任务
    async fn schedule_participation_tasks(
        &self,
        exercise: &Exercise,
        now: DateTime<Utc>,
        update_scores: bool,
    ) -> SchedulerResult<()> {
        let mut scheduled_ids: HashSet<i64> = HashSet::new();

        // 个人截止日期只有在练习本身有截止日期时才有意义
        if exercise.due_date.is_some() {
            let with_individual = self
                .ctx
                .participation_repo
                .find_with_individual_due_date_by_exercise(exercise.id)
                .await?;
            for participation in &with_individual {
                if let Some(individual_due) = participation.individual_due_date {
                    self.schedule_participation_with_individual_due_date(
                        exercise,
                        participation.id,
                        individual_due,
                        now,
                        update_scores,
                    );
                    scheduled_ids.insert(participation.id);
                }
            }
        }

        // 其余参与记录不再持有个人截止日期，注销可能遗留的专属任务
        let participations = self
            .ctx
            .participation_repo
            .find_by_exercise(exercise.id)
            .await?;
        for participation in &participations {
            if !scheduled_ids.contains(&participation.id) {
                self.ctx
                    .registry
                    .cancel_all_participation_lifecycles(exercise.id, participation.id);
            }
        }
        Ok(())
    }

    fn schedule_participation_with_individual_due_date(
        &self,
        exercise: &Exercise,
        participation_id: i64,
        individual_due: DateTime<Utc>,
        now: DateTime<Utc>,
        update_scores: bool,
    ) {
        let ctx = &self.ctx;
        let before_due = now < individual_due;

        if before_due {
            ctx.registry.schedule_participation_task(
                exercise.id,
                participation_id,
                ParticipationLifecycle::Due,
                individual_due,
                participation_due_task(
                    Arc::clone(ctx),
                    exercise.id,
                    participation_id,
                    individual_due,
                    update_scores,
                )
                .boxed(),
            );
            debug!(
                "已为参与记录 {} 调度个人截止日期的锁定任务, 时间 {}",
                participation_id, individual_due
            );
        } else {
            ctx.registry.cancel_participation(
                exercise.id,
                participation_id,
                ParticipationLifecycle::Due,
            );
        }

        // 个人截止日期晚于统一重构时间时，该参与记录需要单独的构建任务
        let needs_individual_build = before_due
            && exercise
                .build_and_test_after_due_date
                .is_some_and(|build| individual_due > build);
        if needs_individual_build {
            ctx.registry.schedule_participation_task(
                exercise.id,
                participation_id,
                ParticipationLifecycle::BuildAndTestAfterDueDate,
                individual_due,
                participation_build_task(
                    Arc::clone(ctx),
                    exercise.id,
                    participation_id,
                    individual_due,
                )
                .boxed(),
            );
        } else {
            ctx.registry.cancel_participation(
                exercise.id,
                participation_id,
                ParticipationLifecycle::BuildAndTestAfterDueDate,
            );
        }
    }

    async fn schedule_exam_exercise(
        &self,
        exercise: &Exercise,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let ctx = &self.ctx;
        let Some(exam_id) = exercise.exam_id else {
            return Err(SchedulerError::invalid_dates(
                exercise.id,
                "考试练习缺少考试ID",
            ));
        };
        let exam = ctx
            .exam_repo
            .find_by_id(exam_id)
            .await?
            .ok_or(SchedulerError::ExamNotFound { id: exam_id })?;

        if exam.visible_date.is_none() || exam.start_date.is_none() {
            error!(
                "考试练习 {} 无法正确调度, 可见时间 {:?}, 开始时间 {:?}",
                exercise.id, exam.visible_date, exam.start_date
            );
            return Ok(());
        }
        let Some(unlock_date) = policy::exam_unlock_date(&exam) else {
            return Ok(());
        };

        if now < unlock_date {
            // 考试开始前：在统一解锁时间解锁学生仓库。
            // 使用考试自定义的解锁时间，而不是练习自身的生命周期日期。
            ctx.registry.schedule_exercise_tasks(
                exercise.id,
                ExerciseLifecycle::Release,
                vec![(
                    unlock_date,
                    exam_unlock_task(Arc::clone(ctx), exercise.id, exam_id).boxed(),
                )],
            );
        } else {
            let student_exams = ctx.exam_repo.find_student_exams(exam_id).await?;
            if policy::latest_individual_exam_end(&exam, &student_exams)
                .is_some_and(|end| now < end)
            {
                // 考试进行中：这只是一个补偿措施（例如本节点在考试期间
                // 崩溃重启），稍后补做解锁并按个人工作时间重排锁定
                let backup_at =
                    now + Duration::seconds(ctx.config.exam_backup_unlock_delay_seconds);
                ctx.registry.schedule_exercise_tasks(
                    exercise.id,
                    ExerciseLifecycle::Release,
                    vec![(
                        backup_at,
                        exam_unlock_task(Arc::clone(ctx), exercise.id, exam_id).boxed(),
                    )],
                );
                self.reschedule_exam_exercise_during_conduction(exercise, &exam, &student_exams)
                    .await?;
            }
            // 考试结束后无需任何动作
        }

        if let Some(build_date) = exercise.build_and_test_after_due_date.filter(|d| now < *d) {
            ctx.registry.schedule_exercise_task(
                exercise.id,
                ExerciseLifecycle::BuildAndTestAfterDueDate,
                build_date,
                build_and_test_task(Arc::clone(ctx), exercise.id, build_date).boxed(),
            );
        } else {
            ctx.registry
                .cancel(exercise.id, ExerciseLifecycle::BuildAndTestAfterDueDate);
        }
        debug!("已调度考试练习 '{}' (#{})", exercise.title, exercise.id);
        Ok(())
    }

    async fn reschedule_exam_exercise_during_conduction(
        &self,
        exercise: &Exercise,
        exam: &Exam,
        student_exams: &[StudentExam],
    ) -> SchedulerResult<()> {
        let working_times = working_time_by_student(student_exams);
        let participations = self
            .ctx
            .participation_repo
            .find_by_exercise(exercise.id)
            .await?;
        let pairs: Vec<(DateTime<Utc>, i64)> = participations
            .iter()
            .filter_map(|p| {
                let working_time = working_times
                    .get(&p.student)
                    .copied()
                    .unwrap_or(exam.working_time_seconds);
                policy::exam_effective_due_date(exam, working_time).map(|due| (due, p.id))
            })
            .collect();
        schedule_individual_lock_tasks(&self.ctx, exercise.id, pairs);
        Ok(())
    }

    /// 没有统一重构日期、但存在截止后才可见的测试用例时，
    /// 截止任务额外负责成绩重算，使这些测试的反馈进入学生成绩
    async fn is_score_update_after_due_date_needed(
        &self,
        exercise: &Exercise,
    ) -> SchedulerResult<bool> {
        if exercise.build_and_test_after_due_date.is_some() {
            return Ok(false);
        }
        let auth = AuthContext::system();
        self.ctx
            .grading
            .has_tests_visible_after_due_date(&auth, exercise.id)
            .await
    }
}

/// 把(截止时间, 参与记录)按截止时间分组后调度锁定任务：
/// 同一时间点只产生一个定时任务，整组在练习的DUE键下原子替换
fn schedule_individual_lock_tasks(
    ctx: &Arc<SchedulingContext>,
    exercise_id: i64,
    pairs: Vec<(DateTime<Utc>, i64)>,
) {
    let mut groups: HashMap<DateTime<Utc>, HashSet<i64>> = HashMap::new();
    for (due, participation_id) in pairs {
        groups.entry(due).or_default().insert(participation_id);
    }

    let tasks = groups
        .into_iter()
        .map(|(due, participation_ids)| {
            let task =
                group_lock_task(Arc::clone(ctx), exercise_id, due, participation_ids).boxed();
            (due, task)
        })
        .collect();
    ctx.registry
        .schedule_exercise_tasks(exercise_id, ExerciseLifecycle::Due, tasks);
}

fn working_time_by_student(student_exams: &[StudentExam]) -> HashMap<String, i64> {
    student_exams
        .iter()
        .map(|se| (se.student.clone(), se.working_time_seconds))
        .collect()
}

/// 触发时重新拉取练习，不存在或读取失败按无操作处理
async fn fetch_exercise(ctx: &Arc<SchedulingContext>, exercise_id: i64) -> Option<Exercise> {
    match ctx.exercise_repo.find_by_id(exercise_id).await {
        Ok(Some(exercise)) => Some(exercise),
        Ok(None) => {
            error!("练习 {} 在定时任务触发时已不存在", exercise_id);
            None
        }
        Err(e) => {
            error!("定时任务触发时读取练习 {} 失败: {}", exercise_id, e);
            None
        }
    }
}

fn stale_no_op(ctx: &Arc<SchedulingContext>, exercise_id: i64, what: &str) {
    ctx.metrics.record_stale_fire();
    info!(
        "练习 {} 的{}日期在任务注册后被修改，跳过本次触发",
        exercise_id, what
    );
}

/// 发布任务：合并模板仓库提交
async fn release_task(
    ctx: Arc<SchedulingContext>,
    exercise_id: i64,
    expected_release: DateTime<Utc>,
) {
    let auth = AuthContext::system();
    let Some(exercise) = fetch_exercise(&ctx, exercise_id).await else {
        return;
    };
    if exercise.release_date != Some(expected_release) {
        stale_no_op(&ctx, exercise_id, "发布");
        return;
    }
    if let Err(e) = ctx.vcs.combine_template_commits(&auth, exercise_id).await {
        error!("合并练习 {} 的模板仓库提交失败: {}", exercise_id, e);
        return;
    }
    debug!("已合并练习 {} 的模板仓库提交", exercise_id);
}

/// 常规截止任务：锁定没有个人截止日期的参与记录，必要时重算成绩
async fn due_date_task(
    ctx: Arc<SchedulingContext>,
    exercise_id: i64,
    expected_due: DateTime<Utc>,
    update_scores: bool,
) {
    let auth = AuthContext::system();
    let Some(exercise) = fetch_exercise(&ctx, exercise_id).await else {
        return;
    };
    if exercise.due_date != Some(expected_due) {
        stale_no_op(&ctx, exercise_id, "截止");
        return;
    }

    // 个人延期的参与记录由专属任务处理
    let predicate: ParticipationPredicate = Arc::new(|p| p.individual_due_date.is_none());
    run_lock_operation(&ctx, &exercise, predicate, &auth).await;

    if update_scores {
        match ctx.grading.recompute_results(&auth, exercise_id).await {
            Ok(updates) => debug!(
                "练习 {} 截止后重算了 {} 条成绩",
                exercise_id,
                updates.len()
            ),
            Err(e) => error!("练习 {} 截止后的成绩重算失败: {}", exercise_id, e),
        }
    }
}

/// 锁定满足谓词的参与记录的仓库与参与状态。
/// 启用在线编辑器的练习随后暂存未提交的变更——总是暂存，
/// 教师可能在截止之后才把评审方式改成人工
async fn run_lock_operation(
    ctx: &Arc<SchedulingContext>,
    exercise: &Exercise,
    predicate: ParticipationPredicate,
    auth: &AuthContext,
) {
    let action: ParticipationAction = {
        let vcs = Arc::clone(&ctx.vcs);
        Arc::new(move |_, participation, auth| {
            let vcs = Arc::clone(&vcs);
            async move {
                vcs.lock_repository(&auth, &participation).await?;
                vcs.lock_participation(&auth, &participation).await?;
                Ok(())
            }
            .boxed()
        })
    };
    if let Err(e) = ctx
        .bulk
        .run_on_participations(
            exercise.id,
            "锁定学生仓库与参与记录",
            auth.clone(),
            Arc::clone(&predicate),
            action,
            LOCK_NOTIFICATION,
        )
        .await
    {
        error!("练习 {} 的锁定批量操作无法执行: {}", exercise.id, e);
        return;
    }

    if exercise.allow_online_editor {
        let stash_action: ParticipationAction = {
            let vcs = Arc::clone(&ctx.vcs);
            Arc::new(move |_, participation, auth| {
                let vcs = Arc::clone(&vcs);
                async move { vcs.stash_changes(&auth, &participation).await }.boxed()
            })
        };
        if let Err(e) = ctx
            .bulk
            .run_on_participations(
                exercise.id,
                "暂存在线编辑器变更",
                auth.clone(),
                predicate,
                stash_action,
                STASH_NOTIFICATION,
            )
            .await
        {
            error!("练习 {} 的暂存批量操作无法执行: {}", exercise.id, e);
        }
    }
}

/// 个人截止任务：锁定单个参与记录，必要时重算其成绩
async fn participation_due_task(
    ctx: Arc<SchedulingContext>,
    exercise_id: i64,
    participation_id: i64,
    expected_due: DateTime<Utc>,
    update_scores: bool,
) {
    let auth = AuthContext::system();
    let Some(exercise) = fetch_exercise(&ctx, exercise_id).await else {
        return;
    };
    let participation = match ctx.participation_repo.find_by_id(participation_id).await {
        Ok(Some(participation)) => participation,
        Ok(None) => {
            error!("参与记录 {} 在锁定任务触发时已不存在", participation_id);
            return;
        }
        Err(e) => {
            error!("锁定任务触发时读取参与记录 {} 失败: {}", participation_id, e);
            return;
        }
    };
    if participation.individual_due_date != Some(expected_due) {
        ctx.metrics.record_stale_fire();
        info!(
            "参与记录 {} 的个人截止日期在任务注册后被修改，跳过本次触发",
            participation_id
        );
        return;
    }

    if let Err(e) = ctx.vcs.lock_repository(&auth, &participation).await {
        error!("锁定参与记录 {} 的仓库失败: {}", participation_id, e);
    }
    if let Err(e) = ctx.vcs.lock_participation(&auth, &participation).await {
        error!("锁定参与记录 {} 失败: {}", participation_id, e);
    }
    if exercise.allow_online_editor {
        if let Err(e) = ctx.vcs.stash_changes(&auth, &participation).await {
            error!("暂存参与记录 {} 的在线编辑器变更失败: {}", participation_id, e);
        }
    }
    if update_scores {
        match ctx
            .grading
            .recompute_participation_results(&auth, participation_id)
            .await
        {
            Ok(updates) => debug!(
                "参与记录 {} 个人截止后重算了 {} 条成绩",
                participation_id,
                updates.len()
            ),
            Err(e) => error!("参与记录 {} 的成绩重算失败: {}", participation_id, e),
        }
    }
}

/// 个人截止后的构建任务：只构建该参与记录
async fn participation_build_task(
    ctx: Arc<SchedulingContext>,
    exercise_id: i64,
    participation_id: i64,
    expected_due: DateTime<Utc>,
) {
    let auth = AuthContext::system();
    let participation = match ctx.participation_repo.find_by_id(participation_id).await {
        Ok(Some(participation)) => participation,
        Ok(None) => {
            error!(
                "参与记录 {} (练习 {}) 在构建任务触发时已不存在",
                participation_id, exercise_id
            );
            return;
        }
        Err(e) => {
            error!("构建任务触发时读取参与记录 {} 失败: {}", participation_id, e);
            return;
        }
    };
    if participation.individual_due_date != Some(expected_due) {
        ctx.metrics.record_stale_fire();
        info!(
            "参与记录 {} 的个人截止日期在任务注册后被修改，跳过本次构建",
            participation_id
        );
        return;
    }
    info!(
        "触发参与记录 {} 的定时构建 (练习 {})",
        participation_id, exercise_id
    );
    if let Err(e) = ctx.builds.trigger_build(&auth, &[participation_id]).await {
        error!("触发参与记录 {} 的构建失败: {}", participation_id, e);
    }
}

/// 截止后统一重构任务
async fn build_and_test_task(
    ctx: Arc<SchedulingContext>,
    exercise_id: i64,
    expected_date: DateTime<Utc>,
) {
    let auth = AuthContext::system();
    let Some(exercise) = fetch_exercise(&ctx, exercise_id).await else {
        return;
    };
    if exercise.build_and_test_after_due_date != Some(expected_date) {
        stale_no_op(&ctx, exercise_id, "截止后构建");
        return;
    }
    info!("触发练习 {} 的截止后重新构建", exercise_id);
    if let Err(e) = ctx.builds.trigger_instructor_build(&auth, exercise_id).await {
        error!("触发练习 {} 的重新构建失败: {}", exercise_id, e);
    }
}

/// 评审截止任务：重算成绩使评审结果可见并通知教师
async fn assessment_due_task(
    ctx: Arc<SchedulingContext>,
    exercise_id: i64,
    expected_date: DateTime<Utc>,
) {
    let auth = AuthContext::system();
    let Some(exercise) = fetch_exercise(&ctx, exercise_id).await else {
        return;
    };
    if exercise.assessment_due_date != Some(expected_date) {
        stale_no_op(&ctx, exercise_id, "评审截止");
        return;
    }
    match ctx.grading.recompute_results(&auth, exercise_id).await {
        Ok(updates) => debug!(
            "练习 {} 评审截止后重算了 {} 条成绩",
            exercise_id,
            updates.len()
        ),
        Err(e) => {
            error!("练习 {} 评审截止后的成绩重算失败: {}", exercise_id, e);
            return;
        }
    }
    if let Err(e) = ctx
        .notifications
        .notify_instructors(&auth, exercise_id, ASSESSMENT_DUE_NOTIFICATION)
        .await
    {
        error!("练习 {} 的评审截止通知发送失败: {}", exercise_id, e);
    }
}

/// 考试解锁任务：解锁所有学生仓库与参与记录，同时收集每个参与记录的
/// 个人截止日期（考试开始 + 个人工作时间），完成后按截止时间分组调度
/// 锁定任务。锁定任务在这里而不是调度时注册，因为工作时间在考试开始前
/// 可能频繁变化。
async fn exam_unlock_task(ctx: Arc<SchedulingContext>, exercise_id: i64, exam_id: i64) {
    let auth = AuthContext::system();
    let Some(_exercise) = fetch_exercise(&ctx, exercise_id).await else {
        return;
    };
    let exam = match ctx.exam_repo.find_by_id(exam_id).await {
        Ok(Some(exam)) => exam,
        Ok(None) => {
            error!("考试 {} 在解锁任务触发时已不存在", exam_id);
            return;
        }
        Err(e) => {
            error!("解锁任务触发时读取考试 {} 失败: {}", exam_id, e);
            return;
        }
    };
    let student_exams = match ctx.exam_repo.find_student_exams(exam_id).await {
        Ok(student_exams) => student_exams,
        Err(e) => {
            error!("解锁任务触发时读取考试 {} 的学生记录失败: {}", exam_id, e);
            return;
        }
    };
    let working_times = working_time_by_student(&student_exams);

    let collected: Arc<Mutex<Vec<(DateTime<Utc>, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let action: ParticipationAction = {
        let vcs = Arc::clone(&ctx.vcs);
        let collected = Arc::clone(&collected);
        let exam = exam.clone();
        Arc::new(move |_, participation, auth| {
            let vcs = Arc::clone(&vcs);
            let collected = Arc::clone(&collected);
            let working_time = working_times
                .get(&participation.student)
                .copied()
                .unwrap_or(exam.working_time_seconds);
            let due = policy::exam_effective_due_date(&exam, working_time);
            async move {
                if let Some(due) = due {
                    collected
                        .lock()
                        .expect("collected due dates lock poisoned")
                        .push((due, participation.id));
                }
                vcs.unlock_repository(&auth, &participation).await?;
                vcs.unlock_participation(&auth, &participation).await?;
                Ok(())
            }
            .boxed()
        })
    };

    match ctx
        .bulk
        .run_on_participations(
            exercise_id,
            "解锁所有学生仓库与参与记录",
            auth,
            Arc::new(|_| true),
            action,
            UNLOCK_NOTIFICATION,
        )
        .await
    {
        Ok(_) => {
            // 已经过去的截止时间会让锁定立即触发、使解锁失效
            // （统一解锁就发生在考试开始之后时），因此只保留将来的分组
            let now = Utc::now();
            let future_pairs: Vec<(DateTime<Utc>, i64)> = collected
                .lock()
                .expect("collected due dates lock poisoned")
                .iter()
                .copied()
                .filter(|(due, _)| now < *due)
                .collect();
            schedule_individual_lock_tasks(&ctx, exercise_id, future_pairs);
        }
        Err(e) => error!("练习 {} 的解锁批量操作无法执行: {}", exercise_id, e),
    }
}

/// 分组锁定任务：触发时重新校验组内成员——参与记录当前的有效截止日期
/// 必须仍然等于该分组的时间点，只锁定仍然匹配的记录
async fn group_lock_task(
    ctx: Arc<SchedulingContext>,
    exercise_id: i64,
    group_due: DateTime<Utc>,
    participation_ids: HashSet<i64>,
) {
    let auth = AuthContext::system();
    let Some(exercise) = fetch_exercise(&ctx, exercise_id).await else {
        return;
    };
    let current_due_dates = match resolve_effective_due_dates(&ctx, &exercise).await {
        Ok(map) => map,
        Err(e) => {
            error!(
                "重算练习 {} 的有效截止日期失败，跳过分组锁定: {}",
                exercise_id, e
            );
            return;
        }
    };
    let predicate: ParticipationPredicate = Arc::new(move |p| {
        participation_ids.contains(&p.id) && current_due_dates.get(&p.id).copied() == Some(group_due)
    });
    run_lock_operation(&ctx, &exercise, predicate, &auth).await;
}

/// 练习下每个参与记录当前的有效截止日期。
/// 考试练习从考试开始时间和个人工作时间推导，课程练习取个人覆盖或练习截止
async fn resolve_effective_due_dates(
    ctx: &Arc<SchedulingContext>,
    exercise: &Exercise,
) -> SchedulerResult<HashMap<i64, DateTime<Utc>>> {
    let participations = ctx.participation_repo.find_by_exercise(exercise.id).await?;
    let mut due_dates = HashMap::new();

    if let Some(exam_id) = exercise.exam_id {
        let exam = ctx
            .exam_repo
            .find_by_id(exam_id)
            .await?
            .ok_or(SchedulerError::ExamNotFound { id: exam_id })?;
        let student_exams = ctx.exam_repo.find_student_exams(exam_id).await?;
        let working_times = working_time_by_student(&student_exams);
        for participation in &participations {
            let working_time = working_times
                .get(&participation.student)
                .copied()
                .unwrap_or(exam.working_time_seconds);
            if let Some(due) = policy::exam_effective_due_date(&exam, working_time) {
                due_dates.insert(participation.id, due);
            }
        }
    } else {
        for participation in &participations {
            if let Some(due) = policy::effective_due_date(exercise, participation) {
                due_dates.insert(participation.id, due);
            }
        }
    }
    Ok(due_dates)
}
