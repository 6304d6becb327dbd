use async_trait::async_trait;

use crate::entities::Participation;
use crate::value_objects::{AuthContext, ResultUpdate};
use crate::SchedulerResult;

/// 版本控制访问端口。锁定/解锁是黑盒的可失败操作，
/// 可能因临时性或永久性原因失败，调用方负责失败隔离与聚合。
#[async_trait]
pub trait VersionControlGateway: Send + Sync {
    /// 收回学生对仓库的写权限。对已锁定仓库重复调用必须成功（幂等）。
    async fn lock_repository(
        &self,
        auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()>;

    /// 恢复学生对仓库的写权限，幂等
    async fn unlock_repository(
        &self,
        auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()>;

    /// 将参与记录置为只读
    async fn lock_participation(
        &self,
        auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()>;

    /// 解除参与记录的只读状态
    async fn unlock_participation(
        &self,
        auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()>;

    /// 暂存在线编辑器中未提交的变更，人工评审前调用
    async fn stash_changes(
        &self,
        auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()>;

    /// 发布前把模板仓库的历史提交合并为一个
    async fn combine_template_commits(
        &self,
        auth: &AuthContext,
        exercise_id: i64,
    ) -> SchedulerResult<()>;
}

/// 构建触发端口
#[async_trait]
pub trait BuildTriggerGateway: Send + Sync {
    async fn trigger_build(
        &self,
        auth: &AuthContext,
        participation_ids: &[i64],
    ) -> SchedulerResult<()>;

    /// 以教师身份触发整个练习的重新构建
    async fn trigger_instructor_build(
        &self,
        auth: &AuthContext,
        exercise_id: i64,
    ) -> SchedulerResult<()>;
}

/// 成绩计算端口
#[async_trait]
pub trait GradingGateway: Send + Sync {
    /// 重算练习下常规截止日期参与记录的成绩
    async fn recompute_results(
        &self,
        auth: &AuthContext,
        exercise_id: i64,
    ) -> SchedulerResult<Vec<ResultUpdate>>;

    /// 重算单个参与记录的成绩
    async fn recompute_participation_results(
        &self,
        auth: &AuthContext,
        participation_id: i64,
    ) -> SchedulerResult<Vec<ResultUpdate>>;

    /// 练习是否存在截止日期后才可见的测试用例。
    /// 可见性分类的完整语义在成绩域内部，这里只作为不透明谓词使用。
    async fn has_tests_visible_after_due_date(
        &self,
        auth: &AuthContext,
        exercise_id: i64,
    ) -> SchedulerResult<bool>;
}

/// 通知端口，只发送聚合结果，从不按参与记录逐条通知
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify_instructors(
        &self,
        auth: &AuthContext,
        exercise_id: i64,
        summary: &str,
    ) -> SchedulerResult<()>;
}
