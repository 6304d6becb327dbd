use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{Exam, Exercise, Participation, StudentExam};
use crate::SchedulerResult;

/// 练习仓储接口
#[async_trait]
pub trait ExerciseRepository: Send + Sync {
    /// 根据ID获取练习，不存在时返回None（触发时刻据此判定实体已删除）
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Exercise>>;

    /// 获取所有仍需要调度的练习（任一相关日期在now之后，或人工评审/允许申诉）
    async fn find_all_needing_scheduling(
        &self,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Exercise>>;

    /// 获取考试窗口尚未结束的考试练习
    async fn find_exam_exercises_with_running_exam(
        &self,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Exercise>>;

    /// 获取某场考试下的所有练习
    async fn find_by_exam(&self, exam_id: i64) -> SchedulerResult<Vec<Exercise>>;
}

/// 参与记录仓储接口
#[async_trait]
pub trait ParticipationRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Participation>>;

    /// 获取练习的全部参与记录（批量操作每次触发前重新拉取）
    async fn find_by_exercise(&self, exercise_id: i64) -> SchedulerResult<Vec<Participation>>;

    /// 获取设置了个人截止日期的参与记录
    async fn find_with_individual_due_date_by_exercise(
        &self,
        exercise_id: i64,
    ) -> SchedulerResult<Vec<Participation>>;

    /// 练习下最晚的个人截止日期，用于保守的needs_scheduling判定
    async fn latest_individual_due_date(
        &self,
        exercise_id: i64,
    ) -> SchedulerResult<Option<DateTime<Utc>>>;
}

/// 考试仓储接口
#[async_trait]
pub trait ExamRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Exam>>;

    /// 某场考试的全部学生考试记录
    async fn find_student_exams(&self, exam_id: i64) -> SchedulerResult<Vec<StudentExam>>;

    async fn find_student_exam(&self, id: i64) -> SchedulerResult<Option<StudentExam>>;
}
