use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("练习未找到: {id}")]
    ExerciseNotFound { id: i64 },
    #[error("参与记录未找到: {id}")]
    ParticipationNotFound { id: i64 },
    #[error("考试未找到: {id}")]
    ExamNotFound { id: i64 },
    #[error("学生考试记录未找到: {id}")]
    StudentExamNotFound { id: i64 },
    #[error("练习 {exercise_id} 的日期配置无效: {message}")]
    InvalidDates { exercise_id: i64, message: String },
    #[error("版本控制操作失败: {0}")]
    VersionControl(String),
    #[error("构建触发失败: {0}")]
    BuildTrigger(String),
    #[error("成绩计算失败: {0}")]
    Grading(String),
    #[error("通知发送失败: {0}")]
    Notification(String),
    #[error("数据访问错误: {0}")]
    DataAccess(String),
    #[error("任务引擎无法接受新任务: {0}")]
    TaskEngine(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn exercise_not_found(id: i64) -> Self {
        Self::ExerciseNotFound { id }
    }

    pub fn participation_not_found(id: i64) -> Self {
        Self::ParticipationNotFound { id }
    }

    pub fn exam_not_found(id: i64) -> Self {
        Self::ExamNotFound { id }
    }

    pub fn invalid_dates<S: Into<String>>(exercise_id: i64, msg: S) -> Self {
        Self::InvalidDates {
            exercise_id,
            message: msg.into(),
        }
    }

    pub fn vcs_error<S: Into<String>>(msg: S) -> Self {
        Self::VersionControl(msg.into())
    }

    pub fn data_access<S: Into<String>>(msg: S) -> Self {
        Self::DataAccess(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 实体缺失类错误在触发时刻按无操作处理，不向上传播
    pub fn is_entity_missing(&self) -> bool {
        matches!(
            self,
            SchedulerError::ExerciseNotFound { .. }
                | SchedulerError::ParticipationNotFound { .. }
                | SchedulerError::ExamNotFound { .. }
                | SchedulerError::StudentExamNotFound { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::VersionControl(_)
                | SchedulerError::BuildTrigger(_)
                | SchedulerError::Notification(_)
                | SchedulerError::DataAccess(_)
                | SchedulerError::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_)
                | SchedulerError::Configuration(_)
                | SchedulerError::TaskEngine(_)
        )
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
