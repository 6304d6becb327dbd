use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssessmentType {
    #[serde(rename = "AUTOMATIC")]
    Automatic,
    #[serde(rename = "SEMI_AUTOMATIC")]
    SemiAutomatic,
    #[serde(rename = "MANUAL")]
    Manual,
}

/// 带时限的练习，调度器只读取它，动作触发前总是重新拉取最新版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub id: i64,
    pub title: String,
    pub release_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub assessment_due_date: Option<DateTime<Utc>>,
    pub build_and_test_after_due_date: Option<DateTime<Utc>>,
    /// 所属考试ID，存在即为考试练习
    pub exam_id: Option<i64>,
    pub assessment_type: AssessmentType,
    pub allow_complaints: bool,
    pub allow_online_editor: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Exercise {
    pub fn new(id: i64, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            release_date: None,
            due_date: None,
            assessment_due_date: None,
            build_and_test_after_due_date: None,
            exam_id: None,
            assessment_type: AssessmentType::Automatic,
            allow_complaints: false,
            allow_online_editor: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_exam_exercise(&self) -> bool {
        self.exam_id.is_some()
    }

    pub fn is_released(&self, now: DateTime<Utc>) -> bool {
        match self.release_date {
            Some(release) => release <= now,
            None => true,
        }
    }
}

/// 学生在某个练习中的参与记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participation {
    pub id: i64,
    pub exercise_id: i64,
    pub student: String,
    /// 个人截止日期，覆盖练习级截止日期（工作时间延长）
    pub individual_due_date: Option<DateTime<Utc>>,
}

impl Participation {
    pub fn new(id: i64, exercise_id: i64, student: impl Into<String>) -> Self {
        Self {
            id,
            exercise_id,
            student: student.into(),
            individual_due_date: None,
        }
    }

    pub fn with_individual_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.individual_due_date = Some(due_date);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exam {
    pub id: i64,
    pub visible_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    /// 常规工作时间（秒），学生没有个人工作时间时使用
    pub working_time_seconds: i64,
}

impl Exam {
    /// 某个工作时间下的考试结束时间 = 开始时间 + 工作时间
    pub fn end_date_for_working_time(&self, working_time_seconds: i64) -> Option<DateTime<Utc>> {
        self.start_date
            .map(|start| start + Duration::seconds(working_time_seconds))
    }
}

/// 学生考试记录，承载个人工作时间
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentExam {
    pub id: i64,
    pub exam_id: i64,
    pub student: String,
    pub working_time_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_exercise_without_exam_is_course_exercise() {
        let exercise = Exercise::new(1, "编程作业");
        assert!(!exercise.is_exam_exercise());
    }

    #[test]
    fn test_exercise_release_state() {
        let now = Utc::now();
        let mut exercise = Exercise::new(1, "test");
        // 没有发布日期视为已发布
        assert!(exercise.is_released(now));

        exercise.release_date = Some(now + Duration::hours(1));
        assert!(!exercise.is_released(now));

        exercise.release_date = Some(now - Duration::hours(1));
        assert!(exercise.is_released(now));
    }

    #[test]
    fn test_exam_end_date() {
        let start = Utc::now();
        let exam = Exam {
            id: 1,
            visible_date: Some(start - Duration::minutes(30)),
            start_date: Some(start),
            working_time_seconds: 3600,
        };
        assert_eq!(
            exam.end_date_for_working_time(7200),
            Some(start + Duration::hours(2))
        );
    }
}
