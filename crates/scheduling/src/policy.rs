use chrono::{DateTime, Duration, Utc};

use exercise_scheduler_domain::{AssessmentType, Exam, Exercise, Participation, StudentExam};

/// 解锁需要一定耗时（同步调用），因此提前于考试开始时间执行
pub const EXAM_UNLOCK_LEAD_MINUTES: i64 = 5;

/// 判断练习是否还需要调度。
///
/// 该判定是带正确性后果的优化：多余地返回true是安全的（无用的定时器
/// 之后会被取消），错误地返回false会静默跳过必须执行的动作。因此
/// 判定必须保守，所有分支偏向返回true。
pub fn needs_scheduling(
    exercise: &Exercise,
    latest_individual_due_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    // 考试练习总是需要调度
    if exercise.is_exam_exercise() {
        return true;
    }
    // 非全自动评审的练习同样需要
    if exercise.assessment_type != AssessmentType::Automatic {
        return true;
    }
    // 允许申诉的练习也需要
    if exercise.allow_complaints {
        return true;
    }

    needs_scheduling_due_to_dates(exercise, latest_individual_due_date, now)
}

/// 任一相关日期仍在将来时需要调度
fn needs_scheduling_due_to_dates(
    exercise: &Exercise,
    latest_individual_due_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    is_in_future(exercise.release_date, now)
        || is_in_future(exercise.build_and_test_after_due_date, now)
        || is_in_future(exercise.due_date, now)
        || is_in_future(exercise.assessment_due_date, now)
        || is_in_future(latest_individual_due_date, now)
}

fn is_in_future(date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    date.is_some_and(|d| now < d)
}

/// 课程练习中参与记录的有效截止日期：个人截止日期覆盖练习截止日期
pub fn effective_due_date(
    exercise: &Exercise,
    participation: &Participation,
) -> Option<DateTime<Utc>> {
    participation.individual_due_date.or(exercise.due_date)
}

/// 考试参与记录的有效截止日期 = 考试开始时间 + 该学生的工作时间。
/// 不从练习的截止日期字段推导。
pub fn exam_effective_due_date(exam: &Exam, working_time_seconds: i64) -> Option<DateTime<Utc>> {
    exam.start_date
        .map(|start| start + Duration::seconds(working_time_seconds))
}

/// 考试练习的统一解锁时间
pub fn exam_unlock_date(exam: &Exam) -> Option<DateTime<Utc>> {
    exam.start_date
        .map(|start| start - Duration::minutes(EXAM_UNLOCK_LEAD_MINUTES))
}

/// 所有学生中最晚的个人考试结束时间（包含常规工作时间兜底）
pub fn latest_individual_exam_end(
    exam: &Exam,
    student_exams: &[StudentExam],
) -> Option<DateTime<Utc>> {
    let max_working_time = student_exams
        .iter()
        .map(|se| se.working_time_seconds)
        .max()
        .unwrap_or(exam.working_time_seconds)
        .max(exam.working_time_seconds);
    exam.end_date_for_working_time(max_working_time)
}

pub fn is_past_due_date(exercise: &Exercise, now: DateTime<Utc>) -> bool {
    exercise.due_date.is_some_and(|d| d <= now)
}

pub fn is_past_assessment_due_date(exercise: &Exercise, now: DateTime<Utc>) -> bool {
    exercise.assessment_due_date.is_some_and(|d| d <= now)
}
