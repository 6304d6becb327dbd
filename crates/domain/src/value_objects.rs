use serde::{Deserialize, Serialize};

/// 练习级生命周期：每个值对应一个将来必须触发自动动作的时间边界
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExerciseLifecycle {
    #[serde(rename = "RELEASE")]
    Release,
    #[serde(rename = "DUE")]
    Due,
    #[serde(rename = "BUILD_AND_TEST_AFTER_DUE_DATE")]
    BuildAndTestAfterDueDate,
    #[serde(rename = "ASSESSMENT_DUE")]
    AssessmentDue,
}

impl ExerciseLifecycle {
    pub const ALL: [ExerciseLifecycle; 4] = [
        ExerciseLifecycle::Release,
        ExerciseLifecycle::Due,
        ExerciseLifecycle::BuildAndTestAfterDueDate,
        ExerciseLifecycle::AssessmentDue,
    ];

    /// 练习级生命周期到参与级生命周期的映射。
    /// 注销练习级任务时，注册表按此映射级联注销对应的参与级任务。
    pub fn participation_lifecycle(&self) -> Option<ParticipationLifecycle> {
        match self {
            ExerciseLifecycle::Due => Some(ParticipationLifecycle::Due),
            ExerciseLifecycle::BuildAndTestAfterDueDate => {
                Some(ParticipationLifecycle::BuildAndTestAfterDueDate)
            }
            _ => None,
        }
    }
}

/// 参与级生命周期：个人截止日期可以覆盖的练习级生命周期子集
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ParticipationLifecycle {
    #[serde(rename = "DUE")]
    Due,
    #[serde(rename = "BUILD_AND_TEST_AFTER_DUE_DATE")]
    BuildAndTestAfterDueDate,
}

impl ParticipationLifecycle {
    pub const ALL: [ParticipationLifecycle; 2] = [
        ParticipationLifecycle::Due,
        ParticipationLifecycle::BuildAndTestAfterDueDate,
    ];
}

/// 练习级任务注册键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LifecycleKey {
    pub exercise_id: i64,
    pub lifecycle: ExerciseLifecycle,
}

impl LifecycleKey {
    pub fn new(exercise_id: i64, lifecycle: ExerciseLifecycle) -> Self {
        Self {
            exercise_id,
            lifecycle,
        }
    }
}

/// 参与级任务注册键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipationLifecycleKey {
    pub exercise_id: i64,
    pub participation_id: i64,
    pub lifecycle: ParticipationLifecycle,
}

impl ParticipationLifecycleKey {
    pub fn new(
        exercise_id: i64,
        participation_id: i64,
        lifecycle: ParticipationLifecycle,
    ) -> Self {
        Self {
            exercise_id,
            participation_id,
            lifecycle,
        }
    }
}

/// 显式安全上下文，替代线程本地的权限传播。
/// 每个后台工作协程、每个触发的回调在访问存储前都必须持有它。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    principal: String,
}

impl AuthContext {
    /// 系统主体，定时任务与批量操作统一使用
    pub fn system() -> Self {
        Self {
            principal: "system".to_string(),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }
}

/// 一次成绩重算产生的单条结果更新
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultUpdate {
    pub participation_id: i64,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_mapping() {
        assert_eq!(
            ExerciseLifecycle::Due.participation_lifecycle(),
            Some(ParticipationLifecycle::Due)
        );
        assert_eq!(
            ExerciseLifecycle::BuildAndTestAfterDueDate.participation_lifecycle(),
            Some(ParticipationLifecycle::BuildAndTestAfterDueDate)
        );
        assert_eq!(ExerciseLifecycle::Release.participation_lifecycle(), None);
        assert_eq!(
            ExerciseLifecycle::AssessmentDue.participation_lifecycle(),
            None
        );
    }

    #[test]
    fn test_keys_are_value_types() {
        use std::collections::HashSet;

        let mut keys = HashSet::new();
        keys.insert(LifecycleKey::new(1, ExerciseLifecycle::Due));
        keys.insert(LifecycleKey::new(1, ExerciseLifecycle::Due));
        assert_eq!(keys.len(), 1);

        keys.insert(LifecycleKey::new(1, ExerciseLifecycle::Release));
        keys.insert(LifecycleKey::new(2, ExerciseLifecycle::Due));
        assert_eq!(keys.len(), 3);
    }
}
