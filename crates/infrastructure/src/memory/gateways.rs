use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use exercise_scheduler_domain::{
    AuthContext, BuildTriggerGateway, GradingGateway, NotificationGateway, Participation,
    ResultUpdate, SchedulerError, SchedulerResult, VersionControlGateway,
};

#[derive(Debug, Default)]
struct VcsState {
    repository_locked: HashMap<i64, bool>,
    participation_locked: HashMap<i64, bool>,
    stash_counts: HashMap<i64, usize>,
    combined_template_exercises: Vec<i64>,
    failing_participations: HashSet<i64>,
}

/// In-memory version control gateway. Tracks lock state per participation and
/// supports failure injection for individual participations.
///
/// Lock and unlock are idempotent: repeating an operation on a repository
/// that is already in the target state succeeds.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVersionControlGateway {
    state: Arc<Mutex<VcsState>>,
}

impl InMemoryVersionControlGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every lock/unlock/stash call for the given participations fail.
    pub fn fail_participations(&self, participation_ids: &[i64]) {
        let mut state = self.state.lock().unwrap();
        state.failing_participations.extend(participation_ids);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing_participations.clear();
    }

    pub fn repository_locked(&self, participation_id: i64) -> bool {
        self.state
            .lock()
            .unwrap()
            .repository_locked
            .get(&participation_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn participation_locked(&self, participation_id: i64) -> bool {
        self.state
            .lock()
            .unwrap()
            .participation_locked
            .get(&participation_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn stash_count(&self, participation_id: i64) -> usize {
        self.state
            .lock()
            .unwrap()
            .stash_counts
            .get(&participation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn combined_template_exercises(&self) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .combined_template_exercises
            .clone()
    }

    fn check_failure(&self, participation_id: i64, operation: &str) -> SchedulerResult<()> {
        if self
            .state
            .lock()
            .unwrap()
            .failing_participations
            .contains(&participation_id)
        {
            return Err(SchedulerError::vcs_error(format!(
                "injected {operation} failure for participation {participation_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VersionControlGateway for InMemoryVersionControlGateway {
    async fn lock_repository(
        &self,
        _auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()> {
        self.check_failure(participation.id, "lock_repository")?;
        let mut state = self.state.lock().unwrap();
        state.repository_locked.insert(participation.id, true);
        debug!("repository of participation {} locked", participation.id);
        Ok(())
    }

    async fn unlock_repository(
        &self,
        _auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()> {
        self.check_failure(participation.id, "unlock_repository")?;
        let mut state = self.state.lock().unwrap();
        state.repository_locked.insert(participation.id, false);
        Ok(())
    }

    async fn lock_participation(
        &self,
        _auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()> {
        self.check_failure(participation.id, "lock_participation")?;
        let mut state = self.state.lock().unwrap();
        state.participation_locked.insert(participation.id, true);
        Ok(())
    }

    async fn unlock_participation(
        &self,
        _auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()> {
        self.check_failure(participation.id, "unlock_participation")?;
        let mut state = self.state.lock().unwrap();
        state.participation_locked.insert(participation.id, false);
        Ok(())
    }

    async fn stash_changes(
        &self,
        _auth: &AuthContext,
        participation: &Participation,
    ) -> SchedulerResult<()> {
        self.check_failure(participation.id, "stash_changes")?;
        let mut state = self.state.lock().unwrap();
        *state.stash_counts.entry(participation.id).or_insert(0) += 1;
        Ok(())
    }

    async fn combine_template_commits(
        &self,
        _auth: &AuthContext,
        exercise_id: i64,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.combined_template_exercises.push(exercise_id);
        Ok(())
    }
}

/// In-memory build trigger gateway that records every triggered build.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBuildTriggerGateway {
    participation_builds: Arc<Mutex<Vec<Vec<i64>>>>,
    instructor_builds: Arc<Mutex<Vec<i64>>>,
}

impl InMemoryBuildTriggerGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn participation_builds(&self) -> Vec<Vec<i64>> {
        self.participation_builds.lock().unwrap().clone()
    }

    pub fn instructor_builds(&self) -> Vec<i64> {
        self.instructor_builds.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildTriggerGateway for InMemoryBuildTriggerGateway {
    async fn trigger_build(
        &self,
        _auth: &AuthContext,
        participation_ids: &[i64],
    ) -> SchedulerResult<()> {
        self.participation_builds
            .lock()
            .unwrap()
            .push(participation_ids.to_vec());
        Ok(())
    }

    async fn trigger_instructor_build(
        &self,
        _auth: &AuthContext,
        exercise_id: i64,
    ) -> SchedulerResult<()> {
        self.instructor_builds.lock().unwrap().push(exercise_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GradingState {
    tests_after_due_date: HashMap<i64, bool>,
    recomputed_exercises: Vec<i64>,
    recomputed_participations: Vec<i64>,
}

/// In-memory grading gateway. The after-due-date test visibility taxonomy is
/// owned by the grading domain, so here it is just a configurable flag.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGradingGateway {
    state: Arc<Mutex<GradingState>>,
}

impl InMemoryGradingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tests_visible_after_due_date(&self, exercise_id: i64, value: bool) {
        self.state
            .lock()
            .unwrap()
            .tests_after_due_date
            .insert(exercise_id, value);
    }

    pub fn recomputed_exercises(&self) -> Vec<i64> {
        self.state.lock().unwrap().recomputed_exercises.clone()
    }

    pub fn recomputed_participations(&self) -> Vec<i64> {
        self.state.lock().unwrap().recomputed_participations.clone()
    }
}

#[async_trait]
impl GradingGateway for InMemoryGradingGateway {
    async fn recompute_results(
        &self,
        _auth: &AuthContext,
        exercise_id: i64,
    ) -> SchedulerResult<Vec<ResultUpdate>> {
        self.state
            .lock()
            .unwrap()
            .recomputed_exercises
            .push(exercise_id);
        Ok(Vec::new())
    }

    async fn recompute_participation_results(
        &self,
        _auth: &AuthContext,
        participation_id: i64,
    ) -> SchedulerResult<Vec<ResultUpdate>> {
        self.state
            .lock()
            .unwrap()
            .recomputed_participations
            .push(participation_id);
        Ok(Vec::new())
    }

    async fn has_tests_visible_after_due_date(
        &self,
        _auth: &AuthContext,
        exercise_id: i64,
    ) -> SchedulerResult<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tests_after_due_date
            .get(&exercise_id)
            .copied()
            .unwrap_or(false))
    }
}

/// In-memory notification gateway that records aggregate notifications.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationGateway {
    notifications: Arc<Mutex<Vec<(i64, String)>>>,
}

impl InMemoryNotificationGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(i64, String)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }

    pub fn count_for_exercise(&self, exercise_id: i64) -> usize {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == exercise_id)
            .count()
    }
}

#[async_trait]
impl NotificationGateway for InMemoryNotificationGateway {
    async fn notify_instructors(
        &self,
        _auth: &AuthContext,
        exercise_id: i64,
        summary: &str,
    ) -> SchedulerResult<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((exercise_id, summary.to_string()));
        Ok(())
    }
}
