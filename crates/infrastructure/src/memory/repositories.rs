use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use exercise_scheduler_domain::{
    AssessmentType, Exam, Exercise, ExerciseRepository, Participation, ParticipationRepository,
    SchedulerResult, StudentExam,
};
use exercise_scheduler_domain::ExamRepository;

/// In-memory implementation of ExerciseRepository
#[derive(Debug, Clone, Default)]
pub struct InMemoryExerciseRepository {
    exercises: Arc<Mutex<HashMap<i64, Exercise>>>,
}

impl InMemoryExerciseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exercises(exercises: Vec<Exercise>) -> Self {
        let map = exercises.into_iter().map(|e| (e.id, e)).collect();
        Self {
            exercises: Arc::new(Mutex::new(map)),
        }
    }

    pub fn insert(&self, exercise: Exercise) {
        self.exercises.lock().unwrap().insert(exercise.id, exercise);
    }

    pub fn remove(&self, id: i64) {
        self.exercises.lock().unwrap().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.exercises.lock().unwrap().len()
    }
}

#[async_trait]
impl ExerciseRepository for InMemoryExerciseRepository {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Exercise>> {
        Ok(self.exercises.lock().unwrap().get(&id).cloned())
    }

    async fn find_all_needing_scheduling(
        &self,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Exercise>> {
        // Conservative approximation of the scheduling query: individual due
        // dates live in the participation store, so date-wise this only looks
        // at the exercise itself. Over-selection is safe, the orchestrator
        // cancels what turns out to be unnecessary.
        let exercises = self.exercises.lock().unwrap();
        Ok(exercises
            .values()
            .filter(|e| {
                e.is_exam_exercise()
                    || e.assessment_type != AssessmentType::Automatic
                    || e.allow_complaints
                    || [
                        e.release_date,
                        e.due_date,
                        e.build_and_test_after_due_date,
                        e.assessment_due_date,
                    ]
                    .iter()
                    .any(|date| date.is_some_and(|d| now < d))
            })
            .cloned()
            .collect())
    }

    async fn find_exam_exercises_with_running_exam(
        &self,
        _now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Exercise>> {
        // The exam end date lives in the exam store; returning every exam
        // exercise is the conservative choice here as well.
        let exercises = self.exercises.lock().unwrap();
        Ok(exercises
            .values()
            .filter(|e| e.is_exam_exercise())
            .cloned()
            .collect())
    }

    async fn find_by_exam(&self, exam_id: i64) -> SchedulerResult<Vec<Exercise>> {
        let exercises = self.exercises.lock().unwrap();
        Ok(exercises
            .values()
            .filter(|e| e.exam_id == Some(exam_id))
            .cloned()
            .collect())
    }
}

/// In-memory implementation of ParticipationRepository
#[derive(Debug, Clone, Default)]
pub struct InMemoryParticipationRepository {
    participations: Arc<Mutex<HashMap<i64, Participation>>>,
}

impl InMemoryParticipationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_participations(participations: Vec<Participation>) -> Self {
        let map = participations.into_iter().map(|p| (p.id, p)).collect();
        Self {
            participations: Arc::new(Mutex::new(map)),
        }
    }

    pub fn insert(&self, participation: Participation) {
        self.participations
            .lock()
            .unwrap()
            .insert(participation.id, participation);
    }

    pub fn remove(&self, id: i64) {
        self.participations.lock().unwrap().remove(&id);
    }

    pub fn set_individual_due_date(&self, id: i64, due_date: Option<DateTime<Utc>>) {
        if let Some(participation) = self.participations.lock().unwrap().get_mut(&id) {
            participation.individual_due_date = due_date;
        }
    }

    pub fn count(&self) -> usize {
        self.participations.lock().unwrap().len()
    }
}

#[async_trait]
impl ParticipationRepository for InMemoryParticipationRepository {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Participation>> {
        Ok(self.participations.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_exercise(&self, exercise_id: i64) -> SchedulerResult<Vec<Participation>> {
        let participations = self.participations.lock().unwrap();
        let mut result: Vec<Participation> = participations
            .values()
            .filter(|p| p.exercise_id == exercise_id)
            .cloned()
            .collect();
        result.sort_by_key(|p| p.id);
        Ok(result)
    }

    async fn find_with_individual_due_date_by_exercise(
        &self,
        exercise_id: i64,
    ) -> SchedulerResult<Vec<Participation>> {
        let participations = self.participations.lock().unwrap();
        let mut result: Vec<Participation> = participations
            .values()
            .filter(|p| p.exercise_id == exercise_id && p.individual_due_date.is_some())
            .cloned()
            .collect();
        result.sort_by_key(|p| p.id);
        Ok(result)
    }

    async fn latest_individual_due_date(
        &self,
        exercise_id: i64,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let participations = self.participations.lock().unwrap();
        Ok(participations
            .values()
            .filter(|p| p.exercise_id == exercise_id)
            .filter_map(|p| p.individual_due_date)
            .max())
    }
}

/// In-memory implementation of ExamRepository
#[derive(Debug, Clone, Default)]
pub struct InMemoryExamRepository {
    exams: Arc<Mutex<HashMap<i64, Exam>>>,
    student_exams: Arc<Mutex<HashMap<i64, StudentExam>>>,
}

impl InMemoryExamRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_exam(&self, exam: Exam) {
        self.exams.lock().unwrap().insert(exam.id, exam);
    }

    pub fn insert_student_exam(&self, student_exam: StudentExam) {
        self.student_exams
            .lock()
            .unwrap()
            .insert(student_exam.id, student_exam);
    }

    pub fn set_student_working_time(&self, student_exam_id: i64, working_time_seconds: i64) {
        if let Some(student_exam) = self.student_exams.lock().unwrap().get_mut(&student_exam_id) {
            student_exam.working_time_seconds = working_time_seconds;
        }
    }
}

#[async_trait]
impl ExamRepository for InMemoryExamRepository {
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Exam>> {
        Ok(self.exams.lock().unwrap().get(&id).cloned())
    }

    async fn find_student_exams(&self, exam_id: i64) -> SchedulerResult<Vec<StudentExam>> {
        let student_exams = self.student_exams.lock().unwrap();
        let mut result: Vec<StudentExam> = student_exams
            .values()
            .filter(|se| se.exam_id == exam_id)
            .cloned()
            .collect();
        result.sort_by_key(|se| se.id);
        Ok(result)
    }

    async fn find_student_exam(&self, id: i64) -> SchedulerResult<Option<StudentExam>> {
        Ok(self.student_exams.lock().unwrap().get(&id).cloned())
    }
}
