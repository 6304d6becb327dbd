use metrics::{counter, histogram, Counter, Histogram};

/// 调度子系统的指标收集器
pub struct MetricsCollector {
    tasks_scheduled_total: Counter,
    tasks_cancelled_total: Counter,
    stale_fires_total: Counter,
    batch_operations_total: Counter,
    batch_item_failures_total: Counter,
    batch_duration: Histogram,
    scheduling_pass_duration: Histogram,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_scheduled_total: counter!("exercise_scheduler_tasks_scheduled_total"),
            tasks_cancelled_total: counter!("exercise_scheduler_tasks_cancelled_total"),
            stale_fires_total: counter!("exercise_scheduler_stale_fires_total"),
            batch_operations_total: counter!("exercise_scheduler_batch_operations_total"),
            batch_item_failures_total: counter!("exercise_scheduler_batch_item_failures_total"),
            batch_duration: histogram!("exercise_scheduler_batch_duration_seconds"),
            scheduling_pass_duration: histogram!("exercise_scheduler_scheduling_pass_duration_seconds"),
        }
    }

    pub fn record_task_scheduled(&self) {
        self.tasks_scheduled_total.increment(1);
    }

    pub fn record_tasks_cancelled(&self, count: u64) {
        self.tasks_cancelled_total.increment(count);
    }

    /// 触发时刻发现权威状态已变化、任务空转返回
    pub fn record_stale_fire(&self) {
        self.stale_fires_total.increment(1);
    }

    pub fn record_batch_operation(&self, duration_seconds: f64, failed_items: u64) {
        self.batch_operations_total.increment(1);
        self.batch_item_failures_total.increment(failed_items);
        self.batch_duration.record(duration_seconds);
    }

    pub fn record_scheduling_pass(&self, duration_seconds: f64) {
        self.scheduling_pass_duration.record(duration_seconds);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
