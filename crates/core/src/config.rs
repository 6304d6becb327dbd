use std::path::Path;

use anyhow::Result;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::SchedulerError;

/// 调度相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// 启动后延迟多少秒执行启动重调度（避免拖慢应用就绪）
    pub startup_delay_seconds: u64,
    /// 启动延迟的随机抖动上限（秒）
    pub startup_jitter_seconds: u64,
    /// 批量操作的固定工作协程数
    pub bulk_worker_count: usize,
    /// 批量锁定/解锁操作的总超时（秒），超时后未完成项按失败处理
    pub bulk_timeout_seconds: u64,
    /// 发布日期前多少秒合并模板仓库提交
    pub template_commit_lead_seconds: i64,
    /// 考试进行中重启后，补偿解锁任务延迟多少秒执行
    pub exam_backup_unlock_delay_seconds: i64,
}

/// 可观测性配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// "json" 或 "pretty"
    pub log_format: String,
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub scheduling: SchedulingConfig,
    pub observability: ObservabilityConfig,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            startup_delay_seconds: 15,
            startup_jitter_seconds: 5,
            bulk_worker_count: 10,
            bulk_timeout_seconds: 1800, // 30分钟
            template_commit_lead_seconds: 15,
            exam_backup_unlock_delay_seconds: 5,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduling: SchedulingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// 加载配置：TOML 文件 -> 环境变量覆盖 -> 默认值兜底
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/exercise-scheduler.toml",
                "exercise-scheduler.toml",
                "/etc/exercise-scheduler/config.toml",
            ];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder
            .set_default("scheduling.startup_delay_seconds", 15)?
            .set_default("scheduling.startup_jitter_seconds", 5)?
            .set_default("scheduling.bulk_worker_count", 10)?
            .set_default("scheduling.bulk_timeout_seconds", 1800)?
            .set_default("scheduling.template_commit_lead_seconds", 15)?
            .set_default("scheduling.exam_backup_unlock_delay_seconds", 5)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "pretty")?
            .set_default("observability.metrics_enabled", true)?;

        // 环境变量覆盖，例如 EXERCISE_SCHEDULER__SCHEDULING__BULK_WORKER_COUNT=20
        builder = builder.add_source(
            Environment::with_prefix("EXERCISE_SCHEDULER")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置值的合法性
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.scheduling.bulk_worker_count == 0 {
            return Err(SchedulerError::config_error(
                "scheduling.bulk_worker_count 必须大于 0",
            ));
        }
        if self.scheduling.bulk_timeout_seconds == 0 {
            return Err(SchedulerError::config_error(
                "scheduling.bulk_timeout_seconds 必须大于 0",
            ));
        }
        if self.scheduling.template_commit_lead_seconds < 0 {
            return Err(SchedulerError::config_error(
                "scheduling.template_commit_lead_seconds 不能为负数",
            ));
        }
        if self.scheduling.exam_backup_unlock_delay_seconds < 0 {
            return Err(SchedulerError::config_error(
                "scheduling.exam_backup_unlock_delay_seconds 不能为负数",
            ));
        }
        match self.observability.log_format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(SchedulerError::config_error(format!(
                    "observability.log_format 无效: {other}，可选值: json, pretty"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduling.bulk_worker_count, 10);
        assert_eq!(config.scheduling.bulk_timeout_seconds, 1800);
    }

    #[test]
    fn test_load_without_config_file_uses_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.scheduling.startup_delay_seconds, 15);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = AppConfig::load(Some("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[scheduling]
bulk_worker_count = 4
bulk_timeout_seconds = 600

[observability]
log_level = "debug"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.scheduling.bulk_worker_count, 4);
        assert_eq!(config.scheduling.bulk_timeout_seconds, 600);
        assert_eq!(config.observability.log_level, "debug");
        // 未覆盖的配置应保持默认值
        assert_eq!(config.scheduling.startup_delay_seconds, 15);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = AppConfig::default();
        config.scheduling.bulk_worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_log_format() {
        let mut config = AppConfig::default();
        config.observability.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
