use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info};

mod app;
mod common;
mod shutdown;

use app::Application;
use common::init_logging;
use exercise_scheduler_core::AppConfig;
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("exercise-scheduler")
        .version("1.0.0")
        .about("课程练习生命周期调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let log_level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let log_format = matches
        .get_one::<String>("log-format")
        .map(String::as_str)
        .unwrap_or("pretty");

    // 初始化日志系统
    init_logging(log_level, log_format)?;

    info!("启动练习生命周期调度系统");

    // 加载配置
    let config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| "加载配置失败".to_string())?;

    // 创建应用实例
    let app = Application::new(config)?;

    // 创建优雅关闭管理器并监听Ctrl+C
    let shutdown_manager = ShutdownManager::new();
    let shutdown_rx = shutdown_manager.subscribe().await;
    {
        let shutdown_manager = shutdown_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = signal::ctrl_c().await {
                error!("监听关闭信号失败: {}", e);
                return;
            }
            info!("收到Ctrl+C");
            shutdown_manager.shutdown().await;
        });
    }

    app.run(shutdown_rx).await?;

    info!("练习生命周期调度系统已退出");
    Ok(())
}
