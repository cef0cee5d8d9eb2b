//! Hive 演示宿主
//!
//! 用法：`hive <plan.json> [config.toml]`
//! 初始化日志与配置，为每种步骤类型注册 echo handler，经控制器执行计划并输出 PlanResult JSON。
//! Ctrl+C / SIGTERM 会取消正在执行的计划。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{PlanController, ShutdownManager};
use hive::executor::{EchoHandler, HandlerRegistry, PlanExecutor};
use hive::memory::{HierarchicalMemory, MemoryKind, StoreOptions};
use hive::observability;
use hive::planning::Plan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let plan_path = args
        .next()
        .map(PathBuf::from)
        .context("usage: hive <plan.json> [config.toml]")?;
    let config_path = args.next().map(PathBuf::from);

    let cfg = load_config(config_path).context("Failed to load config")?;

    let raw = std::fs::read_to_string(&plan_path)
        .with_context(|| format!("Failed to read plan file {}", plan_path.display()))?;
    let plan: Plan = serde_json::from_str(&raw).context("Plan file is not valid plan JSON")?;
    let plan_id = plan.id.clone();

    let mut handlers = HandlerRegistry::new();
    handlers.register_for_all_kinds(Arc::new(EchoHandler));
    let executor = Arc::new(PlanExecutor::new(handlers, cfg.executor.to_executor_config()));

    let mut controller = PlanController::new(executor);
    if let Some(checkpointer) = cfg.checkpoint.build().context("Failed to open checkpoint store")? {
        controller = controller.with_checkpointer(checkpointer);
    }
    let controller = Arc::new(controller);

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    {
        let shutdown = shutdown.clone();
        let controller = controller.clone();
        let plan_id = plan_id.clone();
        tokio::spawn(async move {
            shutdown.wait_for_shutdown().await;
            if let Err(e) = controller.cancel(&plan_id).await {
                tracing::warn!(plan_id = %plan_id, "cancel on shutdown failed: {}", e);
            }
        });
    }

    let memory = HierarchicalMemory::new(cfg.memory.to_memory_config());

    tracing::info!(plan_id = %plan_id, "submitting plan");
    let result = controller.submit(plan).await.context("Plan submission failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    // 执行结果作为情景记忆留存
    memory
        .store_typed(
            format!("result_{}", plan_id),
            serde_json::to_value(&result)?,
            MemoryKind::Episodic,
            StoreOptions::new().tag("plan_result"),
        )
        .await?;
    let stats = memory.stats().await;
    tracing::debug!(entries = stats.total_entries, "memory stats");
    if let Err(e) = memory.shutdown(Duration::from_secs(5)).await {
        tracing::warn!("memory shutdown: {}", e);
    }

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
