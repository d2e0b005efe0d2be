//! Herald - 消息协调器演示
//!
//! 入口：加载配置、初始化日志，用内存出口回放一次完整的生成流程，并打印最终状态快照。

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use herald::config::load_config;
use herald::core::{
    CompletionData, GenerationPhase, MessageCoordinator, MessageOwner, TransitionHints,
};
use herald::observability;
use herald::sink::{InMemorySink, MessagePriority};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = load_config(None).context("Failed to load config")?;
    observability::init(&cfg.logging.filter);

    let sink = Arc::new(InMemorySink::new());
    let coordinator = MessageCoordinator::new(&cfg).with_sink(sink.clone());

    let _state_sub = coordinator.subscribe(|state| {
        tracing::info!(
            owner = %state.current_owner,
            phase = %state.current_phase,
            display = ?state.display_state,
            "status: {}",
            state.current_message
        );
    });
    let _handoff_sub = coordinator.subscribe_to_handoffs(|event| {
        tracing::info!(from = %event.from, to = %event.to, reason = ?event.reason, "handoff");
    });
    let (deployed_tx, deployed_rx) = tokio::sync::oneshot::channel();
    let deployed_tx = std::sync::Mutex::new(Some(deployed_tx));
    let _deploy_sub = coordinator.subscribe_to_deployment_context(move |data| {
        if let Some(tx) = deployed_tx.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = tx.send(data.clone());
        }
    });

    let request = "build a todo app with due dates";
    let message_id = coordinator
        .create_and_control_generation_message("demo", "Getting started...")
        .await
        .context("Failed to create generation message")?;

    let hints = TransitionHints::default().with_user_request(request);
    coordinator.transition_to_phase(GenerationPhase::Specification, hints.clone());
    coordinator.flush().await;
    coordinator.transition_to_phase(GenerationPhase::BackendGeneration, hints.clone());
    coordinator.handoff_to_file_manager("Streaming file main.mo");
    coordinator.update_message("Writing the task list backend", MessageOwner::FileManager);
    // 锁定期间项目服务的更新会被拒绝
    coordinator.update_message("stale update", MessageOwner::ProjectService);
    coordinator.flush().await;

    coordinator.take_project_service_control(
        "Files written",
        Some(GenerationPhase::BackendGeneration),
        false,
        None,
    );
    coordinator.transition_to_phase(
        GenerationPhase::FrontendGeneration,
        hints.clone().with_file_count(3),
    );
    coordinator.flush().await;

    let result = coordinator
        .create_user_message_with_priority(
            "demo",
            "also add a dark mode",
            MessagePriority::Critical,
        )
        .await;
    tracing::info!(
        success = result.success,
        current_instruction = ?result.current_instruction_id,
        "user message"
    );

    let mut files = BTreeMap::new();
    files.insert("src/backend/main.mo".to_string(), "actor { }".to_string());
    coordinator.complete_generation(
        "Your todo app is ready!",
        CompletionData {
            final_content: "Your todo app is ready!".to_string(),
            extracted_files: files,
            template_used: Some("motoko-react".to_string()),
            deployment_ready: true,
            message_id: None,
        },
    );
    coordinator.flush().await;

    let deployed = deployed_rx.await.context("Deployment context never fired")?;
    tracing::info!(message_id = ?deployed.message_id, "deployment context bootstrapped");

    let snapshot = serde_json::to_string_pretty(&coordinator.current_state())
        .context("Failed to serialize state")?;
    println!("{}", snapshot);

    coordinator.release_exclusive_control(&message_id);
    coordinator.flush().await;
    tracing::info!(created = sink.created().await.len(), "done");

    Ok(())
}
