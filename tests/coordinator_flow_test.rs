//! 协调器集成测试：所有权、队列顺序、重置、阶段切换、完成、用户消息创建

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use herald::config::{CoordinatorSection, TextSection};
use herald::core::{
    CompletionData, CoordinatorState, DisplayState, GenerationPhase, HandoffReason,
    MessageCoordinator, MessageCreationEvent, MessageOwner, TransitionHints,
};
use herald::sink::{InMemorySink, MessagePriority};

fn coordinator_with_settle(ms: u64) -> MessageCoordinator {
    let section = CoordinatorSection {
        deployment_settle_ms: ms,
        ..CoordinatorSection::default()
    };
    MessageCoordinator::with_settings(&section, &TextSection::default())
}

fn collect_states(coordinator: &MessageCoordinator) -> Arc<Mutex<Vec<CoordinatorState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = coordinator.subscribe(move |state| {
        sink.lock().unwrap().push(state.clone());
    });
    seen
}

#[tokio::test]
async fn test_only_current_owner_can_update() {
    let coordinator = MessageCoordinator::default();
    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.flush().await;

    assert!(coordinator.can_send_message(MessageOwner::ProjectService));
    assert!(!coordinator.can_send_message(MessageOwner::FileManager));

    coordinator.update_message_content("from file manager", MessageOwner::FileManager);
    coordinator.flush().await;
    assert_eq!(coordinator.current_state().current_message, "Getting started...");

    coordinator.handoff_to_file_manager("Writing files...");
    coordinator.update_message_content("stale project update", MessageOwner::ProjectService);
    coordinator.update_message_content("writing main.mo", MessageOwner::FileManager);
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert_eq!(state.current_owner, MessageOwner::FileManager);
    assert!(state.ownership_locked);
    assert_eq!(state.current_message, "writing main.mo");
    assert!(!coordinator.can_send_message(MessageOwner::ProjectService));
    assert!(coordinator.can_send_message(MessageOwner::FileManager));
    // 文件管理器接手时仍保持 Thinking 与 K 动画
    assert_eq!(state.display_state, DisplayState::Thinking);
    assert!(state.show_k_loading_animation);
}

#[tokio::test]
async fn test_burst_applies_in_order_in_one_snapshot() {
    let coordinator = MessageCoordinator::default();
    let seen = collect_states(&coordinator);
    coordinator.flush().await;
    seen.lock().unwrap().clear();

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.update_message_content("first", MessageOwner::ProjectService);
    coordinator.update_message_content("second", MessageOwner::ProjectService);
    coordinator.flush().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].active_message_id.as_deref(), Some("m1"));
    assert_eq!(seen[0].current_owner, MessageOwner::ProjectService);
    assert_eq!(seen[0].current_message, "second");
}

#[tokio::test]
async fn test_reset_keeps_controlled_messages_full_reset_clears() {
    let coordinator = MessageCoordinator::default();
    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.transition_to_phase(GenerationPhase::Specification, TransitionHints::default());
    coordinator.reset();
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert!(coordinator.is_controlling_message("m1"));
    assert_eq!(state.current_owner, MessageOwner::None);
    assert_eq!(state.display_state, DisplayState::Idle);
    assert_eq!(state.current_phase, GenerationPhase::Idle);
    assert!(state.active_message_id.is_none());

    coordinator.full_reset();
    coordinator.flush().await;
    assert!(coordinator.current_state().controlled_messages.is_empty());
}

#[tokio::test]
async fn test_phase_transition_records_history_and_clears_lock() {
    let coordinator = MessageCoordinator::default();
    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.transition_to_phase(GenerationPhase::Specification, TransitionHints::default());
    coordinator.handoff_to_file_manager("Writing files...");
    coordinator.flush().await;
    assert!(coordinator.current_state().ownership_locked);

    coordinator.transition_to_phase(GenerationPhase::BackendGeneration, TransitionHints::default());
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert_eq!(state.phase_history.len(), 1);
    assert_eq!(state.phase_history[0].phase, GenerationPhase::Specification);
    assert_eq!(state.current_phase, GenerationPhase::BackendGeneration);
    assert!(!state.ownership_locked);
    assert_eq!(state.current_message, "Building the backend for your app...");

    let transition = state.current_transition.expect("transition recorded");
    assert_eq!(transition.from_phase, GenerationPhase::Specification);
    assert_eq!(transition.to_phase, GenerationPhase::BackendGeneration);
}

#[tokio::test]
async fn test_take_control_with_new_phase_transitions() {
    let coordinator = MessageCoordinator::default();
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let log = reasons.clone();
    let _sub = coordinator.subscribe_to_handoffs(move |event| {
        log.lock().unwrap().push(event.reason);
    });

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.transition_to_phase(GenerationPhase::BackendGeneration, TransitionHints::default());
    coordinator.take_project_service_control(
        "Designing your screens",
        Some(GenerationPhase::FrontendGeneration),
        true,
        None,
    );
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert_eq!(state.current_phase, GenerationPhase::FrontendGeneration);
    assert_eq!(state.current_message, "Designing your screens...");
    assert_eq!(
        *reasons.lock().unwrap(),
        vec![
            HandoffReason::ExclusiveControlStarted,
            HandoffReason::PhaseTransition,
            HandoffReason::PhaseTransition,
        ]
    );
}

#[tokio::test]
async fn test_completion_overrides_message_id() {
    let coordinator = MessageCoordinator::default();
    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.complete_generation(
        "Done!",
        CompletionData {
            message_id: Some("bogus".to_string()),
            ..CompletionData::default()
        },
    );
    coordinator.flush().await;

    let data = coordinator.completion_data().expect("completion data");
    assert_eq!(data.message_id, coordinator.active_message_id());
    assert_eq!(data.message_id.as_deref(), Some("m1"));
}

#[tokio::test]
async fn test_jargon_only_update_falls_back_to_phase_text() {
    let coordinator = MessageCoordinator::default();
    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.transition_to_phase(GenerationPhase::BackendGeneration, TransitionHints::default());
    coordinator.update_message("LLM API JSON", MessageOwner::ProjectService);
    coordinator.flush().await;

    let message = coordinator.current_state().current_message;
    assert!(!message.is_empty());
    assert_eq!(message, "Building your backend...");
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_block_others() {
    let coordinator = MessageCoordinator::default();
    let _bad = coordinator.subscribe(|_| panic!("subscriber failure"));
    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = deliveries.clone();
    let _good = coordinator.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    coordinator.flush().await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.flush().await;
    coordinator.update_message_content("next", MessageOwner::ProjectService);
    coordinator.flush().await;

    assert_eq!(deliveries.load(Ordering::SeqCst), 3);
    assert_eq!(coordinator.current_state().current_message, "next");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let coordinator = MessageCoordinator::default();
    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = deliveries.clone();
    let sub = coordinator.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    coordinator.flush().await;
    sub.unsubscribe();

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.flush().await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_end_to_end_generation() {
    let coordinator = MessageCoordinator::default();
    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.transition_to_phase(
        GenerationPhase::BackendGeneration,
        TransitionHints::default().with_user_request("build a todo app"),
    );
    coordinator.flush().await;
    assert_eq!(
        coordinator.current_state().current_message,
        "Building the backend for your todo app..."
    );

    coordinator.handoff_to_file_manager("Writing files...");
    coordinator.flush().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    coordinator.take_project_service_control(
        "ignored",
        Some(GenerationPhase::BackendGeneration),
        false,
        None,
    );
    coordinator.complete_generation(
        "Done!",
        CompletionData {
            final_content: "Done!".to_string(),
            extracted_files: BTreeMap::new(),
            template_used: None,
            deployment_ready: true,
            message_id: Some("ignored".to_string()),
        },
    );
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert_eq!(state.current_owner, MessageOwner::ProjectService);
    assert_eq!(state.display_state, DisplayState::Completed);
    assert!(state.generation_complete);
    assert!(state.streaming_complete);
    assert!(coordinator.is_generation_complete());
    assert!(coordinator.is_streaming_complete());
    assert_eq!(
        state.completion_data.and_then(|d| d.message_id).as_deref(),
        Some("m1")
    );
    assert_eq!(state.phase_history.len(), 1);
    assert_eq!(state.phase_history[0].phase, GenerationPhase::BackendGeneration);
    assert!(state.phase_history[0].duration > Duration::ZERO);
}

#[tokio::test]
async fn test_critical_user_message_becomes_current_instruction() {
    let sink = Arc::new(InMemorySink::new());
    let coordinator = MessageCoordinator::default().with_sink(sink.clone());
    let events: Arc<Mutex<Vec<MessageCreationEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    let _sub = coordinator.subscribe_to_message_creation(move |event| {
        log.lock().unwrap().push(event.clone());
    });

    let result = coordinator
        .create_user_message_with_priority("p1", "add dark mode", MessagePriority::Critical)
        .await;

    assert!(result.success);
    assert!(result.message_id.starts_with("user_"));
    assert_eq!(result.current_instruction_id.as_deref(), Some(result.message_id.as_str()));

    // 返回时进行中标志已经清除
    let state = coordinator.current_state();
    assert!(!state.message_creation_in_progress);
    assert!(state.pending_message_creation.is_none());

    assert_eq!(sink.created().await.len(), 1);
    assert_eq!(
        sink.priorities().await,
        vec![(result.message_id.clone(), MessagePriority::Critical)]
    );
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message_id, result.message_id);
}

#[tokio::test]
async fn test_normal_user_message_has_no_current_instruction() {
    let sink = Arc::new(InMemorySink::new());
    let coordinator = MessageCoordinator::default().with_sink(sink);
    let result = coordinator
        .create_user_message_with_priority("p1", "thanks!", MessagePriority::Normal)
        .await;
    assert!(result.success);
    assert!(result.current_instruction_id.is_none());
}

#[tokio::test]
async fn test_user_message_without_sink_fails_softly() {
    let coordinator = MessageCoordinator::default();
    let result = coordinator
        .create_user_message_with_priority("p1", "hello", MessagePriority::High)
        .await;

    assert!(!result.success);
    assert!(result.error.is_some());
    assert!(!coordinator.current_state().message_creation_in_progress);
}

#[tokio::test]
async fn test_failing_sink_resets_in_progress_flags() {
    let sink = Arc::new(InMemorySink::new());
    sink.fail_creates(true);
    let coordinator = MessageCoordinator::default().with_sink(sink.clone());

    let result = coordinator
        .create_user_message_with_priority("p1", "hello", MessagePriority::Critical)
        .await;

    assert!(!result.success);
    assert!(result.current_instruction_id.is_none());
    let state = coordinator.current_state();
    assert!(!state.message_creation_in_progress);
    assert!(state.pending_message_creation.is_none());
    assert!(sink.created().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_user_messages_are_serialized() {
    let sink = Arc::new(InMemorySink::new());
    let coordinator = MessageCoordinator::default().with_sink(sink.clone());

    let (a, b) = tokio::join!(
        coordinator.create_user_message_with_priority("p1", "first", MessagePriority::Normal),
        coordinator.create_user_message_with_priority("p1", "second", MessagePriority::Normal),
    );
    assert!(a.success && b.success);
    assert_ne!(a.message_id, b.message_id);
    assert_eq!(sink.created().await.len(), 2);
}

#[tokio::test]
async fn test_deployment_context_fires_after_settle() {
    let coordinator = coordinator_with_settle(20);
    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = fired.clone();
    let _sub = coordinator.subscribe_to_deployment_context(move |data| {
        log.lock().unwrap().push(data.message_id.clone());
    });

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.complete_generation("Done!", CompletionData::default());
    coordinator.flush().await;
    assert!(fired.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*fired.lock().unwrap(), vec![Some("m1".to_string())]);
}

#[tokio::test]
async fn test_reset_cancels_pending_deployment_context() {
    let coordinator = coordinator_with_settle(50);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let _sub = coordinator.subscribe_to_deployment_context(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.complete_generation("Done!", CompletionData::default());
    coordinator.flush().await;
    coordinator.reset();
    coordinator.flush().await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handoff_stream_and_watch_state() {
    let coordinator = MessageCoordinator::default();
    let mut handoffs = coordinator.handoff_stream();
    let mut watch = coordinator.watch_state();

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.handoff_to_file_manager("Writing files...");
    coordinator.flush().await;

    let first = handoffs.recv().await.unwrap();
    assert_eq!(first.reason, HandoffReason::ExclusiveControlStarted);
    assert_eq!(first.message_id.as_deref(), Some("m1"));
    let second = handoffs.recv().await.unwrap();
    assert_eq!(second.reason, HandoffReason::StreamingStarted);
    assert_eq!(second.from, MessageOwner::ProjectService);
    assert_eq!(second.to, MessageOwner::FileManager);

    assert!(watch.has_changed().unwrap());
    assert_eq!(watch.borrow_and_update().current_owner, MessageOwner::FileManager);
}

#[tokio::test]
async fn test_release_returns_to_idle() {
    let coordinator = MessageCoordinator::default();
    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.transition_to_phase(GenerationPhase::Specification, TransitionHints::default());
    coordinator.release_exclusive_control("m1");
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert!(state.active_message_id.is_none());
    assert_eq!(state.display_state, DisplayState::Idle);
    assert_eq!(state.current_phase, GenerationPhase::Idle);
    assert!(!state.exclusive_rendering_active);
    assert!(!coordinator.is_chat_k_animation_blocked());
    assert!(!coordinator.is_controlling_message("m1"));
}

#[tokio::test]
async fn test_reset_in_same_burst_cancels_deployment_context() {
    let coordinator = coordinator_with_settle(20);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let _sub = coordinator.subscribe_to_deployment_context(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.complete_generation("Done!", CompletionData::default());
    coordinator.reset();
    coordinator.flush().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_new_run_in_same_burst_cancels_previous_completion() {
    let coordinator = coordinator_with_settle(20);
    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = fired.clone();
    let _sub = coordinator.subscribe_to_deployment_context(move |data| {
        log.lock().unwrap().push(data.message_id.clone());
    });

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.complete_generation("Done!", CompletionData::default());
    coordinator.start_exclusive_message_control("m2", "Getting started...");
    coordinator.flush().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fired.lock().unwrap().is_empty());
    assert_eq!(coordinator.active_message_id().as_deref(), Some("m2"));

    // 新一轮自己的完成照常触发
    coordinator.complete_generation("Done!", CompletionData::default());
    coordinator.flush().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*fired.lock().unwrap(), vec![Some("m2".to_string())]);
}

#[tokio::test]
async fn test_handback_naming_earlier_phase_still_reclaims() {
    let coordinator = MessageCoordinator::default();
    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.transition_to_phase(
        GenerationPhase::FrontendGeneration,
        TransitionHints::default(),
    );
    coordinator.handoff_to_file_manager("Writing files...");
    coordinator.take_project_service_control(
        "Files written",
        Some(GenerationPhase::BackendGeneration),
        false,
        None,
    );
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert_eq!(state.current_owner, MessageOwner::ProjectService);
    assert!(!state.ownership_locked);
    assert!(state.streaming_complete);
    assert_eq!(state.current_phase, GenerationPhase::FrontendGeneration);
    assert!(coordinator.can_send_message(MessageOwner::ProjectService));
}

#[tokio::test]
async fn test_reclaim_without_file_manager_keeps_streaming_open() {
    let coordinator = MessageCoordinator::default();
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let log = reasons.clone();
    let _sub = coordinator.subscribe_to_handoffs(move |event| {
        log.lock().unwrap().push(event.reason);
    });

    coordinator.start_exclusive_message_control("m1", "Getting started...");
    coordinator.take_project_service_control("Still thinking", None, true, None);
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert_eq!(state.current_owner, MessageOwner::ProjectService);
    assert!(!state.streaming_complete);
    assert!(state.show_k_loading_animation);
    assert_eq!(state.current_message, "Still thinking...");
    assert_eq!(
        reasons.lock().unwrap().last().copied(),
        Some(HandoffReason::ControlReclaimed)
    );
}

#[tokio::test]
async fn test_completion_from_idle_keeps_idle_display() {
    let coordinator = MessageCoordinator::default();
    coordinator.complete_generation("Done!", CompletionData::default());
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert_eq!(state.display_state, DisplayState::Idle);
    assert!(state.generation_complete);
}

#[tokio::test]
async fn test_visual_streaming_never_leaves_idle_directly() {
    let coordinator = MessageCoordinator::default();
    coordinator.transition_from_visual_to_streaming();
    coordinator.flush().await;
    assert_eq!(coordinator.current_state().display_state, DisplayState::Idle);

    coordinator.start_pure_visual_state("Updating the header color");
    coordinator.force_complete_pure_visual_state();
    coordinator.transition_from_visual_to_streaming();
    coordinator.flush().await;

    let state = coordinator.current_state();
    assert_eq!(state.display_state, DisplayState::Idle);
    assert!(!state.is_streaming_active);
}
