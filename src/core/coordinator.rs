//! 消息协调器：所有权状态机 + 更新队列 + 发布订阅
//!
//! 多个生产者（项目生成流水线、文件管理器、聊天更新、用户消息创建）共享同一个状态展示区。
//! 协调器决定此刻谁可以推送文案，并把交错的异步更新串行化为一致的可见序列：
//! - 所有写操作都是排队的闭包，调用立即返回；
//! - 队列排空后才向订阅者派发一次快照，订阅者不会看到半途状态；
//! - 所有权检查在闭包生效时进行，被撤销的 owner 迟到的更新会被静默拒绝。

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{CoordinatorSection, HeraldConfig, TextSection};
use crate::core::events::{HandoffEvent, HandoffReason, MessageCreationEvent};
use crate::core::listeners::{panic_message, Subscription};
use crate::core::queue::{AfterApply, Channels, UpdateContext, UpdateQueue};
use crate::core::state::{
    CompletionData, CoordinatorState, DisplayState, GenerationPhase, MessageOwner,
    PhaseTransitionContext, PhaseInfo, TransitionHints,
};
use crate::sink::MessageSink;
use crate::text::{describe_phase, FriendlyText};

pub(crate) struct Inner {
    state: Mutex<CoordinatorState>,
    queue: UpdateQueue,
    pub(crate) channels: Channels,
    drained: Notify,
    state_tx: watch::Sender<CoordinatorState>,
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
    deployment_cancel: Mutex<CancellationToken>,
    settle_delay: Duration,
    pub(crate) text: FriendlyText,
    /// 串行化用户消息创建，防止第二个请求与第一个竞争
    pub(crate) creation_gate: tokio::sync::Mutex<()>,
}

impl Inner {
    fn snapshot(&self) -> CoordinatorState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 单飞排空：依次应用全部更新，然后派发一次快照；派发期间新入队的更新进入下一轮
    fn drain(self: &Arc<Self>) {
        if !self.queue.begin_drain() {
            return;
        }

        loop {
            let mut applied = 0usize;
            while let Some(update) = self.queue.pop() {
                self.apply(update);
                applied += 1;
            }

            if applied > 0 {
                let snapshot = self.snapshot();
                self.state_tx.send_replace(snapshot.clone());
                let reached = self.channels.state.notify_all(&snapshot);
                tracing::debug!(applied, reached = reached.len(), "state snapshot delivered");
                // 广播之后才取首次快照名单：已被广播覆盖的新订阅者不再重复派发
                for id in self.queue.take_initial() {
                    if !reached.contains(&id) {
                        self.channels.state.notify_one(id, &snapshot);
                    }
                }
            } else {
                let initial = self.queue.take_initial();
                if !initial.is_empty() {
                    let snapshot = self.snapshot();
                    for id in initial {
                        self.channels.state.notify_one(id, &snapshot);
                    }
                }
            }

            if self.queue.finish_round() {
                break;
            }
        }

        self.drained.notify_waiters();
    }

    fn apply(self: &Arc<Self>, update: crate::core::queue::StateUpdate) {
        let current = self.snapshot();
        let previous_display = current.display_state;
        let mut ctx = UpdateContext::new(&self.channels);

        let result = catch_unwind(AssertUnwindSafe(|| update(current, &mut ctx)));
        let mut next = match result {
            Ok(next) => next,
            Err(payload) => {
                tracing::error!(
                    "state update panicked, state unchanged: {}",
                    panic_message(payload.as_ref())
                );
                return;
            }
        };

        if !previous_display.can_transition_to(next.display_state) {
            tracing::warn!(
                from = ?previous_display,
                to = ?next.display_state,
                "invalid display transition, keeping previous display state"
            );
            next.display_state = previous_display;
        }

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;

        for action in ctx.into_after() {
            match action {
                AfterApply::CancelDeployment => self.cancel_pending_deployment(),
                AfterApply::DeploymentContext(data) => self.schedule_deployment_context(data),
                AfterApply::Resolve(tx) => {
                    let _ = tx.send(());
                }
            }
        }
    }

    /// 完成后等待状态稳定，再通知部署上下文监听者；reset 会取消尚未触发的通知
    fn schedule_deployment_context(self: &Arc<Self>, data: CompletionData) {
        let token = self
            .deployment_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let delay = self.settle_delay;
        let weak = Arc::downgrade(self);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {
                            tracing::debug!("deployment context notification cancelled");
                        }
                        _ = tokio::time::sleep(delay) => {
                            if let Some(inner) = weak.upgrade() {
                                tracing::info!(
                                    message_id = ?data.message_id,
                                    "deployment context ready"
                                );
                                inner.channels.deployment.notify(&data);
                            }
                        }
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    "no tokio runtime, delivering deployment context without settle delay"
                );
                self.channels.deployment.notify(&data);
            }
        }
    }

    fn cancel_pending_deployment(&self) {
        let mut token = self
            .deployment_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
    }
}

/// 协调器句柄；克隆开销很小，所有克隆共享同一份状态
#[derive(Clone)]
pub struct MessageCoordinator {
    pub(crate) inner: Arc<Inner>,
}

impl Default for MessageCoordinator {
    fn default() -> Self {
        Self::with_settings(&CoordinatorSection::default(), &TextSection::default())
    }
}

impl std::fmt::Debug for MessageCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCoordinator")
            .field("state", &self.inner.snapshot())
            .field("pending_updates", &self.inner.queue.len())
            .finish()
    }
}

impl MessageCoordinator {
    pub fn new(config: &HeraldConfig) -> Self {
        Self::with_settings(&config.coordinator, &config.text)
    }

    pub fn with_settings(coordinator: &CoordinatorSection, text: &TextSection) -> Self {
        let (state_tx, _) = watch::channel(CoordinatorState::default());
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoordinatorState::default()),
                queue: UpdateQueue::default(),
                channels: Channels::new(coordinator.handoff_channel_capacity),
                drained: Notify::new(),
                state_tx,
                sink: RwLock::new(None),
                deployment_cancel: Mutex::new(CancellationToken::new()),
                settle_delay: coordinator.deployment_settle(),
                text: FriendlyText::new(text.min_friendly_length),
                creation_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// 构造时注入消息出口
    pub fn with_sink(self, sink: Arc<dyn MessageSink>) -> Self {
        self.register_sink(sink);
        self
    }

    /// 注册（或替换）消息出口
    pub fn register_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.inner.sink.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    pub fn has_sink(&self) -> bool {
        self.sink().is_some()
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn MessageSink>> {
        self.inner
            .sink
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ---------------------------------------------------------------------
    // 队列
    // ---------------------------------------------------------------------

    /// 入队一个状态更新；同步连发的多次入队合并为一次「排空 → 通知」
    pub(crate) fn queue_update<F>(&self, update: F)
    where
        F: FnOnce(CoordinatorState, &mut UpdateContext<'_>) -> CoordinatorState + Send + 'static,
    {
        if self.inner.queue.push(Box::new(update)) {
            self.schedule_drain();
        }
    }

    fn schedule_drain(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    // 让出一次，让同一轮同步调用先全部入队
                    tokio::task::yield_now().await;
                    inner.drain();
                });
            }
            Err(_) => self.inner.drain(),
        }
    }

    /// 等待队列排空、快照派发完毕
    pub async fn flush(&self) {
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.queue.is_idle() {
                return;
            }
            drained.await;
        }
    }

    // ---------------------------------------------------------------------
    // 订阅
    // ---------------------------------------------------------------------

    /// 订阅状态快照；新订阅者会（延迟）收到一次当前快照
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CoordinatorState) + Send + Sync + 'static,
    {
        let id = self.inner.channels.state.add(Arc::new(listener));
        if self.inner.queue.push_initial(id) {
            self.schedule_drain();
        }
        Subscription::new(&self.inner.channels.state, id)
    }

    /// 订阅交接事件（在状态变更闭包内同步派发）
    pub fn subscribe_to_handoffs<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&HandoffEvent) + Send + Sync + 'static,
    {
        let id = self.inner.channels.handoff.add(Arc::new(listener));
        Subscription::new(&self.inner.channels.handoff, id)
    }

    pub fn subscribe_to_message_creation<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&MessageCreationEvent) + Send + Sync + 'static,
    {
        let id = self.inner.channels.message_creation.add(Arc::new(listener));
        Subscription::new(&self.inner.channels.message_creation, id)
    }

    /// 生成完成并稳定后触发，供部署上下文初始化使用
    pub fn subscribe_to_deployment_context<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CompletionData) + Send + Sync + 'static,
    {
        let id = self.inner.channels.deployment.add(Arc::new(listener));
        Subscription::new(&self.inner.channels.deployment, id)
    }

    /// watch 通道形式的状态快照（每轮排空更新一次）
    pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state_tx.subscribe()
    }

    /// broadcast 通道形式的交接事件流
    pub fn handoff_stream(&self) -> broadcast::Receiver<HandoffEvent> {
        self.inner.channels.handoff_tx.subscribe()
    }

    // ---------------------------------------------------------------------
    // 查询
    // ---------------------------------------------------------------------

    /// 当前状态的克隆快照；修改它不会影响协调器
    pub fn current_state(&self) -> CoordinatorState {
        self.inner.snapshot()
    }

    pub fn active_message_id(&self) -> Option<String> {
        self.inner.snapshot().active_message_id
    }

    pub fn active_message_content(&self) -> String {
        self.inner.snapshot().active_message_content
    }

    pub fn completion_data(&self) -> Option<CompletionData> {
        self.inner.snapshot().completion_data
    }

    pub fn current_phase_info(&self) -> PhaseInfo {
        self.inner.snapshot().phase_info(Utc::now())
    }

    pub fn is_controlling_message(&self, message_id: &str) -> bool {
        self.inner.snapshot().controlled_messages.contains(message_id)
    }

    pub fn is_generation_complete(&self) -> bool {
        self.inner.snapshot().generation_complete
    }

    pub fn is_streaming_complete(&self) -> bool {
        self.inner.snapshot().streaming_complete
    }

    pub fn is_exclusive_rendering_active(&self) -> bool {
        self.inner.snapshot().exclusive_rendering_active
    }

    /// K 动画、生成或独占渲染任一进行中时为 true，其它 UI 应避免冲突
    pub fn is_chat_k_animation_blocked(&self) -> bool {
        self.inner.snapshot().is_chat_k_animation_blocked()
    }

    /// 生产者推送前的探测，与 update_message_content 的两层守卫一致
    pub fn can_send_message(&self, owner: MessageOwner) -> bool {
        self.inner.snapshot().permits(owner)
    }

    // ---------------------------------------------------------------------
    // 所有权状态机
    // ---------------------------------------------------------------------

    /// 项目服务无条件接管，独占控制 message_id（旧的受控消息全部丢弃）
    pub fn start_exclusive_message_control(
        &self,
        message_id: impl Into<String>,
        initial_message: &str,
    ) {
        let message_id = message_id.into();
        let initial = initial_message.to_string();
        let text = self.inner.text;

        self.queue_update(move |mut s, ctx| {
            // 上一轮尚未触发的部署钩子作废
            ctx.after_apply(AfterApply::CancelDeployment);
            let previous = s.current_owner;
            let status = text.rewrite(&initial, GenerationPhase::Idle);

            s.current_owner = MessageOwner::ProjectService;
            s.controlled_messages = HashSet::from([message_id.clone()]);
            s.active_message_id = Some(message_id.clone());
            s.display_state = DisplayState::Thinking;
            s.exclusive_rendering_active = true;
            s.is_generating = true;
            s.show_k_loading_animation = true;
            s.is_streaming_active = false;
            s.pure_visual_state = false;
            s.ownership_locked = false;
            s.pending_ownership_transfer = false;
            s.current_phase = GenerationPhase::Idle;
            s.current_transition = None;
            s.phase_history.clear();
            s.phase_start_time = Some(Utc::now());
            s.generation_complete = false;
            s.streaming_complete = false;
            s.completion_data = None;
            s.set_status_text(status.clone());

            tracing::info!(message_id = %message_id, "exclusive message control started");
            ctx.emit_handoff(
                HandoffEvent::new(
                    previous,
                    MessageOwner::ProjectService,
                    HandoffReason::ExclusiveControlStarted,
                    s.current_phase,
                )
                .with_message(status)
                .with_message_id(Some(message_id)),
            );
            s
        });
    }

    /// 交给文件管理器：锁定所有权，保持 Thinking 与 K 动画不变
    pub fn handoff_to_file_manager(&self, message: &str) {
        let message = message.to_string();
        let text = self.inner.text;

        self.queue_update(move |mut s, ctx| {
            let status = text.rewrite(&message, s.current_phase);

            s.current_owner = MessageOwner::FileManager;
            s.ownership_locked = true;
            s.pending_ownership_transfer = false;
            s.is_streaming_active = true;
            s.streaming_complete = false;
            s.set_status_text(status.clone());

            ctx.emit_handoff(
                HandoffEvent::new(
                    MessageOwner::ProjectService,
                    MessageOwner::FileManager,
                    HandoffReason::StreamingStarted,
                    s.current_phase,
                )
                .with_message(status)
                .with_message_id(s.active_message_id.clone()),
            );
            s
        });
    }

    /// 项目服务收回控制权；若请求了更靠后的阶段，则改走阶段切换
    pub fn take_project_service_control(
        &self,
        message: &str,
        phase: Option<GenerationPhase>,
        show_k_animation: bool,
        hints: Option<TransitionHints>,
    ) {
        let message = message.to_string();
        let text = self.inner.text;

        self.queue_update(move |mut s, ctx| {
            if let Some(phase) = phase {
                if phase > s.current_phase {
                    let mut hints = hints.unwrap_or_default();
                    if hints.custom_message.is_none() && !message.trim().is_empty() {
                        hints.custom_message = Some(message);
                    }
                    return apply_phase_transition(s, ctx, phase, hints, text);
                }
            }

            let previous = s.current_owner;
            s.current_owner = MessageOwner::ProjectService;
            s.ownership_locked = false;
            s.pending_ownership_transfer = false;

            // 文件管理器交回控制权即视为流式输出结束
            let reason = if previous == MessageOwner::FileManager {
                s.streaming_complete = true;
                s.is_streaming_active = false;
                HandoffReason::StreamingComplete
            } else {
                HandoffReason::ControlReclaimed
            };

            let status = text.rewrite(&message, s.current_phase);
            s.show_k_loading_animation = show_k_animation;
            s.set_status_text(status.clone());

            ctx.emit_handoff(
                HandoffEvent::new(previous, MessageOwner::ProjectService, reason, s.current_phase)
                    .with_message(status)
                    .with_message_id(s.active_message_id.clone()),
            );
            s
        });
    }

    /// 规范的阶段切换入口
    pub fn transition_to_phase(&self, phase: GenerationPhase, hints: TransitionHints) {
        let text = self.inner.text;
        self.queue_update(move |s, ctx| apply_phase_transition(s, ctx, phase, hints, text));
    }

    /// 以友好文案更新状态行（需通过所有权守卫）
    pub fn update_message(&self, content: &str, owner: MessageOwner) {
        self.guarded_update(content.to_string(), owner, true);
    }

    /// 原样写入内容（需通过所有权守卫）
    pub fn update_message_content(&self, content: &str, owner: MessageOwner) {
        self.guarded_update(content.to_string(), owner, false);
    }

    fn guarded_update(&self, content: String, owner: MessageOwner, friendly: bool) {
        let text = self.inner.text;
        self.queue_update(move |mut s, _| {
            if s.ownership_locked && owner != s.current_owner {
                tracing::warn!(
                    %owner,
                    current = %s.current_owner,
                    "update rejected: ownership locked"
                );
                return s;
            }
            if owner != s.current_owner {
                tracing::warn!(
                    %owner,
                    current = %s.current_owner,
                    "update rejected: not the current owner"
                );
                return s;
            }
            let status = if friendly {
                text.rewrite(&content, s.current_phase)
            } else {
                content
            };
            s.set_status_text(status);
            s
        });
    }

    /// 释放对某条消息的控制；若是活跃消息，展示、动画与阶段回到 idle
    pub fn release_exclusive_control(&self, message_id: &str) {
        let message_id = message_id.to_string();
        self.queue_update(move |mut s, ctx| {
            s.controlled_messages.remove(&message_id);
            if s.active_message_id.as_deref() != Some(message_id.as_str()) {
                return s;
            }

            let previous = s.current_owner;
            s.active_message_id = None;
            s.current_owner = MessageOwner::None;
            s.ownership_locked = false;
            s.pending_ownership_transfer = false;
            s.display_state = DisplayState::Idle;
            s.show_k_loading_animation = false;
            s.is_generating = false;
            s.is_streaming_active = false;
            s.exclusive_rendering_active = false;
            s.pure_visual_state = false;
            s.current_phase = GenerationPhase::Idle;
            s.current_transition = None;
            s.phase_start_time = None;
            s.set_status_text(String::new());

            tracing::info!(message_id = %message_id, "exclusive control released");
            ctx.emit_handoff(
                HandoffEvent::new(
                    previous,
                    MessageOwner::None,
                    HandoffReason::ControlReleased,
                    s.current_phase,
                )
                .with_message_id(Some(message_id)),
            );
            s
        });
    }

    /// 回到初始状态，但保留受控消息集合
    pub fn reset(&self) {
        self.queue_update(|s, ctx| {
            ctx.after_apply(AfterApply::CancelDeployment);
            CoordinatorState {
                controlled_messages: s.controlled_messages,
                ..CoordinatorState::default()
            }
        });
    }

    /// 回到初始状态，连受控消息集合一起清空
    pub fn full_reset(&self) {
        self.queue_update(|_, ctx| {
            ctx.after_apply(AfterApply::CancelDeployment);
            CoordinatorState::default()
        });
    }
}

/// 阶段切换：记录退出阶段耗时、拼出状态行、清除任何残留的所有权锁
pub(crate) fn apply_phase_transition(
    mut s: CoordinatorState,
    ctx: &mut UpdateContext<'_>,
    to: GenerationPhase,
    hints: TransitionHints,
    text: FriendlyText,
) -> CoordinatorState {
    if to == GenerationPhase::Idle || to < s.current_phase {
        tracing::warn!(
            from = %s.current_phase,
            %to,
            "phase transition rejected: phases only move forward"
        );
        return s;
    }

    let now = Utc::now();
    s.record_phase_exit(now);

    let status = match hints.custom_message.as_deref() {
        Some(custom) if !custom.trim().is_empty() => text.rewrite(custom, to),
        _ => describe_phase(to, &hints),
    };
    let transition = PhaseTransitionContext {
        from_phase: s.current_phase,
        to_phase: to,
        hints,
    };

    tracing::debug!(from = %transition.from_phase, to = %to, "phase transition");

    s.current_phase = to;
    s.current_transition = Some(transition.clone());
    s.phase_start_time = Some(now);
    s.set_status_text(status.clone());
    s.display_state = DisplayState::Thinking;
    s.show_k_loading_animation = true;
    s.is_generating = true;
    s.exclusive_rendering_active = true;
    s.pure_visual_state = false;
    s.ownership_locked = false;
    s.pending_ownership_transfer = false;

    ctx.emit_handoff(
        HandoffEvent::new(s.current_owner, s.current_owner, HandoffReason::PhaseTransition, to)
            .with_message(status)
            .with_transition(transition)
            .with_message_id(s.active_message_id.clone()),
    );
    s
}
