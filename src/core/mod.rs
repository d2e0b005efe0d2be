//! 核心协调层：状态、事件、监听器、更新队列、所有权状态机、生成生命周期、纯视觉状态

pub mod coordinator;
pub mod error;
pub mod events;
pub mod generation;
pub mod listeners;
pub(crate) mod queue;
pub mod state;
pub mod visual;

pub use coordinator::MessageCoordinator;
pub use error::CoordinatorError;
pub use events::{HandoffEvent, HandoffReason, MessageCreationEvent};
pub use generation::MessageCreationResult;
pub use listeners::Subscription;
pub use state::{
    CompletionData, CoordinatorState, DisplayState, GenerationPhase, MessageOwner, PhaseInfo,
    PhaseRecord, PhaseTransitionContext, TransitionHints,
};
