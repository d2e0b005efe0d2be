//! 协调器错误类型
//!
//! 只覆盖「编程错误」与外部协作者失败；所有权守卫拒绝不是错误，只记日志并忽略。

use thiserror::Error;

use crate::sink::SinkError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// 宿主未注册消息出口就尝试创建消息
    #[error("Message sink not registered")]
    SinkNotRegistered,

    #[error("Sink error: {0}")]
    Sink(SinkError),

    #[error("Message not controlled by coordinator: {0}")]
    NotControlling(String),

    /// 排队的操作在生效前协调器已被丢弃
    #[error("Coordinator queue closed")]
    Closed,
}
