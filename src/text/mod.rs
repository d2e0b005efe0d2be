//! 展示文案：技术文案改写为友好文案、按阶段推导状态行
//!
//! - **friendly**: 已知技术短语替换 + 正则剥离术语 + 标点收尾 + 过短兜底
//! - **phase_text**: 从用户需求中提取「主题」，拼出每个阶段的状态行

pub mod friendly;
pub mod phase_text;

pub use friendly::{make_user_friendly, phase_fallback, FriendlyText};
pub use phase_text::{describe_phase, extract_subject};
