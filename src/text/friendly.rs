//! 友好文案改写
//!
//! 处理顺序：
//! 1. 已知技术短语表（大小写不敏感，按优先级，首个命中即返回）
//! 2. 正则剥离：内部组件名、实现术语、数字计数、口头填充词
//! 3. 合并空白与多余标点
//! 4. 首字母大写，结尾保证为 `...` / `.` / `!`
//! 5. 结果为空或过短时，改用当前阶段的兜底文案
//!
//! 对已经友好的文案再跑一遍不会继续缩短。

use std::sync::OnceLock;

use regex::Regex;

use crate::core::state::GenerationPhase;

/// 默认最短长度（与配置 [text].min_friendly_length 的默认值一致）
pub const DEFAULT_MIN_FRIENDLY_LEN: usize = 4;

/// 已知技术短语：全部关键词都出现时替换为右侧文案
const KNOWN_PHRASES: &[(&[&str], &str)] = &[
    (&["streaming", "file"], "Writing your project files..."),
    (&["extracting", "file"], "Organizing your project files..."),
    (&["parsing", "response"], "Reviewing the generated code..."),
    (&["calling", "api"], "Thinking about your request..."),
    (&["sending", "request"], "Thinking about your request..."),
    (&["template", "fetch"], "Loading your starting template..."),
    (&["template", "select"], "Choosing the best starting point..."),
    (&["motoko"], "Building your backend logic..."),
    (&["candid "], "Connecting your backend and frontend..."),
    (&["canister", "deploy"], "Getting your app ready to launch..."),
    (&["dfx"], "Preparing your project configuration..."),
    (&["webpack"], "Setting up your build tools..."),
    (&["vite.config"], "Setting up your build tools..."),
    (&["tsx"], "Designing your user interface..."),
    (&["react component"], "Designing your user interface..."),
    (&["analyzing", "backend"], "Reviewing your backend..."),
    (&["retry"], "Taking another pass at this..."),
];

static STRIP_RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
static CLEANUP_RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

/// 剥离规则（顺序执行）
fn strip_rules() -> &'static [(Regex, &'static str)] {
    STRIP_RULES.get_or_init(|| {
        [
            // [DEBUG] / [ProjectService] 之类的日志前缀
            (r"\[[^\]]*\]", ""),
            // 带数字的括注，如 (1234 tokens)、(3/12)
            (r"\([^)]*\d[^)]*\)", ""),
            (r"(?i)\b\d[\d,]*\s*(?:tokens?|chars?|characters?|bytes?|kb|ms)\b", ""),
            (r"(?i)\b\d+\s+(files?)\b", "$1"),
            (
                concat!(
                    r"(?i)\b(?:message\s*coordinator(?:\s*service)?|project\s*service",
                    r"|file\s*manager|chat\s*service|streaming\s*service|k-?loading",
                    r"|claude|sonnet|gpt-?\d*",
                    r"|llm|api|sdk|json|ast|canister|dfx)\b",
                ),
                "",
            ),
            (
                concat!(
                    r"(?i)\b(?:implementation|internal|system|service|handler|callback",
                    r"|pipeline|orchestrat\w*|async|payload)\b",
                ),
                "",
            ),
            (r"(?i)\b(?:just|simply|basically|actually|currently)\b", ""),
        ]
        .into_iter()
        .map(|(pattern, replacement)| (Regex::new(pattern).expect("valid strip rule"), replacement))
        .collect()
    })
}

/// 空白与标点整理
fn cleanup_rules() -> &'static [(Regex, &'static str)] {
    CLEANUP_RULES.get_or_init(|| {
        [
            (r"\s+", " "),
            (r"\s+([,.!?:;])", "$1"),
            (r"([,:;])(?:\s*[,:;])+", "$1"),
            (r"[,:;]\s*([.!?])", "$1"),
            (r"^[\s,.:;!?\-]+", ""),
            (r"[\s,:;\-]+$", ""),
        ]
        .into_iter()
        .map(|(pattern, replacement)| {
            (Regex::new(pattern).expect("valid cleanup rule"), replacement)
        })
        .collect()
    })
}

/// 已知短语命中：返回替换文案
fn match_known_phrase(input: &str) -> Option<&'static str> {
    let lower = input.to_lowercase();
    KNOWN_PHRASES
        .iter()
        .find(|(keywords, _)| keywords.iter().all(|kw| lower.contains(kw)))
        .map(|(_, friendly)| *friendly)
}

fn apply_rules(mut text: String, rules: &[(Regex, &'static str)]) -> String {
    for (re, replacement) in rules {
        text = re.replace_all(&text, *replacement).into_owned();
    }
    text
}

/// 首字母大写，结尾补 `...`
fn finish_sentence(text: &str) -> String {
    let mut chars = text.chars();
    let mut out = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => return String::new(),
    };
    if !(out.ends_with('.') || out.ends_with('!')) {
        while out.ends_with('?') {
            out.pop();
        }
        out.push_str("...");
    }
    out
}

/// 各阶段的兜底文案
pub fn phase_fallback(phase: GenerationPhase) -> &'static str {
    match phase {
        GenerationPhase::Idle => "Working on it...",
        GenerationPhase::Specification => "Understanding your request...",
        GenerationPhase::TemplateSelection => "Choosing the best starting point...",
        GenerationPhase::TemplateFetching => "Loading your starting template...",
        GenerationPhase::BackendPreparation => "Planning your backend...",
        GenerationPhase::BackendGeneration => "Building your backend...",
        GenerationPhase::BackendAnalysis => "Reviewing your backend...",
        GenerationPhase::FrontendPreparation => "Planning your interface...",
        GenerationPhase::FrontendGeneration => "Designing your interface...",
        GenerationPhase::ConfigurationGeneration => "Setting up your configuration...",
        GenerationPhase::ProjectOrganization => "Organizing your project files...",
        GenerationPhase::PlatformIntegration => "Getting your app ready to launch...",
        GenerationPhase::Complete => "Your project is ready!",
    }
}

/// 友好文案改写器（持有最短长度阈值）
#[derive(Debug, Clone, Copy)]
pub struct FriendlyText {
    min_len: usize,
}

impl Default for FriendlyText {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FRIENDLY_LEN)
    }
}

impl FriendlyText {
    pub fn new(min_len: usize) -> Self {
        Self { min_len }
    }

    pub fn rewrite(&self, input: &str, phase: GenerationPhase) -> String {
        if let Some(friendly) = match_known_phrase(input) {
            return friendly.to_string();
        }

        let stripped = apply_rules(input.to_string(), strip_rules());
        let cleaned = apply_rules(stripped, cleanup_rules());
        let finished = finish_sentence(cleaned.trim());

        let meaningful = finished
            .trim_end_matches(['.', '!'])
            .chars()
            .filter(|c| c.is_alphanumeric())
            .count();
        if meaningful < self.min_len {
            return phase_fallback(phase).to_string();
        }
        finished
    }
}

/// 使用默认阈值改写
pub fn make_user_friendly(input: &str, phase: GenerationPhase) -> String {
    FriendlyText::default().rewrite(input, phase)
}
