//! 阶段状态行推导
//!
//! 从用户需求中尽力提取一个「主题」（如 "todo app"），再按阶段拼出展示文案。
//! 主题提取是启发式的：领域关键词表 → 前 1~4 个有意义的词 → 兜底 "app"。同样的输入总是得到同样的输出。

use crate::core::state::{GenerationPhase, TransitionHints};

/// 领域关键词（按顺序匹配，首个命中即用右侧主题）
const DOMAIN_KEYWORDS: &[(&str, &str)] = &[
    ("todo", "todo app"),
    ("to-do", "todo app"),
    ("task manager", "task manager"),
    ("e-commerce", "online store"),
    ("ecommerce", "online store"),
    ("shop", "online store"),
    ("store", "online store"),
    ("marketplace", "marketplace"),
    ("blog", "blog"),
    ("portfolio", "portfolio"),
    ("landing page", "landing page"),
    ("dashboard", "dashboard"),
    ("crm", "CRM"),
    ("inventory", "inventory system"),
    ("booking", "booking app"),
    ("chat", "chat app"),
    ("social", "social app"),
    ("game", "game"),
    ("wallet", "wallet"),
    ("nft", "NFT app"),
    ("dao", "DAO"),
    ("voting", "voting app"),
    ("calculator", "calculator"),
    ("weather", "weather app"),
];

/// 提取主题时跳过的词
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "i", "me", "my", "we", "our", "you", "your", "please", "can", "could",
    "would", "want", "need", "like", "to", "for", "with", "and", "or", "that", "which", "of", "in",
    "on", "it", "is", "be", "build", "create", "make", "generate", "develop", "design", "write",
    "help", "simple", "new", "some", "just", "basic", "app", "application",
];

const MAX_SUBJECT_WORDS: usize = 4;

/// 把需求拆成小写词（保留连字符）
fn words(request: &str) -> Vec<String> {
    request
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// 从用户需求中提取主题
pub fn extract_subject(request: &str) -> String {
    let tokens = words(request);
    if tokens.is_empty() {
        return "app".to_string();
    }
    let joined = format!(" {} ", tokens.join(" "));

    for (keyword, subject) in DOMAIN_KEYWORDS {
        let hit = if keyword.contains(' ') {
            joined.contains(&format!(" {keyword} "))
        } else {
            tokens.iter().any(|t| t == keyword || t.strip_suffix('s') == Some(keyword))
        };
        if hit {
            return subject.to_string();
        }
    }

    let meaningful: Vec<&str> = tokens
        .iter()
        .map(String::as_str)
        .filter(|w| !STOP_WORDS.contains(w) && w.chars().any(|c| c.is_alphabetic()))
        .take(MAX_SUBJECT_WORDS)
        .collect();

    if meaningful.is_empty() {
        "app".to_string()
    } else {
        meaningful.join(" ")
    }
}

/// 按阶段推导状态行；有 user_request 时带上主题
pub fn describe_phase(phase: GenerationPhase, hints: &TransitionHints) -> String {
    let subject = hints
        .user_request
        .as_deref()
        .map(extract_subject)
        .unwrap_or_else(|| "app".to_string());

    match phase {
        GenerationPhase::Idle => "Getting started...".to_string(),
        GenerationPhase::Specification => format!("Understanding what your {subject} needs..."),
        GenerationPhase::TemplateSelection => {
            format!("Choosing the best starting point for your {subject}...")
        }
        GenerationPhase::TemplateFetching => match hints.template_name.as_deref() {
            Some(name) => format!("Loading the {name} template..."),
            None => format!("Loading a starter template for your {subject}..."),
        },
        GenerationPhase::BackendPreparation => {
            format!("Planning the backend for your {subject}...")
        }
        GenerationPhase::BackendGeneration => format!("Building the backend for your {subject}..."),
        GenerationPhase::BackendAnalysis => format!("Reviewing the backend of your {subject}..."),
        GenerationPhase::FrontendPreparation => {
            format!("Planning the interface for your {subject}...")
        }
        GenerationPhase::FrontendGeneration => {
            format!("Designing the interface for your {subject}...")
        }
        GenerationPhase::ConfigurationGeneration => {
            format!("Setting up the configuration for your {subject}...")
        }
        GenerationPhase::ProjectOrganization => match hints.file_count {
            Some(n) if n > 0 => format!("Organizing {n} files for your {subject}..."),
            _ => format!("Organizing the files for your {subject}..."),
        },
        GenerationPhase::PlatformIntegration => {
            format!("Getting your {subject} ready to launch...")
        }
        GenerationPhase::Complete => format!("Your {subject} is ready!"),
    }
}
