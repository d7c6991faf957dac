//! Request classification: request text + originating page → category.
//!
//! Precedence, first match wins:
//! 1. broad/complex-workflow phrasing forces `hybrid`;
//! 2. two or more of the five category keyword sets matching forces `hybrid`;
//! 3. a single keyword-set match (or, failing that, workflow keywords) wins;
//! 4. the originating page's category;
//! 5. `chat`.

use std::sync::OnceLock;

use regex::Regex;

use taskloom_core::types::RequestCategory;

const HYBRID_KEYWORDS: &[&str] = &[
    "comprehensive",
    "multi-step",
    "multi step",
    "both",
    "end-to-end",
    "end to end",
    "across all",
    "overall",
    "full analysis",
];

/// The five keyword sets counted for multi-category detection.
const CATEGORY_KEYWORDS: &[(RequestCategory, &[&str])] = &[
    (
        RequestCategory::Analytics,
        &["analytic", "analys", "analyz", "metric", "report", "trend", "statistic", "dashboard", "kpi"],
    ),
    (
        RequestCategory::Device,
        &["device", "router", "switch", "firewall", "interface", "firmware", "ssh"],
    ),
    (
        RequestCategory::Operations,
        &["incident", "alert", "outage", "ticket", "maintenance", "operation", "on-call", "uptime"],
    ),
    (
        RequestCategory::Automation,
        &["automat", "schedul", "script", "playbook", "trigger", "cron"],
    ),
    (
        RequestCategory::Chat,
        &["hello", "hey", "thanks", "thank you", "help me", "explain", "what is", "who are you"],
    ),
];

const WORKFLOW_KEYWORDS: &[&str] = &["workflow", "pipeline", "orchestrat", "run tasks"];

const PAGE_CATEGORIES: &[(&str, RequestCategory)] = &[
    ("chat", RequestCategory::Chat),
    ("home", RequestCategory::Chat),
    ("analytics", RequestCategory::Analytics),
    ("dashboard", RequestCategory::Analytics),
    ("reports", RequestCategory::Analytics),
    ("device", RequestCategory::Device),
    ("devices", RequestCategory::Device),
    ("network", RequestCategory::Device),
    ("operations", RequestCategory::Operations),
    ("ops", RequestCategory::Operations),
    ("incidents", RequestCategory::Operations),
    ("automation", RequestCategory::Automation),
    ("workflow", RequestCategory::Workflow),
    ("workflows", RequestCategory::Workflow),
];

/// A compiled keyword set. Category keywords are stems matched at word
/// starts, so `analyz` covers `analyze`, `analyzing`, ...
struct KeywordSet {
    category: RequestCategory,
    pattern: Regex,
}

impl KeywordSet {
    fn new(category: RequestCategory, words: &[&str]) -> Self {
        // Chat phrases are whole words; "hey" must not fire on "heyday".
        let whole_words = category == RequestCategory::Chat;
        Self {
            category,
            pattern: keyword_regex(words, whole_words),
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

struct Tables {
    hybrid: Regex,
    sets: Vec<KeywordSet>,
    workflow: Regex,
}

fn keyword_regex(words: &[&str], whole_words: bool) -> Regex {
    let alternatives: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
    let tail = if whole_words { r"\b" } else { "" };
    // Built from escaped literals only, so compilation cannot fail.
    Regex::new(&format!(r"(?i)\b(?:{}){}", alternatives.join("|"), tail)).expect("keyword regex")
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| Tables {
        hybrid: keyword_regex(HYBRID_KEYWORDS, true),
        sets: CATEGORY_KEYWORDS
            .iter()
            .map(|(category, words)| KeywordSet::new(*category, words))
            .collect(),
        workflow: keyword_regex(WORKFLOW_KEYWORDS, false),
    })
}

/// Classify a request into the category whose graph should handle it.
pub fn classify(request: &str, source_page: &str) -> RequestCategory {
    let tables = tables();

    if tables.hybrid.is_match(request) {
        return RequestCategory::Hybrid;
    }

    let matched: Vec<RequestCategory> = tables
        .sets
        .iter()
        .filter(|set| set.matches(request))
        .map(|set| set.category)
        .collect();

    match matched.as_slice() {
        [] => {}
        [single] => return *single,
        _ => return RequestCategory::Hybrid,
    }

    if tables.workflow.is_match(request) {
        return RequestCategory::Workflow;
    }

    page_category(source_page).unwrap_or(RequestCategory::Chat)
}

/// Category associated with an originating page, if any.
pub fn page_category(source_page: &str) -> Option<RequestCategory> {
    let page = source_page.trim().trim_matches('/').to_lowercase();
    PAGE_CATEGORIES
        .iter()
        .find(|(name, _)| *name == page)
        .map(|(_, category)| *category)
}
