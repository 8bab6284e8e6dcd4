//! Query fingerprinting
//!
//! Maps `(library, major version, free-text query)` onto a stable cache key of
//! the form `{library}-{major}:{intent}`. Near-duplicate questions ("Rails auth",
//! "How to add authentication to Rails") collapse onto the same key because the
//! query text only contributes a coarse intent label.
//!
//! Classification scans the query against an ordered table of intent
//! categories. The first category with a matching trigger wins. Trigger tokens
//! ending in `*` match as word prefixes; all others match whole words (a
//! trailing plural `s` is tolerated).

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

/// Version label used when the major version is unknown
pub const LATEST: &str = "latest";

/// Intent label used when a query has no usable words
pub const GENERAL: &str = "general";

/// Coarse intent categories, in default priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Authentication,
    Routing,
    Database,
    Testing,
    Deployment,
    Configuration,
    Hooks,
    StateManagement,
    Forms,
    Styling,
    Api,
    ErrorHandling,
    Performance,
    GettingStarted,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Authentication => "authentication",
            Intent::Routing => "routing",
            Intent::Database => "database",
            Intent::Testing => "testing",
            Intent::Deployment => "deployment",
            Intent::Configuration => "configuration",
            Intent::Hooks => "hooks",
            Intent::StateManagement => "state_management",
            Intent::Forms => "forms",
            Intent::Styling => "styling",
            Intent::Api => "api",
            Intent::ErrorHandling => "error_handling",
            Intent::Performance => "performance",
            Intent::GettingStarted => "getting_started",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IntentLabel {
    /// Matched a category of the intent table
    Category(Intent),
    /// No category matched; first content word of the query
    Keyword(String),
    /// Nothing usable in the query
    General,
}

impl fmt::Display for IntentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentLabel::Category(intent) => f.write_str(intent.as_str()),
            IntentLabel::Keyword(word) => f.write_str(word),
            IntentLabel::General => f.write_str(GENERAL),
        }
    }
}

/// Words never used as a fallback intent
const STOPWORDS: &[&str] = &[
    "about", "add", "and", "are", "best", "can", "does", "doc", "docs", "documentation",
    "example", "examples", "for", "from", "get", "guide", "help", "how", "into", "make", "need",
    "set", "that", "the", "this", "use", "using", "via", "way", "what", "when", "where", "which",
    "why", "with", "you", "your",
];

/// One category and its trigger phrases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRule {
    pub intent: Intent,
    pub triggers: Vec<String>,
}

/// Ordered intent table
///
/// Serialized as the plain list of rules; trigger patterns are compiled on
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<IntentRule>", into = "Vec<IntentRule>")]
pub struct IntentTable {
    rules: Vec<IntentRule>,
    compiled: Vec<(Intent, Vec<Pattern>)>,
}

impl From<Vec<IntentRule>> for IntentTable {
    fn from(rules: Vec<IntentRule>) -> Self {
        let compiled = rules
            .iter()
            .map(|rule| {
                let patterns = rule
                    .triggers
                    .iter()
                    .map(|t| Pattern::parse(t))
                    .filter(|p| !p.words.is_empty())
                    .collect();
                (rule.intent, patterns)
            })
            .collect();
        Self { rules, compiled }
    }
}

impl From<IntentTable> for Vec<IntentRule> {
    fn from(table: IntentTable) -> Self {
        table.rules
    }
}

/// A parsed trigger phrase: one pattern per word
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    words: Vec<(String, bool)>,
}

impl Pattern {
    fn parse(phrase: &str) -> Self {
        let words = phrase
            .split_whitespace()
            .map(|w| {
                let w = w.to_lowercase();
                match w.strip_suffix('*') {
                    Some(stem) => (stem.to_string(), true),
                    None => (w, false),
                }
            })
            .collect();
        Self { words }
    }

    fn matches_at(&self, tokens: &[String], start: usize) -> bool {
        if self.words.is_empty() || start + self.words.len() > tokens.len() {
            return false;
        }
        self.words
            .iter()
            .zip(&tokens[start..])
            .all(|((word, prefix), token)| {
                if *prefix {
                    token.starts_with(word.as_str())
                } else {
                    token == word || token.strip_suffix('s') == Some(word.as_str())
                }
            })
    }

    fn matches(&self, tokens: &[String]) -> bool {
        (0..tokens.len()).any(|i| self.matches_at(tokens, i))
    }
}

fn rule(intent: Intent, triggers: &[&str]) -> IntentRule {
    IntentRule {
        intent,
        triggers: triggers.iter().map(|t| t.to_string()).collect(),
    }
}

impl IntentTable {
    /// The built-in table, constructed once
    pub fn builtin() -> &'static IntentTable {
        static TABLE: OnceLock<IntentTable> = OnceLock::new();
        TABLE.get_or_init(Self::default_rules)
    }

    fn default_rules() -> Self {
        Self::from(vec![
            rule(
                Intent::Authentication,
                &[
                    "auth*", "login", "logout", "log in", "signin", "sign in", "signup",
                    "sign up", "session", "oauth*", "jwt", "password", "credential*",
                ],
            ),
            rule(
                Intent::Routing,
                &["rout*", "url", "navigat*", "link", "redirect*", "middleware"],
            ),
            rule(
                Intent::Database,
                &[
                    "database*", "db", "sql", "orm", "migration*", "model", "schema*",
                    "activerecord", "query builder", "transaction*", "postgres*", "mysql",
                ],
            ),
            rule(
                Intent::Testing,
                &["test*", "spec", "mock*", "fixture*", "jest", "rspec", "pytest", "assert*"],
            ),
            rule(
                Intent::Deployment,
                &["deploy*", "production", "docker*", "hosting", "kubernetes", "ci"],
            ),
            rule(
                Intent::Configuration,
                &["config*", "setting*", "environment", "env", "dotenv"],
            ),
            rule(
                Intent::Hooks,
                &[
                    "hook*", "usestate", "useeffect", "usememo", "usecallback", "usecontext",
                    "useref", "usereducer",
                ],
            ),
            rule(
                Intent::StateManagement,
                &["state", "redux", "store", "zustand", "mobx", "context api"],
            ),
            rule(Intent::Forms, &["form", "validat*", "input", "submit*"]),
            rule(
                Intent::Styling,
                &["styl*", "css", "tailwind", "theme*", "sass", "layout"],
            ),
            rule(
                Intent::Api,
                &["api", "rest", "graphql", "endpoint*", "fetch*", "http", "request*", "axios"],
            ),
            rule(
                Intent::ErrorHandling,
                &["error*", "exception*", "rescue", "panic*", "debug*"],
            ),
            rule(
                Intent::Performance,
                &["performance", "perf", "optimi*", "cach*", "lazy", "memo*", "speed"],
            ),
            rule(
                Intent::GettingStarted,
                &[
                    "getting started", "get started", "quickstart", "install*", "setup",
                    "introduction", "overview", "tutorial", "basics",
                ],
            ),
        ])
    }

    /// Load a table from JSON: `[{"intent": "routing", "triggers": ["rout*"]}, ...]`
    ///
    /// Order in the document is priority order.
    pub fn from_json(json: &str) -> Result<Self> {
        let table: IntentTable = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.intent) {
                return Err(CacheError::ConfigError(format!(
                    "intent {} listed more than once",
                    rule.intent
                )));
            }
            if rule.triggers.iter().all(|t| t.trim().is_empty()) {
                return Err(CacheError::ConfigError(format!(
                    "intent {} has no triggers",
                    rule.intent
                )));
            }
        }
        Ok(())
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }

    /// Classify a query. `library` is never chosen as the fallback word.
    pub fn classify(&self, query: &str, library: &str) -> IntentLabel {
        let tokens = tokenize(query);

        for (intent, patterns) in &self.compiled {
            if patterns.iter().any(|p| p.matches(&tokens)) {
                return IntentLabel::Category(*intent);
            }
        }

        let library = library.to_lowercase();
        tokens
            .into_iter()
            .find(|t| {
                t.chars().count() >= 3
                    && !t.chars().all(|c| c.is_ascii_digit())
                    && *t != library
                    && !STOPWORDS.contains(&t.as_str())
            })
            .map(IntentLabel::Keyword)
            .unwrap_or(IntentLabel::General)
    }
}

impl Default for IntentTable {
    fn default() -> Self {
        Self::builtin().clone()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// A computed fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub key: String,
    pub library: String,
    pub major_version: String,
    pub intent: String,
}

impl Fingerprint {
    /// Split a key back into its components
    pub fn parse(key: &str) -> Result<Self> {
        let malformed = || CacheError::MalformedInput(format!("invalid fingerprint: {:?}", key));

        let (head, intent) = key.rsplit_once(':').ok_or_else(malformed)?;
        let (library, major_version) = head.rsplit_once('-').ok_or_else(malformed)?;
        if library.is_empty() || major_version.is_empty() || intent.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            key: key.to_string(),
            library: library.to_string(),
            major_version: major_version.to_string(),
            intent: intent.to_string(),
        })
    }

    fn compose(library: String, major_version: String, intent: String) -> Self {
        Self {
            key: format!("{}-{}:{}", library, major_version, intent),
            library,
            major_version,
            intent,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Normalize a library id: trimmed, lowercased, non-empty, no `:`
pub fn normalize_library(library: &str) -> Result<String> {
    let library = library.trim().to_lowercase();
    if library.is_empty() {
        return Err(CacheError::MalformedInput("empty library id".to_string()));
    }
    if library.contains(':') || library.chars().any(char::is_whitespace) {
        return Err(CacheError::MalformedInput(format!(
            "library id {:?} contains ':' or whitespace",
            library
        )));
    }
    Ok(library)
}

/// Reduce a version string to its major component (`"^18.2.0"` -> `"18"`)
pub fn major_version(version: Option<&str>) -> String {
    let raw = version.unwrap_or("").trim().to_lowercase();
    let stripped = raw.trim_start_matches(|c: char| "^~=<>v ".contains(c));
    let major: String = stripped
        .split(|c: char| c == '.' || c == '-' || c == ':' || c.is_whitespace())
        .next()
        .unwrap_or("")
        .to_string();

    if major.is_empty() || major == "*" || major == "x" {
        LATEST.to_string()
    } else {
        major
    }
}

/// Fingerprint a query with the built-in intent table
pub fn fingerprint(library: &str, version: Option<&str>, query: &str) -> Result<Fingerprint> {
    fingerprint_with(IntentTable::builtin(), library, version, query)
}

/// Fingerprint a query with a custom intent table
pub fn fingerprint_with(
    table: &IntentTable,
    library: &str,
    version: Option<&str>,
    query: &str,
) -> Result<Fingerprint> {
    let library = normalize_library(library)?;
    let major = major_version(version);
    let intent = table.classify(query, &library).to_string();
    Ok(Fingerprint::compose(library, major, intent))
}
