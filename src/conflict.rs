//! Heuristic conflict detection between feature descriptions.
//!
//! Before scheduling two features in parallel, the supervisor asks whether
//! their descriptions look like they would touch the same part of the tree.
//! This is regex-based signal extraction over free text the producer does
//! not control, so false positives and false negatives are expected; the
//! result is a scheduling hint, never a guarantee.
//!
//! Extraction categories, in reporting precedence:
//! 1. file    — path-like tokens with an extension (`src/auth.ts`)
//! 2. component — capitalized component/module nouns (`AuthForm`)
//! 3. folder  — directory hints (`src/api/`, "in the utils directory")
//! 4. action  — destructive verb + target phrases (refactor/rewrite/migrate)
//!
//! For each unordered pair, only the first overlapping category is reported.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::registry::Feature;

// Compile regexes once using LazyLock
static FILE_PATH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w./-]*\w+\.[a-zA-Z]{1,6}\b").unwrap());

static COMPONENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+\b").unwrap());

static FOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([\w-]+(?:/[\w-]+)*)/(?:\s|$)|\bin the ([\w-]+) (?:folder|directory)\b")
        .unwrap()
});

static ACTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(refactor|rewrite|migrate|restructure|rename|overhaul|replace|delete|remove|move|consolidate)\s+(?:the\s+)?([\w./-]+)",
    )
    .unwrap()
});

/// Common English words the component regex would otherwise pick up.
const COMPONENT_STOPWORDS: &[&str] = &["TypeScript", "JavaScript", "GitHub", "GraphQL", "OAuth"];

/// Category of detected overlap, ordered by reporting precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    File,
    Component,
    Folder,
    Action,
}

/// One detected pairwise conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConflict {
    pub feature_a: String,
    pub feature_b: String,
    pub kind: ConflictKind,
    /// The overlapping tokens that triggered the conflict.
    pub shared: Vec<String>,
}

/// Signals extracted from one feature description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptionSignals {
    pub files: BTreeSet<String>,
    pub components: BTreeSet<String>,
    pub folders: BTreeSet<String>,
    pub actions: BTreeSet<String>,
}

/// Extract conflict signals from a free-text feature description.
pub fn extract_signals(description: &str) -> DescriptionSignals {
    let mut signals = DescriptionSignals::default();

    for m in FILE_PATH_REGEX.find_iter(description) {
        let token = m.as_str().trim_matches('.');
        // Require an extension-looking suffix and skip bare version numbers
        if token.contains('.') && !token.chars().all(|c| c.is_ascii_digit() || c == '.') {
            signals.files.insert(token.to_string());
        }
    }

    for m in COMPONENT_REGEX.find_iter(description) {
        let token = m.as_str();
        if !COMPONENT_STOPWORDS.contains(&token) {
            signals.components.insert(token.to_string());
        }
    }

    for cap in FOLDER_REGEX.captures_iter(description) {
        if let Some(m) = cap.get(1).or_else(|| cap.get(2)) {
            signals.folders.insert(m.as_str().trim_end_matches('/').to_string());
        }
    }
    // Directory portion of any file path doubles as a folder hint
    for file in &signals.files {
        if let Some((dir, _)) = file.rsplit_once('/') {
            signals.folders.insert(dir.to_string());
        }
    }

    for cap in ACTION_REGEX.captures_iter(description) {
        if let (Some(verb), Some(target)) = (cap.get(1), cap.get(2)) {
            signals.actions.insert(format!(
                "{} {}",
                verb.as_str().to_lowercase(),
                target.as_str().to_lowercase()
            ));
        }
    }

    signals
}

/// Analyze every unordered pair of features for likely overlap.
///
/// Symmetric in its input order; each pair reports at most one conflict, the
/// first overlapping category in file > component > folder > action order.
pub fn analyze_feature_conflicts(features: &[Feature]) -> Vec<FeatureConflict> {
    let signals: Vec<DescriptionSignals> = features
        .iter()
        .map(|f| extract_signals(&f.description))
        .collect();

    let mut conflicts = Vec::new();
    for i in 0..features.len() {
        for j in (i + 1)..features.len() {
            if let Some(conflict) = first_overlap(&features[i].id, &signals[i], &features[j].id, &signals[j]) {
                conflicts.push(conflict);
            }
        }
    }
    conflicts
}

fn first_overlap(
    id_a: &str,
    a: &DescriptionSignals,
    id_b: &str,
    b: &DescriptionSignals,
) -> Option<FeatureConflict> {
    let categories: [(ConflictKind, &BTreeSet<String>, &BTreeSet<String>); 4] = [
        (ConflictKind::File, &a.files, &b.files),
        (ConflictKind::Component, &a.components, &b.components),
        (ConflictKind::Folder, &a.folders, &b.folders),
        (ConflictKind::Action, &a.actions, &b.actions),
    ];

    for (kind, set_a, set_b) in categories {
        let shared: Vec<String> = set_a.intersection(set_b).cloned().collect();
        if !shared.is_empty() {
            return Some(FeatureConflict {
                feature_a: id_a.to_string(),
                feature_b: id_b.to_string(),
                kind,
                shared,
            });
        }
    }
    None
}
