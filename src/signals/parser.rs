//! Signal parsing from worker output.
//!
//! Workers may embed structured tags in free-form output:
//! - `<progress>X%</progress>` or `<progress>X</progress>`
//! - `<blocker>description</blocker>`
//! - `<halt category="security">description</halt>`
//! - `<alert category="quality">description</alert>`
//! - `<touched>path/a.rs, path/b.rs</touched>`

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::types::{AlgedonicSignal, BlockerSignal, Category, ProgressSignal, Severity, WorkerSignals};

static PROGRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<progress>\s*(\d{1,3})%?\s*</progress>").unwrap());

static BLOCKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<blocker>(.*?)</blocker>").unwrap());

static ALGEDONIC_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<(halt|alert)\s+category\s*=\s*["']?([A-Za-z_-]+)["']?\s*>(.*?)</(?:halt|alert)>"#)
        .unwrap()
});

static TOUCHED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<touched>(.*?)</touched>").unwrap());

/// Extract all signals from the given text.
pub fn extract_signals(text: &str) -> WorkerSignals {
    let mut signals = WorkerSignals::new();

    for cap in PROGRESS_REGEX.captures_iter(text) {
        if let Some(value) = cap.get(1)
            && let Ok(percentage) = value.as_str().parse::<u8>()
        {
            signals
                .progress
                .push(ProgressSignal::new(percentage.min(100), value.as_str()));
        }
    }

    for cap in BLOCKER_REGEX.captures_iter(text) {
        if let Some(desc) = cap.get(1) {
            let description = desc.as_str().trim();
            if !description.is_empty() {
                signals.blockers.push(BlockerSignal::new(description));
            }
        }
    }

    for cap in ALGEDONIC_REGEX.captures_iter(text) {
        let (Some(tag), Some(category), Some(desc)) = (cap.get(1), cap.get(2), cap.get(3)) else {
            continue;
        };
        let category = match category.as_str().parse::<Category>() {
            Ok(c) => c,
            Err(e) => {
                warn!(tag = tag.as_str(), error = %e, "ignoring algedonic tag with unknown category");
                continue;
            }
        };
        let expected: Severity = match tag.as_str().parse() {
            Ok(s) => s,
            Err(_) => continue,
        };
        if category.severity() != expected {
            // Category decides severity; a mismatched tag is still never dropped.
            warn!(tag = tag.as_str(), category = %category, "algedonic tag severity does not match category");
        }
        signals
            .algedonic
            .push(AlgedonicSignal::new(category, desc.as_str().trim()));
    }

    for cap in TOUCHED_REGEX.captures_iter(text) {
        if let Some(list) = cap.get(1) {
            signals.touched.extend(
                list.as_str()
                    .split([',', '\n'])
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
            );
        }
    }

    if signals.has_signals() {
        debug!(summary = %signals.summary(), "worker output signals");
    }
    signals
}
