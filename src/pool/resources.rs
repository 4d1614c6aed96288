//! Declared-resource overlap checks.
//!
//! Resources are glob patterns (`src/api/**`, `Cargo.toml`). The engine never
//! enforces them on disk; they only decide whether two tasks may run together.

use glob::Pattern;

fn patterns_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let matches = |pattern: &str, path: &str| Pattern::new(pattern).is_ok_and(|p| p.matches(path));
    matches(a, b) || matches(b, a)
}

/// Resources from `a` that collide with something in `b`.
pub fn overlapping(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = a
        .iter()
        .filter(|pa| b.iter().any(|pb| patterns_overlap(pa, pb)))
        .cloned()
        .collect();
    out.dedup();
    out
}

pub fn conflicts(a: &[String], b: &[String]) -> bool {
    a.iter().any(|pa| b.iter().any(|pb| patterns_overlap(pa, pb)))
}
