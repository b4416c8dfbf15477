//! Version Resolution - Decide which ref a repository tracks
//!
//! `resolve_ref` picks the branch or tag to fetch content from. The remaining
//! helpers compare loosely formatted release tags ("v1.2", "2024.1.0b3").

use regex::Regex;
use semver::Version;
use std::sync::OnceLock;

/// Branch assumed when the remote never reported a default branch.
pub const FALLBACK_BRANCH: &str = "main";

/// Choose the ref to operate against.
///
/// Only side effect: `selected_tag` is cleared when it equals `last_version`,
/// so a repository that caught up with a pinned tag follows releases again.
pub fn resolve_ref(
    last_version: Option<&str>,
    selected_tag: &mut Option<String>,
    published_tags: &[String],
    default_branch: Option<&str>,
) -> String {
    if let Some(last_version) = last_version {
        if selected_tag.as_deref() == Some(last_version) {
            *selected_tag = None;
            return last_version.to_string();
        }
        if let Some(selected) = selected_tag.as_ref() {
            return selected.clone();
        }
        return last_version.to_string();
    }

    if let Some(selected) = selected_tag.as_ref() {
        if Some(selected.as_str()) == default_branch || published_tags.contains(selected) {
            return selected.clone();
        }
    }

    match default_branch {
        Some(branch) if !branch.is_empty() => branch.to_string(),
        _ => FALLBACK_BRANCH.to_string(),
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[vV]?(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:[.\-+]?([0-9A-Za-z.\-]+))?$")
            .unwrap_or_else(|_| unreachable!("static version pattern"))
    })
}

/// Parse a tag into a semantic version, padding missing components.
///
/// "v1.2" becomes 1.2.0, "2024.1.0b3" becomes 2024.1.0-b3.
pub fn parse_lenient(tag: &str) -> Option<Version> {
    if let Ok(version) = Version::parse(tag.trim_start_matches(['v', 'V'])) {
        return Some(version);
    }

    let captures = version_pattern().captures(tag.trim())?;
    let part = |index: usize| {
        captures
            .get(index)
            .map(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(Some(0))
    };

    let mut version = Version::new(part(1)?, part(2)?, part(3)?);
    if let Some(pre) = captures.get(4) {
        let pre = pre.as_str().trim_matches(['.', '-']);
        if !pre.is_empty() {
            version.pre = semver::Prerelease::new(pre).ok()?;
        }
    }
    Some(version)
}

/// Whether `candidate` is a newer version than `current`.
///
/// Returns `None` when either side is not a recognisable version (branch names,
/// commit hashes).
pub fn is_newer(candidate: &str, current: &str) -> Option<bool> {
    let candidate = parse_lenient(candidate)?;
    let current = parse_lenient(current)?;
    Some(candidate > current)
}

/// Whether a running host version satisfies a declared minimum.
///
/// Unparseable versions never block an install.
pub fn satisfies_minimum(current: &str, required: &str) -> bool {
    match (parse_lenient(current), parse_lenient(required)) {
        (Some(current), Some(required)) => current >= required,
        _ => true,
    }
}
