//! Static field table for merging index data into repository records
//!
//! Index entries arrive as loose JSON objects. Each known key maps to a setter
//! that understands the value's shape; unknown keys and values of the wrong
//! type are skipped.

use super::Repository;
use crate::error::Result;
use serde_json::{Map, Value};
use tracing::trace;

type Setter = fn(&mut Repository, &Value) -> bool;

/// Generic topics that say nothing about a repository
pub const TOPIC_FILTER: &[&str] = &[
    "custom-card",
    "custom-cards",
    "custom-component",
    "custom-components",
    "customcomponent",
    "customcomponents",
    "hacktoberfest",
    "hacs-default",
    "hacs-integration",
    "hacs-repository",
    "hacs",
    "hass",
    "hassio",
    "home-assistant-custom",
    "home-assistant-frontend",
    "home-assistant-hacs",
    "home-assistant-sensor",
    "home-assistant",
    "home-automation",
    "homeassistant-components",
    "homeassistant-integration",
    "homeassistant-sensor",
    "homeassistant",
    "homeautomation",
    "integration",
    "lovelace-ui",
    "lovelace",
    "python-script",
    "python-scripts",
    "python",
    "sensor",
    "theme",
    "themes",
    "template",
];

/// Known index keys and their setters. `id` is not listed: it goes through
/// the identity check in [`merge`].
pub static FIELD_TABLE: &[(&str, Setter)] = &[
    ("full_name", |r: &mut Repository, v: &Value| set_string(&mut r.full_name, v)),
    ("description", |r: &mut Repository, v: &Value| set_opt_string(&mut r.description, v)),
    ("default_branch", |r: &mut Repository, v: &Value| set_opt_string(&mut r.default_branch, v)),
    ("domain", |r: &mut Repository, v: &Value| set_opt_string(&mut r.domain, v)),
    ("manifest_name", |r: &mut Repository, v: &Value| set_opt_string(&mut r.manifest_name, v)),
    ("last_version", |r: &mut Repository, v: &Value| set_opt_string(&mut r.last_version, v)),
    ("last_commit", |r: &mut Repository, v: &Value| set_opt_string(&mut r.last_commit, v)),
    ("last_updated", |r: &mut Repository, v: &Value| set_opt_string(&mut r.last_updated, v)),
    ("prerelease", |r: &mut Repository, v: &Value| set_opt_string(&mut r.prerelease, v)),
    ("stargazers_count", |r: &mut Repository, v: &Value| set_u64(&mut r.stargazers_count, v)),
    ("stars", |r: &mut Repository, v: &Value| set_u64(&mut r.stargazers_count, v)),
    ("downloads", |r: &mut Repository, v: &Value| set_u64(&mut r.downloads, v)),
    ("archived", |r: &mut Repository, v: &Value| set_bool(&mut r.archived, v)),
    ("config_flow", |r: &mut Repository, v: &Value| set_bool(&mut r.config_flow, v)),
    ("releases", |r: &mut Repository, v: &Value| set_bool(&mut r.releases, v)),
    ("authors", |r: &mut Repository, v: &Value| set_strings(&mut r.authors, v)),
    ("topics", |r: &mut Repository, v: &Value| {
        let mut topics = Vec::new();
        if !set_strings(&mut topics, v) {
            return false;
        }
        r.topics = filter_topics(&topics);
        true
    }),
];

/// Drop generic topics, keeping order
pub fn filter_topics(topics: &[String]) -> Vec<String> {
    topics
        .iter()
        .filter(|topic| !TOPIC_FILTER.contains(&topic.as_str()))
        .cloned()
        .collect()
}

/// Merge an index entry into a record.
///
/// The id is checked first; on a conflicting id nothing is merged. Returns
/// the number of fields applied.
pub fn merge(repository: &mut Repository, data: &Map<String, Value>) -> Result<usize> {
    if let Some(id) = data.get("id").and_then(as_id) {
        repository.set_id(id)?;
    }

    let mut applied = 0;
    for (key, setter) in FIELD_TABLE {
        if let Some(value) = data.get(*key) {
            if setter(repository, value) {
                applied += 1;
            } else {
                trace!("Skipping {} for {}: unexpected value {}", key, repository.full_name, value);
            }
        }
    }
    Ok(applied)
}

/// Ids show up as numbers or numeric strings
fn as_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn set_string(field: &mut String, value: &Value) -> bool {
    match value.as_str() {
        Some(s) if !s.is_empty() => {
            *field = s.to_string();
            true
        }
        _ => false,
    }
}

fn set_opt_string(field: &mut Option<String>, value: &Value) -> bool {
    match value {
        Value::Null => {
            *field = None;
            true
        }
        Value::String(s) => {
            *field = Some(s.clone());
            true
        }
        _ => false,
    }
}

fn set_u64(field: &mut u64, value: &Value) -> bool {
    match value.as_u64() {
        Some(n) => {
            *field = n;
            true
        }
        None => false,
    }
}

fn set_bool(field: &mut bool, value: &Value) -> bool {
    match value.as_bool() {
        Some(b) => {
            *field = b;
            true
        }
        None => false,
    }
}

fn set_strings(field: &mut Vec<String>, value: &Value) -> bool {
    let Some(items) = value.as_array() else {
        return false;
    };
    *field = items
        .iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect();
    true
}
