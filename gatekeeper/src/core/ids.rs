//! Identifier rules for tasks, checkpoints and authorizations.
//!
//! Ids end up in git ref names and report file names, so they are restricted
//! to `[A-Za-z0-9._-]`.

use chrono::{DateTime, Utc};

/// Validate that an id is safe for use in ref and file names.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id must not be empty".to_string());
    }
    if id.starts_with('-') || id.starts_with('.') {
        return Err(format!("id must not start with '-' or '.' (got '{id}')"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(format!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Derive a time-based id that does not collide with any id `taken` reports.
///
/// The base is `<prefix>-<YYYYMMDDTHHMMSSZ>`; collisions within the same
/// second get a `-2`, `-3`, ... suffix.
pub fn time_derived_id(
    prefix: &str,
    at: DateTime<Utc>,
    taken: impl Fn(&str) -> bool,
) -> Result<String, String> {
    let base = format!("{prefix}-{}", at.format("%Y%m%dT%H%M%SZ"));
    for suffix in 1..=9_999u32 {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        if !taken(&id) {
            return Ok(id);
        }
    }
    Err(format!("unable to derive unique id from base '{base}'"))
}

/// Replace characters that are unsafe in file names (e.g. `/` in branch names).
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn validate_id_rejects_unsafe_characters() {
        assert!(validate_id("task-1.a_b").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("-flag").is_err());
        assert!(validate_id("has space").is_err());
    }

    #[test]
    fn time_derived_ids_are_unique_within_one_second() {
        let at = Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 5).unwrap();
        let mut taken = HashSet::new();
        for _ in 0..3 {
            let id = time_derived_id("cp", at, |id| taken.contains(id)).expect("id");
            assert!(taken.insert(id));
        }
        let mut ids: Vec<_> = taken.into_iter().collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                "cp-20261017T093005Z",
                "cp-20261017T093005Z-2",
                "cp-20261017T093005Z-3"
            ]
        );
    }

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_component("feature/login flow"), "feature-login-flow");
        assert_eq!(sanitize_component("///"), "unknown");
    }
}
