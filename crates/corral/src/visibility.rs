//! Tag-based visibility resolution.
//!
//! Pure functions: equal inputs produce equal, sorted outputs, which is what
//! keeps downstream filtered-snapshot ETags identical across processes.

use crate::catalog::{CatalogSummary, SpecKey};

/// Trim, lowercase, drop empties, dedupe, sort.
pub fn normalize_tags<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut tags: Vec<String> = raw
        .into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort_unstable();
    tags.dedup();
    tags
}

/// Compare two tag lists by normalized form.
pub fn tags_equal<A: AsRef<str>, B: AsRef<str>>(a: &[A], b: &[B]) -> bool {
    normalize_tags(a.iter().map(|t| t.as_ref())) == normalize_tags(b.iter().map(|t| t.as_ref()))
}

/// Resolve the spec keys visible to a client.
///
/// A non-empty `server` pins the client to that one server (tags ignored);
/// a pin that misses — unknown or disabled server — resolves to nothing.
/// Otherwise a spec is visible when the client's tags are empty, the spec's
/// tags are empty, or the two sets intersect. `tags` must already be
/// normalized. Returns the sorted keys and the number of matched servers.
pub fn resolve(tags: &[String], server: &str, summary: &CatalogSummary) -> (Vec<SpecKey>, usize) {
    if !server.is_empty() {
        return match summary.server_spec_keys.get(server) {
            Some(key) => (vec![*key], 1),
            None => (Vec::new(), 0),
        };
    }

    let mut keys = Vec::new();
    for (key, spec) in &summary.spec_registry {
        let spec_tags = normalize_tags(&spec.tags);
        let visible = tags.is_empty()
            || spec_tags.is_empty()
            || tags.iter().any(|t| spec_tags.binary_search(t).is_ok());
        if visible {
            keys.push(*key);
        }
    }
    let count = keys.len();
    keys.sort_unstable();
    (keys, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogState, CommandSpec, ServerSpec};
    use std::collections::BTreeMap;

    fn summary(specs: Vec<(&str, Vec<&str>, bool)>) -> CatalogSummary {
        let servers: BTreeMap<String, ServerSpec> = specs
            .into_iter()
            .map(|(name, tags, disabled)| {
                (
                    name.to_string(),
                    ServerSpec {
                        name: name.into(),
                        command: Some(CommandSpec {
                            command: "run".into(),
                            args: vec![name.into()],
                        }),
                        tags: tags.into_iter().map(String::from).collect(),
                        disabled,
                        ..Default::default()
                    },
                )
            })
            .collect();
        CatalogState::new(
            Catalog {
                servers,
                ..Default::default()
            },
            1,
        )
        .summary
    }

    #[test]
    fn normalize_trims_lowercases_dedupes_sorts() {
        let tags = normalize_tags(["  Git ", "docker", "GIT", "", "docker"]);
        assert_eq!(tags, vec!["docker".to_string(), "git".to_string()]);
    }

    #[test]
    fn tags_equal_compares_normalized() {
        assert!(tags_equal(&["Git", "docker "], &["docker", "git"]));
        assert!(!tags_equal(&["git"], &["docker"]));
    }

    #[test]
    fn server_pin_returns_single_key() {
        let s = summary(vec![("git", vec!["git"], false), ("docker", vec![], false)]);
        let (keys, count) = resolve(&[], "git", &s);
        assert_eq!(count, 1);
        assert_eq!(keys, vec![s.server_spec_keys["git"]]);
    }

    #[test]
    fn missing_or_disabled_pin_resolves_empty() {
        let s = summary(vec![("git", vec!["git"], true)]);
        assert_eq!(resolve(&[], "git", &s), (Vec::new(), 0));
        assert_eq!(resolve(&[], "nope", &s), (Vec::new(), 0));
    }

    #[test]
    fn empty_client_tags_see_everything_enabled() {
        let s = summary(vec![
            ("git", vec!["git"], false),
            ("docker", vec!["docker"], false),
            ("dead", vec![], true),
        ]);
        let (keys, count) = resolve(&[], "", &s);
        assert_eq!(count, 2);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn untagged_specs_are_visible_to_everyone() {
        let s = summary(vec![("open", vec![], false), ("git", vec!["git"], false)]);
        let (keys, _) = resolve(&["docker".to_string()], "", &s);
        assert_eq!(keys, vec![s.server_spec_keys["open"]]);
    }

    #[test]
    fn intersection_matches() {
        let s = summary(vec![
            ("git", vec!["git", "scm"], false),
            ("docker", vec!["docker"], false),
        ]);
        let (keys, count) = resolve(&["scm".to_string()], "", &s);
        assert_eq!(count, 1);
        assert_eq!(keys, vec![s.server_spec_keys["git"]]);
    }

    #[test]
    fn output_is_sorted_and_deterministic() {
        let s = summary(vec![
            ("a", vec![], false),
            ("b", vec![], false),
            ("c", vec![], false),
        ]);
        let (first, _) = resolve(&[], "", &s);
        let (second, _) = resolve(&[], "", &s);
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(first, sorted);
    }
}
