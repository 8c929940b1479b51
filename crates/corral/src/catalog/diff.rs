//! Categorized diffs between two catalog snapshots.
//!
//! The reload engine never inspects raw catalogs; every apply step consumes
//! the diff computed here, so classification has to be complete: a change
//! that lands in no bucket is a change that never gets applied.

use super::{CatalogSummary, PluginSpec, RuntimeConfig, ServerSpec, SpecKey};
use std::collections::BTreeSet;

/// Runtime-config delta with the restart predicate.
#[derive(Debug, Clone, Default)]
pub struct RuntimeDiff {
    pub changed: bool,
    pub prev: RuntimeConfig,
    pub next: RuntimeConfig,
}

impl RuntimeDiff {
    pub fn between(prev: &RuntimeConfig, next: &RuntimeConfig) -> Self {
        Self {
            changed: prev != next,
            prev: prev.clone(),
            next: next.clone(),
        }
    }

    /// True iff the delta contains a field that only a process restart can
    /// safely change. Bootstrap wiring is decided at startup and cannot be
    /// re-plumbed live.
    pub fn requires_restart(&self) -> bool {
        self.changed && self.prev.bootstrap_mode != self.next.bootstrap_mode
    }
}

/// Plugin-list delta, by plugin name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginDiff {
    pub added: Vec<PluginSpec>,
    pub removed: Vec<PluginSpec>,
    pub updated: Vec<PluginSpec>,
}

impl PluginDiff {
    pub fn between(prev: &[PluginSpec], next: &[PluginSpec]) -> Self {
        let mut diff = PluginDiff::default();
        for plugin in next {
            match prev.iter().find(|p| p.name == plugin.name) {
                None => diff.added.push(plugin.clone()),
                Some(old) if old != plugin => diff.updated.push(plugin.clone()),
                Some(_) => {}
            }
        }
        for plugin in prev {
            if !next.iter().any(|p| p.name == plugin.name) {
                diff.removed.push(plugin.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Swap added and removed so applying the result undoes this diff.
    pub fn reversed(&self) -> Self {
        Self {
            added: self.removed.clone(),
            removed: self.added.clone(),
            updated: self.updated.clone(),
        }
    }
}

/// Categorized set of changes from one catalog snapshot to the next.
///
/// Key-set semantics: `removed` holds every fingerprint that disappears from
/// the spec registry, including the old side of a replacement; `replaced`
/// holds the new fingerprint of a server whose name survived with a changed
/// fingerprint; `added` holds fingerprints of genuinely new servers;
/// `updated` holds fingerprints whose spec changed without changing the
/// fingerprint (pool tuning, tags, disabled flips keep the key).
#[derive(Debug, Clone, Default)]
pub struct CatalogDiff {
    pub added: BTreeSet<SpecKey>,
    pub removed: BTreeSet<SpecKey>,
    pub updated: BTreeSet<SpecKey>,
    pub replaced: BTreeSet<SpecKey>,
    pub runtime: RuntimeDiff,
    /// Keys (current side) whose spec's tag set changed.
    pub tags_changed: BTreeSet<SpecKey>,
    pub plugins: PluginDiff,

    // Classification subsets of `updated`.
    /// Updates affecting only the advertised surface (tags, disabled).
    pub tools_only: BTreeSet<SpecKey>,
    /// Updates to pool tuning the scheduler applies without a restart.
    pub runtime_behavior: BTreeSet<SpecKey>,
    /// Keys whose instances must be relaunched (= `replaced`).
    pub restart_required: BTreeSet<SpecKey>,
}

impl CatalogDiff {
    pub fn between(prev: &CatalogSummary, next: &CatalogSummary) -> Self {
        let mut diff = CatalogDiff {
            runtime: RuntimeDiff::between(&prev.runtime, &next.runtime),
            plugins: PluginDiff::between(&prev.plugins, &next.plugins),
            ..Default::default()
        };

        for (name, next_key) in &next.server_spec_keys {
            match prev.server_spec_keys.get(name) {
                None => {
                    diff.added.insert(*next_key);
                }
                Some(prev_key) if prev_key != next_key => {
                    diff.replaced.insert(*next_key);
                }
                Some(prev_key) => {
                    let prev_spec = prev.spec_registry.get(prev_key);
                    let next_spec = next.spec_registry.get(next_key);
                    if let (Some(prev_spec), Some(next_spec)) = (prev_spec, next_spec) {
                        classify_update(&mut diff, *next_key, prev_spec, next_spec);
                    }
                }
            }
        }
        for (name, prev_key) in &prev.server_spec_keys {
            let survives = next.server_spec_keys.get(name) == Some(prev_key);
            if !survives {
                diff.removed.insert(*prev_key);
            }
        }

        diff.restart_required = diff.replaced.clone();
        diff
    }

    /// Compute the diff that applied on top of `self`'s target returns to its
    /// origin. Used by step rollback.
    pub fn reverse(prev: &CatalogSummary, next: &CatalogSummary) -> Self {
        Self::between(next, prev)
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.replaced.is_empty()
            && self.tags_changed.is_empty()
            && !self.runtime.changed
            && self.plugins.is_empty()
    }

    /// True iff only the runtime config differs.
    pub fn is_runtime_only(&self) -> bool {
        self.runtime.changed
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.updated.is_empty()
            && self.replaced.is_empty()
            && self.tags_changed.is_empty()
            && self.plugins.is_empty()
    }

    /// True iff any spec was added, updated or replaced — the trigger for the
    /// post-apply entity refresh.
    pub fn touches_specs(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.replaced.is_empty())
    }
}

fn classify_update(diff: &mut CatalogDiff, key: SpecKey, prev: &ServerSpec, next: &ServerSpec) {
    if prev == next {
        return;
    }
    diff.updated.insert(key);
    if prev.tags != next.tags {
        diff.tags_changed.insert(key);
    }
    if prev.tags != next.tags || prev.disabled != next.disabled {
        diff.tools_only.insert(key);
    }
    if prev.min_ready != next.min_ready
        || prev.idle_seconds != next.idle_seconds
        || prev.max_concurrent != next.max_concurrent
        || prev.activation_mode != next.activation_mode
    {
        diff.runtime_behavior.insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ActivationMode, Catalog, CatalogState, CommandSpec};
    use std::collections::BTreeMap;

    fn spec(name: &str, arg: &str) -> ServerSpec {
        ServerSpec {
            name: name.into(),
            command: Some(CommandSpec {
                command: "run".into(),
                args: vec![arg.into()],
            }),
            tags: vec![name.into()],
            ..Default::default()
        }
    }

    fn summary(specs: Vec<ServerSpec>) -> CatalogSummary {
        let servers: BTreeMap<String, ServerSpec> =
            specs.into_iter().map(|s| (s.name.clone(), s)).collect();
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
    fn identical_catalogs_diff_empty() {
        let a = summary(vec![spec("git", "a"), spec("docker", "b")]);
        let b = summary(vec![spec("git", "a"), spec("docker", "b")]);
        let diff = CatalogDiff::between(&a, &b);
        assert!(diff.is_empty());
        assert!(!diff.is_runtime_only());
    }

    #[test]
    fn add_and_remove() {
        let a = summary(vec![spec("git", "a")]);
        let b = summary(vec![spec("git", "a"), spec("docker", "b")]);
        let diff = CatalogDiff::between(&a, &b);
        assert_eq!(diff.added.len(), 1);
        assert!(diff.removed.is_empty());

        let back = CatalogDiff::between(&b, &a);
        assert_eq!(back.removed.len(), 1);
        assert!(back.added.is_empty());
    }

    #[test]
    fn replacement_lists_new_key_and_removes_old() {
        let a = summary(vec![spec("git", "v1")]);
        let b = summary(vec![spec("git", "v2")]);
        let old_key = a.server_spec_keys["git"];
        let new_key = b.server_spec_keys["git"];
        let diff = CatalogDiff::between(&a, &b);
        assert!(diff.replaced.contains(&new_key));
        assert!(diff.removed.contains(&old_key));
        assert!(diff.added.is_empty());
        assert_eq!(diff.restart_required, diff.replaced);
    }

    #[test]
    fn pool_tuning_classifies_as_runtime_behavior() {
        let a = summary(vec![spec("git", "a")]);
        let mut tuned = spec("git", "a");
        tuned.min_ready = 2;
        tuned.activation_mode = ActivationMode::AlwaysOn;
        let b = summary(vec![tuned]);
        let diff = CatalogDiff::between(&a, &b);
        let key = b.server_spec_keys["git"];
        assert!(diff.updated.contains(&key));
        assert!(diff.runtime_behavior.contains(&key));
        assert!(diff.replaced.is_empty());
    }

    #[test]
    fn tag_changes_classify_as_tools_only() {
        let a = summary(vec![spec("git", "a")]);
        let mut retagged = spec("git", "a");
        retagged.tags = vec!["scm".into()];
        let b = summary(vec![retagged]);
        let diff = CatalogDiff::between(&a, &b);
        let key = b.server_spec_keys["git"];
        assert!(diff.tags_changed.contains(&key));
        assert!(diff.tools_only.contains(&key));
        assert!(diff.runtime_behavior.is_empty());
    }

    #[test]
    fn runtime_only_diff() {
        let a = summary(vec![spec("git", "a")]);
        let mut b = summary(vec![spec("git", "a")]);
        b.runtime.route_timeout_seconds = 5;
        let diff = CatalogDiff::between(&a, &b);
        assert!(diff.is_runtime_only());
        assert!(!diff.runtime.requires_restart());
    }

    #[test]
    fn bootstrap_flip_requires_restart() {
        let a = summary(vec![spec("git", "a")]);
        let mut b = summary(vec![spec("git", "a")]);
        b.runtime.bootstrap_mode = true;
        let diff = CatalogDiff::between(&a, &b);
        assert!(diff.runtime.requires_restart());
    }

    #[test]
    fn plugin_diff_reversed_round_trips() {
        let p = |name: &str| PluginSpec {
            name: name.into(),
            ..Default::default()
        };
        let diff = PluginDiff::between(&[p("a"), p("b")], &[p("b"), p("c")]);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed.len(), 1);
        let rev = diff.reversed();
        assert_eq!(rev.added[0].name, "a");
        assert_eq!(rev.removed[0].name, "c");
    }
}
