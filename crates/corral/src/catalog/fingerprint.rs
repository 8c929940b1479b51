//! Spec fingerprinting.
//!
//! The fingerprint covers exactly the fields that change what a launched
//! instance *is*: transport, environment, working directory, protocol
//! version, and the name (so two differently-named but otherwise identical
//! specs do not share instances). Pool tuning (`min_ready`, `idle_seconds`,
//! `max_concurrent`, `activation_mode`), `tags` and `disabled` are excluded;
//! changing them updates the spec in place under the same key.

use super::{ServerSpec, SpecKey};
use crate::hash::ContentHash;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Serialize)]
struct FingerprintFields<'a> {
    name: &'a str,
    command: Option<&'a super::CommandSpec>,
    http: Option<&'a super::HttpSpec>,
    env: &'a BTreeMap<String, String>,
    cwd: Option<&'a PathBuf>,
    protocol_version: Option<&'a String>,
}

pub fn spec_fingerprint(spec: &ServerSpec) -> SpecKey {
    ContentHash::of_canonical(&FingerprintFields {
        name: &spec.name,
        command: spec.command.as_ref(),
        http: spec.http.as_ref(),
        env: &spec.env,
        cwd: spec.cwd.as_ref(),
        protocol_version: spec.protocol_version.as_ref(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ActivationMode, CommandSpec};

    fn base() -> ServerSpec {
        ServerSpec {
            name: "git".into(),
            command: Some(CommandSpec {
                command: "uvx".into(),
                args: vec!["mcp-server-git".into()],
            }),
            tags: vec!["git".into()],
            ..Default::default()
        }
    }

    #[test]
    fn equal_specs_share_a_key() {
        assert_eq!(spec_fingerprint(&base()), spec_fingerprint(&base()));
    }

    #[test]
    fn pool_tuning_does_not_change_the_key() {
        let a = base();
        let mut b = base();
        b.min_ready = 3;
        b.idle_seconds = 10;
        b.max_concurrent = 16;
        b.activation_mode = ActivationMode::AlwaysOn;
        b.tags = vec!["scm".into()];
        b.disabled = true;
        assert_eq!(spec_fingerprint(&a), spec_fingerprint(&b));
    }

    #[test]
    fn transport_changes_mint_a_new_key() {
        let a = base();
        let mut b = base();
        b.command.as_mut().unwrap().args.push("--verbose".into());
        assert_ne!(spec_fingerprint(&a), spec_fingerprint(&b));

        let mut c = base();
        c.env.insert("GIT_DIR".into(), "/repo".into());
        assert_ne!(spec_fingerprint(&a), spec_fingerprint(&c));
    }

    #[test]
    fn name_is_part_of_the_key() {
        let a = base();
        let mut b = base();
        b.name = "git2".into();
        assert_ne!(spec_fingerprint(&a), spec_fingerprint(&b));
    }
}
