//! Command registry: name resolution and arity validation.
//!
//! Lookup is case-insensitive on the top-level name and descends at most one
//! level of subcommand. Registration happens once at startup from a spec
//! table; runtime renames are an external concern surfaced through a
//! secondary original-name index that the propagation path can use to bypass
//! them.

use crate::command::{CommandDescriptor, CommandSpec, LatencyHistogram};
use crate::core::config::LatencyConfig;
use crate::core::error::RejectReason;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of all known command descriptors.
pub struct CommandRegistry {
    /// Lowercase current name → descriptor.
    table: HashMap<String, Arc<CommandDescriptor>>,
    /// Lowercase original (pre-rename) name → descriptor.
    original: HashMap<String, Arc<CommandDescriptor>>,
}

impl CommandRegistry {
    /// Build the registry from the builtin command table.
    pub fn builtin(latency: &LatencyConfig) -> Self {
        Self::with_commands(crate::command::table::builtin_specs(), latency)
    }

    /// Build a registry from an explicit spec table. Embedders append their
    /// own specs to [`table::builtin_specs`] before calling this.
    pub fn with_commands(specs: Vec<CommandSpec>, latency: &LatencyConfig) -> Self {
        let mut table = HashMap::with_capacity(specs.len());
        let mut original = HashMap::with_capacity(specs.len());
        for spec in specs {
            let descriptor = build_descriptor(spec, latency, None);
            table.insert(descriptor.name.clone(), descriptor.clone());
            original.insert(descriptor.name.clone(), descriptor);
        }
        Self { table, original }
    }

    /// Apply a rename map (`original name → new name`). The original-name
    /// index keeps resolving the old names.
    pub fn apply_renames(&mut self, renames: &[(String, String)]) {
        for (old, new) in renames {
            let old = old.to_ascii_lowercase();
            let new = new.to_ascii_lowercase();
            if let Some(descriptor) = self.table.remove(&old) {
                self.table.insert(new, descriptor);
            }
        }
    }

    /// Case-insensitive top-level lookup under the current name.
    pub fn lookup(&self, name: &str) -> Option<Arc<CommandDescriptor>> {
        self.table.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Lookup bypassing any runtime rename.
    pub fn lookup_original(&self, name: &str) -> Option<Arc<CommandDescriptor>> {
        self.original.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Number of registered top-level commands.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Iterate all top-level descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CommandDescriptor>> {
        self.table.values()
    }

    /// Resolve an argument vector to a descriptor.
    ///
    /// Descends at most one level of subcommand. In strict mode the tokens
    /// must name exactly a top-level command (one token) or a subcommand
    /// (two tokens); in non-strict mode trailing tokens after a non-container
    /// command become ordinary arguments.
    pub fn resolve(
        &self,
        argv: &[Bytes],
        strict: bool,
    ) -> Result<Arc<CommandDescriptor>, RejectReason> {
        let name = match argv.first() {
            Some(token) => String::from_utf8_lossy(token).to_ascii_lowercase(),
            None => {
                return Err(RejectReason::UnknownCommand {
                    name: String::new(),
                })
            }
        };
        let top = self
            .lookup(&name)
            .ok_or_else(|| RejectReason::UnknownCommand { name: name.clone() })?;

        if top.is_container() && argv.len() >= 2 {
            let sub_token = String::from_utf8_lossy(&argv[1]).to_ascii_lowercase();
            let sub = top.subcommand(&sub_token).cloned().ok_or_else(|| {
                RejectReason::UnknownSubcommand {
                    name: name.clone(),
                    sub: sub_token.clone(),
                }
            })?;
            if strict && argv.len() != 2 {
                return Err(RejectReason::UnknownSubcommand {
                    name,
                    sub: sub_token,
                });
            }
            return Ok(sub);
        }

        if strict && argv.len() != 1 {
            return Err(RejectReason::UnknownCommand { name });
        }
        Ok(top)
    }
}

fn build_descriptor(
    spec: CommandSpec,
    latency: &LatencyConfig,
    parent: Option<&str>,
) -> Arc<CommandDescriptor> {
    let name = match parent {
        Some(container) => format!("{}|{}", container, spec.name.to_ascii_lowercase()),
        None => spec.name.to_ascii_lowercase(),
    };
    // Subcommand tables never nest below one level.
    assert!(
        parent.is_none() || spec.subcommands.is_empty(),
        "subcommand '{}' may not declare its own subcommands",
        name
    );
    let subcommands = if spec.subcommands.is_empty() {
        None
    } else {
        let container = name.clone();
        Some(
            spec.subcommands
                .into_iter()
                .map(|sub| build_descriptor(sub, latency, Some(&container)))
                .collect(),
        )
    };
    let histogram = latency
        .histogram_enabled
        .then(|| LatencyHistogram::new(latency.min_us, latency.max_us));
    Arc::new(CommandDescriptor {
        name,
        arity: spec.arity,
        flags: spec.flags,
        acl: spec.acl,
        keys: spec.keys,
        subcommands,
        body: spec.body,
        stats: Default::default(),
        histogram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandBody, CommandOutcome, Reply};
    use crate::client::Client;
    use crate::server::Server;

    struct Noop;

    impl CommandBody for Noop {
        fn invoke(&self, _srv: &mut Server, _client: &mut Client) -> CommandOutcome {
            CommandOutcome::Reply(Reply::Ok)
        }
    }

    fn argv(tokens: &[&str]) -> Vec<Bytes> {
        tokens
            .iter()
            .map(|t| Bytes::copy_from_slice(t.as_bytes()))
            .collect()
    }

    fn test_registry() -> CommandRegistry {
        let specs = vec![
            CommandSpec::new("probe", -1, Arc::new(Noop)),
            CommandSpec::container("box", -2)
                .sub(CommandSpec::new("open", 2, Arc::new(Noop)))
                .sub(CommandSpec::new("close", -2, Arc::new(Noop))),
        ];
        CommandRegistry::with_commands(specs, &LatencyConfig::default())
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = test_registry();
        assert!(registry.lookup("PROBE").is_some());
        assert!(registry.lookup("Probe").is_some());
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn resolve_descends_one_level() {
        let registry = test_registry();
        let desc = registry.resolve(&argv(&["BOX", "OPEN"]), false).unwrap();
        assert_eq!(desc.name, "box|open");
    }

    #[test]
    fn resolve_never_recurses_past_subcommands() {
        let registry = test_registry();
        // The third token is an ordinary argument of the subcommand.
        let desc = registry
            .resolve(&argv(&["box", "close", "lid"]), false)
            .unwrap();
        assert_eq!(desc.name, "box|close");
    }

    #[test]
    fn resolve_unknown_subcommand() {
        let registry = test_registry();
        let err = registry.resolve(&argv(&["box", "smash"]), false).unwrap_err();
        assert!(matches!(err, RejectReason::UnknownSubcommand { .. }));
    }

    #[test]
    fn strict_mode_requires_exact_token_counts() {
        let registry = test_registry();
        assert!(registry.resolve(&argv(&["probe"]), true).is_ok());
        assert!(registry.resolve(&argv(&["probe", "x"]), true).is_err());
        assert!(registry.resolve(&argv(&["box", "open"]), true).is_ok());
        assert!(registry.resolve(&argv(&["box", "open", "x"]), true).is_err());
    }

    #[test]
    fn renames_keep_the_original_index() {
        let mut registry = test_registry();
        registry.apply_renames(&[("probe".into(), "hidden-probe".into())]);
        assert!(registry.lookup("probe").is_none());
        assert!(registry.lookup("hidden-probe").is_some());
        assert!(registry.lookup_original("probe").is_some());
    }

    #[test]
    fn arity_rule() {
        let registry = test_registry();
        let exact = registry.resolve(&argv(&["box", "open"]), false).unwrap();
        assert!(exact.arity_ok(2));
        assert!(!exact.arity_ok(3));
        assert!(!exact.arity_ok(1));

        let at_least = registry.lookup("probe").unwrap();
        assert!(at_least.arity_ok(1));
        assert!(at_least.arity_ok(5));
        assert!(!at_least.arity_ok(0));
    }
}
