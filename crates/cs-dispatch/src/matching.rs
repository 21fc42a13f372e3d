//! Conduit matching: for a given flavor and
//! optional database, pick the ordered set of conduits to run, honoring
//! `default` (only runs if nothing else matched) and `final` (stop
//! matching once it runs).

use crate::config::{ConduitBlock, Flavor};

/// Select the conduits to run for one flavor/database combination, in
/// configuration order. `dbinfo` is `None` for database-independent
/// flavors (init/fetch/dump with no current database).
pub fn select_conduits<'a>(conduits: &'a [ConduitBlock], flavor: Flavor, creator_type: Option<(u32, u32)>) -> Vec<&'a ConduitBlock> {
    let mut selected = Vec::new();
    let mut best_default: Option<&ConduitBlock> = None;

    for conduit in conduits {
        if !conduit.flavors.contains(flavor) {
            continue;
        }
        let rule_matches = match creator_type {
            Some((creator, db_type)) => conduit.matches_rules(creator, db_type),
            None => conduit.rules.is_empty(),
        };
        if !rule_matches {
            continue;
        }
        if conduit.default {
            best_default = best_default.or(Some(conduit));
            continue;
        }
        selected.push(conduit);
        if conduit.final_conduit {
            return selected;
        }
    }

    if selected.is_empty() {
        if let Some(default) = best_default {
            selected.push(default);
        }
    }
    selected
}
