//! Lifts keys that sign every artifact of a module (or of a whole group) to
//! a single trusted-key declaration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use modvault_schema::ModuleId;

use super::entry::{PgpEntry, VerificationEntry};
use super::model::{TrustedArtifact, TrustedKey};

/// Keys common to all members; empty for an empty slice.
fn common_keys(entries: &[&PgpEntry]) -> BTreeSet<String> {
    let mut iter = entries.iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(first.verified_keys(), |acc, e| {
        acc.intersection(&e.verified_keys()).cloned().collect()
    })
}

/// Group-level when a key signs every artifact of at least two modules of
/// a group, module-level when it signs at least two artifacts of a module.
/// Lifted keys are marked on each entry so they are not repeated per
/// artifact.
pub fn group_keys(entries: &[Arc<VerificationEntry>]) -> Vec<TrustedKey> {
    let mut by_group: BTreeMap<String, BTreeMap<ModuleId, Vec<&PgpEntry>>> = BTreeMap::new();
    for entry in entries {
        let VerificationEntry::Pgp(pgp) = entry.as_ref() else {
            continue;
        };
        if !pgp.has_signature_file() || pgp.verified_keys().is_empty() {
            continue;
        }
        let module = pgp.artifact.id.component.module_id();
        by_group
            .entry(module.group.clone())
            .or_default()
            .entry(module)
            .or_default()
            .push(pgp);
    }

    let mut lifted = Vec::new();
    for (group, modules) in by_group {
        let all: Vec<&PgpEntry> = modules.values().flatten().copied().collect();
        let group_level = if modules.len() >= 2 {
            common_keys(&all)
        } else {
            BTreeSet::new()
        };
        for key in &group_level {
            for entry in &all {
                entry.group_key(key);
            }
            lifted.push(TrustedKey {
                key_id: key.clone(),
                trusting: TrustedArtifact::group(group.clone()),
            });
        }

        for (module, members) in &modules {
            if members.len() < 2 {
                continue;
            }
            for key in common_keys(members).difference(&group_level) {
                for entry in members {
                    entry.group_key(key);
                }
                lifted.push(TrustedKey {
                    key_id: key.clone(),
                    trusting: TrustedArtifact::module(module.group.clone(), module.module.clone()),
                });
            }
        }
    }
    lifted
}
