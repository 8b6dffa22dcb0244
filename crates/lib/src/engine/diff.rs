//! Change-set computation between live and desired resources.

use std::collections::BTreeMap;

use super::{ChangeAction, ResourceChange};

/// Compute the ordered change set turning `current` into `desired`.
///
/// Deletions come first, then creations and updates, each in address order.
pub fn compute_changes(current: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> Vec<ResourceChange> {
  let mut changes = Vec::new();

  for (address, before) in current {
    if !desired.contains_key(address) {
      changes.push(ResourceChange {
        address: address.clone(),
        action: ChangeAction::Delete,
        before: Some(before.clone()),
        after: None,
      });
    }
  }

  for (address, after) in desired {
    match current.get(address) {
      None => changes.push(ResourceChange {
        address: address.clone(),
        action: ChangeAction::Create,
        before: None,
        after: Some(after.clone()),
      }),
      Some(before) if before != after => changes.push(ResourceChange {
        address: address.clone(),
        action: ChangeAction::Update,
        before: Some(before.clone()),
        after: Some(after.clone()),
      }),
      Some(_) => {}
    }
  }

  changes
}
