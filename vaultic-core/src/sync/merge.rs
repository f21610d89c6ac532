//! Path-level three-way merge of store-state documents.
//!
//! Rules:
//! 1. Start from the server's document.
//! 2. Replay local change ops the server has not seen, oldest first.
//! 3. A local op is dropped when a server change touched an overlapping path
//!    at the same time or later. Ties go to the server.
//!
//! Two paths overlap when one is a segment-wise prefix of the other, so an
//! edit to `items.3.title` conflicts with a delete of `items.3` but not with
//! an edit to `items.4`.

use crate::entity::{ChangeOp, ChangeOpKind};
use crate::{Result, VaulticError};
use serde_json::{Map, Value};

/// Change ops recorded together at `change_time` (milliseconds).
#[derive(Debug, Clone, PartialEq)]
pub struct TimedOps {
    pub change_time: i64,
    pub ops: Vec<ChangeOp>,
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub state: Value,
    /// Local ops replayed on top of the server document
    pub applied: usize,
    /// Local ops dropped because a server change won
    pub skipped: usize,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Whether two dotted paths address overlapping parts of a document.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let (a, b) = (segments(a), segments(b));
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn invalid_path(path: &str, reason: &str) -> VaulticError {
    VaulticError::InvalidInput(format!("change path `{}`: {}", path, reason))
}

/// Walk to the container holding the last segment, creating objects on the way.
fn parent_mut<'a>(doc: &'a mut Value, parts: &[&str], path: &str, create: bool) -> Result<Option<&'a mut Value>> {
    let mut current = doc;
    for part in parts {
        current = match current {
            Value::Object(map) => {
                if !map.contains_key(*part) {
                    if !create {
                        return Ok(None);
                    }
                    map.insert(part.to_string(), Value::Object(Map::new()));
                }
                match map.get_mut(*part) {
                    Some(next) => next,
                    None => return Ok(None),
                }
            }
            Value::Array(items) => {
                let index: usize = part
                    .parse()
                    .map_err(|_| invalid_path(path, "array index expected"))?;
                match items.get_mut(index) {
                    Some(next) => next,
                    None if create => return Err(invalid_path(path, "array index out of range")),
                    None => return Ok(None),
                }
            }
            _ if create => return Err(invalid_path(path, "traverses a scalar")),
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}

/// Apply one op to a document in place.
pub fn apply_op(doc: &mut Value, op: &ChangeOp) -> Result<()> {
    let parts = segments(&op.path);
    let Some((last, parents)) = parts.split_last() else {
        return Err(invalid_path(&op.path, "empty"));
    };

    match op.op {
        ChangeOpKind::Add | ChangeOpKind::Update => {
            let value = op
                .value
                .clone()
                .ok_or_else(|| invalid_path(&op.path, "missing value"))?;
            let Some(parent) = parent_mut(doc, parents, &op.path, true)? else {
                return Err(invalid_path(&op.path, "unreachable"));
            };
            match parent {
                Value::Object(map) => {
                    map.insert(last.to_string(), value);
                }
                Value::Array(items) => {
                    let index: usize = last
                        .parse()
                        .map_err(|_| invalid_path(&op.path, "array index expected"))?;
                    if index < items.len() {
                        items[index] = value;
                    } else if index == items.len() {
                        items.push(value);
                    } else {
                        return Err(invalid_path(&op.path, "array index out of range"));
                    }
                }
                _ => return Err(invalid_path(&op.path, "parent is a scalar")),
            }
        }
        ChangeOpKind::Delete => {
            // deleting something already gone is a no-op
            match parent_mut(doc, parents, &op.path, false)? {
                Some(Value::Object(map)) => {
                    map.remove(*last);
                }
                Some(Value::Array(items)) => {
                    if let Ok(index) = last.parse::<usize>() {
                        if index < items.len() {
                            items.remove(index);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Apply ops in order.
pub fn apply_ops(doc: &mut Value, ops: &[ChangeOp]) -> Result<()> {
    for op in ops {
        apply_op(doc, op)?;
    }
    Ok(())
}

/// Merge local unacknowledged changes onto the server's document.
pub fn three_way_merge(
    server_state: Value,
    server_changes: &[TimedOps],
    local_changes: &[TimedOps],
) -> Result<MergeOutcome> {
    let mut state = server_state;
    let mut applied = 0;
    let mut skipped = 0;

    let mut local: Vec<&TimedOps> = local_changes.iter().collect();
    local.sort_by_key(|c| c.change_time);

    for change in local {
        for op in &change.ops {
            let server_wins = server_changes.iter().any(|server| {
                server.change_time >= change.change_time
                    && server.ops.iter().any(|s| paths_overlap(&s.path, &op.path))
            });
            if server_wins {
                skipped += 1;
                continue;
            }
            apply_op(&mut state, op)?;
            applied += 1;
        }
    }

    Ok(MergeOutcome {
        state,
        applied,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(change_time: i64, ops: Vec<ChangeOp>) -> TimedOps {
        TimedOps { change_time, ops }
    }

    #[test]
    fn overlap_is_prefix_based() {
        assert!(paths_overlap("items.3", "items.3.title"));
        assert!(paths_overlap("items.3.title", "items"));
        assert!(paths_overlap("a", "a"));
        assert!(!paths_overlap("items.3", "items.4"));
        assert!(!paths_overlap("items.31", "items.3"));
    }

    #[test]
    fn ops_edit_nested_documents() {
        let mut doc = json!({"passwords": {}});
        apply_ops(
            &mut doc,
            &[
                ChangeOp::add("passwords.p1", json!({"login": "me", "tags": []})),
                ChangeOp::add("passwords.p1.tags.0", json!("bank")),
                ChangeOp::update("passwords.p1.login", json!("you")),
                ChangeOp::add("settings.theme", json!("dark")),
            ],
        )
        .unwrap();
        assert_eq!(
            doc,
            json!({
                "passwords": {"p1": {"login": "you", "tags": ["bank"]}},
                "settings": {"theme": "dark"}
            })
        );

        apply_op(&mut doc, &ChangeOp::delete("passwords.p1.tags.0")).unwrap();
        apply_op(&mut doc, &ChangeOp::delete("passwords.missing.deep")).unwrap();
        assert_eq!(doc["passwords"]["p1"]["tags"], json!([]));

        assert!(apply_op(&mut doc, &ChangeOp::delete("")).is_err());
        assert!(apply_op(&mut doc, &ChangeOp::add("settings.theme.x", json!(1))).is_err());
    }

    #[test]
    fn disjoint_edits_both_survive() {
        // the server document already carries its own change to `a`
        let server = json!({"a": 2, "b": 1});
        let server_changes = [at(200, vec![ChangeOp::update("a", json!(2))])];
        let local = [at(100, vec![ChangeOp::update("b", json!(3))])];

        let merged = three_way_merge(server, &server_changes, &local).unwrap();
        assert_eq!(merged.state, json!({"a": 2, "b": 3}));
        assert_eq!((merged.applied, merged.skipped), (1, 0));
    }

    #[test]
    fn later_timestamp_wins_per_path() {
        let server = json!({"a": "server"});
        let server_changes = [at(200, vec![ChangeOp::update("a", json!("server"))])];

        let older = [at(100, vec![ChangeOp::update("a", json!("local"))])];
        let merged = three_way_merge(server.clone(), &server_changes, &older).unwrap();
        assert_eq!(merged.state["a"], "server");
        assert_eq!(merged.skipped, 1);

        let newer = [at(300, vec![ChangeOp::update("a", json!("local"))])];
        let merged = three_way_merge(server.clone(), &server_changes, &newer).unwrap();
        assert_eq!(merged.state["a"], "local");

        let tie = [at(200, vec![ChangeOp::update("a", json!("local"))])];
        let merged = three_way_merge(server, &server_changes, &tie).unwrap();
        assert_eq!(merged.state["a"], "server");
    }

    #[test]
    fn server_delete_beats_older_nested_edit() {
        let server = json!({"items": {}});
        let server_changes = [at(500, vec![ChangeOp::delete("items.x")])];
        let local = [
            at(100, vec![ChangeOp::update("items.x.title", json!("renamed"))]),
            at(150, vec![ChangeOp::add("items.y", json!({"title": "new"}))]),
        ];
        let merged = three_way_merge(server, &server_changes, &local).unwrap();
        assert_eq!(merged.state, json!({"items": {"y": {"title": "new"}}}));
    }
}
