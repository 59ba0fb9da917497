//! Diff engine: requested vs current attribute values
//!
//! Every comparison follows the same contract:
//!
//! ```text
//! compare(None,      current) -> { data: current,   action: NoChange }
//! compare(Some(req), current) -> { data: req,       action: NoChange | Update }
//! ```
//!
//! Equality is value equality (deep for structured types). Three attribute
//! shapes have extra rules:
//!
//! - **Key info**: `name` is immutable once set; a change is a `Validation` error
//! - **External maps**: three-way `Keep` / `Clear` / `Set` reconciliation
//! - **Block reference trees**: per-reference Create/Update/Delete/NoChange/Move
//!   plus a `transposed` flag for reordering

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::droplet::Droplet;
use crate::error::{Error, Result};
use crate::types::{
    AuditAction, BlockData, BlockRef, DocumentType, ExternalField, ExternalMap, ExternalRequest,
    KeyInfo, StructureDiff,
};

/// Outcome of comparing one attribute
#[derive(Debug, Clone, PartialEq)]
pub struct Compared<T> {
    /// Value to persist in the new version
    pub data: T,
    /// What happened to the attribute
    pub action: AuditAction,
}

impl<T> Compared<T> {
    fn unchanged(data: T) -> Self {
        Self {
            data,
            action: AuditAction::NoChange,
        }
    }
}

// ============================================================================
// Scalar attributes
// ============================================================================

/// Generic comparison by value equality
pub fn compare<T: PartialEq + Clone>(requested: Option<&T>, current: &T) -> Compared<T> {
    match requested {
        None => Compared::unchanged(current.clone()),
        Some(req) if req == current => Compared::unchanged(current.clone()),
        Some(req) => Compared {
            data: req.clone(),
            action: AuditAction::Update,
        },
    }
}

/// Comparison for attributes that may be absent in the current version
///
/// A request can set such an attribute but not remove it.
pub fn compare_optional<T: PartialEq + Clone>(
    requested: Option<&T>,
    current: Option<&T>,
) -> Compared<Option<T>> {
    match (requested, current) {
        (None, _) => Compared::unchanged(current.cloned()),
        (Some(req), Some(cur)) if req == cur => Compared::unchanged(Some(cur.clone())),
        (Some(req), _) => Compared {
            data: Some(req.clone()),
            action: AuditAction::Update,
        },
    }
}

/// Document title
pub fn compare_title(requested: Option<&String>, current: &String) -> Compared<String> {
    compare(requested, current)
}

/// Document type
pub fn compare_doc_type(
    requested: Option<&DocumentType>,
    current: &DocumentType,
) -> Compared<DocumentType> {
    compare(requested, current)
}

/// Tag set
pub fn compare_tags(
    requested: Option<&BTreeSet<String>>,
    current: &BTreeSet<String>,
) -> Compared<BTreeSet<String>> {
    compare(requested, current)
}

/// Block payload
pub fn compare_block_data(
    requested: Option<&BlockData>,
    current: &BlockData,
) -> Compared<BlockData> {
    compare(requested, current)
}

/// Block key info
///
/// Setting key info on a block that had none is an `Update`. Once a name is
/// set it can never change; only the label may.
pub fn compare_key_info(
    requested: Option<&KeyInfo>,
    current: Option<&KeyInfo>,
) -> Result<Compared<Option<KeyInfo>>> {
    if let (Some(req), Some(cur)) = (requested, current) {
        if req.name != cur.name {
            return Err(Error::validation(format!(
                "key info name is immutable: cannot rename '{}' to '{}'",
                cur.name, req.name
            )));
        }
    }
    Ok(compare_optional(requested, current))
}

// ============================================================================
// External maps
// ============================================================================

/// Outcome of a three-way external map comparison
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalComparison {
    /// Map to persist, `None` when every field was removed
    pub data: Option<ExternalMap>,
    /// Action per field, removed fields included
    pub actions: BTreeMap<ExternalField, AuditAction>,
}

impl ExternalComparison {
    /// Whether any field was created, changed or removed
    pub fn has_changes(&self) -> bool {
        self.actions.values().any(AuditAction::is_change)
    }
}

/// Three-way external map comparison
///
/// - `Keep`: keep all, every current field `NoChange`
/// - `Clear`: remove all, every current field `Delete`
/// - `Set(map)`: new-only keys `Create`, shared keys `NoChange`/`Update`,
///   keys missing from `map` `Delete`
pub fn compare_external(
    requested: &ExternalRequest,
    current: Option<&ExternalMap>,
) -> ExternalComparison {
    let empty = ExternalMap::new();
    let cur = current.unwrap_or(&empty);

    match requested {
        ExternalRequest::Keep => ExternalComparison {
            data: current.cloned(),
            actions: cur.keys().map(|f| (*f, AuditAction::NoChange)).collect(),
        },
        ExternalRequest::Clear => ExternalComparison {
            data: None,
            actions: cur.keys().map(|f| (*f, AuditAction::Delete)).collect(),
        },
        ExternalRequest::Set(req) => {
            let mut actions = BTreeMap::new();
            let mut data = ExternalMap::new();
            for (field, entry) in req {
                let action = match cur.get(field) {
                    None => AuditAction::Create,
                    Some(existing) if existing == entry => AuditAction::NoChange,
                    Some(_) => AuditAction::Update,
                };
                actions.insert(*field, action);
                data.insert(*field, entry.clone());
            }
            for field in cur.keys() {
                if !req.contains_key(field) {
                    actions.insert(*field, AuditAction::Delete);
                }
            }
            ExternalComparison {
                data: if data.is_empty() && current.is_none() {
                    None
                } else {
                    Some(data)
                },
                actions,
            }
        }
    }
}

// ============================================================================
// Block reference trees
// ============================================================================

/// Outcome of a structural comparison
#[derive(Debug, Clone, PartialEq)]
pub struct StructureComparison {
    /// Requested tree with final per-reference actions
    pub refs: Vec<BlockRef>,
    /// Current references absent from the request, marked `Delete`
    pub deleted: Vec<BlockRef>,
    /// Audit record
    pub diff: StructureDiff,
}

type Position = (Option<Droplet>, usize);

/// Compare a requested reference tree against the current one
///
/// `requested` carries the content-level action of each block
/// (`Create`/`Update`/`NoChange`). References are matched by id across the
/// whole tree. A surviving reference whose parent or index among surviving
/// siblings changed is a move: `NoChange` becomes `Move` and the comparison
/// is marked transposed.
///
/// Returns `Validation` if the requested tree names a block twice.
pub fn compare_structure(
    requested: &[BlockRef],
    current: &[BlockRef],
) -> Result<StructureComparison> {
    let mut requested_ids = HashSet::new();
    let mut duplicate = None;
    crate::types::walk_refs(requested, &mut |r| {
        if !requested_ids.insert(r.id.clone()) && duplicate.is_none() {
            duplicate = Some(r.id.clone());
        }
    });
    if let Some(id) = duplicate {
        return Err(Error::validation(format!(
            "block {} appears more than once",
            id
        )));
    }

    let mut current_ids = HashSet::new();
    crate::types::walk_refs(current, &mut |r| {
        current_ids.insert(r.id.clone());
    });

    let mut old_positions = HashMap::new();
    positions(current, None, &requested_ids, &mut old_positions);
    let mut new_positions = HashMap::new();
    positions(requested, None, &current_ids, &mut new_positions);

    let mut diff = StructureDiff::default();
    let refs = finalize(requested, &old_positions, &new_positions, &mut diff);

    let mut deleted = Vec::new();
    crate::types::walk_refs(current, &mut |r| {
        if !requested_ids.contains(&r.id) {
            deleted.push(BlockRef::new(
                r.id.clone(),
                r.version.clone(),
                AuditAction::Delete,
            ));
        }
    });
    for r in &deleted {
        diff.blocks.insert(r.id.clone(), AuditAction::Delete);
    }

    Ok(StructureComparison {
        refs,
        deleted,
        diff,
    })
}

// Position of every surviving reference: parent id and index among the
// surviving siblings.
fn positions(
    refs: &[BlockRef],
    parent: Option<&Droplet>,
    survivors: &HashSet<Droplet>,
    out: &mut HashMap<Droplet, Position>,
) {
    let mut index = 0;
    for r in refs {
        if survivors.contains(&r.id) {
            out.insert(r.id.clone(), (parent.cloned(), index));
            index += 1;
        }
        positions(r.children(), Some(&r.id), survivors, out);
    }
}

fn finalize(
    refs: &[BlockRef],
    old_positions: &HashMap<Droplet, Position>,
    new_positions: &HashMap<Droplet, Position>,
    diff: &mut StructureDiff,
) -> Vec<BlockRef> {
    refs.iter()
        .map(|r| {
            let moved = match (old_positions.get(&r.id), new_positions.get(&r.id)) {
                (Some(old), Some(new)) => old != new,
                _ => false,
            };
            if moved {
                diff.transposed = true;
            }
            let action = if moved && r.action == AuditAction::NoChange {
                AuditAction::Move
            } else {
                r.action
            };
            diff.blocks.insert(r.id.clone(), action);
            BlockRef {
                id: r.id.clone(),
                version: r.version.clone(),
                action,
                children: r
                    .children
                    .as_ref()
                    .map(|c| finalize(c, old_positions, new_positions, diff)),
            }
        })
        .collect()
}
