//! Reference warm-up
//!
//! Paths such as `"Friend/Friend"` are resolved level by level: the IDs
//! referenced by the whole result set are collected per target entity,
//! resolved with one batch lookup each and attached to the reference
//! fields. `"*"` stands for every direct single reference.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::trace;

use crate::entity::{Entity, SharedEntity};
use crate::error::{Error, Result};
use crate::schema::EntitySchema;
use crate::sql::Row;

use super::{fetch_rows, ReadContext};

const ALL_REFERENCES: &str = "*";

/// Parsed reference paths sharing common prefixes
#[derive(Debug, Default)]
struct PathNode {
    children: BTreeMap<String, PathNode>,
}

impl PathNode {
    fn parse(entity: &str, paths: &[&str]) -> Result<Self> {
        let mut root = PathNode::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path.split('/').map(str::trim) {
                if segment.is_empty() {
                    return Err(Error::InvalidReference {
                        entity: entity.to_string(),
                        path: path.to_string(),
                    });
                }
                node = node.children.entry(segment.to_string()).or_default();
            }
        }
        Ok(root)
    }

    /// Reference columns this node descends into, `"*"` expanded
    fn edges(&self, schema: &EntitySchema) -> Result<Vec<(String, &PathNode)>> {
        let mut edges = Vec::new();
        for (segment, child) in &self.children {
            if segment == ALL_REFERENCES {
                edges.extend(schema.references().map(|(name, _, _)| (name.to_string(), child)));
                continue;
            }
            let is_reference = schema
                .position(segment)
                .and_then(|p| schema.columns()[p].kind.reference_target())
                .is_some();
            if !is_reference {
                return Err(Error::InvalidReference {
                    entity: schema.entity().to_string(),
                    path: segment.clone(),
                });
            }
            edges.push((segment.clone(), child));
        }
        Ok(edges)
    }
}

/// Entity whose references are warmed at the current level
enum Holder {
    Root(usize),
    Shared(SharedEntity),
}

impl Holder {
    fn read<R>(&self, roots: &[&mut dyn Entity], f: impl FnOnce(&dyn Entity) -> R) -> R {
        match self {
            Holder::Root(i) => f(&*roots[*i]),
            Holder::Shared(handle) => f(&*handle.read()),
        }
    }

    fn write<R>(&self, roots: &mut [&mut dyn Entity], f: impl FnOnce(&mut dyn Entity) -> R) -> R {
        match self {
            Holder::Root(i) => f(&mut *roots[*i]),
            Holder::Shared(handle) => f(&mut *handle.write()),
        }
    }
}

/// Warm reference paths on a result set
pub(crate) async fn warm_up<T: Entity>(
    ctx: ReadContext<'_>,
    entities: &mut [T],
    paths: &[&str],
) -> Result<()> {
    let mut roots: Vec<&mut dyn Entity> =
        entities.iter_mut().map(|e| e as &mut dyn Entity).collect();
    warm_up_entities(ctx, &mut roots, paths).await
}

async fn warm_up_entities(
    ctx: ReadContext<'_>,
    roots: &mut [&mut dyn Entity],
    paths: &[&str],
) -> Result<()> {
    let Some(first) = roots.first() else {
        return Ok(());
    };
    if paths.is_empty() {
        return Ok(());
    }
    let tree = PathNode::parse(first.entity_name(), paths)?;
    let mut level: Vec<(Holder, &PathNode)> =
        (0..roots.len()).map(|i| (Holder::Root(i), &tree)).collect();
    let mut depth = 0usize;

    while !level.is_empty() {
        // Referenced IDs per target entity across the whole level
        let mut requests: BTreeMap<&'static str, Vec<u64>> = BTreeMap::new();
        let mut edges = Vec::with_capacity(level.len());
        for (holder, node) in &level {
            let holder_edges: Vec<(String, &PathNode)> = holder.read(roots, |entity| {
                let schema = ctx.registry.schema(entity.entity_name())?;
                let holder_edges = node.edges(schema)?;
                let slots = entity.reference_slots();
                for (column, _) in &holder_edges {
                    let Some((_, slot)) = slots.iter().find(|(name, _)| *name == column.as_str())
                    else {
                        return Err(Error::InvalidReference {
                            entity: schema.entity().to_string(),
                            path: column.clone(),
                        });
                    };
                    requests
                        .entry(slot.target_entity())
                        .or_default()
                        .extend(slot.ids());
                }
                Ok::<_, Error>(holder_edges)
            })?;
            edges.push(holder_edges);
        }

        // One batch lookup per target entity, run concurrently
        let mut lookups = Vec::with_capacity(requests.len());
        for (target, ids) in requests {
            let mut seen = HashSet::new();
            let ids: Vec<u64> = ids
                .into_iter()
                .filter(|id| *id != 0 && seen.insert(*id))
                .collect();
            if ids.is_empty() {
                continue;
            }
            let schema = Arc::clone(ctx.registry.schema(target)?);
            trace!(depth, entity = target, ids = ids.len(), "Warming references");
            lookups.push(async move {
                let rows = fetch_rows(ctx, &schema, &ids, true).await?;
                Ok::<_, Error>((target, (schema, rows)))
            });
        }
        let fetched: HashMap<&'static str, (Arc<EntitySchema>, HashMap<u64, Row>)> =
            try_join_all(lookups).await?.into_iter().collect();

        let mut next = Vec::new();
        for ((holder, _), holder_edges) in level.iter().zip(&edges) {
            holder.write(roots, |entity| {
                for (name, slot) in entity.reference_slots_mut() {
                    if !holder_edges.iter().any(|(column, _)| column.as_str() == name) {
                        continue;
                    }
                    if let Some((schema, rows)) = fetched.get(slot.target_entity()) {
                        slot.hydrate(schema, rows)?;
                    }
                }
                Ok::<_, Error>(())
            })?;

            holder.read(roots, |entity| {
                let slots = entity.reference_slots();
                for (column, child) in holder_edges {
                    if child.children.is_empty() {
                        continue;
                    }
                    if let Some((_, slot)) = slots.iter().find(|(name, _)| *name == column.as_str()) {
                        next.extend(slot.targets().into_iter().map(|t| (Holder::Shared(t), *child)));
                    }
                }
            });
        }
        level = next;
        depth += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_shares_prefixes() {
        let tree = PathNode::parse("User", &["Friend/Friend", "Friend", "*"]).unwrap();
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children["Friend"].children.len(), 1);
    }

    #[test]
    fn test_parse_rejects_empty_segment() {
        let err = PathNode::parse("User", &["Friend//Friend"]).unwrap_err();
        assert_matches!(err, Error::InvalidReference { ref path, .. } if path == "Friend//Friend");
    }

    #[test]
    fn test_edges_validate_columns() {
        let schema = crate::entity::testing::user_schema();
        let tree = PathNode::parse("User", &["*"]).unwrap();
        let edges = tree.edges(&schema).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].0, "Friend");

        let tree = PathNode::parse("User", &["Age"]).unwrap();
        assert_matches!(tree.edges(&schema), Err(Error::InvalidReference { .. }));
    }
}
