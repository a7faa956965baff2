//! Read-side walks over the persisted path tree.
//!
//! Traversal order is part of the protocol contract: subtree walks are
//! depth-first, parent before children, children in name order (the order
//! `paths_by_parent` returns them). Walks are iterative to keep the async
//! functions box-free.

use crate::id::RecordId;
use crate::record::{ConnectionRecord, PathRecord};
use crate::store::{Store, StoreError, StoreResult};

/// Resolves a segment chain under a user's namespace to its terminal path.
///
/// Returns `Ok(None)` as soon as a segment is missing.
pub async fn resolve(
    store: &dyn Store,
    user_id: RecordId,
    segments: &[String],
) -> StoreResult<Option<PathRecord>> {
    let mut parent: Option<RecordId> = None;
    let mut current: Option<PathRecord> = None;

    for segment in segments {
        let children = store.paths_by_parent(user_id, parent).await?;
        match children.into_iter().find(|p| &p.name == segment) {
            Some(child) => {
                parent = Some(child.id);
                current = Some(child);
            }
            None => return Ok(None),
        }
    }
    Ok(current)
}

/// Renders the fully-qualified name of a path: `email/seg(/seg)*`.
///
/// Walks the parent chain up to the root and prefixes the owning user's
/// email.
pub async fn full_name(store: &dyn Store, path: &PathRecord) -> StoreResult<String> {
    let mut segments = vec![path.name.clone()];
    let mut parent_id = path.parent_id;

    while let Some(id) = parent_id {
        let parent = store
            .path_by_id(id)
            .await?
            .ok_or(StoreError::NotFound { kind: "path", id })?;
        segments.push(parent.name.clone());
        parent_id = parent.parent_id;
    }
    segments.reverse();

    let user = store
        .user_by_id(path.user_id)
        .await?
        .ok_or(StoreError::NotFound {
            kind: "user",
            id: path.user_id,
        })?;

    Ok(format!("{}/{}", user.email, segments.join("/")))
}

/// Collects the subtree rooted at `root`, depth-first, parent before
/// children, children in name order. `root` itself is first.
pub async fn subtree(store: &dyn Store, root: &PathRecord) -> StoreResult<Vec<PathRecord>> {
    let mut ordered = Vec::new();
    let mut stack = vec![root.clone()];

    while let Some(path) = stack.pop() {
        let children = store.paths_by_parent(path.user_id, Some(path.id)).await?;
        ordered.push(path);
        // reversed so the stack pops them back in name order
        stack.extend(children.into_iter().rev());
    }
    Ok(ordered)
}

/// Finds the first connection in the subtree rooted at `root`,
/// depth-first, first match wins.
pub async fn first_connection(
    store: &dyn Store,
    root: &PathRecord,
) -> StoreResult<Option<(PathRecord, ConnectionRecord)>> {
    let mut stack = vec![root.clone()];

    while let Some(path) = stack.pop() {
        if let Some(conn) = store.connection_by_path(path.id).await? {
            return Ok(Some((path, conn)));
        }
        let children = store.paths_by_parent(path.user_id, Some(path.id)).await?;
        stack.extend(children.into_iter().rev());
    }
    Ok(None)
}

/// Collects every connection in the subtree rooted at `root`, in
/// depth-first order.
pub async fn connections_in(
    store: &dyn Store,
    root: &PathRecord,
) -> StoreResult<Vec<(PathRecord, ConnectionRecord)>> {
    let mut found = Vec::new();
    for path in subtree(store, root).await? {
        if let Some(conn) = store.connection_by_path(path.id).await? {
            found.push((path, conn));
        }
    }
    Ok(found)
}
