//! Entity lock cascade.
//!
//! A locked entity is read-only. Locking flows down the containment graph
//! (evaluation → template → items → scales); unlocking flows down too, but an
//! entity stays locked while any locked container still uses it.

use std::collections::HashSet;
use std::sync::Arc;

use evalflow_core::error::{EvalFlowError, Result};
use evalflow_core::traits::LockGraph;
use evalflow_core::types::EntityRef;

pub struct LockCascade {
    graph: Arc<dyn LockGraph>,
}

impl LockCascade {
    pub fn new(graph: Arc<dyn LockGraph>) -> Self {
        Self { graph }
    }

    /// Lock or unlock `entity` and cascade to what it contains.
    ///
    /// Returns `true` when `entity`'s own flag changed. Never-persisted entities
    /// are rejected with [`EvalFlowError::InvalidTransition`].
    pub async fn set_locked(&self, entity: EntityRef, locked: bool) -> Result<bool> {
        if entity.id.is_none() {
            return Err(EvalFlowError::InvalidTransition(format!(
                "cannot change the lock on unsaved {entity}"
            )));
        }
        let current = self
            .graph
            .is_locked(entity)
            .await?
            .ok_or_else(|| EvalFlowError::not_found(entity.to_string()))?;
        if current == locked {
            return Ok(false);
        }

        if locked {
            self.lock_down(entity).await?;
            Ok(true)
        } else {
            self.unlock_down(entity).await
        }
    }

    async fn lock_down(&self, root: EntityRef) -> Result<()> {
        self.graph.set_locked_flag(root, true).await?;
        tracing::info!("🔒 Locked {}", root);

        let mut seen = HashSet::from([root]);
        let mut pending = vec![root];
        while let Some(entity) = pending.pop() {
            for child in self.graph.children(entity).await? {
                if !seen.insert(child) {
                    continue;
                }
                match self.graph.is_locked(child).await? {
                    Some(false) => {
                        self.graph.set_locked_flag(child, true).await?;
                        tracing::debug!("🔒 Locked {} (contained by {})", child, entity);
                        pending.push(child);
                    }
                    Some(true) => {}
                    None => tracing::warn!("⚠️ {} references missing {}", entity, child),
                }
            }
        }
        Ok(())
    }

    async fn unlock_down(&self, root: EntityRef) -> Result<bool> {
        let holders = self.graph.locked_parents(root).await?;
        if !holders.is_empty() {
            tracing::info!("🔐 {} stays locked, still used by {:?}", root, holders);
            return Ok(false);
        }
        self.graph.set_locked_flag(root, false).await?;
        tracing::info!("🔓 Unlocked {}", root);

        let mut seen = HashSet::from([root]);
        let mut pending = vec![root];
        while let Some(entity) = pending.pop() {
            for child in self.graph.children(entity).await? {
                if !seen.insert(child) {
                    continue;
                }
                if self.graph.is_locked(child).await? != Some(true) {
                    continue;
                }
                if !self.graph.locked_parents(child).await?.is_empty() {
                    tracing::debug!("🔐 {} stays locked by another container", child);
                    continue;
                }
                self.graph.set_locked_flag(child, false).await?;
                tracing::debug!("🔓 Unlocked {} (released by {})", child, entity);
                pending.push(child);
            }
        }
        Ok(true)
    }
}
