// src/context/resolver.rs
//! Walks the hierarchy upward from a context and merges ancestor data
//! bottom-to-top into a resolved view.
//!
//! Missing ancestors are a visible branch, not an error: the level is
//! skipped and resolution continues with whatever remains. Only a missing
//! leaf and a (structurally impossible, defensively checked) parent cycle
//! fail.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::context::cache::{CacheKey, ContextCache};
use crate::context::error::{ContextError, ContextResult};
use crate::context::merge::merge_chain;
use crate::context::store::ContextStore;
use crate::context::types::{Context, ContextLevel, ResolvedContext, UserScope};

pub struct InheritanceResolver {
    store: Arc<dyn ContextStore>,
    cache: Arc<ContextCache>,
}

impl InheritanceResolver {
    pub fn new(store: Arc<dyn ContextStore>, cache: Arc<ContextCache>) -> Self {
        Self { store, cache }
    }

    /// Raw context load through the cache's raw side. A force-refreshed
    /// resolution skips the read but still re-populates.
    async fn load_context(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        use_cache: bool,
    ) -> ContextResult<Option<Context>> {
        let key = CacheKey::new(scope, level, context_id);
        if use_cache {
            if let Some(context) = self.cache.get_raw(&key) {
                return Ok(Some(context));
            }
        }
        let epoch = self.cache.begin_raw(&key);
        match self.store.get(scope, level, context_id).await? {
            Some(context) => {
                self.cache.put_raw(&key, context.clone(), epoch);
                Ok(Some(context))
            }
            None => Ok(None),
        }
    }

    /// Resolve `(level, context_id)` for the scope. Returns the resolved
    /// view plus every ancestor key the resolution depends on, including
    /// keys that were absent, so their later creation invalidates this
    /// view through the cache's reverse index.
    pub async fn resolve(
        &self,
        scope: &UserScope,
        level: ContextLevel,
        context_id: &str,
        use_cache: bool,
    ) -> ContextResult<(ResolvedContext, Vec<CacheKey>)> {
        let leaf = self
            .load_context(scope, level, context_id, use_cache)
            .await?
            .ok_or_else(|| ContextError::NotFound {
                level,
                context_id: context_id.to_string(),
            })?;

        let mut found: Vec<Context> = vec![leaf.clone()];
        let mut ancestor_keys: Vec<CacheKey> = Vec::new();
        let mut visited: HashSet<(ContextLevel, String)> = HashSet::new();
        visited.insert((level, context_id.to_string()));

        let mut current = leaf;
        let mut global_attempted = level == ContextLevel::Global;

        while let Some(parent_level) = current.level.parent() {
            let Some(parent_id) = current.parent_ref() else {
                debug!(
                    "context {}/{} carries no {} reference; walking stops here",
                    current.level, current.context_id, parent_level
                );
                break;
            };

            if !visited.insert((parent_level, parent_id.clone())) {
                return Err(ContextError::InheritanceCycle {
                    level: parent_level,
                    context_id: parent_id,
                });
            }

            ancestor_keys.push(CacheKey::new(scope, parent_level, &parent_id));
            if parent_level == ContextLevel::Global {
                global_attempted = true;
            }

            match self
                .load_context(scope, parent_level, &parent_id, use_cache)
                .await?
            {
                Some(parent) => {
                    found.push(parent.clone());
                    current = parent;
                }
                None => {
                    warn!(
                        "context {}/{} references missing {} '{}'; level skipped",
                        current.level, current.context_id, parent_level, parent_id
                    );
                    break;
                }
            }
        }

        // The user's GLOBAL context is addressable without a parent chain,
        // so it still contributes when an intermediate link was broken.
        if !global_attempted {
            let global_id = scope.user_id().to_string();
            ancestor_keys.push(CacheKey::new(scope, ContextLevel::Global, &global_id));
            if let Some(global) = self
                .load_context(scope, ContextLevel::Global, &global_id, use_cache)
                .await?
            {
                found.push(global);
            }
        }

        // Root first for the merge; the requested context is innermost.
        found.sort_by_key(|c| c.level.depth());
        let inheritance_chain: Vec<ContextLevel> = found.iter().map(|c| c.level).collect();
        let data = merge_chain(found.iter().map(|c| &c.data));

        Ok((
            ResolvedContext {
                level,
                context_id: context_id.to_string(),
                data,
                inheritance_chain,
                resolved_at: Utc::now(),
            },
            ancestor_keys,
        ))
    }
}
