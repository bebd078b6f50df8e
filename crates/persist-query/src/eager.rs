//! Eager loading configuration for associations.
//!
//! An `EagerLoader` lists the associations a query should populate with a
//! left join instead of leaving them for lazy resolution.

use crate::storage::JoinSpec;
use persist_core::{Error, Model, RelationshipInfo, Result};
use std::marker::PhantomData;

/// Builder for eager loading configuration.
///
/// # Example
///
/// ```ignore
/// let members = session
///     .fetch_all(&cx, &Select::<Member>::new().eager(EagerLoader::new().include("team")))
///     .await;
/// ```
#[derive(Debug, Clone)]
pub struct EagerLoader<T: Model> {
    includes: Vec<&'static str>,
    _marker: PhantomData<T>,
}

impl<T: Model> EagerLoader<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            includes: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Include an association in eager loading. Repeats are ignored.
    #[must_use]
    pub fn include(mut self, relationship: &'static str) -> Self {
        if !self.includes.contains(&relationship) {
            self.includes.push(relationship);
        }
        self
    }

    #[must_use]
    pub fn includes(&self) -> &[&'static str] {
        &self.includes
    }

    #[must_use]
    pub fn has_includes(&self) -> bool {
        !self.includes.is_empty()
    }

    /// Resolve every include against `T::RELATIONSHIPS`.
    #[allow(clippy::result_large_err)]
    pub fn relationships(&self) -> Result<Vec<&'static RelationshipInfo>> {
        self.includes
            .iter()
            .map(|name| {
                find_relationship::<T>(name).ok_or_else(|| {
                    Error::invalid_descriptor(
                        T::TABLE_NAME,
                        format!("unknown association '{name}'"),
                    )
                })
            })
            .collect()
    }

    /// Does any include fan out parent rows?
    #[allow(clippy::result_large_err)]
    pub fn has_to_many(&self) -> Result<bool> {
        Ok(self.relationships()?.iter().any(|r| r.is_to_many()))
    }

    /// Join specs for the storage request.
    #[allow(clippy::result_large_err)]
    pub fn joins(&self) -> Result<Vec<JoinSpec>> {
        Ok(self
            .relationships()?
            .into_iter()
            .map(JoinSpec::from)
            .collect())
    }
}

impl<T: Model> Default for EagerLoader<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Find a relationship by name in a model's RELATIONSHIPS.
#[must_use]
pub fn find_relationship<M: Model>(name: &str) -> Option<&'static RelationshipInfo> {
    persist_core::find_relationship(M::RELATIONSHIPS, name)
}
