//! Case service cache
//!
//! Caches the case lookups of the case-management front end over a pluggable
//! [`CaseBackend`]:
//! - `case-detail`: evicted when case details, documents or properties change
//! - `related-cases`: evicted when a case relation is added
//! - `related-objects`: only evicted manually
//!
//! Payloads are passed through as JSON; their shape belongs to the backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{future::Future, sync::Arc};

use crate::{BoxError, CacheCoordinator, CacheError, CachedFn, InvalidatingFn};

pub const CASE_DETAIL_GROUP: &str = "case-detail";
pub const RELATED_CASES_GROUP: &str = "related-cases";
pub const RELATED_OBJECTS_GROUP: &str = "related-objects";

/// Request to relate a case to another case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedCaseRequest {
    /// URL of the case being related
    pub relation_zaak: String,
    /// Nature of the relation
    pub aard_relatie: String,
    /// URL of the case the relation is added to
    pub main_zaak: String,
}

/// Transport for case data (HTTP, RPC, ...), implemented by the host
///
/// Cases are identified by their source organisation (`bronorganisatie`)
/// and identification (`identificatie`).
#[async_trait]
pub trait CaseBackend: Send + Sync + 'static {
    async fn retrieve_case_details(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
    ) -> Result<Value, BoxError>;

    async fn update_case_details(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
        form: Value,
    ) -> Result<Value, BoxError>;

    async fn edit_case_document(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
        form: Value,
    ) -> Result<Value, BoxError>;

    /// Update a single case property, addressed by its URL
    async fn update_case_property(
        &self,
        property_url: &str,
        value: Value,
    ) -> Result<Value, BoxError>;

    async fn list_related_cases(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
    ) -> Result<Value, BoxError>;

    async fn add_related_case(
        &self,
        request: RelatedCaseRequest,
    ) -> Result<RelatedCaseRequest, BoxError>;

    async fn list_related_objects(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
    ) -> Result<Value, BoxError>;
}

type CaseArgs = (String, String);
type CaseFormArgs = (String, String, Value);

/// Wrap a per-case lookup as a cached accessor
fn cached_lookup<B, F, Fut>(
    coordinator: &CacheCoordinator,
    group: &str,
    backend: &Arc<B>,
    lookup: F,
) -> Result<CachedFn<CaseArgs, Value>, CacheError>
where
    B: CaseBackend,
    F: Fn(Arc<B>, String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    let backend = Arc::clone(backend);
    coordinator.cached(group, move |(bronorganisatie, identificatie): CaseArgs| {
        lookup(Arc::clone(&backend), bronorganisatie, identificatie)
    })
}

/// Case accessors with cached reads and invalidating writes
///
/// Registers the three case groups on the given coordinator, so only one
/// `CaseCache` can exist per coordinator.
#[derive(Clone)]
pub struct CaseCache {
    coordinator: CacheCoordinator,
    details: CachedFn<CaseArgs, Value>,
    related_cases: CachedFn<CaseArgs, Value>,
    related_objects: CachedFn<CaseArgs, Value>,
    update_details: InvalidatingFn<CaseFormArgs, Value>,
    edit_document: InvalidatingFn<CaseFormArgs, Value>,
    update_property: InvalidatingFn<(String, Value), Value>,
    add_related: InvalidatingFn<RelatedCaseRequest, RelatedCaseRequest>,
}

impl CaseCache {
    /// Create a new CaseCache with the given backend
    pub fn new<B: CaseBackend>(
        coordinator: &CacheCoordinator,
        backend: B,
    ) -> Result<Self, CacheError> {
        let backend = Arc::new(backend);

        let details = cached_lookup(coordinator, CASE_DETAIL_GROUP, &backend, |b, org, id| {
            async move { b.retrieve_case_details(&org, &id).await }
        })?;
        let related_cases =
            cached_lookup(coordinator, RELATED_CASES_GROUP, &backend, |b, org, id| {
                async move { b.list_related_cases(&org, &id).await }
            })?;
        let related_objects =
            cached_lookup(coordinator, RELATED_OBJECTS_GROUP, &backend, |b, org, id| {
                async move { b.list_related_objects(&org, &id).await }
            })?;

        let update_details = coordinator.invalidates([CASE_DETAIL_GROUP], {
            let backend = Arc::clone(&backend);
            move |(org, id, form): CaseFormArgs| {
                let backend = Arc::clone(&backend);
                async move { backend.update_case_details(&org, &id, form).await }
            }
        })?;

        let edit_document = coordinator.invalidates([CASE_DETAIL_GROUP], {
            let backend = Arc::clone(&backend);
            move |(org, id, form): CaseFormArgs| {
                let backend = Arc::clone(&backend);
                async move { backend.edit_case_document(&org, &id, form).await }
            }
        })?;

        // Properties are addressed by URL, so the whole detail group goes
        let update_property = coordinator.invalidates([CASE_DETAIL_GROUP], {
            let backend = Arc::clone(&backend);
            move |(url, value): (String, Value)| {
                let backend = Arc::clone(&backend);
                async move { backend.update_case_property(&url, value).await }
            }
        })?;

        let add_related = coordinator.invalidates([RELATED_CASES_GROUP], {
            let backend = Arc::clone(&backend);
            move |request: RelatedCaseRequest| {
                let backend = Arc::clone(&backend);
                async move { backend.add_related_case(request).await }
            }
        })?;

        Ok(Self {
            coordinator: coordinator.clone(),
            details,
            related_cases,
            related_objects,
            update_details,
            edit_document,
            update_property,
            add_related,
        })
    }

    pub async fn retrieve_case_details(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
    ) -> Result<Arc<Value>, CacheError> {
        self.details
            .call(case_args(bronorganisatie, identificatie))
            .await
    }

    pub async fn update_case_details(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
        form: Value,
    ) -> Result<Value, CacheError> {
        self.update_details
            .call((bronorganisatie.to_owned(), identificatie.to_owned(), form))
            .await
    }

    pub async fn edit_case_document(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
        form: Value,
    ) -> Result<Value, CacheError> {
        self.edit_document
            .call((bronorganisatie.to_owned(), identificatie.to_owned(), form))
            .await
    }

    pub async fn update_case_property(
        &self,
        property_url: &str,
        value: Value,
    ) -> Result<Value, CacheError> {
        self.update_property
            .call((property_url.to_owned(), value))
            .await
    }

    pub async fn list_related_cases(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
    ) -> Result<Arc<Value>, CacheError> {
        self.related_cases
            .call(case_args(bronorganisatie, identificatie))
            .await
    }

    pub async fn add_related_case(
        &self,
        request: RelatedCaseRequest,
    ) -> Result<RelatedCaseRequest, CacheError> {
        self.add_related.call(request).await
    }

    pub async fn list_related_objects(
        &self,
        bronorganisatie: &str,
        identificatie: &str,
    ) -> Result<Arc<Value>, CacheError> {
        self.related_objects
            .call(case_args(bronorganisatie, identificatie))
            .await
    }

    /// Drop all cached related-object listings
    pub fn invalidate_related_objects(&self) -> usize {
        self.related_objects.invalidate()
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }
}

fn case_args(bronorganisatie: &str, identificatie: &str) -> CaseArgs {
    (bronorganisatie.to_owned(), identificatie.to_owned())
}
