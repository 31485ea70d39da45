//! In-memory [`HarvestStore`] and [`CatalogActions`].
//!
//! Useful for embedding the harvesters without a host catalog and for tests.
//! [`MemoryCatalog`] enforces the few package rules harvesting relies on:
//! required name and title, and an existing owner organization.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::model::{
    EntityState, HarvestJob, HarvestObject, LocalPackage, NewHarvestObject, NewOrganization,
    Organization,
};
use crate::traits::{
    ActionError, CatalogActions, ErrorStage, HarvestStore, OrganizationPatch, StoreError,
    ValidationErrors,
};

/// An object error as recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectError {
    pub object_id: String,
    pub message: String,
    pub stage: ErrorStage,
}

#[derive(Default)]
struct StoreInner {
    jobs: HashMap<String, HarvestJob>,
    /// Kept in creation order
    objects: Vec<HarvestObject>,
    gather_errors: Vec<(String, String)>,
    object_errors: Vec<ObjectError>,
}

/// Harvest store backed by a `RwLock`-guarded map.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreInner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreInner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }

    /// Inserts or replaces a job.
    pub fn add_job(&self, job: HarvestJob) {
        if let Ok(mut inner) = self.write() {
            inner.jobs.insert(job.id.clone(), job);
        }
    }

    pub fn gather_errors(&self, job_id: &str) -> Vec<String> {
        self.read()
            .map(|inner| {
                inner
                    .gather_errors
                    .iter()
                    .filter(|(id, _)| id == job_id)
                    .map(|(_, message)| message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn object_errors(&self, object_id: &str) -> Vec<String> {
        self.read()
            .map(|inner| {
                inner
                    .object_errors
                    .iter()
                    .filter(|e| e.object_id == object_id)
                    .map(|e| e.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl HarvestStore for MemoryStore {
    async fn job(&self, id: &str) -> Result<Option<HarvestJob>, StoreError> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    async fn jobs_for_source(&self, source_id: &str) -> Result<Vec<HarvestJob>, StoreError> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|j| j.source.id == source_id)
            .cloned()
            .collect())
    }

    async fn has_gather_errors(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.read()?.gather_errors.iter().any(|(id, _)| id == job_id))
    }

    async fn objects_for_job(&self, job_id: &str) -> Result<Vec<HarvestObject>, StoreError> {
        Ok(self
            .read()?
            .objects
            .iter()
            .filter(|o| o.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn object(&self, id: &str) -> Result<Option<HarvestObject>, StoreError> {
        Ok(self.read()?.objects.iter().find(|o| o.id == id).cloned())
    }

    async fn create_object(&self, object: NewHarvestObject) -> Result<HarvestObject, StoreError> {
        let mut inner = self.write()?;
        if !inner.jobs.contains_key(&object.job_id) {
            return Err(StoreError::NotFound(format!("job {}", object.job_id)));
        }
        let created = HarvestObject {
            id: Uuid::new_v4().to_string(),
            guid: object.guid,
            job_id: object.job_id,
            source_id: object.source_id,
            content: Some(object.content),
            current: false,
            report_status: None,
            package_id: None,
        };
        inner.objects.push(created.clone());
        Ok(created)
    }

    async fn update_object(&self, object: &HarvestObject) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let slot = inner
            .objects
            .iter_mut()
            .find(|o| o.id == object.id)
            .ok_or_else(|| StoreError::NotFound(format!("object {}", object.id)))?;
        *slot = object.clone();
        Ok(())
    }

    async fn current_objects_for_guid(
        &self,
        source_id: &str,
        guid: &str,
    ) -> Result<Vec<HarvestObject>, StoreError> {
        Ok(self
            .read()?
            .objects
            .iter()
            .filter(|o| o.current && o.source_id == source_id && o.guid == guid)
            .cloned()
            .collect())
    }

    async fn save_gather_error(&self, job_id: &str, message: &str) -> Result<(), StoreError> {
        self.write()?
            .gather_errors
            .push((job_id.to_string(), message.to_string()));
        Ok(())
    }

    async fn save_object_error(
        &self,
        object_id: &str,
        message: &str,
        stage: ErrorStage,
    ) -> Result<(), StoreError> {
        self.write()?.object_errors.push(ObjectError {
            object_id: object_id.to_string(),
            message: message.to_string(),
            stage,
        });
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Default)]
struct CatalogInner {
    packages: HashMap<String, LocalPackage>,
    organizations: HashMap<String, Organization>,
    rejected: HashSet<String>,
    updates: usize,
}

impl CatalogInner {
    fn organization(&self, id_or_name: &str) -> Option<&Organization> {
        self.organizations
            .get(id_or_name)
            .or_else(|| self.organizations.values().find(|o| o.name == id_or_name))
    }

    fn validate(&self, package: &LocalPackage) -> Result<(), ActionError> {
        let mut errors = BTreeMap::new();
        if self.rejected.contains(&package.id) {
            errors.insert("__before".to_string(), json!(["Rejected by catalog"]));
        }
        if package.name.trim().is_empty() {
            errors.insert("name".to_string(), json!(["Missing value"]));
        }
        if package.title.trim().is_empty() {
            errors.insert("title".to_string(), json!(["Missing value"]));
        }
        if let Some(owner) = &package.owner_org {
            if self.organization(owner).is_none() {
                errors.insert(
                    "owner_org".to_string(),
                    json!(["Organization does not exist"]),
                );
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ActionError::Validation(ValidationErrors(errors)))
        }
    }
}

/// Local catalog held in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<CatalogInner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CatalogInner>, ActionError> {
        self.inner
            .read()
            .map_err(|_| ActionError::Other("catalog lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CatalogInner>, ActionError> {
        self.inner
            .write()
            .map_err(|_| ActionError::Other("catalog lock poisoned".to_string()))
    }

    pub fn add_organization(&self, org: Organization) {
        if let Ok(mut inner) = self.write() {
            inner.organizations.insert(org.id.clone(), org);
        }
    }

    /// Makes every create or update of package `id` fail validation.
    pub fn reject_package(&self, id: &str) {
        if let Ok(mut inner) = self.write() {
            inner.rejected.insert(id.to_string());
        }
    }

    pub fn packages(&self) -> Vec<LocalPackage> {
        self.read()
            .map(|inner| inner.packages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of successful package updates.
    pub fn update_count(&self) -> usize {
        self.read().map(|inner| inner.updates).unwrap_or_default()
    }
}

#[async_trait]
impl CatalogActions for MemoryCatalog {
    async fn package_show(&self, id: &str) -> Result<LocalPackage, ActionError> {
        let inner = self.read()?;
        inner
            .packages
            .get(id)
            .or_else(|| inner.packages.values().find(|p| p.name == id))
            .cloned()
            .ok_or_else(|| ActionError::NotFound(format!("package {id}")))
    }

    async fn package_create(&self, package: &LocalPackage) -> Result<LocalPackage, ActionError> {
        let mut inner = self.write()?;
        inner.validate(package)?;

        let mut created = package.clone();
        if created.id.is_empty() {
            created.id = Uuid::new_v4().to_string();
        }
        let taken = inner.packages.contains_key(&created.id)
            || inner.packages.values().any(|p| p.name == created.name);
        if taken {
            let mut errors = BTreeMap::new();
            errors.insert("name".to_string(), json!(["That URL is already in use."]));
            return Err(ActionError::Validation(ValidationErrors(errors)));
        }
        created.state = Some("active".to_string());
        inner.packages.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn package_update(&self, package: &LocalPackage) -> Result<LocalPackage, ActionError> {
        let mut inner = self.write()?;
        if !inner.packages.contains_key(&package.id) {
            return Err(ActionError::NotFound(format!("package {}", package.id)));
        }
        inner.validate(package)?;

        let mut updated = package.clone();
        updated.state = Some("active".to_string());
        inner.packages.insert(updated.id.clone(), updated.clone());
        inner.updates += 1;
        Ok(updated)
    }

    async fn organization_show(&self, id: &str) -> Result<Organization, ActionError> {
        self.read()?
            .organization(id)
            .cloned()
            .ok_or_else(|| ActionError::NotFound(format!("organization {id}")))
    }

    async fn organization_create(
        &self,
        org: &NewOrganization,
    ) -> Result<Organization, ActionError> {
        let mut inner = self.write()?;
        if org.name.trim().is_empty() || inner.organization(&org.name).is_some() {
            let mut errors = BTreeMap::new();
            errors.insert("name".to_string(), json!(["Group name already exists in database"]));
            return Err(ActionError::Validation(ValidationErrors(errors)));
        }
        let created = Organization {
            id: Uuid::new_v4().to_string(),
            name: org.name.clone(),
            title: org.title.clone(),
            image_url: org.image_url.clone(),
            state: EntityState::Active,
        };
        inner
            .organizations
            .insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn organization_patch(
        &self,
        id: &str,
        patch: &OrganizationPatch,
    ) -> Result<Organization, ActionError> {
        let mut inner = self.write()?;
        let key = inner
            .organization(id)
            .map(|o| o.id.clone())
            .ok_or_else(|| ActionError::NotFound(format!("organization {id}")))?;
        let org = inner
            .organizations
            .get_mut(&key)
            .ok_or_else(|| ActionError::NotFound(format!("organization {id}")))?;
        if let Some(state) = patch.state {
            org.state = state;
        }
        if let Some(title) = &patch.title {
            org.title = title.clone();
        }
        if let Some(image_url) = &patch.image_url {
            org.image_url = Some(image_url.clone());
        }
        Ok(org.clone())
    }
}
