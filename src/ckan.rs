//! [`CatalogActions`] over a CKAN action API.
//!
//! Every action is `POST {base}/api/{version}/action/{name}` with a JSON
//! body. CKAN wraps responses in `{"success": .., "result": .., "error": ..}`,
//! failing actions carry an `__type` naming the error class.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::config::SourceConfig;
use crate::fetch::{FetchError, FetcherSettings};
use crate::model::{LocalPackage, NewOrganization, Organization};
use crate::traits::{ActionError, CatalogActions, OrganizationPatch, ValidationErrors};

const DEFAULT_API_VERSION: u32 = 3;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Maps the `error` member of a failed action.
fn action_error(error: Option<Value>) -> ActionError {
    let Some(Value::Object(mut error)) = error else {
        return ActionError::Other("action failed without error detail".to_string());
    };
    let kind = error
        .remove("__type")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    match kind.as_str() {
        "Not Found Error" => ActionError::NotFound(
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Not found")
                .to_string(),
        ),
        "Validation Error" => {
            let fields: BTreeMap<String, Value> = error.into_iter().collect();
            ActionError::Validation(ValidationErrors(fields))
        }
        _ => ActionError::Other(format!("{kind}: {}", Value::Object(error))),
    }
}

/// Client for the action API of a local CKAN instance.
#[derive(Debug, Clone)]
pub struct CkanActionClient {
    client: Client,
    base_url: String,
    api_version: u32,
    api_key: Option<String>,
}

impl CkanActionClient {
    pub fn new(base_url: impl Into<String>, settings: FetcherSettings) -> Result<Self, FetchError> {
        let mut builder = Client::builder().user_agent(settings.user_agent);
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_version: DEFAULT_API_VERSION,
            api_key: settings.api_key,
        })
    }

    /// Client acting for one harvest source: its `api_key` authorizes the
    /// calls and its `api_version` selects the action endpoint.
    pub fn for_source(
        base_url: impl Into<String>,
        config: &SourceConfig,
    ) -> Result<Self, FetchError> {
        Ok(Self::new(base_url, FetcherSettings::for_source(config))?
            .with_api_version(config.api_version()))
    }

    pub fn with_api_version(mut self, version: u32) -> Self {
        self.api_version = version;
        self
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/api/{}/action/{action}", self.base_url, self.api_version)
    }

    #[instrument(skip(self, payload))]
    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        payload: Value,
    ) -> Result<T, ActionError> {
        let url = self.action_url(action);
        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header(AUTHORIZATION, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ActionError::Other(format!("{action}: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ActionError::Other(format!("{action}: {e}")))?;
        debug!(%status, size = body.len(), "action response");

        // Failed actions still come with an envelope, whatever the status
        let envelope: Envelope = serde_json::from_slice(&body).map_err(|_| {
            ActionError::Other(format!("{action}: HTTP {} without JSON body", status.as_u16()))
        })?;
        if !envelope.success {
            return Err(action_error(envelope.error));
        }

        let result = envelope.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| ActionError::Other(format!("{action}: unexpected result: {e}")))
    }

    fn to_payload<T: serde::Serialize>(value: &T) -> Result<Value, ActionError> {
        serde_json::to_value(value).map_err(|e| ActionError::Other(e.to_string()))
    }
}

#[async_trait]
impl CatalogActions for CkanActionClient {
    async fn package_show(&self, id: &str) -> Result<LocalPackage, ActionError> {
        self.call("package_show", json!({ "id": id })).await
    }

    async fn package_create(&self, package: &LocalPackage) -> Result<LocalPackage, ActionError> {
        self.call("package_create", Self::to_payload(package)?).await
    }

    async fn package_update(&self, package: &LocalPackage) -> Result<LocalPackage, ActionError> {
        self.call("package_update", Self::to_payload(package)?).await
    }

    async fn organization_show(&self, id: &str) -> Result<Organization, ActionError> {
        self.call("organization_show", json!({ "id": id })).await
    }

    async fn organization_create(
        &self,
        org: &NewOrganization,
    ) -> Result<Organization, ActionError> {
        self.call("organization_create", Self::to_payload(org)?).await
    }

    async fn organization_patch(
        &self,
        id: &str,
        patch: &OrganizationPatch,
    ) -> Result<Organization, ActionError> {
        let mut payload = Self::to_payload(patch)?;
        if let Value::Object(map) = &mut payload {
            map.insert("id".to_string(), json!(id));
        }
        self.call("organization_patch", payload).await
    }
}
