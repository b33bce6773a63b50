use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{CloudError, CloudResult};
use crate::models::{
    Disk, Firewall, Image, Instance, InstanceRef, InstanceSpec, ListPage, Operation, Zone,
};

pub const DEFAULT_API_BASE: &str = "https://compute.googleapis.com/compute/v1";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const MAX_RESULTS: u32 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where bearer tokens for the compute API come from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    Static(String),
    /// Re-read on every call so an external refresher can rotate it.
    File(PathBuf),
    MetadataServer { url: String },
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
}

impl TokenSource {
    pub async fn token(&self, http: &reqwest::Client) -> CloudResult<String> {
        let token = match self {
            TokenSource::Static(token) => token.trim().to_string(),
            TokenSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|err| {
                    CloudError::Auth(format!("cannot read {}: {}", path.display(), err))
                })?
                .trim()
                .to_string(),
            TokenSource::MetadataServer { url } => {
                let response = http
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|err| CloudError::Auth(format!("token refresh failed: {}", err)))?;
                if !response.status().is_success() {
                    return Err(CloudError::Auth(format!(
                        "token refresh failed: {}",
                        response.status()
                    )));
                }
                response
                    .json::<MetadataToken>()
                    .await
                    .map_err(|err| CloudError::Auth(format!("bad token response: {}", err)))?
                    .access_token
            }
        };
        if token.is_empty() {
            return Err(CloudError::Auth("access token is empty".to_string()));
        }
        Ok(token)
    }
}

/// Outcome of one element of a bulk call.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub name: String,
    pub outcome: Result<Operation, CloudError>,
}

/// Per-element results of a bulk insert or delete. Partial success is allowed.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub items: Vec<BatchItem>,
}

impl BatchResult {
    pub fn operations(&self) -> Vec<Operation> {
        self.items
            .iter()
            .filter_map(|item| item.outcome.as_ref().ok().cloned())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter(|item| item.outcome.is_ok())
            .map(|item| item.name.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<(&str, &CloudError)> {
        self.items
            .iter()
            .filter_map(|item| match &item.outcome {
                Ok(_) => None,
                Err(err) => Some((item.name.as_str(), err)),
            })
            .collect()
    }
}

/// The compute surface the reconciler and CLI depend on. Project and zone are
/// fixed per implementation.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    fn project(&self) -> &str;
    fn zone(&self) -> &str;

    /// Instances in the zone, optionally narrowed by an API filter expression.
    async fn list_instances(&self, filter: Option<&str>) -> CloudResult<Vec<Instance>>;
    async fn list_firewalls(&self) -> CloudResult<Vec<Firewall>>;
    async fn list_images(&self, project: &str) -> CloudResult<Vec<Image>>;
    async fn list_disks(&self) -> CloudResult<Vec<Disk>>;
    /// Zones of the project; the only listing that ignores the client's zone.
    async fn list_zones(&self) -> CloudResult<Vec<Zone>>;
    async fn insert_firewall(&self, firewall: &Firewall) -> CloudResult<Operation>;
    async fn bulk_insert_instances(&self, specs: &[InstanceSpec]) -> CloudResult<BatchResult>;
    async fn bulk_delete_instances(&self, refs: &[InstanceRef]) -> CloudResult<BatchResult>;
    async fn get_operation(&self, operation: &Operation) -> CloudResult<Operation>;
}

pub struct ComputeClient {
    project: String,
    zone: String,
    base_url: String,
    http: reqwest::Client,
    tokens: TokenSource,
}

impl ComputeClient {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        tokens: TokenSource,
    ) -> CloudResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            project: project.into(),
            zone: zone.into(),
            base_url: DEFAULT_API_BASE.to_string(),
            http,
            tokens,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    fn zonal_path(&self, zone: Option<&str>, collection: &str) -> String {
        format!(
            "projects/{}/zones/{}/{}",
            self.project,
            zone.unwrap_or(&self.zone),
            collection
        )
    }

    fn global_path(&self, project: &str, collection: &str) -> String {
        format!("projects/{}/global/{}", project, collection)
    }

    async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        filter: Option<&str>,
    ) -> CloudResult<Vec<T>> {
        let token = self.tokens.token(&self.http).await?;
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("maxResults".to_string(), MAX_RESULTS.to_string())];
            if let Some(filter) = filter {
                query.push(("filter".to_string(), filter.to_string()));
            }
            if let Some(page) = page_token.take() {
                query.push(("pageToken".to_string(), page));
            }
            let page: ListPage<T> = self
                .request_json(&token, Method::GET, path, query, None)
                .await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        debug!(path, count = items.len(), "listed resources");
        Ok(items)
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        token: &str,
        method: Method,
        path: &str,
        query: Vec<(String, String)>,
        body: Option<serde_json::Value>,
    ) -> CloudResult<T> {
        let url = self.build_url(path, &query)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| CloudError::Auth("access token is not a valid header".to_string()))?;

        let mut request = self.http.request(method, url).header(AUTHORIZATION, bearer);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> CloudResult<T> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }
        Err(CloudError::from_status(status, &body))
    }

    fn build_url(&self, path: &str, query: &[(String, String)]) -> CloudResult<Url> {
        let query_string = build_query_string(query);
        let raw = if query_string.is_empty() {
            format!("{}/{}", self.base_url, path)
        } else {
            format!("{}/{}?{}", self.base_url, path, query_string)
        };
        Ok(Url::parse(&raw)?)
    }
}

#[async_trait]
impl ComputeApi for ComputeClient {
    fn project(&self) -> &str {
        &self.project
    }

    fn zone(&self) -> &str {
        &self.zone
    }

    async fn list_instances(&self, filter: Option<&str>) -> CloudResult<Vec<Instance>> {
        let path = self.zonal_path(None, "instances");
        self.list_all(&path, filter).await
    }

    async fn list_firewalls(&self) -> CloudResult<Vec<Firewall>> {
        let path = self.global_path(&self.project, "firewalls");
        self.list_all(&path, None).await
    }

    async fn list_images(&self, project: &str) -> CloudResult<Vec<Image>> {
        let path = self.global_path(project, "images");
        self.list_all(&path, None).await
    }

    async fn list_disks(&self) -> CloudResult<Vec<Disk>> {
        let path = self.zonal_path(None, "disks");
        self.list_all(&path, None).await
    }

    async fn list_zones(&self) -> CloudResult<Vec<Zone>> {
        let path = format!("projects/{}/zones", self.project);
        self.list_all(&path, None).await
    }

    async fn insert_firewall(&self, firewall: &Firewall) -> CloudResult<Operation> {
        let token = self.tokens.token(&self.http).await?;
        let path = self.global_path(&self.project, "firewalls");
        let body = serde_json::to_value(firewall)?;
        self.request_json(&token, Method::POST, &path, vec![], Some(body))
            .await
    }

    async fn bulk_insert_instances(&self, specs: &[InstanceSpec]) -> CloudResult<BatchResult> {
        if specs.is_empty() {
            return Ok(BatchResult::default());
        }
        let token = self.tokens.token(&self.http).await?;
        let path = self.zonal_path(None, "instances");
        let requests = specs.iter().map(|spec| {
            let token = token.as_str();
            let path = path.as_str();
            async move {
                let outcome = match serde_json::to_value(spec) {
                    Ok(body) => {
                        self.request_json::<Operation>(token, Method::POST, path, vec![], Some(body))
                            .await
                    }
                    Err(err) => Err(CloudError::from(err)),
                };
                if let Err(err) = &outcome {
                    warn!(instance = %spec.name, "insert failed: {}", err);
                }
                BatchItem {
                    name: spec.name.clone(),
                    outcome,
                }
            }
        });
        Ok(BatchResult {
            items: join_all(requests).await,
        })
    }

    async fn bulk_delete_instances(&self, refs: &[InstanceRef]) -> CloudResult<BatchResult> {
        if refs.is_empty() {
            return Ok(BatchResult::default());
        }
        let token = self.tokens.token(&self.http).await?;
        let requests = refs.iter().map(|instance| {
            let token = token.as_str();
            async move {
                let path = self.zonal_path(
                    instance.zone.as_deref(),
                    &format!("instances/{}", instance.name),
                );
                let outcome = self
                    .request_json::<Operation>(token, Method::DELETE, &path, vec![], None)
                    .await;
                if let Err(err) = &outcome {
                    warn!(instance = %instance.name, "delete failed: {}", err);
                }
                BatchItem {
                    name: instance.name.clone(),
                    outcome,
                }
            }
        });
        Ok(BatchResult {
            items: join_all(requests).await,
        })
    }

    async fn get_operation(&self, operation: &Operation) -> CloudResult<Operation> {
        let token = self.tokens.token(&self.http).await?;
        let path = match operation.zone.as_deref() {
            Some(zone) => self.zonal_path(
                Some(&crate::models::last_segment(zone)),
                &format!("operations/{}", operation.name),
            ),
            None => self.global_path(&self.project, &format!("operations/{}", operation.name)),
        };
        self.request_json(&token, Method::GET, &path, vec![], None)
            .await
    }
}

fn build_query_string(query: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in query {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ComputeClient {
        ComputeClient::new("demo-project", "us-east1-a", TokenSource::Static("tok".into()))
            .expect("client")
            .with_base_url(server.uri())
    }

    #[test]
    fn query_string_encodes_filter() {
        let query = vec![
            ("filter".to_string(), "name eq ^demo-.*".to_string()),
            ("maxResults".to_string(), "100".to_string()),
        ];
        let encoded = build_query_string(&query);
        assert_eq!(encoded, "filter=name+eq+%5Edemo-.*&maxResults=100");
    }

    #[tokio::test]
    async fn list_instances_follows_page_tokens() {
        let server = MockServer::start().await;
        let instances_path = "/projects/demo-project/zones/us-east1-a/instances";
        Mock::given(method("GET"))
            .and(path(instances_path))
            .and(query_param("pageToken", "page-2"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"name": "demo-2", "status": "RUNNING"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(instances_path))
            .and(query_param_is_missing("pageToken"))
            .and(query_param("filter", "name eq ^demo-.*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"name": "demo-0"}, {"name": "demo-1"}],
                "nextPageToken": "page-2"
            })))
            .mount(&server)
            .await;

        let instances = client(&server)
            .list_instances(Some("name eq ^demo-.*"))
            .await
            .expect("list");
        let names: Vec<_> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["demo-0", "demo-1", "demo-2"]);
    }

    #[tokio::test]
    async fn unauthorized_listing_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .mount(&server)
            .await;

        let err = client(&server).list_firewalls().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn server_error_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).list_images("debian-cloud").await.unwrap_err();
        assert!(matches!(err, CloudError::Api(_)));
    }

    #[tokio::test]
    async fn missing_token_file_is_auth_error() {
        let server = MockServer::start().await;
        let tokens = TokenSource::File(PathBuf::from("/nonexistent/fleet-manager/token"));
        let client = ComputeClient::new("p", "z", tokens)
            .expect("client")
            .with_base_url(server.uri());
        let err = client.list_disks().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn bulk_delete_reports_each_item() {
        let server = MockServer::start().await;
        let base = "/projects/demo-project/zones/us-east1-a/instances";
        Mock::given(method("DELETE"))
            .and(path(format!("{}/demo-1", base)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "op-delete-1",
                "status": "PENDING",
                "zone": "https://compute/projects/demo-project/zones/us-east1-a"
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{}/demo-2", base)))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let refs = vec![
            InstanceRef {
                name: "demo-1".into(),
                zone: None,
            },
            InstanceRef {
                name: "demo-2".into(),
                zone: None,
            },
        ];
        let result = client(&server)
            .bulk_delete_instances(&refs)
            .await
            .expect("batch");
        assert_eq!(result.succeeded(), vec!["demo-1"]);
        let failed = result.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "demo-2");
        assert_eq!(result.operations()[0].name, "op-delete-1");
    }

    #[tokio::test]
    async fn empty_bulk_insert_makes_no_calls() {
        let client = ComputeClient::new("p", "z", TokenSource::Static(String::new()))
            .expect("client")
            .with_base_url("http://127.0.0.1:9");
        let result = client.bulk_insert_instances(&[]).await.expect("batch");
        assert!(result.items.is_empty());
        assert!(result.failed().is_empty());
    }

    #[tokio::test]
    async fn zones_are_listed_per_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/demo-project/zones"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"name": "us-east1-a", "status": "DOWN"},
                    {"name": "us-east1-b", "status": "UP"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let zones = client(&server).list_zones().await.expect("zones");
        let names: Vec<_> = zones.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(names, vec!["us-east1-a", "us-east1-b"]);
        assert_eq!(zones[1].status.as_deref(), Some("UP"));
    }

    #[tokio::test]
    async fn zonal_operation_is_polled_in_its_zone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/demo-project/zones/us-east1-b/operations/op-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "op-9",
                "status": "DONE"
            })))
            .mount(&server)
            .await;

        let pending = Operation {
            name: "op-9".into(),
            status: Default::default(),
            operation_type: None,
            target_link: None,
            zone: Some("https://x/projects/demo-project/zones/us-east1-b".into()),
            error: None,
        };
        let op = client(&server).get_operation(&pending).await.expect("op");
        assert!(op.is_done());
    }
}
