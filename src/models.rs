use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Terminated,
    #[default]
    #[serde(other)]
    Other,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "PROVISIONING",
            InstanceStatus::Staging => "STAGING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopping => "STOPPING",
            InstanceStatus::Terminated => "TERMINATED",
            InstanceStatus::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tags {
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

/// Ordered key/value pairs handed to the instance's startup environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

impl Metadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.push(MetadataItem {
            key: key.into(),
            value: value.into(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(rename = "type", default = "default_access_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "natIP", default, skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
}

fn default_access_type() -> String {
    "ONE_TO_ONE_NAT".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(rename = "networkIP", default, skip_serializing_if = "Option::is_none")]
    pub network_ip: Option<String>,
    #[serde(rename = "accessConfigs", default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "sourceImage")]
    pub source_image: String,
    #[serde(rename = "diskSizeGb", default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<String>,
}

/// A disk mount on an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedDisk {
    #[serde(rename = "type", default = "default_disk_type")]
    pub kind: String,
    #[serde(default = "default_disk_mode")]
    pub mode: String,
    #[serde(default)]
    pub boot: bool,
    #[serde(rename = "autoDelete", default)]
    pub auto_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "deviceName", default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(
        rename = "initializeParams",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub initialize_params: Option<InitializeParams>,
}

fn default_disk_type() -> String {
    "PERSISTENT".to_string()
}

fn default_disk_mode() -> String {
    "READ_WRITE".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub email: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// An instance as reported by the compute API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(rename = "machineType", default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(rename = "networkInterfaces", default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub disks: Vec<AttachedDisk>,
    #[serde(rename = "serviceAccounts", default)]
    pub service_accounts: Vec<ServiceAccount>,
    #[serde(rename = "selfLink", default)]
    pub self_link: Option<String>,
}

impl Instance {
    /// First NAT address found on the instance's interfaces.
    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces.iter().find_map(|interface| {
            interface
                .access_configs
                .first()
                .and_then(|config| config.nat_ip.as_deref())
        })
    }

    pub fn to_ref(&self) -> InstanceRef {
        InstanceRef {
            name: self.name.clone(),
            zone: self.zone.as_deref().map(last_segment),
        }
    }
}

/// Insert body for a new instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSpec {
    pub name: String,
    #[serde(rename = "machineType")]
    pub machine_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "tags_empty")]
    pub tags: Tags,
    #[serde(skip_serializing_if = "metadata_empty")]
    pub metadata: Metadata,
    #[serde(rename = "networkInterfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    pub disks: Vec<AttachedDisk>,
    #[serde(rename = "serviceAccounts", skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccount>,
}

fn tags_empty(tags: &Tags) -> bool {
    tags.items.is_empty()
}

fn metadata_empty(metadata: &Metadata) -> bool {
    metadata.items.is_empty()
}

/// Enough of an instance to delete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceRef {
    pub name: String,
    /// Short zone name; `None` means the client's zone.
    pub zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firewall {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(rename = "sourceRanges", default)]
    pub source_ranges: Vec<String>,
    #[serde(rename = "targetTags", default)]
    pub target_tags: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<FirewallRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "creationTimestamp", default)]
    pub creation_timestamp: Option<String>,
    #[serde(rename = "selfLink", default)]
    pub self_link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(rename = "sizeGb", default)]
    pub size_gb: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "sourceImage", default)]
    pub source_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    /// `UP` or `DOWN`.
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Done,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationErrorItem {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

/// Handle returned by the API for asynchronous mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(rename = "operationType", default)]
    pub operation_type: Option<String>,
    #[serde(rename = "targetLink", default)]
    pub target_link: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }

    /// Joined error messages of a finished operation, if any.
    pub fn error_message(&self) -> Option<String> {
        let errors = &self.error.as_ref()?.errors;
        if errors.is_empty() {
            return None;
        }
        Some(
            errors
                .iter()
                .map(|item| {
                    item.message
                        .clone()
                        .or_else(|| item.code.clone())
                        .unwrap_or_else(|| "unknown error".to_string())
                })
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// One page of a list response.
#[derive(Debug, Clone, Deserialize)]
pub struct ListPage<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(rename = "nextPageToken", default)]
    pub next_page_token: Option<String>,
}

/// Last path segment of a resource URL (`.../zones/us-east1-a` -> `us-east1-a`).
pub fn last_segment(value: &str) -> String {
    value.rsplit('/').next().unwrap_or(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_without_status_is_other() {
        let raw = r#"{"name": "demo-0"}"#;
        let instance: Instance = serde_json::from_str(raw).expect("parse");
        assert_eq!(instance.status, InstanceStatus::Other);
        assert_eq!(instance.external_ip(), None);
    }

    #[test]
    fn unknown_status_is_other() {
        let raw = r#"{"name": "demo-0", "status": "SUSPENDED"}"#;
        let instance: Instance = serde_json::from_str(raw).expect("parse");
        assert_eq!(instance.status, InstanceStatus::Other);
    }

    #[test]
    fn external_ip_from_first_access_config() {
        let raw = r#"{
            "name": "fractal-1",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-a",
            "status": "RUNNING",
            "networkInterfaces": [
                {"network": "global/networks/default", "accessConfigs": []},
                {"accessConfigs": [{"type": "ONE_TO_ONE_NAT", "natIP": "10.1.2.3"}]}
            ]
        }"#;
        let instance: Instance = serde_json::from_str(raw).expect("parse");
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.external_ip(), Some("10.1.2.3"));
        let reference = instance.to_ref();
        assert_eq!(reference.zone.as_deref(), Some("us-east1-a"));
    }

    #[test]
    fn spec_omits_empty_collections() {
        let spec = InstanceSpec {
            name: "demo-0".to_string(),
            machine_type: "zones/z/machineTypes/n1-standard-1".to_string(),
            description: None,
            tags: Tags::default(),
            metadata: Metadata::default(),
            network_interfaces: vec![],
            disks: vec![],
            service_accounts: vec![],
        };
        let value = serde_json::to_value(&spec).expect("json");
        assert!(value.get("tags").is_none());
        assert!(value.get("metadata").is_none());
        assert!(value.get("serviceAccounts").is_none());
        assert_eq!(value["machineType"], "zones/z/machineTypes/n1-standard-1");
    }

    #[test]
    fn operation_error_message_joins_items() {
        let raw = r#"{
            "name": "op-1",
            "status": "DONE",
            "error": {"errors": [{"code": "QUOTA_EXCEEDED", "message": "quota"}, {"code": "X"}]}
        }"#;
        let op: Operation = serde_json::from_str(raw).expect("parse");
        assert!(op.is_done());
        assert_eq!(op.error_message().as_deref(), Some("quota; X"));
    }
}
