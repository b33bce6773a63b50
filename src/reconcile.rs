use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compute::{BatchResult, ComputeApi};
use crate::error::CloudResult;
use crate::models::{
    AccessConfig, AttachedDisk, Firewall, FirewallRule, InitializeParams, Instance, InstanceRef,
    InstanceSpec, Metadata, NetworkInterface, Operation, ServiceAccount, Tags,
};

pub const STARTUP_SCRIPT_KEY: &str = "startup-script";
pub const TILE_SERVERS_KEY: &str = "tile-servers";
pub const MACHINE_NUM_KEY: &str = "machine-num";
pub const FLEET_TAG_KEY: &str = "tag";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";
const OPEN_SOURCE_RANGE: &str = "0.0.0.0/0";

/// API filter selecting every instance that may belong to the fleet.
pub fn fleet_filter(prefix: &str) -> String {
    format!("name eq ^{}-.*", prefix)
}

pub fn instance_name(prefix: &str, index: usize, padding: usize) -> String {
    format!("{}-{:0width$}", prefix, index, width = padding)
}

fn member_suffix<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
}

/// Whether `name` is `prefix-<digits>`. Other names matching the listing
/// filter (for example a sibling fleet `prefix-extra-0`) are left alone.
pub fn is_fleet_member(name: &str, prefix: &str) -> bool {
    member_suffix(name, prefix).is_some()
}

/// Index of a fleet member regardless of zero padding: `demo-7` and `demo-007` are both 7.
pub fn member_index(name: &str, prefix: &str) -> Option<usize> {
    member_suffix(name, prefix).and_then(|suffix| suffix.parse().ok())
}

/// Everything needed to turn a member index into an insert body.
#[derive(Debug, Clone)]
pub struct FleetTemplate {
    pub prefix: String,
    pub name_padding: usize,
    pub project: String,
    pub zone: String,
    pub machine_type: String,
    pub image: String,
    pub network: String,
    pub tags: Vec<String>,
    /// Ordered; the startup script, when present, comes first.
    pub metadata: Vec<(String, String)>,
    pub tile_servers: Vec<String>,
    pub scopes: Vec<String>,
    pub description: Option<String>,
}

impl FleetTemplate {
    pub fn machine_type_url(&self) -> String {
        if self.machine_type.contains('/') {
            self.machine_type.clone()
        } else {
            format!("zones/{}/machineTypes/{}", self.zone, self.machine_type)
        }
    }

    pub fn source_image(&self) -> String {
        qualify_image(&self.project, &self.image)
    }

    pub fn network_url(&self) -> String {
        qualify_network(&self.network)
    }

    /// Insert body for the member at `index`; the instance learns its index
    /// through the `machine-num` metadata item.
    pub fn materialize(&self, index: usize) -> InstanceSpec {
        let name = instance_name(&self.prefix, index, self.name_padding);
        let mut metadata = Metadata::default();
        for (key, value) in &self.metadata {
            metadata.push(key.as_str(), value.as_str());
        }
        if !self.tile_servers.is_empty() {
            metadata.push(TILE_SERVERS_KEY, self.tile_servers.join(","));
        }
        metadata.push(MACHINE_NUM_KEY, index.to_string());
        if metadata.get(FLEET_TAG_KEY).is_none() {
            let tag = self.tags.first().unwrap_or(&self.prefix);
            metadata.push(FLEET_TAG_KEY, tag.as_str());
        }

        let service_accounts = if self.scopes.is_empty() {
            Vec::new()
        } else {
            vec![ServiceAccount {
                email: DEFAULT_SERVICE_ACCOUNT.to_string(),
                scopes: self.scopes.clone(),
            }]
        };

        InstanceSpec {
            name: name.clone(),
            machine_type: self.machine_type_url(),
            description: self.description.clone(),
            tags: Tags {
                items: self.tags.clone(),
            },
            metadata,
            network_interfaces: vec![NetworkInterface {
                network: Some(self.network_url()),
                network_ip: None,
                access_configs: vec![AccessConfig {
                    kind: "ONE_TO_ONE_NAT".to_string(),
                    name: Some("External NAT".to_string()),
                    nat_ip: None,
                }],
            }],
            disks: vec![AttachedDisk {
                kind: "PERSISTENT".to_string(),
                mode: "READ_WRITE".to_string(),
                boot: true,
                auto_delete: true,
                source: None,
                device_name: Some(name.clone()),
                initialize_params: Some(InitializeParams {
                    source_image: self.source_image(),
                    disk_size_gb: None,
                }),
            }],
            service_accounts,
        }
    }
}

pub fn qualify_network(network: &str) -> String {
    if network.contains('/') {
        network.to_string()
    } else {
        format!("global/networks/{}", network)
    }
}

fn qualify_image(project: &str, image: &str) -> String {
    if image.contains('/') {
        image.to_string()
    } else {
        format!("projects/{}/global/images/{}", project, image)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub to_add: Vec<InstanceSpec>,
    pub to_remove: Vec<InstanceRef>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Diff the desired fleet against the current listing. Pure; nothing is submitted.
///
/// Members are matched on their numeric index, so padding only shapes the
/// names of new instances. When two members share an index, the one carrying
/// the generated name is kept and the other removed.
pub fn reconcile(
    desired: usize,
    prefix: &str,
    current: &[Instance],
    template: &FleetTemplate,
) -> ReconcilePlan {
    let mut kept: HashMap<usize, &Instance> = HashMap::new();
    let mut to_remove = Vec::new();
    for instance in current {
        if !is_fleet_member(&instance.name, prefix) {
            continue;
        }
        let index = match member_index(&instance.name, prefix) {
            Some(index) if index < desired => index,
            _ => {
                to_remove.push(instance.to_ref());
                continue;
            }
        };
        match kept.entry(index) {
            Entry::Vacant(slot) => {
                slot.insert(instance);
            }
            Entry::Occupied(mut slot) => {
                if instance.name == instance_name(prefix, index, template.name_padding) {
                    to_remove.push(slot.insert(instance).to_ref());
                } else {
                    to_remove.push(instance.to_ref());
                }
            }
        }
    }

    let to_add = (0..desired)
        .filter(|index| !kept.contains_key(index))
        .map(|index| template.materialize(index))
        .collect();

    ReconcilePlan { to_add, to_remove }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub name: String,
    pub action: Action,
    pub error: String,
}

/// What a submitted plan actually did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub inserted: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<ItemFailure>,
    #[serde(skip)]
    pub operations: Vec<Operation>,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, action: Action, batch: &BatchResult) {
        self.operations.extend(batch.operations());
        let succeeded = batch.succeeded().into_iter().map(str::to_string);
        match action {
            Action::Insert => self.inserted.extend(succeeded),
            Action::Delete => self.deleted.extend(succeeded),
        }
        self.failed
            .extend(batch.failed().into_iter().map(|(name, err)| ItemFailure {
                name: name.to_string(),
                action,
                error: err.to_string(),
            }));
    }
}

/// Submit the plan's inserts, then its deletes. Item failures are reported,
/// not retried; a call that fails outright (auth, transport) aborts.
pub async fn apply(api: &dyn ComputeApi, plan: &ReconcilePlan) -> CloudResult<ApplyReport> {
    let mut report = ApplyReport::default();
    if plan.is_empty() {
        debug!("nothing to apply");
        return Ok(report);
    }

    let inserts = api.bulk_insert_instances(&plan.to_add).await?;
    report.record(Action::Insert, &inserts);
    let deletes = api.bulk_delete_instances(&plan.to_remove).await?;
    report.record(Action::Delete, &deletes);

    for failure in &report.failed {
        warn!(instance = %failure.name, action = ?failure.action, "{}", failure.error);
    }
    info!(
        inserted = report.inserted.len(),
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "applied fleet plan"
    );
    Ok(report)
}

/// Instances of the fleet named by `prefix`, as the API reports them.
pub async fn list_fleet(api: &dyn ComputeApi, prefix: &str) -> CloudResult<Vec<Instance>> {
    let mut instances = api.list_instances(Some(&fleet_filter(prefix))).await?;
    instances.retain(|instance| is_fleet_member(&instance.name, prefix));
    instances.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(instances)
}

/// List, diff and apply. A listing failure aborts before any mutation.
pub async fn scale(
    api: &dyn ComputeApi,
    desired: usize,
    template: &FleetTemplate,
) -> CloudResult<ApplyReport> {
    let current = list_fleet(api, &template.prefix).await?;
    let plan = reconcile(desired, &template.prefix, &current, template);
    info!(
        fleet = %template.prefix,
        zone = api.zone(),
        desired,
        current = current.len(),
        add = plan.to_add.len(),
        remove = plan.to_remove.len(),
        "reconciled fleet"
    );
    apply(api, &plan).await
}

/// Delete every member of the fleet; the same as scaling to zero without a template.
pub async fn teardown(api: &dyn ComputeApi, prefix: &str) -> CloudResult<ApplyReport> {
    let current = list_fleet(api, prefix).await?;
    let plan = ReconcilePlan {
        to_add: Vec::new(),
        to_remove: current.iter().map(Instance::to_ref).collect(),
    };
    info!(fleet = %prefix, remove = plan.to_remove.len(), "tearing down fleet");
    apply(api, &plan).await
}

/// `preferred` from `image_project` if the project lists it, otherwise `fallback`.
pub async fn resolve_image(
    api: &dyn ComputeApi,
    image_project: &str,
    preferred: Option<&str>,
    fallback: &str,
) -> CloudResult<String> {
    if let Some(preferred) = preferred {
        let images = api.list_images(image_project).await?;
        if images.iter().any(|image| image.name == preferred) {
            return Ok(qualify_image(image_project, preferred));
        }
        info!(
            image = preferred,
            project = image_project,
            "preferred image not found, using fallback"
        );
    }
    Ok(qualify_image(image_project, fallback))
}

/// Firewall admitting tcp on `ports` from anywhere to instances carrying `tags`.
pub fn fleet_firewall(name: &str, network: &str, tags: &[String], ports: &[String]) -> Firewall {
    Firewall {
        name: name.to_string(),
        description: Some(format!("Inbound traffic for {}", tags.join(", "))),
        network: Some(network.to_string()),
        source_ranges: vec![OPEN_SOURCE_RANGE.to_string()],
        target_tags: tags.to_vec(),
        allowed: vec![FirewallRule {
            ip_protocol: "tcp".to_string(),
            ports: ports.to_vec(),
        }],
    }
}

/// Insert `firewall` unless one with the same name exists. Never deletes.
pub async fn ensure_firewall(
    api: &dyn ComputeApi,
    firewall: &Firewall,
) -> CloudResult<Option<Operation>> {
    let existing = api.list_firewalls().await?;
    if existing.iter().any(|rule| rule.name == firewall.name) {
        debug!(firewall = %firewall.name, "firewall already present");
        return Ok(None);
    }
    info!(firewall = %firewall.name, "creating firewall");
    api.insert_firewall(firewall).await.map(Some)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WaitReport {
    pub completed: Vec<String>,
    pub failed: Vec<ItemFailure>,
    pub pending: Vec<String>,
}

/// Poll `operations` every `interval` until all are DONE or `deadline` passes.
/// Auth failures abort; other polling errors are retried on the next round.
pub async fn wait_for_operations(
    api: &dyn ComputeApi,
    operations: Vec<Operation>,
    interval: Duration,
    deadline: Duration,
) -> CloudResult<WaitReport> {
    let started = tokio::time::Instant::now();
    let mut report = WaitReport::default();
    let mut pending = operations;

    loop {
        let (done, waiting): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(Operation::is_done);
        for operation in done {
            match operation.error_message() {
                Some(error) => report.failed.push(ItemFailure {
                    name: operation.name,
                    action: action_of(operation.operation_type.as_deref()),
                    error,
                }),
                None => report.completed.push(operation.name),
            }
        }
        if waiting.is_empty() {
            break;
        }
        if started.elapsed() >= deadline {
            warn!(pending = waiting.len(), "gave up waiting for operations");
            report.pending = waiting.into_iter().map(|op| op.name).collect();
            break;
        }
        tokio::time::sleep(interval).await;

        let polled = join_all(waiting.iter().map(|op| api.get_operation(op))).await;
        let mut next = Vec::with_capacity(waiting.len());
        for (previous, result) in waiting.into_iter().zip(polled) {
            match result {
                Ok(current) => next.push(current),
                Err(err) if err.is_auth() => return Err(err),
                Err(err) => {
                    warn!(operation = %previous.name, "poll failed: {}", err);
                    next.push(previous);
                }
            }
        }
        pending = next;
    }
    Ok(report)
}

fn action_of(operation_type: Option<&str>) -> Action {
    match operation_type {
        Some(kind) if kind.eq_ignore_ascii_case("delete") => Action::Delete,
        _ => Action::Insert,
    }
}
