//! In-memory `ComputeApi` used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::compute::{BatchItem, BatchResult, ComputeApi};
use crate::error::{CloudError, CloudResult};
use crate::models::{
    Disk, Firewall, Image, Instance, InstanceRef, InstanceSpec, InstanceStatus, Operation,
    OperationError, OperationErrorItem, OperationStatus, Zone,
};

pub fn instance(name: &str, status: InstanceStatus) -> Instance {
    let mut instance: Instance =
        serde_json::from_value(serde_json::json!({ "name": name })).expect("instance");
    instance.status = status;
    instance.zone = Some("https://compute/projects/demo-project/zones/us-east1-a".to_string());
    instance
}

pub fn operation(name: &str, status: OperationStatus) -> Operation {
    Operation {
        name: name.to_string(),
        status,
        operation_type: None,
        target_link: None,
        zone: Some("us-east1-a".to_string()),
        error: None,
    }
}

pub struct FakeCompute {
    pub instances: Mutex<Vec<Instance>>,
    pub firewalls: Mutex<Vec<Firewall>>,
    pub images: Vec<Image>,
    /// Returned by every listing call when set.
    pub listing_error: Option<CloudError>,
    /// Instance names whose insert or delete is rejected.
    pub rejected: HashSet<String>,
    /// Operation names that finish with an error.
    pub failing_operations: HashSet<String>,
    /// Polls an operation needs before it reports DONE.
    pub polls_until_done: u32,
    polls: Mutex<HashMap<String, u32>>,
    pub mutations: Mutex<Vec<String>>,
}

impl FakeCompute {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self {
            instances: Mutex::new(instances),
            firewalls: Mutex::new(Vec::new()),
            images: Vec::new(),
            listing_error: None,
            rejected: HashSet::new(),
            failing_operations: HashSet::new(),
            polls_until_done: 0,
            polls: Mutex::new(HashMap::new()),
            mutations: Mutex::new(Vec::new()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances
            .lock()
            .expect("lock")
            .iter()
            .map(|instance| instance.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().expect("lock").len()
    }

    fn check_listing(&self) -> CloudResult<()> {
        match &self.listing_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    fn project(&self) -> &str {
        "demo-project"
    }

    fn zone(&self) -> &str {
        "us-east1-a"
    }

    async fn list_instances(&self, _filter: Option<&str>) -> CloudResult<Vec<Instance>> {
        self.check_listing()?;
        Ok(self.instances.lock().expect("lock").clone())
    }

    async fn list_firewalls(&self) -> CloudResult<Vec<Firewall>> {
        self.check_listing()?;
        Ok(self.firewalls.lock().expect("lock").clone())
    }

    async fn list_images(&self, _project: &str) -> CloudResult<Vec<Image>> {
        self.check_listing()?;
        Ok(self.images.clone())
    }

    async fn list_disks(&self) -> CloudResult<Vec<Disk>> {
        self.check_listing()?;
        Ok(Vec::new())
    }

    async fn list_zones(&self) -> CloudResult<Vec<Zone>> {
        self.check_listing()?;
        Ok(vec![Zone {
            name: "us-east1-a".to_string(),
            status: Some("UP".to_string()),
        }])
    }

    async fn insert_firewall(&self, firewall: &Firewall) -> CloudResult<Operation> {
        self.mutations
            .lock()
            .expect("lock")
            .push(format!("firewall:{}", firewall.name));
        self.firewalls.lock().expect("lock").push(firewall.clone());
        Ok(operation(
            &format!("op-firewall-{}", firewall.name),
            OperationStatus::Pending,
        ))
    }

    async fn bulk_insert_instances(&self, specs: &[InstanceSpec]) -> CloudResult<BatchResult> {
        let mut items = Vec::new();
        for spec in specs {
            self.mutations
                .lock()
                .expect("lock")
                .push(format!("insert:{}", spec.name));
            let outcome = if self.rejected.contains(&spec.name) {
                Err(CloudError::Api(format!("quota exceeded for {}", spec.name)))
            } else {
                self.instances
                    .lock()
                    .expect("lock")
                    .push(instance(&spec.name, InstanceStatus::Provisioning));
                Ok(operation(
                    &format!("op-insert-{}", spec.name),
                    OperationStatus::Pending,
                ))
            };
            items.push(BatchItem {
                name: spec.name.clone(),
                outcome,
            });
        }
        Ok(BatchResult { items })
    }

    async fn bulk_delete_instances(&self, refs: &[InstanceRef]) -> CloudResult<BatchResult> {
        let mut items = Vec::new();
        for reference in refs {
            self.mutations
                .lock()
                .expect("lock")
                .push(format!("delete:{}", reference.name));
            let outcome = if self.rejected.contains(&reference.name) {
                Err(CloudError::Api(format!("{} is busy", reference.name)))
            } else {
                self.instances
                    .lock()
                    .expect("lock")
                    .retain(|instance| instance.name != reference.name);
                Ok(operation(
                    &format!("op-delete-{}", reference.name),
                    OperationStatus::Running,
                ))
            };
            items.push(BatchItem {
                name: reference.name.clone(),
                outcome,
            });
        }
        Ok(BatchResult { items })
    }

    async fn get_operation(&self, pending: &Operation) -> CloudResult<Operation> {
        let mut polls = self.polls.lock().expect("lock");
        let count = polls.entry(pending.name.clone()).or_insert(0);
        *count += 1;
        let mut current = pending.clone();
        if *count > self.polls_until_done {
            current.status = OperationStatus::Done;
            if self.failing_operations.contains(&pending.name) {
                current.error = Some(OperationError {
                    errors: vec![OperationErrorItem {
                        code: Some("RESOURCE_NOT_READY".to_string()),
                        message: Some("disk still attached".to_string()),
                    }],
                });
            }
        } else {
            current.status = OperationStatus::Running;
        }
        Ok(current)
    }
}
