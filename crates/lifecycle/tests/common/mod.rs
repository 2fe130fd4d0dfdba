//! Shared fixtures for the lifecycle integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use testbed_lifecycle::{
    ControllerError, EngineSettings, Handle, ResourceController, ResourceDescriptor, ResourceKind,
    ResourceStatus, RetryPolicy,
};

// =============================================================================
// Fake controller
// =============================================================================

/// Something the fake controller observed, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `create` was called.
    Create(String),
    /// `describe` reported `Ready` for the first time.
    Ready(String),
    /// `delete` was called.
    Delete(String),
    /// `describe` reported `Absent` after a delete.
    Absent(String),
}

#[derive(Debug)]
struct FakeResource {
    pending_polls: u32,
    ready_seen: bool,
    deleting: bool,
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    resources: HashMap<String, FakeResource>,
    create_errors: HashMap<String, VecDeque<ControllerError>>,
    delete_errors: HashMap<String, VecDeque<ControllerError>>,
    probe_errors: HashMap<String, VecDeque<ControllerError>>,
    ready_after: HashMap<String, u32>,
    never_ready: HashSet<String>,
    failed_status: HashSet<String>,
    never_absent: HashSet<String>,
    becoming_ready: HashSet<String>,
    max_becoming_ready: usize,
}

/// In-memory cloud with scripted failures.
///
/// New resources report `Pending` once and then `Ready`, unless scripted
/// otherwise. Deleted resources disappear on the next probe.
#[derive(Default)]
pub struct FakeController {
    inner: Mutex<Inner>,
}

impl FakeController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    /// Fail the next create call for `id` with `error`.
    pub fn fail_create(&self, id: &str, error: ControllerError) {
        self.with(|i| i.create_errors.entry(id.into()).or_default().push_back(error));
    }

    /// Fail the next delete call for `id` with `error`.
    pub fn fail_delete(&self, id: &str, error: ControllerError) {
        self.with(|i| i.delete_errors.entry(id.into()).or_default().push_back(error));
    }

    /// Fail the next status probe for `id` with `error`.
    pub fn fail_probe(&self, id: &str, error: ControllerError) {
        self.with(|i| i.probe_errors.entry(id.into()).or_default().push_back(error));
    }

    /// Report `Pending` `polls` times before `Ready`.
    pub fn ready_after(&self, id: &str, polls: u32) {
        self.with(|i| i.ready_after.insert(id.into(), polls));
    }

    /// Never report `Ready` for `id`.
    pub fn never_ready(&self, id: &str) {
        self.with(|i| i.never_ready.insert(id.into()));
    }

    /// Report `Failed` for `id` once created.
    pub fn failed_status(&self, id: &str) {
        self.with(|i| i.failed_status.insert(id.into()));
    }

    /// Keep reporting `Pending` for `id` after it was deleted.
    pub fn never_absent(&self, id: &str) {
        self.with(|i| i.never_absent.insert(id.into()));
    }

    /// Undo [`FakeController::never_ready`].
    pub fn becomes_ready(&self, id: &str) {
        self.with(|i| i.never_ready.remove(id));
    }

    /// Undo [`FakeController::never_absent`]: the pending deletion finishes.
    pub fn finishes_deleting(&self, id: &str) {
        self.with(|i| i.never_absent.remove(id));
    }

    /// Pretend `id` already exists and is ready.
    pub fn seed(&self, id: &str) {
        self.with(|i| {
            i.resources.insert(
                id.into(),
                FakeResource {
                    pending_polls: 0,
                    ready_seen: true,
                    deleting: false,
                },
            )
        });
    }

    pub fn events(&self) -> Vec<Event> {
        self.with(|i| i.events.clone())
    }

    /// Ids passed to `create`, in call order.
    pub fn creates(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Create(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Ids passed to `delete`, in call order.
    pub fn deletes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Delete(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Ids that currently exist.
    pub fn present(&self) -> HashSet<String> {
        self.with(|i| i.resources.keys().cloned().collect())
    }

    /// Most resources that were between their create call and readiness at
    /// the same time.
    pub fn max_concurrent(&self) -> usize {
        self.with(|i| i.max_becoming_ready)
    }
}

#[async_trait]
impl ResourceController for FakeController {
    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<Handle, ControllerError> {
        let id = descriptor.id.clone();
        self.with(|i| {
            i.events.push(Event::Create(id.clone()));
            if let Some(error) = i.create_errors.get_mut(&id).and_then(VecDeque::pop_front) {
                return Err(error);
            }

            let pending_polls = i.ready_after.get(&id).copied().unwrap_or(1);
            i.resources.entry(id.clone()).or_insert(FakeResource {
                pending_polls,
                ready_seen: false,
                deleting: false,
            });
            i.becoming_ready.insert(id.clone());
            i.max_becoming_ready = i.max_becoming_ready.max(i.becoming_ready.len());
            Ok(Handle::new(format!("h-{id}")))
        })
    }

    async fn delete(
        &self,
        descriptor: &ResourceDescriptor,
        _handle: &Handle,
    ) -> Result<(), ControllerError> {
        let id = descriptor.id.clone();
        self.with(|i| {
            i.events.push(Event::Delete(id.clone()));
            if let Some(error) = i.delete_errors.get_mut(&id).and_then(VecDeque::pop_front) {
                return Err(error);
            }
            match i.resources.get_mut(&id) {
                Some(resource) => {
                    resource.deleting = true;
                    Ok(())
                }
                None => Err(ControllerError::NotFound(id)),
            }
        })
    }

    async fn describe(
        &self,
        descriptor: &ResourceDescriptor,
        _handle: &Handle,
    ) -> Result<ResourceStatus, ControllerError> {
        let id = descriptor.id.clone();
        self.with(|i| {
            if let Some(error) = i.probe_errors.get_mut(&id).and_then(VecDeque::pop_front) {
                return Err(error);
            }

            let never_ready = i.never_ready.contains(&id);
            let failed = i.failed_status.contains(&id);
            let never_absent = i.never_absent.contains(&id);
            let Some(resource) = i.resources.get_mut(&id) else {
                return Err(ControllerError::NotFound(id));
            };

            if resource.deleting {
                if never_absent {
                    return Ok(ResourceStatus::Pending);
                }
                i.resources.remove(&id);
                i.events.push(Event::Absent(id));
                return Ok(ResourceStatus::Absent);
            }

            if failed {
                return Ok(ResourceStatus::Failed);
            }
            if never_ready || resource.pending_polls > 0 {
                resource.pending_polls = resource.pending_polls.saturating_sub(1);
                return Ok(ResourceStatus::Pending);
            }
            if !resource.ready_seen {
                resource.ready_seen = true;
                i.becoming_ready.remove(&id);
                i.events.push(Event::Ready(id));
            }
            Ok(ResourceStatus::Ready)
        })
    }
}

// =============================================================================
// Environments
// =============================================================================

/// Fast timings: 5s polls, one-minute budgets, 1s/2s/4s backoff.
pub fn settings(max_parallel: usize) -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        },
        max_parallel,
        probe_failure_tolerance: 2,
    }
}

pub fn resource(id: &str, kind: ResourceKind, depends_on: &[&str]) -> ResourceDescriptor {
    ResourceDescriptor::new(id, kind)
        .depends_on(depends_on.iter().copied())
        .with_timeouts(60, 60)
        .with_poll_interval(5)
}

/// Cluster, then subnet group, then database.
pub fn database_stack() -> Vec<ResourceDescriptor> {
    vec![
        resource("database", ResourceKind::ManagedDatabase, &["subnet-group"]),
        resource("cluster", ResourceKind::Cluster, &[]),
        resource("subnet-group", ResourceKind::SubnetGroup, &["cluster"]),
    ]
}

/// The full test environment: cluster, database, monitoring, policy layer.
pub fn full_environment() -> Vec<ResourceDescriptor> {
    vec![
        resource("cluster", ResourceKind::Cluster, &[]),
        resource("subnet-group", ResourceKind::SubnetGroup, &["cluster"]),
        resource("db-ingress", ResourceKind::SecurityRule, &["cluster"]),
        resource("database", ResourceKind::ManagedDatabase, &["subnet-group", "db-ingress"]),
        resource("monitoring", ResourceKind::ChartRelease, &["cluster"]),
        resource("policy-engine", ResourceKind::ChartRelease, &["cluster"]),
        resource("policy-reporter", ResourceKind::ChartRelease, &["monitoring", "policy-engine", "database"]),
    ]
}

/// Reproducible random DAG of chart releases: `r{i}` depends only on
/// lower-numbered resources, declared in shuffled order.
pub fn generated_environment(seed: &mut u64) -> Vec<ResourceDescriptor> {
    let mut below = |n: usize| {
        *seed ^= *seed << 13;
        *seed ^= *seed >> 7;
        *seed ^= *seed << 17;
        usize::try_from(*seed % n as u64).unwrap()
    };

    let size = 1 + below(10);
    let mut descriptors = Vec::with_capacity(size);
    for i in 0..size {
        let deps: Vec<String> = (0..i)
            .filter(|_| below(3) == 0)
            .map(|j| format!("r{j}"))
            .collect();
        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
        descriptors.push(resource(&format!("r{i}"), ResourceKind::ChartRelease, &deps));
    }
    for i in (1..descriptors.len()).rev() {
        let j = below(i + 1);
        descriptors.swap(i, j);
    }
    descriptors
}

/// Position of `event` in `events`; panics if absent.
pub fn position(events: &[Event], event: &Event) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("{event:?} not observed in {events:?}"))
}
