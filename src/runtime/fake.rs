//! In-memory runtime for tests

use super::{ContainerRuntime, ImageHandle, InstanceHandle, ResolvedMount, RuntimeError, VolumeHandle};
use crate::plan::{BuildSpec, PortBinding, Readiness, ServiceSpec, VolumeSpec};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Runtime call recorded by [`FakeRuntime`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Build(String),
    Start(String),
    Ready(String),
    Stop(String),
    EnsureVolume(String),
    RemoveVolume(String),
}

/// Scriptable runtime that records every call
#[derive(Default)]
pub(crate) struct FakeRuntime {
    events: Mutex<Vec<Event>>,
    probes: Mutex<HashMap<String, u32>>,
    mounts: Mutex<HashMap<String, Vec<ResolvedMount>>>,
    fail_build: HashSet<String>,
    fail_start: HashSet<String>,
    fail_volume: HashSet<String>,
    never_ready: HashSet<String>,
    probe_errors: HashSet<String>,
    ready_after: HashMap<String, u32>,
    work: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_build(mut self, service: &str) -> Self {
        self.fail_build.insert(service.to_string());
        self
    }

    pub fn fail_start(mut self, service: &str) -> Self {
        self.fail_start.insert(service.to_string());
        self
    }

    pub fn fail_volume(mut self, volume: &str) -> Self {
        self.fail_volume.insert(volume.to_string());
        self
    }

    pub fn never_ready(mut self, service: &str) -> Self {
        self.never_ready.insert(service.to_string());
        self
    }

    pub fn probe_errors(mut self, service: &str) -> Self {
        self.probe_errors.insert(service.to_string());
        self
    }

    /// Report ready on the `attempts`-th probe
    pub fn ready_after(mut self, service: &str, attempts: u32) -> Self {
        self.ready_after.insert(service.to_string(), attempts);
        self
    }

    /// Simulated duration of builds and starts
    pub fn work(mut self, duration: Duration) -> Self {
        self.work = duration;
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    /// Position of the first matching event
    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    /// Highest number of builds and starts running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn mounts_of(&self, service: &str) -> Vec<ResolvedMount> {
        self.mounts
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    async fn simulate_work(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build(
        &self,
        service: &ServiceSpec,
        _build: &BuildSpec,
    ) -> Result<ImageHandle, RuntimeError> {
        self.record(Event::Build(service.name.clone()));
        self.simulate_work().await;
        if self.fail_build.contains(&service.name) {
            return Err(RuntimeError::Build(format!(
                "{}: Dockerfile not found",
                service.name
            )));
        }
        Ok(ImageHandle {
            reference: format!("fake/{}:latest", service.name),
        })
    }

    async fn start(
        &self,
        service: &ServiceSpec,
        _image: &ImageHandle,
        _ports: &[PortBinding],
        volumes: &[ResolvedMount],
    ) -> Result<InstanceHandle, RuntimeError> {
        self.record(Event::Start(service.name.clone()));
        self.simulate_work().await;
        if self.fail_start.contains(&service.name) {
            return Err(RuntimeError::Start(format!(
                "{}: port already allocated",
                service.name
            )));
        }
        self.mounts
            .lock()
            .unwrap()
            .insert(service.name.clone(), volumes.to_vec());
        Ok(InstanceHandle {
            id: format!("fake-{}", service.name),
            service: service.name.clone(),
        })
    }

    async fn probe_ready(
        &self,
        instance: &InstanceHandle,
        _readiness: &Readiness,
    ) -> Result<bool, RuntimeError> {
        let service = &instance.service;
        let attempt = {
            let mut probes = self.probes.lock().unwrap();
            let count = probes.entry(service.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if self.probe_errors.contains(service) {
            return Err(RuntimeError::Probe("connection refused".to_string()));
        }
        if self.never_ready.contains(service) {
            return Ok(false);
        }
        let needed = self.ready_after.get(service).copied().unwrap_or(1);
        if attempt >= needed {
            self.record(Event::Ready(service.clone()));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn stop(&self, instance: &InstanceHandle) -> Result<(), RuntimeError> {
        self.record(Event::Stop(instance.service.clone()));
        Ok(())
    }

    async fn ensure_volume(&self, volume: &VolumeSpec) -> Result<VolumeHandle, RuntimeError> {
        self.record(Event::EnsureVolume(volume.name.clone()));
        self.simulate_work().await;
        if self.fail_volume.contains(&volume.name) {
            return Err(RuntimeError::Volume(format!("{}: no space left", volume.name)));
        }
        Ok(VolumeHandle {
            name: format!("fake_{}", volume.name),
            key: volume.name.clone(),
            created: !volume.external,
            external: volume.external,
        })
    }

    async fn remove_volume(&self, volume: &VolumeHandle) -> Result<(), RuntimeError> {
        self.record(Event::RemoveVolume(volume.key.clone()));
        Ok(())
    }
}
