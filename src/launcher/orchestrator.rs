//! Dependency-ordered launch of a deployment plan

use super::probe::{wait_until_ready, ProbeOutcome, ProbePolicy};
use super::report::{FailureCause, LaunchReport, ServiceFailure};
use super::state::{LaunchState, LaunchTable};
use super::volumes::VolumeRegistry;
use crate::error::{LaunchError, Result};
use crate::plan::{DeploymentPlan, ImageSource, MountSource, ServiceSpec};
use crate::runtime::{ContainerRuntime, ImageHandle, ResolvedMount};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Launcher settings
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Services launched at once
    pub concurrency: usize,
    /// Default readiness policy, adjusted per service
    pub probe: ProbePolicy,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            probe: ProbePolicy::default(),
        }
    }
}

/// Brings a deployment plan up in dependency order.
///
/// A service launches only after every dependency reached `ready`, and
/// independent services launch concurrently up to the configured limit.
/// After the first failure nothing new is launched: launches already in
/// flight finish, descendants of the failed service are marked failed and
/// everything else stays pending.
pub struct Launcher {
    plan: Arc<DeploymentPlan>,
    runtime: Arc<dyn ContainerRuntime>,
    config: LauncherConfig,
    table: Arc<LaunchTable>,
    volumes: Arc<VolumeRegistry>,
}

impl Launcher {
    /// Create a launcher with every service pending
    pub fn new(
        plan: DeploymentPlan,
        runtime: Arc<dyn ContainerRuntime>,
        config: LauncherConfig,
    ) -> Self {
        let table = LaunchTable::new(plan.services.keys().map(String::as_str));
        let volumes = VolumeRegistry::new(&plan);
        Self {
            plan: Arc::new(plan),
            runtime,
            config,
            table: Arc::new(table),
            volumes: Arc::new(volumes),
        }
    }

    pub fn plan(&self) -> &DeploymentPlan {
        &self.plan
    }

    /// Live launch records
    pub fn table(&self) -> &LaunchTable {
        &self.table
    }

    /// Launch every service and wait for the run to settle.
    ///
    /// Service failures are reported through the returned [`LaunchReport`];
    /// an `Err` means the launcher itself could not proceed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<LaunchReport> {
        if self.table.in_state(LaunchState::Pending)?.len() != self.plan.services.len() {
            return Err(LaunchError::Internal(
                "launcher has already run".to_string(),
            ));
        }

        let started_at = Utc::now();
        let graph = &self.plan.graph;
        let mut waiting_on = graph.in_degrees();
        let mut frontier: VecDeque<String> = graph
            .nodes()
            .iter()
            .filter(|n| waiting_on.get(n.as_str()) == Some(&0))
            .cloned()
            .collect();

        let worker = Worker {
            plan: self.plan.clone(),
            runtime: self.runtime.clone(),
            table: self.table.clone(),
            volumes: self.volumes.clone(),
            probe: self.config.probe,
            permits: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            cancel: cancel.clone(),
            halt: CancellationToken::new(),
        };
        let mut tasks = JoinSet::new();

        tracing::info!(
            "Launching project {} ({} services, concurrency {})",
            self.plan.project,
            self.plan.services.len(),
            self.config.concurrency.max(1)
        );

        loop {
            if !worker.halt.is_cancelled() && !cancel.is_cancelled() {
                while let Some(name) = frontier.pop_front() {
                    let worker = worker.clone();
                    tasks.spawn(async move {
                        let outcome = worker.launch(&name).await;
                        (name, outcome)
                    });
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (name, outcome) =
                joined.map_err(|e| LaunchError::Internal(format!("launch task aborted: {}", e)))?;

            match outcome? {
                Outcome::Ready => {
                    for dependent in graph.dependents(&name) {
                        if let Some(count) = waiting_on.get_mut(dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                frontier.push_back(dependent.clone());
                            }
                        }
                    }
                }
                Outcome::Failed => {
                    worker.halt.cancel();
                    self.propagate_failure(&name)?;
                }
                Outcome::Cancelled | Outcome::Skipped => {}
            }
        }

        let services = self.table.snapshot()?;
        let failures: Vec<ServiceFailure> = services
            .iter()
            .filter(|r| r.state == LaunchState::Failed)
            .filter_map(|r| {
                r.cause.clone().map(|cause| ServiceFailure {
                    service: r.name.clone(),
                    cause,
                })
            })
            .collect();
        let skipped = self.table.in_state(LaunchState::Pending)?;
        let cancelled =
            cancel.is_cancelled() && services.iter().any(|r| r.state != LaunchState::Ready);

        if cancelled {
            tracing::warn!("Launch of {} cancelled", self.plan.project);
        } else if failures.is_empty() {
            tracing::info!("Project {} is ready", self.plan.project);
        } else {
            tracing::error!(
                "Launch of {} failed: {} failed, {} skipped",
                self.plan.project,
                failures.len(),
                skipped.len()
            );
        }

        Ok(LaunchReport {
            project: self.plan.project.clone(),
            started_at,
            finished_at: Utc::now(),
            services,
            failures,
            skipped,
            cancelled,
        })
    }

    /// Mark every pending descendant of `failed` as failed
    fn propagate_failure(&self, failed: &str) -> Result<()> {
        for descendant in self.plan.graph.descendants(failed) {
            let cause = FailureCause::DependencyFailed(failed.to_string());
            if self.table.fail(&descendant, cause)? {
                tracing::warn!(
                    "Service {} will not start: dependency {} failed",
                    descendant,
                    failed
                );
            }
        }
        Ok(())
    }

    /// Stop every started instance in reverse dependency order, then
    /// optionally remove the named volumes this run provisioned.
    ///
    /// Keeps going past individual failures and reports them together.
    pub async fn teardown(&self, remove_volumes: bool) -> Result<()> {
        let mut errors = Vec::new();

        for name in self.plan.graph.topological_order().iter().rev() {
            let record = self.table.record(name)?;
            let Some(instance) = record.instance else {
                continue;
            };

            tracing::info!("Stopping {}", instance);
            match self.runtime.stop(&instance).await {
                Ok(()) => {
                    if record.state != LaunchState::Stopped {
                        self.table.transition(name, LaunchState::Stopped)?;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to stop {}: {}", instance, e);
                    errors.push(format!("{}: {}", name, e.message()));
                }
            }
        }

        if remove_volumes {
            for volume in self.volumes.provisioned() {
                if volume.external {
                    continue;
                }
                tracing::info!("Removing volume {}", volume.name);
                if let Err(e) = self.runtime.remove_volume(&volume).await {
                    tracing::warn!("Failed to remove volume {}: {}", volume.name, e);
                    errors.push(format!("volume {}: {}", volume.key, e.message()));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LaunchError::Runtime(errors.join("; ")))
        }
    }
}

/// How one launch task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ready,
    Failed,
    Cancelled,
    /// Never started because the run halted first
    Skipped,
}

/// Why `bring_up` stopped early
enum Abort {
    Failed(FailureCause),
    Cancelled,
    Internal(LaunchError),
}

impl From<LaunchError> for Abort {
    fn from(e: LaunchError) -> Self {
        Abort::Internal(e)
    }
}

/// Shared state handed to each launch task
#[derive(Clone)]
struct Worker {
    plan: Arc<DeploymentPlan>,
    runtime: Arc<dyn ContainerRuntime>,
    table: Arc<LaunchTable>,
    volumes: Arc<VolumeRegistry>,
    probe: ProbePolicy,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    halt: CancellationToken,
}

impl Worker {
    async fn launch(&self, name: &str) -> Result<Outcome> {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Outcome::Skipped),
            _ = self.halt.cancelled() => return Ok(Outcome::Skipped),
            permit = self.permits.clone().acquire_owned() => permit,
        };
        let _permit = permit.map_err(|e| LaunchError::Internal(e.to_string()))?;

        let service = self
            .plan
            .service(name)
            .ok_or_else(|| LaunchError::ServiceNotFound(name.to_string()))?;

        match self.bring_up(service).await {
            Ok(()) => Ok(Outcome::Ready),
            Err(Abort::Failed(cause)) => {
                tracing::error!("Service {} failed: {}", name, cause);
                self.table.fail(name, cause)?;
                Ok(Outcome::Failed)
            }
            Err(Abort::Cancelled) => {
                tracing::info!("Launch of {} cancelled", name);
                self.table.stop_unsettled(name)?;
                Ok(Outcome::Cancelled)
            }
            Err(Abort::Internal(e)) => Err(e),
        }
    }

    async fn bring_up(&self, service: &ServiceSpec) -> std::result::Result<(), Abort> {
        let name = service.name.as_str();
        let mounts = self.resolve_mounts(service).await?;

        let image = match &service.source {
            ImageSource::Build(build) => {
                self.table.transition(name, LaunchState::Building)?;
                tracing::info!("Building image for service: {} from {}", name, build.context);
                let built = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Abort::Cancelled),
                    r = self.runtime.build(service, build) => r,
                };
                built.map_err(|e| Abort::Failed(FailureCause::Build(e.message())))?
            }
            ImageSource::Image(reference) => ImageHandle {
                reference: reference.to_string(),
            },
        };
        self.table.set_image(name, image.clone())?;

        if self.cancel.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        self.table.transition(name, LaunchState::Starting)?;
        tracing::info!("Starting service {} from {}", name, image.reference);
        let instance = self
            .runtime
            .start(service, &image, &service.ports, &mounts)
            .await
            .map_err(|e| Abort::Failed(FailureCause::Start(e.message())))?;
        self.table.set_instance(name, instance.clone())?;

        let policy = self.probe.with_overrides(&service.probe);
        tracing::debug!(
            "Waiting for {} ({}), up to {} attempts over {:?}",
            name,
            service.readiness,
            policy.max_attempts,
            policy.timeout
        );
        match wait_until_ready(
            self.runtime.as_ref(),
            &instance,
            &service.readiness,
            &policy,
            &self.cancel,
        )
        .await
        {
            ProbeOutcome::Ready { attempts } => {
                self.table.set_probe_attempts(name, attempts)?;
                self.table.transition(name, LaunchState::Ready)?;
                tracing::info!("Service {} is ready", name);
                Ok(())
            }
            ProbeOutcome::Exhausted { attempts, waited } => {
                self.table.set_probe_attempts(name, attempts)?;
                Err(Abort::Failed(FailureCause::ReadinessTimeout { attempts, waited }))
            }
            ProbeOutcome::Cancelled { attempts } => {
                self.table.set_probe_attempts(name, attempts)?;
                Err(Abort::Cancelled)
            }
        }
    }

    async fn resolve_mounts(
        &self,
        service: &ServiceSpec,
    ) -> std::result::Result<Vec<ResolvedMount>, Abort> {
        let mut mounts = Vec::with_capacity(service.volumes.len());
        for mount in &service.volumes {
            let source = match &mount.source {
                MountSource::Bind(path) => path.display().to_string(),
                MountSource::Volume(volume) => {
                    let ensured = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(Abort::Cancelled),
                        r = self.volumes.ensure(self.runtime.as_ref(), &self.plan, volume) => r,
                    };
                    ensured
                        .map_err(|e| {
                            Abort::Failed(FailureCause::Volume {
                                volume: volume.clone(),
                                message: e.message(),
                            })
                        })?
                        .name
                }
            };
            mounts.push(ResolvedMount {
                source,
                target: mount.target.clone(),
                read_only: mount.read_only,
            });
        }
        Ok(mounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;
    use crate::error::EXIT_RUNTIME_FAILURE;
    use crate::runtime::fake::{Event, FakeRuntime};
    use std::path::Path;
    use std::time::Duration;

    const STACK: &str = r#"
services:
  frontend:
    build:
      context: https://github.com/example/frontend.git#main
    ports:
      - "3000:3000"
    depends_on:
      - backend
  backend:
    build: ./backend
    ports:
      - "8000:8000"
    depends_on:
      - postgres
  postgres:
    image: postgres:16
    volumes:
      - pgdata:/var/lib/postgresql/data
volumes:
  pgdata:
"#;

    fn launcher(yaml: &str, runtime: &Arc<FakeRuntime>, concurrency: usize) -> Launcher {
        let config = ComposeParser::parse_str(yaml).unwrap();
        let plan = DeploymentPlan::from_compose(&config, "demo", Path::new("/srv/demo")).unwrap();
        let config = LauncherConfig {
            concurrency,
            probe: ProbePolicy {
                jitter: false,
                ..ProbePolicy::default()
            },
        };
        Launcher::new(plan, runtime.clone(), config)
    }

    fn start(s: &str) -> Event {
        Event::Start(s.to_string())
    }

    fn ready(s: &str) -> Event {
        Event::Ready(s.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependencies_ready_before_start() {
        let runtime = Arc::new(FakeRuntime::new().work(Duration::from_millis(50)));
        let launcher = launcher(STACK, &runtime, 4);

        let report = launcher.run(CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert!(report.skipped.is_empty());

        let pos = |e: Event| runtime.position(&e).unwrap();
        assert!(pos(ready("postgres")) < pos(start("backend")));
        assert!(pos(ready("backend")) < pos(start("frontend")));
        assert_eq!(runtime.count(&Event::Build("postgres".into())), 0);
        assert_eq!(runtime.count(&Event::Build("frontend".into())), 1);

        let backend = launcher.table().record("backend").unwrap();
        assert_eq!(backend.image.unwrap().reference, "fake/backend:latest");
        assert_eq!(backend.probe_attempts, 1);
        assert_eq!(
            runtime.mounts_of("postgres"),
            vec![ResolvedMount {
                source: "fake_pgdata".to_string(),
                target: "/var/lib/postgresql/data".to_string(),
                read_only: false,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_failure_marks_dependents() {
        let runtime = Arc::new(FakeRuntime::new().fail_build("backend"));
        let launcher = launcher(STACK, &runtime, 4);

        let report = launcher.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.state_of("postgres"), Some(LaunchState::Ready));
        assert_eq!(report.state_of("backend"), Some(LaunchState::Failed));
        assert_eq!(report.state_of("frontend"), Some(LaunchState::Failed));
        assert!(matches!(
            report.cause_of("backend"),
            Some(FailureCause::Build(_))
        ));
        assert_eq!(
            report.cause_of("frontend"),
            Some(&FailureCause::DependencyFailed("backend".to_string()))
        );
        assert_eq!(runtime.count(&start("frontend")), 0);
        assert_eq!(runtime.count(&Event::Build("frontend".into())), 0);

        let err = report.into_result().unwrap_err();
        assert_eq!(err.exit_code(), EXIT_RUNTIME_FAILURE);
        match err {
            LaunchError::Aggregate(aggregate) => assert_eq!(aggregate.failures.len(), 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_fails_service() {
        let runtime = Arc::new(FakeRuntime::new().never_ready("postgres"));
        let launcher = launcher(STACK, &runtime, 4);

        let report = launcher.run(CancellationToken::new()).await.unwrap();
        match report.cause_of("postgres") {
            Some(FailureCause::ReadinessTimeout { attempts, waited }) => {
                assert!(*attempts > 1);
                assert!(*waited <= Duration::from_secs(121));
            }
            other => panic!("unexpected cause {:?}", other),
        }
        assert_eq!(
            report.cause_of("frontend"),
            Some(&FailureCause::DependencyFailed("postgres".to_string()))
        );
        assert_eq!(runtime.count(&Event::Build("backend".into())), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_start_period_launches() {
        let yaml = r#"
services:
  db:
    image: postgres:16
    healthcheck:
      test: ["CMD", "pg_isready"]
      start_period: "18446744073709551615"
"#;
        let runtime = Arc::new(FakeRuntime::new().ready_after("db", 3));
        let launcher = launcher(yaml, &runtime, 1);

        let report = launcher.run(CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.state_of("db"), Some(LaunchState::Ready));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_volume_created_once() {
        let yaml = r#"
services:
  a:
    image: busybox
    volumes: ["shared:/data"]
  b:
    image: busybox
    volumes: ["shared:/data"]
  c:
    image: busybox
    volumes: ["shared:/data:ro"]
volumes:
  shared:
"#;
        let runtime = Arc::new(FakeRuntime::new().work(Duration::from_millis(100)));
        let launcher = launcher(yaml, &runtime, 3);

        let report = launcher.run(CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(runtime.count(&Event::EnsureVolume("shared".into())), 1);
        for service in ["a", "b", "c"] {
            assert_eq!(runtime.mounts_of(service)[0].source, "fake_shared");
        }
        assert!(runtime.mounts_of("c")[0].read_only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_failure() {
        let runtime = Arc::new(FakeRuntime::new().fail_volume("pgdata"));
        let launcher = launcher(STACK, &runtime, 4);

        let report = launcher.run(CancellationToken::new()).await.unwrap();
        assert!(matches!(
            report.cause_of("postgres"),
            Some(FailureCause::Volume { volume, .. }) if volume == "pgdata"
        ));
        assert_eq!(runtime.count(&start("postgres")), 0);
        assert_eq!(report.failures.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit() {
        let yaml = r#"
services:
  s1: { image: busybox }
  s2: { image: busybox }
  s3: { image: busybox }
  s4: { image: busybox }
  s5: { image: busybox }
  s6: { image: busybox }
"#;
        let runtime = Arc::new(FakeRuntime::new().work(Duration::from_millis(50)));
        let launcher = launcher(yaml, &runtime, 2);

        let report = launcher.run(CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(runtime.peak_concurrency(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_halts_new_launches() {
        let yaml = r#"
services:
  a:
    image: busybox
  b:
    image: busybox
  c:
    image: busybox
    depends_on: [b]
"#;
        let runtime = Arc::new(
            FakeRuntime::new()
                .work(Duration::from_millis(100))
                .fail_start("a")
                .ready_after("b", 2),
        );
        let launcher = launcher(yaml, &runtime, 4);

        let report = launcher.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.state_of("a"), Some(LaunchState::Failed));
        // in flight when `a` failed, allowed to finish
        assert_eq!(report.state_of("b"), Some(LaunchState::Ready));
        assert_eq!(report.state_of("c"), Some(LaunchState::Pending));
        assert_eq!(report.skipped, vec!["c"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(runtime.count(&start("c")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let runtime = Arc::new(FakeRuntime::new().never_ready("postgres"));
        let launcher = launcher(STACK, &runtime, 4);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let report = launcher.run(cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.state_of("postgres"), Some(LaunchState::Stopped));
        assert_eq!(report.skipped, vec!["frontend", "backend"]);
        // the container is left in place for teardown
        let postgres = launcher.table().record("postgres").unwrap();
        assert!(postgres.instance.is_some());
        assert_eq!(runtime.count(&Event::Stop("postgres".into())), 0);

        let err = report.into_result().unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_CANCELLED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_reverse_order() {
        let runtime = Arc::new(FakeRuntime::new());
        let launcher = launcher(STACK, &runtime, 4);
        launcher.run(CancellationToken::new()).await.unwrap();

        launcher.teardown(true).await.unwrap();
        let stops: Vec<Event> = runtime
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Stop(_)))
            .collect();
        assert_eq!(
            stops,
            vec![
                Event::Stop("frontend".into()),
                Event::Stop("backend".into()),
                Event::Stop("postgres".into()),
            ]
        );
        assert_eq!(runtime.count(&Event::RemoveVolume("pgdata".into())), 1);
        assert_eq!(
            launcher.table().in_state(LaunchState::Stopped).unwrap().len(),
            3
        );
    }

    #[test]
    fn test_cycle_rejected_before_launch() {
        let yaml = r#"
services:
  frontend:
    build: ./frontend
    depends_on: [backend, fourth]
  backend:
    build: ./backend
    depends_on: [postgres]
  postgres:
    image: postgres:16
  fourth:
    image: busybox
    depends_on: [frontend]
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();

        let err = DeploymentPlan::from_compose(&config, "demo", Path::new("/srv/demo"));
        match err {
            Err(crate::error::ValidationError::CyclicDependency { cycle }) => {
                assert!(cycle.contains(&"frontend".to_string()));
                assert!(cycle.contains(&"fourth".to_string()));
            }
            other => panic!("expected a cycle, got {:?}", other.map(|p| p.project)),
        }
    }

    #[tokio::test]
    async fn test_run_twice_rejected() {
        let runtime = Arc::new(FakeRuntime::new());
        let launcher = launcher(STACK, &runtime, 4);
        launcher.run(CancellationToken::new()).await.unwrap();
        assert!(matches!(
            launcher.run(CancellationToken::new()).await,
            Err(LaunchError::Internal(_))
        ));
    }
}
