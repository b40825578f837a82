//! Runtime adapter driving the `docker` CLI

use super::{
    ContainerRuntime, ImageHandle, InstanceHandle, ResolvedMount, RuntimeError, VolumeHandle,
};
use crate::plan::{BuildContext, BuildSpec, ImageSource, PortBinding, Readiness, ServiceSpec, VolumeSpec};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::OnceCell;

const PROJECT_LABEL: &str = "com.docker.compose.project";
const SERVICE_LABEL: &str = "com.docker.compose.service";
const RUN_LABEL: &str = "io.rune-launch.run";

/// Lines of stderr kept in error messages
const STDERR_TAIL: usize = 20;

/// Adapter that shells out to a docker-compatible CLI
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    /// CLI binary
    binary: String,
    /// Project name used to scope resource names
    project: String,
    /// Identifier of this launch, labelled on every container
    run_id: String,
    /// Upper bound for `docker build`
    build_timeout: Duration,
    /// Upper bound for every other command
    command_timeout: Duration,
    /// Upper bound for one TCP readiness connect
    connect_timeout: Duration,
    /// Set once the project network exists
    network: Arc<OnceCell<()>>,
}

/// Subset of `docker inspect` `.State`
#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Health", default)]
    health: Option<ContainerHealth>,
}

#[derive(Debug, Deserialize)]
struct ContainerHealth {
    #[serde(rename = "Status")]
    status: String,
}

impl DockerRuntime {
    /// Create an adapter for a project
    pub fn new(project: &str) -> Self {
        Self {
            binary: "docker".to_string(),
            project: project.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            build_timeout: Duration::from_secs(600),
            command_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            network: Arc::new(OnceCell::new()),
        }
    }

    /// Use a different CLI binary (e.g. `podman`)
    pub fn binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    /// Set the build timeout
    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    /// Set the timeout for non-build commands
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Container name for a service
    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{}-1", self.project, service)
    }

    /// Tag given to images built for a service
    pub fn image_tag(&self, service: &str) -> String {
        format!("{}-{}:latest", self.project, service)
    }

    /// Network shared by all services of the project
    pub fn network_name(&self) -> String {
        format!("{}_default", self.project)
    }

    /// Runtime name of a volume
    pub fn volume_name(&self, volume: &VolumeSpec) -> String {
        volume
            .runtime_name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.project, volume.name))
    }

    /// Handle for a service's container, whether or not this process started it
    pub fn instance_handle(&self, service: &str) -> InstanceHandle {
        InstanceHandle {
            id: self.container_name(service),
            service: service.to_string(),
        }
    }

    /// Handle for a declared volume, whether or not this process created it
    pub fn volume_handle(&self, volume: &VolumeSpec) -> VolumeHandle {
        VolumeHandle {
            name: self.volume_name(volume),
            key: volume.name.clone(),
            created: false,
            external: volume.external,
        }
    }

    /// Arguments for `docker build`
    pub fn build_args(&self, service: &ServiceSpec, build: &BuildSpec) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-t".to_string(),
            self.image_tag(&service.name),
            "--label".to_string(),
            format!("{}={}", PROJECT_LABEL, self.project),
        ];

        if let Some(ref dockerfile) = build.dockerfile {
            args.push("-f".to_string());
            args.push(dockerfile.clone());
        }
        if let Some(ref target) = build.target {
            args.push("--target".to_string());
            args.push(target.clone());
        }
        for (key, value) in &build.args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(match build.context {
            BuildContext::Remote(ref url) => url.clone(),
            BuildContext::Local(ref path) => path.display().to_string(),
        });
        args
    }

    /// Arguments for `docker run`
    pub fn run_args(
        &self,
        service: &ServiceSpec,
        image: &ImageHandle,
        ports: &[PortBinding],
        volumes: &[ResolvedMount],
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name(&service.name),
            "--label".to_string(),
            format!("{}={}", PROJECT_LABEL, self.project),
            "--label".to_string(),
            format!("{}={}", SERVICE_LABEL, service.name),
            "--label".to_string(),
            format!("{}={}", RUN_LABEL, self.run_id),
            "--network".to_string(),
            self.network_name(),
            "--network-alias".to_string(),
            service.name.clone(),
        ];

        for port in ports {
            let host = match port.host_ip {
                Some(ref ip) => format!("{}:{}", ip, port.host),
                None => port.host.to_string(),
            };
            args.push("-p".to_string());
            args.push(format!("{}:{}/{}", host, port.container, port.protocol));
        }
        for (key, value) in &service.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for port in &service.exposed_ports {
            args.push("--expose".to_string());
            args.push(port.to_string());
        }
        for mount in volumes {
            args.push("-v".to_string());
            let mut spec = format!("{}:{}", mount.source, mount.target);
            if mount.read_only {
                spec.push_str(":ro");
            }
            args.push(spec);
        }

        args.push("--restart".to_string());
        args.push(
            match service.restart {
                crate::plan::RestartPolicy::Never => "no",
                crate::plan::RestartPolicy::Always => "always",
                crate::plan::RestartPolicy::OnFailure => "on-failure",
            }
            .to_string(),
        );

        if let Some(ref hc) = service.healthcheck {
            args.push("--health-cmd".to_string());
            args.push(hc.command.clone());
            let durations = [
                ("--health-interval", hc.interval),
                ("--health-timeout", hc.timeout),
                ("--health-start-period", hc.start_period),
            ];
            for (flag, value) in durations {
                if let Some(d) = value {
                    args.push(flag.to_string());
                    args.push(format!("{}ms", d.as_millis()));
                }
            }
            if let Some(retries) = hc.retries {
                args.push("--health-retries".to_string());
                args.push(retries.to_string());
            }
        }

        args.push(image.reference.clone());
        if let Some(ref command) = service.command {
            args.extend(command.iter().cloned());
        }
        args
    }

    /// Run the CLI with a timeout. The child is killed if the future is dropped.
    async fn exec(&self, args: &[String], timeout: Duration) -> Result<Output, RuntimeError> {
        tracing::debug!("{} {}", self.binary, args.join(" "));

        let child = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.map_err(|e| {
                RuntimeError::Command(format!("failed to run {}: {}", self.binary, e))
            }),
            Err(_) => Err(RuntimeError::Command(format!(
                "{} {} timed out after {:?}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                timeout
            ))),
        }
    }

    /// Create the project network unless it already exists
    pub async fn ensure_network(&self) -> Result<(), RuntimeError> {
        self.network
            .get_or_try_init(|| async {
                let name = self.network_name();
                let inspect = ["network".to_string(), "inspect".to_string(), name.clone()];
                if self.exec(&inspect, self.command_timeout).await?.status.success() {
                    return Ok(());
                }

                let create = [
                    "network".to_string(),
                    "create".to_string(),
                    "--label".to_string(),
                    format!("{}={}", PROJECT_LABEL, self.project),
                    name.clone(),
                ];
                let output = self.exec(&create, self.command_timeout).await?;
                if !output.status.success() {
                    return Err(RuntimeError::Command(failure_message(&output)));
                }
                tracing::info!("Created network {}", name);
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Remove the project network; a missing network is not an error
    pub async fn remove_network(&self) -> Result<(), RuntimeError> {
        let args = ["network".to_string(), "rm".to_string(), self.network_name()];
        let output = self.exec(&args, self.command_timeout).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if output.status.success() || stderr.contains("not found") {
            Ok(())
        } else {
            Err(RuntimeError::Command(failure_message(&output)))
        }
    }

    /// Check that the engine answers, returning its server version
    pub async fn ping(&self) -> Result<String, RuntimeError> {
        let args = [
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        let output = self.exec(&args, self.command_timeout).await?;
        if !output.status.success() {
            return Err(RuntimeError::Command(failure_message(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn inspect_state(&self, id: &str) -> Result<Option<ContainerState>, RuntimeError> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .State}}".to_string(),
            id.to_string(),
        ];
        let output = self.exec(&args, self.command_timeout).await?;
        if !output.status.success() {
            return Ok(None);
        }

        serde_json::from_slice(&output.stdout)
            .map(Some)
            .map_err(|e| RuntimeError::Probe(format!("unreadable inspect output for {}: {}", id, e)))
    }
}

/// Last lines of stderr, or the exit status when stderr is empty
fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return format!("exited with {}", output.status);
    }
    lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n")
}

fn is_missing(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
    stderr.contains("no such container") || stderr.contains("no such volume")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build(
        &self,
        service: &ServiceSpec,
        build: &BuildSpec,
    ) -> Result<ImageHandle, RuntimeError> {
        let args = self.build_args(service, build);
        tracing::debug!("docker build for {} from {}", service.name, build.context);

        let output = self
            .exec(&args, self.build_timeout)
            .await
            .map_err(|e| RuntimeError::Build(e.to_string()))?;
        if !output.status.success() {
            return Err(RuntimeError::Build(failure_message(&output)));
        }

        Ok(ImageHandle {
            reference: self.image_tag(&service.name),
        })
    }

    async fn start(
        &self,
        service: &ServiceSpec,
        image: &ImageHandle,
        ports: &[PortBinding],
        volumes: &[ResolvedMount],
    ) -> Result<InstanceHandle, RuntimeError> {
        let handle = self.instance_handle(&service.name);
        self.ensure_network()
            .await
            .map_err(|e| RuntimeError::Start(e.to_string()))?;

        // a leftover container from an earlier run would hold the name
        let rm = ["rm".to_string(), "-f".to_string(), handle.id.clone()];
        if let Err(e) = self.exec(&rm, self.command_timeout).await {
            tracing::warn!("Could not clear stale container {}: {}", handle.id, e);
        }

        let args = self.run_args(service, image, ports, volumes);
        let timeout = match service.source {
            // docker run may have to pull the image first
            ImageSource::Image(_) => self.build_timeout,
            ImageSource::Build(_) => self.command_timeout,
        };
        let output = self
            .exec(&args, timeout)
            .await
            .map_err(|e| RuntimeError::Start(e.to_string()))?;
        if !output.status.success() {
            return Err(RuntimeError::Start(failure_message(&output)));
        }

        Ok(handle)
    }

    async fn probe_ready(
        &self,
        instance: &InstanceHandle,
        readiness: &Readiness,
    ) -> Result<bool, RuntimeError> {
        match readiness {
            Readiness::Tcp(addr) => {
                let connect = TcpStream::connect(*addr);
                Ok(matches!(
                    tokio::time::timeout(self.connect_timeout, connect).await,
                    Ok(Ok(_))
                ))
            }
            Readiness::Running => Ok(self
                .inspect_state(&instance.id)
                .await?
                .is_some_and(|s| s.running)),
            Readiness::Healthcheck => {
                let Some(state) = self.inspect_state(&instance.id).await? else {
                    return Ok(false);
                };
                match state.health {
                    Some(health) if health.status == "unhealthy" => Err(RuntimeError::Probe(
                        format!("{} reports unhealthy", instance.id),
                    )),
                    Some(health) => Ok(health.status == "healthy"),
                    None => Ok(state.running),
                }
            }
        }
    }

    async fn stop(&self, instance: &InstanceHandle) -> Result<(), RuntimeError> {
        let args = ["rm".to_string(), "-f".to_string(), instance.id.clone()];
        let output = self
            .exec(&args, self.command_timeout)
            .await
            .map_err(|e| RuntimeError::Stop(e.to_string()))?;

        if output.status.success() || is_missing(&output) {
            Ok(())
        } else {
            Err(RuntimeError::Stop(failure_message(&output)))
        }
    }

    async fn ensure_volume(&self, volume: &VolumeSpec) -> Result<VolumeHandle, RuntimeError> {
        let mut handle = self.volume_handle(volume);

        let inspect = ["volume".to_string(), "inspect".to_string(), handle.name.clone()];
        let output = self
            .exec(&inspect, self.command_timeout)
            .await
            .map_err(|e| RuntimeError::Volume(e.to_string()))?;
        if output.status.success() {
            return Ok(handle);
        }
        if volume.external {
            return Err(RuntimeError::Volume(format!(
                "external volume {} not found",
                handle.name
            )));
        }

        let mut args = vec!["volume".to_string(), "create".to_string()];
        if let Some(ref driver) = volume.driver {
            args.push("--driver".to_string());
            args.push(driver.clone());
        }
        for (key, value) in &volume.driver_opts {
            args.push("--opt".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &volume.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("--label".to_string());
        args.push(format!("{}={}", PROJECT_LABEL, self.project));
        args.push(handle.name.clone());

        let output = self
            .exec(&args, self.command_timeout)
            .await
            .map_err(|e| RuntimeError::Volume(e.to_string()))?;
        if !output.status.success() {
            return Err(RuntimeError::Volume(failure_message(&output)));
        }

        tracing::info!("Created volume {}", handle.name);
        handle.created = true;
        Ok(handle)
    }

    async fn remove_volume(&self, volume: &VolumeHandle) -> Result<(), RuntimeError> {
        if volume.external {
            tracing::debug!("Leaving external volume {} in place", volume.name);
            return Ok(());
        }

        let args = ["volume".to_string(), "rm".to_string(), volume.name.clone()];
        let output = self
            .exec(&args, self.command_timeout)
            .await
            .map_err(|e| RuntimeError::Volume(e.to_string()))?;

        if output.status.success() || is_missing(&output) {
            Ok(())
        } else {
            Err(RuntimeError::Volume(failure_message(&output)))
        }
    }
}
