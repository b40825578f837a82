//! Resolution of a compose descriptor into a validated deployment plan

use super::duration::parse_duration;
use super::graph::DependencyGraph;
use super::spec::{
    BuildContext, BuildSpec, HealthcheckSpec, ImageRef, ImageSource, MountBinding, MountSource,
    PortBinding, ProbeOverrides, Protocol, Readiness, RestartPolicy, ServiceSpec, VolumeSpec,
};
use crate::compose::config::{
    BuildConfig, CommandConfig, ComposeConfig, EnvironmentConfig, HealthcheckConfig,
    HealthcheckTest, PortConfig, ScalarValue, ServiceConfig, VolumeMount,
};
use crate::compose::ComposeParser;
use crate::error::{LaunchError, ValidationError};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Validated, immutable set of services and volumes plus their dependency graph
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    /// Project name, used to scope runtime resource names
    pub project: String,
    /// Directory the descriptor was loaded from
    pub working_dir: PathBuf,
    /// Services in descriptor order
    pub services: IndexMap<String, ServiceSpec>,
    /// Named volumes in descriptor order
    pub volumes: IndexMap<String, VolumeSpec>,
    /// Dependency graph over `services`
    pub graph: DependencyGraph,
}

impl DeploymentPlan {
    /// Resolve and validate a parsed descriptor.
    ///
    /// Fails on the first problem found; nothing is launched on failure.
    pub fn from_compose(
        config: &ComposeConfig,
        project: &str,
        working_dir: &Path,
    ) -> Result<Self, ValidationError> {
        let project = normalize_project_name(project)?;

        let volumes: IndexMap<String, VolumeSpec> = config
            .volumes
            .iter()
            .map(|(name, volume)| {
                let mut spec = VolumeSpec::new(name);
                if let Some(v) = volume {
                    spec.runtime_name = v.name.clone();
                    spec.driver = v.driver.clone();
                    spec.driver_opts = v.driver_opts.clone().unwrap_or_default();
                    spec.labels = v.labels.as_ref().map(|l| l.to_map()).unwrap_or_default();
                    spec.external = v.external.as_ref().is_some_and(|e| e.is_external());
                    if let Some(crate::compose::config::ExternalConfig::Named { name }) = &v.external {
                        spec.runtime_name = Some(name.clone());
                    }
                }
                (name.clone(), spec)
            })
            .collect();

        let mut services = IndexMap::new();
        for (name, service) in &config.services {
            let spec = resolve_service(name, service, working_dir)?;
            for volume in spec.volume_names() {
                if !volumes.contains_key(volume) {
                    return Err(ValidationError::UndefinedVolume {
                        service: name.clone(),
                        volume: volume.to_string(),
                    });
                }
            }
            services.insert(name.clone(), spec);
        }

        check_host_ports(&services)?;
        let graph = DependencyGraph::build(&services)?;

        Ok(Self {
            project,
            working_dir: working_dir.to_path_buf(),
            services,
            volumes,
            graph,
        })
    }

    /// Look up a service
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// Look up a volume
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.get(name)
    }

    /// Services that mount a given volume
    pub fn services_using(&self, volume: &str) -> Vec<&str> {
        self.services
            .values()
            .filter(|s| s.volume_names().any(|v| v == volume))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Load, merge and resolve descriptor files.
    ///
    /// With no explicit files the default descriptor in `dir` is used.
    /// Relative paths resolve against the first file's directory. The
    /// project name is `project`, else the descriptor's `name`, else the
    /// directory name.
    pub fn load(files: &[PathBuf], project: Option<&str>, dir: &Path) -> crate::Result<Self> {
        let files = ComposeParser::resolve_files(files, dir)?;
        for file in &files {
            if !file.exists() {
                return Err(LaunchError::ComposeNotFound(file.clone()));
            }
        }
        let config = ComposeParser::parse_files(&files)?;

        let working_dir = files
            .first()
            .and_then(|f| f.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dir.to_path_buf());
        let working_dir = if working_dir.is_absolute() {
            working_dir
        } else {
            dir.join(working_dir)
        };

        let project = match (project, config.name.as_deref()) {
            (Some(p), _) => p.to_string(),
            (None, Some(n)) => n.to_string(),
            (None, None) => working_dir
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("default")
                .to_string(),
        };

        tracing::debug!(
            "Resolving project {} from {} file(s) in {}",
            project,
            files.len(),
            working_dir.display()
        );
        Ok(Self::from_compose(&config, &project, &working_dir)?)
    }
}

/// Lowercase and keep only `[a-z0-9_-]`, as container runtimes expect
pub fn normalize_project_name(name: &str) -> Result<String, ValidationError> {
    let normalized: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    match normalized.chars().next() {
        Some(c) if c.is_ascii_alphanumeric() => Ok(normalized),
        _ => Err(ValidationError::InvalidProjectName(name.to_string())),
    }
}

fn resolve_service(
    name: &str,
    service: &ServiceConfig,
    working_dir: &Path,
) -> Result<ServiceSpec, ValidationError> {
    let source = match (&service.image, &service.build) {
        (Some(_), Some(_)) => return Err(ValidationError::ConflictingSource(name.to_string())),
        (None, None) => return Err(ValidationError::MissingSource(name.to_string())),
        (Some(image), None) => ImageSource::Image(ImageRef::parse(image)),
        (None, Some(build)) => ImageSource::Build(resolve_build(build, working_dir)),
    };

    let mut ports = Vec::new();
    let mut exposed_ports = BTreeSet::new();
    for port in service.ports.iter().flatten() {
        let (published, unpublished) = parse_port(name, port)?;
        if let Some(bad) = published.iter().find(|p| !p.is_wildcard() && p.host_addr().is_none()) {
            return Err(ValidationError::InvalidPort {
                service: name.to_string(),
                value: bad.host_ip.clone().unwrap_or_default(),
            });
        }
        ports.extend(published);
        exposed_ports.extend(unpublished);
    }
    for port in service.expose.iter().flatten() {
        let value = port.to_string();
        let container = value
            .split('/')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| ValidationError::InvalidPort {
                service: name.to_string(),
                value: value.clone(),
            })?;
        exposed_ports.insert(container);
    }

    let volumes = service
        .volumes
        .iter()
        .flatten()
        .map(|m| parse_mount(name, m, working_dir))
        .collect::<Result<Vec<_>, _>>()?;

    let restart = match service.restart.as_deref() {
        None => RestartPolicy::Never,
        Some(value) => RestartPolicy::parse(value).ok_or_else(|| {
            ValidationError::InvalidRestartPolicy {
                service: name.to_string(),
                value: value.to_string(),
            }
        })?,
    };

    if let Some(crate::compose::config::DependsOnConfig::Map(map)) = &service.depends_on {
        for (dep, cond) in map {
            if cond.condition == "service_completed_successfully" {
                tracing::warn!(
                    "Service '{}': condition '{}' on '{}' is treated as readiness",
                    name,
                    cond.condition,
                    dep
                );
            }
        }
    }

    let healthcheck = service
        .healthcheck
        .as_ref()
        .map(resolve_healthcheck)
        .transpose()?
        .flatten();

    let readiness = if healthcheck.is_some() {
        Readiness::Healthcheck
    } else if let Some(port) = ports.iter().find(|p| p.protocol == Protocol::Tcp) {
        Readiness::Tcp(port.local_addr())
    } else {
        Readiness::Running
    };

    let probe = match healthcheck {
        Some(ref hc) => ProbeOverrides {
            base_delay: hc.interval,
            max_attempts: hc.retries.map(|r| r.max(1)),
            extra_budget: hc.start_period,
        },
        None => ProbeOverrides::default(),
    };

    Ok(ServiceSpec {
        name: name.to_string(),
        source,
        command: service.command.as_ref().map(|c| match c {
            CommandConfig::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            CommandConfig::Exec(arr) => arr.clone(),
        }),
        ports,
        env: resolve_environment(service.environment.as_ref()),
        exposed_ports,
        volumes,
        depends_on: service
            .depends_on
            .as_ref()
            .map(|d| d.names().into_iter().collect())
            .unwrap_or_default(),
        restart,
        healthcheck,
        readiness,
        probe,
    })
}

fn resolve_build(build: &BuildConfig, working_dir: &Path) -> BuildSpec {
    match build {
        BuildConfig::Simple(context) => BuildSpec {
            context: BuildContext::from_descriptor(context, working_dir),
            dockerfile: None,
            target: None,
            args: IndexMap::new(),
        },
        BuildConfig::Full(full) => BuildSpec {
            context: BuildContext::from_descriptor(
                full.context.as_deref().unwrap_or("."),
                working_dir,
            ),
            dockerfile: full.dockerfile.clone(),
            target: full.target.clone(),
            args: full
                .args
                .iter()
                .flatten()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
        },
    }
}

/// Entries without a value (`- DEBUG` or `DEBUG:`) are dropped
fn resolve_environment(env: Option<&EnvironmentConfig>) -> IndexMap<String, String> {
    match env {
        None => IndexMap::new(),
        Some(EnvironmentConfig::Array(arr)) => arr
            .iter()
            .filter_map(|item| item.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        Some(EnvironmentConfig::Map(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.to_string())))
            .collect(),
    }
}

/// Returns published bindings and container ports that were listed without a
/// host side.
fn parse_port(
    service: &str,
    port: &PortConfig,
) -> Result<(Vec<PortBinding>, Vec<u16>), ValidationError> {
    let invalid = |value: &str| ValidationError::InvalidPort {
        service: service.to_string(),
        value: value.to_string(),
    };

    match port {
        PortConfig::Number(container) => Ok((Vec::new(), vec![*container])),
        PortConfig::Long(long) => {
            let protocol = match long.protocol.as_deref() {
                None => Protocol::Tcp,
                Some(p) => Protocol::parse(p).ok_or_else(|| invalid(p))?,
            };
            match &long.published {
                None => Ok((Vec::new(), vec![long.target])),
                Some(published) => {
                    let text = published.to_string();
                    let host = match published {
                        ScalarValue::Int(i) => u16::try_from(*i).map_err(|_| invalid(&text))?,
                        _ => text.parse::<u16>().map_err(|_| invalid(&text))?,
                    };
                    Ok((
                        vec![PortBinding {
                            host_ip: long.host_ip.clone(),
                            host,
                            container: long.target,
                            protocol,
                        }],
                        Vec::new(),
                    ))
                }
            }
        }
        PortConfig::Short(spec) => {
            let (mapping, protocol) = match spec.rsplit_once('/') {
                Some((m, p)) => (m, Protocol::parse(p).ok_or_else(|| invalid(spec.as_str()))?),
                None => (spec.as_str(), Protocol::Tcp),
            };

            // host_ip may itself be an IPv6 literal in brackets; split from the right
            let parts: Vec<&str> = mapping.rsplitn(3, ':').collect();
            let (host_ip, host, container) = match parts.as_slice() {
                [container] => (None, None, *container),
                [container, host] => (None, Some(*host), *container),
                [container, host, ip] => (Some(ip.to_string()), Some(*host), *container),
                _ => return Err(invalid(spec.as_str())),
            };

            let containers = parse_port_range(container).ok_or_else(|| invalid(spec.as_str()))?;
            let Some(host) = host.filter(|h| !h.is_empty()) else {
                return Ok((Vec::new(), containers));
            };
            let hosts = parse_port_range(host).ok_or_else(|| invalid(spec.as_str()))?;
            if hosts.len() != containers.len() {
                return Err(invalid(spec.as_str()));
            }

            let bindings = hosts
                .into_iter()
                .zip(containers)
                .map(|(host, container)| PortBinding {
                    host_ip: host_ip.clone(),
                    host,
                    container,
                    protocol,
                })
                .collect();
            Ok((bindings, Vec::new()))
        }
    }
}

fn parse_port_range(s: &str) -> Option<Vec<u16>> {
    match s.split_once('-') {
        Some((start, end)) => {
            let start: u16 = start.parse().ok()?;
            let end: u16 = end.parse().ok()?;
            (start <= end).then(|| (start..=end).collect())
        }
        None => s.parse().ok().map(|p| vec![p]),
    }
}

fn is_bind_source(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

fn parse_mount(
    service: &str,
    mount: &VolumeMount,
    working_dir: &Path,
) -> Result<MountBinding, ValidationError> {
    let invalid = |value: String| ValidationError::InvalidMount {
        service: service.to_string(),
        value,
    };

    let bind_path = |source: &str| -> PathBuf {
        match source.strip_prefix("~/") {
            Some(rest) => std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_default()
                .join(rest),
            None => working_dir.join(source),
        }
    };

    match mount {
        VolumeMount::Short(spec) => {
            let parts: Vec<&str> = spec.split(':').collect();
            let (source, target, mode) = match parts.as_slice() {
                [source, target] => (*source, *target, None),
                [source, target, mode] => (*source, *target, Some(*mode)),
                _ => return Err(invalid(spec.clone())),
            };
            if source.is_empty() || !target.starts_with('/') {
                return Err(invalid(spec.clone()));
            }

            let read_only = match mode {
                None => false,
                Some(mode) => mode.split(',').any(|m| m == "ro"),
            };
            let source = if is_bind_source(source) {
                MountSource::Bind(bind_path(source))
            } else {
                MountSource::Volume(source.to_string())
            };

            Ok(MountBinding {
                source,
                target: target.to_string(),
                read_only,
            })
        }
        VolumeMount::Long(long) => {
            let Some(source) = long.source.as_deref() else {
                return Err(invalid(long.target.clone()));
            };
            let source = match long.mount_type.as_deref() {
                Some("bind") => MountSource::Bind(bind_path(source)),
                Some("volume") | None if !is_bind_source(source) => {
                    MountSource::Volume(source.to_string())
                }
                None => MountSource::Bind(bind_path(source)),
                Some(other) => return Err(invalid(format!("{} ({})", long.target, other))),
            };

            Ok(MountBinding {
                source,
                target: long.target.clone(),
                read_only: long.read_only.unwrap_or(false),
            })
        }
    }
}

fn resolve_healthcheck(hc: &HealthcheckConfig) -> Result<Option<HealthcheckSpec>, ValidationError> {
    if hc.disable == Some(true) {
        return Ok(None);
    }

    let command = match &hc.test {
        None => return Ok(None),
        Some(HealthcheckTest::Command(cmd)) => cmd.clone(),
        Some(HealthcheckTest::Array(arr)) => match arr.split_first() {
            Some((kind, _)) if kind == "NONE" => return Ok(None),
            Some((kind, rest)) if kind == "CMD" || kind == "CMD-SHELL" => rest.join(" "),
            _ => arr.join(" "),
        },
    };
    if command.trim().is_empty() {
        return Ok(None);
    }

    let duration = |value: &Option<String>| value.as_deref().map(parse_duration).transpose();

    Ok(Some(HealthcheckSpec {
        command,
        interval: duration(&hc.interval)?,
        timeout: duration(&hc.timeout)?,
        retries: hc.retries,
        start_period: duration(&hc.start_period)?,
    }))
}

fn check_host_ports(services: &IndexMap<String, ServiceSpec>) -> Result<(), ValidationError> {
    let mut owners: Vec<(&PortBinding, &str)> = Vec::new();

    for service in services.values() {
        for port in &service.ports {
            if let Some((_, first)) = owners.iter().find(|(other, _)| port.conflicts_with(other)) {
                return Err(ValidationError::DuplicateHostPort {
                    port: port.host,
                    protocol: port.protocol.to_string(),
                    first: first.to_string(),
                    second: service.name.clone(),
                });
            }
            owners.push((port, &service.name));
        }
    }

    Ok(())
}
