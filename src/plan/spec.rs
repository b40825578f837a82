//! Resolved service and volume specifications

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Where a service's image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// Built from a context at launch time
    Build(BuildSpec),
    /// Pre-built image reference
    Image(ImageRef),
}

/// Build instructions for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSpec {
    /// Build context
    pub context: BuildContext,
    /// Dockerfile path relative to the context
    pub dockerfile: Option<String>,
    /// Target stage
    pub target: Option<String>,
    /// Build arguments
    pub args: IndexMap<String, String>,
}

/// Build context location
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildContext {
    /// Remote reference (git URL or tarball URL), passed through verbatim
    Remote(String),
    /// Local directory, already joined onto the descriptor directory
    Local(PathBuf),
}

impl BuildContext {
    /// Classify a context string from the descriptor
    pub fn from_descriptor(context: &str, base: &std::path::Path) -> Self {
        const REMOTE_PREFIXES: &[&str] = &["http://", "https://", "git://", "git@", "ssh://", "github.com/"];
        if REMOTE_PREFIXES.iter().any(|p| context.starts_with(p)) {
            BuildContext::Remote(context.to_string())
        } else {
            BuildContext::Local(base.join(context))
        }
    }
}

impl fmt::Display for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildContext::Remote(url) => f.write_str(url),
            BuildContext::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Image reference: name plus tag (or digest)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    /// Repository, including registry host if present
    pub name: String,
    /// Tag, `None` when pinned by digest
    pub tag: Option<String>,
    /// Digest such as `sha256:...`
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse `name[:tag][@digest]`, defaulting the tag to `latest`
    pub fn parse(reference: &str) -> Self {
        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (reference, None),
        };

        // a colon after the last slash separates the tag; earlier ones are registry ports
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (rest[..split].to_string(), Some(rest[split + 1..].to_string()))
            }
            None => (rest.to_string(), None),
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some("latest".to_string()),
            _ => tag,
        };

        Self { name, tag, digest }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// Parse a descriptor protocol name
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A host port published to a container port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    /// Host interface, all interfaces when unset
    pub host_ip: Option<String>,
    /// Port on the host
    pub host: u16,
    /// Port inside the container
    pub container: u16,
    /// Protocol
    pub protocol: Protocol,
}

impl PortBinding {
    /// Host interface as an address, brackets around IPv6 literals allowed
    pub fn host_addr(&self) -> Option<IpAddr> {
        let ip = self.host_ip.as_deref()?;
        ip.trim_start_matches('[').trim_end_matches(']').parse().ok()
    }

    /// Whether the binding listens on every host interface
    pub fn is_wildcard(&self) -> bool {
        match self.host_ip.as_deref() {
            None | Some("") => true,
            Some(_) => self.host_addr().is_some_and(|ip| ip.is_unspecified()),
        }
    }

    /// Whether both bindings would claim the same host socket
    pub fn conflicts_with(&self, other: &PortBinding) -> bool {
        self.host == other.host
            && self.protocol == other.protocol
            && (self.is_wildcard() || other.is_wildcard() || self.host_addr() == other.host_addr())
    }

    /// Address that reaches the binding from this host. Wildcard bindings
    /// are reached over loopback.
    pub fn local_addr(&self) -> SocketAddr {
        let ip = self
            .host_addr()
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(ip, self.host)
    }
}

/// Source side of a mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountSource {
    /// Named volume declared at the top level
    Volume(String),
    /// Host path
    Bind(PathBuf),
}

/// A volume or bind mount for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountBinding {
    /// What is mounted
    pub source: MountSource,
    /// Mount path in the container
    pub target: String,
    /// Read only
    pub read_only: bool,
}

impl MountBinding {
    /// Volume name when this is a named-volume mount
    pub fn volume_name(&self) -> Option<&str> {
        match self.source {
            MountSource::Volume(ref name) => Some(name),
            MountSource::Bind(_) => None,
        }
    }
}

/// Restart policy handed to the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
    OnFailure,
}

impl RestartPolicy {
    /// Parse a descriptor restart value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "no" | "never" => Some(RestartPolicy::Never),
            "always" | "unless-stopped" => Some(RestartPolicy::Always),
            _ if s == "on-failure" || s.starts_with("on-failure:") => Some(RestartPolicy::OnFailure),
            _ => None,
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// How the launcher decides a started service is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// The container's own healthcheck reports healthy
    Healthcheck,
    /// A TCP connection to this host address succeeds
    Tcp(SocketAddr),
    /// The container is running
    Running,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Healthcheck => write!(f, "healthcheck"),
            Readiness::Tcp(addr) => write!(f, "tcp:{}", addr),
            Readiness::Running => write!(f, "running"),
        }
    }
}

/// Container healthcheck passed through to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthcheckSpec {
    /// Shell command evaluated inside the container
    pub command: String,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub start_period: Option<Duration>,
}

/// Per-service adjustments to the launcher's probe policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeOverrides {
    /// Replaces the base delay between attempts
    pub base_delay: Option<Duration>,
    /// Replaces the maximum number of attempts
    pub max_attempts: Option<u32>,
    /// Added to the total wait budget
    pub extra_budget: Option<Duration>,
}

/// Fully resolved service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    /// Unique service name
    pub name: String,
    /// Build or image source
    pub source: ImageSource,
    /// Command override, exec form
    pub command: Option<Vec<String>>,
    /// Published ports, in descriptor order
    pub ports: Vec<PortBinding>,
    /// Environment, in descriptor order
    pub env: IndexMap<String, String>,
    /// Ports visible to other services only
    pub exposed_ports: BTreeSet<u16>,
    /// Mounts, in descriptor order
    pub volumes: Vec<MountBinding>,
    /// Services that must be ready first
    pub depends_on: BTreeSet<String>,
    /// Restart policy
    pub restart: RestartPolicy,
    /// Healthcheck, if declared and enabled
    pub healthcheck: Option<HealthcheckSpec>,
    /// Readiness check used by the launcher
    pub readiness: Readiness,
    /// Probe policy adjustments
    pub probe: ProbeOverrides,
}

impl ServiceSpec {
    /// Build instructions, if the service is built rather than pulled
    pub fn build(&self) -> Option<&BuildSpec> {
        match self.source {
            ImageSource::Build(ref build) => Some(build),
            ImageSource::Image(_) => None,
        }
    }

    /// Names of the named volumes this service mounts
    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().filter_map(|m| m.volume_name())
    }
}

/// Named persistent volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeSpec {
    /// Key used by services
    pub name: String,
    /// Explicit runtime name, overrides project scoping
    pub runtime_name: Option<String>,
    /// Driver
    pub driver: Option<String>,
    /// Driver options
    pub driver_opts: IndexMap<String, String>,
    /// Labels
    pub labels: IndexMap<String, String>,
    /// Managed outside this project: looked up, never created or removed
    pub external: bool,
}

impl VolumeSpec {
    /// A local volume with no options
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            runtime_name: None,
            driver: None,
            driver_opts: IndexMap::new(),
            labels: IndexMap::new(),
            external: false,
        }
    }
}
