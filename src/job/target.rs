//! Execution targets: where a step's process runs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Operating system family of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    #[default]
    Linux,
    Windows,
}

/// A host directory made visible inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    pub fn new(source: impl Into<PathBuf>, target: &str, read_only: bool) -> Self {
        Self {
            source: source.into(),
            target: target.to_string(),
            read_only,
        }
    }

    /// `-v` argument for the container engine
    pub fn volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// A job container. The id is assigned once the container has been started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Alias the job refers to the container by
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Passed to `exec -u`
    #[serde(default)]
    pub user_id: Option<String>,
    /// Determines the exec working directory (`root` → `/root`)
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub prepend_path: Vec<String>,
    /// Node runtime inside the container that runs the bootstrap script
    #[serde(default = "default_runtime_path")]
    pub runtime_path: String,
    #[serde(default)]
    pub os: TargetOs,
    #[serde(skip)]
    id: Arc<OnceLock<String>>,
}

fn default_runtime_path() -> String {
    "node".to_string()
}

impl ContainerInfo {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            mounts: Vec::new(),
            user_id: None,
            user_name: None,
            prepend_path: Vec::new(),
            runtime_path: default_runtime_path(),
            os: TargetOs::default(),
            id: Arc::default(),
        }
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_user(mut self, user_id: &str, user_name: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self.user_name = Some(user_name.to_string());
        self
    }

    /// Use an already running container
    pub fn with_id(self, id: &str) -> Self {
        self.set_id(id);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    /// Record the started container's id; shared by every clone of this info.
    /// Returns false if an id was already set.
    pub fn set_id(&self, id: &str) -> bool {
        self.id.set(id.to_string()).is_ok()
    }

    /// Working directory for `exec`, derived from the container user
    pub fn home_directory(&self) -> String {
        match self.user_name.as_deref() {
            None | Some("root") => "/root".to_string(),
            Some(user) => format!("/home/{}", user),
        }
    }

    /// Translate a host path into the path the container sees
    pub fn translate_to_container(&self, path: &Path) -> Option<String> {
        self.mounts.iter().find_map(|mount| {
            let rest = path.strip_prefix(&mount.source).ok()?;
            let mut translated = mount.target.trim_end_matches('/').to_string();
            for component in rest.components() {
                translated.push('/');
                translated.push_str(&component.as_os_str().to_string_lossy());
            }
            if translated.is_empty() {
                translated.push('/');
            }
            Some(translated)
        })
    }

    /// Whether a path already names a location inside one of the mounts
    pub fn is_container_path(&self, path: &str) -> bool {
        self.mounts.iter().any(|mount| {
            let target = mount.target.trim_end_matches('/');
            path == target || path.starts_with(&format!("{}/", target))
        })
    }
}

/// Where a step's process executes
#[derive(Debug, Clone, Default)]
pub enum ExecutionTarget {
    #[default]
    Host,
    Container(ContainerInfo),
}

impl ExecutionTarget {
    pub fn container(&self) -> Option<&ContainerInfo> {
        match self {
            ExecutionTarget::Host => None,
            ExecutionTarget::Container(info) => Some(info),
        }
    }
}
