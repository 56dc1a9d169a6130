//! Defines [`Config`], the immutable settings shared by the build pipeline and
//! the change watcher. Settings come from (in increasing precedence) the
//! built-in defaults, an optional `pagemill.yaml` project file, and
//! command-line flags ([`Overrides`]).

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The name of the project file searched for by [`Config::from_directory`].
pub const PROJECT_FILE: &str = "pagemill.yaml";

/// Settings for a build.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// The tree that is mirrored into `output_dir`.
    pub input_dir: PathBuf,

    /// The tree that is cleared and regenerated on every build.
    pub output_dir: PathBuf,

    /// The directory the `json` and `read` template functions load from.
    pub data_dir: PathBuf,

    /// Template files and directories. The first entry is the base template
    /// and is required.
    pub templates: Vec<PathBuf>,

    /// If set, the output directory is served on this address and the
    /// sources are watched for changes.
    pub addr: Option<SocketAddr>,

    /// The maximum number of files a build holds open at once.
    pub max_open: usize,

    /// Files with this extension (without the dot) are rendered as pages;
    /// everything else is copied.
    pub template_extension: String,

    /// How often the watcher polls for changes.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input_dir: PathBuf::from("src"),
            output_dir: PathBuf::from("docs"),
            data_dir: PathBuf::from("data"),
            templates: vec![PathBuf::from("templates/base.html"), PathBuf::from("templates")],
            addr: None,
            max_open: 100,
            template_extension: String::from("html"),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Settings given on the command line. `None` leaves the project file (or
/// default) value in place.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub templates: Option<Vec<PathBuf>>,
    pub addr: Option<SocketAddr>,
    pub max_open: Option<usize>,
}

#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct Project {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    data: Option<PathBuf>,
    templates: Option<Vec<PathBuf>>,
    addr: Option<String>,
    max_open: Option<usize>,
    extension: Option<String>,
    poll_interval_ms: Option<u64>,
}

impl Config {
    /// Looks for a `pagemill.yaml` in `dir` and each of its parents, loading
    /// the first one found. Falls back to the defaults if there is none.
    pub fn from_directory(dir: &Path) -> Result<Config> {
        let path = dir.join(PROJECT_FILE);
        if path.exists() {
            match Config::from_project_file(&path) {
                Ok(config) => Ok(config),
                Err(e) => Err(anyhow!("Loading configuration: {:?}", e)),
            }
        } else {
            match dir.parent() {
                Some(parent) => Config::from_directory(parent),
                None => Ok(Config::default()),
            }
        }
    }

    /// Loads a project file. Relative paths in the file are resolved against
    /// the file's directory.
    pub fn from_project_file(path: &Path) -> Result<Config> {
        use crate::util::open;
        let project: Project = serde_yaml::from_reader(open(path, "project")?)?;
        let root = match path.parent() {
            Some(root) => root,
            None => {
                return Err(anyhow!(
                    "Can't get parent directory for provided project file path '{:?}'",
                    path
                ))
            }
        };

        let defaults = Config::default();
        let resolve = |p: PathBuf| root.join(p);
        Ok(Config {
            input_dir: resolve(project.input.unwrap_or(defaults.input_dir)),
            output_dir: resolve(project.output.unwrap_or(defaults.output_dir)),
            data_dir: resolve(project.data.unwrap_or(defaults.data_dir)),
            templates: project
                .templates
                .unwrap_or(defaults.templates)
                .into_iter()
                .map(resolve)
                .collect(),
            addr: project.addr.as_deref().map(parse_addr).transpose()?,
            max_open: project.max_open.unwrap_or(defaults.max_open),
            template_extension: project
                .extension
                .map(|ext| ext.trim_start_matches('.').to_owned())
                .unwrap_or(defaults.template_extension),
            poll_interval: project
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        })
    }

    /// Applies command-line settings on top of this configuration.
    pub fn with_overrides(self, overrides: Overrides) -> Config {
        Config {
            input_dir: overrides.input_dir.unwrap_or(self.input_dir),
            output_dir: overrides.output_dir.unwrap_or(self.output_dir),
            data_dir: overrides.data_dir.unwrap_or(self.data_dir),
            templates: overrides.templates.unwrap_or(self.templates),
            addr: overrides.addr.or(self.addr),
            max_open: overrides.max_open.unwrap_or(self.max_open),
            ..self
        }
    }

    /// Checks the settings that would otherwise only fail mid-build.
    pub fn validate(&self) -> Result<()> {
        if self.templates.is_empty() {
            return Err(anyhow!("--templates requires at least the base template"));
        }
        if self.max_open < 2 {
            return Err(anyhow!(
                "--max-open must be at least 2 (one reader and one writer); got {}",
                self.max_open
            ));
        }
        if self.template_extension.is_empty() {
            return Err(anyhow!("The template extension must not be empty"));
        }
        Ok(())
    }

    /// The paths the change watcher polls: the input and data directories and
    /// every template source.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.input_dir.clone(), self.data_dir.clone()];
        paths.extend(self.templates.iter().cloned());
        paths
    }
}

/// Resolves a listen address such as `127.0.0.1:8080`, `localhost:8080` or
/// `:8080`. An empty host listens on every interface.
pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    let resolved = match addr.starts_with(':') {
        true => format!("0.0.0.0{}", addr).to_socket_addrs(),
        false => addr.to_socket_addrs(),
    };
    match resolved {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| anyhow!("Address '{}' resolved to nothing", addr)),
        Err(e) => Err(anyhow!("Invalid address '{}': {}", addr, e)),
    }
}

/// Splits a whitespace-separated list of template sources, as accepted by
/// `--templates`.
pub fn parse_template_list(list: &str) -> Vec<PathBuf> {
    list.split_whitespace().map(PathBuf::from).collect()
}
