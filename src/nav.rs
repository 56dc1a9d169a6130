//! Defines [`NavigationContext`], the per-page helper behind the `url` and
//! `active` template functions. A context is bound to the relative path of the
//! page currently being rendered; URLs are always given rooted at the input
//! directory (e.g. `/blog/index.html`) and are rewritten relative to the page.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

const EXTERNAL_SCHEMES: [&str; 2] = ["http://", "https://"];

/// URL resolution and active-page detection for a single page.
#[derive(Clone, Debug)]
pub struct NavigationContext {
    /// The root of the input tree. Rooted targets are checked for existence
    /// against this directory.
    input_root: PathBuf,

    /// The page's path relative to `input_root`, slash separated.
    relative: String,

    /// The file name that makes a directory linkable, e.g. `index.html`.
    index_file: String,
}

impl NavigationContext {
    /// Creates a context for the page at `relative_path` (relative to
    /// `input_root`). `extension` is the template extension; a directory is
    /// only a valid link target if it contains `index.{extension}`.
    pub fn new(input_root: &Path, relative_path: &Path, extension: &str) -> NavigationContext {
        NavigationContext {
            input_root: input_root.to_owned(),
            relative: slash_path(relative_path),
            index_file: format!("index.{}", extension),
        }
    }

    /// The page's relative path with `/` separators.
    pub fn relative_path(&self) -> &str {
        &self.relative
    }

    /// Resolves `target` into a link usable from the current page.
    ///
    /// External `http://` and `https://` URLs are returned unchanged. Rooted
    /// targets must exist under the input root (directories must contain an
    /// index file) and are rewritten relative to the page's directory.
    /// Relative targets are not supported.
    pub fn resolve_url(&self, target: &str) -> Result<String> {
        if is_external(target) {
            return Ok(target.to_owned());
        }
        if !target.starts_with('/') {
            return Err(NavigationError::Unsupported(target.to_owned()));
        }

        let parts = rooted_components(target);
        let path = parts
            .iter()
            .fold(self.input_root.clone(), |path, part| path.join(part));
        let not_found = |path: &Path, err: io::Error| NavigationError::NotFound {
            target: target.to_owned(),
            path: path.to_owned(),
            err,
        };

        let metadata = fs::metadata(&path).map_err(|e| not_found(&path, e))?;
        if metadata.is_dir() {
            let index = path.join(&self.index_file);
            fs::metadata(&index).map_err(|e| not_found(&index, e))?;
        }

        let depth = self.relative.split('/').count().saturating_sub(1);
        let mut segments = vec![".."; depth];
        segments.extend(parts);
        match segments.is_empty() {
            true => Ok(String::from(".")),
            false => Ok(segments.join("/")),
        }
    }

    /// Reports whether `target` is the current page or one of its ancestors.
    ///
    /// `/` only matches the top-level index page. External URLs never match.
    /// Other rooted targets match when the page's relative path starts with
    /// them. Relative targets are not supported.
    pub fn is_active(&self, target: &str) -> Result<bool> {
        if target == "/" {
            return Ok(self.relative == self.index_file);
        }
        if is_external(target) {
            return Ok(false);
        }
        match target.strip_prefix('/') {
            Some(prefix) => Ok(self.relative.starts_with(prefix)),
            None => Err(NavigationError::Unsupported(target.to_owned())),
        }
    }
}

fn is_external(target: &str) -> bool {
    EXTERNAL_SCHEMES
        .iter()
        .any(|scheme| target.starts_with(scheme))
}

// Lexically cleans a rooted, slash-separated path. `..` never climbs above
// the root.
fn rooted_components(target: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    parts
}

fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

type Result<T> = std::result::Result<T, NavigationError>;

/// Errors raised from within `url` and `active` calls. They fail the render
/// of the page that made the call.
#[derive(Debug)]
pub enum NavigationError {
    /// The target was neither an external URL nor rooted at `/`.
    Unsupported(String),

    /// The target (or the index file of a target directory) doesn't exist.
    NotFound {
        target: String,
        path: PathBuf,
        err: io::Error,
    },
}

impl fmt::Display for NavigationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NavigationError::Unsupported(target) => {
                write!(f, "Relative paths are not supported: '{}'", target)
            }
            NavigationError::NotFound { target, path, err } => write!(
                f,
                "Resolving '{}' (looked for '{}'): {}",
                target,
                path.display(),
                err
            ),
        }
    }
}

impl std::error::Error for NavigationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NavigationError::Unsupported(_) => None,
            NavigationError::NotFound { err, .. } => Some(err),
        }
    }
}
