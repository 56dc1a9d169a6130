//! Exports [`Builder`] and [`build_site`], which regenerate the output tree
//! from the input tree: the template set is composed ([`crate::template`]),
//! the old output directory is removed, and the input tree is walked. Each
//! directory is recreated in the output tree before the walk descends into
//! it; each file becomes a task that either renders the file as a page or
//! copies it verbatim. File tasks run concurrently, bounded by a
//! [`ConcurrencyLimiter`], and a failed file never stops the rest of the
//! build.

use crate::config::Config;
use crate::funcs::Scope;
use crate::limiter::ConcurrencyLimiter;
use crate::nav::NavigationContext;
use crate::template::{self, TemplateSet};
use crate::util;
use std::fmt;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use walkdir::WalkDir;

/// Builds the site described by `config` once.
pub async fn build_site(config: &Config) -> Result<BuildReport> {
    Builder::new(config.clone()).build().await
}

/// Runs builds for a fixed [`Config`]. A builder can be reused for any number
/// of builds; each one is a full clear-and-regenerate.
#[derive(Clone, Debug)]
pub struct Builder {
    config: Config,
    limiter: ConcurrencyLimiter,
}

impl Builder {
    /// Creates a builder whose builds hold at most `config.max_open` files
    /// open at once.
    pub fn new(config: Config) -> Builder {
        let limiter = ConcurrencyLimiter::new(config.max_open);
        Builder { config, limiter }
    }

    /// Runs a build, collecting per-file failures into the report.
    pub async fn build(&self) -> Result<BuildReport> {
        self.build_with(|_| {}).await
    }

    /// Runs a build, additionally passing every per-file failure to
    /// `on_error` as it is observed.
    ///
    /// Returns an [`Error`] if the templates can't be composed, the output
    /// directory can't be cleared, or the input tree can't be walked. In the
    /// last case the output tree is left partially written.
    pub async fn build_with<F>(&self, mut on_error: F) -> Result<BuildReport>
    where
        F: FnMut(&FileError),
    {
        let builder = self.clone();
        let Dispatched {
            mut tasks,
            mut report,
            directories,
            walked,
        } = tokio::task::spawn_blocking(move || builder.dispatch())
            .await
            .map_err(Error::Aborted)??;

        // Tasks already dispatched run to completion even if the walk failed.
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap_or_else(|e| Err(FileError::Aborted(e))) {
                Ok(Outcome::Rendered) => report.rendered += 1,
                Ok(Outcome::Copied) => report.copied += 1,
                Err(e) => {
                    on_error(&e);
                    report.failures.push(e);
                }
            }
        }

        // Directory modes go on last so read-only directories can still be
        // filled.
        let restored = tokio::task::spawn_blocking(move || restore_permissions(directories))
            .await
            .map_err(Error::Aborted)?;
        walked?;
        restored?;

        tracing::info!(
            "Built {}: {} pages rendered, {} files copied, {} failed",
            self.config.output_dir.display(),
            report.rendered,
            report.copied,
            report.failures.len()
        );
        Ok(report)
    }

    // Composes the templates, clears the output directory and walks the input
    // tree, creating directories as it goes and spawning a task for every
    // file. Runs on a blocking thread.
    fn dispatch(&self) -> Result<Dispatched> {
        let templates = Arc::new(TemplateSet::compose(&self.config.templates)?);

        // Blow away the old output so files deleted from the input don't
        // linger.
        let output_dir = &self.config.output_dir;
        util::remove_dir_all(output_dir).map_err(|err| Error::Clean {
            path: output_dir.to_owned(),
            err,
        })?;

        let mut dispatched = Dispatched {
            tasks: JoinSet::new(),
            report: BuildReport::default(),
            directories: Vec::new(),
            walked: Ok(()),
        };
        dispatched.walked = self.walk(&templates, &mut dispatched);
        Ok(dispatched)
    }

    fn walk(&self, templates: &Arc<TemplateSet>, dispatched: &mut Dispatched) -> Result<()> {
        let input_dir = &self.config.input_dir;
        for entry in WalkDir::new(input_dir) {
            let walk_error = |err| Error::Walk {
                path: input_dir.to_owned(),
                err,
            };
            let entry = entry.map_err(walk_error)?;
            let metadata = entry.metadata().map_err(walk_error)?;
            let relative = match entry.path().strip_prefix(input_dir) {
                Ok(relative) => relative.to_owned(),
                Err(_) => {
                    return Err(Error::OutsideInput {
                        path: entry.path().to_owned(),
                    })
                }
            };
            let output = self.config.output_dir.join(&relative);

            if entry.file_type().is_dir() {
                tracing::debug!("Creating dir: {}", output.display());
                create_dir(&output, relative.as_os_str().is_empty())
                    .map_err(|err| Error::CreateDir {
                        path: output.clone(),
                        err,
                    })?;
                dispatched.directories.push((output, metadata.permissions()));
                dispatched.report.directories += 1;
                continue;
            }

            let page = match self.is_page(entry.path()) {
                false => None,
                true => Some(Page {
                    templates: Arc::clone(templates),
                    scope: Scope {
                        nav: NavigationContext::new(
                            input_dir,
                            &relative,
                            &self.config.template_extension,
                        ),
                        data_dir: self.config.data_dir.clone(),
                    },
                }),
            };
            let task = FileTask {
                source: entry.path().to_owned(),
                relative,
                output,
                permissions: metadata.permissions(),
                page,
            };
            dispatched.tasks.spawn(task.run(self.limiter.clone()));
        }
        Ok(())
    }

    fn is_page(&self, path: &Path) -> bool {
        path.extension()
            .map_or(false, |ext| ext == self.config.template_extension.as_str())
    }
}

fn create_dir(path: &Path, root: bool) -> io::Result<()> {
    match root {
        true => std::fs::create_dir_all(path),
        false => std::fs::create_dir(path),
    }
}

// Applies the source modes to the mirrored directories, deepest first.
fn restore_permissions(directories: Vec<(PathBuf, Permissions)>) -> Result<()> {
    for (path, permissions) in directories.into_iter().rev() {
        std::fs::set_permissions(&path, permissions)
            .map_err(|err| Error::Permissions { path, err })?;
    }
    Ok(())
}

fn create_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// The state a walk hands back to the async half of a build.
struct Dispatched {
    tasks: JoinSet<std::result::Result<Outcome, FileError>>,
    report: BuildReport,

    /// Every output directory created, in walk order, with its source mode.
    directories: Vec<(PathBuf, Permissions)>,

    /// The walk's own outcome. Tasks spawned before a failure still run.
    walked: Result<()>,
}

/// The template half of a [`FileTask`] that renders a page.
struct Page {
    templates: Arc<TemplateSet>,
    scope: Scope,
}

/// A single input file to render or copy.
struct FileTask {
    source: PathBuf,
    relative: PathBuf,
    output: PathBuf,
    permissions: Permissions,
    page: Option<Page>,
}

enum Outcome {
    Rendered,
    Copied,
}

impl FileTask {
    async fn run(self, limiter: ConcurrencyLimiter) -> std::result::Result<Outcome, FileError> {
        match self.page {
            Some(page) => {
                let FileTask {
                    source,
                    relative,
                    output,
                    permissions,
                    ..
                } = self;
                render(source, relative, output, permissions, page, limiter).await
            }
            None => copy(self.source, self.output, self.permissions, limiter).await,
        }
    }
}

async fn render(
    source: PathBuf,
    relative: PathBuf,
    output: PathBuf,
    permissions: Permissions,
    page: Page,
    limiter: ConcurrencyLimiter,
) -> std::result::Result<Outcome, FileError> {
    tracing::debug!("Executing template: {}", source.display());
    let render_error = |err| FileError::Render {
        path: source.clone(),
        err,
    };
    let write_error = |err| FileError::Write {
        path: source.clone(),
        err,
    };

    // The page source is read up front so that no more than one file is open
    // while the page renders.
    let text = {
        let _input = limiter.acquire_input().await.map_err(write_error)?;
        tokio::fs::read_to_string(&source)
            .await
            .map_err(|err| template::Error::Read {
                path: source.clone(),
                err,
            })
            .map_err(render_error)?
    };

    let _output = limiter.acquire_output().await.map_err(write_error)?;
    let path = source.clone();
    tokio::task::spawn_blocking(move || -> std::result::Result<Outcome, FileError> {
        let render_error = |err| FileError::Render {
            path: path.clone(),
            err,
        };
        let write_error = |err| FileError::Write {
            path: path.clone(),
            err,
        };

        let mut writer = BufWriter::new(create_file(&output).map_err(write_error)?);
        page.templates
            .render_page(&relative, &text, page.scope, &mut writer)
            .map_err(render_error)?;
        let file = writer
            .into_inner()
            .map_err(|e| write_error(e.into_error()))?;
        file.set_permissions(permissions).map_err(write_error)?;
        Ok(Outcome::Rendered)
    })
    .await
    .map_err(FileError::Aborted)?
}

async fn copy(
    source: PathBuf,
    output: PathBuf,
    permissions: Permissions,
    limiter: ConcurrencyLimiter,
) -> std::result::Result<Outcome, FileError> {
    tracing::debug!("Copying file: {}", source.display());
    let copy_error = |err| FileError::Copy {
        path: source.clone(),
        err,
    };

    let _output = limiter.acquire_output().await.map_err(copy_error)?;
    let _input = limiter.acquire_input().await.map_err(copy_error)?;
    let from = source.clone();
    tokio::task::spawn_blocking(move || -> io::Result<()> {
        let mut writer = create_file(&output)?;
        let mut reader = File::open(&from)?;
        io::copy(&mut reader, &mut writer)?;
        writer.set_permissions(permissions)
    })
    .await
    .map_err(FileError::Aborted)?
    .map_err(copy_error)?;
    Ok(Outcome::Copied)
}

/// The outcome of a build that ran to completion.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Directories created in the output tree (including its root).
    pub directories: usize,

    /// Pages rendered through the template set.
    pub rendered: usize,

    /// Files copied verbatim.
    pub copied: usize,

    /// Files that failed to render or copy. Their siblings were still built.
    pub failures: Vec<FileError>,
}

impl BuildReport {
    /// Reports whether every file was built.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A failure building a single file. These are reported, not fatal.
#[derive(Debug)]
pub enum FileError {
    /// Reading, parsing or executing a page failed.
    Render { path: PathBuf, err: template::Error },

    /// Writing a rendered page failed.
    Write { path: PathBuf, err: io::Error },

    /// Copying a non-page file failed.
    Copy { path: PathBuf, err: io::Error },

    /// The task building the file panicked.
    Aborted(JoinError),
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FileError::Render { path, err } => {
                write!(f, "Rendering '{}': {}", path.display(), err)
            }
            FileError::Write { path, err } => {
                write!(f, "Writing output for '{}': {}", path.display(), err)
            }
            FileError::Copy { path, err } => {
                write!(f, "Copying '{}': {}", path.display(), err)
            }
            FileError::Aborted(err) => write!(f, "File task aborted: {}", err),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FileError::Render { err, .. } => Some(err),
            FileError::Write { err, .. } | FileError::Copy { err, .. } => Some(err),
            FileError::Aborted(err) => Some(err),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// A failure that aborts a whole build.
#[derive(Debug)]
pub enum Error {
    /// The template set couldn't be composed.
    Template(template::Error),

    /// The old output directory couldn't be removed.
    Clean { path: PathBuf, err: io::Error },

    /// The input tree couldn't be walked.
    Walk { path: PathBuf, err: walkdir::Error },

    /// A directory in the output tree couldn't be created.
    CreateDir { path: PathBuf, err: io::Error },

    /// A directory in the output tree couldn't be given its source mode.
    Permissions { path: PathBuf, err: io::Error },

    /// A blocking part of the build panicked.
    Aborted(JoinError),

    /// The walk yielded a path outside of the input directory.
    OutsideInput { path: PathBuf },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Template(err) => err.fmt(f),
            Error::Clean { path, err } => {
                write!(f, "Cleaning directory '{}': {}", path.display(), err)
            }
            Error::Walk { path, err } => {
                write!(f, "Walking input directory '{}': {}", path.display(), err)
            }
            Error::CreateDir { path, err } => {
                write!(f, "Creating directory '{}': {}", path.display(), err)
            }
            Error::Permissions { path, err } => {
                write!(f, "Setting permissions on '{}': {}", path.display(), err)
            }
            Error::Aborted(err) => write!(f, "Build aborted: {}", err),
            Error::OutsideInput { path } => {
                write!(f, "'{}' is outside of the input directory", path.display())
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Template(err) => Some(err),
            Error::Clean { err, .. }
            | Error::CreateDir { err, .. }
            | Error::Permissions { err, .. } => Some(err),
            Error::Aborted(err) => Some(err),
            Error::Walk { err, .. } => Some(err),
            Error::OutsideInput { .. } => None,
        }
    }
}

impl From<template::Error> for Error {
    /// Converts [`template::Error`]s into [`Error`]. This allows us to use the
    /// `?` operator.
    fn from(err: template::Error) -> Error {
        Error::Template(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs::{create_dir_all, read, write};
    use tempfile::TempDir;

    const BASE: &str = "<html><body>{{block \"content\" .}}empty{{end}}</body></html>";

    struct Site {
        dir: TempDir,
        config: Config,
    }

    impl Site {
        fn new(base: &str) -> io::Result<Site> {
            let dir = tempfile::tempdir()?;
            let root = dir.path();
            create_dir_all(root.join("src"))?;
            create_dir_all(root.join("templates"))?;
            create_dir_all(root.join("data"))?;
            write(root.join("templates/base.html"), base)?;
            let config = Config {
                input_dir: root.join("src"),
                output_dir: root.join("out"),
                data_dir: root.join("data"),
                templates: vec![root.join("templates/base.html")],
                max_open: 4,
                ..Config::default()
            };
            Ok(Site { dir, config })
        }

        fn file(&self, relative: &str, contents: &[u8]) -> io::Result<()> {
            let path = self.dir.path().join("src").join(relative);
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
            }
            write(path, contents)
        }

        fn output(&self, relative: &str) -> io::Result<Vec<u8>> {
            read(self.config.output_dir.join(relative))
        }

        // Every file under the output directory, by relative path.
        fn snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
            WalkDir::new(&self.config.output_dir)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| {
                    let relative = entry
                        .path()
                        .strip_prefix(&self.config.output_dir)
                        .map(Path::to_owned)
                        .unwrap_or_default();
                    (relative, read(entry.path()).unwrap_or_default())
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_mirrors_tree_and_copies_bytes() -> io::Result<()> {
        let site = Site::new(BASE)?;
        let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        site.file("img/logo.png", &binary)?;
        site.file("css/deep/nested/site.css", b"body {}")?;
        site.file("index.html", b"{{define \"content\"}}home{{end}}")?;

        let report = Builder::new(site.config.clone())
            .build()
            .await
            .expect("build succeeds");
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(1, report.rendered);
        assert_eq!(2, report.copied);
        assert_eq!(5, report.directories);
        assert_eq!(binary, site.output("img/logo.png")?);
        assert_eq!(b"body {}".to_vec(), site.output("css/deep/nested/site.css")?);
        assert_eq!(
            "<html><body>home</body></html>",
            String::from_utf8_lossy(&site.output("index.html")?)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_page_overrides_do_not_leak() -> io::Result<()> {
        let site = Site::new(BASE)?;
        site.file("a.html", b"{{define \"content\"}}A{{end}}")?;
        site.file("b.html", b"no overrides here")?;

        let report = build_site(&site.config).await.expect("build succeeds");
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(
            "<html><body>A</body></html>",
            String::from_utf8_lossy(&site.output("a.html")?)
        );
        assert_eq!(
            "<html><body>empty</body></html>",
            String::from_utf8_lossy(&site.output("b.html")?)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_navigation_functions() -> io::Result<()> {
        let site = Site::new(
            "{{url \"/index.html\"}}|{{url \"/blog\"}}|{{if active \"/blog\"}}blog{{end}}|{{active \"/\"}}",
        )?;
        site.file("index.html", b"")?;
        site.file("blog/index.html", b"")?;

        let report = build_site(&site.config).await.expect("build succeeds");
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(
            "index.html|blog||true",
            String::from_utf8_lossy(&site.output("index.html")?)
        );
        assert_eq!(
            "../index.html|../blog|blog|false",
            String::from_utf8_lossy(&site.output("blog/index.html")?)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_file_failures_are_reported_not_fatal() -> io::Result<()> {
        let site = Site::new("{{url \"/missing.html\"}}")?;
        site.file("broken.html", b"")?;
        site.file("also-broken.html", b"{{if}}")?;
        site.file("robots.txt", b"User-agent: *")?;

        let mut reported = Vec::new();
        let report = Builder::new(site.config.clone())
            .build_with(|e| reported.push(e.to_string()))
            .await
            .expect("per-file failures don't fail the build");
        assert_eq!(2, report.failures.len());
        assert_eq!(2, reported.len());
        assert!(report
            .failures
            .iter()
            .all(|e| matches!(e, FileError::Render { .. })));
        assert_eq!(1, report.copied);
        assert_eq!(b"User-agent: *".to_vec(), site.output("robots.txt")?);
        Ok(())
    }

    #[tokio::test]
    async fn test_composition_failure_leaves_output_alone() -> io::Result<()> {
        let site = Site::new("{{if .Path}}unclosed")?;
        create_dir_all(&site.config.output_dir)?;
        write(site.config.output_dir.join("keep.txt"), "old")?;

        let result = build_site(&site.config).await;
        assert!(matches!(result, Err(Error::Template(_))));
        assert_eq!(b"old".to_vec(), site.output("keep.txt")?);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_input_is_fatal() -> io::Result<()> {
        let site = Site::new(BASE)?;
        let config = Config {
            input_dir: site.dir.path().join("nope"),
            ..site.config.clone()
        };
        assert!(matches!(build_site(&config).await, Err(Error::Walk { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent_and_removes_stale_files() -> io::Result<()> {
        let site = Site::new(BASE)?;
        site.file("index.html", b"{{define \"content\"}}home{{end}}")?;
        site.file("notes/todo.txt", b"later")?;

        let builder = Builder::new(site.config.clone());
        builder.build().await.expect("first build");
        let first = site.snapshot();
        builder.build().await.expect("second build");
        assert_eq!(first, site.snapshot());

        std::fs::remove_file(site.dir.path().join("src/notes/todo.txt"))?;
        builder.build().await.expect("third build");
        assert!(!site.config.output_dir.join("notes/todo.txt").exists());
        assert!(site.config.output_dir.join("notes").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_many_files_with_small_budget() -> io::Result<()> {
        let site = Site::new(BASE)?;
        for i in 0..200 {
            site.file(&format!("d{}/f{}.txt", i % 7, i), format!("{}", i).as_bytes())?;
            site.file(&format!("d{}/p{}.html", i % 5, i), b"")?;
        }
        let config = Config {
            max_open: 2,
            ..site.config.clone()
        };

        let report = build_site(&config).await.expect("build succeeds");
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(200, report.copied);
        assert_eq!(200, report.rendered);
        assert_eq!(b"137".to_vec(), site.output("d4/f137.txt")?);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions_are_preserved() -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let site = Site::new(BASE)?;
        site.file("bin/run.sh", b"#!/bin/sh\n")?;
        let script = site.dir.path().join("src/bin/run.sh");
        std::fs::set_permissions(&script, Permissions::from_mode(0o755))?;
        std::fs::set_permissions(
            site.dir.path().join("src/bin"),
            Permissions::from_mode(0o750),
        )?;

        build_site(&site.config).await.expect("build succeeds");
        let out = &site.config.output_dir;
        let mode = |p: PathBuf| std::fs::metadata(p).map(|m| m.permissions().mode() & 0o777);
        assert_eq!(0o755, mode(out.join("bin/run.sh"))?);
        assert_eq!(0o750, mode(out.join("bin"))?);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_only_directories_are_filled_and_rebuilt() -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let site = Site::new(BASE)?;
        site.file("locked/notes.txt", b"notes")?;
        site.file("locked/deeper/page.html", b"{{define \"content\"}}deep{{end}}")?;
        let locked = site.dir.path().join("src/locked");
        std::fs::set_permissions(locked.join("deeper"), Permissions::from_mode(0o555))?;
        std::fs::set_permissions(&locked, Permissions::from_mode(0o555))?;

        let builder = Builder::new(site.config.clone());
        let first = builder.build().await.expect("first build");
        let second = builder.build().await.expect("rebuild clears read-only output");

        let out = site.config.output_dir.join("locked");
        let mode = std::fs::metadata(&out)?.permissions().mode() & 0o777;
        let notes = site.output("locked/notes.txt")?;
        let page = site.output("locked/deeper/page.html")?;

        // let the temporary directory clean up after itself
        for dir in [locked.join("deeper"), locked, out.join("deeper"), out] {
            std::fs::set_permissions(dir, Permissions::from_mode(0o755))?;
        }

        assert!(first.is_complete(), "{:?}", first.failures);
        assert!(second.is_complete(), "{:?}", second.failures);
        assert_eq!(0o555, mode);
        assert_eq!(b"notes".to_vec(), notes);
        assert_eq!(
            "<html><body>deep</body></html>",
            String::from_utf8_lossy(&page)
        );
        Ok(())
    }
}
