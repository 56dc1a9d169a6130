//! Defines [`Watcher`], which polls the input, data and template paths for
//! modification times newer than the last one it has seen and triggers a
//! rebuild when it finds one.

use crate::build::Builder;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// Polls a fixed set of paths for changes.
#[derive(Debug)]
pub struct Watcher {
    paths: Vec<PathBuf>,
    interval: Duration,

    /// The newest modification time observed so far. Only entries strictly
    /// newer than this count as changes.
    baseline: SystemTime,

    /// Watched paths that didn't exist on the last scan.
    missing: Vec<PathBuf>,
}

impl Watcher {
    /// Creates a watcher that treats anything modified after now as a change.
    pub fn new(paths: Vec<PathBuf>, interval: Duration) -> Watcher {
        Watcher::with_baseline(paths, interval, SystemTime::now())
    }

    pub fn with_baseline(paths: Vec<PathBuf>, interval: Duration, baseline: SystemTime) -> Watcher {
        Watcher {
            paths,
            interval,
            baseline,
            missing: Vec::new(),
        }
    }

    pub fn baseline(&self) -> SystemTime {
        self.baseline
    }

    /// Scans every watched path once. Returns `true` (and advances the
    /// baseline) if anything was modified after the current baseline. Paths
    /// that don't exist are skipped; any other failure abandons the scan and
    /// leaves the baseline untouched.
    pub fn scan(&mut self) -> Result<bool> {
        let scan = latest_modification(&self.paths)?;
        Ok(self.observe(scan))
    }

    fn observe(&mut self, scan: Scan) -> bool {
        for path in &scan.missing {
            if !self.missing.contains(path) {
                tracing::debug!("Not watching missing path: {}", path.display());
            }
        }
        self.missing = scan.missing;

        match scan.latest {
            Some(latest) if latest > self.baseline => {
                self.baseline = latest;
                true
            }
            _ => false,
        }
    }

    /// Polls forever, running a build with `builder` after every scan that
    /// found a change. Failed scans and failed builds are logged and polling
    /// continues.
    pub async fn run(mut self, builder: Builder) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let paths = self.paths.clone();
            let scanned = tokio::task::spawn_blocking(move || latest_modification(&paths)).await;
            let scan = match scanned {
                Ok(Ok(scan)) => scan,
                Ok(Err(e)) => {
                    tracing::warn!("Abandoning scan: {}", e);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Scan task failed: {}", e);
                    continue;
                }
            };
            if !self.observe(scan) {
                continue;
            }

            tracing::info!("Change detected; rebuilding");
            let result = builder
                .build_with(|e| tracing::error!("{}", e))
                .await;
            if let Err(e) = result {
                tracing::error!("Rebuild failed: {}", e);
            }
        }
    }
}

/// The result of one pass over the watched paths.
#[derive(Debug, Default)]
pub struct Scan {
    /// The newest modification time found, if anything was found at all.
    pub latest: Option<SystemTime>,

    /// Watched paths that don't exist.
    pub missing: Vec<PathBuf>,
}

/// Finds the newest modification time among `paths` and, for directories,
/// everything beneath them. Watched paths that don't exist are reported in
/// [`Scan::missing`] rather than failing the scan.
pub fn latest_modification(paths: &[PathBuf]) -> Result<Scan> {
    let mut latest = None;
    let mut missing = Vec::new();
    for path in paths {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                missing.push(path.to_owned());
                continue;
            }
            Err(err) => {
                return Err(Error::Stat {
                    path: path.to_owned(),
                    err,
                })
            }
        };
        if metadata.is_dir() {
            for entry in WalkDir::new(path) {
                let entry = entry.map_err(|err| Error::Walk {
                    path: path.to_owned(),
                    err,
                })?;
                let metadata = entry.metadata().map_err(|err| Error::Walk {
                    path: path.to_owned(),
                    err,
                })?;
                latest = newer(latest, modified(entry.path(), &metadata)?);
            }
        } else {
            latest = newer(latest, modified(path, &metadata)?);
        }
    }
    Ok(Scan { latest, missing })
}

fn modified(path: &Path, metadata: &std::fs::Metadata) -> Result<SystemTime> {
    metadata.modified().map_err(|err| Error::Stat {
        path: path.to_owned(),
        err,
    })
}

fn newer(latest: Option<SystemTime>, candidate: SystemTime) -> Option<SystemTime> {
    match latest {
        Some(latest) if latest >= candidate => Some(latest),
        _ => Some(candidate),
    }
}

type Result<T> = std::result::Result<T, Error>;

/// A failure that abandons one scan.
#[derive(Debug)]
pub enum Error {
    /// A watched path couldn't be stat'd.
    Stat { path: PathBuf, err: io::Error },

    /// A watched directory couldn't be walked.
    Walk { path: PathBuf, err: walkdir::Error },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Stat { path, err } => write!(f, "Checking '{}': {}", path.display(), err),
            Error::Walk { path, err } => write!(f, "Walking '{}': {}", path.display(), err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Stat { err, .. } => Some(err),
            Error::Walk { err, .. } => Some(err),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use std::fs::{create_dir_all, write, File};

    fn touch(path: &Path, time: SystemTime) -> io::Result<()> {
        File::options().write(true).open(path)?.set_modified(time)
    }

    fn fixture() -> io::Result<(tempfile::TempDir, Vec<PathBuf>)> {
        let dir = tempfile::tempdir()?;
        create_dir_all(dir.path().join("src/blog"))?;
        write(dir.path().join("src/blog/post.html"), "post")?;
        write(dir.path().join("base.html"), "base")?;
        let paths = vec![dir.path().join("src"), dir.path().join("base.html")];
        Ok((dir, paths))
    }

    #[test]
    fn test_no_change_no_rebuild() -> io::Result<()> {
        let (_dir, paths) = fixture()?;
        let latest = latest_modification(&paths)
            .expect("scan succeeds")
            .latest
            .expect("files exist");
        let mut watcher = Watcher::with_baseline(paths, Duration::from_secs(1), latest);
        assert!(!watcher.scan().expect("scan succeeds"));
        assert!(!watcher.scan().expect("scan succeeds"));
        Ok(())
    }

    #[test]
    fn test_touch_triggers_exactly_one_rebuild() -> io::Result<()> {
        let (dir, paths) = fixture()?;
        let start = SystemTime::now();
        let mut watcher = Watcher::with_baseline(paths, Duration::from_secs(1), start);

        let later = start + Duration::from_secs(30);
        touch(&dir.path().join("src/blog/post.html"), later)?;
        assert!(watcher.scan().expect("scan succeeds"));
        assert!(watcher.baseline() > later - Duration::from_secs(1));
        assert!(!watcher.scan().expect("scan succeeds"));
        Ok(())
    }

    #[test]
    fn test_several_changes_advance_to_newest() -> io::Result<()> {
        let (dir, paths) = fixture()?;
        let start = SystemTime::now();
        let mut watcher = Watcher::with_baseline(paths, Duration::from_secs(1), start);

        let newest = start + Duration::from_secs(60);
        touch(&dir.path().join("src/blog/post.html"), newest)?;
        touch(&dir.path().join("base.html"), start + Duration::from_secs(20))?;
        assert!(watcher.scan().expect("scan succeeds"));
        assert!(watcher.baseline() > newest - Duration::from_secs(1));

        // an older change than the newest one seen is not a new change
        touch(&dir.path().join("base.html"), start + Duration::from_secs(40))?;
        assert!(!watcher.scan().expect("scan succeeds"));
        Ok(())
    }

    #[test]
    fn test_missing_data_dir_is_skipped() -> io::Result<()> {
        let (dir, mut paths) = fixture()?;
        paths.insert(1, dir.path().join("data"));
        let start = SystemTime::now();
        let mut watcher = Watcher::with_baseline(paths, Duration::from_secs(1), start);
        assert!(!watcher.scan().expect("missing paths are skipped"));

        touch(&dir.path().join("src/blog/post.html"), start + Duration::from_secs(30))?;
        assert!(watcher.scan().expect("missing paths are skipped"));

        let scan = latest_modification(&watcher.paths).expect("scan succeeds");
        assert_eq!(vec![dir.path().join("data")], scan.missing);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_path_abandons_scan() -> io::Result<()> {
        let (dir, mut paths) = fixture()?;
        // a path through a regular file fails with something other than
        // NotFound
        paths.push(dir.path().join("base.html/nested"));
        let baseline = SystemTime::UNIX_EPOCH;
        let mut watcher = Watcher::with_baseline(paths, Duration::from_secs(1), baseline);
        assert!(matches!(watcher.scan(), Err(Error::Stat { .. })));
        assert_eq!(baseline, watcher.baseline());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_rebuilds_after_change() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        create_dir_all(root.join("src"))?;
        create_dir_all(root.join("data"))?;
        write(root.join("base.html"), "{{block \"content\" .}}{{end}}")?;
        write(root.join("src/index.html"), "{{define \"content\"}}one{{end}}")?;
        let config = Config {
            input_dir: root.join("src"),
            output_dir: root.join("out"),
            data_dir: root.join("data"),
            templates: vec![root.join("base.html")],
            poll_interval: Duration::from_millis(20),
            ..Config::default()
        };

        let builder = Builder::new(config.clone());
        builder.build().await.expect("initial build");
        let watcher = Watcher::new(config.watched_paths(), config.poll_interval);
        let handle = tokio::spawn(watcher.run(builder));

        write(root.join("src/index.html"), "{{define \"content\"}}two{{end}}")?;
        touch(&root.join("src/index.html"), SystemTime::now() + Duration::from_secs(5))?;

        let output = root.join("out/index.html");
        let mut rendered = String::new();
        for _ in 0..250 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            rendered = std::fs::read_to_string(&output).unwrap_or_default();
            if rendered == "two" {
                break;
            }
        }
        handle.abort();
        assert_eq!("two", rendered);
        Ok(())
    }
}
