//! Directory archiving with periodic progress.
//!
//! `ZipArchiver` walks the source directory on a blocking thread and writes a
//! deflated zip. While it runs, a `ProgressTicker` reports the bytes read so
//! far every ten seconds, followed by exactly one `done` call once archiving
//! has ended (successfully or not).

use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Receives archive progress.
pub trait ProgressSink: Send + Sync + 'static {
    fn progress(&self, path: &str, processed: u64, total: u64, percent: f64);
    fn done(&self, total: u64);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub files: u64,
    /// Uncompressed bytes read from the source.
    pub source_bytes: u64,
    pub archive_bytes: u64,
}

#[async_trait]
pub trait ArchiveProducer: Send + Sync {
    async fn produce(
        &self,
        source: &Path,
        target: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> anyhow::Result<ArchiveSummary>;
}

/// Shared counters written by the archiver and read by the ticker.
#[derive(Debug, Default)]
pub struct ProgressState {
    processed: AtomicU64,
    total: u64,
    current: Mutex<String>,
}

impl ProgressState {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn add(&self, bytes: u64) {
        self.processed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_current(&self, path: &Path) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = path.display().to_string();
    }

    fn snapshot(&self) -> (String, u64, f64) {
        let processed = self.processed.load(Ordering::Relaxed);
        let percent = if self.total == 0 {
            100.0
        } else {
            processed as f64 / self.total as f64 * 100.0
        };
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner()).clone();
        (current, processed, percent)
    }
}

/// Periodic progress reporter. Dropping it without `stop` still ends the
/// background task, but `done` is then delivered asynchronously.
pub struct ProgressTicker {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn start(state: Arc<ProgressState>, sink: Arc<dyn ProgressSink>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let (current, processed, percent) = state.snapshot();
                        sink.progress(&current, processed, state.total, percent);
                    }
                }
            }
            sink.done(state.total);
        });
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Stop ticking and wait until `done` has been delivered.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Progress ticker ended abnormally");
            }
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Zip archiver backed by `walkdir` and `zip`.
#[derive(Debug, Clone)]
pub struct ZipArchiver {
    period: Duration,
}

impl Default for ZipArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipArchiver {
    pub fn new() -> Self {
        Self {
            period: PROGRESS_INTERVAL,
        }
    }
}

#[async_trait]
impl ArchiveProducer for ZipArchiver {
    async fn produce(
        &self,
        source: &Path,
        target: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> anyhow::Result<ArchiveSummary> {
        let meta = tokio::fs::metadata(source)
            .await
            .with_context(|| format!("Failed to stat source {}", source.display()))?;
        if !meta.is_dir() {
            bail!("source path is not a directory: {}", source.display());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let source = source.to_path_buf();
        let target = target.to_path_buf();
        info!(source = %source.display(), target = %target.display(), "Archiving");

        let walk_root = source.clone();
        let total = tokio::task::spawn_blocking(move || total_size(&walk_root))
            .await
            .context("size scan task failed")??;

        let state = Arc::new(ProgressState::new(total));
        let ticker = ProgressTicker::start(state.clone(), progress, self.period);

        let result = tokio::task::spawn_blocking(move || write_zip(&source, &target, &state))
            .await
            .context("archive task failed");
        ticker.stop().await;

        let summary = result??;
        debug!(
            files = summary.files,
            source_bytes = summary.source_bytes,
            archive_bytes = summary.archive_bytes,
            "Archive complete"
        );
        Ok(summary)
    }
}

fn total_size(source: &Path) -> anyhow::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.context("Failed to walk source")?;
        if entry.file_type().is_file() {
            total += entry.metadata().context("Failed to read metadata")?.len();
        }
    }
    Ok(total)
}

/// Entry name inside the archive: the source directory's own name followed
/// by the relative path, always `/`-separated.
fn entry_name(base: &str, relative: &Path) -> String {
    let mut name = base.to_string();
    for part in relative.components() {
        name.push('/');
        name.push_str(&part.as_os_str().to_string_lossy());
    }
    name
}

struct CountingReader<'a, R> {
    inner: R,
    state: &'a ProgressState,
}

impl<R: Read> Read for CountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.state.add(n as u64);
        Ok(n)
    }
}

fn write_zip(source: &Path, target: &Path, state: &ProgressState) -> anyhow::Result<ArchiveSummary> {
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "backup".to_string());

    let file = File::create(target)
        .with_context(|| format!("Failed to create {}", target.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut files = 0u64;
    let mut source_bytes = 0u64;

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.context("Failed to walk source")?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("walked outside the source directory")?;
        let name = entry_name(&base, relative);

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)
                .with_context(|| format!("Failed to add directory {}", name))?;
            continue;
        }
        if !entry.file_type().is_file() {
            debug!(path = %entry.path().display(), "Skipping non-regular file");
            continue;
        }

        let len = entry.metadata().context("Failed to read metadata")?.len();
        zip.start_file(name.as_str(), options.large_file(len >= u32::MAX as u64))
            .with_context(|| format!("Failed to add {}", name))?;

        state.set_current(entry.path());
        let reader = File::open(entry.path())
            .with_context(|| format!("Failed to open {}", entry.path().display()))?;
        let mut reader = CountingReader { inner: reader, state };
        source_bytes += std::io::copy(&mut reader, &mut zip)
            .with_context(|| format!("Failed to compress {}", entry.path().display()))?;
        files += 1;
    }

    let mut writer = zip.finish().context("Failed to finalize zip archive")?;
    std::io::Write::flush(&mut writer).context("Failed to flush zip archive")?;
    drop(writer);

    let archive_bytes = std::fs::metadata(target)
        .with_context(|| format!("Failed to stat {}", target.display()))?
        .len();

    Ok(ArchiveSummary {
        path: target.to_path_buf(),
        files,
        source_bytes,
        archive_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        ticks: AtomicUsize,
        done: AtomicUsize,
        done_total: AtomicU64,
        after_done: AtomicUsize,
    }

    impl ProgressSink for Recorder {
        fn progress(&self, _path: &str, _processed: u64, _total: u64, _percent: f64) {
            if self.done.load(Ordering::SeqCst) > 0 {
                self.after_done.fetch_add(1, Ordering::SeqCst);
            }
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn done(&self, total: u64) {
            self.done.fetch_add(1, Ordering::SeqCst);
            self.done_total.store(total, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_emits_then_done_once() {
        let recorder = Arc::new(Recorder::default());
        let state = Arc::new(ProgressState::new(1000));
        let ticker = ProgressTicker::start(state.clone(), recorder.clone(), PROGRESS_INTERVAL);

        state.add(250);
        tokio::time::sleep(Duration::from_secs(25)).await;
        ticker.stop().await;

        assert_eq!(recorder.ticks.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.done.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.done_total.load(Ordering::SeqCst), 1000);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(recorder.ticks.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.after_done.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stopped_early_only_reports_done() {
        let recorder = Arc::new(Recorder::default());
        let ticker = ProgressTicker::start(
            Arc::new(ProgressState::new(0)),
            recorder.clone(),
            PROGRESS_INTERVAL,
        );
        ticker.stop().await;
        assert_eq!(recorder.ticks.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_percent_of_empty_source_is_complete() {
        let state = ProgressState::new(0);
        assert_eq!(state.snapshot().2, 100.0);
        let state = ProgressState::new(200);
        state.add(50);
        assert_eq!(state.snapshot().2, 25.0);
    }

    #[test]
    fn test_entry_name_uses_forward_slashes() {
        assert_eq!(entry_name("data", Path::new("")), "data");
        assert_eq!(entry_name("data", Path::new("a/b.txt")), "data/a/b.txt");
    }

    #[tokio::test]
    async fn test_zip_directory() {
        let src = tempfile::tempdir().unwrap();
        let data = src.path().join("data");
        std::fs::create_dir_all(data.join("nested")).unwrap();
        std::fs::write(data.join("a.txt"), "hello").unwrap();
        std::fs::write(data.join("nested/b.txt"), "world!").unwrap();

        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("staging/nightly_2024_01_01.zip");
        let recorder = Arc::new(Recorder::default());
        let summary = ZipArchiver::new()
            .produce(&data, &target, recorder.clone())
            .await
            .unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.source_bytes, 11);
        assert!(summary.archive_bytes > 0);
        assert_eq!(recorder.done.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.done_total.load(Ordering::SeqCst), 11);

        let mut archive = zip::ZipArchive::new(File::open(&target).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(|n| n.to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["data/", "data/a.txt", "data/nested/", "data/nested/b.txt"]);

        let mut contents = String::new();
        archive
            .by_name("data/nested/b.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "world!");
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let out = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let result = ZipArchiver::new()
            .produce(&out.path().join("nope"), &out.path().join("x.zip"), recorder.clone())
            .await;
        assert!(result.is_err());
        assert_eq!(recorder.done.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_file_source_fails() {
        let out = tempfile::tempdir().unwrap();
        let file = out.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();
        let err = ZipArchiver::new()
            .produce(&file, &out.path().join("x.zip"), Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }
}
