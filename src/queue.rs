//! Durable offline queue for executions that could not be uploaded.
//!
//! The queue is a directory of append-only segment files. Each enqueue writes
//! one new segment; readers consume segments oldest first.
//!
//! # Layout
//!
//! ```text
//! <dir>/
//! ├── queue.lock            cross-process exclusive lock (fs2)
//! ├── segments/
//! │   ├── 1718000000000-0000004242-00000001.jsonl
//! │   └── 1718000000150-0000004242-00000002.jsonl
//! └── claims/
//!     └── <first segment>-<claim key>.jsonl   records leased to an upload
//! ```
//!
//! Each line of a segment or claim file is `<checksum>\t<json>\n`, where the
//! checksum is the first 8 bytes of the SHA-256 of the JSON text in hex. A
//! line whose checksum or JSON does not verify, or a trailing line with no
//! newline (a write interrupted by a crash), is discarded with a warning and
//! never returned to callers.
//!
//! Files are written to a `.tmp` sibling, fsynced and renamed into place, so a
//! crash never damages a segment that was already persisted.
//!
//! # Leases
//!
//! [`OfflineQueue::claim`] moves the oldest records into a claim file and
//! hands them out as a [`QueueLease`]. Completing the lease deletes the claim;
//! releasing it puts the records back at the head of the queue. A claim left
//! behind by a crashed process is restored by [`OfflineQueue::cleanup`], so
//! delivery is at-least-once.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::error::{TelemetryError, TelemetryResult};
use crate::execution::TestExecution;
use crate::upload::RetryPolicy;

const SEGMENT_EXTENSION: &str = "jsonl";
const TEMP_EXTENSION: &str = "tmp";
const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_CLAIM_GRACE: Duration = Duration::from_secs(10 * 60);

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Outcome of [`OfflineQueue::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Segments deleted because they outlived the retention window.
    pub expired_segments: usize,
    /// Records contained in the expired segments.
    pub expired_records: usize,
    /// Claims of crashed uploads put back into the queue.
    pub restored_claims: usize,
    /// Segments rewritten or removed because they held corrupt lines.
    pub repaired_segments: usize,
    /// Interrupted `.tmp` writes removed.
    pub removed_temp_files: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Records handed out by [`OfflineQueue::claim`].
///
/// Call [`QueueLease::complete`] once the records are delivered, or
/// [`QueueLease::release`] to return them. A lease dropped without either
/// stays claimed until [`OfflineQueue::cleanup`] restores it.
#[derive(Debug)]
pub struct QueueLease {
    records: Vec<TestExecution>,
    claim_path: PathBuf,
    restore_path: PathBuf,
}

impl QueueLease {
    pub fn records(&self) -> &[TestExecution] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Permanently removes the leased records.
    pub fn complete(self) -> TelemetryResult<Vec<TestExecution>> {
        match fs::remove_file(&self.claim_path) {
            Ok(()) => {}
            // Cleared or restored underneath us; the records are gone from the claim either way.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.records)
    }

    /// Returns the leased records to the head of the queue.
    pub fn release(self) -> TelemetryResult<()> {
        match fs::rename(&self.claim_path, &self.restore_path) {
            Ok(()) => {
                debug!("Released {} queued records", self.records.len());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Claim {} vanished before release",
                    self.claim_path.display()
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Directory-backed FIFO of [`TestExecution`]s.
///
/// Cloning is cheap; clones share the in-process lock.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    dir: PathBuf,
    segments_dir: PathBuf,
    claims_dir: PathBuf,
    lock_path: PathBuf,
    max_records: usize,
    retention: Duration,
    claim_grace: Duration,
    local: Arc<Mutex<()>>,
}

struct QueueLock<'a> {
    _local: MutexGuard<'a, ()>,
    file: File,
}

impl Drop for QueueLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock offline queue: {}", e);
        }
    }
}

struct SegmentContents {
    records: Vec<TestExecution>,
    discarded: usize,
}

impl OfflineQueue {
    /// Opens (creating if needed) the queue rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Io`] if the directories cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> TelemetryResult<Self> {
        let dir = dir.into();
        let segments_dir = dir.join("segments");
        let claims_dir = dir.join("claims");
        fs::create_dir_all(&segments_dir)?;
        fs::create_dir_all(&claims_dir)?;

        Ok(Self {
            lock_path: dir.join("queue.lock"),
            dir,
            segments_dir,
            claims_dir,
            max_records: 0,
            retention: DEFAULT_RETENTION,
            claim_grace: DEFAULT_CLAIM_GRACE,
            local: Arc::new(Mutex::new(())),
        })
    }

    /// Opens the queue described by the configuration.
    ///
    /// A claim counts as orphaned once twice the longest possible upload
    /// (every attempt timing out, every backoff slept) has passed, so a
    /// replay still retrying in another process keeps its lease.
    pub fn from_config(config: &TelemetryConfig) -> TelemetryResult<Self> {
        let longest_upload = RetryPolicy::from_config(config).worst_case(config.upload_timeout());
        Ok(Self::open(config.offline_queue_path())?
            .with_max_records(config.offline_queue_max_records)
            .with_retention(config.retention())
            .with_claim_grace(longest_upload.saturating_mul(2)))
    }

    /// Caps the number of queued records; `0` means unbounded.
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    /// Sets how long a segment is kept before cleanup deletes it.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets how old a claim must be before cleanup treats it as orphaned.
    pub fn with_claim_grace(mut self, grace: Duration) -> Self {
        self.claim_grace = grace;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably appends records to the tail of the queue.
    ///
    /// Returns the number of records written.
    pub fn enqueue(&self, executions: &[TestExecution]) -> TelemetryResult<usize> {
        if executions.is_empty() {
            return Ok(0);
        }

        let _lock = self.lock()?;
        let path = self
            .segments_dir
            .join(format!("{}.{}", next_key(), SEGMENT_EXTENSION));
        write_records(&path, executions)?;
        debug!(
            "Queued {} records in {}",
            executions.len(),
            path.display()
        );

        self.enforce_capacity()?;
        Ok(executions.len())
    }

    /// Leases up to `max_count` of the oldest records.
    ///
    /// Returns `None` when the queue is empty. Records in a lease are never
    /// returned by another claim, in this process or any other.
    pub fn claim(&self, max_count: usize) -> TelemetryResult<Option<QueueLease>> {
        if max_count == 0 {
            return Ok(None);
        }

        let _lock = self.lock()?;
        let mut taken: Vec<TestExecution> = Vec::new();
        let mut consumed: Vec<PathBuf> = Vec::new();
        let mut remainder: Option<(PathBuf, Vec<TestExecution>)> = None;
        let mut first_stem: Option<String> = None;

        for path in self.segments()? {
            if taken.len() >= max_count {
                break;
            }
            let contents = match read_records(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("Skipping unreadable segment {}: {}", path.display(), e);
                    continue;
                }
            };
            if first_stem.is_none() {
                first_stem = file_stem(&path);
            }

            let wanted = max_count - taken.len();
            let mut records = contents.records;
            if records.len() <= wanted {
                taken.append(&mut records);
                consumed.push(path);
            } else {
                let rest = records.split_off(wanted);
                taken.append(&mut records);
                remainder = Some((path, rest));
            }
        }

        if taken.is_empty() {
            // Nothing but corrupt segments.
            for path in consumed {
                remove_quietly(&path);
            }
            return Ok(None);
        }

        // The claim is named after the oldest segment it drew from, so a
        // release sorts ahead of whatever is left of that segment.
        let claim_name = format!(
            "{}-{}.{}",
            first_stem.unwrap_or_else(next_key),
            next_key(),
            SEGMENT_EXTENSION
        );
        let claim_path = self.claims_dir.join(&claim_name);
        write_records(&claim_path, &taken)?;

        for path in consumed {
            fs::remove_file(&path)?;
        }
        if let Some((path, rest)) = remainder {
            write_records(&path, &rest)?;
        }

        debug!("Claimed {} queued records", taken.len());
        Ok(Some(QueueLease {
            records: taken,
            claim_path,
            restore_path: self.segments_dir.join(claim_name),
        }))
    }

    /// Removes and returns up to `max_count` of the oldest records.
    pub fn dequeue(&self, max_count: usize) -> TelemetryResult<Vec<TestExecution>> {
        match self.claim(max_count)? {
            Some(lease) => lease.complete(),
            None => Ok(Vec::new()),
        }
    }

    /// Number of readable records waiting in the queue. Leased records are
    /// not counted.
    pub fn len(&self) -> TelemetryResult<usize> {
        let _lock = self.lock()?;
        let mut total = 0;
        for path in self.segments()? {
            match read_records(&path) {
                Ok(contents) => total += contents.records.len(),
                Err(e) => warn!("Skipping unreadable segment {}: {}", path.display(), e),
            }
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> TelemetryResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Deletes every queued and leased record. Returns how many queued
    /// records were removed.
    pub fn clear(&self) -> TelemetryResult<usize> {
        let _lock = self.lock()?;
        let mut removed = 0;
        for path in self.segments()? {
            removed += read_records(&path).map(|c| c.records.len()).unwrap_or(0);
            fs::remove_file(&path)?;
        }
        for dir in [&self.segments_dir, &self.claims_dir] {
            for path in list_files(dir, None)? {
                remove_quietly(&path);
            }
        }
        info!("Cleared {} records from the offline queue", removed);
        Ok(removed)
    }

    /// Removes expired and orphaned storage artifacts.
    ///
    /// * Segments older than the retention window are deleted.
    /// * Claims older than the claim grace are restored to the queue.
    /// * Segments with corrupt lines are rewritten without them.
    /// * Leftover `.tmp` files are deleted.
    pub fn cleanup(&self) -> TelemetryResult<CleanupReport> {
        let _lock = self.lock()?;
        let mut report = CleanupReport::default();
        let now = SystemTime::now();

        for dir in [&self.segments_dir, &self.claims_dir] {
            for path in list_files(dir, Some(TEMP_EXTENSION))? {
                remove_quietly(&path);
                report.removed_temp_files += 1;
            }
        }

        for path in list_files(&self.claims_dir, Some(SEGMENT_EXTENSION))? {
            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age >= self.claim_grace)
                && let Some(name) = path.file_name()
            {
                fs::rename(&path, self.segments_dir.join(name))?;
                report.restored_claims += 1;
            }
        }

        for path in self.segments()? {
            let contents = match read_records(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("Skipping unreadable segment {}: {}", path.display(), e);
                    continue;
                }
            };

            if segment_age(&path, now).is_some_and(|age| age > self.retention) {
                fs::remove_file(&path)?;
                report.expired_segments += 1;
                report.expired_records += contents.records.len();
                continue;
            }

            if contents.discarded > 0 {
                if contents.records.is_empty() {
                    fs::remove_file(&path)?;
                } else {
                    write_records(&path, &contents.records)?;
                }
                report.repaired_segments += 1;
            }
        }

        if report.is_empty() {
            debug!("Offline queue cleanup found nothing to do");
        } else {
            info!(
                expired = report.expired_segments,
                restored = report.restored_claims,
                repaired = report.repaired_segments,
                temp = report.removed_temp_files,
                "Offline queue cleanup finished"
            );
        }
        Ok(report)
    }

    /// Runs a queue operation on the blocking thread pool.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn demo(queue: testpulse::queue::OfflineQueue) -> testpulse::TelemetryResult<()> {
    /// let size = queue.blocking(|q| q.len()).await?;
    /// println!("{} records waiting", size);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn blocking<T, F>(&self, op: F) -> TelemetryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&OfflineQueue) -> TelemetryResult<T> + Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || op(&queue))
            .await
            .map_err(|e| TelemetryError::Storage(format!("queue task failed: {}", e)))?
    }

    fn lock(&self) -> TelemetryResult<QueueLock<'_>> {
        let local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(QueueLock {
            _local: local,
            file,
        })
    }

    fn segments(&self) -> TelemetryResult<Vec<PathBuf>> {
        list_files(&self.segments_dir, Some(SEGMENT_EXTENSION))
    }

    /// Drops the oldest segments until the queue fits `max_records`. The
    /// newest segment is always kept.
    fn enforce_capacity(&self) -> TelemetryResult<()> {
        if self.max_records == 0 {
            return Ok(());
        }

        let segments = self.segments()?;
        let counts: Vec<usize> = segments.iter().map(|p| count_lines(p)).collect();
        let mut total: usize = counts.iter().sum();
        let mut dropped = 0;

        for (path, count) in segments.iter().zip(&counts).take(segments.len().saturating_sub(1)) {
            if total <= self.max_records {
                break;
            }
            fs::remove_file(path)?;
            total -= count;
            dropped += count;
        }

        if dropped > 0 {
            warn!(
                "Offline queue over capacity ({}), dropped {} oldest records",
                self.max_records, dropped
            );
        }
        Ok(())
    }
}

/// Zero-padded `<unix_millis>-<pid>-<counter>` key; lexical order is
/// creation order within a process.
fn next_key() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let counter = SEQUENCE.fetch_add(1, Ordering::Relaxed) % 100_000_000;
    format!("{:013}-{:010}-{:08}", millis, std::process::id(), counter)
}

fn checksum(json: &str) -> String {
    let digest = Sha256::digest(json.as_bytes());
    hex::encode(&digest[..8])
}

fn write_records(path: &Path, records: &[TestExecution]) -> TelemetryResult<()> {
    let tmp = path.with_extension(TEMP_EXTENSION);
    let mut writer = BufWriter::new(File::create(&tmp)?);
    for record in records {
        let json = serde_json::to_string(record)?;
        writeln!(writer, "{}\t{}", checksum(&json), json)?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_records(path: &Path) -> TelemetryResult<SegmentContents> {
    let bytes = fs::read(path)?;
    let mut records = Vec::new();
    let mut discarded = 0;
    let mut rest: &[u8] = &bytes;

    while !rest.is_empty() {
        let Some(end) = rest.iter().position(|&b| b == b'\n') else {
            warn!("Discarding unterminated record in {}", path.display());
            discarded += 1;
            break;
        };
        let line = &rest[..end];
        rest = &rest[end + 1..];
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(record) => records.push(record),
            None => {
                warn!("Discarding corrupt record in {}", path.display());
                discarded += 1;
            }
        }
    }

    Ok(SegmentContents { records, discarded })
}

fn parse_line(line: &[u8]) -> Option<TestExecution> {
    let line = std::str::from_utf8(line).ok()?;
    let (sum, json) = line.split_once('\t')?;
    if sum != checksum(json) {
        return None;
    }
    serde_json::from_str(json).ok()
}

fn count_lines(path: &Path) -> usize {
    fs::read(path)
        .map(|bytes| bytes.iter().filter(|&&b| b == b'\n').count())
        .unwrap_or(0)
}

/// Lists files in `dir`, sorted by file name. Restored claims sort ahead of
/// the segment they came from because `-` orders before `.`.
fn list_files(dir: &Path, extension: Option<&str>) -> TelemetryResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| match extension {
            Some(ext) => path.extension().is_some_and(|e| e == ext),
            None => true,
        })
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Age of a segment from the timestamp in its key, falling back to mtime.
fn segment_age(path: &Path, now: SystemTime) -> Option<Duration> {
    let created = file_stem(path)
        .and_then(|stem| stem.get(..13).and_then(|millis| millis.parse::<u64>().ok()))
        .map(|millis| UNIX_EPOCH + Duration::from_millis(millis))
        .or_else(|| fs::metadata(path).and_then(|m| m.modified()).ok())?;
    now.duration_since(created).ok()
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::test_support::sample_execution;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn names(records: &[TestExecution]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.identity.fully_qualified_name.clone())
            .collect()
    }

    fn batch(names: &[&str]) -> Vec<TestExecution> {
        names.iter().map(|n| sample_execution(n)).collect()
    }

    fn only_segment(queue: &OfflineQueue) -> PathBuf {
        let segments = queue.segments().unwrap();
        assert_eq!(segments.len(), 1);
        segments[0].clone()
    }

    #[test]
    fn test_enqueue_dequeue_roundtrip() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        let records = batch(&["a", "b", "c"]);

        assert_eq!(queue.enqueue(&records).unwrap(), 3);
        assert_eq!(queue.len().unwrap(), 3);

        let out = queue.dequeue(3).unwrap();
        assert_eq!(out, records);
        assert_eq!(queue.len().unwrap(), 0);
    }

    #[test]
    fn test_dequeue_is_fifo_across_segments() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.enqueue(&batch(&["a", "b"])).unwrap();
        queue.enqueue(&batch(&["c", "d", "e"])).unwrap();

        assert_eq!(names(&queue.dequeue(3).unwrap()), vec!["a", "b", "c"]);
        assert_eq!(queue.len().unwrap(), 2);
        assert_eq!(names(&queue.dequeue(10).unwrap()), vec!["d", "e"]);
        assert!(queue.dequeue(10).unwrap().is_empty());
    }

    #[test]
    fn test_dequeue_zero_or_empty() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        assert!(queue.dequeue(5).unwrap().is_empty());

        queue.enqueue(&batch(&["a"])).unwrap();
        assert!(queue.dequeue(0).unwrap().is_empty());
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let queue = OfflineQueue::open(dir.path()).unwrap();
            queue.enqueue(&batch(&["persisted"])).unwrap();
        }
        let queue = OfflineQueue::open(dir.path()).unwrap();
        assert_eq!(names(&queue.dequeue(1).unwrap()), vec!["persisted"]);
    }

    #[test]
    fn test_truncated_trailing_record_is_discarded() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.enqueue(&batch(&["a", "b"])).unwrap();

        let segment = only_segment(&queue);
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(b"0123456789abcdef\t{\"executionId\":\"trunc").unwrap();
        drop(file);

        assert_eq!(queue.len().unwrap(), 2);
        assert_eq!(names(&queue.dequeue(10).unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn test_checksum_mismatch_is_discarded() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.enqueue(&batch(&["a", "b"])).unwrap();

        let segment = only_segment(&queue);
        let content = fs::read_to_string(&segment).unwrap();
        let tampered = content.replacen("\"a\"", "\"z\"", 1);
        assert_ne!(content, tampered);
        fs::write(&segment, tampered).unwrap();

        assert_eq!(names(&queue.dequeue(10).unwrap()), vec!["b"]);
    }

    #[test]
    fn test_released_lease_returns_to_head() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.enqueue(&batch(&["a", "b", "c"])).unwrap();

        let lease = queue.claim(2).unwrap().unwrap();
        assert_eq!(names(lease.records()), vec!["a", "b"]);
        assert_eq!(queue.len().unwrap(), 1);

        queue.enqueue(&batch(&["d"])).unwrap();
        lease.release().unwrap();

        assert_eq!(
            names(&queue.dequeue(10).unwrap()),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn test_completed_lease_is_gone() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.enqueue(&batch(&["a", "b"])).unwrap();

        let lease = queue.claim(5).unwrap().unwrap();
        assert_eq!(lease.len(), 2);
        lease.complete().unwrap();

        assert_eq!(queue.len().unwrap(), 0);
        assert!(list_files(&queue.claims_dir, None).unwrap().is_empty());
    }

    #[test]
    fn test_claims_are_exclusive_across_threads() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        let names: Vec<String> = (0..100).map(|i| format!("t{}", i)).collect();
        for chunk in names.chunks(10) {
            let records: Vec<TestExecution> = chunk.iter().map(|n| sample_execution(n)).collect();
            queue.enqueue(&records).unwrap();
        }

        let seen = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let queue = queue.clone();
                let seen = &seen;
                scope.spawn(move || {
                    loop {
                        let records = queue.dequeue(7).unwrap();
                        if records.is_empty() {
                            break;
                        }
                        seen.lock().unwrap().extend(records.into_iter().map(|r| r.execution_id));
                    }
                });
            }
        });

        let seen = seen.into_inner().unwrap();
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 100);
        assert_eq!(unique.len(), 100);
    }

    #[test]
    fn test_separately_opened_queues_share_the_file_lock() {
        // Each handle has its own in-process mutex, as separate processes
        // would; only the lock file keeps them apart.
        const PRODUCERS: usize = 4;
        const BATCHES: usize = 25;

        let dir = TempDir::new().unwrap();
        let produced = AtomicU64::new(0);
        let seen = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for producer in 0..PRODUCERS {
                let queue = OfflineQueue::open(dir.path()).unwrap();
                let produced = &produced;
                scope.spawn(move || {
                    for i in 0..BATCHES {
                        let first = format!("p{}::a{}", producer, i);
                        let second = format!("p{}::b{}", producer, i);
                        let records = batch(&[first.as_str(), second.as_str()]);
                        queue.enqueue(&records).unwrap();
                    }
                    produced.fetch_add(1, Ordering::SeqCst);
                });
            }
            for _ in 0..4 {
                let queue = OfflineQueue::open(dir.path()).unwrap();
                let produced = &produced;
                let seen = &seen;
                scope.spawn(move || {
                    loop {
                        let finished = produced.load(Ordering::SeqCst) == PRODUCERS as u64;
                        let records = queue.dequeue(5).unwrap();
                        if records.is_empty() {
                            if finished {
                                break;
                            }
                            std::thread::yield_now();
                            continue;
                        }
                        seen.lock().unwrap().extend(records.into_iter().map(|r| r.execution_id));
                    }
                });
            }
        });

        let seen = seen.into_inner().unwrap();
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), PRODUCERS * BATCHES * 2);
        assert_eq!(unique.len(), seen.len());
        assert!(OfflineQueue::open(dir.path()).unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_claim_grace_outlasts_a_retrying_upload() {
        let dir = TempDir::new().unwrap();
        let mut config = TelemetryConfig::new("key", "proj", "https://ingest.example.com");
        config.offline_queue_dir = dir.path().display().to_string();
        config.upload_timeout_ms = 1_000;
        config.max_retries = 3;
        config.retry_backoff = crate::config::BackoffKind::Fixed;
        config.retry_delay_ms = 500;

        let queue = OfflineQueue::from_config(&config).unwrap();
        // 4 attempts of 1s plus 3 delays of 0.5s, doubled.
        assert_eq!(queue.claim_grace, Duration::from_millis(11_000));
        assert!(queue.claim_grace > config.upload_timeout() * 2);
    }

    #[test]
    fn test_capacity_drops_oldest_segments() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap().with_max_records(4);
        queue.enqueue(&batch(&["a", "b"])).unwrap();
        queue.enqueue(&batch(&["c", "d"])).unwrap();
        queue.enqueue(&batch(&["e", "f"])).unwrap();

        assert_eq!(names(&queue.dequeue(10).unwrap()), vec!["c", "d", "e", "f"]);
    }

    #[test]
    fn test_capacity_keeps_newest_segment() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap().with_max_records(1);
        queue.enqueue(&batch(&["a", "b", "c"])).unwrap();
        assert_eq!(queue.len().unwrap(), 3);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.enqueue(&batch(&["a", "b"])).unwrap();
        queue.enqueue(&batch(&["c"])).unwrap();
        let _lease = queue.claim(1).unwrap();

        assert_eq!(queue.clear().unwrap(), 2);
        assert_eq!(queue.len().unwrap(), 0);
        assert!(list_files(&queue.claims_dir, None).unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_expires_old_segments() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        let old = queue
            .segments_dir
            .join("0000000001000-0000000001-00000001.jsonl");
        write_records(&old, &batch(&["ancient"])).unwrap();
        queue.enqueue(&batch(&["fresh"])).unwrap();

        let report = queue.cleanup().unwrap();
        assert_eq!(report.expired_segments, 1);
        assert_eq!(report.expired_records, 1);
        assert_eq!(names(&queue.dequeue(10).unwrap()), vec!["fresh"]);
    }

    #[test]
    fn test_cleanup_restores_orphaned_claims() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path())
            .unwrap()
            .with_claim_grace(Duration::ZERO);
        queue.enqueue(&batch(&["a", "b"])).unwrap();

        let lease = queue.claim(2).unwrap().unwrap();
        std::mem::forget(lease);
        assert_eq!(queue.len().unwrap(), 0);

        let report = queue.cleanup().unwrap();
        assert_eq!(report.restored_claims, 1);
        assert_eq!(names(&queue.dequeue(10).unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn test_cleanup_keeps_fresh_claims() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.enqueue(&batch(&["a"])).unwrap();
        let lease = queue.claim(1).unwrap().unwrap();

        assert_eq!(queue.cleanup().unwrap().restored_claims, 0);
        lease.complete().unwrap();
    }

    #[test]
    fn test_cleanup_repairs_and_removes_temp_files() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.enqueue(&batch(&["a"])).unwrap();

        let segment = only_segment(&queue);
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(b"garbage\n").unwrap();
        drop(file);
        fs::write(queue.segments_dir.join("partial.tmp"), b"half").unwrap();

        let report = queue.cleanup().unwrap();
        assert_eq!(report.repaired_segments, 1);
        assert_eq!(report.removed_temp_files, 1);
        assert_eq!(count_lines(&segment), 1);
        assert!(queue.cleanup().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocking_wrapper() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        let records = batch(&["async"]);

        let written = queue
            .blocking(move |q| q.enqueue(&records))
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(queue.blocking(|q| q.len()).await.unwrap(), 1);
    }
}
