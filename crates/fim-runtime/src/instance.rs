//! Instance Registry: one claim file per running instance.
//!
//! Each running instance owns `<data>/instances/<index>.json`. The smallest
//! free index is taken by hard-linking a fully written temp file onto the
//! slot name, which fails atomically when another process got there first.
//! Claims whose owner is gone are pruned when encountered. Claiming, listing
//! and pruning hold an exclusive lock on `<data>/instances/.lock`, so a
//! claim is never pruned by a process that read its stale predecessor.
//!
//! An owner is alive when its pid exists and, if the claim recorded one, its
//! start time still matches. A recycled pid does not keep a claim alive.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fim_common::error::{FimError, Result};
use fim_core::namespace::{is_alive, process_start_ticks};
use fim_image::lock::DataLock;
use serde::{Deserialize, Serialize};

/// Contents of a claim file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Pid of the `fim` process that owns the instance.
    pub pid: u32,
    /// Pid of the sandboxed program, once bubblewrap reports it.
    pub sandbox_pid: Option<u32>,
    /// User id inside the sandbox.
    pub uid: u32,
    /// Group id inside the sandbox.
    pub gid: u32,
    /// When the instance was claimed.
    pub started_at: DateTime<Utc>,
    /// Start time of `pid` in clock ticks since boot.
    #[serde(default)]
    pub start_ticks: Option<u64>,
}

impl InstanceRecord {
    /// A record for the current process.
    #[must_use]
    pub fn current(uid: u32, gid: u32) -> Self {
        let pid = std::process::id();
        Self {
            pid,
            sandbox_pid: None,
            uid,
            gid,
            started_at: Utc::now(),
            start_ticks: process_start_ticks(pid),
        }
    }

    /// Whether the owning process is still the one that claimed.
    #[must_use]
    pub fn is_live(&self) -> bool {
        is_alive(self.pid)
            && self
                .start_ticks
                .is_none_or(|ticks| process_start_ticks(self.pid) == Some(ticks))
    }
}

const LOCK_FILE: &str = ".lock";

/// A live instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Registry index.
    pub index: usize,
    /// Claim contents.
    pub record: InstanceRecord,
}

/// The instances directory of one data directory.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    dir: PathBuf,
}

impl InstanceRegistry {
    /// Opens the registry at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Claims the smallest free index for `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry directory cannot be written.
    pub fn claim(&self, record: InstanceRecord) -> Result<InstanceClaim> {
        std::fs::create_dir_all(&self.dir).map_err(|e| FimError::io(&self.dir, e))?;
        let _lock = self.lock()?;
        let tmp = self.dir.join(format!(".claim.{}.tmp", std::process::id()));
        write_record(&tmp, &record)?;

        let mut index = 0;
        let claimed = loop {
            let slot = self.slot(index);
            match std::fs::hard_link(&tmp, &slot) {
                Ok(()) => break Ok(slot),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.prune_if_stale(&slot) {
                        continue;
                    }
                    index += 1;
                }
                Err(e) => break Err(FimError::io(&slot, e)),
            }
        };
        if let Err(e) = std::fs::remove_file(&tmp) {
            tracing::warn!(path = %tmp.display(), error = %e, "cannot remove claim temp file");
        }

        let path = claimed?;
        tracing::info!(index, pid = record.pid, "instance claimed");
        Ok(InstanceClaim {
            index,
            path,
            record,
        })
    }

    /// Live instances sorted by index. Stale claims are pruned.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<Instance>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let _lock = self.lock()?;
        self.list_locked()
    }

    /// Runs `f` under the registry lock when no process other than the
    /// current one holds a live claim. Returns `None` when others are
    /// running, in which case `f` is not called.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be locked or read.
    pub fn if_sole_instance<T>(&self, f: impl FnOnce() -> T) -> Result<Option<T>> {
        std::fs::create_dir_all(&self.dir).map_err(|e| FimError::io(&self.dir, e))?;
        let _lock = self.lock()?;
        let me = std::process::id();
        if self.list_locked()?.iter().any(|i| i.record.pid != me) {
            return Ok(None);
        }
        Ok(Some(f()))
    }

    fn lock(&self) -> Result<DataLock> {
        DataLock::acquire(&self.dir.join(LOCK_FILE))
    }

    fn list_locked(&self) -> Result<Vec<Instance>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FimError::io(&self.dir, e)),
        };

        let mut live = Vec::new();
        for entry in entries.filter_map(std::result::Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = name
                .strip_suffix(".json")
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            let path = entry.path();
            match read_record(&path) {
                Ok(record) if record.is_live() => live.push(Instance { index, record }),
                _ => {
                    let _ = self.prune_if_stale(&path);
                }
            }
        }
        live.sort_by_key(|i| i.index);
        Ok(live)
    }

    fn slot(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{index}.json"))
    }

    /// Removes `slot` if its owner is gone or it cannot be read. The caller
    /// holds the registry lock.
    fn prune_if_stale(&self, slot: &Path) -> bool {
        let stale = read_record(slot).map_or(true, |r| !r.is_live());
        if !stale {
            return false;
        }
        match std::fs::remove_file(slot) {
            Ok(()) => {
                tracing::debug!(path = %slot.display(), "pruned stale instance");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(path = %slot.display(), error = %e, "cannot prune stale instance");
                false
            }
        }
    }
}

/// A claimed index, released on drop.
#[derive(Debug)]
pub struct InstanceClaim {
    index: usize,
    path: PathBuf,
    record: InstanceRecord,
}

impl InstanceClaim {
    /// Claimed index.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Records the pid of the sandboxed program.
    ///
    /// # Errors
    ///
    /// Returns an error if the claim file cannot be rewritten.
    pub fn set_sandbox_pid(&mut self, pid: u32) -> Result<()> {
        self.record.sandbox_pid = Some(pid);
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        write_record(&tmp, &self.record)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| FimError::io(&self.path, e))?;
        tracing::debug!(index = self.index, sandbox_pid = pid, "instance updated");
        Ok(())
    }
}

impl Drop for InstanceClaim {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "cannot release instance claim");
        }
    }
}

fn write_record(path: &Path, record: &InstanceRecord) -> Result<()> {
    let json = serde_json::to_string(record)?;
    std::fs::write(path, json).map_err(|e| FimError::io(path, e))
}

fn read_record(path: &Path) -> Result<InstanceRecord> {
    let raw = std::fs::read_to_string(path).map_err(|e| FimError::io(path, e))?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_for(pid: u32) -> InstanceRecord {
        InstanceRecord {
            pid,
            sandbox_pid: None,
            uid: 1000,
            gid: 1000,
            started_at: Utc::now(),
            start_ticks: None,
        }
    }

    fn dead_pid() -> u32 {
        (4_000_000..4_194_304)
            .find(|p| !is_alive(*p))
            .expect("free pid")
    }

    #[test]
    fn claims_take_smallest_free_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = InstanceRegistry::new(dir.path());
        let first = registry.claim(InstanceRecord::current(1000, 1000)).expect("claim");
        let second = registry.claim(InstanceRecord::current(1000, 1000)).expect("claim");
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);

        drop(first);
        let third = registry.claim(InstanceRecord::current(1000, 1000)).expect("claim");
        assert_eq!(third.index(), 0);
        drop(second);
        drop(third);
        assert!(registry.list().expect("list").is_empty());
    }

    #[test]
    fn stale_claims_are_pruned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = InstanceRegistry::new(dir.path());
        write_record(&dir.path().join("0.json"), &record_for(dead_pid())).expect("write");

        assert!(registry.list().expect("list").is_empty());
        assert!(!dir.path().join("0.json").exists());

        write_record(&dir.path().join("0.json"), &record_for(dead_pid())).expect("write");
        let claim = registry.claim(InstanceRecord::current(0, 0)).expect("claim");
        assert_eq!(claim.index(), 0);
    }

    #[test]
    fn recycled_pid_does_not_keep_a_claim_alive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = InstanceRegistry::new(dir.path());
        let me = std::process::id();
        let ticks = process_start_ticks(me).expect("own start time");
        let mut earlier = record_for(me);
        earlier.start_ticks = Some(ticks.wrapping_sub(1));
        write_record(&dir.path().join("0.json"), &earlier).expect("write");

        assert!(registry.list().expect("list").is_empty());
        assert!(!dir.path().join("0.json").exists());
        let claim = registry.claim(InstanceRecord::current(0, 0)).expect("claim");
        assert_eq!(claim.index(), 0);
        assert!(registry.list().expect("list")[0].record.is_live());
    }

    #[test]
    fn claims_and_pruning_share_one_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = InstanceRegistry::new(dir.path());
        write_record(&dir.path().join("0.json"), &record_for(dead_pid())).expect("write");

        let held = DataLock::acquire(&dir.path().join(LOCK_FILE)).expect("lock");
        let worker = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.claim(InstanceRecord::current(0, 0)).map(|c| c.index()))
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!worker.is_finished());
        assert!(dir.path().join("0.json").exists());

        drop(held);
        let index = worker.join().expect("join").expect("claim");
        assert_eq!(index, 0);
        assert!(registry.list().expect("list").is_empty());
    }

    #[test]
    fn sole_instance_work_is_skipped_while_others_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = InstanceRegistry::new(dir.path());
        let _mine = registry.claim(InstanceRecord::current(0, 0)).expect("claim");
        assert_eq!(registry.if_sole_instance(|| 7).expect("alone"), Some(7));

        // pid 1 always exists and is never this test process.
        write_record(&dir.path().join("5.json"), &record_for(1)).expect("write");
        assert_eq!(registry.if_sole_instance(|| 7).expect("shared"), None);
    }

    #[test]
    fn list_is_sorted_and_skips_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = InstanceRegistry::new(dir.path());
        let me = std::process::id();
        write_record(&dir.path().join("3.json"), &record_for(me)).expect("write");
        write_record(&dir.path().join("1.json"), &record_for(me)).expect("write");
        std::fs::write(dir.path().join("notes.txt"), "x").expect("write");

        let indexes: Vec<usize> = registry
            .list()
            .expect("list")
            .iter()
            .map(|i| i.index)
            .collect();
        assert_eq!(indexes, vec![1, 3]);
    }

    #[test]
    fn sandbox_pid_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = InstanceRegistry::new(dir.path());
        let mut claim = registry.claim(InstanceRecord::current(1000, 100)).expect("claim");
        claim.set_sandbox_pid(4242).expect("update");
        let listed = registry.list().expect("list");
        assert_eq!(listed[0].record.sandbox_pid, Some(4242));
        assert_eq!(listed[0].record.gid, 100);
    }
}
