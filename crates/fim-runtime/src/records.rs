//! Versioned JSON records under `<data>/records/`.
//!
//! Every record is stored as `{"version": 1, "data": ...}` and replaced
//! atomically through a temp file and rename. A missing record loads as its
//! default, so a fresh data directory needs no initialization.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use fim_common::error::{FimError, Result};
use fim_common::types::{Binding, OverlayKind, Permission, Selection, Token, UnshareOption};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current on-disk record version.
pub const RECORD_VERSION: u32 = 1;

/// A document persisted under the records directory.
pub trait Record: Serialize + DeserializeOwned + Default {
    /// File name inside the records directory.
    const FILE: &'static str;
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    data: T,
}

/// Loads and stores records of one data directory.
#[derive(Debug, Clone)]
pub struct Records {
    dir: PathBuf,
}

impl Records {
    /// Opens the records directory at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Loads `R`, or its default when the record does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or has
    /// an unsupported version.
    pub fn load<R: Record>(&self) -> Result<R> {
        let path = self.dir.join(R::FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(R::default()),
            Err(e) => return Err(FimError::io(&path, e)),
        };
        let envelope: Envelope<R> = serde_json::from_str(&raw)?;
        if envelope.version != RECORD_VERSION {
            return Err(FimError::Config {
                message: format!(
                    "record '{}' has unsupported version {}",
                    path.display(),
                    envelope.version
                ),
            });
        }
        Ok(envelope.data)
    }

    /// Replaces `R` on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub fn save<R: Record>(&self, record: &R) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| FimError::io(&self.dir, e))?;
        let path = self.dir.join(R::FILE);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", R::FILE, std::process::id()));
        let json = serde_json::to_string_pretty(&Envelope {
            version: RECORD_VERSION,
            data: record,
        })?;
        std::fs::write(&tmp, json).map_err(|e| FimError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| FimError::io(&path, e))?;
        tracing::debug!(path = %path.display(), "record saved");
        Ok(())
    }

    /// Loads `R`, applies `f`, and saves the result.
    ///
    /// Nothing is written if `f` fails.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or any load/save error.
    pub fn update<R: Record>(&self, f: impl FnOnce(&mut R) -> Result<()>) -> Result<R> {
        let mut record = self.load::<R>()?;
        f(&mut record)?;
        self.save(&record)?;
        Ok(record)
    }
}

/// An ordered set of tokens, e.g. permissions or unshare options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenSet<T: Token>(pub BTreeSet<T>);

impl<T: Token> Default for TokenSet<T> {
    fn default() -> Self {
        Self(BTreeSet::new())
    }
}

impl<T: Token> TokenSet<T> {
    /// Adds every token of `selection`.
    pub fn add(&mut self, selection: Selection<T>) {
        self.0.extend(selection.into_set());
    }

    /// Removes every token of `selection`.
    pub fn del(&mut self, selection: Selection<T>) {
        for token in selection.into_set() {
            let _ = self.0.remove(&token);
        }
    }

    /// Replaces the set with `selection`.
    pub fn set(&mut self, selection: Selection<T>) {
        self.0 = selection.into_set();
    }

    /// Token names, one per entry, in set order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(|t| t.name()).collect()
    }
}

/// Granted permissions.
pub type PermissionRecord = TokenSet<Permission>;

/// Namespaces unshared from the host.
pub type UnshareRecord = TokenSet<UnshareOption>;

impl Record for TokenSet<Permission> {
    const FILE: &'static str = "permissions.json";
}

impl Record for TokenSet<UnshareOption> {
    const FILE: &'static str = "unshare.json";
}

/// User bind mounts, densely indexed from zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingRecord(pub Vec<Binding>);

impl Record for BindingRecord {
    const FILE: &'static str = "bindings.json";
}

impl BindingRecord {
    /// Removes the binding at `index`; later bindings shift down by one.
    ///
    /// # Errors
    ///
    /// Returns a usage error if no binding has that index.
    pub fn remove(&mut self, index: usize) -> Result<Binding> {
        if index >= self.0.len() {
            return Err(FimError::usage(format!(
                "No element with index '{index}' found"
            )));
        }
        Ok(self.0.remove(index))
    }
}

/// Persisted overlay backend choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayRecord {
    /// Backend set through `fim-overlay set`.
    pub kind: Option<OverlayKind>,
}

impl Record for OverlayRecord {
    const FILE: &'static str = "overlay.json";
}

/// Default program and arguments run when no `fim-` command is given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRecord {
    /// Program to run, `bash` when unset.
    pub program: Option<String>,
    /// Arguments placed before the caller's arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Record for BootRecord {
    const FILE: &'static str = "boot.json";
}

/// Case-insensitive root filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasefoldRecord {
    /// Whether a `ciopfs` view is stacked over the merged root.
    pub enabled: bool,
}

impl Record for CasefoldRecord {
    const FILE: &'static str = "casefold.json";
}

/// Variables exported into the sandbox, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentRecord(pub BTreeMap<String, String>);

impl Record for EnvironmentRecord {
    const FILE: &'static str = "environment.json";
}

impl EnvironmentRecord {
    /// Inserts `KEY=VALUE` entries, replacing existing keys.
    ///
    /// All entries are validated before any is inserted.
    ///
    /// # Errors
    ///
    /// Returns a usage error naming the first entry without `=`.
    pub fn add<S: AsRef<str>>(&mut self, entries: &[S]) -> Result<()> {
        let pairs = parse_assignments(entries)?;
        for (key, value) in pairs {
            tracing::info!(key = %key, value = %value, "variable included");
            let _ = self.0.insert(key, value);
        }
        Ok(())
    }

    /// Replaces all variables with `entries`.
    ///
    /// # Errors
    ///
    /// See [`EnvironmentRecord::add`]; the record is unchanged on error.
    pub fn set<S: AsRef<str>>(&mut self, entries: &[S]) -> Result<()> {
        let pairs = parse_assignments(entries)?;
        self.0 = pairs.into_iter().collect();
        Ok(())
    }

    /// Removes `keys`; unknown keys are logged and ignored.
    pub fn del<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            let key = key.as_ref();
            if self.0.remove(key).is_none() {
                tracing::info!(key, "key not found for deletion");
            }
        }
    }

    /// `KEY=VALUE` lines.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

fn parse_assignments<S: AsRef<str>>(entries: &[S]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.as_ref();
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    FimError::usage(format!("Variable assignment '{entry}' is invalid"))
                })
        })
        .collect()
}

/// Base URL recipes are fetched from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Remote URL, if configured.
    pub url: Option<String>,
}

impl Record for RemoteRecord {
    const FILE: &'static str = "remote.json";
}

#[cfg(test)]
mod tests {
    use fim_common::types::BindType;

    use super::*;

    fn records() -> (tempfile::TempDir, Records) {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = Records::new(dir.path().join("records"));
        (dir, records)
    }

    #[test]
    fn missing_record_loads_default() {
        let (_dir, records) = records();
        let perms: PermissionRecord = records.load().expect("load");
        assert!(perms.0.is_empty());
        let boot: BootRecord = records.load().expect("load");
        assert_eq!(boot, BootRecord::default());
    }

    #[test]
    fn saved_record_is_versioned() {
        let (dir, records) = records();
        records
            .save(&CasefoldRecord { enabled: true })
            .expect("save");
        let raw = std::fs::read_to_string(dir.path().join("records/casefold.json")).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["version"], 1);
        assert_eq!(value["data"]["enabled"], true);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let (dir, records) = records();
        std::fs::create_dir_all(dir.path().join("records")).expect("mkdir");
        std::fs::write(
            dir.path().join("records/overlay.json"),
            r#"{"version": 7, "data": {"kind": "unionfs"}}"#,
        )
        .expect("write");
        assert!(records.load::<OverlayRecord>().is_err());
    }

    #[test]
    fn permissions_add_del_set() {
        let (_dir, records) = records();
        let _ = records
            .update::<PermissionRecord>(|p| {
                p.add(Selection::parse(&["home,network"])?);
                Ok(())
            })
            .expect("add");
        let perms = records
            .update::<PermissionRecord>(|p| {
                p.del(Selection::parse(&["home"])?);
                Ok(())
            })
            .expect("del");
        assert_eq!(perms.names(), vec!["network"]);

        let perms = records
            .update::<PermissionRecord>(|p| {
                p.set(Selection::parse(&["all"])?);
                Ok(())
            })
            .expect("set");
        assert_eq!(perms.0.len(), Permission::VARIANTS.len());
    }

    #[test]
    fn failed_update_writes_nothing() {
        let (dir, records) = records();
        let result = records.update::<UnshareRecord>(|u| {
            u.add(Selection::parse(&["ipc,bogus"])?);
            Ok(())
        });
        assert!(result.is_err());
        assert!(!dir.path().join("records/unshare.json").exists());
    }

    #[test]
    fn binding_removal_reindexes() {
        let mut record = BindingRecord(
            ["/a", "/b", "/c"]
                .iter()
                .map(|p| Binding {
                    kind: BindType::Ro,
                    src: (*p).into(),
                    dst: (*p).into(),
                })
                .collect(),
        );
        let removed = record.remove(1).expect("remove");
        assert_eq!(removed.src, "/b");
        assert_eq!(record.0[1].src, "/c");
        assert!(record.remove(2).is_err());
    }

    #[test]
    fn environment_rejects_entries_without_equals() {
        let mut env = EnvironmentRecord::default();
        env.add(&["A=1"]).expect("add");
        let err = env.add(&["B=2", "BROKEN"]).unwrap_err();
        assert_eq!(err.to_string(), "Variable assignment 'BROKEN' is invalid");
        assert_eq!(env.lines(), vec!["A=1"]);
    }

    #[test]
    fn environment_value_keeps_later_equals() {
        let mut env = EnvironmentRecord::default();
        env.set(&["OPTS=a=b"]).expect("set");
        assert_eq!(env.0.get("OPTS").map(String::as_str), Some("a=b"));
        env.del(&["OPTS", "MISSING"]);
        assert!(env.0.is_empty());
    }
}
