//! Authoritative set of logpoints and the configuration file projected from it.
//!
//! The file is consumed by the instrumentation hook inside the monitored
//! application. It always reflects the whole store: every mutation rewrites it
//! through a sibling temp file and a rename, so the hook never sees a partial
//! write.

use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroU32;
use std::path::{Component, Path, PathBuf};

use xxhash_rust::xxh32::xxh32;

use crate::types::{AddRequest, LogpointType};
use crate::{AgentError, LogpointError, Result};

const FORMAT_VERSION: &str = "version=1";
const TYPE_TAG: &str = "debug_helper";
const CONDITION_ALWAYS: &str = "1";
const HELPER_CALL: &str = "\\CodeInsights\\Debugger\\Helper::debug";
const BACKTRACE_ARGS: &str = "debug_backtrace(DEBUG_BACKTRACE_IGNORE_ARGS), __FILE__, __LINE__";

#[derive(Debug, Clone, PartialEq)]
pub struct Logpoint {
    pub logpoint_id: String,
    pub project_id: i64,
    pub webroot: PathBuf,
    pub file_path: String,
    pub absolute_path: PathBuf,
    pub file_hash: String,
    pub line_number: NonZeroU32,
    pub kind: LogpointType,
    /// Already sanitized.
    pub log_variable: Option<String>,
    pub condition: String,
}

impl Logpoint {
    /// Text of the call the hook splices in at the logpoint line.
    fn callback(&self) -> Option<String> {
        let scope = match (self.kind, self.log_variable.as_deref()) {
            (LogpointType::Snapshot, _) => "get_defined_vars()".to_string(),
            (LogpointType::Log, Some(expression)) => format!("[{expression}]"),
            (LogpointType::Log, None) | (LogpointType::Unsupported, _) => return None,
        };
        Some(format!(
            "{HELPER_CALL}('', '', {scope}, {BACKTRACE_ARGS}, {});",
            self.project_id
        ))
    }
}

/// Lowercase hex xxh32 of `bytes`, as supplied by clients in `file_hash`.
pub fn file_hash(bytes: &[u8]) -> String {
    format!("{:08x}", xxh32(bytes, 0))
}

/// Strips statement and argument separators from a log expression.
pub fn sanitize_expression(expression: &str) -> String {
    expression
        .chars()
        .filter(|c| !matches!(c, ';' | ','))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Joins `relative` onto `root` resolving `.` and `..` without touching the
/// filesystem. `None` if the result would leave `root`.
fn join_within(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    let mut joined = root.to_path_buf();
    joined.extend(parts);
    Some(joined)
}

/// Every field that ends up in the line-based file must stay on one line.
fn reject_control_characters(request: &AddRequest) -> std::result::Result<(), LogpointError> {
    let webroot = request.webroot.to_string_lossy();
    let fields = [
        ("logpoint_id", Some(request.logpoint_id.as_str())),
        ("webroot", Some(webroot.as_ref())),
        ("file_path", Some(request.file_path.as_str())),
        ("log_variable", request.log_variable.as_deref()),
    ];
    for (name, value) in fields {
        if value.is_some_and(|value| value.chars().any(char::is_control)) {
            return Err(LogpointError::ControlCharacters(name));
        }
    }
    Ok(())
}

pub fn validate(request: &AddRequest) -> std::result::Result<Logpoint, LogpointError> {
    reject_control_characters(request)?;

    let relative = Path::new(request.file_path.trim_start_matches('/'));
    let absolute_path =
        join_within(&request.webroot, relative).ok_or(LogpointError::OutsideWebroot)?;

    if !absolute_path.is_file() {
        return Err(LogpointError::FileNotFound);
    }

    let real_root =
        fs::canonicalize(&request.webroot).map_err(|_| LogpointError::FileNotFound)?;
    let real_file = fs::canonicalize(&absolute_path).map_err(|_| LogpointError::FileNotFound)?;
    let real_dir = real_file.parent().unwrap_or(&real_file);
    if !real_dir.starts_with(&real_root) {
        return Err(LogpointError::OutsideWebroot);
    }

    let contents = fs::read(&absolute_path).map_err(|_| LogpointError::FileNotFound)?;
    if !file_hash(&contents).eq_ignore_ascii_case(request.file_hash.trim()) {
        return Err(LogpointError::HashMismatch);
    }

    let log_variable = request
        .log_variable
        .as_deref()
        .map(sanitize_expression)
        .filter(|expression| !expression.is_empty());
    if request.kind == LogpointType::Log && log_variable.is_none() {
        return Err(LogpointError::LogVariableMissing);
    }

    Ok(Logpoint {
        logpoint_id: request.logpoint_id.clone(),
        project_id: request.project_id,
        webroot: request.webroot.clone(),
        file_path: request.file_path.clone(),
        absolute_path,
        file_hash: request.file_hash.clone(),
        line_number: request.line_number,
        kind: request.kind,
        log_variable,
        condition: CONDITION_ALWAYS.to_string(),
    })
}

pub struct LogpointStore {
    path: PathBuf,
    logpoints: BTreeMap<String, Logpoint>,
}

impl LogpointStore {
    /// Starts empty and immediately clears whatever the file held before.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            logpoints: BTreeMap::new(),
        };
        store.persist()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, logpoint_id: &str) -> Option<&Logpoint> {
        self.logpoints.get(logpoint_id)
    }

    pub fn len(&self) -> usize {
        self.logpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Logpoint> {
        self.logpoints.values()
    }

    /// Validates and stores `request`, replacing any entry with the same ID.
    /// Refusals surface as [`AgentError::Rejected`].
    pub fn add(&mut self, request: &AddRequest) -> Result<&Logpoint> {
        let logpoint = validate(request)?;
        let id = logpoint.logpoint_id.clone();
        let previous = self.logpoints.insert(id.clone(), logpoint);

        if let Err(e) = self.persist() {
            match previous {
                Some(previous) => self.logpoints.insert(id, previous),
                None => self.logpoints.remove(&id),
            };
            return Err(e);
        }

        self.logpoints
            .get(&id)
            .ok_or_else(|| AgentError::Io(std::io::ErrorKind::NotFound.into()))
    }

    /// `Ok(None)` when the ID is unknown; the file is left untouched then.
    pub fn remove(&mut self, logpoint_id: &str) -> Result<Option<Logpoint>> {
        let Some(removed) = self.logpoints.remove(logpoint_id) else {
            return Ok(None);
        };

        if let Err(e) = self.persist() {
            self.logpoints.insert(removed.logpoint_id.clone(), removed);
            return Err(e);
        }

        Ok(Some(removed))
    }

    /// Rebuilds the store from a full list, writing the file once. Returns the
    /// outcome per requested ID in input order.
    pub fn replace_all(
        &mut self,
        requests: &[AddRequest],
    ) -> Result<Vec<(String, std::result::Result<(), LogpointError>)>> {
        let mut rebuilt = BTreeMap::new();
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            match validate(request) {
                Ok(logpoint) => {
                    rebuilt.insert(logpoint.logpoint_id.clone(), logpoint);
                    outcomes.push((request.logpoint_id.clone(), Ok(())));
                }
                Err(reason) => outcomes.push((request.logpoint_id.clone(), Err(reason))),
            }
        }

        let previous = std::mem::replace(&mut self.logpoints, rebuilt);
        if let Err(e) = self.persist() {
            self.logpoints = previous;
            return Err(e);
        }

        Ok(outcomes)
    }

    pub fn serialize(&self) -> String {
        let mut out = String::from(FORMAT_VERSION);
        out.push('\n');

        for logpoint in self.logpoints.values() {
            let Some(callback) = logpoint.callback() else {
                tracing::warn!(
                    "Skipping logpoint {} with unsupported type {:?}",
                    logpoint.logpoint_id,
                    logpoint.kind
                );
                continue;
            };

            out.push('\n');
            for line in [
                format!("id={}", logpoint.logpoint_id),
                TYPE_TAG.to_string(),
                logpoint.absolute_path.to_string_lossy().into_owned(),
                logpoint.line_number.to_string(),
                logpoint.condition.clone(),
                callback,
            ] {
                out.push_str(&line);
                out.push('\n');
            }
        }

        out
    }

    fn persist(&self) -> Result<()> {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "logpoints".to_string());
        let temp_path = self.path.with_file_name(format!(".{file_name}.tmp"));

        fs::write(&temp_path, self.serialize())?;
        fs::rename(&temp_path, &self.path)?;

        tracing::debug!(
            "Wrote {} logpoints to {}",
            self.logpoints.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const SAMPLE_SOURCE: &str = "<?php\n\nreturn view('posts.index');\n";

    pub(crate) struct Fixture {
        pub dir: TempDir,
        pub webroot: PathBuf,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let webroot = dir.path().join("webroot");
            fs::create_dir_all(webroot.join("app")).unwrap();
            fs::write(webroot.join("a.php"), SAMPLE_SOURCE).unwrap();
            fs::write(dir.path().join("outside.php"), SAMPLE_SOURCE).unwrap();
            Self { dir, webroot }
        }

        pub fn request(&self, id: &str, file_path: &str) -> AddRequest {
            AddRequest {
                logpoint_id: id.to_string(),
                project_id: 7,
                webroot: self.webroot.clone(),
                file_path: file_path.to_string(),
                file_hash: file_hash(SAMPLE_SOURCE.as_bytes()),
                line_number: NonZeroU32::new(10).unwrap(),
                kind: LogpointType::Snapshot,
                log_variable: None,
            }
        }

        pub fn store_path(&self) -> PathBuf {
            self.dir.path().join("logpoints.conf")
        }
    }

    fn rejected(result: Result<&Logpoint>) -> LogpointError {
        match result {
            Err(AgentError::Rejected(reason)) => reason,
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("logpoint should have been rejected"),
        }
    }

    #[test]
    fn test_xxh32_hex() {
        assert_eq!(file_hash(b""), "02cc5d05");
        assert_eq!(file_hash(b"abc").len(), 8);
    }

    #[test]
    fn test_open_clears_existing_file() {
        let fixture = Fixture::new();
        fs::write(fixture.store_path(), "version=1\n\nid=stale\n").unwrap();
        let store = LogpointStore::open(fixture.store_path()).unwrap();
        assert!(store.is_empty());
        assert_eq!(fs::read_to_string(fixture.store_path()).unwrap(), "version=1\n");
    }

    #[test]
    fn test_add_snapshot_writes_six_line_block() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        store.add(&fixture.request("lp-1", "a.php")).unwrap();

        assert_eq!(store.len(), 1);
        let expected = format!(
            "version=1\n\nid=lp-1\ndebug_helper\n{}\n10\n1\n\\CodeInsights\\Debugger\\Helper::debug('', '', get_defined_vars(), debug_backtrace(DEBUG_BACKTRACE_IGNORE_ARGS), __FILE__, __LINE__, 7);\n",
            fixture.webroot.join("a.php").display()
        );
        assert_eq!(fs::read_to_string(fixture.store_path()).unwrap(), expected);
        assert!(!fixture.dir.path().join(".logpoints.conf.tmp").exists());
    }

    #[test]
    fn test_serialization_is_idempotent() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        store.add(&fixture.request("lp-2", "a.php")).unwrap();
        store.add(&fixture.request("lp-1", "/a.php")).unwrap();
        assert_eq!(store.serialize(), store.serialize());
        assert_eq!(fs::read_to_string(fixture.store_path()).unwrap(), store.serialize());
    }

    #[test]
    fn test_add_then_remove_restores_previous_state() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        store.add(&fixture.request("keep", "a.php")).unwrap();
        let before = fs::read_to_string(fixture.store_path()).unwrap();

        store.add(&fixture.request("temp", "./app/../a.php")).unwrap();
        assert_ne!(fs::read_to_string(fixture.store_path()).unwrap(), before);

        let removed = store.remove("temp").unwrap().expect("logpoint removed");
        assert_eq!(removed.project_id, 7);
        assert_eq!(fs::read_to_string(fixture.store_path()).unwrap(), before);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        store.add(&fixture.request("lp-1", "a.php")).unwrap();
        let before = fs::read_to_string(fixture.store_path()).unwrap();

        assert!(store.remove("missing").unwrap().is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(fs::read_to_string(fixture.store_path()).unwrap(), before);
    }

    #[test]
    fn test_traversal_rejected_whether_or_not_target_exists() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();

        for path in ["../outside.php", "../missing.php", "app/../../outside.php", "../../etc/passwd"] {
            let reason = rejected(store.add(&fixture.request("evil", path)));
            assert_eq!(reason, LogpointError::OutsideWebroot, "path {path}");
        }
        assert!(store.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let fixture = Fixture::new();
        std::os::unix::fs::symlink(fixture.dir.path(), fixture.webroot.join("link")).unwrap();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        let reason = rejected(store.add(&fixture.request("evil", "link/outside.php")));
        assert_eq!(reason, LogpointError::OutsideWebroot);
    }

    #[test]
    fn test_missing_file_rejected() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        let reason = rejected(store.add(&fixture.request("lp-1", "app/missing.php")));
        assert_eq!(reason, LogpointError::FileNotFound);
        let reason = rejected(store.add(&fixture.request("lp-1", "app")));
        assert_eq!(reason, LogpointError::FileNotFound);
    }

    #[test]
    fn test_hash_gate_detects_modified_file() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        let request = fixture.request("lp-1", "a.php");

        fs::write(fixture.webroot.join("a.php"), "<?php\n// edited\n").unwrap();
        let reason = rejected(store.add(&request));
        assert_eq!(reason, LogpointError::HashMismatch);
        assert_eq!(fs::read_to_string(fixture.store_path()).unwrap(), "version=1\n");

        let mut request = request;
        request.file_hash = file_hash(b"<?php\n// edited\n").to_uppercase();
        store.add(&request).unwrap();
    }

    #[test]
    fn test_log_expression_is_sanitized() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        let mut request = fixture.request("lp-log", "a.php");
        request.kind = LogpointType::Log;
        request.log_variable = Some("$user->name; exec('rm -rf /'), 1".to_string());

        let logpoint = store.add(&request).unwrap();
        assert_eq!(
            logpoint.log_variable.as_deref(),
            Some("$user->name exec('rm -rf /') 1")
        );
        assert!(store.serialize().contains(
            "Helper::debug('', '', [$user->name exec('rm -rf /') 1], debug_backtrace"
        ));
    }

    fn record_count(contents: &str) -> usize {
        contents.lines().filter(|line| line.starts_with("id=")).count()
    }

    #[test]
    fn test_line_breaks_cannot_forge_records() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        store.add(&fixture.request("lp-1", "a.php")).unwrap();

        let mut forged_log = fixture.request("lp-log", "a.php");
        forged_log.kind = LogpointType::Log;
        forged_log.log_variable =
            Some("$x]\n\nid=evil\ndebug_helper\n/etc/passwd\n1\n1\nsystem('id')//".to_string());
        let forged_id = fixture.request("a\n\nid=forged", "a.php");
        let forged_path = fixture.request("lp-path", "a.php\r\nid=forged");

        assert_eq!(
            rejected(store.add(&forged_log)),
            LogpointError::ControlCharacters("log_variable")
        );
        assert_eq!(
            rejected(store.add(&forged_id)),
            LogpointError::ControlCharacters("logpoint_id")
        );
        assert_eq!(
            rejected(store.add(&forged_path)),
            LogpointError::ControlCharacters("file_path")
        );

        let contents = fs::read_to_string(fixture.store_path()).unwrap();
        assert_eq!(record_count(&contents), store.len());
        assert_eq!(contents.lines().count(), 1 + 7 * store.len());
    }

    #[test]
    fn test_log_without_expression_rejected() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        let mut request = fixture.request("lp-log", "a.php");
        request.kind = LogpointType::Log;
        request.log_variable = Some(" ;, ".to_string());
        let reason = rejected(store.add(&request));
        assert_eq!(reason, LogpointError::LogVariableMissing);
    }

    #[test]
    fn test_unsupported_type_skipped_in_file() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        let mut request = fixture.request("lp-odd", "a.php");
        request.kind = LogpointType::Unsupported;
        store.add(&request).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.serialize(), "version=1\n");
    }

    #[test]
    fn test_same_id_replaces_entry() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        store.add(&fixture.request("lp-1", "a.php")).unwrap();
        let mut request = fixture.request("lp-1", "a.php");
        request.line_number = NonZeroU32::new(3).unwrap();
        store.add(&request).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("lp-1").unwrap().line_number.get(), 3);
        assert_eq!(store.get("lp-1").unwrap().condition, "1");
    }

    #[test]
    fn test_replace_all_keeps_only_valid_entries() {
        let fixture = Fixture::new();
        let mut store = LogpointStore::open(fixture.store_path()).unwrap();
        store.add(&fixture.request("stale", "a.php")).unwrap();

        let outcomes = store
            .replace_all(&[
                fixture.request("good", "a.php"),
                fixture.request("bad", "../outside.php"),
            ])
            .unwrap();

        assert_eq!(outcomes[0], ("good".to_string(), Ok(())));
        assert_eq!(outcomes[1], ("bad".to_string(), Err(LogpointError::OutsideWebroot)));
        assert!(store.get("good").is_some());
        assert!(store.get("stale").is_none());
        assert_eq!(store.len(), 1);
    }
}
