use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::ops::{Add, AddAssign};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::{DirEntry, WalkDir};

use crate::error::{MonitorError, Result, Warning};
use crate::util::truncate;

const TITLE_DISPLAY_CHARS: usize = 50;
const UNKNOWN_PROJECT: &str = "Unknown";
const UNKNOWN_MODEL: &str = "unknown";
const FINGERPRINT_BYTES: u64 = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn cache(&self) -> u64 {
        self.cache_read.saturating_add(self.cache_write)
    }

    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.reasoning)
            .saturating_add(self.cache())
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input: self.input.saturating_add(rhs.input),
            output: self.output.saturating_add(rhs.output),
            reasoning: self.reasoning.saturating_add(rhs.reasoning),
            cache_read: self.cache_read.saturating_add(rhs.cache_read),
            cache_write: self.cache_write.saturating_add(rhs.cache_write),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
    Tool,
}

/// One request/response turn. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub role: Role,
    pub model_id: String,
    pub provider_id: Option<String>,
    pub tokens: TokenUsage,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub project_path: Option<PathBuf>,
}

impl Interaction {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.started_at.or(self.completed_at)
    }

    pub fn end_timestamp(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.started_at)
    }

    /// Wall time between request and completion; zero when either end is missing.
    pub fn processing_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                u64::try_from(end.signed_duration_since(start).num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn has_usage(&self) -> bool {
        !self.tokens.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub title: Option<String>,
    pub project_path: Option<PathBuf>,
    pub project_name: String,
    pub parent_id: Option<String>,
    pub agent_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Ordered by timestamp; interactions without one sort last.
    pub interactions: Vec<Interaction>,
    pub source_file: PathBuf,
    /// Modification time of `source_file` when it was last read.
    pub file_modified: Option<DateTime<Utc>>,
}

impl Session {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        let first = self.interactions.iter().filter_map(Interaction::timestamp).min();
        match (self.created_at, first) {
            (Some(created), Some(first)) => Some(created.min(first)),
            (created, first) => created.or(first),
        }
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        let last = self
            .interactions
            .iter()
            .filter_map(Interaction::end_timestamp)
            .max();
        match (self.updated_at, last) {
            (Some(updated), Some(last)) => Some(updated.max(last)),
            (updated, last) => updated.or(last).or(self.created_at),
        }
    }

    /// Start time, or the file's modification time when no record carries a
    /// timestamp.
    pub fn anchor_time(&self) -> Option<DateTime<Utc>> {
        self.start_time().or(self.file_modified)
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.start_time(), self.end_time()) {
            (Some(start), Some(end)) => {
                u64::try_from(end.signed_duration_since(start).num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn display_title(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => truncate(title, TITLE_DISPLAY_CHARS),
            _ => self.session_id.clone(),
        }
    }

    pub fn models_used(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .interactions
            .iter()
            .filter(|interaction| interaction.has_usage())
            .map(|interaction| interaction.model_id.clone())
            .collect();
        models.sort();
        models.dedup();
        models
    }

    pub fn total_tokens(&self) -> TokenUsage {
        self.interactions
            .iter()
            .fold(TokenUsage::default(), |acc, interaction| acc + interaction.tokens)
    }

    pub fn has_usage(&self) -> bool {
        self.interactions.iter().any(Interaction::has_usage)
    }

    pub fn latest_interaction(&self) -> Option<&Interaction> {
        self.interactions
            .iter()
            .filter(|interaction| interaction.has_usage())
            .max_by_key(|interaction| interaction.end_timestamp())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawRecord {
    Session(RawSession),
    Message(RawMessage),
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct RawSession {
    id: Option<String>,
    title: Option<String>,
    #[serde(rename = "parentID")]
    parent_id: Option<String>,
    agent: Option<String>,
    directory: Option<String>,
    #[serde(default)]
    time: RawTime,
}

#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    id: Option<String>,
    #[serde(default)]
    role: Role,
    #[serde(rename = "modelID")]
    model_id: Option<String>,
    #[serde(rename = "providerID")]
    provider_id: Option<String>,
    #[serde(default)]
    tokens: RawTokens,
    #[serde(default)]
    time: RawTime,
    #[serde(default)]
    path: RawPath,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTokens {
    input: u64,
    output: u64,
    reasoning: u64,
    cache: RawCache,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCache {
    read: u64,
    write: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTime {
    created: Option<i64>,
    updated: Option<i64>,
    completed: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPath {
    cwd: Option<String>,
    root: Option<String>,
}

#[derive(Debug, Default)]
struct SessionMeta {
    id: Option<String>,
    title: Option<String>,
    parent_id: Option<String>,
    agent: Option<String>,
    directory: Option<PathBuf>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SessionAccumulator {
    meta: SessionMeta,
    interactions: Vec<Interaction>,
    index: HashMap<String, usize>,
    roots: Vec<PathBuf>,
}

impl SessionAccumulator {
    fn apply_session(&mut self, raw: RawSession) {
        let meta = &mut self.meta;
        meta.id = non_empty(raw.id).or(meta.id.take());
        meta.title = non_empty(raw.title).or(meta.title.take());
        meta.parent_id = non_empty(raw.parent_id).or(meta.parent_id.take());
        meta.agent = non_empty(raw.agent).or(meta.agent.take());
        meta.directory = non_empty(raw.directory)
            .map(PathBuf::from)
            .or(meta.directory.take());
        meta.created_at = raw.time.created.and_then(millis_to_utc).or(meta.created_at);
        meta.updated_at = raw.time.updated.and_then(millis_to_utc).or(meta.updated_at);
    }

    /// Records a message; a later record with the same id replaces the earlier one.
    fn apply_message(&mut self, raw: RawMessage, line: u64) -> Interaction {
        if let Some(root) = non_empty(raw.path.root) {
            self.roots.push(PathBuf::from(root));
        }
        let interaction = Interaction {
            id: non_empty(raw.id).unwrap_or_else(|| format!("line-{line}")),
            role: raw.role,
            model_id: non_empty(raw.model_id).unwrap_or_else(|| UNKNOWN_MODEL.to_string()),
            provider_id: non_empty(raw.provider_id),
            tokens: TokenUsage {
                input: raw.tokens.input,
                output: raw.tokens.output,
                reasoning: raw.tokens.reasoning,
                cache_read: raw.tokens.cache.read,
                cache_write: raw.tokens.cache.write,
            },
            started_at: raw.time.created.and_then(millis_to_utc),
            completed_at: raw.time.completed.and_then(millis_to_utc),
            project_path: non_empty(raw.path.cwd).map(PathBuf::from),
        };

        match self.index.get(&interaction.id) {
            Some(&slot) => self.interactions[slot] = interaction.clone(),
            None => {
                self.index
                    .insert(interaction.id.clone(), self.interactions.len());
                self.interactions.push(interaction.clone());
            }
        }
        interaction
    }

    fn session_id(&self, source_file: &Path) -> String {
        self.meta.id.clone().unwrap_or_else(|| {
            source_file
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .filter(|stem| !stem.is_empty())
                .unwrap_or_else(|| "unknown".to_string())
        })
    }

    fn build(&self, source_file: &Path, modified: SystemTime) -> Session {
        let mut interactions = self.interactions.clone();
        interactions.sort_by(|left, right| {
            let lkey = (left.timestamp().is_none(), left.timestamp(), &left.id);
            let rkey = (right.timestamp().is_none(), right.timestamp(), &right.id);
            lkey.cmp(&rkey)
        });

        let project_path = self
            .meta
            .directory
            .clone()
            .or_else(|| most_common(interactions.iter().filter_map(|i| i.project_path.as_ref())))
            .or_else(|| most_common(self.roots.iter()));
        let project_name = project_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| UNKNOWN_PROJECT.to_string());

        Session {
            session_id: self.session_id(source_file),
            title: self.meta.title.clone(),
            project_path,
            project_name,
            parent_id: self.meta.parent_id.clone(),
            agent_name: self.meta.agent.clone(),
            created_at: self.meta.created_at,
            updated_at: self.meta.updated_at,
            interactions,
            source_file: source_file.to_path_buf(),
            file_modified: (modified > SystemTime::UNIX_EPOCH)
                .then(|| DateTime::<Utc>::from(modified)),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionParseCache {
    entries: HashMap<PathBuf, CachedSessionEntry>,
}

/// First and last bytes before the cursor. A rewritten file almost always
/// differs here even when it grew.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Fingerprint {
    head: Vec<u8>,
    tail: Vec<u8>,
}

impl Fingerprint {
    fn read(file: &mut File, cursor: u64) -> io::Result<Self> {
        let head_len = cursor.min(FINGERPRINT_BYTES);
        let tail_start = cursor.saturating_sub(FINGERPRINT_BYTES).max(head_len);
        Ok(Self {
            head: read_range(file, 0, head_len)?,
            tail: read_range(file, tail_start, cursor - tail_start)?,
        })
    }
}

fn read_range(file: &mut File, start: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; usize::try_from(len).unwrap_or(0)];
    file.seek(SeekFrom::Start(start))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[derive(Debug)]
struct CachedSessionEntry {
    cursor: u64,
    file_len: u64,
    modified: SystemTime,
    fingerprint: Fingerprint,
    lines: u64,
    accumulator: SessionAccumulator,
    warnings: Vec<Warning>,
    session: Option<Session>,
}

impl CachedSessionEntry {
    fn new(modified: SystemTime) -> Self {
        Self {
            cursor: 0,
            file_len: 0,
            modified,
            fingerprint: Fingerprint::default(),
            lines: 0,
            accumulator: SessionAccumulator::default(),
            warnings: Vec::new(),
            session: None,
        }
    }

    fn reset(&mut self, modified: SystemTime) {
        *self = Self::new(modified);
    }
}

/// What one refresh pass observed relative to the previous one.
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub changed_files: Vec<PathBuf>,
    pub removed_files: Vec<PathBuf>,
    /// Files that were rewritten and re-read from the start. Everything known
    /// about them before this pass is void.
    pub reset_files: Vec<PathBuf>,
    /// Interactions parsed during this pass, keyed by their source file.
    pub new_interactions: Vec<(PathBuf, Interaction)>,
    pub warnings: Vec<Warning>,
    pub read_errors: Vec<Warning>,
}

impl RefreshOutcome {
    pub fn changed(&self) -> bool {
        !self.changed_files.is_empty() || !self.removed_files.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub sessions: Vec<Session>,
    pub warnings: Vec<Warning>,
}

struct FileDelta {
    reset: bool,
    interactions: Vec<Interaction>,
    warnings: Vec<Warning>,
}

impl SessionParseCache {
    /// Re-walks `root`, reading only bytes appended since the previous pass.
    /// Files that shrank, went back in time or no longer start with the bytes
    /// already read are re-parsed from the start.
    pub fn refresh(&mut self, root: &Path) -> Result<RefreshOutcome> {
        validate_messages_dir(root)?;

        let mut outcome = RefreshOutcome::default();
        let mut seen_paths: HashSet<PathBuf> = HashSet::new();

        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(root).to_path_buf();
                    tracing::warn!(path = %path.display(), error = %err, "failed to walk session directory");
                    outcome.read_errors.push(Warning::TransientReadError {
                        path,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !is_session_file(&entry) {
                continue;
            }
            let path = entry.path().to_path_buf();
            seen_paths.insert(path.clone());

            match self.refresh_file(&path) {
                Ok(None) => {}
                Ok(Some(delta)) => {
                    if delta.reset {
                        outcome.reset_files.push(path.clone());
                    }
                    outcome.warnings.extend(delta.warnings);
                    outcome.new_interactions.extend(
                        delta
                            .interactions
                            .into_iter()
                            .map(|interaction| (path.clone(), interaction)),
                    );
                    outcome.changed_files.push(path);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read session file");
                    outcome.read_errors.push(Warning::TransientReadError {
                        path,
                        reason: err.to_string(),
                    });
                }
            }
        }

        outcome.removed_files = self
            .entries
            .keys()
            .filter(|path| !seen_paths.contains(*path))
            .cloned()
            .collect();
        self.entries.retain(|path, _| seen_paths.contains(path));
        Ok(outcome)
    }

    fn refresh_file(&mut self, path: &Path) -> Result<Option<FileDelta>> {
        let metadata = fs::metadata(path).map_err(|err| MonitorError::io(path, err))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let file_len = metadata.len();
        let cached = self
            .entries
            .entry(path.to_path_buf())
            .or_insert_with(|| CachedSessionEntry::new(modified));

        if cached.session.is_some() && cached.file_len == file_len && cached.modified == modified {
            return Ok(None);
        }

        let mut file = File::open(path).map_err(|err| MonitorError::io(path, err))?;
        let reset = if cached.cursor > file_len || modified < cached.modified {
            true
        } else if cached.cursor > 0 {
            let current = Fingerprint::read(&mut file, cached.cursor)
                .map_err(|err| MonitorError::io(path, err))?;
            current != cached.fingerprint
        } else {
            false
        };
        if reset {
            tracing::debug!(path = %path.display(), "session file was truncated or rewritten; re-reading");
            cached.reset(modified);
        }

        file.seek(SeekFrom::Start(cached.cursor))
            .map_err(|err| MonitorError::io(path, err))?;
        let mut reader = BufReader::new(file);
        let (interactions, warnings) = parse_new_lines(&mut reader, path, cached)?;
        cached.fingerprint = Fingerprint::read(reader.get_mut(), cached.cursor)
            .map_err(|err| MonitorError::io(path, err))?;
        cached.file_len = file_len;
        cached.modified = modified;
        cached.warnings.extend(warnings.iter().cloned());
        cached.session = Some(cached.accumulator.build(path, modified));

        Ok(Some(FileDelta {
            reset,
            interactions,
            warnings,
        }))
    }

    /// Every parsed session, ordered by start time then id.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .entries
            .values()
            .filter_map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|left, right| {
            (left.start_time(), &left.session_id).cmp(&(right.start_time(), &right.session_id))
        });
        sessions
    }

    /// Parse warnings retained for every file still in the cache.
    pub fn warnings(&self) -> Vec<Warning> {
        let mut files: Vec<&PathBuf> = self.entries.keys().collect();
        files.sort();
        files
            .into_iter()
            .filter_map(|path| self.entries.get(path))
            .flat_map(|entry| entry.warnings.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One-shot parse of every session under `root`.
pub fn scan_sessions(root: &Path) -> Result<ScanOutcome> {
    let mut cache = SessionParseCache::default();
    let refresh = cache.refresh(root)?;
    let mut warnings = cache.warnings();
    warnings.extend(refresh.read_errors);
    Ok(ScanOutcome {
        sessions: cache.sessions(),
        warnings,
    })
}

pub fn validate_messages_dir(root: &Path) -> Result<()> {
    let metadata =
        fs::metadata(root).map_err(|err| MonitorError::fatal_input(root, err.to_string()))?;
    if !metadata.is_dir() {
        return Err(MonitorError::fatal_input(root, "not a directory"));
    }
    fs::read_dir(root).map_err(|err| MonitorError::fatal_input(root, err.to_string()))?;
    Ok(())
}

fn is_session_file(entry: &DirEntry) -> bool {
    entry.file_type().is_file()
        && entry.path().extension().and_then(|ext| ext.to_str()) == Some("jsonl")
}

/// Reads complete records from the cursor onwards. A final line without a
/// newline is consumed only when it already parses; otherwise it is left for
/// the next pass so a half-written record is never reported as malformed.
fn parse_new_lines(
    reader: &mut BufReader<File>,
    path: &Path,
    entry: &mut CachedSessionEntry,
) -> Result<(Vec<Interaction>, Vec<Warning>)> {
    let mut interactions = Vec::new();
    let mut warnings = Vec::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let bytes = reader
            .read_until(b'\n', &mut buf)
            .map_err(|err| MonitorError::io(path, err))?;
        if bytes == 0 {
            break;
        }
        let complete = buf.last() == Some(&b'\n');
        let line_no = entry.lines + 1;

        let parsed = std::str::from_utf8(&buf)
            .map_err(|err| err.to_string())
            .and_then(|text| {
                let text = text.trim();
                if text.is_empty() {
                    Ok(None)
                } else {
                    serde_json::from_str::<Value>(text)
                        .map(Some)
                        .map_err(|err| err.to_string())
                }
            });

        if !complete && !matches!(parsed, Ok(Some(_))) {
            break;
        }
        entry.cursor += bytes as u64;
        entry.lines = line_no;

        let value = match parsed {
            Ok(Some(value)) => value,
            Ok(None) => continue,
            Err(reason) => {
                warnings.push(parse_warning(path, line_no, reason));
                continue;
            }
        };

        match serde_json::from_value::<RawRecord>(value) {
            Ok(RawRecord::Session(raw)) => entry.accumulator.apply_session(raw),
            Ok(RawRecord::Message(raw)) => {
                interactions.push(entry.accumulator.apply_message(raw, line_no));
            }
            Ok(RawRecord::Other) => {
                tracing::debug!(path = %path.display(), line = line_no, "ignoring record of unknown type");
            }
            Err(err) => warnings.push(parse_warning(path, line_no, err.to_string())),
        }
    }

    Ok((interactions, warnings))
}

fn parse_warning(path: &Path, line: u64, reason: String) -> Warning {
    tracing::warn!(path = %path.display(), line, reason = %reason, "skipping malformed record");
    Warning::ParseWarning {
        file: path.to_path_buf(),
        line,
        reason,
    }
}

fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn most_common<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> Option<PathBuf> {
    let mut counts: HashMap<&PathBuf, (usize, usize)> = HashMap::new();
    for (order, path) in paths.enumerate() {
        counts.entry(path).or_insert((0, order)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(path, _)| path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    const SESSION_LINE: &str = r#"{"type":"session","id":"ses_main","title":"Refactor parser","directory":"/work/app","time":{"created":1704103200000,"updated":1704106800000}}"#;

    fn message(id: &str, created: i64, completed: i64, input: u64, output: u64) -> String {
        format!(
            r#"{{"type":"message","id":"{id}","role":"assistant","modelID":"claude-sonnet-4-5","providerID":"anthropic","tokens":{{"input":{input},"output":{output},"reasoning":0,"cache":{{"read":10,"write":5}}}},"time":{{"created":{created},"completed":{completed}}},"path":{{"cwd":"/work/app","root":"/work"}}}}"#
        )
    }

    fn write_session(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
        let path = dir.join(name);
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(&path, content).expect("write session");
        path
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .expect("open append");
        write!(file, "{text}").expect("append");
    }

    #[test]
    fn parses_session_and_orders_interactions_by_timestamp() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[
                SESSION_LINE.to_string(),
                message("msg_b", 1704103800000, 1704103810000, 300, 40),
                message("msg_a", 1704103500000, 1704103505000, 100, 20),
            ],
        );

        let scan = scan_sessions(tmp.path()).expect("scan");
        assert!(scan.warnings.is_empty());
        assert_eq!(scan.sessions.len(), 1);
        let session = &scan.sessions[0];
        assert_eq!(session.session_id, "ses_main");
        assert_eq!(session.project_name, "app");
        let ids: Vec<&str> = session.interactions.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["msg_a", "msg_b"]);
        assert_eq!(session.total_tokens().input, 400);
        assert_eq!(session.total_tokens().cache(), 30);
        assert_eq!(session.interactions[0].processing_ms(), 5_000);
        assert_eq!(session.models_used(), vec!["claude-sonnet-4-5".to_string()]);
    }

    #[test]
    fn malformed_record_is_skipped_with_warning() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[
                SESSION_LINE.to_string(),
                "{not json".to_string(),
                r#"{"type":"message","id":"neg","tokens":{"input":-4}}"#.to_string(),
                message("msg_a", 1704103500000, 1704103505000, 100, 20),
            ],
        );

        let scan = scan_sessions(tmp.path()).expect("scan");
        assert_eq!(scan.sessions[0].interactions.len(), 1);
        assert_eq!(scan.warnings.len(), 2);
        assert!(matches!(
            &scan.warnings[0],
            Warning::ParseWarning { line: 2, .. }
        ));
        assert!(matches!(
            &scan.warnings[1],
            Warning::ParseWarning { line: 3, .. }
        ));
    }

    #[test]
    fn unknown_record_types_are_ignored_silently() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[
                SESSION_LINE.to_string(),
                r#"{"type":"part","text":"hello"}"#.to_string(),
            ],
        );
        let scan = scan_sessions(tmp.path()).expect("scan");
        assert!(scan.warnings.is_empty());
        assert!(scan.sessions[0].interactions.is_empty());
    }

    #[test]
    fn empty_session_is_still_listed() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(tmp.path(), "ses_empty.jsonl", &[]);
        let scan = scan_sessions(tmp.path()).expect("scan");
        assert_eq!(scan.sessions.len(), 1);
        assert_eq!(scan.sessions[0].session_id, "ses_empty");
        assert!(!scan.sessions[0].has_usage());
        assert_eq!(scan.sessions[0].project_name, "Unknown");
    }

    #[test]
    fn project_falls_back_to_most_common_cwd() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(
            tmp.path(),
            "ses_nometa.jsonl",
            &[
                message("m1", 1704103500000, 1704103505000, 1, 1),
                message("m2", 1704103600000, 1704103605000, 1, 1),
            ],
        );
        let scan = scan_sessions(tmp.path()).expect("scan");
        let session = &scan.sessions[0];
        assert_eq!(session.session_id, "ses_nometa");
        assert_eq!(session.project_path.as_deref(), Some(Path::new("/work/app")));
    }

    #[test]
    fn later_record_with_same_id_replaces_earlier() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[
                SESSION_LINE.to_string(),
                message("msg_a", 1704103500000, 0, 100, 0),
                message("msg_a", 1704103500000, 1704103509000, 100, 80),
            ],
        );
        let scan = scan_sessions(tmp.path()).expect("scan");
        let session = &scan.sessions[0];
        assert_eq!(session.interactions.len(), 1);
        assert_eq!(session.interactions[0].tokens.output, 80);
    }

    #[test]
    fn missing_directory_is_fatal() {
        let tmp = TempDir::new().expect("temp dir");
        let err = scan_sessions(&tmp.path().join("absent")).expect_err("must fail");
        assert!(err.is_fatal_input());
    }

    #[test]
    fn trailing_partial_record_is_left_for_next_refresh() {
        let tmp = TempDir::new().expect("temp dir");
        let path = write_session(tmp.path(), "ses_main.jsonl", &[SESSION_LINE.to_string()]);
        let full = message("msg_a", 1704103500000, 1704103505000, 100, 20);
        let (head, tail) = full.split_at(full.len() / 2);
        append(&path, head);

        let mut cache = SessionParseCache::default();
        let first = cache.refresh(tmp.path()).expect("refresh1");
        assert!(first.warnings.is_empty());
        assert!(cache.sessions()[0].interactions.is_empty());

        append(&path, tail);
        append(&path, "\n");
        let second = cache.refresh(tmp.path()).expect("refresh2");
        assert!(second.warnings.is_empty());
        assert_eq!(second.new_interactions.len(), 1);
        assert_eq!(second.new_interactions[0].0, path);
        assert_eq!(cache.sessions()[0].interactions.len(), 1);
    }

    #[test]
    fn cached_parser_advances_cursor_with_appended_lines() {
        let tmp = TempDir::new().expect("temp dir");
        let path = write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[
                SESSION_LINE.to_string(),
                message("msg_a", 1704103500000, 1704103505000, 100, 20),
            ],
        );

        let mut cache = SessionParseCache::default();
        let first = cache.refresh(tmp.path()).expect("refresh1");
        assert!(first.changed());
        let first_cursor = cache.entries.get(&path).expect("entry").cursor;

        let unchanged = cache.refresh(tmp.path()).expect("refresh2");
        assert!(!unchanged.changed());
        assert!(unchanged.new_interactions.is_empty());

        append(
            &path,
            &format!("{}\n", message("msg_b", 1704103600000, 1704103610000, 50, 60)),
        );
        let second = cache.refresh(tmp.path()).expect("refresh3");
        let second_cursor = cache.entries.get(&path).expect("entry").cursor;

        assert!(second_cursor > first_cursor);
        assert_eq!(second.new_interactions.len(), 1);
        assert_eq!(second.new_interactions[0].1.id, "msg_b");
        assert_eq!(cache.sessions()[0].total_tokens().output, 80);
    }

    #[test]
    fn truncated_file_is_reparsed_from_start() {
        let tmp = TempDir::new().expect("temp dir");
        let path = write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[
                SESSION_LINE.to_string(),
                message("msg_a", 1704103500000, 1704103505000, 100, 20),
                message("msg_b", 1704103600000, 1704103610000, 50, 60),
            ],
        );
        let mut cache = SessionParseCache::default();
        cache.refresh(tmp.path()).expect("refresh1");

        write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[message("msg_c", 1704103700000, 1704103710000, 7, 3)],
        );
        let outcome = cache.refresh(tmp.path()).expect("refresh2");
        assert!(outcome.changed());
        let sessions = cache.sessions();
        assert_eq!(sessions[0].interactions.len(), 1);
        assert_eq!(sessions[0].interactions[0].id, "msg_c");
        assert_eq!(sessions[0].source_file, path);
    }

    #[test]
    fn rewritten_longer_file_is_reparsed_from_start() {
        let tmp = TempDir::new().expect("temp dir");
        let path = write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[message("old", 1704103500000, 1704103505000, 100, 20)],
        );
        let mut cache = SessionParseCache::default();
        cache.refresh(tmp.path()).expect("refresh1");

        write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[
                message("new_a", 1704103600000, 1704103605000, 7, 3),
                message("new_b", 1704103700000, 1704103705000, 9, 4),
            ],
        );
        let outcome = cache.refresh(tmp.path()).expect("refresh2");
        assert_eq!(outcome.reset_files, vec![path]);
        assert_eq!(outcome.new_interactions.len(), 2);

        let live = cache.sessions();
        let batch = scan_sessions(tmp.path()).expect("scan").sessions;
        let ids: Vec<&str> = live[0].interactions.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["new_a", "new_b"]);
        assert_eq!(live[0].total_tokens(), batch[0].total_tokens());
        assert_eq!(live[0].total_tokens().input, 16);
    }

    #[test]
    fn appended_file_keeps_its_cursor() {
        let tmp = TempDir::new().expect("temp dir");
        let path = write_session(tmp.path(), "ses_main.jsonl", &[SESSION_LINE.to_string()]);
        let mut cache = SessionParseCache::default();
        cache.refresh(tmp.path()).expect("refresh1");

        append(
            &path,
            &format!("{}\n", message("msg_a", 1704103500000, 1704103505000, 100, 20)),
        );
        let outcome = cache.refresh(tmp.path()).expect("refresh2");
        assert!(outcome.reset_files.is_empty());
        assert_eq!(outcome.new_interactions.len(), 1);
    }

    #[test]
    fn untimed_session_is_anchored_to_file_mtime() {
        let tmp = TempDir::new().expect("temp dir");
        write_session(
            tmp.path(),
            "ses_untimed.jsonl",
            &[r#"{"type":"message","id":"m1","tokens":{"input":5000}}"#.to_string()],
        );
        let scan = scan_sessions(tmp.path()).expect("scan");
        let session = &scan.sessions[0];
        assert_eq!(session.start_time(), None);
        assert!(session.file_modified.is_some());
        assert_eq!(session.anchor_time(), session.file_modified);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_is_reported_and_keeps_last_parse() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("temp dir");
        let path = write_session(
            tmp.path(),
            "ses_main.jsonl",
            &[message("msg_a", 1704103500000, 1704103505000, 100, 20)],
        );
        let mut cache = SessionParseCache::default();
        cache.refresh(tmp.path()).expect("refresh1");

        append(
            &path,
            &format!("{}\n", message("msg_b", 1704103600000, 1704103605000, 50, 60)),
        );
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000))
            .expect("chmod");
        if File::open(&path).is_ok() {
            // Permission bits do not apply to this user.
            return;
        }

        let outcome = cache.refresh(tmp.path()).expect("refresh2");
        assert!(matches!(
            outcome.read_errors.as_slice(),
            [Warning::TransientReadError { path: failed, .. }] if *failed == path
        ));
        assert!(outcome.removed_files.is_empty());
        assert_eq!(cache.sessions()[0].interactions.len(), 1);

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .expect("chmod back");
        let recovered = cache.refresh(tmp.path()).expect("refresh3");
        assert!(recovered.read_errors.is_empty());
        assert_eq!(cache.sessions()[0].interactions.len(), 2);
    }

    #[test]
    fn removed_files_leave_the_cache() {
        let tmp = TempDir::new().expect("temp dir");
        let path = write_session(tmp.path(), "ses_gone.jsonl", &[SESSION_LINE.to_string()]);
        let mut cache = SessionParseCache::default();
        cache.refresh(tmp.path()).expect("refresh1");
        assert_eq!(cache.len(), 1);

        std::fs::remove_file(&path).expect("remove");
        let outcome = cache.refresh(tmp.path()).expect("refresh2");
        assert_eq!(outcome.removed_files, vec![path]);
        assert!(cache.is_empty());
    }

    #[test]
    fn nested_directories_and_other_extensions() {
        let tmp = TempDir::new().expect("temp dir");
        let nested = tmp.path().join("project").join("deep");
        std::fs::create_dir_all(&nested).expect("mkdir");
        write_session(&nested, "ses_deep.jsonl", &[SESSION_LINE.to_string()]);
        std::fs::write(tmp.path().join("notes.txt"), "ignore me").expect("write");

        let scan = scan_sessions(tmp.path()).expect("scan");
        assert_eq!(scan.sessions.len(), 1);
    }

    #[test]
    fn display_title_truncates_long_titles() {
        let tmp = TempDir::new().expect("temp dir");
        let long_title = "x".repeat(80);
        write_session(
            tmp.path(),
            "ses_long.jsonl",
            &[format!(r#"{{"type":"session","id":"ses_long","title":"{long_title}"}}"#)],
        );
        let scan = scan_sessions(tmp.path()).expect("scan");
        assert_eq!(scan.sessions[0].display_title().chars().count(), 50);
    }
}
