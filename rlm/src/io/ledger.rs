//! Append-only, hash-chained alignment ledger (`alignment/ledger.jsonl`) and
//! its recomputed projection (`alignment/projection.json`).
//!
//! Each record's `hash` is `sha256(canonical_body ‖ prev_hash)`, where the
//! canonical body is the compact JSON of the record without `prev_hash` and
//! `hash` (keys sorted). The first record chains from [`GENESIS_HASH`].
//! Writers never cache the tail across restarts: opening re-folds the log.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::io::artifacts::{ALIGNMENT_DIR, write_json_atomic};

pub const LEDGER_FILE: &str = "ledger.jsonl";
pub const PROJECTION_FILE: &str = "projection.json";
pub const SESSION_FILE: &str = "ingestion-session.json";
pub const GENESIS_HASH: &str = "GENESIS";
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    IntentUpdate,
    Sentinel,
    DeepAudit,
    ConsensusSnapshot,
    FinalSummary,
}

impl EventType {
    /// Per-turn check events carry the action and confirmation flag.
    pub fn is_check(self) -> bool {
        matches!(self, EventType::Sentinel | EventType::DeepAudit)
    }
}

/// Who is writing: constant across one writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerIdentity {
    pub thread_id: String,
    pub task_id: String,
    pub run_id: String,
    pub agent_id: String,
}

/// An event before ids, timestamps, and chain hashes are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub intent_version: String,
    pub payload: Value,
    pub score_metadata: Value,
    pub provenance: Value,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub event_id: String,
    pub timestamp_utc: String,
    pub thread_id: String,
    pub task_id: String,
    pub run_id: String,
    pub agent_id: String,
    pub event_type: EventType,
    pub intent_version: String,
    pub schema_version: u32,
    pub payload: Value,
    pub score_metadata: Value,
    pub provenance: Value,
    pub idempotency_key: String,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionTotals {
    pub events: u64,
    pub deep_audits: u64,
    pub confirmations: u64,
    pub consensus_snapshots: u64,
    pub actions: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub intent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Aggregate view recomputed from the whole log after every append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub schema_version: u32,
    pub derived_from: String,
    pub generated_at: String,
    pub totals: ProjectionTotals,
    pub latest: Option<LatestEvent>,
    pub hash_tail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub ledger_path: String,
    pub projection_path: String,
    pub events: u64,
    pub hash_tail: String,
}

pub fn compute_hash(record: &LedgerRecord, prev_hash: &str) -> Result<String> {
    let mut body = serde_json::to_value(record).context("serialize ledger record")?;
    if let Value::Object(map) = &mut body {
        map.remove("prev_hash");
        map.remove("hash");
    }
    let canonical = serde_json::to_string(&body).context("serialize canonical ledger body")?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(prev_hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(len)
        .collect::<String>()
        .to_lowercase()
}

pub fn alignment_dir(run_dir: &Path) -> PathBuf {
    run_dir.join(ALIGNMENT_DIR)
}

fn read_records(path: &Path) -> Result<Vec<(usize, Result<LedgerRecord, String>)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read ledger {}", path.display()))?;
    Ok(contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            let parsed = serde_json::from_str::<LedgerRecord>(line).map_err(|err| err.to_string());
            (idx + 1, parsed)
        })
        .collect())
}

/// Make the log end on a line boundary before anything is appended.
///
/// A trailing fragment left by an interrupted write is kept (newline added)
/// when it parses as a full record and cut off otherwise.
fn repair_torn_tail(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let bytes = fs::read(path).with_context(|| format!("read ledger {}", path.display()))?;
    if bytes.last().is_none_or(|last| *last == b'\n') {
        return Ok(());
    }
    let keep = bytes
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |idx| idx + 1);
    let fragment = &bytes[keep..];
    if serde_json::from_slice::<LedgerRecord>(fragment).is_ok() {
        warn!(path = %path.display(), "ledger tail missing newline; terminating it");
        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("open ledger {}", path.display()))?;
        file.write_all(b"\n")
            .with_context(|| format!("terminate ledger {}", path.display()))?;
        return Ok(());
    }
    warn!(
        path = %path.display(),
        dropped_bytes = fragment.len(),
        "truncating torn ledger tail"
    );
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open ledger {}", path.display()))?;
    file.set_len(keep as u64)
        .with_context(|| format!("truncate ledger {}", path.display()))?;
    Ok(())
}

#[derive(Debug)]
pub struct LedgerWriter {
    dir: PathBuf,
    identity: LedgerIdentity,
    records: Vec<LedgerRecord>,
    keys: HashSet<String>,
    tail: String,
}

impl LedgerWriter {
    /// Open (or create) the ledger under `<run_dir>/alignment/`, folding
    /// existing records to recover the tail hash and known idempotency keys.
    /// A torn final line from an interrupted append is repaired first.
    pub fn open(run_dir: &Path, identity: LedgerIdentity) -> Result<Self> {
        let dir = alignment_dir(run_dir);
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        let mut writer = Self {
            dir,
            identity,
            records: Vec::new(),
            keys: HashSet::new(),
            tail: GENESIS_HASH.to_string(),
        };
        repair_torn_tail(&writer.ledger_path())?;
        for (line, parsed) in read_records(&writer.ledger_path())? {
            match parsed {
                Ok(record) => {
                    writer.keys.insert(record.idempotency_key.clone());
                    writer.tail = record.hash.clone();
                    writer.records.push(record);
                }
                Err(err) => warn!(line, error = %err, "skipping malformed ledger line"),
            }
        }
        debug!(records = writer.records.len(), tail = %writer.tail, "ledger opened");
        Ok(writer)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }

    pub fn projection_path(&self) -> PathBuf {
        self.dir.join(PROJECTION_FILE)
    }

    pub fn records(&self) -> &[LedgerRecord] {
        &self.records
    }

    pub fn tail_hash(&self) -> &str {
        &self.tail
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Append one event. Returns `None` when the idempotency key is already
    /// present; that is a no-op, not an error.
    #[instrument(skip_all, fields(event_type = ?draft.event_type, key = %draft.idempotency_key))]
    pub fn append(&mut self, draft: EventDraft) -> Result<Option<LedgerRecord>> {
        if self.keys.contains(&draft.idempotency_key) {
            debug!("duplicate idempotency key; skipping append");
            return Ok(None);
        }
        let mut record = LedgerRecord {
            event_id: format!("evt-{}", random_suffix(12)),
            timestamp_utc: Utc::now().to_rfc3339(),
            thread_id: self.identity.thread_id.clone(),
            task_id: self.identity.task_id.clone(),
            run_id: self.identity.run_id.clone(),
            agent_id: self.identity.agent_id.clone(),
            event_type: draft.event_type,
            intent_version: draft.intent_version,
            schema_version: LEDGER_SCHEMA_VERSION,
            payload: draft.payload,
            score_metadata: draft.score_metadata,
            provenance: draft.provenance,
            idempotency_key: draft.idempotency_key,
            prev_hash: self.tail.clone(),
            hash: String::new(),
        };
        record.hash = compute_hash(&record, &record.prev_hash)?;

        let mut line = serde_json::to_string(&record).context("serialize ledger record")?;
        line.push('\n');
        let path = self.ledger_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open ledger {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append ledger {}", path.display()))?;

        self.keys.insert(record.idempotency_key.clone());
        self.tail = record.hash.clone();
        self.records.push(record.clone());
        write_json_atomic(&self.projection_path(), &self.projection())?;
        debug!(hash = %record.hash, events = self.records.len(), "ledger record appended");
        Ok(Some(record))
    }

    /// Aggregate totals over every record in the log.
    pub fn projection(&self) -> Projection {
        let mut totals = ProjectionTotals {
            events: self.records.len() as u64,
            ..ProjectionTotals::default()
        };
        for record in &self.records {
            match record.event_type {
                EventType::DeepAudit => totals.deep_audits += 1,
                EventType::ConsensusSnapshot => totals.consensus_snapshots += 1,
                _ => {}
            }
            if record.event_type.is_check() {
                if let Some(action) = record.score_metadata.get("action").and_then(Value::as_str) {
                    *totals.actions.entry(action.to_string()).or_default() += 1;
                }
                if record
                    .score_metadata
                    .get("requires_confirmation")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    totals.confirmations += 1;
                }
            }
        }
        let latest = self.records.last().map(|record| LatestEvent {
            event_id: record.event_id.clone(),
            event_type: record.event_type,
            intent_version: record.intent_version.clone(),
            action: record
                .score_metadata
                .get("action")
                .and_then(Value::as_str)
                .map(str::to_string),
            score: record.score_metadata.get("score").and_then(Value::as_u64),
            confidence: record.score_metadata.get("confidence").and_then(Value::as_f64),
        });
        Projection {
            schema_version: LEDGER_SCHEMA_VERSION,
            derived_from: LEDGER_FILE.to_string(),
            generated_at: Utc::now().to_rfc3339(),
            totals,
            latest,
            hash_tail: self.tail.clone(),
        }
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            ledger_path: format!("{ALIGNMENT_DIR}/{LEDGER_FILE}"),
            projection_path: format!("{ALIGNMENT_DIR}/{PROJECTION_FILE}"),
            events: self.records.len() as u64,
            hash_tail: self.tail.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub records: usize,
    pub hash_tail: String,
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Re-fold the ledger and report the first line that does not chain.
///
/// Unlike [`LedgerWriter::open`], a malformed line counts as a break.
pub fn verify_chain(run_dir: &Path) -> Result<ChainReport> {
    let path = alignment_dir(run_dir).join(LEDGER_FILE);
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut records = 0usize;
    for (line, parsed) in read_records(&path)? {
        let record = match parsed {
            Ok(record) => record,
            Err(err) => {
                return Ok(ChainReport {
                    records,
                    hash_tail: expected_prev,
                    first_break: Some(ChainBreak {
                        line,
                        event_id: None,
                        reason: format!("malformed record: {err}"),
                    }),
                });
            }
        };
        let reason = if record.prev_hash != expected_prev {
            Some(format!(
                "prev_hash {} does not match expected {expected_prev}",
                record.prev_hash
            ))
        } else if compute_hash(&record, &expected_prev)? != record.hash {
            Some("hash does not match record contents".to_string())
        } else {
            None
        };
        if let Some(reason) = reason {
            return Ok(ChainReport {
                records,
                hash_tail: expected_prev,
                first_break: Some(ChainBreak {
                    line,
                    event_id: Some(record.event_id),
                    reason,
                }),
            });
        }
        expected_prev = record.hash;
        records += 1;
    }
    Ok(ChainReport {
        records,
        hash_tail: expected_prev,
        first_break: None,
    })
}

/// Binds idempotency keys to one logical run so re-instantiated writers dedup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSession {
    pub run_id: String,
    pub session_key: String,
    pub completed: bool,
}

impl IngestionSession {
    pub fn turn_key(&self, turn: u32, kind: &str) -> String {
        format!("{}:turn:{turn}:{kind}", self.session_key)
    }

    pub fn final_key(&self) -> String {
        format!("{}:final", self.session_key)
    }
}

/// Resume the stored session when it belongs to `run_id` and is still open;
/// otherwise start a fresh one.
pub fn load_or_start_session(run_dir: &Path, run_id: &str) -> Result<IngestionSession> {
    let path = alignment_dir(run_dir).join(SESSION_FILE);
    if path.exists() {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read ingestion session {}", path.display()))?;
        match serde_json::from_str::<IngestionSession>(&raw) {
            Ok(session) if session.run_id == run_id && !session.completed => {
                debug!(session_key = %session.session_key, "resuming ingestion session");
                return Ok(session);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "ignoring malformed ingestion session"),
        }
    }
    let session = IngestionSession {
        run_id: run_id.to_string(),
        session_key: format!("{run_id}:{}", random_suffix(8)),
        completed: false,
    };
    write_json_atomic(&path, &session)?;
    debug!(session_key = %session.session_key, "started ingestion session");
    Ok(session)
}

pub fn complete_session(run_dir: &Path, session: &mut IngestionSession) -> Result<()> {
    session.completed = true;
    write_json_atomic(&alignment_dir(run_dir).join(SESSION_FILE), session)
}
