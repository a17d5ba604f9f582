use crate::error::{Error, Result};
use crate::types::{
    ArtifactId, JobId, JobRecord, JobStatus, LogId, LogRecord, ParamValue, WorkflowId,
    WorkflowRecord,
};
use anyhow::Context;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

const JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");
const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const WORKFLOW_ROOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_roots");
const JOB_EDGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("job_edges");
const JOB_INPUTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("job_inputs");
const JOB_OUTPUTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("job_outputs");
const LOGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("logs");

/// Persistent engine state, backed by redb.
///
/// Every mutating method runs inside a single write transaction. redb admits
/// one writer at a time, which makes each method an atomic read-modify-write
/// even when completion callbacks arrive from unrelated concurrent tasks —
/// this is what keeps the pending-map updates of sibling parents from losing
/// each other's writes.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create store directory")?;
        }

        let db = Database::create(&path).context("failed to create redb database")?;

        let write_txn = db
            .begin_write()
            .context("failed to begin write transaction")?;
        {
            write_txn
                .open_table(JOBS_TABLE)
                .context("failed to open jobs table")?;
            write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("failed to open workflows table")?;
            write_txn
                .open_table(WORKFLOW_ROOTS_TABLE)
                .context("failed to open workflow roots table")?;
            write_txn
                .open_table(JOB_EDGES_TABLE)
                .context("failed to open job edges table")?;
            write_txn
                .open_table(JOB_INPUTS_TABLE)
                .context("failed to open job inputs table")?;
            write_txn
                .open_table(JOB_OUTPUTS_TABLE)
                .context("failed to open job outputs table")?;
            write_txn
                .open_table(LOGS_TABLE)
                .context("failed to open logs table")?;
        }
        write_txn.commit().context("failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    // === Jobs ===

    pub fn insert_job(&self, record: &JobRecord) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("failed to open jobs table")?;
            let key = record.id.to_string();
            let value = serde_json::to_vec(record).context("failed to serialize job")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("failed to insert job")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    pub fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(JOBS_TABLE)
            .context("failed to open jobs table")?;

        let key = id.to_string();
        match table.get(key.as_str()).context("failed to read job")? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).context("failed to deserialize job")?,
            )),
            None => Ok(None),
        }
    }

    /// Like [`Store::get_job`] but a missing job is an error.
    pub fn job(&self, id: &JobId) -> Result<JobRecord> {
        self.get_job(id)?.ok_or(Error::JobNotFound(*id))
    }

    pub fn job_exists(&self, id: &JobId) -> Result<bool> {
        Ok(self.get_job(id)?.is_some())
    }

    pub fn delete_job(&self, id: &JobId) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("failed to open jobs table")?;
            let key = id.to_string();
            table
                .remove(key.as_str())
                .context("failed to delete job")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    /// Atomic read-modify-write of a single job record. The closure sees the
    /// freshest committed state; an error aborts the transaction unchanged.
    pub fn with_job_mut<R>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut JobRecord) -> Result<R>,
    ) -> Result<R> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        let result = {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("failed to open jobs table")?;
            let key = id.to_string();
            let mut record: JobRecord = {
                let guard = table.get(key.as_str()).context("failed to read job")?;
                match guard {
                    Some(guard) => serde_json::from_slice(guard.value())
                        .context("failed to deserialize job")?,
                    None => return Err(Error::JobNotFound(*id)),
                }
            };
            let result = f(&mut record)?;
            let value = serde_json::to_vec(&record).context("failed to serialize job")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("failed to write job")?;
            result
        };
        write_txn.commit().context("failed to commit")?;
        Ok(result)
    }

    /// Move a job along a legal edge of the state machine; any other edge is
    /// `OperationNotPermitted`. The status check runs inside the write
    /// transaction, so duplicate or out-of-order callbacks are rejected
    /// rather than applied.
    pub fn transition(&self, id: &JobId, to: JobStatus) -> Result<()> {
        self.with_job_mut(id, |record| {
            if !record.status.can_transition(to) {
                return Err(Error::not_permitted(format!(
                    "cannot move job '{}' from '{}' to '{}'",
                    record.id, record.status, to
                )));
            }
            record.status = to;
            Ok(())
        })
    }

    /// Atomically finish a successful job: flip `running` to `success`,
    /// record the output-slot links, rewrite every child's deferred
    /// parameters to the materialized artifact ids, and drop this job's key
    /// from each child's pending map. Returns the children whose pending map
    /// became empty — they are ready for submission.
    pub fn finish_success(
        &self,
        id: &JobId,
        outputs: &BTreeMap<String, ArtifactId>,
    ) -> Result<Vec<JobId>> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        let ready = {
            let mut jobs = write_txn
                .open_table(JOBS_TABLE)
                .context("failed to open jobs table")?;
            let mut output_links = write_txn
                .open_table(JOB_OUTPUTS_TABLE)
                .context("failed to open job outputs table")?;
            let mut input_links = write_txn
                .open_table(JOB_INPUTS_TABLE)
                .context("failed to open job inputs table")?;
            let edges = write_txn
                .open_table(JOB_EDGES_TABLE)
                .context("failed to open job edges table")?;

            let key = id.to_string();
            let mut record: JobRecord = {
                let guard = jobs.get(key.as_str()).context("failed to read job")?;
                match guard {
                    Some(guard) => serde_json::from_slice(guard.value())
                        .context("failed to deserialize job")?,
                    None => return Err(Error::JobNotFound(*id)),
                }
            };
            if record.status != JobStatus::Running {
                return Err(Error::not_permitted(
                    "can't complete job: not in a running state",
                ));
            }
            record.status = JobStatus::Success;
            let value = serde_json::to_vec(&record).context("failed to serialize job")?;
            jobs.insert(key.as_str(), value.as_slice())
                .context("failed to write job")?;

            for (name, artifact) in outputs {
                let link_key = format!("{id}/{name}");
                let value =
                    serde_json::to_vec(artifact).context("failed to serialize artifact id")?;
                output_links
                    .insert(link_key.as_str(), value.as_slice())
                    .context("failed to link output artifact")?;
            }

            let child_ids = scan_child_ids(&edges, id)?;
            let mut ready = Vec::new();
            for child in child_ids {
                let child_key = child.to_string();
                let mut child_record: JobRecord = {
                    let guard = jobs
                        .get(child_key.as_str())
                        .context("failed to read child job")?;
                    match guard {
                        Some(guard) => serde_json::from_slice(guard.value())
                            .context("failed to deserialize child job")?,
                        None => return Err(Error::JobNotFound(child)),
                    }
                };
                let Some(wanted) = child_record.pending.remove(id) else {
                    continue;
                };
                for (param, output) in wanted {
                    let artifact = outputs.get(&output).ok_or_else(|| {
                        Error::validation(format!(
                            "job '{id}' completed without output '{output}' \
                             required by job '{child}'"
                        ))
                    })?;
                    child_record
                        .values
                        .insert(param, ParamValue::Artifact { id: *artifact });
                    let input_key = format!("{child}/{artifact}");
                    input_links
                        .insert(input_key.as_str(), b"".as_slice())
                        .context("failed to link input artifact")?;
                }
                let resolved = child_record.pending.is_empty();
                let value =
                    serde_json::to_vec(&child_record).context("failed to serialize child job")?;
                jobs.insert(child_key.as_str(), value.as_slice())
                    .context("failed to write child job")?;
                if resolved {
                    ready.push(child);
                }
            }
            ready
        };
        write_txn.commit().context("failed to commit")?;
        Ok(ready)
    }

    /// Atomically mark a job failed, attaching a fresh log entry. Returns
    /// `None` when the job is already terminal (the failure cascade skips
    /// it), otherwise the ids of its direct children.
    pub fn mark_error(
        &self,
        id: &JobId,
        category: &str,
        message: &str,
    ) -> Result<Option<Vec<JobId>>> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        let children = {
            let mut jobs = write_txn
                .open_table(JOBS_TABLE)
                .context("failed to open jobs table")?;
            let mut logs = write_txn
                .open_table(LOGS_TABLE)
                .context("failed to open logs table")?;
            let edges = write_txn
                .open_table(JOB_EDGES_TABLE)
                .context("failed to open job edges table")?;

            let key = id.to_string();
            let mut record: JobRecord = {
                let guard = jobs.get(key.as_str()).context("failed to read job")?;
                match guard {
                    Some(guard) => serde_json::from_slice(guard.value())
                        .context("failed to deserialize job")?,
                    None => return Err(Error::JobNotFound(*id)),
                }
            };
            if record.status.is_terminal() {
                return Ok(None);
            }

            let log = LogRecord {
                id: LogId::new(),
                category: category.to_string(),
                message: message.to_string(),
                created_at: Utc::now(),
            };
            let log_key = log.id.to_string();
            let log_value = serde_json::to_vec(&log).context("failed to serialize log entry")?;
            logs.insert(log_key.as_str(), log_value.as_slice())
                .context("failed to insert log entry")?;

            record.status = JobStatus::Error;
            record.log = Some(log.id);
            let value = serde_json::to_vec(&record).context("failed to serialize job")?;
            jobs.insert(key.as_str(), value.as_slice())
                .context("failed to write job")?;

            scan_child_ids(&edges, id)?
        };
        write_txn.commit().context("failed to commit")?;
        Ok(Some(children))
    }

    // === Workflows ===

    pub fn insert_workflow(&self, record: &WorkflowRecord) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("failed to open workflows table")?;
            let key = record.id.to_string();
            let value = serde_json::to_vec(record).context("failed to serialize workflow")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("failed to insert workflow")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    pub fn get_workflow(&self, id: &WorkflowId) -> Result<Option<WorkflowRecord>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("failed to open workflows table")?;

        let key = id.to_string();
        match table.get(key.as_str()).context("failed to read workflow")? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).context("failed to deserialize workflow")?,
            )),
            None => Ok(None),
        }
    }

    pub fn workflow(&self, id: &WorkflowId) -> Result<WorkflowRecord> {
        self.get_workflow(id)?.ok_or(Error::WorkflowNotFound(*id))
    }

    // === Workflow roots ===

    pub fn add_root(&self, workflow: &WorkflowId, job: &JobId) -> Result<()> {
        self.insert_link(WORKFLOW_ROOTS_TABLE, &format!("{workflow}/{job}"))
    }

    pub fn remove_root(&self, workflow: &WorkflowId, job: &JobId) -> Result<()> {
        self.remove_link(WORKFLOW_ROOTS_TABLE, &format!("{workflow}/{job}"))
    }

    pub fn root_ids(&self, workflow: &WorkflowId) -> Result<Vec<JobId>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOW_ROOTS_TABLE)
            .context("failed to open workflow roots table")?;
        let suffixes = scan_key_suffixes(&table, &format!("{workflow}/"))?;
        suffixes.iter().map(|s| parse_job_id(s)).collect()
    }

    // === Job edges (parent → child) ===

    pub fn add_edge(&self, parent: &JobId, child: &JobId) -> Result<()> {
        self.insert_link(JOB_EDGES_TABLE, &format!("{parent}/{child}"))
    }

    pub fn children_ids(&self, parent: &JobId) -> Result<Vec<JobId>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(JOB_EDGES_TABLE)
            .context("failed to open job edges table")?;
        scan_child_ids(&table, parent)
    }

    /// Drop every edge that points at `child`. Only used while a workflow is
    /// still in construction, so a full table scan is acceptable.
    pub fn remove_incoming_edges(&self, child: &JobId) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOB_EDGES_TABLE)
                .context("failed to open job edges table")?;
            let suffix = format!("/{child}");
            let doomed: Vec<String> = {
                let mut keys = Vec::new();
                for item in table.iter().context("failed to scan job edges")? {
                    let (key, _) = item.context("failed to read edge")?;
                    let key = key.value();
                    if key.ends_with(&suffix) {
                        keys.push(key.to_string());
                    }
                }
                keys
            };
            for key in doomed {
                table
                    .remove(key.as_str())
                    .context("failed to delete edge")?;
            }
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    // === Input / output artifact links ===

    pub fn add_input(&self, job: &JobId, artifact: &ArtifactId) -> Result<()> {
        self.insert_link(JOB_INPUTS_TABLE, &format!("{job}/{artifact}"))
    }

    pub fn input_ids(&self, job: &JobId) -> Result<Vec<ArtifactId>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(JOB_INPUTS_TABLE)
            .context("failed to open job inputs table")?;
        let suffixes = scan_key_suffixes(&table, &format!("{job}/"))?;
        suffixes
            .iter()
            .map(|s| {
                Ok(ArtifactId(
                    Uuid::parse_str(s).context("malformed artifact id key")?,
                ))
            })
            .collect()
    }

    pub fn remove_inputs(&self, job: &JobId) -> Result<()> {
        self.remove_links_with_prefix(JOB_INPUTS_TABLE, &format!("{job}/"))
    }

    pub fn output_artifacts(&self, job: &JobId) -> Result<BTreeMap<String, ArtifactId>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(JOB_OUTPUTS_TABLE)
            .context("failed to open job outputs table")?;

        let prefix = format!("{job}/");
        let mut outputs = BTreeMap::new();
        for item in table
            .range(prefix.as_str()..)
            .context("failed to scan job outputs")?
        {
            let (key, value) = item.context("failed to read output link")?;
            let key = key.value();
            if !key.starts_with(&prefix) {
                break;
            }
            let artifact: ArtifactId = serde_json::from_slice(value.value())
                .context("failed to deserialize artifact id")?;
            outputs.insert(key[prefix.len()..].to_string(), artifact);
        }
        Ok(outputs)
    }

    // === Logs ===

    pub fn get_log(&self, id: &LogId) -> Result<Option<LogRecord>> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(LOGS_TABLE)
            .context("failed to open logs table")?;

        let key = id.to_string();
        match table.get(key.as_str()).context("failed to read log entry")? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value())
                    .context("failed to deserialize log entry")?,
            )),
            None => Ok(None),
        }
    }

    // === Key-only link tables ===

    fn insert_link(&self, def: TableDefinition<&str, &[u8]>, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn.open_table(def).context("failed to open table")?;
            table
                .insert(key, b"".as_slice())
                .context("failed to insert link")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    fn remove_link(&self, def: TableDefinition<&str, &[u8]>, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn.open_table(def).context("failed to open table")?;
            table.remove(key).context("failed to remove link")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }

    fn remove_links_with_prefix(
        &self,
        def: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> Result<()> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn.open_table(def).context("failed to open table")?;
            let doomed = scan_keys_with_prefix(&table, prefix)?;
            for key in doomed {
                table
                    .remove(key.as_str())
                    .context("failed to remove link")?;
            }
        }
        write_txn.commit().context("failed to commit")?;
        Ok(())
    }
}

fn scan_keys_with_prefix(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for item in table.range(prefix..).context("failed to scan table")? {
        let (key, _) = item.context("failed to read entry")?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

fn scan_key_suffixes(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<String>> {
    Ok(scan_keys_with_prefix(table, prefix)?
        .into_iter()
        .map(|key| key[prefix.len()..].to_string())
        .collect())
}

fn scan_child_ids(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    parent: &JobId,
) -> Result<Vec<JobId>> {
    let suffixes = scan_key_suffixes(table, &format!("{parent}/"))?;
    suffixes.iter().map(|s| parse_job_id(s)).collect()
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    Ok(JobId(
        Uuid::parse_str(raw).context("malformed job id key")?,
    ))
}
