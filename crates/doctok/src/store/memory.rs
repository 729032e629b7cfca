//! In-process [`Database`] used by the server binary and the test-suite.
//!
//! All state lives behind one mutex. Sessions stage their writes and apply
//! them atomically on commit; writes that reference a project deleted in the
//! meantime are dropped on apply, the way a foreign-key cascade would drop
//! them.

use crate::{
    Attribute, AttributeId, AttributeState, Database, Error, MissingStatistics, Notification,
    PendingAttribute, Project, ProjectId, ProjectStatus, Record, RecordId, Result, Session, TaskId,
    TaskPatch, TokenStatistic, TokenizationTask, TokenizedRecord, TokenizerDataRow,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use uuid::Uuid;

/// Seed data for a [`MemoryDatabase`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Debug, Default)]
struct State {
    projects: HashMap<ProjectId, Project>,
    attributes: Vec<Attribute>,
    records: Vec<Record>,
    blobs: Vec<TokenizedRecord>,
    statistics: Vec<TokenStatistic>,
    tasks: Vec<TokenizationTask>,
    notifications: Vec<Notification>,
}

impl State {
    fn has_project(&self, project_id: ProjectId) -> bool {
        self.projects.contains_key(&project_id)
    }

    fn attributes_sorted(
        &self,
        project_id: ProjectId,
        states: &[AttributeState],
        text: bool,
    ) -> Vec<Attribute> {
        let mut out: Vec<_> = self
            .attributes
            .iter()
            .filter(|a| a.project_id == project_id && a.is_text() == text)
            .filter(|a| states.contains(&a.state))
            .cloned()
            .collect();
        out.sort_by_key(|a| a.relative_position);
        out
    }

    fn tokenized_ids(&self, project_id: ProjectId) -> HashSet<RecordId> {
        self.blobs
            .iter()
            .filter(|b| b.project_id == project_id)
            .map(|b| b.record_id)
            .collect()
    }

    /// Oldest blob per record.
    fn first_blobs(&self, project_id: ProjectId) -> HashMap<RecordId, &TokenizedRecord> {
        let mut out = HashMap::new();
        for blob in self.blobs.iter().filter(|b| b.project_id == project_id) {
            out.entry(blob.record_id).or_insert(blob);
        }
        out
    }

    fn missing_statistics(
        &self,
        project_id: ProjectId,
        attribute_ids: &[AttributeId],
    ) -> impl Iterator<Item = MissingStatistics> + '_ {
        let targets: Vec<(AttributeId, String)> = attribute_ids
            .iter()
            .filter_map(|id| {
                self.attributes
                    .iter()
                    .find(|a| a.id == *id && a.project_id == project_id)
                    .map(|a| (a.id, a.name.clone()))
            })
            .collect();
        let present: HashSet<(RecordId, AttributeId)> = self
            .statistics
            .iter()
            .filter(|s| s.project_id == project_id)
            .map(|s| (s.record_id, s.attribute_id))
            .collect();
        let blobs = self.first_blobs(project_id);

        self.records
            .iter()
            .filter(move |r| r.project_id == project_id)
            .filter_map(move |record| {
                let blob = blobs.get(&record.id);
                let attribute_ids: Vec<_> = targets
                    .iter()
                    .filter(|(id, _)| !present.contains(&(record.id, *id)))
                    .filter(|(_, name)| blob.is_none_or(|b| b.columns.contains(name)))
                    .map(|(id, _)| *id)
                    .collect();
                (!attribute_ids.is_empty()).then(|| MissingStatistics {
                    record_id: record.id,
                    attribute_ids,
                })
            })
    }

    fn delete_project(&mut self, project_id: ProjectId) {
        self.projects.remove(&project_id);
        self.attributes.retain(|a| a.project_id != project_id);
        self.records.retain(|r| r.project_id != project_id);
        self.blobs.retain(|b| b.project_id != project_id);
        self.statistics.retain(|s| s.project_id != project_id);
        self.tasks.retain(|t| t.project_id != project_id);
        self.notifications.retain(|n| n.project_id != project_id);
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::InsertTask(task) => {
                if self.has_project(task.project_id) {
                    self.tasks.push(task);
                }
            }
            Write::PatchTask {
                project_id,
                task_id,
                patch,
            } => {
                if let Some(task) = self
                    .tasks
                    .iter_mut()
                    .find(|t| t.id == task_id && t.project_id == project_id)
                {
                    task.apply(&patch);
                }
            }
            Write::AddBlobs(blobs) => {
                let kept: Vec<_> = blobs
                    .into_iter()
                    .filter(|b| self.has_project(b.project_id))
                    .collect();
                self.blobs.extend(kept);
            }
            Write::UpdateBlob {
                project_id,
                blob_id,
                bytes,
                columns,
            } => {
                if let Some(blob) = self
                    .blobs
                    .iter_mut()
                    .find(|b| b.id == blob_id && b.project_id == project_id)
                {
                    blob.bytes = bytes;
                    blob.columns = columns;
                }
            }
            Write::DedupBlobs(project_id) => {
                let mut seen = HashSet::new();
                self.blobs
                    .retain(|b| b.project_id != project_id || seen.insert(b.record_id));
            }
            Write::AddStatistics(statistics) => {
                let kept: Vec<_> = statistics
                    .into_iter()
                    .filter(|s| self.has_project(s.project_id))
                    .collect();
                self.statistics.extend(kept);
            }
            Write::UpsertStatistic(statistic) => {
                if !self.has_project(statistic.project_id) {
                    return;
                }
                match self.statistics.iter_mut().find(|s| {
                    s.project_id == statistic.project_id
                        && s.record_id == statistic.record_id
                        && s.attribute_id == statistic.attribute_id
                }) {
                    Some(existing) => existing.num_token = statistic.num_token,
                    None => self.statistics.push(statistic),
                }
            }
            Write::DedupStatistics(project_id) => {
                let mut seen = HashSet::new();
                self.statistics.retain(|s| {
                    s.project_id != project_id || seen.insert((s.record_id, s.attribute_id))
                });
            }
            Write::Notify(notification) => {
                if self.has_project(notification.project_id) {
                    self.notifications.push(notification);
                }
            }
        }
    }
}

#[derive(Debug)]
enum Write {
    InsertTask(TokenizationTask),
    PatchTask {
        project_id: ProjectId,
        task_id: TaskId,
        patch: TaskPatch,
    },
    AddBlobs(Vec<TokenizedRecord>),
    UpdateBlob {
        project_id: ProjectId,
        blob_id: Uuid,
        bytes: Bytes,
        columns: Vec<String>,
    },
    DedupBlobs(ProjectId),
    AddStatistics(Vec<TokenStatistic>),
    UpsertStatistic(TokenStatistic),
    DedupStatistics(ProjectId),
    Notify(Notification),
}

/// Shared handle to the in-memory store. Clones observe the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
    open_sessions: Arc<AtomicUsize>,
    failing: Arc<Mutex<HashSet<&'static str>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let db = Self::new();
        {
            let mut state = db.state.lock();
            for project in snapshot.projects {
                state.projects.insert(project.id, project);
            }
            state.attributes = snapshot.attributes;
            state.records = snapshot.records;
        }
        db
    }

    /// Parses a JSON-encoded [`Snapshot`].
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let snapshot: Snapshot =
            serde_json::from_slice(json).map_err(|e| Error::store(format!("invalid seed: {e}")))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn insert_project(&self, project: Project) {
        self.state.lock().projects.insert(project.id, project);
    }

    pub fn insert_attribute(&self, attribute: Attribute) {
        self.state.lock().attributes.push(attribute);
    }

    pub fn insert_record(&self, record: Record) {
        self.state.lock().records.push(record);
    }

    /// Writes a blob directly, bypassing sessions.
    pub fn insert_tokenized_record(&self, blob: TokenizedRecord) {
        self.state.lock().blobs.push(blob);
    }

    /// Deletes a project and everything that references it.
    pub fn delete_project(&self, project_id: ProjectId) {
        self.state.lock().delete_project(project_id);
    }

    pub fn set_project_status(&self, project_id: ProjectId, status: ProjectStatus) {
        if let Some(project) = self.state.lock().projects.get_mut(&project_id) {
            project.status = status;
        }
    }

    /// Applies a committed change to a task row, as an operator would.
    pub fn patch_task(&self, task_id: TaskId, patch: TaskPatch) {
        if let Some(task) = self.state.lock().tasks.iter_mut().find(|t| t.id == task_id) {
            task.apply(&patch);
        }
    }

    pub fn tasks(&self, project_id: ProjectId) -> Vec<TokenizationTask> {
        self.state
            .lock()
            .tasks
            .iter()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn notifications(&self, project_id: ProjectId) -> Vec<Notification> {
        self.state
            .lock()
            .notifications
            .iter()
            .filter(|n| n.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn tokenized_records(&self, project_id: ProjectId) -> Vec<TokenizedRecord> {
        self.state
            .lock()
            .blobs
            .iter()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn token_statistics(&self, project_id: ProjectId) -> Vec<TokenStatistic> {
        self.state
            .lock()
            .statistics
            .iter()
            .filter(|s| s.project_id == project_id)
            .copied()
            .collect()
    }

    /// Sessions handed out and not yet released.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }

    /// Makes every call of the named session operation fail with
    /// [`Error::Store`]. `"session"` fails [`Database::session`] itself.
    pub fn fail_operation(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.failing.lock().contains(operation) {
            return Err(Error::store(format!("{operation} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn session(&self) -> Result<Box<dyn Session>> {
        self.check("session")?;
        self.open_sessions.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemorySession {
            db: self.clone(),
            pending: Vec::new(),
            released: false,
        }))
    }
}

struct MemorySession {
    db: MemoryDatabase,
    pending: Vec<Write>,
    released: bool,
}

impl MemorySession {
    fn stage(&mut self, operation: &'static str, write: Write) -> Result<()> {
        self.ensure_open()?;
        self.db.check(operation)?;
        self.pending.push(write);
        Ok(())
    }

    fn read(&self, operation: &'static str) -> Result<parking_lot::MutexGuard<'_, State>> {
        self.ensure_open()?;
        self.db.check(operation)?;
        Ok(self.db.state.lock())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.released {
            return Err(Error::store("session already released"));
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.released {
            self.released = true;
            self.pending.clear();
            self.db.open_sessions.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn project(&mut self, project_id: ProjectId) -> Result<Option<Project>> {
        Ok(self.read("project")?.projects.get(&project_id).cloned())
    }

    async fn attribute(
        &mut self,
        project_id: ProjectId,
        attribute_id: AttributeId,
    ) -> Result<Option<Attribute>> {
        Ok(self
            .read("attribute")?
            .attributes
            .iter()
            .find(|a| a.id == attribute_id && a.project_id == project_id)
            .cloned())
    }

    async fn text_attributes(
        &mut self,
        project_id: ProjectId,
        states: &[AttributeState],
    ) -> Result<Vec<Attribute>> {
        Ok(self
            .read("text_attributes")?
            .attributes_sorted(project_id, states, true))
    }

    async fn non_text_attributes(
        &mut self,
        project_id: ProjectId,
        states: &[AttributeState],
    ) -> Result<Vec<Attribute>> {
        Ok(self
            .read("non_text_attributes")?
            .attributes_sorted(project_id, states, false))
    }

    async fn record(
        &mut self,
        project_id: ProjectId,
        record_id: RecordId,
    ) -> Result<Option<Record>> {
        Ok(self
            .read("record")?
            .records
            .iter()
            .find(|r| r.id == record_id && r.project_id == project_id)
            .cloned())
    }

    async fn count_records_without_tokenization(&mut self, project_id: ProjectId) -> Result<u64> {
        let state = self.read("count_records_without_tokenization")?;
        let tokenized = state.tokenized_ids(project_id);
        Ok(state
            .records
            .iter()
            .filter(|r| r.project_id == project_id && !tokenized.contains(&r.id))
            .count() as u64)
    }

    async fn records_without_tokenization(
        &mut self,
        project_id: ProjectId,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let state = self.read("records_without_tokenization")?;
        let tokenized = state.tokenized_ids(project_id);
        Ok(state
            .records
            .iter()
            .filter(|r| r.project_id == project_id && !tokenized.contains(&r.id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_records_missing_attribute(
        &mut self,
        project_id: ProjectId,
        attribute_name: &str,
    ) -> Result<u64> {
        Ok(self
            .read("count_records_missing_attribute")?
            .blobs
            .iter()
            .filter(|b| b.project_id == project_id && !b.columns.iter().any(|c| c == attribute_name))
            .count() as u64)
    }

    async fn records_missing_attribute(
        &mut self,
        project_id: ProjectId,
        attribute_name: &str,
        limit: usize,
    ) -> Result<Vec<PendingAttribute>> {
        let state = self.read("records_missing_attribute")?;
        let records: HashMap<RecordId, &Record> = state
            .records
            .iter()
            .filter(|r| r.project_id == project_id)
            .map(|r| (r.id, r))
            .collect();
        Ok(state
            .blobs
            .iter()
            .filter(|b| b.project_id == project_id && !b.columns.iter().any(|c| c == attribute_name))
            .take(limit)
            .map(|blob| PendingAttribute {
                blob: blob.clone(),
                text: records
                    .get(&blob.record_id)
                    .map(|r| r.text_of(attribute_name))
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn has_tokenized_record(
        &mut self,
        project_id: ProjectId,
        record_id: RecordId,
    ) -> Result<bool> {
        Ok(self
            .read("has_tokenized_record")?
            .blobs
            .iter()
            .any(|b| b.project_id == project_id && b.record_id == record_id))
    }

    async fn tokenized_record(
        &mut self,
        project_id: ProjectId,
        record_id: RecordId,
    ) -> Result<Option<TokenizedRecord>> {
        Ok(self
            .read("tokenized_record")?
            .blobs
            .iter()
            .find(|b| b.project_id == project_id && b.record_id == record_id)
            .cloned())
    }

    async fn count_tokenized_records(&mut self, project_id: ProjectId) -> Result<u64> {
        Ok(self
            .read("count_tokenized_records")?
            .blobs
            .iter()
            .filter(|b| b.project_id == project_id)
            .count() as u64)
    }

    async fn add_tokenized_records(&mut self, records: Vec<TokenizedRecord>) -> Result<()> {
        self.stage("add_tokenized_records", Write::AddBlobs(records))
    }

    async fn update_tokenized_record(
        &mut self,
        project_id: ProjectId,
        blob_id: Uuid,
        bytes: Bytes,
        columns: Vec<String>,
    ) -> Result<()> {
        self.stage(
            "update_tokenized_record",
            Write::UpdateBlob {
                project_id,
                blob_id,
                bytes,
                columns,
            },
        )
    }

    async fn delete_duplicated_tokenized_records(&mut self, project_id: ProjectId) -> Result<()> {
        self.stage(
            "delete_duplicated_tokenized_records",
            Write::DedupBlobs(project_id),
        )
    }

    async fn export_tokenizer_data(
        &mut self,
        project_id: ProjectId,
        columns: &[String],
    ) -> Result<Vec<TokenizerDataRow>> {
        let state = self.read("export_tokenizer_data")?;
        let blobs = state.first_blobs(project_id);
        Ok(state
            .records
            .iter()
            .filter(|r| r.project_id == project_id)
            .filter_map(|record| {
                let blob = blobs.get(&record.id)?;
                let data: Map<_, _> = columns
                    .iter()
                    .filter_map(|c| record.data.get(c).map(|v| (c.clone(), v.clone())))
                    .collect();
                Some(TokenizerDataRow {
                    record_id: record.id,
                    columns: blob.columns.clone(),
                    data,
                })
            })
            .collect())
    }

    async fn count_records_missing_statistics(
        &mut self,
        project_id: ProjectId,
        attribute_ids: &[AttributeId],
    ) -> Result<u64> {
        Ok(self
            .read("count_records_missing_statistics")?
            .missing_statistics(project_id, attribute_ids)
            .count() as u64)
    }

    async fn records_missing_statistics(
        &mut self,
        project_id: ProjectId,
        attribute_ids: &[AttributeId],
        limit: usize,
    ) -> Result<Vec<MissingStatistics>> {
        Ok(self
            .read("records_missing_statistics")?
            .missing_statistics(project_id, attribute_ids)
            .take(limit)
            .collect())
    }

    async fn add_token_statistics(&mut self, statistics: Vec<TokenStatistic>) -> Result<()> {
        self.stage("add_token_statistics", Write::AddStatistics(statistics))
    }

    async fn upsert_token_statistic(&mut self, statistic: TokenStatistic) -> Result<()> {
        self.stage("upsert_token_statistic", Write::UpsertStatistic(statistic))
    }

    async fn delete_duplicated_token_statistics(&mut self, project_id: ProjectId) -> Result<()> {
        self.stage(
            "delete_duplicated_token_statistics",
            Write::DedupStatistics(project_id),
        )
    }

    async fn insert_task(&mut self, task: TokenizationTask) -> Result<()> {
        self.stage("insert_task", Write::InsertTask(task))
    }

    async fn task(
        &mut self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> Result<Option<TokenizationTask>> {
        Ok(self
            .read("task")?
            .tasks
            .iter()
            .find(|t| t.id == task_id && t.project_id == project_id)
            .cloned())
    }

    async fn update_task(
        &mut self,
        project_id: ProjectId,
        task_id: TaskId,
        patch: TaskPatch,
    ) -> Result<()> {
        self.stage(
            "update_task",
            Write::PatchTask {
                project_id,
                task_id,
                patch,
            },
        )
    }

    async fn has_active_batch_task(&mut self, project_id: ProjectId) -> Result<bool> {
        Ok(self.read("has_active_batch_task")?.tasks.iter().any(|t| {
            t.project_id == project_id && t.scope.is_batch() && t.state.is_active()
        }))
    }

    async fn create_notification(&mut self, notification: Notification) -> Result<()> {
        self.stage("create_notification", Write::Notify(notification))
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Err(e) = self.db.check("commit") {
            self.pending.clear();
            return Err(e);
        }
        let writes = core::mem::take(&mut self.pending);
        let mut state = self.db.state.lock();
        for write in writes {
            state.apply(write);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.pending.clear();
        Ok(())
    }

    async fn refresh(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.db.check("refresh")?;
        if !self.pending.is_empty() {
            tracing::warn!(
                discarded = self.pending.len(),
                "Refreshing session with uncommitted writes"
            );
            self.pending.clear();
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataType, TaskScope};
    use serde_json::json;

    fn seeded() -> (MemoryDatabase, ProjectId, Vec<Attribute>, Vec<RecordId>) {
        let project_id = Uuid::new_v4();
        let db = MemoryDatabase::new();
        db.insert_project(Project {
            id: project_id,
            organization_id: Uuid::new_v4(),
            name: "p".to_owned(),
            tokenizer: "en_core_web_sm".to_owned(),
            status: ProjectStatus::Active,
        });
        let attributes: Vec<_> = [("body", 1), ("title", 0)]
            .into_iter()
            .map(|(name, position)| Attribute {
                id: Uuid::new_v4(),
                project_id,
                name: name.to_owned(),
                data_type: DataType::Text,
                state: AttributeState::Uploaded,
                relative_position: position,
            })
            .collect();
        for attribute in &attributes {
            db.insert_attribute(attribute.clone());
        }
        let records: Vec<_> = (0..3)
            .map(|i| {
                let id = Uuid::new_v4();
                let data = json!({ "title": format!("t{i}"), "body": format!("b{i}") });
                db.insert_record(Record {
                    id,
                    project_id,
                    data: data.as_object().cloned().unwrap_or_default(),
                });
                id
            })
            .collect();
        (db, project_id, attributes, records)
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let (db, project_id, _, records) = seeded();
        let mut session = db.session().await.unwrap();

        let blob = TokenizedRecord::new(project_id, records[0], Bytes::new(), vec![]);
        session.add_tokenized_records(vec![blob]).await.unwrap();
        assert_eq!(session.count_tokenized_records(project_id).await.unwrap(), 0);

        session.commit().await.unwrap();
        assert_eq!(session.count_tokenized_records(project_id).await.unwrap(), 1);
        assert_eq!(session.count_records_without_tokenization(project_id).await.unwrap(), 2);

        let blob = TokenizedRecord::new(project_id, records[1], Bytes::new(), vec![]);
        session.add_tokenized_records(vec![blob]).await.unwrap();
        session.rollback().await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(db.tokenized_records(project_id).len(), 1);
    }

    #[tokio::test]
    async fn sessions_are_counted_until_released_or_dropped() {
        let (db, _, _, _) = seeded();
        let mut a = db.session().await.unwrap();
        let b = db.session().await.unwrap();
        assert_eq!(db.open_sessions(), 2);

        a.release().await.unwrap();
        a.release().await.unwrap();
        assert_eq!(db.open_sessions(), 1);
        assert!(a.project(Uuid::new_v4()).await.is_err());

        drop(b);
        assert_eq!(db.open_sessions(), 0);
    }

    #[tokio::test]
    async fn text_attributes_follow_relative_position() {
        let (db, project_id, _, _) = seeded();
        let mut session = db.session().await.unwrap();
        let names: Vec<_> = session
            .text_attributes(project_id, AttributeState::ELIGIBLE)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, ["title", "body"]);
    }

    #[tokio::test]
    async fn missing_statistics_respect_blob_columns() {
        let (db, project_id, attributes, records) = seeded();
        let ids: Vec<_> = attributes.iter().map(|a| a.id).collect();
        // record 0 has a blob that only covers "title"
        db.insert_tokenized_record(TokenizedRecord::new(
            project_id,
            records[0],
            Bytes::new(),
            vec!["title".to_owned()],
        ));
        let title = attributes.iter().find(|a| a.name == "title").unwrap();
        db.state
            .lock()
            .statistics
            .push(TokenStatistic::new(project_id, records[1], title.id, 2));

        let mut session = db.session().await.unwrap();
        let missing = session
            .records_missing_statistics(project_id, &ids, 10)
            .await
            .unwrap();

        assert_eq!(missing.len(), 3);
        assert_eq!(missing[0].attribute_ids, [title.id]);
        assert_eq!(missing[1].attribute_ids.len(), 1);
        assert_eq!(missing[2].attribute_ids.len(), 2);
        assert_eq!(
            session
                .count_records_missing_statistics(project_id, &[title.id])
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn dedup_keeps_the_oldest_blob() {
        let (db, project_id, _, records) = seeded();
        let first = TokenizedRecord::new(project_id, records[0], Bytes::from_static(b"1"), vec![]);
        let second = TokenizedRecord::new(project_id, records[0], Bytes::from_static(b"2"), vec![]);
        db.insert_tokenized_record(first.clone());
        db.insert_tokenized_record(second);

        let mut session = db.session().await.unwrap();
        session
            .delete_duplicated_tokenized_records(project_id)
            .await
            .unwrap();
        session.commit().await.unwrap();

        assert_eq!(db.tokenized_records(project_id), vec![first]);
    }

    #[tokio::test]
    async fn writes_for_deleted_projects_are_dropped() {
        let (db, project_id, _, records) = seeded();
        let user = Uuid::new_v4();
        let mut session = db.session().await.unwrap();
        let task = TokenizationTask::new(project_id, user, TaskScope::Project, None);
        session.insert_task(task).await.unwrap();
        session
            .add_tokenized_records(vec![TokenizedRecord::new(
                project_id,
                records[0],
                Bytes::new(),
                vec![],
            )])
            .await
            .unwrap();

        db.delete_project(project_id);
        session.commit().await.unwrap();

        assert!(db.tasks(project_id).is_empty());
        assert!(db.tokenized_records(project_id).is_empty());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_store_errors() {
        let (db, project_id, _, _) = seeded();
        db.fail_operation("records_without_tokenization");
        let mut session = db.session().await.unwrap();

        let err = session
            .records_without_tokenization(project_id, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store { .. }));

        db.clear_failures();
        assert_eq!(
            session
                .records_without_tokenization(project_id, 10)
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn seed_parses_from_json() {
        let project_id = Uuid::new_v4();
        let seed = json!({
            "projects": [{
                "id": project_id,
                "organization_id": Uuid::new_v4(),
                "name": "seeded",
                "tokenizer": "en_core_web_sm"
            }],
            "records": [{ "id": Uuid::new_v4(), "project_id": project_id, "data": { "text": null } }]
        });
        let db = MemoryDatabase::from_json(seed.to_string().as_bytes()).unwrap();
        let state = db.state.lock();
        assert_eq!(state.projects[&project_id].status, ProjectStatus::Active);
        assert_eq!(state.records[0].text_of("text"), "");
        assert!(MemoryDatabase::from_json(b"{").is_err());
    }
}
