use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use reu_core::fields::CATCH_ALL;
use reu_core::{match_key, NormalizedProgram, SourceTag, StoredProgram};
use reu_storage::{ProgramFilter, ProgramStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpsertSettings {
    pub batch_size: usize,
}

impl Default for UpsertSettings {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    /// Records replaced by a later record for the same program within the batch.
    pub superseded: usize,
}

/// Keep the last record per case-insensitive (title, institution), preserving relative order.
pub fn dedupe_last_wins(records: Vec<NormalizedProgram>) -> Vec<NormalizedProgram> {
    let mut seen = HashSet::new();
    let mut kept = records
        .into_iter()
        .rev()
        .filter(|record| seen.insert(record.identity_key()))
        .collect::<Vec<_>>();
    kept.reverse();
    kept
}

/// Lookup tables over an immutable snapshot of stored programs.
struct MatchIndex {
    by_title_institution: HashMap<(String, String), usize>,
    by_institution_field: HashMap<(String, String), usize>,
    by_link: HashMap<String, usize>,
}

fn informative_field(field: Option<&str>) -> Option<String> {
    field
        .map(match_key)
        .filter(|f| !f.is_empty() && *f != match_key(CATCH_ALL))
}

impl MatchIndex {
    fn build(existing: &[StoredProgram]) -> Self {
        let mut index = Self {
            by_title_institution: HashMap::new(),
            by_institution_field: HashMap::new(),
            by_link: HashMap::new(),
        };
        for (pos, stored) in existing.iter().enumerate() {
            let program = &stored.program;
            index
                .by_title_institution
                .entry(program.identity_key())
                .or_insert(pos);
            if let Some(field) = informative_field(program.first_field()) {
                index
                    .by_institution_field
                    .entry((match_key(&program.institution), field))
                    .or_insert(pos);
            }
            let link = match_key(&program.link);
            if !link.is_empty() {
                index.by_link.entry(link).or_insert(pos);
            }
        }
        index
    }

    /// Title+institution, then institution+first field, then link.
    fn find(&self, program: &NormalizedProgram) -> Option<usize> {
        if let Some(pos) = self.by_title_institution.get(&program.identity_key()) {
            return Some(*pos);
        }
        if let Some(field) = informative_field(program.first_field()) {
            if let Some(pos) = self
                .by_institution_field
                .get(&(match_key(&program.institution), field))
            {
                return Some(*pos);
            }
        }
        let link = match_key(&program.link);
        if link.is_empty() {
            return None;
        }
        self.by_link.get(&link).copied()
    }
}

pub struct ReconcilingUpsert {
    store: Arc<dyn ProgramStore>,
    batch_size: usize,
}

impl ReconcilingUpsert {
    pub fn new(store: Arc<dyn ProgramStore>, settings: &UpsertSettings) -> Self {
        Self {
            store,
            batch_size: settings.batch_size.max(1),
        }
    }

    /// Reconcile a batch against everything stored. Only the initial snapshot read can fail;
    /// write failures are retried one record at a time and counted.
    pub async fn upsert(
        &self,
        records: Vec<NormalizedProgram>,
        source: SourceTag,
    ) -> Result<UpsertOutcome, StoreError> {
        let received = records.len();
        let records = dedupe_last_wins(records);
        let mut superseded = received - records.len();
        if superseded > 0 {
            debug!(%source, dropped = superseded, "dropped in-batch duplicates");
        }

        let existing = self.store.find_all(&ProgramFilter::all()).await?;
        let index = MatchIndex::build(&existing);
        let now = Utc::now();

        let mut inserts = Vec::new();
        let mut updates: Vec<StoredProgram> = Vec::new();
        let mut update_slots: HashMap<Uuid, usize> = HashMap::new();
        for program in records {
            match index.find(&program) {
                Some(pos) => {
                    let mut stored = existing[pos].clone();
                    stored.overwrite(program, now);
                    match update_slots.get(&stored.id) {
                        Some(slot) => {
                            warn!(
                                %source,
                                id = %stored.id,
                                replaced = %updates[*slot].program.title,
                                title = %stored.program.title,
                                "two records matched the same stored program; keeping the later one"
                            );
                            superseded += 1;
                            updates[*slot] = stored;
                        }
                        None => {
                            update_slots.insert(stored.id, updates.len());
                            updates.push(stored);
                        }
                    }
                }
                None => inserts.push(StoredProgram::new(program, now)),
            }
        }

        let mut outcome = UpsertOutcome::default();
        let (inserted, insert_failures) = self.write_chunked(&inserts, WriteKind::Insert, source).await;
        let (updated, update_failures) = self.write_chunked(&updates, WriteKind::Update, source).await;
        outcome.inserted = inserted;
        outcome.updated = updated;
        outcome.failed = insert_failures + update_failures;
        outcome.superseded = superseded;

        info!(
            %source,
            inserted = outcome.inserted,
            updated = outcome.updated,
            failed = outcome.failed,
            superseded = outcome.superseded,
            "upsert complete"
        );
        Ok(outcome)
    }

    async fn write(&self, records: &[StoredProgram], kind: WriteKind) -> Result<usize, StoreError> {
        match kind {
            WriteKind::Insert => self.store.insert_many(records).await,
            WriteKind::Update => self.store.update_many(records).await,
        }
    }

    async fn write_chunked(&self, records: &[StoredProgram], kind: WriteKind, source: SourceTag) -> (usize, usize) {
        let mut written = 0;
        let mut failed = 0;
        for chunk in records.chunks(self.batch_size) {
            match self.write(chunk, kind).await {
                Ok(count) => written += count,
                Err(err) => {
                    warn!(%source, ?kind, size = chunk.len(), error = %err, "batch write failed; retrying individually");
                    for record in chunk {
                        match self.write(std::slice::from_ref(record), kind).await {
                            Ok(count) => written += count,
                            Err(err) => {
                                warn!(
                                    %source,
                                    ?kind,
                                    title = %record.program.title,
                                    institution = %record.program.institution,
                                    error = %err,
                                    "record write failed"
                                );
                                failed += 1;
                            }
                        }
                    }
                }
            }
        }
        (written, failed)
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteKind {
    Insert,
    Update,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reu_core::{Deadline, ProgramStatus};
    use reu_storage::InMemoryProgramStore;

    fn program(title: &str, institution: &str) -> NormalizedProgram {
        NormalizedProgram {
            title: title.into(),
            institution: institution.into(),
            location: "Providence, RI".into(),
            fields: vec!["Biology".into()],
            description: String::new(),
            deadline: Deadline::Unknown,
            stipend: String::new(),
            duration: "10 weeks".into(),
            requirements: String::new(),
            link: String::new(),
            source: SourceTag::Manual,
            status: ProgramStatus::Active,
        }
    }

    fn upserter(store: Arc<dyn ProgramStore>, batch_size: usize) -> ReconcilingUpsert {
        ReconcilingUpsert::new(store, &UpsertSettings { batch_size })
    }

    /// Rejects multi-record writes and anything titled "poison".
    struct FlakyStore {
        inner: InMemoryProgramStore,
    }

    #[async_trait]
    impl ProgramStore for FlakyStore {
        async fn find_all(&self, filter: &ProgramFilter) -> Result<Vec<StoredProgram>, StoreError> {
            self.inner.find_all(filter).await
        }

        async fn insert_many(&self, records: &[StoredProgram]) -> Result<usize, StoreError> {
            if records.len() > 1 || records.iter().any(|r| r.program.title == "poison") {
                return Err(StoreError::Corrupt {
                    id: records[0].id,
                    message: "write refused".into(),
                });
            }
            self.inner.insert_many(records).await
        }

        async fn update_many(&self, records: &[StoredProgram]) -> Result<usize, StoreError> {
            self.inner.update_many(records).await
        }
    }

    #[test]
    fn dedupe_keeps_the_last_occurrence() {
        let mut first = program("Bio REU", "Tufts");
        first.description = "old".into();
        let mut second = program(" bio reu ", "TUFTS");
        second.description = "new".into();
        let other = program("Chem REU", "Tufts");

        let kept = dedupe_last_wins(vec![first, other, second]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].title, "Chem REU");
        assert_eq!(kept[1].description, "new");
    }

    #[tokio::test]
    async fn second_upsert_updates_in_place() {
        let store = Arc::new(InMemoryProgramStore::new());
        let upsert = upserter(store.clone(), 100);

        let mut old = program("Bio REU", "Tufts");
        old.description = "old".into();
        let first = upsert.upsert(vec![old], SourceTag::Manual).await.unwrap();
        assert_eq!(first.inserted, 1);

        let mut new = program("bio reu", "tufts");
        new.description = "new".into();
        let second = upsert.upsert(vec![new], SourceTag::Manual).await.unwrap();
        assert_eq!(second, UpsertOutcome { inserted: 0, updated: 1, failed: 0, superseded: 0 });

        let stored = store.snapshot().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].program.description, "new");
        assert!(stored[0].updated_at >= stored[0].created_at);
    }

    #[tokio::test]
    async fn link_match_is_the_last_resort() {
        let mut existing = program("Summer Research", "Brown University");
        existing.fields = vec!["N/A".into()];
        existing.link = "https://example.org/p/7".into();
        let stored = StoredProgram::new(existing, Utc::now());
        let original_id = stored.id;
        let store = Arc::new(InMemoryProgramStore::with_records(vec![stored]));

        let mut renamed = program("Neuroscience Summer Program", "Brown Univ.");
        renamed.fields = vec!["N/A".into()];
        renamed.link = " https://example.org/p/7 ".into();
        let outcome = upserter(store.clone(), 100)
            .upsert(vec![renamed], SourceTag::PathwaysToScience)
            .await
            .unwrap();

        assert_eq!(outcome.updated, 1);
        let stored = store.snapshot().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, original_id);
        assert_eq!(stored[0].program.title, "Neuroscience Summer Program");
    }

    #[tokio::test]
    async fn institution_and_field_match_ignores_catch_all() {
        let store = Arc::new(InMemoryProgramStore::with_records(vec![
            StoredProgram::new(program("Biology REU Site", "Tufts"), Utc::now()),
        ]));
        let upsert = upserter(store.clone(), 100);

        let renamed = program("Summer Biology Research", "tufts");
        let outcome = upsert.upsert(vec![renamed], SourceTag::Nsf).await.unwrap();
        assert_eq!(outcome.updated, 1);

        let mut unclassified = program("Another Program", "Tufts");
        unclassified.fields = vec![CATCH_ALL.into()];
        let outcome = upsert.upsert(vec![unclassified], SourceTag::Nsf).await.unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn records_sharing_a_stored_match_are_counted_as_superseded() {
        let mut stored = program("Bio REU", "Brown University");
        stored.link = "https://example.org/p/1".into();
        let store = Arc::new(InMemoryProgramStore::with_records(vec![StoredProgram::new(
            stored,
            Utc::now(),
        )]));

        let mut bio = program("Bio REU", "Brown University");
        bio.link = "https://example.org/p/1".into();
        let mut neuro = program("Neuro REU", "Brown University");
        neuro.fields = vec!["N/A".into()];
        neuro.link = "https://example.org/p/1".into();
        let duplicate = program("bio reu", "BROWN UNIVERSITY");

        let outcome = upserter(store.clone(), 100)
            .upsert(vec![duplicate, bio, neuro], SourceTag::PathwaysToScience)
            .await
            .unwrap();

        assert_eq!(outcome, UpsertOutcome { inserted: 0, updated: 1, failed: 0, superseded: 2 });
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].program.title, "Neuro REU");
    }

    #[tokio::test]
    async fn failed_batches_fall_back_to_single_writes() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryProgramStore::new(),
        });
        let records = vec![
            program("A", "X"),
            program("poison", "Y"),
            program("C", "Z"),
        ];
        let outcome = upserter(store.clone(), 2)
            .upsert(records, SourceTag::Manual)
            .await
            .unwrap();

        assert_eq!(outcome, UpsertOutcome { inserted: 2, updated: 0, failed: 1, superseded: 0 });
        assert_eq!(store.inner.snapshot().await.len(), 2);
    }
}
