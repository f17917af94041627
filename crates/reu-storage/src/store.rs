use async_trait::async_trait;
use reu_core::{match_key, ProgramStatus, SourceTag, StoredProgram};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("program {0} not found")]
    NotFound(Uuid),
    #[error("program {0} already exists")]
    Duplicate(Uuid),
    #[error("corrupt row {id}: {message}")]
    Corrupt { id: Uuid, message: String },
}

/// Equality filter over stored programs. Text comparisons ignore case and surrounding whitespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramFilter {
    pub source: Option<SourceTag>,
    pub title: Option<String>,
    pub institution: Option<String>,
    pub link: Option<String>,
    pub status: Option<ProgramStatus>,
}

impl ProgramFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn source(source: SourceTag) -> Self {
        Self {
            source: Some(source),
            ..Default::default()
        }
    }

    pub fn title_institution(title: &str, institution: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            institution: Some(institution.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &StoredProgram) -> bool {
        let p = &record.program;
        let text_eq = |want: &Option<String>, have: &str| {
            want.as_deref().map_or(true, |w| match_key(w) == match_key(have))
        };
        self.source.map_or(true, |s| s == p.source)
            && self.status.map_or(true, |s| s == p.status)
            && text_eq(&self.title, &p.title)
            && text_eq(&self.institution, &p.institution)
            && text_eq(&self.link, &p.link)
    }
}

/// Persistence seam for program records.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    async fn find_all(&self, filter: &ProgramFilter) -> Result<Vec<StoredProgram>, StoreError>;

    async fn find_one(&self, filter: &ProgramFilter) -> Result<Option<StoredProgram>, StoreError> {
        Ok(self.find_all(filter).await?.into_iter().next())
    }

    /// Insert new records; returns how many were written.
    async fn insert_many(&self, records: &[StoredProgram]) -> Result<usize, StoreError>;

    /// Replace payload and `updated_at` of existing records by id. `created_at` is left untouched.
    async fn update_many(&self, records: &[StoredProgram]) -> Result<usize, StoreError>;

    async fn count(&self, filter: &ProgramFilter) -> Result<usize, StoreError> {
        Ok(self.find_all(filter).await?.len())
    }
}

/// Process-local store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryProgramStore {
    records: RwLock<Vec<StoredProgram>>,
}

impl InMemoryProgramStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<StoredProgram>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub async fn snapshot(&self) -> Vec<StoredProgram> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl ProgramStore for InMemoryProgramStore {
    async fn find_all(&self, filter: &ProgramFilter) -> Result<Vec<StoredProgram>, StoreError> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| filter.matches(r)).cloned().collect())
    }

    async fn insert_many(&self, records: &[StoredProgram]) -> Result<usize, StoreError> {
        let mut stored = self.records.write().await;
        for (idx, record) in records.iter().enumerate() {
            let clash = stored.iter().any(|r| r.id == record.id)
                || records[..idx].iter().any(|r| r.id == record.id);
            if clash {
                return Err(StoreError::Duplicate(record.id));
            }
        }
        stored.extend_from_slice(records);
        Ok(records.len())
    }

    async fn update_many(&self, records: &[StoredProgram]) -> Result<usize, StoreError> {
        let mut stored = self.records.write().await;
        if let Some(missing) = records.iter().find(|u| stored.iter().all(|r| r.id != u.id)) {
            return Err(StoreError::NotFound(missing.id));
        }
        for update in records {
            if let Some(existing) = stored.iter_mut().find(|r| r.id == update.id) {
                existing.overwrite(update.program.clone(), update.updated_at);
            }
        }
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use reu_core::{Deadline, NormalizedProgram};

    fn program(title: &str, institution: &str) -> NormalizedProgram {
        NormalizedProgram {
            title: title.into(),
            institution: institution.into(),
            location: "Medford, MA".into(),
            fields: vec!["Biology".into()],
            description: String::new(),
            deadline: Deadline::Unknown,
            stipend: String::new(),
            duration: "10 weeks".into(),
            requirements: String::new(),
            link: "https://example.org/reu".into(),
            source: SourceTag::Manual,
            status: ProgramStatus::Active,
        }
    }

    #[tokio::test]
    async fn filter_is_case_insensitive() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let store = InMemoryProgramStore::with_records(vec![StoredProgram::new(
            program("Bio REU", "Tufts"),
            t0,
        )]);

        let hit = store
            .find_one(&ProgramFilter::title_institution(" bio reu", "TUFTS "))
            .await
            .unwrap();
        assert!(hit.is_some());
        assert_eq!(store.count(&ProgramFilter::source(SourceTag::Nsf)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_keeps_created_at() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let original = StoredProgram::new(program("Bio REU", "Tufts"), t0);
        let store = InMemoryProgramStore::new();
        store.insert_many(&[original.clone()]).await.unwrap();

        let mut changed = original.clone();
        changed.program.location = "Boston, MA".into();
        changed.created_at = t1;
        changed.updated_at = t1;
        store.update_many(&[changed]).await.unwrap();

        let after = store.snapshot().await;
        assert_eq!(after[0].program.location, "Boston, MA");
        assert_eq!(after[0].created_at, t0);
        assert_eq!(after[0].updated_at, t1);
    }

    #[tokio::test]
    async fn unknown_ids_and_duplicates_are_rejected() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let record = StoredProgram::new(program("Bio REU", "Tufts"), t0);
        let store = InMemoryProgramStore::new();

        assert!(matches!(
            store.update_many(&[record.clone()]).await,
            Err(StoreError::NotFound(_))
        ));
        store.insert_many(&[record.clone()]).await.unwrap();
        assert!(matches!(
            store.insert_many(&[record]).await,
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.count(&ProgramFilter::all()).await.unwrap(), 1);
    }
}
