use async_trait::async_trait;
use reu_core::{Deadline, NormalizedProgram, StoredProgram};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::store::{ProgramFilter, ProgramStore, StoreError};

const SELECT_PROGRAMS: &str = r#"
SELECT id, title, institution, location, fields, description, deadline, stipend,
       duration, requirements, link, source, status, created_at, updated_at
  FROM programs
 WHERE TRUE"#;

/// `programs` table access backed by a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgProgramStore {
    pool: PgPool,
}

impl PgProgramStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the workspace `migrations/` directory.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &ProgramFilter) {
    if let Some(source) = filter.source {
        builder.push(" AND source = ").push_bind(source.as_str());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    for (column, value) in [
        ("title", &filter.title),
        ("institution", &filter.institution),
        ("link", &filter.link),
    ] {
        if let Some(value) = value {
            builder
                .push(format!(" AND lower(btrim({column})) = lower(btrim("))
                .push_bind(value.clone())
                .push("))");
        }
    }
}

fn program_from_row(row: &PgRow) -> Result<StoredProgram, StoreError> {
    let id: uuid::Uuid = row.try_get("id")?;
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("status")?;
    let deadline: String = row.try_get("deadline")?;

    let corrupt = |message: String| StoreError::Corrupt { id, message };
    Ok(StoredProgram {
        id,
        program: NormalizedProgram {
            title: row.try_get("title")?,
            institution: row.try_get("institution")?,
            location: row.try_get("location")?,
            fields: row.try_get("fields")?,
            description: row.try_get("description")?,
            deadline: Deadline::from_stored(&deadline),
            stipend: row.try_get("stipend")?,
            duration: row.try_get("duration")?,
            requirements: row.try_get("requirements")?,
            link: row.try_get("link")?,
            source: source.parse().map_err(|e| corrupt(format!("{e}")))?,
            status: status.parse().map_err(corrupt)?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ProgramStore for PgProgramStore {
    async fn find_all(&self, filter: &ProgramFilter) -> Result<Vec<StoredProgram>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_PROGRAMS);
        push_filters(&mut builder, filter);
        builder.push(" ORDER BY created_at, id");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(program_from_row).collect()
    }

    async fn find_one(&self, filter: &ProgramFilter) -> Result<Option<StoredProgram>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_PROGRAMS);
        push_filters(&mut builder, filter);
        builder.push(" ORDER BY created_at, id LIMIT 1");

        let row = builder.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(program_from_row).transpose()
    }

    async fn insert_many(&self, records: &[StoredProgram]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO programs (id, title, institution, location, fields, description, deadline, \
             stipend, duration, requirements, link, source, status, created_at, updated_at) ",
        );
        builder.push_values(records, |mut row, record| {
            let p = &record.program;
            row.push_bind(record.id)
                .push_bind(p.title.clone())
                .push_bind(p.institution.clone())
                .push_bind(p.location.clone())
                .push_bind(p.fields.clone())
                .push_bind(p.description.clone())
                .push_bind(p.deadline.to_string())
                .push_bind(p.stipend.clone())
                .push_bind(p.duration.clone())
                .push_bind(p.requirements.clone())
                .push_bind(p.link.clone())
                .push_bind(p.source.as_str())
                .push_bind(p.status.as_str())
                .push_bind(record.created_at)
                .push_bind(record.updated_at);
        });

        let result = builder.build().execute(&self.pool).await?;
        debug!(rows = result.rows_affected(), "inserted programs");
        Ok(result.rows_affected() as usize)
    }

    async fn update_many(&self, records: &[StoredProgram]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let p = &record.program;
            let result = sqlx::query(
                r#"
                UPDATE programs
                   SET title = $2,
                       institution = $3,
                       location = $4,
                       fields = $5,
                       description = $6,
                       deadline = $7,
                       stipend = $8,
                       duration = $9,
                       requirements = $10,
                       link = $11,
                       source = $12,
                       status = $13,
                       updated_at = $14
                 WHERE id = $1
                "#,
            )
            .bind(record.id)
            .bind(&p.title)
            .bind(&p.institution)
            .bind(&p.location)
            .bind(&p.fields)
            .bind(&p.description)
            .bind(p.deadline.to_string())
            .bind(&p.stipend)
            .bind(&p.duration)
            .bind(&p.requirements)
            .bind(&p.link)
            .bind(p.source.as_str())
            .bind(p.status.as_str())
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(record.id));
            }
        }
        tx.commit().await?;
        Ok(records.len())
    }

    async fn count(&self, filter: &ProgramFilter) -> Result<usize, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM programs WHERE TRUE");
        push_filters(&mut builder, filter);
        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as usize)
    }
}
