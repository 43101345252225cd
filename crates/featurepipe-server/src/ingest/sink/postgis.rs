//! PostgreSQL/PostGIS sink

use super::sql;
use super::{FeatureSink, LoadOutcome, TableTarget};
use crate::ingest::attachments::AttachmentRecord;
use crate::ingest::coercion::TypedValue;
use crate::ingest::error::LoadError;
use crate::ingest::transformer::TransformedRow;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, info, instrument, warn};

/// SQLSTATE raised when TRUNCATE is blocked by a foreign key
const FEATURE_NOT_SUPPORTED: &str = "0A000";

#[derive(Clone)]
pub struct PostgisSink {
    pool: PgPool,
}

impl PostgisSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn execute_all(&self, statements: &[String]) -> Result<(), LoadError> {
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            debug!(%statement, "Executing DDL");
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn truncate_table(&self, schema: &str, table: &str) -> Result<(), LoadError> {
        match sqlx::query(&sql::truncate(schema, table))
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(FEATURE_NOT_SUPPORTED) => {
                warn!("Cannot truncate {}.{} ({}), deleting rows instead", schema, table, e.message());
                sqlx::query(&sql::delete_all(schema, table))
                    .execute(&self.pool)
                    .await?;
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_rows(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        target: &TableTarget,
        rows: &[TransformedRow],
    ) -> Result<(), LoadError> {
        let prefix = sql::insert_prefix(target);
        let suffix = sql::upsert_suffix(target);
        let geometry = target.geometry.as_ref().map(sql::geometry_expr);

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(prefix);

        query_builder.push_values(rows, |mut b, row| {
            b.push_bind(row.feature_id);

            for (value, column) in row.values.iter().zip(&target.columns) {
                match value {
                    TypedValue::Null => b.push_bind(None::<String>),
                    TypedValue::SmallInt(v) => b.push_bind(*v),
                    TypedValue::Integer(v) => b.push_bind(*v),
                    TypedValue::BigInt(v) => b.push_bind(*v),
                    TypedValue::Real(v) => b.push_bind(*v),
                    TypedValue::Double(v) => b.push_bind(*v),
                    TypedValue::Text(v) => b.push_bind(v),
                    TypedValue::Timestamp(v) => b.push_bind(*v),
                    TypedValue::Date(v) => b.push_bind(*v),
                    TypedValue::Time(v) => b.push_bind(*v),
                    TypedValue::Uuid(v) => b.push_bind(*v),
                };
                b.push_unseparated(format!("::{}", column.pg_type));
            }

            if let Some((open, close)) = &geometry {
                b.push(open);
                b.push_bind_unseparated(row.geometry.as_ref().map(|g| g.to_geojson().to_string()));
                b.push_unseparated(close);
            }
        });

        query_builder.push(suffix);
        query_builder.build().execute(&mut **tx).await?;

        Ok(())
    }

    async fn insert_attachments(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        schema: &str,
        table: &str,
        attachments: &[&AttachmentRecord],
    ) -> Result<(), LoadError> {
        let mut query_builder: QueryBuilder<Postgres> =
            QueryBuilder::new(sql::attachment_insert_prefix(schema, table));

        query_builder.push_values(attachments, |mut b, a| {
            b.push_bind(a.attachment_id)
                .push_bind(a.feature_id)
                .push_bind(&a.global_id)
                .push_bind(&a.info.name)
                .push_bind(a.info.size)
                .push_bind(&a.info.content_type)
                .push_bind(&a.info.keywords)
                .push_bind(&a.info.exif_info)
                .push_bind(&a.info.url)
                .push_bind(&a.storage_uri);
        });

        query_builder.push(sql::attachment_upsert_suffix());
        query_builder.build().execute(&mut **tx).await?;

        Ok(())
    }
}

#[async_trait]
impl FeatureSink for PostgisSink {
    #[instrument(skip_all, fields(table = %target.table))]
    async fn ensure_table(&self, target: &TableTarget) -> Result<(), LoadError> {
        if target.geometry.is_some() {
            sqlx::query(sql::CREATE_POSTGIS).execute(&self.pool).await?;
        }

        let mut statements = vec![sql::create_schema(target), sql::create_table(target)];
        statements.extend(sql::alter_table(target));
        if let Some(ddl) = sql::create_attachments_table(target) {
            statements.extend(ddl);
        }

        self.execute_all(&statements).await?;

        info!(
            "Target table {}.{} ready ({} columns, geometry: {})",
            target.schema,
            target.table,
            target.columns.len(),
            target.geometry.is_some()
        );
        Ok(())
    }

    #[instrument(skip_all, fields(table = %target.table))]
    async fn truncate(&self, target: &TableTarget) -> Result<(), LoadError> {
        self.truncate_table(&target.schema, &target.table).await?;
        if let Some(attachments) = &target.attachments_table {
            self.truncate_table(&target.schema, attachments).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(table = %target.table, rows = rows.len()))]
    async fn upsert_batch(
        &self,
        target: &TableTarget,
        rows: &[TransformedRow],
    ) -> Result<LoadOutcome, LoadError> {
        if let Some(row) = rows.iter().find(|r| r.values.len() != target.columns.len()) {
            return Err(LoadError::Rejected(format!(
                "feature {} has {} values for {} columns",
                row.feature_id,
                row.values.len(),
                target.columns.len()
            )));
        }
        if rows.is_empty() {
            return Ok(LoadOutcome::default());
        }

        let chunk_size = sql::rows_per_statement(sql::params_per_row(target));
        let attachments: Vec<&AttachmentRecord> = match &target.attachments_table {
            Some(_) => rows.iter().flat_map(|r| r.attachments.iter()).collect(),
            None => Vec::new(),
        };

        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(chunk_size) {
            self.insert_rows(&mut tx, target, chunk).await?;
        }

        if let Some(table) = &target.attachments_table {
            let attachment_chunk =
                sql::rows_per_statement(sql::ATTACHMENT_COLUMNS.len());
            for chunk in attachments.chunks(attachment_chunk) {
                self.insert_attachments(&mut tx, &target.schema, table, chunk)
                    .await?;
            }
        }

        tx.commit().await?;

        debug!(rows = rows.len(), attachments = attachments.len(), "Batch committed");

        Ok(LoadOutcome {
            rows: rows.len() as u64,
            attachments: attachments.len() as u64,
        })
    }
}
