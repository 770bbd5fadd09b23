//! Relational-table sink: a `T_stg_<job_id>` staging table promoted to its
//! final table by a single transaction (§4.8).
//!
//! Overwrite mode drops the final table and renames staging onto it.
//! Append mode inserts staging's rows into the final table, then drops
//! staging — both inside one transaction, so a crash between the two steps
//! never leaves the final table half-updated.

use crate::{OutputSink, Result, SinkError};
use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Schema};
use arrow::record_batch::RecordBatch;
use casparian_protocol::SinkMode;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `T_stg_<16-hex>`, content-addressed on (job_id, table) so two jobs
/// writing the same table never collide (§4.8).
fn stage_table_name(job_id: &str, table: &str) -> String {
    let seed = format!("{job_id}:{table}");
    format!("T_stg_{}", &blake3::hash(seed.as_bytes()).to_hex()[..16])
}

fn arrow_to_sqlite_type(dt: &DataType) -> &'static str {
    match dt {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => "INTEGER",
        DataType::Float16 | DataType::Float32 | DataType::Float64 => "REAL",
        DataType::Binary | DataType::LargeBinary => "BLOB",
        _ => "TEXT",
    }
}

/// Writes batches to a staging table, then promotes it to `table` on commit.
pub struct RelationalSink {
    pool: SqlitePool,
    table: String,
    job_id: String,
    mode: SinkMode,
    staging_table: String,
    rows_written: u64,
    committed: bool,
}

impl RelationalSink {
    pub fn new(pool: SqlitePool, table: impl Into<String>, job_id: impl Into<String>, mode: SinkMode) -> Self {
        let table = table.into();
        let job_id = job_id.into();
        let staging_table = stage_table_name(&job_id, &table);
        Self {
            pool,
            table,
            job_id,
            mode,
            staging_table,
            rows_written: 0,
            committed: false,
        }
    }

    async fn destroy_stale_staging(&self) -> Result<()> {
        let drop_sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&self.staging_table));
        sqlx::query(&drop_sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn create_staging_table(&self, schema: &Schema) -> Result<()> {
        let columns: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| format!("{} {}", quote_ident(f.name()), arrow_to_sqlite_type(f.data_type())))
            .collect();
        let create_sql = format!(
            "CREATE TABLE {} ({})",
            quote_ident(&self.staging_table),
            columns.join(", ")
        );
        sqlx::query(&create_sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_batch(&mut self, batch: &RecordBatch) -> Result<u64> {
        let schema = batch.schema();
        let placeholders: Vec<String> = (0..schema.fields().len()).map(|_| "?".to_string()).collect();
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.staging_table),
            schema.fields().iter().map(|f| quote_ident(f.name())).collect::<Vec<_>>().join(", "),
            placeholders.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        for row in 0..batch.num_rows() {
            let mut query = sqlx::query(&insert_sql);
            for col in batch.columns() {
                query = bind_cell(query, col, row);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        let rows = batch.num_rows() as u64;
        self.rows_written += rows;
        Ok(rows)
    }

    async fn commit_overwrite(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&self.table)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&self.staging_table),
            quote_ident(&self.table)
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_append(&self) -> Result<()> {
        let columns_exist: i64 = sqlx::query(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(self.table.as_str())
        .fetch_one(&self.pool)
        .await?
        .get(0);

        let mut tx = self.pool.begin().await?;
        if columns_exist == 0 {
            sqlx::query(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(&self.staging_table),
                quote_ident(&self.table)
            ))
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(&format!(
                "INSERT INTO {} SELECT * FROM {}",
                quote_ident(&self.table),
                quote_ident(&self.staging_table)
            ))
            .execute(&mut *tx)
            .await?;
            sqlx::query(&format!("DROP TABLE {}", quote_ident(&self.staging_table)))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn bind_cell<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    column: &std::sync::Arc<dyn Array>,
    row: usize,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if column.is_null(row) {
        return query.bind(None::<String>);
    }
    match column.data_type() {
        DataType::Int64 => query.bind(column.as_primitive::<arrow::datatypes::Int64Type>().value(row)),
        DataType::Int32 => query.bind(column.as_primitive::<arrow::datatypes::Int32Type>().value(row) as i64),
        DataType::Float64 => query.bind(column.as_primitive::<arrow::datatypes::Float64Type>().value(row)),
        DataType::Float32 => query.bind(column.as_primitive::<arrow::datatypes::Float32Type>().value(row) as f64),
        DataType::Boolean => query.bind(column.as_boolean().value(row) as i64),
        DataType::Utf8 => query.bind(column.as_string::<i32>().value(row).to_string()),
        _ => query.bind(arrow::util::display::array_value_to_string(column, row).unwrap_or_default()),
    }
}

#[async_trait::async_trait]
impl OutputSink for RelationalSink {
    async fn init(&mut self, schema: &Schema) -> Result<()> {
        self.destroy_stale_staging().await?;
        self.create_staging_table(schema).await?;
        debug!(table = %self.staging_table, "initialized relational staging table");
        Ok(())
    }

    async fn write_batch(&mut self, batch: &RecordBatch) -> Result<u64> {
        self.insert_batch(batch).await
    }

    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        let result = match self.mode {
            SinkMode::Overwrite => self.commit_overwrite().await,
            SinkMode::Append => self.commit_append().await,
        };
        if result.is_ok() {
            self.committed = true;
            info!(table = %self.table, rows = self.rows_written, "committed relational sink");
        } else {
            warn!(table = %self.table, "relational sink commit failed; staging left in place");
        }
        result
    }
}
