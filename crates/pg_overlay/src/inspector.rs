//! Source-catalog discovery of tables, columns and primary keys.
//!
//! Every setup run rediscovers the catalog; nothing is cached, so re-running
//! setup after the source schema changes picks up the new state.

use anyhow::{anyhow, Context, Result};
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;

use crate::pool::PgPool;

/// Tables owned by the connecting role outside the excluded schemas.
const TABLES_QUERY: &str = "SELECT schemaname::text AS schema_name, tablename::text AS table_name
FROM pg_catalog.pg_tables
WHERE tableowner = current_user AND NOT (schemaname = ANY($1::text[]))
ORDER BY schemaname, tablename;";

/// Live columns in attribute order. Identity columns report a synthetic
/// default; stored generated columns report none.
const COLUMNS_QUERY: &str = "SELECT a.attname::text AS column_name,
    pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
    NOT a.attnotnull AS is_nullable,
    CASE
        WHEN a.attidentity IN ('a', 'd') THEN 'GENERATED AS IDENTITY'
        WHEN a.attgenerated = 's' THEN NULL
        ELSE pg_catalog.pg_get_expr(d.adbin, d.adrelid)
    END AS column_default
FROM pg_catalog.pg_attribute a
JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum;";

/// Primary-key columns in index-key order.
const PRIMARY_KEY_QUERY: &str = "SELECT a.attname::text AS column_name,
    pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type
FROM pg_catalog.pg_index i
JOIN pg_catalog.pg_class c ON c.oid = i.indrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary
ORDER BY pg_catalog.array_position(i.indkey::int2[], a.attnum);";

/// `(schema, table)` pair as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema_name: String,
    pub table_name: String,
}

/// One source column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Type as rendered by `format_type`, including modifiers.
    pub data_type: String,
    pub nullable: bool,
    /// Raw default expression, if the column has one.
    pub default_expression: Option<String>,
}

impl ColumnDescriptor {
    pub fn has_default(&self) -> bool {
        self.default_expression.is_some()
    }
}

/// One primary-key column as reported by the index catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyColumn {
    pub column_name: String,
    pub data_type: String,
}

/// Everything the synthesizer needs to know about one source table.
///
/// Read-only-ness is derived from the key so the two can never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    schema_name: String,
    table_name: String,
    columns: Vec<ColumnDescriptor>,
    primary_key: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    /// Builds a descriptor, resolving key columns against `columns`. A key
    /// column carries the type reported by the key listing and is never null.
    pub fn new(
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
        primary_key: &[PrimaryKeyColumn],
    ) -> Result<Self> {
        let schema_name = schema_name.into();
        let table_name = table_name.into();
        if schema_name.is_empty() || table_name.is_empty() {
            return Err(anyhow!(
                "table descriptor has empty name ({schema_name:?}.{table_name:?})"
            ));
        }
        if columns.is_empty() {
            return Err(anyhow!("table {schema_name}.{table_name} has no columns"));
        }

        let primary_key = primary_key
            .iter()
            .map(|key| {
                columns
                    .iter()
                    .find(|column| column.name == key.column_name)
                    .map(|column| ColumnDescriptor {
                        data_type: key.data_type.clone(),
                        nullable: false,
                        ..column.clone()
                    })
                    .ok_or_else(|| {
                        anyhow!(
                            "primary key column {} missing from columns of {schema_name}.{table_name}",
                            key.column_name
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            schema_name,
            table_name,
            columns,
            primary_key,
        })
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[ColumnDescriptor] {
        &self.primary_key
    }

    /// Tables without a primary key get a passthrough view and no write path.
    pub fn read_only(&self) -> bool {
        self.primary_key.is_empty()
    }

    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
            read_only: self.read_only(),
        }
    }
}

/// Per-table result reported to callers after setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub schema_name: String,
    pub table_name: String,
    pub read_only: bool,
}

/// Catalog queries against the source database.
pub struct MetadataInspector<'a> {
    pool: &'a PgPool,
}

impl<'a> MetadataInspector<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Lists tables owned by the current role outside `excluded_schemas`.
    pub async fn list_tables(&self, excluded_schemas: &[String]) -> Result<Vec<TableRef>> {
        let rows = self
            .pool
            .query(TABLES_QUERY, &[&excluded_schemas])
            .await
            .context("list source tables")?;
        rows.iter()
            .map(|row| {
                Ok(TableRef {
                    schema_name: row.try_get("schema_name")?,
                    table_name: row.try_get("table_name")?,
                })
            })
            .collect()
    }

    pub async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let rows = self
            .pool
            .query(COLUMNS_QUERY, &[&schema, &table])
            .await
            .with_context(|| format!("list columns of {schema}.{table}"))?;
        rows.iter().map(decode_column).collect()
    }

    /// Key columns in key order; empty when the table has no primary key.
    pub async fn list_primary_key(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<PrimaryKeyColumn>> {
        let rows = self
            .pool
            .query(PRIMARY_KEY_QUERY, &[&schema, &table])
            .await
            .with_context(|| format!("list primary key of {schema}.{table}"))?;
        rows.iter()
            .map(|row| {
                Ok(PrimaryKeyColumn {
                    column_name: row.try_get("column_name")?,
                    data_type: row.try_get("data_type")?,
                })
            })
            .collect()
    }

    /// Lists tables, then describes all of them concurrently.
    pub async fn discover(&self, excluded_schemas: &[String]) -> Result<Vec<TableDescriptor>> {
        let tables = self.list_tables(excluded_schemas).await?;
        try_join_all(tables.into_iter().map(|table| self.describe(table))).await
    }

    async fn describe(&self, table: TableRef) -> Result<TableDescriptor> {
        let (columns, primary_key) = tokio::try_join!(
            self.list_columns(&table.schema_name, &table.table_name),
            self.list_primary_key(&table.schema_name, &table.table_name),
        )?;
        TableDescriptor::new(
            table.schema_name,
            table.table_name,
            columns,
            &primary_key,
        )
    }
}

fn decode_column(row: &Row) -> Result<ColumnDescriptor> {
    Ok(ColumnDescriptor {
        name: row.try_get("column_name")?,
        data_type: row.try_get("data_type")?,
        nullable: row.try_get("is_nullable")?,
        default_expression: row.try_get("column_default")?,
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn read_only_follows_primary_key_presence() {
        assert!(!simple_table().read_only());
        assert!(keyless_table().read_only());
        assert_eq!(
            keyless_table().manifest_entry(),
            ManifestEntry {
                schema_name: "public".to_string(),
                table_name: "log".to_string(),
                read_only: true,
            }
        );
    }

    #[test]
    fn primary_key_resolves_in_key_order() {
        let table = TableDescriptor::new(
            "s",
            "t",
            vec![column("a", "integer", false), column("b", "integer", false)],
            &[key("b", "integer"), key("a", "integer")],
        )
        .unwrap();
        let names = table
            .primary_key()
            .iter()
            .map(|column| column.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn key_columns_take_type_from_key_listing_and_are_not_null() {
        let table = TableDescriptor::new(
            "s",
            "t",
            vec![column("code", "character varying", true)],
            &[key("code", "character varying(8)")],
        )
        .unwrap();
        let code = &table.primary_key()[0];
        assert_eq!(code.data_type, "character varying(8)");
        assert!(!code.nullable);
        assert!(table.columns()[0].nullable);
    }

    #[test]
    fn key_column_missing_from_columns_is_rejected() {
        let err = TableDescriptor::new(
            "s",
            "t",
            vec![column("a", "integer", false)],
            &[key("ghost", "integer")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("ghost"), "{err}");
    }

    #[test]
    fn manifest_serializes_with_camel_case_keys() {
        let json = serde_json::to_string(&simple_table().manifest_entry()).unwrap();
        assert_eq!(json, r#"{"schemaName":"s","tableName":"t","readOnly":false}"#);
    }
}
