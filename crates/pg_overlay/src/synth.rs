//! Per-table overlay DDL: tombstone and shadow storage, the merged view,
//! default-value functions and the write-redirection rules.
//!
//! Nothing here touches a database. Each method renders statements whose
//! execution, in the order the orchestrator submits them, realizes the
//! copy-on-write behavior inside the engine:
//!
//! ```text
//! visible keys = (shadow ∪ mirror) \ tombstone
//! visible row  = shadow row if present, else mirror row
//! ```

use crate::error::SubstitutionError;
use crate::inspector::{ColumnDescriptor, TableDescriptor};
use crate::namespace::NamespaceSet;
use crate::template::{
    quote_ident, sql_template, Ident, Literal, QualifiedName, RawSql, SqlTemplate, Statement,
};

/// Alias of the key set inside the merged view.
const IDS_ALIAS: &str = "_overlay_ids";
/// Alias of the mirror relation inside the merged view.
const MIRROR_ALIAS: &str = "_overlay_mirror";
/// Alias of the shadow relation inside the merged view.
const SHADOW_ALIAS: &str = "_overlay_shadow";
/// Row trigger on every tombstone table.
const SHADOW_CLEANUP_TRIGGER: &str = "overlay_clear_shadow";

sql_template! {
    struct CreateSchema { name: Ident } = "CREATE SCHEMA IF NOT EXISTS #{name};";
}

sql_template! {
    struct CreateTable { table: QualifiedName, columns: RawSql } =
        "CREATE TABLE IF NOT EXISTS #{table} (#{columns});";
}

sql_template! {
    struct ShadowCleanupBody { shadow: QualifiedName, shadow_match: RawSql } = "BEGIN
DELETE FROM #{shadow} WHERE #{shadow_match};
RETURN NULL;
END";
}

sql_template! {
    struct CreateShadowCleanupFunction { function: QualifiedName, body: Literal } =
        "CREATE OR REPLACE FUNCTION #{function}()
RETURNS trigger
AS #{body}
LANGUAGE plpgsql;";
}

sql_template! {
    struct CreateShadowCleanupTrigger {
        trigger: Ident,
        tombstone: QualifiedName,
        function: QualifiedName,
    } = "DROP TRIGGER IF EXISTS #{trigger} ON #{tombstone};
CREATE TRIGGER #{trigger}
AFTER INSERT ON #{tombstone}
FOR EACH ROW EXECUTE FUNCTION #{function}();";
}

sql_template! {
    struct CreatePassthroughView { view: QualifiedName, mirror: QualifiedName } =
        "CREATE OR REPLACE VIEW #{view} AS
SELECT *
FROM #{mirror};";
}

sql_template! {
    struct CreateMergedView {
        view: QualifiedName,
        select_list: RawSql,
        primary_key: RawSql,
        shadow: QualifiedName,
        mirror: QualifiedName,
        tombstone: QualifiedName,
        mirror_join: RawSql,
        shadow_join: RawSql,
    } = "CREATE OR REPLACE VIEW #{view} AS
SELECT #{select_list}
FROM (
    SELECT #{primary_key}
    FROM #{shadow}
UNION
    SELECT #{primary_key}
    FROM #{mirror}
EXCEPT
    SELECT #{primary_key}
    FROM #{tombstone}
) AS _overlay_ids
LEFT JOIN #{mirror} AS _overlay_mirror
    ON #{mirror_join}
LEFT JOIN #{shadow} AS _overlay_shadow
    ON #{shadow_join};";
}

sql_template! {
    struct DefaultFunctionBody {
        column: Ident,
        mirror: QualifiedName,
        shadow: QualifiedName,
    } = "BEGIN
RETURN 1 + COALESCE(GREATEST(
    (SELECT MAX(#{column}) FROM #{mirror}),
    (SELECT MAX(#{column}) FROM #{shadow})
), 0);
END";
}

sql_template! {
    struct CreateDefaultFunction {
        function: QualifiedName,
        return_type: RawSql,
        body: Literal,
    } = "CREATE OR REPLACE FUNCTION #{function}()
RETURNS #{return_type}
AS #{body}
LANGUAGE plpgsql;";
}

sql_template! {
    struct AlterViewDefault {
        view: QualifiedName,
        column: Ident,
        function: QualifiedName,
    } = "ALTER VIEW #{view}
ALTER COLUMN #{column}
SET DEFAULT #{function}();";
}

sql_template! {
    struct CreateDeleteRule {
        rule: Ident,
        view: QualifiedName,
        tombstone: QualifiedName,
        primary_key: RawSql,
        old_key: RawSql,
    } = "CREATE OR REPLACE RULE #{rule} AS ON DELETE TO #{view}
DO INSTEAD (
    INSERT INTO #{tombstone} (#{primary_key}) VALUES (#{old_key})
    ON CONFLICT DO NOTHING;
);";
}

sql_template! {
    struct CreateUpdateRule {
        rule: Ident,
        view: QualifiedName,
        shadow: QualifiedName,
        tombstone: QualifiedName,
        tombstone_match: RawSql,
        columns: RawSql,
        new_values: RawSql,
        primary_key: RawSql,
        assignments: RawSql,
        old_key: RawSql,
        new_key: RawSql,
    } = "CREATE OR REPLACE RULE #{rule} AS ON UPDATE TO #{view}
DO INSTEAD (
    DELETE FROM #{tombstone} WHERE #{tombstone_match};
    INSERT INTO #{shadow} (#{columns}) VALUES (#{new_values})
    ON CONFLICT (#{primary_key}) DO UPDATE SET #{assignments}
    RETURNING *;
    INSERT INTO #{tombstone} (#{primary_key})
    SELECT #{old_key} WHERE (#{old_key}) IS DISTINCT FROM (#{new_key})
    ON CONFLICT DO NOTHING;
);";
}

sql_template! {
    struct CreateInsertRule {
        rule: Ident,
        view: QualifiedName,
        tombstone: QualifiedName,
        shadow: QualifiedName,
        tombstone_match: RawSql,
        columns: RawSql,
        new_values: RawSql,
        primary_key: RawSql,
        assignments: RawSql,
    } = "CREATE OR REPLACE RULE #{rule} AS ON INSERT TO #{view}
DO INSTEAD (
    DELETE FROM #{tombstone} WHERE #{tombstone_match};
    INSERT INTO #{shadow} (#{columns}) VALUES (#{new_values})
    ON CONFLICT (#{primary_key}) DO UPDATE SET #{assignments}
    RETURNING *;
);";
}

/// `CREATE SCHEMA IF NOT EXISTS` for one namespace.
pub fn create_schema(name: &str) -> Result<Statement, SubstitutionError> {
    Statement::render(
        format!("create schema {name}"),
        &CreateSchema {
            name: Ident::new(name),
        },
    )
}

/// Function plus `ALTER VIEW ... SET DEFAULT` for one defaulted column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultBinding {
    pub column: String,
    pub function: Statement,
    pub bind: Statement,
}

/// Ordered per-table work for the overlay-objects phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOverlay {
    pub view: Statement,
    /// Independent of each other; each needs the view.
    pub defaults: Vec<DefaultBinding>,
    /// DELETE, UPDATE, INSERT rules in that order.
    pub rules: Vec<Statement>,
}

/// Renders the overlay objects of one table.
pub struct TableSynthesizer<'a> {
    table: &'a TableDescriptor,
    namespaces: NamespaceSet,
}

impl<'a> TableSynthesizer<'a> {
    pub fn new(table: &'a TableDescriptor) -> Self {
        Self {
            namespaces: NamespaceSet::for_schema(table.schema_name()),
            table,
        }
    }

    fn qualified(&self, schema: &str) -> QualifiedName {
        QualifiedName::pair(schema, self.table.table_name())
    }

    fn view_name(&self) -> QualifiedName {
        self.qualified(self.namespaces.overlay_schema())
    }

    fn mirror_name(&self) -> QualifiedName {
        self.qualified(&self.namespaces.mirror_schema)
    }

    fn tombstone_name(&self) -> QualifiedName {
        self.qualified(&self.namespaces.tombstone_schema)
    }

    fn shadow_name(&self) -> QualifiedName {
        self.qualified(&self.namespaces.shadow_schema)
    }

    fn rule_name(&self, rule_schema: &str) -> Ident {
        Ident::new(format!("{rule_schema}__{}", self.table.table_name()))
    }

    fn describe(&self, what: &str) -> String {
        format!(
            "{what} for {}.{}",
            self.table.schema_name(),
            self.table.table_name()
        )
    }

    fn render<T: SqlTemplate>(
        &self,
        what: &str,
        template: &T,
    ) -> Result<Statement, SubstitutionError> {
        Statement::render(self.describe(what), template)
    }

    /// Key-only table recording deleted keys; `None` for read-only tables.
    pub fn tombstone_table(&self) -> Result<Option<Statement>, SubstitutionError> {
        if self.table.read_only() {
            return Ok(None);
        }
        let definitions = self
            .table
            .primary_key()
            .iter()
            .map(|column| column_definition(column, true))
            .chain(std::iter::once(primary_key_constraint(self.table.primary_key())))
            .collect::<Result<Vec<_>, _>>()?;
        self.render(
            "create tombstone table",
            &CreateTable {
                table: self.tombstone_name(),
                columns: RawSql::new(definitions.join(", ")),
            },
        )
        .map(Some)
    }

    /// Full-row upsert target; `None` for read-only tables.
    pub fn shadow_table(&self) -> Result<Option<Statement>, SubstitutionError> {
        if self.table.read_only() {
            return Ok(None);
        }
        let definitions = self
            .table
            .columns()
            .iter()
            .map(|column| column_definition(column, !column.nullable))
            .chain(std::iter::once(primary_key_constraint(self.table.primary_key())))
            .collect::<Result<Vec<_>, _>>()?;
        self.render(
            "create shadow table",
            &CreateTable {
                table: self.shadow_name(),
                columns: RawSql::new(definitions.join(", ")),
            },
        )
        .map(Some)
    }

    /// Trigger function and trigger that drop the shadow row of every newly
    /// tombstoned key. Rule actions are re-planned against the merged view, which
    /// already hides a tombstoned row, so this cleanup cannot live in a rule.
    pub fn shadow_cleanup(&self) -> Result<Vec<Statement>, SubstitutionError> {
        if self.table.read_only() {
            return Ok(Vec::new());
        }
        let shadow = self.shadow_name();
        let function = self.tombstone_name();
        let body = ShadowCleanupBody {
            shadow_match: RawSql::new(key_equality(
                &shadow.quoted()?,
                "NEW",
                self.table.primary_key(),
            )?),
            shadow,
        }
        .render()?;
        Ok(vec![
            self.render(
                "create shadow cleanup function",
                &CreateShadowCleanupFunction {
                    function: function.clone(),
                    body: Literal(body),
                },
            )?,
            self.render(
                "create shadow cleanup trigger",
                &CreateShadowCleanupTrigger {
                    trigger: Ident::new(SHADOW_CLEANUP_TRIGGER),
                    tombstone: self.tombstone_name(),
                    function,
                },
            )?,
        ])
    }

    /// Shadow table followed by its cleanup trigger, in submission order.
    pub fn shadow_storage(&self) -> Result<Vec<Statement>, SubstitutionError> {
        let mut statements = self.shadow_table()?.into_iter().collect::<Vec<_>>();
        statements.extend(self.shadow_cleanup()?);
        Ok(statements)
    }

    /// The object readers query, named exactly like the source table.
    pub fn merged_view(&self) -> Result<Statement, SubstitutionError> {
        if self.table.read_only() {
            return self.render(
                "create read-only view",
                &CreatePassthroughView {
                    view: self.view_name(),
                    mirror: self.mirror_name(),
                },
            );
        }

        let key = self.table.primary_key();
        let shadow_alias = quote_ident(SHADOW_ALIAS)?;
        let mirror_alias = quote_ident(MIRROR_ALIAS)?;
        let ids_alias = quote_ident(IDS_ALIAS)?;
        let shadow_present = format!("{shadow_alias}.{} IS NOT NULL", quote_ident(&key[0].name)?);
        let select_list = self
            .table
            .columns()
            .iter()
            .map(|column| {
                let name = quote_ident(&column.name)?;
                Ok(format!(
                    "CASE WHEN {shadow_present} THEN {shadow_alias}.{name} ELSE {mirror_alias}.{name} END AS {name}"
                ))
            })
            .collect::<Result<Vec<_>, SubstitutionError>>()?
            .join(",\n    ");

        self.render(
            "create merged view",
            &CreateMergedView {
                view: self.view_name(),
                select_list: RawSql::new(select_list),
                primary_key: RawSql::new(column_list(key)?),
                shadow: self.shadow_name(),
                mirror: self.mirror_name(),
                tombstone: self.tombstone_name(),
                mirror_join: RawSql::new(key_equality(&mirror_alias, &ids_alias, key)?),
                shadow_join: RawSql::new(key_equality(&shadow_alias, &ids_alias, key)?),
            },
        )
    }

    /// One default function per defaulted column; empty for read-only tables.
    pub fn default_bindings(&self) -> Result<Vec<DefaultBinding>, SubstitutionError> {
        if self.table.read_only() {
            return Ok(Vec::new());
        }
        self.table
            .columns()
            .iter()
            .filter(|column| column.has_default())
            .map(|column| self.default_binding(column))
            .collect()
    }

    fn default_binding(&self, column: &ColumnDescriptor) -> Result<DefaultBinding, SubstitutionError> {
        let function = QualifiedName::pair(
            &self.namespaces.default_fn_schema,
            format!("{}__{}", self.table.table_name(), column.name),
        );
        let body = DefaultFunctionBody {
            column: Ident::new(&column.name),
            mirror: self.mirror_name(),
            shadow: self.shadow_name(),
        }
        .render()?;

        Ok(DefaultBinding {
            column: column.name.clone(),
            function: self.render(
                &format!("create default function for column {}", column.name),
                &CreateDefaultFunction {
                    function: function.clone(),
                    return_type: RawSql::new(&column.data_type),
                    body: Literal(body),
                },
            )?,
            bind: self.render(
                &format!("bind default for column {}", column.name),
                &AlterViewDefault {
                    view: self.view_name(),
                    column: Ident::new(&column.name),
                    function,
                },
            )?,
        })
    }

    /// Tombstones the deleted key; the tombstone trigger drops its shadow row.
    pub fn delete_rule(&self) -> Result<Option<Statement>, SubstitutionError> {
        if self.table.read_only() {
            return Ok(None);
        }
        let key = self.table.primary_key();
        self.render(
            "create delete rule",
            &CreateDeleteRule {
                rule: self.rule_name(&self.namespaces.delete_rule_schema),
                view: self.view_name(),
                tombstone: self.tombstone_name(),
                primary_key: RawSql::new(column_list(key)?),
                old_key: RawSql::new(prefixed_list("OLD", key)?),
            },
        )
        .map(Some)
    }

    /// Clears a tombstone on the new key, upserts the new row, then tombstones
    /// the old key when the key itself moved.
    pub fn update_rule(&self) -> Result<Option<Statement>, SubstitutionError> {
        if self.table.read_only() {
            return Ok(None);
        }
        let columns = self.table.columns();
        let key = self.table.primary_key();
        let tombstone = self.tombstone_name();
        self.render(
            "create update rule",
            &CreateUpdateRule {
                rule: self.rule_name(&self.namespaces.update_rule_schema),
                view: self.view_name(),
                shadow: self.shadow_name(),
                tombstone_match: RawSql::new(key_equality(&tombstone.quoted()?, "NEW", key)?),
                tombstone,
                columns: RawSql::new(column_list(columns)?),
                new_values: RawSql::new(prefixed_list("NEW", columns)?),
                primary_key: RawSql::new(column_list(key)?),
                assignments: RawSql::new(excluded_assignments(columns)?),
                old_key: RawSql::new(prefixed_list("OLD", key)?),
                new_key: RawSql::new(prefixed_list("NEW", key)?),
            },
        )
        .map(Some)
    }

    /// Clears a tombstone for the key, then upserts the row.
    pub fn insert_rule(&self) -> Result<Option<Statement>, SubstitutionError> {
        if self.table.read_only() {
            return Ok(None);
        }
        let columns = self.table.columns();
        let key = self.table.primary_key();
        let tombstone = self.tombstone_name();
        self.render(
            "create insert rule",
            &CreateInsertRule {
                rule: self.rule_name(&self.namespaces.insert_rule_schema),
                view: self.view_name(),
                tombstone_match: RawSql::new(key_equality(&tombstone.quoted()?, "NEW", key)?),
                tombstone,
                shadow: self.shadow_name(),
                columns: RawSql::new(column_list(columns)?),
                new_values: RawSql::new(prefixed_list("NEW", columns)?),
                primary_key: RawSql::new(column_list(key)?),
                assignments: RawSql::new(excluded_assignments(columns)?),
            },
        )
        .map(Some)
    }

    /// Everything the overlay-objects phase submits for this table.
    pub fn overlay(&self) -> Result<TableOverlay, SubstitutionError> {
        let rules = [self.delete_rule()?, self.update_rule()?, self.insert_rule()?]
            .into_iter()
            .flatten()
            .collect();
        Ok(TableOverlay {
            view: self.merged_view()?,
            defaults: self.default_bindings()?,
            rules,
        })
    }
}

fn column_definition(column: &ColumnDescriptor, not_null: bool) -> Result<String, SubstitutionError> {
    let mut definition = format!("{} {}", quote_ident(&column.name)?, column.data_type);
    if not_null {
        definition.push_str(" NOT NULL");
    }
    Ok(definition)
}

fn primary_key_constraint(key: &[ColumnDescriptor]) -> Result<String, SubstitutionError> {
    Ok(format!("PRIMARY KEY ({})", column_list(key)?))
}

/// `"a", "b"`
fn column_list(columns: &[ColumnDescriptor]) -> Result<String, SubstitutionError> {
    Ok(columns
        .iter()
        .map(|column| quote_ident(&column.name))
        .collect::<Result<Vec<_>, _>>()?
        .join(", "))
}

/// `OLD."a", OLD."b"`
fn prefixed_list(prefix: &str, columns: &[ColumnDescriptor]) -> Result<String, SubstitutionError> {
    Ok(columns
        .iter()
        .map(|column| Ok(format!("{prefix}.{}", quote_ident(&column.name)?)))
        .collect::<Result<Vec<_>, SubstitutionError>>()?
        .join(", "))
}

/// `left."a" = right."a" AND left."b" = right."b"`; both sides pre-quoted.
fn key_equality(
    left: &str,
    right: &str,
    key: &[ColumnDescriptor],
) -> Result<String, SubstitutionError> {
    Ok(key
        .iter()
        .map(|column| {
            let name = quote_ident(&column.name)?;
            Ok(format!("{left}.{name} = {right}.{name}"))
        })
        .collect::<Result<Vec<_>, SubstitutionError>>()?
        .join(" AND "))
}

/// `"a" = EXCLUDED."a", "b" = EXCLUDED."b"`
fn excluded_assignments(columns: &[ColumnDescriptor]) -> Result<String, SubstitutionError> {
    Ok(columns
        .iter()
        .map(|column| {
            let name = quote_ident(&column.name)?;
            Ok(format!("{name} = EXCLUDED.{name}"))
        })
        .collect::<Result<Vec<_>, SubstitutionError>>()?
        .join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::fixtures::{column, compound_table, key, keyless_table, simple_table};
    use crate::template::assert_slots_match;

    #[test]
    fn template_slots_match_declarations() {
        assert_slots_match::<CreateSchema>();
        assert_slots_match::<CreateTable>();
        assert_slots_match::<ShadowCleanupBody>();
        assert_slots_match::<CreateShadowCleanupFunction>();
        assert_slots_match::<CreateShadowCleanupTrigger>();
        assert_slots_match::<CreatePassthroughView>();
        assert_slots_match::<CreateMergedView>();
        assert_slots_match::<DefaultFunctionBody>();
        assert_slots_match::<CreateDefaultFunction>();
        assert_slots_match::<AlterViewDefault>();
        assert_slots_match::<CreateDeleteRule>();
        assert_slots_match::<CreateUpdateRule>();
        assert_slots_match::<CreateInsertRule>();
    }

    #[test]
    fn aliases_match_the_merged_view_template() {
        for alias in [IDS_ALIAS, MIRROR_ALIAS, SHADOW_ALIAS] {
            assert!(CreateMergedView::TEMPLATE.contains(alias), "{alias}");
        }
    }

    #[test]
    fn tombstone_table_holds_only_non_null_key_columns() {
        let sql = TableSynthesizer::new(&compound_table())
            .tombstone_table()
            .unwrap()
            .unwrap()
            .sql;
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"overlay_upper_deleted_public\".\"compound_primary_key\" \
(\"foo_id\" integer NOT NULL, \"bar_id\" integer NOT NULL, PRIMARY KEY (\"foo_id\", \"bar_id\"));"
        );
    }

    #[test]
    fn tombstone_key_type_comes_from_key_listing() {
        let table = TableDescriptor::new(
            "s",
            "codes",
            vec![column("code", "character varying", true)],
            &[key("code", "character varying(8)")],
        )
        .unwrap();
        let sql = TableSynthesizer::new(&table)
            .tombstone_table()
            .unwrap()
            .unwrap()
            .sql;
        assert!(
            sql.contains("(\"code\" character varying(8) NOT NULL, PRIMARY KEY (\"code\"))"),
            "{sql}"
        );
    }

    #[test]
    fn shadow_table_keeps_nullability_and_type_modifiers() {
        let sql = TableSynthesizer::new(&compound_table())
            .shadow_table()
            .unwrap()
            .unwrap()
            .sql;
        assert!(sql.starts_with(
            "CREATE TABLE IF NOT EXISTS \"overlay_upper_inserted_public\".\"compound_primary_key\""
        ));
        assert!(sql.contains("\"note\" character varying(20),"), "{sql}");
        assert!(sql.contains("\"foo_id\" integer NOT NULL"), "{sql}");
        assert!(sql.ends_with("PRIMARY KEY (\"foo_id\", \"bar_id\"));"), "{sql}");
    }

    #[test]
    fn merged_view_unions_shadow_and_mirror_minus_tombstones() {
        let sql = TableSynthesizer::new(&simple_table())
            .merged_view()
            .unwrap()
            .sql;
        assert_eq!(
            sql,
            r#"CREATE OR REPLACE VIEW "s"."t" AS
SELECT CASE WHEN "_overlay_shadow"."id" IS NOT NULL THEN "_overlay_shadow"."id" ELSE "_overlay_mirror"."id" END AS "id",
    CASE WHEN "_overlay_shadow"."id" IS NOT NULL THEN "_overlay_shadow"."v" ELSE "_overlay_mirror"."v" END AS "v"
FROM (
    SELECT "id"
    FROM "overlay_upper_inserted_s"."t"
UNION
    SELECT "id"
    FROM "overlay_lower_s"."t"
EXCEPT
    SELECT "id"
    FROM "overlay_upper_deleted_s"."t"
) AS _overlay_ids
LEFT JOIN "overlay_lower_s"."t" AS _overlay_mirror
    ON "_overlay_mirror"."id" = "_overlay_ids"."id"
LEFT JOIN "overlay_upper_inserted_s"."t" AS _overlay_shadow
    ON "_overlay_shadow"."id" = "_overlay_ids"."id";"#
        );
    }

    #[test]
    fn compound_key_joins_on_every_key_column() {
        let sql = TableSynthesizer::new(&compound_table())
            .merged_view()
            .unwrap()
            .sql;
        assert!(sql.contains(
            r#"ON "_overlay_mirror"."foo_id" = "_overlay_ids"."foo_id" AND "_overlay_mirror"."bar_id" = "_overlay_ids"."bar_id""#
        ));
        assert!(sql.contains(r#"SELECT "foo_id", "bar_id""#));
    }

    #[test]
    fn read_only_table_gets_passthrough_view_and_nothing_else() {
        let table = keyless_table();
        let synth = TableSynthesizer::new(&table);
        assert_eq!(
            synth.merged_view().unwrap().sql,
            "CREATE OR REPLACE VIEW \"public\".\"log\" AS\nSELECT *\nFROM \"overlay_lower_public\".\"log\";"
        );
        assert_eq!(synth.tombstone_table().unwrap(), None);
        assert_eq!(synth.shadow_table().unwrap(), None);
        let overlay = synth.overlay().unwrap();
        assert!(overlay.rules.is_empty());
        assert!(overlay.defaults.is_empty());
    }

    #[test]
    fn default_function_reads_mirror_and_shadow_maxima() {
        let table = simple_table();
        let bindings = TableSynthesizer::new(&table).default_bindings().unwrap();
        assert_eq!(bindings.len(), 1);
        let binding = &bindings[0];
        assert_eq!(binding.column, "id");
        assert_eq!(
            binding.function.sql,
            "CREATE OR REPLACE FUNCTION \"overlay_upper_default_function_s\".\"t__id\"()
RETURNS integer
AS 'BEGIN
RETURN 1 + COALESCE(GREATEST(
    (SELECT MAX(\"id\") FROM \"overlay_lower_s\".\"t\"),
    (SELECT MAX(\"id\") FROM \"overlay_upper_inserted_s\".\"t\")
), 0);
END'
LANGUAGE plpgsql;"
        );
        assert_eq!(
            binding.bind.sql,
            "ALTER VIEW \"s\".\"t\"\nALTER COLUMN \"id\"\nSET DEFAULT \"overlay_upper_default_function_s\".\"t__id\"();"
        );
    }

    #[test]
    fn columns_without_defaults_get_no_function() {
        let bindings = TableSynthesizer::new(&compound_table())
            .default_bindings()
            .unwrap();
        assert!(bindings.is_empty());
    }

    #[test]
    fn delete_rule_only_tombstones_the_old_key() {
        let sql = TableSynthesizer::new(&simple_table())
            .delete_rule()
            .unwrap()
            .unwrap()
            .sql;
        assert_eq!(
            sql,
            r#"CREATE OR REPLACE RULE "overlay_upper_delete_rule_s__t" AS ON DELETE TO "s"."t"
DO INSTEAD (
    INSERT INTO "overlay_upper_deleted_s"."t" ("id") VALUES (OLD."id")
    ON CONFLICT DO NOTHING;
);"#
        );
    }

    #[test]
    fn update_rule_clears_new_key_then_replaces_row_and_tombstones_old_key() {
        let sql = TableSynthesizer::new(&simple_table())
            .update_rule()
            .unwrap()
            .unwrap()
            .sql;
        assert_eq!(
            sql,
            r#"CREATE OR REPLACE RULE "overlay_upper_update_rule_s__t" AS ON UPDATE TO "s"."t"
DO INSTEAD (
    DELETE FROM "overlay_upper_deleted_s"."t" WHERE "overlay_upper_deleted_s"."t"."id" = NEW."id";
    INSERT INTO "overlay_upper_inserted_s"."t" ("id", "v") VALUES (NEW."id", NEW."v")
    ON CONFLICT ("id") DO UPDATE SET "id" = EXCLUDED."id", "v" = EXCLUDED."v"
    RETURNING *;
    INSERT INTO "overlay_upper_deleted_s"."t" ("id")
    SELECT OLD."id" WHERE (OLD."id") IS DISTINCT FROM (NEW."id")
    ON CONFLICT DO NOTHING;
);"#
        );
    }

    #[test]
    fn compound_update_rule_matches_every_key_column() {
        let sql = TableSynthesizer::new(&compound_table())
            .update_rule()
            .unwrap()
            .unwrap()
            .sql;
        assert!(sql.contains(
            r#"WHERE "overlay_upper_deleted_public"."compound_primary_key"."foo_id" = NEW."foo_id" AND "overlay_upper_deleted_public"."compound_primary_key"."bar_id" = NEW."bar_id";"#
        ));
        assert!(sql.contains(
            r#"WHERE (OLD."foo_id", OLD."bar_id") IS DISTINCT FROM (NEW."foo_id", NEW."bar_id")"#
        ));
    }

    #[test]
    fn shadow_cleanup_trigger_drops_shadow_row_of_new_tombstone() {
        let statements = TableSynthesizer::new(&simple_table())
            .shadow_cleanup()
            .unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].sql,
            "CREATE OR REPLACE FUNCTION \"overlay_upper_deleted_s\".\"t\"()
RETURNS trigger
AS 'BEGIN
DELETE FROM \"overlay_upper_inserted_s\".\"t\" WHERE \"overlay_upper_inserted_s\".\"t\".\"id\" = NEW.\"id\";
RETURN NULL;
END'
LANGUAGE plpgsql;"
        );
        assert_eq!(
            statements[1].sql,
            "DROP TRIGGER IF EXISTS \"overlay_clear_shadow\" ON \"overlay_upper_deleted_s\".\"t\";
CREATE TRIGGER \"overlay_clear_shadow\"
AFTER INSERT ON \"overlay_upper_deleted_s\".\"t\"
FOR EACH ROW EXECUTE FUNCTION \"overlay_upper_deleted_s\".\"t\"();"
        );
    }

    #[test]
    fn shadow_storage_creates_table_before_its_trigger() {
        let table = compound_table();
        let synth = TableSynthesizer::new(&table);
        let storage = synth.shadow_storage().unwrap();
        let descriptions = storage
            .iter()
            .map(|statement| statement.description.as_str())
            .collect::<Vec<_>>();
        assert_eq!(storage.len(), 3);
        assert_eq!(storage[0], synth.shadow_table().unwrap().unwrap());
        assert!(descriptions[1].starts_with("create shadow cleanup function"));
        assert!(descriptions[2].starts_with("create shadow cleanup trigger"));
        assert!(storage[1].sql.contains(
            r#"NEW."foo_id" AND "overlay_upper_inserted_public"."compound_primary_key"."bar_id" = NEW."bar_id""#
        ));
    }

    #[test]
    fn read_only_table_gets_no_shadow_storage() {
        assert!(TableSynthesizer::new(&keyless_table())
            .shadow_storage()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn insert_rule_clears_tombstone_before_upserting() {
        let sql = TableSynthesizer::new(&compound_table())
            .insert_rule()
            .unwrap()
            .unwrap()
            .sql;
        let cleanup = sql.find("DELETE FROM \"overlay_upper_deleted_public\"").unwrap();
        let upsert = sql.find("INSERT INTO \"overlay_upper_inserted_public\"").unwrap();
        assert!(cleanup < upsert);
        assert!(sql.contains(
            r#"WHERE "overlay_upper_deleted_public"."compound_primary_key"."foo_id" = NEW."foo_id" AND "overlay_upper_deleted_public"."compound_primary_key"."bar_id" = NEW."bar_id";"#
        ));
        assert!(sql.contains(r#"ON CONFLICT ("foo_id", "bar_id") DO UPDATE SET"#));
        assert!(sql.contains("RETURNING *;"));
    }

    #[test]
    fn rules_are_emitted_delete_update_insert() {
        let overlay = TableSynthesizer::new(&simple_table()).overlay().unwrap();
        let kinds = overlay
            .rules
            .iter()
            .map(|rule| rule.description.split_whitespace().nth(1).unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(kinds, ["delete", "update", "insert"]);
    }

    #[test]
    fn unusual_identifiers_are_quoted_everywhere() {
        let table = TableDescriptor::new(
            "Straße",
            "My \"Quoted\" Table",
            vec![
                column("Ключ", "bigint", false),
                column("select", "text", true),
            ],
            &[key("Ключ", "bigint")],
        )
        .unwrap();
        let overlay = TableSynthesizer::new(&table).overlay().unwrap();
        assert!(overlay
            .view
            .sql
            .starts_with(r#"CREATE OR REPLACE VIEW "Straße"."My ""Quoted"" Table" AS"#));
        assert!(overlay.view.sql.contains(r#""_overlay_mirror"."select" END AS "select""#));
        let insert = &overlay.rules[2].sql;
        assert!(insert.contains(r#"NEW."Ключ", NEW."select""#), "{insert}");
        assert!(insert.contains(r#""overlay_upper_insert_rule_Straße__My ""Quoted"" Table""#));
    }

    #[test]
    fn schema_statement_is_idempotent() {
        assert_eq!(
            create_schema("overlay_lower_public").unwrap().sql,
            "CREATE SCHEMA IF NOT EXISTS \"overlay_lower_public\";"
        );
    }
}
