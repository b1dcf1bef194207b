//! The `overlay_reset()` procedure that discards every overlay-side change.
//!
//! Resetting only empties tombstone and shadow tables. Mirrors, views,
//! functions and rules stay in place, so the overlay immediately shows the
//! current source contents again.

use crate::error::SubstitutionError;
use crate::inspector::TableDescriptor;
use crate::namespace::NamespaceSet;
use crate::template::{
    sql_template, Ident, Literal, QualifiedName, RawSql, SqlTemplate, Statement,
};

/// Name of the reset procedure in the overlay database.
pub const RESET_FUNCTION_NAME: &str = "overlay_reset";

sql_template! {
    struct CreateResetFunction { function: Ident, body: Literal } =
        "CREATE OR REPLACE FUNCTION #{function}()
RETURNS void
AS #{body}
LANGUAGE plpgsql;";
}

sql_template! {
    struct ResetFunctionBody { statements: RawSql } = "BEGIN
#{statements}
END";
}

sql_template! {
    struct ClearTable { table: QualifiedName } = "DELETE FROM #{table};";
}

sql_template! {
    struct CallReset { function: Ident } = "SELECT #{function}();";
}

/// Builds the reset procedure covering every writable table in `tables`.
///
/// A body with no writable tables is a no-op, so the procedure exists and can
/// be called even when every source table is read-only.
pub fn reset_function(tables: &[TableDescriptor]) -> Result<Statement, SubstitutionError> {
    let mut statements = Vec::new();
    for table in tables.iter().filter(|table| !table.read_only()) {
        let namespaces = NamespaceSet::for_schema(table.schema_name());
        for schema in [&namespaces.tombstone_schema, &namespaces.shadow_schema] {
            statements.push(
                ClearTable {
                    table: QualifiedName::pair(schema, table.table_name()),
                }
                .render()?,
            );
        }
    }
    if statements.is_empty() {
        statements.push("NULL;".to_string());
    }

    let body = ResetFunctionBody {
        statements: RawSql::new(statements.join("\n")),
    }
    .render()?;
    Statement::render(
        "create reset procedure",
        &CreateResetFunction {
            function: Ident::new(RESET_FUNCTION_NAME),
            body: Literal(body),
        },
    )
}

/// `SELECT overlay_reset();`
pub fn call_reset() -> Result<Statement, SubstitutionError> {
    Statement::render(
        "call reset procedure",
        &CallReset {
            function: Ident::new(RESET_FUNCTION_NAME),
        },
    )
}
