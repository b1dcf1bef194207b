//! Foreign-data-wrapper plumbing: the extension, the server pointing at the
//! source database, the user mapping, and per-schema mirror import.

use crate::config::ConnectionOptions;
use crate::error::SubstitutionError;
use crate::template::{
    quote_ident, sql_template, Ident, Literal, RawSql, SecretLiteral, Statement,
};

/// Foreign server name registered in the overlay database.
pub const FOREIGN_SERVER_NAME: &str = "overlay_lower";

/// Appended to every import exclusion list so it is never empty.
pub const IMPORT_SENTINEL_TABLE: &str = "overlay_lower_import_sentinel_never_a_table";

/// Overlay relations already present in a mirror schema.
pub const EXISTING_MIRROR_TABLES_QUERY: &str = "SELECT c.relname::text AS table_name
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relkind IN ('r', 'v', 'm', 'f', 'p')
ORDER BY c.relname;";

sql_template! {
    struct CreateExtension { extension: Ident } =
        "CREATE EXTENSION IF NOT EXISTS #{extension};";
}

sql_template! {
    struct CreateForeignServer {
        server: Ident,
        wrapper: Ident,
        host: Literal,
        port: Literal,
        dbname: Literal,
    } = "CREATE SERVER IF NOT EXISTS #{server}
FOREIGN DATA WRAPPER #{wrapper}
OPTIONS (host #{host}, port #{port}, dbname #{dbname}, updatable 'false');";
}

sql_template! {
    struct AlterForeignServer {
        server: Ident,
        host: Literal,
        port: Literal,
        dbname: Literal,
    } = "ALTER SERVER #{server}
OPTIONS (SET host #{host}, SET port #{port}, SET dbname #{dbname});";
}

sql_template! {
    struct CreateUserMapping {
        local_user: Ident,
        server: Ident,
        remote_user: Literal,
        password: SecretLiteral,
    } = "CREATE USER MAPPING IF NOT EXISTS FOR #{local_user}
SERVER #{server}
OPTIONS (user #{remote_user}, password #{password});";
}

sql_template! {
    struct AlterUserMapping {
        local_user: Ident,
        server: Ident,
        remote_user: Literal,
        password: SecretLiteral,
    } = "ALTER USER MAPPING FOR #{local_user}
SERVER #{server}
OPTIONS (SET user #{remote_user}, SET password #{password});";
}

sql_template! {
    struct ImportForeignSchema {
        remote_schema: Ident,
        except: RawSql,
        server: Ident,
        local_schema: Ident,
    } = "IMPORT FOREIGN SCHEMA #{remote_schema}
EXCEPT (#{except})
FROM SERVER #{server} INTO #{local_schema};";
}

/// `CREATE EXTENSION IF NOT EXISTS postgres_fdw`.
pub fn enable_extension() -> Result<Statement, SubstitutionError> {
    Statement::render(
        "enable postgres_fdw extension",
        &CreateExtension {
            extension: Ident::new("postgres_fdw"),
        },
    )
}

/// Creates the foreign server, then re-applies its options so a re-run with a
/// changed source address converges.
pub fn register_source(source: &ConnectionOptions) -> Result<Vec<Statement>, SubstitutionError> {
    let host = Literal(source.host.clone());
    let port = Literal(source.port.to_string());
    let dbname = Literal(source.database.clone());
    Ok(vec![
        Statement::render(
            "create foreign server for source database",
            &CreateForeignServer {
                server: Ident::new(FOREIGN_SERVER_NAME),
                wrapper: Ident::new("postgres_fdw"),
                host: host.clone(),
                port: port.clone(),
                dbname: dbname.clone(),
            },
        )?,
        Statement::render(
            "update foreign server options",
            &AlterForeignServer {
                server: Ident::new(FOREIGN_SERVER_NAME),
                host,
                port,
                dbname,
            },
        )?,
    ])
}

/// Maps the overlay role onto the source role's credentials.
pub fn register_credentials(
    overlay_user: &str,
    source: &ConnectionOptions,
) -> Result<Vec<Statement>, SubstitutionError> {
    let remote_user = Literal(source.user.clone());
    let password = SecretLiteral::new(source.password.clone());
    Ok(vec![
        Statement::render(
            "create user mapping for overlay role",
            &CreateUserMapping {
                local_user: Ident::new(overlay_user),
                server: Ident::new(FOREIGN_SERVER_NAME),
                remote_user: remote_user.clone(),
                password: password.clone(),
            },
        )?
        .sensitive(),
        Statement::render(
            "update user mapping credentials",
            &AlterUserMapping {
                local_user: Ident::new(overlay_user),
                server: Ident::new(FOREIGN_SERVER_NAME),
                remote_user,
                password,
            },
        )?
        .sensitive(),
    ])
}

/// Imports every source table of `source_schema` not already mirrored.
pub fn import_mirror(
    source_schema: &str,
    mirror_schema: &str,
    existing_tables: &[String],
) -> Result<Statement, SubstitutionError> {
    let except = existing_tables
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(IMPORT_SENTINEL_TABLE))
        .map(quote_ident)
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    Statement::render(
        format!("import foreign schema {source_schema} into {mirror_schema}"),
        &ImportForeignSchema {
            remote_schema: Ident::new(source_schema),
            except: RawSql::new(except),
            server: Ident::new(FOREIGN_SERVER_NAME),
            local_schema: Ident::new(mirror_schema),
        },
    )
}
