//! Phase-ordered setup of the overlay database.
//!
//! Every phase depends on objects created by earlier phases, so phases run
//! strictly one after another. Within a phase the statements are independent
//! and are submitted concurrently over the overlay pool; the first failure
//! aborts the phase and the run.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ConnectionOptions, OverlayConfig};
use crate::inspector::{ManifestEntry, MetadataInspector, TableDescriptor};
use crate::namespace::{is_reserved_schema_name, NamespaceKind};
use crate::pool::PgPool;
use crate::remote;
use crate::reset;
use crate::synth::{create_schema, TableSynthesizer};
use crate::template::Statement;

/// Setup phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Discover,
    EnableEngineExtension,
    RegisterRemoteSource,
    RegisterCredentials,
    CreateMirrorNamespaces,
    ImportMirrors,
    CreateTombstoneNamespaces,
    CreateTombstoneTables,
    CreateShadowNamespaces,
    CreateShadowTables,
    CreateOverlayNamespaces,
    CreateDefaultFnNamespaces,
    OverlayObjects,
    BuildResetProcedure,
}

impl Phase {
    pub const ALL: [Self; 14] = [
        Self::Discover,
        Self::EnableEngineExtension,
        Self::RegisterRemoteSource,
        Self::RegisterCredentials,
        Self::CreateMirrorNamespaces,
        Self::ImportMirrors,
        Self::CreateTombstoneNamespaces,
        Self::CreateTombstoneTables,
        Self::CreateShadowNamespaces,
        Self::CreateShadowTables,
        Self::CreateOverlayNamespaces,
        Self::CreateDefaultFnNamespaces,
        Self::OverlayObjects,
        Self::BuildResetProcedure,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::EnableEngineExtension => "enable-engine-extension",
            Self::RegisterRemoteSource => "register-remote-source",
            Self::RegisterCredentials => "register-credentials",
            Self::CreateMirrorNamespaces => "create-mirror-namespaces",
            Self::ImportMirrors => "import-mirrors",
            Self::CreateTombstoneNamespaces => "create-tombstone-namespaces",
            Self::CreateTombstoneTables => "create-tombstone-tables",
            Self::CreateShadowNamespaces => "create-shadow-namespaces",
            Self::CreateShadowTables => "create-shadow-tables",
            Self::CreateOverlayNamespaces => "create-overlay-namespaces",
            Self::CreateDefaultFnNamespaces => "create-default-fn-namespaces",
            Self::OverlayObjects => "overlay-objects",
            Self::BuildResetProcedure => "build-reset-procedure",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one setup run: every discovered table, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupReport {
    pub tables: Vec<ManifestEntry>,
}

impl SetupReport {
    /// Tables exposed without a write path because they lack a primary key.
    pub fn read_only_tables(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.tables.iter().filter(|entry| entry.read_only)
    }
}

/// Builds or refreshes the overlay described by `config`.
///
/// Both pools stay open for the whole run and are closed before returning,
/// whether or not setup succeeded.
pub async fn setup_overlay(config: OverlayConfig) -> Result<SetupReport> {
    let source = PgPool::connect("source", &config.source).await?;
    let overlay = match PgPool::connect("overlay", &config.overlay).await {
        Ok(overlay) => overlay,
        Err(err) => {
            source.close().await;
            return Err(err);
        }
    };

    let result = Orchestrator {
        config: &config,
        source: &source,
        overlay: &overlay,
    }
    .run()
    .await;

    source.close().await;
    overlay.close().await;
    result
}

/// Discards every overlay-side change by calling the reset procedure.
pub async fn reset_overlay(overlay: ConnectionOptions) -> Result<()> {
    let pool = PgPool::connect("overlay", &overlay).await?;
    let result = pool.execute(&reset::call_reset()?).await;
    pool.close().await;
    result?;
    info!("overlay reset to source contents");
    Ok(())
}

/// One setup run over an open pair of pools.
struct Orchestrator<'a> {
    config: &'a OverlayConfig,
    source: &'a PgPool,
    overlay: &'a PgPool,
}

impl Orchestrator<'_> {
    async fn run(&self) -> Result<SetupReport> {
        let tables = run_phase(Phase::Discover, self.discover()).await?;
        let schemas = tables
            .iter()
            .map(|table| table.schema_name().to_string())
            .collect::<BTreeSet<_>>();
        info!(
            tables = tables.len(),
            schemas = schemas.len(),
            "source catalog discovered"
        );

        run_phase(
            Phase::EnableEngineExtension,
            self.execute_all(vec![remote::enable_extension()?]),
        )
        .await?;
        run_phase(
            Phase::RegisterRemoteSource,
            self.execute_in_order(remote::register_source(&self.config.source)?),
        )
        .await?;
        run_phase(
            Phase::RegisterCredentials,
            self.execute_in_order(remote::register_credentials(
                &self.config.overlay.user,
                &self.config.source,
            )?),
        )
        .await?;

        run_phase(
            Phase::CreateMirrorNamespaces,
            self.execute_all(schema_statements(&schemas, NamespaceKind::Mirror)?),
        )
        .await?;
        run_phase(Phase::ImportMirrors, self.import_mirrors(&schemas)).await?;

        run_phase(
            Phase::CreateTombstoneNamespaces,
            self.execute_all(schema_statements(&schemas, NamespaceKind::Tombstone)?),
        )
        .await?;
        let tombstones = tables
            .iter()
            .map(|table| TableSynthesizer::new(table).tombstone_table())
            .collect::<Result<Vec<_>, _>>()?;
        run_phase(
            Phase::CreateTombstoneTables,
            self.execute_all(tombstones.into_iter().flatten().collect()),
        )
        .await?;

        run_phase(
            Phase::CreateShadowNamespaces,
            self.execute_all(schema_statements(&schemas, NamespaceKind::Shadow)?),
        )
        .await?;
        let shadows = tables
            .iter()
            .map(|table| TableSynthesizer::new(table).shadow_storage())
            .collect::<Result<Vec<_>, _>>()?;
        run_phase(
            Phase::CreateShadowTables,
            try_join_all(
                shadows
                    .into_iter()
                    .map(|storage| self.execute_in_order(storage)),
            ),
        )
        .await?;

        let overlay_namespaces = schemas
            .iter()
            .map(|schema| create_schema(schema))
            .collect::<Result<Vec<_>, _>>()?;
        run_phase(
            Phase::CreateOverlayNamespaces,
            self.execute_all(overlay_namespaces),
        )
        .await?;
        run_phase(
            Phase::CreateDefaultFnNamespaces,
            self.execute_all(schema_statements(&schemas, NamespaceKind::DefaultFunction)?),
        )
        .await?;

        run_phase(
            Phase::OverlayObjects,
            try_join_all(tables.iter().map(|table| self.build_table_overlay(table))),
        )
        .await?;
        run_phase(
            Phase::BuildResetProcedure,
            self.execute_all(vec![reset::reset_function(&tables)?]),
        )
        .await?;

        Ok(SetupReport {
            tables: tables.iter().map(TableDescriptor::manifest_entry).collect(),
        })
    }

    async fn discover(&self) -> Result<Vec<TableDescriptor>> {
        let tables = MetadataInspector::new(self.source)
            .discover(&self.config.excluded_schemas)
            .await?;
        if let Some(table) = tables
            .iter()
            .find(|table| is_reserved_schema_name(table.schema_name()))
        {
            return Err(anyhow!(
                "source schema {:?} uses a reserved overlay prefix; exclude it or rename it",
                table.schema_name()
            ));
        }
        Ok(tables)
    }

    async fn import_mirrors(&self, schemas: &BTreeSet<String>) -> Result<()> {
        try_join_all(schemas.iter().map(|schema| self.import_mirror(schema))).await?;
        Ok(())
    }

    /// Imports only the source tables not already present in the mirror schema.
    async fn import_mirror(&self, source_schema: &str) -> Result<()> {
        let mirror_schema = NamespaceKind::Mirror.derive(source_schema);
        let existing = self
            .overlay
            .query(remote::EXISTING_MIRROR_TABLES_QUERY, &[&mirror_schema])
            .await
            .with_context(|| format!("list existing mirror tables in {mirror_schema}"))?
            .iter()
            .map(|row| row.try_get::<_, String>("table_name"))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            schema = source_schema,
            already_mirrored = existing.len(),
            "importing mirror schema"
        );
        let statement = remote::import_mirror(source_schema, &mirror_schema, &existing)?;
        self.overlay.execute(&statement).await
    }

    /// View first, then default functions, then the three rules.
    async fn build_table_overlay(&self, table: &TableDescriptor) -> Result<()> {
        let plan = TableSynthesizer::new(table).overlay()?;
        self.overlay.execute(&plan.view).await?;
        try_join_all(plan.defaults.iter().map(|binding| async move {
            self.overlay.execute(&binding.function).await?;
            self.overlay.execute(&binding.bind).await
        }))
        .await?;
        self.execute_in_order(plan.rules).await?;
        debug!(
            schema = table.schema_name(),
            table = table.table_name(),
            read_only = table.read_only(),
            "overlay objects ready"
        );
        Ok(())
    }

    async fn execute_all(&self, statements: Vec<Statement>) -> Result<()> {
        try_join_all(
            statements
                .iter()
                .map(|statement| self.overlay.execute(statement)),
        )
        .await?;
        Ok(())
    }

    async fn execute_in_order(&self, statements: Vec<Statement>) -> Result<()> {
        for statement in &statements {
            self.overlay.execute(statement).await?;
        }
        Ok(())
    }
}

/// `CREATE SCHEMA` for the `kind` namespace of every schema.
fn schema_statements(
    schemas: &BTreeSet<String>,
    kind: NamespaceKind,
) -> Result<Vec<Statement>, crate::error::SubstitutionError> {
    schemas
        .iter()
        .map(|schema| create_schema(&kind.derive(schema)))
        .collect()
}

async fn run_phase<T, F>(phase: Phase, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    info!(phase = phase.as_str(), "phase started");
    let started = Instant::now();
    let output = work
        .await
        .with_context(|| format!("setup phase {phase} failed"))?;
    info!(
        phase = phase.as_str(),
        elapsed_ms = whole_millis(started.elapsed()),
        "phase completed"
    );
    Ok(output)
}

/// Saturates instead of truncating.
fn whole_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn phase_names_are_unique_and_kebab_case() {
        let names = Phase::ALL.iter().map(|phase| phase.as_str()).collect::<HashSet<_>>();
        assert_eq!(names.len(), Phase::ALL.len());
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '-'),
                "{name}"
            );
        }
    }

    #[test]
    fn storage_phases_precede_overlay_objects() {
        let position = |phase| Phase::ALL.iter().position(|p| *p == phase).unwrap();
        assert_eq!(position(Phase::Discover), 0);
        assert!(position(Phase::ImportMirrors) < position(Phase::OverlayObjects));
        assert!(position(Phase::CreateShadowTables) < position(Phase::OverlayObjects));
        assert!(position(Phase::CreateDefaultFnNamespaces) < position(Phase::OverlayObjects));
        assert_eq!(position(Phase::BuildResetProcedure), Phase::ALL.len() - 1);
    }

    #[test]
    fn schema_statements_cover_every_schema_once() {
        let schemas = ["public", "Sales"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>();
        let statements = schema_statements(&schemas, NamespaceKind::Tombstone).unwrap();
        let sql = statements.iter().map(|s| s.sql.as_str()).collect::<Vec<_>>();
        assert_eq!(
            sql,
            [
                "CREATE SCHEMA IF NOT EXISTS \"overlay_upper_deleted_Sales\";",
                "CREATE SCHEMA IF NOT EXISTS \"overlay_upper_deleted_public\";",
            ]
        );
    }

    #[test]
    fn elapsed_millis_saturate() {
        assert_eq!(whole_millis(Duration::from_micros(2_500)), 2);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn report_lists_read_only_tables() {
        let report = SetupReport {
            tables: vec![
                ManifestEntry {
                    schema_name: "public".to_string(),
                    table_name: "orders".to_string(),
                    read_only: false,
                },
                ManifestEntry {
                    schema_name: "public".to_string(),
                    table_name: "log".to_string(),
                    read_only: true,
                },
            ],
        };
        let read_only = report
            .read_only_tables()
            .map(|entry| entry.table_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(read_only, ["log"]);
    }
}
