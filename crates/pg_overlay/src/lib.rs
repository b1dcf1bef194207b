//! Copy-on-write overlays of a PostgreSQL source database.
//!
//! Setup connects to two databases:
//! - the source, which is only ever read (catalog discovery and, through
//!   `postgres_fdw`, row reads),
//! - the overlay, which receives mirrors, tombstone and shadow storage, merged
//!   views named like the source tables, and the rules that redirect writes.
//!
//! After setup, clients talk to the overlay as if it were the source. Writes
//! land in overlay-owned tables and `overlay_reset()` discards them.

pub mod config;
pub mod error;
pub mod inspector;
pub mod namespace;
pub mod orchestrator;
pub mod pool;
pub mod remote;
pub mod reset;
pub mod synth;
pub mod template;

pub use config::{ConnectionOptions, OverlayConfig};
pub use error::{ConfigError, SubstitutionError};
pub use inspector::{ManifestEntry, TableDescriptor};
pub use orchestrator::{reset_overlay, setup_overlay, Phase, SetupReport};
