//! Fixed-size set of `tokio-postgres` connections for one role.
//!
//! Each connection's driver future runs on its own task. Statements are spread
//! round-robin over the clients, so a batch of concurrent submissions keeps up
//! to `max` statements in flight against the server.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use futures_util::future::try_join_all;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, trace, warn};

use crate::config::ConnectionOptions;
use crate::template::Statement;

/// Connections for one database role.
pub struct PgPool {
    /// Short role label used in logs (`source` / `overlay`).
    label: &'static str,
    clients: Vec<Client>,
    next: AtomicUsize,
    drivers: Vec<JoinHandle<()>>,
}

impl PgPool {
    /// Opens `options.max` connections concurrently.
    pub async fn connect(label: &'static str, options: &ConnectionOptions) -> Result<Self> {
        let config = options.pg_config();
        let size = options.max.max(1);
        let opened = try_join_all((0..size).map(|_| config.connect(NoTls)))
            .await
            .with_context(|| {
                format!(
                    "connect to {label} database {}@{}:{}/{}",
                    options.user, options.host, options.port, options.database
                )
            })?;

        let mut clients = Vec::with_capacity(size);
        let mut drivers = Vec::with_capacity(size);
        for (client, connection) in opened {
            drivers.push(tokio::spawn(async move {
                if let Err(err) = connection.await {
                    warn!(pool = label, error = %err, "postgres connection terminated");
                }
            }));
            clients.push(client);
        }
        debug!(pool = label, connections = size, "connection pool ready");

        Ok(Self {
            label,
            clients,
            next: AtomicUsize::new(0),
            drivers,
        })
    }

    /// Next client in round-robin order.
    pub fn client(&self) -> &Client {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[index]
    }

    /// Submits one rendered statement over the simple-query protocol.
    pub async fn execute(&self, statement: &Statement) -> Result<()> {
        debug!(
            pool = self.label,
            statement = %statement.description,
            "submitting statement"
        );
        if !statement.sensitive {
            trace!(pool = self.label, sql = %statement.sql);
        }
        self.client()
            .batch_execute(&statement.sql)
            .await
            .with_context(|| format!("{} (on {} database)", statement.description, self.label))
    }

    /// Runs a parameterized catalog query.
    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        self.client()
            .query(sql, params)
            .await
            .with_context(|| format!("query {} database", self.label))
    }

    /// Drops every client and waits for the connection drivers to finish.
    pub async fn close(self) {
        let Self {
            label,
            clients,
            drivers,
            ..
        } = self;
        drop(clients);
        for driver in drivers {
            let _ = driver.await;
        }
        debug!(pool = label, "connection pool closed");
    }
}
