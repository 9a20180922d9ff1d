//! Database connection management

use crate::error::Result;
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::migrations;

/// Upper bound on read-only connections per database
pub const MAX_READERS: usize = 16;

/// Database wrapper for libSQL connections
///
/// Holds one writer connection and an optional pool of read-only connections.
/// Readers are handed out round-robin; the index is owned by this value so
/// independent databases never share selection state.
pub struct Database {
    db: LibSqlDatabase,
    writer: Connection,
    readers: Vec<Connection>,
    next_reader: AtomicUsize,
    in_memory: bool,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// `readers` extra read-only connections are opened (capped at
    /// [`MAX_READERS`]). Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>, readers: usize) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        if path_str == ":memory:" {
            return Self::open_in_memory().await;
        }

        let db = Builder::new_local(&path_str).build().await?;
        let writer = db.connect()?;

        let database = Self {
            db,
            writer,
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            in_memory: false,
        };
        database.configure().await?;
        database.migrate().await?;
        database.with_readers(readers.min(MAX_READERS)).await
    }

    /// Open an in-memory database (useful for testing)
    ///
    /// Every libSQL connection to `:memory:` is a separate database, so an
    /// in-memory database never has readers; reads use the writer.
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let writer = db.connect()?;

        let database = Self {
            db,
            writer,
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            in_memory: true,
        };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    async fn with_readers(mut self, count: usize) -> Result<Self> {
        for _ in 0..count {
            let reader = self.db.connect()?;
            reader.execute("PRAGMA busy_timeout = 5000;", ()).await.ok();
            reader.execute("PRAGMA query_only = 1;", ()).await.ok();
            self.readers.push(reader);
        }
        if count > 0 {
            tracing::debug!(readers = count, "Opened read-only connections");
        }
        Ok(self)
    }

    /// Configure `SQLite` for concurrent readers alongside a single writer
    async fn configure(&self) -> Result<()> {
        if !self.in_memory {
            self.writer
                .execute("PRAGMA journal_mode = WAL;", ())
                .await
                .ok();
        }
        self.writer
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.writer
            .execute("PRAGMA busy_timeout = 5000;", ())
            .await
            .ok();
        self.writer.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.writer).await
    }

    /// Connection used for every write and for reads that must observe the
    /// latest commit
    pub const fn writer(&self) -> &Connection {
        &self.writer
    }

    /// Next read-only connection, falling back to the writer when no
    /// readers are configured
    pub fn reader(&self) -> &Connection {
        if self.readers.is_empty() {
            return &self.writer;
        }
        let index = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        &self.readers[index]
    }

    /// Number of read-only connections
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Whether this database lives only in memory
    pub const fn is_in_memory(&self) -> bool {
        self.in_memory
    }
}
