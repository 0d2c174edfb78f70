use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::db::{ensure_db_parent, open_connection, unix_timestamp};
use crate::runtime::ResolvedPaths;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/v001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "indexes",
        sql: include_str!("migrations/v002_indexes.sql"),
    },
    Migration {
        version: 3,
        name: "search",
        sql: include_str!("migrations/v003_search.sql"),
    },
];

/// Outcome of a migration run.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Bring the page database at `paths.db_path` up to the latest schema,
/// creating it first when needed.
pub fn run_migrations(paths: &ResolvedPaths) -> Result<MigrateReport> {
    ensure_db_parent(paths)?;
    run_migrations_for_connection(&open_connection(&paths.db_path)?)
}

pub fn run_migrations_for_connection(connection: &Connection) -> Result<MigrateReport> {
    ensure_schema_migrations_table(connection)?;
    let start = current_version(connection)?;

    let mut applied = Vec::new();
    for migration in MIGRATIONS.iter().filter(|m| m.version > start) {
        within_savepoint(connection, || apply_migration(connection, migration)).with_context(
            || format!("failed to apply migration v{:03}_{}", migration.version, migration.name),
        )?;
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    Ok(MigrateReport {
        applied,
        current_version: current_version(connection)?,
    })
}

pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    if !paths.db_path.exists() {
        return Ok(MIGRATIONS.len());
    }
    let connection = open_connection(&paths.db_path)?;
    ensure_schema_migrations_table(&connection)?;
    let version = current_version(&connection)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > version).count())
}

/// Highest applied migration, 0 on a fresh database.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read schema version")?;
    u32::try_from(version).context("schema version does not fit into u32")
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    connection
        .execute_batch(migration.sql)
        .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;
    let applied_at = i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?;
    connection
        .execute(
            "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
            params![i64::from(migration.version), migration.name, applied_at],
        )
        .context("failed to record migration")?;
    Ok(())
}

/// Run `body` inside a named savepoint, rolling it back on error.
fn within_savepoint<F>(connection: &Connection, body: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    connection
        .execute_batch("SAVEPOINT schema_migration")
        .context("failed to open savepoint")?;
    if let Err(err) = body() {
        let _ = connection.execute_batch(
            "ROLLBACK TO SAVEPOINT schema_migration; RELEASE SAVEPOINT schema_migration",
        );
        return Err(err);
    }
    connection
        .execute_batch("RELEASE SAVEPOINT schema_migration")
        .context("failed to release savepoint")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::db::{open_memory_connection, table_exists};

    fn test_paths() -> (tempfile::TempDir, ResolvedPaths) {
        let temp = tempdir().expect("tempdir");
        let project_root = temp.path().join("project");
        fs::create_dir_all(&project_root).expect("create project root");
        let paths = ResolvedPaths::for_project(&project_root);
        (temp, paths)
    }

    #[test]
    fn migrations_apply_on_fresh_db() {
        let (_temp, paths) = test_paths();
        let report = run_migrations(&paths).expect("run_migrations");
        assert_eq!(report.applied.len(), MIGRATIONS.len());
        assert_eq!(report.current_version, 3);
        assert!(paths.db_path.exists());
    }

    #[test]
    fn migrations_are_idempotent() {
        let (_temp, paths) = test_paths();
        let first = run_migrations(&paths).expect("first run");
        assert_eq!(first.applied.len(), MIGRATIONS.len());

        let second = run_migrations(&paths).expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.current_version, 3);
    }

    #[test]
    fn pending_count_tracks_applied_migrations() {
        let (_temp, paths) = test_paths();
        assert_eq!(
            pending_migration_count(&paths).expect("pending count"),
            MIGRATIONS.len()
        );
        run_migrations(&paths).expect("run_migrations");
        assert_eq!(pending_migration_count(&paths).expect("pending count"), 0);
    }

    #[test]
    fn failed_migration_rolls_back_its_savepoint() {
        let connection = open_memory_connection().expect("memory db");
        ensure_schema_migrations_table(&connection).expect("table");
        let broken = Migration {
            version: 99,
            name: "broken",
            sql: "CREATE TABLE half_done (id INTEGER); SELECT * FROM no_such_table;",
        };
        let result = within_savepoint(&connection, || apply_migration(&connection, &broken));
        assert!(result.is_err());
        assert!(!table_exists(&connection, "half_done").expect("check"));
        assert_eq!(current_version(&connection).expect("version"), 0);
    }

    #[test]
    fn in_memory_connection_gets_full_schema() {
        let connection = open_memory_connection().expect("memory db");
        run_migrations_for_connection(&connection).expect("migrate");
        for table in ["pages", "contents", "page_aliases", "search_documents"] {
            assert!(table_exists(&connection, table).expect("check"), "{table}");
        }
    }
}
