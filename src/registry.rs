//! Multi-instance registry.
//!
//! A shared SQLite database (WAL mode) at a well-known path lets multiple
//! server processes advertise themselves, heartbeat, and discover each
//! other. Rows are keyed by an instance id of `hostname-pid-start_time`.
//!
//! Registry path resolution: `$EMBEDDER_REGISTRY` (a `.sqlite` suffix is
//! appended when missing) → `$HOME/.embedder_instances.sqlite`
//! (`%USERPROFILE%` on Windows) → `./embedder_instances.sqlite`.
//!
//! # Liveness
//!
//! The owning process heartbeats every 10 s. Reaping removes rows whose
//! heartbeat is older than 60 s, then rows whose pid is no longer alive on
//! this host. `get_active_instances` only returns rows with a heartbeat
//! within the last 30 s.
//!
//! Cross-process concurrency is SQLite's (WAL); in-process calls are
//! serialized by the single-connection pool.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::{info, warn};

use crate::config::Settings;

/// Seconds after which a silent instance is deleted.
const STALE_AFTER_SECS: i64 = 60;
/// Seconds within which an instance counts as active.
const ACTIVE_WITHIN_SECS: i64 = 30;
/// Heartbeat period, in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

pub struct InstanceRegistry {
    pool: SqlitePool,
    instance_id: String,
}

impl InstanceRegistry {
    /// Open (creating if needed) the shared registry database and reap
    /// stale rows left by crashed processes.
    pub async fn open(registry_path: Option<&str>) -> Result<Self> {
        let path = match registry_path {
            Some(path) => path.to_string(),
            None => resolve_registry_path(),
        };
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open registry database: {}", path))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                port INTEGER NOT NULL,
                host TEXT NOT NULL DEFAULT 'localhost',
                project_id TEXT,
                name TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                started_at_str TEXT NOT NULL,
                last_heartbeat INTEGER NOT NULL,
                last_heartbeat_str TEXT NOT NULL,
                cwd TEXT NOT NULL,
                config_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'healthy',
                created_at INTEGER DEFAULT (strftime('%s', 'now')),
                params TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create registry tables")?;
        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_instances_heartbeat ON instances(last_heartbeat)",
            "CREATE INDEX IF NOT EXISTS idx_instances_pid ON instances(pid)",
            "CREATE INDEX IF NOT EXISTS idx_instances_project ON instances(project_id)",
        ] {
            sqlx::query(index_sql)
                .execute(&pool)
                .await
                .context("Failed to create registry indexes")?;
        }

        let registry = Self {
            pool,
            instance_id: generate_instance_id(),
        };
        registry.clean_stale_instances().await;
        Ok(registry)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Upsert this process's row. Called once on `serve` startup.
    pub async fn register(
        &self,
        port: u16,
        watch_interval: u64,
        settings: &Settings,
    ) -> Result<()> {
        let (now, now_str) = timestamp_pair();
        let name = if settings.source.project_title.is_empty() {
            std::env::current_dir()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "embedder".to_string())
        } else {
            settings.source.project_title.clone()
        };
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let config_path = std::fs::canonicalize(&settings.config_path)
            .unwrap_or_else(|_| settings.config_path.clone())
            .to_string_lossy()
            .into_owned();
        let params = serde_json::json!({ "watch_interval": watch_interval }).to_string();

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO instances
            (id, pid, port, host, project_id, name, started_at, started_at_str,
             last_heartbeat, last_heartbeat_str, cwd, config_path, status, params)
            VALUES (?, ?, ?, 'localhost', ?, ?, ?, ?, ?, ?, ?, ?, 'healthy', ?)
            "#,
        )
        .bind(&self.instance_id)
        .bind(std::process::id() as i64)
        .bind(port as i64)
        .bind(&settings.source.project_id)
        .bind(&name)
        .bind(now)
        .bind(&now_str)
        .bind(now)
        .bind(&now_str)
        .bind(&cwd)
        .bind(&config_path)
        .bind(&params)
        .execute(&self.pool)
        .await
        .context("Failed to register instance")?;

        info!(instance = %self.instance_id, port, "Registered instance");
        Ok(())
    }

    /// Remove this process's row on normal shutdown.
    pub async fn unregister(&self) -> Result<()> {
        let result = sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(&self.instance_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!(instance = %self.instance_id, "Unregistered instance");
        } else {
            warn!(instance = %self.instance_id, "Instance not found for unregistration");
        }
        Ok(())
    }

    /// Refresh this instance's heartbeat, then reap stale peers.
    pub async fn heartbeat(&self) -> Result<()> {
        let (now, now_str) = timestamp_pair();
        sqlx::query(
            "UPDATE instances SET last_heartbeat = ?, last_heartbeat_str = ?, status = 'healthy' WHERE id = ?",
        )
        .bind(now)
        .bind(&now_str)
        .bind(&self.instance_id)
        .execute(&self.pool)
        .await?;
        self.clean_stale_instances().await;
        Ok(())
    }

    /// Rows with a recent heartbeat, newest first, `params` parsed.
    pub async fn get_active_instances(&self) -> Result<Vec<serde_json::Value>> {
        let rows = sqlx::query(
            r#"
            SELECT id, pid, port, host, project_id, name, started_at,
                   started_at_str, last_heartbeat, last_heartbeat_str,
                   cwd, config_path, status, params
            FROM instances
            WHERE (strftime('%s', 'now') - last_heartbeat) < ?
            ORDER BY last_heartbeat DESC
            "#,
        )
        .bind(ACTIVE_WITHIN_SECS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let params: String = row.get::<Option<String>, _>("params").unwrap_or_default();
                let params = serde_json::from_str::<serde_json::Value>(&params)
                    .unwrap_or_else(|_| serde_json::json!({}));
                serde_json::json!({
                    "id": row.get::<String, _>("id"),
                    "pid": row.get::<i64, _>("pid"),
                    "port": row.get::<i64, _>("port"),
                    "host": row.get::<String, _>("host"),
                    "project_id": row.get::<Option<String>, _>("project_id").unwrap_or_default(),
                    "name": row.get::<String, _>("name"),
                    "started_at": row.get::<i64, _>("started_at"),
                    "started_at_str": row.get::<String, _>("started_at_str"),
                    "last_heartbeat": row.get::<i64, _>("last_heartbeat"),
                    "last_heartbeat_str": row.get::<String, _>("last_heartbeat_str"),
                    "cwd": row.get::<String, _>("cwd"),
                    "config": row.get::<String, _>("config_path"),
                    "status": row.get::<String, _>("status"),
                    "params": params,
                })
            })
            .collect())
    }

    /// Reap rows with an expired heartbeat, then rows whose process is
    /// gone on this host. Errors are logged, never propagated.
    async fn clean_stale_instances(&self) {
        let deleted = sqlx::query(
            "DELETE FROM instances WHERE (strftime('%s', 'now') - last_heartbeat) > ?",
        )
        .bind(STALE_AFTER_SECS)
        .execute(&self.pool)
        .await;
        match deleted {
            Ok(result) if result.rows_affected() > 0 => {
                info!(
                    count = result.rows_affected(),
                    "Deleted stale instance(s) with old heartbeats"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to clean stale instances");
                return;
            }
        }

        let rows = match sqlx::query("SELECT id, pid FROM instances")
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(_) => return,
        };
        if rows.is_empty() {
            return;
        }

        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        for row in rows {
            let id: String = row.get("id");
            let pid: i64 = row.get("pid");
            if system.process(Pid::from_u32(pid as u32)).is_none() {
                let result = sqlx::query("DELETE FROM instances WHERE id = ?")
                    .bind(&id)
                    .execute(&self.pool)
                    .await;
                if matches!(result, Ok(r) if r.rows_affected() > 0) {
                    info!(instance = %id, "Deleted stale instance with dead process");
                }
            }
        }
    }
}

fn resolve_registry_path() -> String {
    if let Ok(path) = std::env::var("EMBEDDER_REGISTRY") {
        if !path.is_empty() {
            return if path.ends_with(".sqlite") {
                path
            } else {
                format!("{}.sqlite", path)
            };
        }
    }
    let home = if cfg!(windows) {
        std::env::var("USERPROFILE")
    } else {
        std::env::var("HOME")
    };
    match home {
        Ok(home) if !home.is_empty() => format!("{}/.embedder_instances.sqlite", home),
        _ => "embedder_instances.sqlite".to_string(),
    }
}

fn generate_instance_id() -> String {
    let hostname = System::host_name().unwrap_or_else(|| "localhost".to_string());
    format!(
        "{}-{}-{}",
        hostname,
        std::process::id(),
        chrono::Utc::now().timestamp()
    )
}

fn timestamp_pair() -> (i64, String) {
    let now = chrono::Local::now();
    (
        now.timestamp(),
        now.format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_settings() -> Settings {
        Settings::default()
    }

    #[tokio::test]
    async fn register_and_discover() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.sqlite");
        let registry = InstanceRegistry::open(Some(path.to_str().unwrap()))
            .await
            .unwrap();

        registry
            .register(8590, 60, &scratch_settings())
            .await
            .unwrap();
        let active = registry.get_active_instances().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0]["port"], 8590);
        assert_eq!(active[0]["params"]["watch_interval"], 60);
        assert_eq!(active[0]["status"], "healthy");
    }

    #[tokio::test]
    async fn unregister_removes_row() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.sqlite");
        let registry = InstanceRegistry::open(Some(path.to_str().unwrap()))
            .await
            .unwrap();

        registry
            .register(9000, 0, &scratch_settings())
            .await
            .unwrap();
        registry.unregister().await.unwrap();
        assert!(registry.get_active_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_heartbeat_is_reaped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.sqlite");
        let registry = InstanceRegistry::open(Some(path.to_str().unwrap()))
            .await
            .unwrap();
        registry
            .register(9001, 0, &scratch_settings())
            .await
            .unwrap();

        // Age the heartbeat past the reap threshold.
        sqlx::query("UPDATE instances SET last_heartbeat = last_heartbeat - 120")
            .execute(&registry.pool)
            .await
            .unwrap();
        registry.clean_stale_instances().await;

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances")
            .fetch_one(&registry.pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn dead_pid_is_reaped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("registry.sqlite");
        let registry = InstanceRegistry::open(Some(path.to_str().unwrap()))
            .await
            .unwrap();

        // Plant a row for a pid that cannot exist.
        let (now, now_str) = timestamp_pair();
        sqlx::query(
            r#"
            INSERT INTO instances
            (id, pid, port, host, project_id, name, started_at, started_at_str,
             last_heartbeat, last_heartbeat_str, cwd, config_path, status, params)
            VALUES ('ghost', 4194303, 1, 'localhost', '', 'ghost', ?, ?, ?, ?, '', '', 'healthy', '{}')
            "#,
        )
        .bind(now)
        .bind(&now_str)
        .bind(now)
        .bind(&now_str)
        .execute(&registry.pool)
        .await
        .unwrap();

        registry.clean_stale_instances().await;
        let active = registry.get_active_instances().await.unwrap();
        assert!(active.iter().all(|i| i["id"] != "ghost"));
    }

    #[test]
    fn registry_path_resolution() {
        std::env::set_var("EMBEDDER_REGISTRY", "/tmp/custom-registry");
        assert_eq!(resolve_registry_path(), "/tmp/custom-registry.sqlite");
        std::env::set_var("EMBEDDER_REGISTRY", "/tmp/custom.sqlite");
        assert_eq!(resolve_registry_path(), "/tmp/custom.sqlite");
        std::env::remove_var("EMBEDDER_REGISTRY");
        assert!(resolve_registry_path().ends_with(".embedder_instances.sqlite")
            || resolve_registry_path() == "embedder_instances.sqlite");
    }
}
