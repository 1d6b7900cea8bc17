//! The SQLite database where scores, narratives and incidents are persisted.

use crate::state::{Incident, IncidentKind, Narrative, Score};
use anyhow::Error;
use clap::Args;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::path::PathBuf;

/// Database connection options.
#[derive(Clone, Debug, Args)]
#[group(skip)]
pub struct Options {
    /// Path to the SQLite database file.
    ///
    /// The file and its parent directory are created if they do not exist.
    #[clap(long, env = "SUBMIND_DB_PATH", default_value = "data/submind.db")]
    pub db_path: PathBuf,
}

impl Options {
    /// Connect to the database.
    pub async fn connect(&self) -> Result<Connection, Error> {
        if let Some(dir) = self.db_path.parent() {
            if !dir.as_os_str().is_empty() {
                async_std::fs::create_dir_all(dir).await?;
            }
        }
        tracing::info!("opening database {}", self.db_path.display());
        let options = SqliteConnectOptions::new()
            .filename(&self.db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Connection { pool })
    }
}

/// A connection to the database.
#[derive(Clone, Debug)]
pub struct Connection {
    pool: SqlitePool,
}

/// Perform one-time setup of the database.
///
/// This creates the necessary tables. It is safe to run against a database which is already set
/// up.
pub async fn setup(conn: &Connection) -> Result<(), Error> {
    let mut tx = conn.pool.begin().await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS scores(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT, score REAL, velocity REAL, trust REAL, t REAL
        )",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS narratives(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT, source TEXT, t REAL
        )",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS incidents(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT, message TEXT, t REAL
        )",
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

impl Connection {
    /// Persist the results of one polling cycle atomically.
    pub async fn insert_cycle(
        &self,
        scores: &[Score],
        narratives: &[Narrative],
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for score in scores {
            sqlx::query("INSERT INTO scores(name, score, velocity, trust, t) VALUES(?, ?, ?, ?, ?)")
                .bind(score.name.as_str())
                .bind(score.score)
                .bind(score.velocity)
                .bind(score.trust)
                .bind(score.ts)
                .execute(&mut *tx)
                .await?;
        }
        for narrative in narratives {
            sqlx::query("INSERT INTO narratives(title, source, t) VALUES(?, ?, ?)")
                .bind(narrative.title.as_str())
                .bind(narrative.source.to_string())
                .bind(narrative.t)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Persist an incident.
    pub async fn insert_incident(&self, incident: &Incident) -> Result<(), Error> {
        sqlx::query("INSERT INTO incidents(kind, message, t) VALUES(?, ?, ?)")
            .bind(incident.kind.to_string())
            .bind(incident.message.as_str())
            .bind(incident.t)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The scores computed in the most recent cycle, highest first.
    pub async fn latest_scores(&self) -> Result<Vec<Score>, Error> {
        sqlx::query(
            "SELECT name, score, velocity, trust, t FROM scores
                WHERE t = (SELECT MAX(t) FROM scores)
                ORDER BY score DESC, id",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok::<_, Error>(Score {
                name: row.try_get("name")?,
                score: row.try_get("score")?,
                velocity: row.try_get("velocity")?,
                trust: row.try_get("trust")?,
                ts: row.try_get("t")?,
            })
        })
        .collect()
    }

    /// Up to `limit` of the most recent narratives, oldest first.
    pub async fn recent_narratives(&self, limit: usize) -> Result<Vec<Narrative>, Error> {
        recent(&self.pool, "narratives", "title, source, t", limit)
            .await?
            .iter()
            .map(|row| {
                let source: String = row.try_get("source")?;
                Ok::<_, Error>(Narrative {
                    title: row.try_get("title")?,
                    source: source
                        .parse()
                        .map_err(|_| Error::msg(format!("unknown narrative source {source}")))?,
                    t: row.try_get("t")?,
                })
            })
            .collect()
    }

    /// Up to `limit` of the most recent incidents, oldest first.
    pub async fn recent_incidents(&self, limit: usize) -> Result<Vec<Incident>, Error> {
        recent(&self.pool, "incidents", "kind, message, t", limit)
            .await?
            .iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                Ok::<_, Error>(Incident {
                    kind: kind
                        .parse::<IncidentKind>()
                        .map_err(|_| Error::msg(format!("unknown incident kind {kind}")))?,
                    message: row.try_get("message")?,
                    t: row.try_get("t")?,
                })
            })
            .collect()
    }
}

/// Load the last `limit` rows of `table`, in insertion order.
async fn recent(
    pool: &SqlitePool,
    table: &str,
    columns: &str,
    limit: usize,
) -> Result<Vec<SqliteRow>, Error> {
    let query = format!(
        "SELECT {columns} FROM (SELECT id, {columns} FROM {table} ORDER BY id DESC LIMIT ?)
            ORDER BY id"
    );
    Ok(sqlx::query(&query)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await?)
}
