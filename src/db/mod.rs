//! Database module for directory, track, artist, and album persistence.
//!
//! Uses SQLx with SQLite for lightweight, embedded database storage.
//! Provides async operations for:
//! - Directory bookkeeping (path + mtime for incremental scans)
//! - Artist and album management
//! - Track upserts keyed by the scanner's unique id
//!
//! [`SqliteStorage`] wraps the pool for the synchronous scan pipeline.
//!
//! # Example
//!
//! ```ignore
//! use collection_scanner::db::{init_db, get_all_tracks_with_album};
//!
//! let pool = init_db("sqlite:collection.db").await?;
//! let tracks = get_all_tracks_with_album(&pool).await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::runtime::Handle;

use crate::error::Result;
use crate::model::{AlbumSummary, StoredDirectory, StoredTrack, Track, TrackWithAlbum};
use crate::storage::{CollectionStorage, CommitMode, DirectoryTimes, PlaylistImporter};

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "collection.db";

/// Build a SQLite database URL from an optional path.
///
/// If no path is provided, uses [`DEFAULT_DB_NAME`] in the current directory.
pub fn db_url(path: Option<&Path>) -> String {
    match path {
        Some(p) => format!("sqlite:{}", p.display()),
        None => format!("sqlite:{}", DEFAULT_DB_NAME),
    }
}

/// Initialize the database connection pool and run migrations.
///
/// Creates the database file if it doesn't exist, establishes a connection
/// pool with up to 5 connections, and runs all pending migrations.
///
/// # Errors
///
/// Returns an error if:
/// - Database creation fails
/// - Connection cannot be established
/// - Migration fails
pub async fn init_db(db_url: &str) -> Result<SqlitePool> {
    if !sqlx::Sqlite::database_exists(db_url).await.unwrap_or(false) {
        sqlx::Sqlite::create_database(db_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    tracing::debug!(target: "db", url = db_url, "Database ready");
    Ok(pool)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// ============================================================================
// Artists and albums
// ============================================================================

/// Get or create an artist by name.
///
/// Idempotent: calling with the same name always returns the same ID.
pub async fn get_or_create_artist(pool: &SqlitePool, name: &str) -> sqlx::Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM artists WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    if let Some((id,)) = row {
        Ok(id)
    } else {
        let result = sqlx::query("INSERT INTO artists (name) VALUES (?)")
            .bind(name)
            .execute(pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

/// Get or create an album by name and artist.
///
/// # Arguments
///
/// * `pool` - Database connection pool
/// * `name` - Album name
/// * `artist_id` - Album artist; `None` for compilations
pub async fn get_or_create_album(
    pool: &SqlitePool,
    name: &str,
    artist_id: Option<i64>,
) -> sqlx::Result<i64> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM albums WHERE name = ? AND artist_id IS ?")
            .bind(name)
            .bind(artist_id)
            .fetch_optional(pool)
            .await?;

    if let Some((id,)) = row {
        Ok(id)
    } else {
        let result = sqlx::query("INSERT INTO albums (name, artist_id) VALUES (?, ?)")
            .bind(name)
            .bind(artist_id)
            .execute(pool)
            .await?;
        Ok(result.last_insert_rowid())
    }
}

/// Set an album's cover. With `replace == false` an existing cover wins.
pub async fn set_album_cover(
    pool: &SqlitePool,
    album_id: i64,
    cover: &str,
    replace: bool,
) -> sqlx::Result<()> {
    let sql = if replace {
        "UPDATE albums SET cover = ? WHERE id = ?"
    } else {
        "UPDATE albums SET cover = ? WHERE id = ? AND cover IS NULL"
    };
    sqlx::query(sql).bind(cover).bind(album_id).execute(pool).await?;
    Ok(())
}

/// All albums with artist name and track count.
pub async fn get_album_summaries(pool: &SqlitePool) -> sqlx::Result<Vec<AlbumSummary>> {
    sqlx::query_as::<_, AlbumSummary>(
        r#"
        SELECT
            al.id, al.name, a.name AS artist_name, al.cover,
            (SELECT COUNT(*) FROM tracks t WHERE t.album_id = al.id) AS track_count
        FROM albums al
        LEFT JOIN artists a ON al.artist_id = a.id
        ORDER BY al.name, a.name
        "#,
    )
    .fetch_all(pool)
    .await
}

// ============================================================================
// Directories
// ============================================================================

/// Insert a directory or update its mtime, returning its id.
pub async fn upsert_directory(pool: &SqlitePool, path: &str, mtime: i64) -> sqlx::Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO directories (path, mtime) VALUES (?, ?)
        ON CONFLICT(path) DO UPDATE SET mtime = excluded.mtime
        RETURNING id
        "#,
    )
    .bind(path)
    .bind(mtime)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub async fn get_directories(pool: &SqlitePool) -> sqlx::Result<Vec<StoredDirectory>> {
    sqlx::query_as::<_, StoredDirectory>("SELECT id, path, mtime FROM directories ORDER BY path")
        .fetch_all(pool)
        .await
}

/// Delete a directory and every track in it.
pub async fn delete_directory(pool: &SqlitePool, directory_id: i64) -> sqlx::Result<u64> {
    let mut tx = pool.begin().await?;
    let tracks = sqlx::query("DELETE FROM tracks WHERE directory_id = ?")
        .bind(directory_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM directories WHERE id = ?")
        .bind(directory_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(tracks)
}

// ============================================================================
// Tracks
// ============================================================================

const TRACK_TEXT_COLUMNS: &[&str] = &["title", "composer", "genre", "comment"];
const TRACK_VALUE_COLUMNS: &[&str] = &[
    "year",
    "track_number",
    "disc_number",
    "bpm",
    "bitrate",
    "length",
    "samplerate",
    "filesize",
    "filetype",
    "modified",
    "track_gain",
    "album_gain",
    "rating",
    "score",
    "playcount",
];

fn track_upsert_sql(mode: CommitMode) -> String {
    let columns: Vec<&str> = TRACK_TEXT_COLUMNS
        .iter()
        .chain(TRACK_VALUE_COLUMNS)
        .copied()
        .collect();
    let placeholders = vec!["?"; 5 + columns.len()].join(", ");

    let mut updates = vec![
        "path = excluded.path".to_string(),
        "directory_id = excluded.directory_id".to_string(),
        "album_id = excluded.album_id".to_string(),
    ];
    match mode {
        CommitMode::Overwrite => {
            updates.push("artist_id = excluded.artist_id".to_string());
            updates.extend(columns.iter().map(|c| format!("{c} = excluded.{c}")));
        }
        CommitMode::Merge => {
            updates.push("artist_id = COALESCE(excluded.artist_id, tracks.artist_id)".to_string());
            updates.extend(
                TRACK_TEXT_COLUMNS
                    .iter()
                    .map(|c| format!("{c} = COALESCE(NULLIF(excluded.{c}, ''), tracks.{c})")),
            );
            updates.extend(
                TRACK_VALUE_COLUMNS
                    .iter()
                    .map(|c| format!("{c} = COALESCE(excluded.{c}, tracks.{c})")),
            );
        }
    }

    format!(
        "INSERT INTO tracks (uid, path, directory_id, album_id, artist_id, {}) VALUES ({placeholders}) \
         ON CONFLICT(uid) DO UPDATE SET {} RETURNING id",
        columns.join(", "),
        updates.join(", ")
    )
}

static OVERWRITE_SQL: LazyLock<String> = LazyLock::new(|| track_upsert_sql(CommitMode::Overwrite));
static MERGE_SQL: LazyLock<String> = LazyLock::new(|| track_upsert_sql(CommitMode::Merge));

/// Insert or update a scanned track, matched by unique id.
///
/// A different track already stored at the same path is deleted first, so
/// a replaced file does not leave a stale row behind. A track whose file
/// moved keeps its row and id.
pub async fn commit_track(
    pool: &SqlitePool,
    track: &Track,
    directory_id: i64,
    album_id: Option<i64>,
    mode: CommitMode,
) -> sqlx::Result<i64> {
    let artist_id = if track.artist.is_empty() {
        None
    } else {
        Some(get_or_create_artist(pool, &track.artist).await?)
    };
    let path = path_text(&track.path);
    let sql = match mode {
        CommitMode::Overwrite => OVERWRITE_SQL.as_str(),
        CommitMode::Merge => MERGE_SQL.as_str(),
    };

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM tracks WHERE path = ? AND uid <> ?")
        .bind(&path)
        .bind(&track.unique_id)
        .execute(&mut *tx)
        .await?;

    let row: (i64,) = sqlx::query_as(sql)
        .bind(&track.unique_id)
        .bind(&path)
        .bind(directory_id)
        .bind(album_id)
        .bind(artist_id)
        .bind(&track.title)
        .bind(&track.composer)
        .bind(&track.genre)
        .bind(&track.comment)
        .bind(track.year)
        .bind(track.track_number)
        .bind(track.disc_number)
        .bind(track.bpm)
        .bind(track.bitrate)
        .bind(track.length)
        .bind(track.samplerate)
        .bind(track.filesize)
        .bind(track.filetype)
        .bind(track.modified)
        .bind(track.replay_gain.track_gain)
        .bind(track.replay_gain.album_gain)
        .bind(track.rating)
        .bind(track.score)
        .bind(track.playcount)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(row.0)
}

pub async fn get_tracks_in_directory(
    pool: &SqlitePool,
    directory_id: i64,
) -> sqlx::Result<Vec<StoredTrack>> {
    sqlx::query_as::<_, StoredTrack>("SELECT id, uid, path FROM tracks WHERE directory_id = ?")
        .bind(directory_id)
        .fetch_all(pool)
        .await
}

pub async fn delete_track(pool: &SqlitePool, track_id: i64) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM tracks WHERE id = ?")
        .bind(track_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_tracks(pool: &SqlitePool) -> sqlx::Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tracks")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

const TRACK_WITH_ALBUM_SELECT: &str = r#"
    SELECT
        t.id, t.uid, t.path, t.title,
        a.name AS artist_name,
        al.name AS album_name,
        aa.name AS album_artist,
        t.year, t.track_number
    FROM tracks t
    LEFT JOIN artists a ON t.artist_id = a.id
    LEFT JOIN albums al ON t.album_id = al.id
    LEFT JOIN artists aa ON al.artist_id = aa.id
"#;

/// Get all tracks with artist and album names, ordered by path.
pub async fn get_all_tracks_with_album(pool: &SqlitePool) -> sqlx::Result<Vec<TrackWithAlbum>> {
    sqlx::query_as::<_, TrackWithAlbum>(&format!("{TRACK_WITH_ALBUM_SELECT} ORDER BY t.path"))
        .fetch_all(pool)
        .await
}

pub async fn get_track_by_uid(pool: &SqlitePool, uid: &str) -> sqlx::Result<Option<TrackWithAlbum>> {
    sqlx::query_as::<_, TrackWithAlbum>(&format!("{TRACK_WITH_ALBUM_SELECT} WHERE t.uid = ?"))
        .bind(uid)
        .fetch_optional(pool)
        .await
}

// ============================================================================
// Playlists
// ============================================================================

pub async fn insert_playlist(pool: &SqlitePool, path: &str) -> sqlx::Result<()> {
    sqlx::query("INSERT OR IGNORE INTO playlists (path) VALUES (?)")
        .bind(path)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_playlists(pool: &SqlitePool) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT path FROM playlists ORDER BY path")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(p,)| p).collect())
}

// ============================================================================
// Synchronous adapter
// ============================================================================

/// The SQLite database behind the synchronous storage traits.
///
/// Calls block on `runtime`, so they must come from threads that are not
/// running inside it (such as the scanner job thread).
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    runtime: Handle,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl CollectionStorage for SqliteStorage {
    fn directory_id(&self, path: &Path, mtime: i64) -> Result<i64> {
        Ok(self.block_on(upsert_directory(&self.pool, &path_text(path), mtime))?)
    }

    fn stored_directories(&self) -> Result<Vec<StoredDirectory>> {
        Ok(self.block_on(get_directories(&self.pool))?)
    }

    fn remove_directory(&self, directory_id: i64) -> Result<()> {
        let tracks = self.block_on(delete_directory(&self.pool, directory_id))?;
        tracing::debug!(target: "db", directory_id, tracks, "Deleted directory");
        Ok(())
    }

    fn album_id(&self, name: &str, artist: &str) -> Result<i64> {
        let artist_id = if artist.is_empty() {
            None
        } else {
            Some(self.block_on(get_or_create_artist(&self.pool, artist))?)
        };
        Ok(self.block_on(get_or_create_album(&self.pool, name, artist_id))?)
    }

    fn set_album_cover(&self, album_id: i64, cover: &Path, replace: bool) -> Result<()> {
        Ok(self.block_on(set_album_cover(&self.pool, album_id, &path_text(cover), replace))?)
    }

    fn commit_track(
        &self,
        track: &Track,
        directory_id: i64,
        album_id: Option<i64>,
        mode: CommitMode,
    ) -> Result<i64> {
        Ok(self.block_on(commit_track(&self.pool, track, directory_id, album_id, mode))?)
    }

    fn tracks_in_directory(&self, directory_id: i64) -> Result<Vec<StoredTrack>> {
        Ok(self.block_on(get_tracks_in_directory(&self.pool, directory_id))?)
    }

    fn remove_track(&self, track_id: i64) -> Result<()> {
        Ok(self.block_on(delete_track(&self.pool, track_id))?)
    }
}

impl PlaylistImporter for SqliteStorage {
    fn import_playlist(&self, path: &Path) -> Result<()> {
        Ok(self.block_on(insert_playlist(&self.pool, &path_text(path)))?)
    }
}

impl DirectoryTimes for SqliteStorage {
    fn known_directories(&self) -> Vec<(PathBuf, i64)> {
        match self.block_on(get_directories(&self.pool)) {
            Ok(dirs) => dirs
                .into_iter()
                .map(|d| (PathBuf::from(d.path), d.mtime))
                .collect(),
            Err(e) => {
                tracing::error!(target: "db", error = %e, "Failed to load directory times");
                Vec::new()
            }
        }
    }
}
