use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use futures::FutureExt;
use rusqlite::{params, OptionalExtension, Row};
use tokio::sync::watch;
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{DatasetRecord, FilterListRecord, NewFilterList, Site};

use super::schema::SCHEMA;

const SITE_COLUMNS: &str = "hostname, last_sync, active, api_key, notes";

const DATASET_COLUMNS: &str =
    "id, created_at, updated_at, payload_ref, description, enabled, kind, source_site, frontend_link";

const FILTER_LIST_COLUMNS: &str = "id, name, category, serialized_data, is_default, owner_id";

const UPSERT_SITE: &str = r#"INSERT INTO sites (hostname, last_sync, active, api_key, notes)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT(hostname) DO UPDATE SET
        last_sync = excluded.last_sync,
        active = excluded.active,
        api_key = excluded.api_key,
        notes = excluded.notes"#;

const UPSERT_DATASET: &str = r#"INSERT INTO datasets
        (id, created_at, updated_at, payload_ref, description, enabled, kind, source_site, frontend_link)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(id) DO UPDATE SET
        created_at = excluded.created_at,
        updated_at = excluded.updated_at,
        payload_ref = excluded.payload_ref,
        description = excluded.description,
        enabled = excluded.enabled,
        kind = excluded.kind,
        source_site = excluded.source_site,
        frontend_link = excluded.frontend_link"#;

const UPSERT_FILTER_LIST: &str = r#"INSERT INTO filter_lists
        (id, name, category, serialized_data, is_default, owner_id)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT(id) DO UPDATE SET
        name = excluded.name,
        category = excluded.category,
        serialized_data = excluded.serialized_data,
        is_default = excluded.is_default,
        owner_id = excluded.owner_id"#;

#[derive(Debug, Clone, Copy)]
enum Table {
    Sites,
    Datasets,
    FilterLists,
}

/// One version counter per table, bumped after every committed write.
struct Changes {
    sites: watch::Sender<u64>,
    active_site: watch::Sender<Option<Site>>,
    datasets: watch::Sender<u64>,
    filter_lists: watch::Sender<u64>,
}

impl Changes {
    fn new() -> Self {
        Self {
            sites: watch::channel(0).0,
            active_site: watch::channel(None).0,
            datasets: watch::channel(0).0,
            filter_lists: watch::channel(0).0,
        }
    }

    fn sender(&self, table: Table) -> &watch::Sender<u64> {
        match table {
            Table::Sites => &self.sites,
            Table::Datasets => &self.datasets,
            Table::FilterLists => &self.filter_lists,
        }
    }

    fn bump(&self, table: Table) {
        self.sender(table).send_modify(|version| *version = version.wrapping_add(1));
    }

    fn subscribe(&self, table: Table) -> watch::Receiver<u64> {
        self.sender(table).subscribe()
    }

    /// Re-reads the active site on the connection that just wrote, so the
    /// published value is ordered with the writes themselves.
    fn publish_active(&self, conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        let active = active_site_in(conn)?;
        self.active_site.send_replace(active);
        Ok(())
    }
}

/// Local relational cache of sites, datasets and filter lists.
///
/// Cheap to clone; clones share the connection and change notifications.
#[derive(Clone)]
pub struct Repository {
    conn: Connection,
    changes: Arc<Changes>,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        let changes = Arc::new(Changes::new());
        let published = changes.clone();
        conn.call(move |conn| {
            conn.execute_batch(SCHEMA)?;
            published.publish_active(conn)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, changes })
    }

    /// The site currently flagged active, kept current by every write to
    /// the sites table.
    pub fn watch_active_site(&self) -> watch::Receiver<Option<Site>> {
        self.changes.active_site.subscribe()
    }

    /// Push-based view of a table: emits the current rows immediately, then
    /// a fresh snapshot after every write to that table.
    fn observe<T, F>(&self, table: Table, load: F) -> impl Stream<Item = Result<Vec<T>>> + Send + 'static
    where
        T: Send + 'static,
        F: Fn(Repository) -> BoxFuture<'static, Result<Vec<T>>> + Send + 'static,
    {
        let rx = self.changes.subscribe(table);
        let repo = self.clone();
        stream::unfold((repo, rx, load, true), |(repo, mut rx, load, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = load(repo.clone()).await;
            Some((snapshot, (repo, rx, load, false)))
        })
    }

    // Site operations

    pub fn observe_sites(&self) -> impl Stream<Item = Result<Vec<Site>>> + Send + 'static {
        self.observe(Table::Sites, |repo| {
            async move { repo.get_all_sites().await }.boxed()
        })
    }

    pub async fn get_all_sites(&self) -> Result<Vec<Site>> {
        let sites = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM sites ORDER BY hostname",
                    SITE_COLUMNS
                ))?;
                let sites = stmt
                    .query_map([], site_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(sites)
            })
            .await?;
        Ok(sites)
    }

    pub async fn get_site(&self, hostname: &str) -> Result<Option<Site>> {
        let hostname = hostname.to_string();
        let site = self
            .conn
            .call(move |conn| {
                let site = conn
                    .query_row(
                        &format!("SELECT {} FROM sites WHERE hostname = ?1", SITE_COLUMNS),
                        params![hostname],
                        site_from_row,
                    )
                    .optional()?;
                Ok(site)
            })
            .await?;
        Ok(site)
    }

    pub async fn get_active_site(&self) -> Result<Option<Site>> {
        let site = self
            .conn
            .call(|conn| Ok(active_site_in(conn)?))
            .await?;
        Ok(site)
    }

    pub async fn upsert_site(&self, site: Site) -> Result<()> {
        self.upsert_sites(vec![site]).await
    }

    pub async fn upsert_sites(&self, sites: Vec<Site>) -> Result<()> {
        let changes = self.changes.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(UPSERT_SITE)?;
                    for site in &sites {
                        stmt.execute(params![
                            site.hostname,
                            site.last_sync.map(|dt| dt.to_rfc3339()),
                            site.active,
                            site.api_key,
                            site.notes,
                        ])?;
                    }
                }
                tx.commit()?;
                changes.publish_active(conn)?;
                Ok(())
            })
            .await
            .map_err(write_error)?;
        self.changes.bump(Table::Sites);
        Ok(())
    }

    pub async fn update_site(&self, site: Site) -> Result<bool> {
        let changes = self.changes.clone();
        let updated = self
            .conn
            .call(move |conn| {
                let rows = conn.execute(
                    "UPDATE sites SET last_sync = ?2, active = ?3, api_key = ?4, notes = ?5 WHERE hostname = ?1",
                    params![
                        site.hostname,
                        site.last_sync.map(|dt| dt.to_rfc3339()),
                        site.active,
                        site.api_key,
                        site.notes,
                    ],
                )?;
                changes.publish_active(conn)?;
                Ok(rows > 0)
            })
            .await
            .map_err(write_error)?;
        if updated {
            self.changes.bump(Table::Sites);
        }
        Ok(updated)
    }

    pub async fn set_site_api_key(&self, hostname: &str, api_key: Option<String>) -> Result<bool> {
        let hostname = hostname.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let rows = conn.execute(
                    "UPDATE sites SET api_key = ?2 WHERE hostname = ?1",
                    params![hostname, api_key],
                )?;
                Ok(rows > 0)
            })
            .await?;
        if updated {
            self.changes.bump(Table::Sites);
        }
        Ok(updated)
    }

    pub async fn touch_site_sync(&self, hostname: &str, at: DateTime<Utc>) -> Result<bool> {
        let hostname = hostname.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let rows = conn.execute(
                    "UPDATE sites SET last_sync = ?2 WHERE hostname = ?1",
                    params![hostname, at.to_rfc3339()],
                )?;
                Ok(rows > 0)
            })
            .await?;
        if updated {
            self.changes.bump(Table::Sites);
        }
        Ok(updated)
    }

    /// Clears every `active` flag and sets the one for `hostname`, in one
    /// transaction. An unknown hostname leaves all flags untouched.
    pub async fn activate_site(&self, hostname: &str) -> Result<()> {
        let host = hostname.to_string();
        let changes = self.changes.clone();
        let found = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sites WHERE hostname = ?1)",
                    params![host],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Ok(false);
                }
                tx.execute("UPDATE sites SET active = 0 WHERE active <> 0", [])?;
                tx.execute("UPDATE sites SET active = 1 WHERE hostname = ?1", params![host])?;
                tx.commit()?;
                changes.publish_active(conn)?;
                Ok(true)
            })
            .await?;

        if !found {
            return Err(AppError::NotFound(format!("site {}", hostname)));
        }
        self.changes.bump(Table::Sites);
        Ok(())
    }

    /// Removes a site and, through the foreign key, every dataset sourced
    /// from it.
    pub async fn delete_site(&self, hostname: &str) -> Result<bool> {
        let hostname = hostname.to_string();
        let changes = self.changes.clone();
        let deleted = self
            .conn
            .call(move |conn| {
                let rows = conn.execute("DELETE FROM sites WHERE hostname = ?1", params![hostname])?;
                changes.publish_active(conn)?;
                Ok(rows > 0)
            })
            .await?;
        if deleted {
            self.changes.bump(Table::Sites);
            self.changes.bump(Table::Datasets);
        }
        Ok(deleted)
    }

    // Dataset operations

    pub fn observe_datasets(&self) -> impl Stream<Item = Result<Vec<DatasetRecord>>> + Send + 'static {
        self.observe(Table::Datasets, |repo| {
            async move { repo.get_all_datasets().await }.boxed()
        })
    }

    pub async fn get_all_datasets(&self) -> Result<Vec<DatasetRecord>> {
        let datasets = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM datasets ORDER BY updated_at DESC, id",
                    DATASET_COLUMNS
                ))?;
                let datasets = stmt
                    .query_map([], dataset_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(datasets)
            })
            .await?;
        Ok(datasets)
    }

    pub async fn get_datasets_for_site(&self, hostname: &str) -> Result<Vec<DatasetRecord>> {
        let hostname = hostname.to_string();
        let datasets = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM datasets WHERE source_site = ?1 ORDER BY updated_at DESC, id",
                    DATASET_COLUMNS
                ))?;
                let datasets = stmt
                    .query_map(params![hostname], dataset_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(datasets)
            })
            .await?;
        Ok(datasets)
    }

    pub async fn get_dataset(&self, id: &str) -> Result<Option<DatasetRecord>> {
        let id = id.to_string();
        let dataset = self
            .conn
            .call(move |conn| {
                let dataset = conn
                    .query_row(
                        &format!("SELECT {} FROM datasets WHERE id = ?1", DATASET_COLUMNS),
                        params![id],
                        dataset_from_row,
                    )
                    .optional()?;
                Ok(dataset)
            })
            .await?;
        Ok(dataset)
    }

    pub async fn upsert_dataset(&self, dataset: DatasetRecord) -> Result<()> {
        self.upsert_datasets(vec![dataset]).await.map(|_| ())
    }

    /// Writes the whole batch in one transaction: either every record is
    /// visible afterwards or none is.
    pub async fn upsert_datasets(&self, datasets: Vec<DatasetRecord>) -> Result<usize> {
        let count = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(UPSERT_DATASET)?;
                    for dataset in &datasets {
                        stmt.execute(params![
                            dataset.id,
                            dataset.created_at.to_rfc3339(),
                            dataset.updated_at.to_rfc3339(),
                            dataset.payload_ref,
                            dataset.description,
                            dataset.enabled,
                            dataset.kind,
                            dataset.source_site,
                            dataset.frontend_link,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(datasets.len())
            })
            .await
            .map_err(write_error)?;
        self.changes.bump(Table::Datasets);
        Ok(count)
    }

    pub async fn update_dataset(&self, dataset: DatasetRecord) -> Result<bool> {
        let updated = self
            .conn
            .call(move |conn| {
                let rows = conn.execute(
                    r#"UPDATE datasets SET
                           created_at = ?2, updated_at = ?3, payload_ref = ?4, description = ?5,
                           enabled = ?6, kind = ?7, source_site = ?8, frontend_link = ?9
                       WHERE id = ?1"#,
                    params![
                        dataset.id,
                        dataset.created_at.to_rfc3339(),
                        dataset.updated_at.to_rfc3339(),
                        dataset.payload_ref,
                        dataset.description,
                        dataset.enabled,
                        dataset.kind,
                        dataset.source_site,
                        dataset.frontend_link,
                    ],
                )?;
                Ok(rows > 0)
            })
            .await
            .map_err(write_error)?;
        if updated {
            self.changes.bump(Table::Datasets);
        }
        Ok(updated)
    }

    pub async fn delete_dataset(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                let rows = conn.execute("DELETE FROM datasets WHERE id = ?1", params![id])?;
                Ok(rows > 0)
            })
            .await?;
        if deleted {
            self.changes.bump(Table::Datasets);
        }
        Ok(deleted)
    }

    // Filter list operations

    pub fn observe_filter_lists(
        &self,
    ) -> impl Stream<Item = Result<Vec<FilterListRecord>>> + Send + 'static {
        self.observe(Table::FilterLists, |repo| {
            async move { repo.get_all_filter_lists().await }.boxed()
        })
    }

    pub async fn get_all_filter_lists(&self) -> Result<Vec<FilterListRecord>> {
        let lists = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM filter_lists ORDER BY category, name",
                    FILTER_LIST_COLUMNS
                ))?;
                let lists = stmt
                    .query_map([], filter_list_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(lists)
            })
            .await?;
        Ok(lists)
    }

    pub async fn get_filter_lists_by_category(&self, category: &str) -> Result<Vec<FilterListRecord>> {
        let category = category.to_string();
        let lists = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM filter_lists WHERE category = ?1 ORDER BY name",
                    FILTER_LIST_COLUMNS
                ))?;
                let lists = stmt
                    .query_map(params![category], filter_list_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(lists)
            })
            .await?;
        Ok(lists)
    }

    pub async fn get_filter_list(&self, id: i64) -> Result<Option<FilterListRecord>> {
        let list = self
            .conn
            .call(move |conn| {
                let list = conn
                    .query_row(
                        &format!("SELECT {} FROM filter_lists WHERE id = ?1", FILTER_LIST_COLUMNS),
                        params![id],
                        filter_list_from_row,
                    )
                    .optional()?;
                Ok(list)
            })
            .await?;
        Ok(list)
    }

    /// Inserts a list and returns the id the cache assigned to it.
    pub async fn insert_filter_list(&self, list: NewFilterList) -> Result<i64> {
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO filter_lists (name, category, serialized_data, is_default, owner_id) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![list.name, list.category, list.serialized_data, list.is_default, list.owner_id],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.changes.bump(Table::FilterLists);
        Ok(id)
    }

    pub async fn upsert_filter_list(&self, list: FilterListRecord) -> Result<()> {
        self.upsert_filter_lists(vec![list]).await.map(|_| ())
    }

    pub async fn upsert_filter_lists(&self, lists: Vec<FilterListRecord>) -> Result<usize> {
        let count = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(UPSERT_FILTER_LIST)?;
                    for list in &lists {
                        stmt.execute(params![
                            list.id,
                            list.name,
                            list.category,
                            list.serialized_data,
                            list.is_default,
                            list.owner_id,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(lists.len())
            })
            .await
            .map_err(write_error)?;
        self.changes.bump(Table::FilterLists);
        Ok(count)
    }

    pub async fn update_filter_list(&self, list: FilterListRecord) -> Result<bool> {
        let updated = self
            .conn
            .call(move |conn| {
                let rows = conn.execute(
                    "UPDATE filter_lists SET name = ?2, category = ?3, serialized_data = ?4, is_default = ?5, owner_id = ?6 WHERE id = ?1",
                    params![
                        list.id,
                        list.name,
                        list.category,
                        list.serialized_data,
                        list.is_default,
                        list.owner_id,
                    ],
                )?;
                Ok(rows > 0)
            })
            .await?;
        if updated {
            self.changes.bump(Table::FilterLists);
        }
        Ok(updated)
    }

    pub async fn delete_filter_list(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .call(move |conn| {
                let rows = conn.execute("DELETE FROM filter_lists WHERE id = ?1", params![id])?;
                Ok(rows > 0)
            })
            .await?;
        if deleted {
            self.changes.bump(Table::FilterLists);
        }
        Ok(deleted)
    }
}

/// Surfaces foreign-key violations as integrity errors instead of a generic
/// database failure.
fn write_error(err: tokio_rusqlite::Error) -> AppError {
    if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(code, message)) = &err {
        if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
            return AppError::Integrity(
                message
                    .clone()
                    .unwrap_or_else(|| "FOREIGN KEY constraint failed".to_string()),
            );
        }
    }
    AppError::Database(err)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // SQLite datetime('now') format
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn active_site_in(conn: &rusqlite::Connection) -> rusqlite::Result<Option<Site>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM sites WHERE active <> 0 ORDER BY hostname LIMIT 1",
            SITE_COLUMNS
        ),
        [],
        site_from_row,
    )
    .optional()
}

fn site_from_row(row: &Row) -> rusqlite::Result<Site> {
    Ok(Site {
        hostname: row.get(0)?,
        last_sync: row
            .get::<_, Option<String>>(1)?
            .and_then(|s| parse_datetime(&s)),
        active: row.get::<_, i64>(2)? != 0,
        api_key: row.get(3)?,
        notes: row.get(4)?,
    })
}

fn dataset_from_row(row: &Row) -> rusqlite::Result<DatasetRecord> {
    Ok(DatasetRecord {
        id: row.get(0)?,
        created_at: row
            .get::<_, String>(1)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        updated_at: row
            .get::<_, String>(2)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
        payload_ref: row.get(3)?,
        description: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        kind: row.get(6)?,
        source_site: row.get(7)?,
        frontend_link: row.get(8)?,
    })
}

fn filter_list_from_row(row: &Row) -> rusqlite::Result<FilterListRecord> {
    Ok(FilterListRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        serialized_data: row.get(3)?,
        is_default: row.get::<_, i64>(4)? != 0,
        owner_id: row.get(5)?,
    })
}
