//! Relational adapter on SQLite
//!
//! ## Schema
//!
//! ```text
//! "<project>"          xid INTEGER PK AUTOINCREMENT, id, name, host, platform,
//!                      "user", time, progress, last_error  TEXT
//!                      tags   TEXT (JSON array)
//!                      extra  TEXT (JSON object, every other metadata key)
//!
//! "<project>_bundles"  bid INTEGER PK AUTOINCREMENT, xid -> "<project>",
//!                      id, bundle_type, time  TEXT, UNIQUE (xid, id)
//!                      metadata, data, files  TEXT (JSON)
//! ```
//!
//! The project name is reduced to word characters before it becomes a
//! table name. Experiment ids are the `xid` row keys rendered as strings.
//!
//! String equality on a known column is pushed down into the `WHERE`
//! clause; every candidate row is then checked with the pattern matcher,
//! so results are identical to a brute-force scan.

use std::fs;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};

use super::{experiment_view, with_reconnect, Reconnect, StorageAdapter};
use crate::bundle::{Bundle, Metadata, WireBundle, BUNDLE_TYPE_KEY, ID_KEY, TIME_KEY};
use crate::config::Config;
use crate::pattern::matches;
use crate::{Error, Result};

/// Database file used when `storage_server` is unset, inside `data_dir`.
pub const DEFAULT_DATABASE: &str = "protos.sqlite";

/// Experiment metadata keys with their own text column.
const STRING_COLUMNS: [&str; 8] = [
    "id",
    "name",
    "host",
    "platform",
    "user",
    "time",
    "progress",
    "last_error",
];

const TAGS_COLUMN: &str = "tags";

/// Bundle metadata keys with their own text column.
const BUNDLE_COLUMNS: [&str; 3] = [ID_KEY, BUNDLE_TYPE_KEY, TIME_KEY];

/// Strip every non-word character (anything but letters, digits, `_`).
///
/// ```rust
/// use protos_db::storage::sanitize_identifier;
///
/// assert_eq!(sanitize_identifier("my-project; DROP TABLE x"), "myprojectDROPTABLEx");
/// ```
#[must_use]
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

#[derive(Debug, Clone)]
struct Tables {
    experiments: String,
    bundles: String,
}

impl Tables {
    fn for_project(project: &str) -> Result<Self> {
        let base = sanitize_identifier(project);
        if base.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "project name '{project}' has no usable characters for a table name"
            )));
        }
        Ok(Self {
            experiments: format!("\"{base}\""),
            bundles: format!("\"{base}_bundles\""),
        })
    }

    fn schema(&self) -> String {
        format!(
            r#"CREATE TABLE IF NOT EXISTS {experiments} (
                xid INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT,
                name TEXT,
                host TEXT,
                platform TEXT,
                "user" TEXT,
                time TEXT,
                progress TEXT,
                last_error TEXT,
                tags TEXT,
                extra TEXT NOT NULL DEFAULT '{{}}'
            );
            CREATE TABLE IF NOT EXISTS {bundles} (
                bid INTEGER PRIMARY KEY AUTOINCREMENT,
                xid INTEGER NOT NULL REFERENCES {experiments}(xid) ON DELETE CASCADE,
                id TEXT NOT NULL,
                bundle_type TEXT NOT NULL,
                time TEXT,
                metadata TEXT NOT NULL,
                data TEXT NOT NULL,
                files TEXT NOT NULL,
                UNIQUE (xid, id)
            );"#,
            experiments = self.experiments,
            bundles = self.bundles,
        )
    }
}

/// Connection that can be dropped and re-opened.
#[derive(Debug)]
struct Session {
    path: String,
    tables: Tables,
    conn: Option<Connection>,
}

impl Session {
    fn open(path: String, tables: Tables) -> Result<Self> {
        let conn = Self::connect(&path, &tables)?;
        Ok(Self {
            path,
            tables,
            conn: Some(conn),
        })
    }

    fn connect(path: &str, tables: &Tables) -> Result<Connection> {
        debug!(database = path, "opening sqlite connection");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(&tables.schema())?;
        Ok(conn)
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::ConnectionLost(format!("no open connection to '{}'", self.path)))
    }

    fn experiment_exists(&self, xid: i64) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE xid = ?1", self.tables.experiments);
        Ok(self
            .conn()?
            .query_row(&sql, params![xid], |_| Ok(()))
            .optional()?
            .is_some())
    }
}

impl Reconnect for Session {
    fn is_alive(&mut self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.conn = None;
        self.conn = Some(Self::connect(&self.path, &self.tables)?);
        info!(database = %self.path, "reconnected to sqlite database");
        Ok(())
    }
}

/// Experiment metadata split into table columns.
#[derive(Debug, Default)]
struct MetadataRow {
    strings: [Option<String>; 8],
    tags: Option<String>,
    extra: String,
}

impl MetadataRow {
    fn from_metadata(metadata: &Metadata) -> Result<Self> {
        let mut row = Self::default();
        let mut extra = Metadata::new();
        for (key, value) in metadata {
            let column = STRING_COLUMNS.iter().position(|c| c == key);
            match (column, value) {
                (Some(i), Value::String(text)) => row.strings[i] = Some(text.clone()),
                (None, Value::Array(_)) if key == TAGS_COLUMN => {
                    row.tags = Some(serde_json::to_string(value)?);
                }
                _ => {
                    extra.insert(key.clone(), value.clone());
                }
            }
        }
        row.extra = serde_json::to_string(&extra)?;
        Ok(row)
    }

    fn from_sql(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        let mut strings: [Option<String>; 8] = Default::default();
        for (i, slot) in strings.iter_mut().enumerate() {
            *slot = row.get(offset + i)?;
        }
        Ok(Self {
            strings,
            tags: row.get(offset + 8)?,
            extra: row.get::<_, Option<String>>(offset + 9)?.unwrap_or_default(),
        })
    }

    fn into_metadata(self) -> Result<Metadata> {
        let mut metadata: Metadata = if self.extra.is_empty() {
            Metadata::new()
        } else {
            serde_json::from_str(&self.extra)
                .map_err(|err| Error::Corrupted(format!("extra metadata column: {err}")))?
        };
        for (column, value) in STRING_COLUMNS.iter().zip(self.strings) {
            if let Some(text) = value {
                metadata.insert((*column).to_string(), Value::String(text));
            }
        }
        if let Some(tags) = self.tags {
            let tags: Value = serde_json::from_str(&tags)
                .map_err(|err| Error::Corrupted(format!("tags column: {err}")))?;
            metadata.insert(TAGS_COLUMN.to_string(), tags);
        }
        Ok(metadata)
    }
}

fn column_list() -> String {
    STRING_COLUMNS
        .iter()
        .map(|c| format!("\"{c}\""))
        .chain([TAGS_COLUMN.to_string(), "extra".to_string()])
        .collect::<Vec<_>>()
        .join(", ")
}

/// `"col" = ?n` clauses for string values of pushable keys in `pattern`.
fn pushdown(pattern: Option<&Value>, columns: &[&str], first_param: usize) -> (String, Vec<SqlValue>) {
    let mut clauses = String::new();
    let mut values = Vec::new();
    if let Some(fields) = pattern.and_then(Value::as_object) {
        for column in columns {
            if let Some(Value::String(text)) = fields.get(*column) {
                clauses.push_str(&format!(" AND \"{column}\" = ?{}", first_param + values.len()));
                values.push(SqlValue::Text(text.clone()));
            }
        }
    }
    (clauses, values)
}

fn parse_xid(xid: &str) -> Result<i64> {
    xid.parse()
        .map_err(|_| Error::NotFound(format!("experiment '{xid}'")))
}

/// Experiments and bundles in two tables of a SQLite database.
#[derive(Debug)]
pub struct RelationalStore {
    session: Session,
}

impl RelationalStore {
    /// Open the database at `path` (`":memory:"` for a private in-memory
    /// database) and create the project's tables if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unusable project name and
    /// [`Error::StorageFatal`] if the database cannot be opened.
    pub fn open(path: impl Into<String>, project: &str) -> Result<Self> {
        let path = path.into();
        let tables = Tables::for_project(project)?;
        let session = Session::open(path.clone(), tables)
            .map_err(|err| Error::StorageFatal(format!("open '{path}': {err}")))?;
        Ok(Self { session })
    }

    /// Open `storage_server`, or `<data_dir>/protos.sqlite` if unset.
    ///
    /// `data_dir` is canonicalized, so a relative directory keeps naming
    /// the same file after the working directory changes.
    ///
    /// # Errors
    ///
    /// See [`RelationalStore::open`].
    pub fn from_config(config: &Config) -> Result<Self> {
        let path = match &config.storage_server {
            Some(server) => server.clone(),
            None => {
                fs::create_dir_all(&config.data_dir)?;
                let data_dir = fs::canonicalize(&config.data_dir)?;
                data_dir.join(DEFAULT_DATABASE).to_string_lossy().into_owned()
            }
        };
        Self::open(path, &config.project_name)
    }

    /// Database path this store connects to.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.session.path
    }

    /// Close the connection; the next operation reconnects.
    pub fn close(&mut self) {
        self.session.conn = None;
    }
}

impl StorageAdapter for RelationalStore {
    fn name(&self) -> &'static str {
        "relational"
    }

    fn create_experiment_id(&mut self, name: &str) -> Result<String> {
        with_reconnect(&mut self.session, "create_experiment_id", |session| {
            let table = &session.tables.experiments;
            let tx = session.conn()?.unchecked_transaction()?;
            tx.execute(&format!("INSERT INTO {table} (name) VALUES (?1)"), params![name])?;
            let xid = tx.last_insert_rowid();
            tx.execute(
                &format!("UPDATE {table} SET id = ?1 WHERE xid = ?2"),
                params![xid.to_string(), xid],
            )?;
            tx.commit()?;
            Ok(xid.to_string())
        })
    }

    fn write_experiment_metadata(&mut self, metadata: &Metadata, xid: &str) -> Result<()> {
        let key = parse_xid(xid)?;
        let row = MetadataRow::from_metadata(metadata)?;
        let changed = with_reconnect(&mut self.session, "write_experiment_metadata", |session| {
            let [id, name, host, platform, user, time, progress, last_error] = &row.strings;
            let sql = format!(
                r#"UPDATE {} SET id = ?1, name = ?2, host = ?3, platform = ?4, "user" = ?5,
                   time = ?6, progress = ?7, last_error = ?8, tags = ?9, extra = ?10
                   WHERE xid = ?11"#,
                session.tables.experiments
            );
            Ok(session.conn()?.execute(
                &sql,
                params![
                    id, name, host, platform, user, time, progress, last_error, row.tags,
                    row.extra, key
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(Error::NotFound(format!("experiment '{xid}'")));
        }
        Ok(())
    }

    fn read_experiment_metadata(&mut self, xid: &str) -> Result<Metadata> {
        let key = parse_xid(xid)?;
        let row = with_reconnect(&mut self.session, "read_experiment_metadata", |session| {
            let sql = format!(
                "SELECT {} FROM {} WHERE xid = ?1",
                column_list(),
                session.tables.experiments
            );
            Ok(session
                .conn()?
                .query_row(&sql, params![key], |row| MetadataRow::from_sql(row, 0))
                .optional()?)
        })?;
        row.ok_or_else(|| Error::NotFound(format!("experiment '{xid}'")))?
            .into_metadata()
    }

    fn find_experiments(&mut self, pattern: &Value) -> Result<Vec<String>> {
        let (clauses, values) = pushdown(pattern.get("metadata"), &STRING_COLUMNS, 1);
        let rows = with_reconnect(&mut self.session, "find_experiments", |session| {
            let sql = format!(
                "SELECT xid, {} FROM {} WHERE 1 = 1{clauses} ORDER BY xid",
                column_list(),
                session.tables.experiments
            );
            debug!(%sql, "find_experiments");
            let conn = session.conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get::<_, i64>(0)?, MetadataRow::from_sql(row, 1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut found = Vec::new();
        for (xid, row) in rows {
            if matches(pattern, &experiment_view(&row.into_metadata()?)) {
                found.push(xid.to_string());
            }
        }
        Ok(found)
    }

    fn write_bundle(&mut self, bundle: &Bundle, xid: &str) -> Result<()> {
        bundle.validate()?;
        let key = parse_xid(xid)?;
        let wire = bundle.externalize();
        let time = wire.metadata.get(TIME_KEY).and_then(Value::as_str).map(str::to_string);
        let metadata = serde_json::to_string(&wire.metadata)?;
        let data = serde_json::to_string(&wire.data)?;
        let files = serde_json::to_string(&wire.files)?;

        with_reconnect(&mut self.session, "write_bundle", |session| {
            if !session.experiment_exists(key)? {
                return Err(Error::NotFound(format!("experiment '{xid}'")));
            }
            let sql = format!(
                "INSERT INTO {} (xid, id, bundle_type, time, metadata, data, files)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                session.tables.bundles
            );
            let inserted = session.conn()?.execute(
                &sql,
                params![key, bundle.id(), bundle.bundle_type(), time, metadata, data, files],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(failure, _))
                    if failure.code == ErrorCode::ConstraintViolation =>
                {
                    Err(Error::Storage(format!(
                        "bundle '{}' already written to experiment '{xid}'",
                        bundle.id()
                    )))
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    fn find_bundles(&mut self, pattern: &Value, xid: &str) -> Result<Vec<Bundle>> {
        let key = parse_xid(xid)?;
        let (clauses, mut values) = pushdown(pattern.get("metadata"), &BUNDLE_COLUMNS, 2);
        values.insert(0, SqlValue::Integer(key));

        let rows = with_reconnect(&mut self.session, "find_bundles", |session| {
            if !session.experiment_exists(key)? {
                return Err(Error::NotFound(format!("experiment '{xid}'")));
            }
            let sql = format!(
                "SELECT metadata, data, files FROM {} WHERE xid = ?1{clauses} ORDER BY bid",
                session.tables.bundles
            );
            debug!(%sql, "find_bundles");
            let conn = session.conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut found = Vec::new();
        for (metadata, data, files) in rows {
            let wire = WireBundle {
                data: serde_json::from_str(&data)?,
                metadata: serde_json::from_str(&metadata)?,
                files: serde_json::from_str(&files)?,
            };
            if matches(pattern, &wire.to_value()?) {
                found.push(Bundle::internalize(wire)?);
            }
        }
        Ok(found)
    }

    fn delete_experiment(&mut self, xid: &str) -> Result<()> {
        let key = parse_xid(xid)?;
        let removed = with_reconnect(&mut self.session, "delete_experiment", |session| {
            let tx = session.conn()?.unchecked_transaction()?;
            tx.execute(
                &format!("DELETE FROM {} WHERE xid = ?1", session.tables.bundles),
                params![key],
            )?;
            let removed = tx.execute(
                &format!("DELETE FROM {} WHERE xid = ?1", session.tables.experiments),
                params![key],
            )?;
            tx.commit()?;
            Ok(removed)
        })?;
        if removed == 0 {
            return Err(Error::NotFound(format!("experiment '{xid}'")));
        }
        Ok(())
    }
}
