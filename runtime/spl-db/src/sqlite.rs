//! Engine connections: one rusqlite connection plus its GeoJSON buffer and
//! the result view of its last statement.

use crate::config::SplOptions;
use crate::error::{Error, Result};
use crate::geometry::GeoJsonBuffer;
use crate::marshal;
use crate::result::ResultView;
use crate::value::Value;
use crate::vfs::Vfs;
use bytes::Bytes;
use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags, ffi};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const BUSY_TIMEOUT_MS: u64 = 100;
const MEMORY: &str = ":memory:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    Closed,
}

/// What a connection is opened from.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Source {
    #[default]
    Memory,
    Path(String),
    /// A serialized database image, loaded into memory.
    Bytes(Bytes),
}

impl Source {
    pub fn from_argument(argument: Option<&Value>) -> Result<Self> {
        match argument {
            None | Some(Value::Null) => Ok(Source::Memory),
            Some(Value::Text(path)) if path.is_empty() || path == MEMORY => Ok(Source::Memory),
            Some(Value::Text(path)) => Ok(Source::Path(path.clone())),
            Some(Value::Blob(image)) => Ok(Source::Bytes(image.clone())),
            Some(_) => Err(Error::invalid_argument(
                "db",
                0,
                "nothing, a path or a database image",
            )),
        }
    }

    pub fn into_argument(self) -> Value {
        match self {
            Source::Memory => Value::Null,
            Source::Path(path) => Value::Text(path),
            Source::Bytes(image) => Value::Blob(image),
        }
    }
}

impl From<&str> for Source {
    fn from(path: &str) -> Self {
        if path.is_empty() || path == MEMORY {
            Source::Memory
        } else {
            Source::Path(path.to_string())
        }
    }
}

impl From<String> for Source {
    fn from(path: String) -> Self {
        Source::from(path.as_str())
    }
}

impl From<Bytes> for Source {
    fn from(image: Bytes) -> Self {
        Source::Bytes(image)
    }
}

impl From<Vec<u8>> for Source {
    fn from(image: Vec<u8>) -> Self {
        Source::Bytes(Bytes::from(image))
    }
}

pub struct EngineConnection {
    state: ConnectionState,
    conn: Option<Connection>,
    geojson: GeoJsonBuffer,
    options: SplOptions,
    result: ResultView,
}

fn open_file(path: &Path, flags: OpenFlags) -> Result<Connection> {
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

/// Copies every page in one step, retrying while either side is busy for
/// up to the busy timeout.
fn copy_database(from: &Connection, to: &mut Connection) -> Result<()> {
    let backup = Backup::new(from, to)?;
    let deadline = Instant::now() + Duration::from_millis(BUSY_TIMEOUT_MS);
    loop {
        match backup.step(-1)? {
            StepResult::Done => return Ok(()),
            StepResult::More => {}
            _ if Instant::now() < deadline => thread::sleep(Duration::from_millis(1)),
            _ => {
                return Err(Error::Engine(rusqlite::Error::SqliteFailure(
                    ffi::Error::new(ffi::SQLITE_BUSY),
                    Some("database is locked".to_string()),
                )));
            }
        }
    }
}

impl EngineConnection {
    pub fn open(source: Source, options: SplOptions, vfs: &Vfs) -> Result<Self> {
        let mut connection = Self {
            state: ConnectionState::Opening,
            conn: None,
            geojson: GeoJsonBuffer::new(),
            options,
            result: ResultView::default(),
        };
        let conn = match &source {
            Source::Memory | Source::Bytes(_) => Connection::open_in_memory()?,
            Source::Path(path) => open_file(
                &vfs.engine_path(path)?,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )?,
        };
        connection.conn = Some(conn);
        connection.state = ConnectionState::Open;
        if let Source::Bytes(image) = source {
            let scratch = vfs.scratch_file()?;
            std::fs::write(scratch.path(), &image)?;
            connection.load_path(scratch.path())?;
        }
        Ok(connection)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn options(&self) -> &SplOptions {
        &self.options
    }

    /// The live rusqlite connection; fails once closed.
    pub fn connection(&self) -> Result<&Connection> {
        match (&self.state, &self.conn) {
            (ConnectionState::Open, Some(conn)) => Ok(conn),
            _ => Err(Error::Closed),
        }
    }

    fn connection_mut(&mut self) -> Result<&mut Connection> {
        match (&self.state, &mut self.conn) {
            (ConnectionState::Open, Some(conn)) => Ok(conn),
            _ => Err(Error::Closed),
        }
    }

    /// Runs one statement once per bind pass and keeps the decoded rows of
    /// every pass as the connection's result.
    pub fn exec(&mut self, sql: &str, par: Option<Value>) -> Result<()> {
        let conn = match (&self.state, &self.conn) {
            (ConnectionState::Open, Some(conn)) => conn,
            _ => return Err(Error::Closed),
        };
        let mut stmt = conn.prepare(sql)?;
        let cols = marshal::dedup_columns(stmt.column_names());
        let passes = marshal::classify(par, stmt.parameter_count());
        let mut rows = Vec::new();
        for index in 0..passes.len().max(1) {
            if let Some(pass) = passes.get(index) {
                marshal::bind_pass(&mut stmt, pass, &self.options)?;
            }
            let mut cursor = stmt.raw_query();
            while let Some(row) = cursor.next()? {
                let mut decoded = Vec::with_capacity(cols.len());
                for col in 0..cols.len() {
                    decoded.push(marshal::decode_column(
                        row.get_ref(col)?,
                        &self.options,
                        &mut self.geojson,
                    )?);
                }
                rows.push(decoded);
            }
            drop(cursor);
            stmt.clear_bindings();
        }
        trace!(passes = passes.len(), rows = rows.len(), "statement executed");
        self.result = ResultView::new(cols, rows);
        Ok(())
    }

    /// Executes a script; the current result is left untouched.
    pub fn read(&mut self, sql: &str) -> Result<()> {
        self.connection()?.execute_batch(sql)?;
        Ok(())
    }

    pub fn attach(&mut self, vfs: &Vfs, path: &str, schema: &str) -> Result<()> {
        self.connection()?;
        let path = vfs.engine_path(path)?;
        self.exec(
            "attach ? as ?",
            Some(Value::List(vec![
                Value::Text(path.to_string_lossy().into_owned()),
                Value::from(schema),
            ])),
        )
    }

    pub fn detach(&mut self, schema: &str) -> Result<()> {
        self.exec("detach ?", Some(Value::List(vec![Value::from(schema)])))
    }

    /// Replaces the database with the contents of `src`.
    pub fn load(&mut self, vfs: &Vfs, src: &str) -> Result<()> {
        self.connection()?;
        let path = vfs.engine_path(src)?;
        self.load_path(&path)
    }

    fn load_path(&mut self, path: &Path) -> Result<()> {
        let source = open_file(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        copy_database(&source, self.connection_mut()?)?;
        debug!(path = %path.display(), "database loaded");
        Ok(())
    }

    /// Copies the database to `dest`, or returns its image when no
    /// destination is given.
    pub fn save(&mut self, vfs: &Vfs, dest: Option<&str>) -> Result<Option<Bytes>> {
        let conn = self.connection()?;
        match dest {
            Some(dest) => {
                let path = vfs.engine_path(dest)?;
                let mut target = open_file(
                    &path,
                    OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
                )?;
                copy_database(conn, &mut target)?;
                debug!(path = %path.display(), "database saved");
                Ok(None)
            }
            None => {
                let scratch = vfs.scratch_file()?;
                {
                    let mut target = open_file(
                        scratch.path(),
                        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
                    )?;
                    copy_database(conn, &mut target)?;
                }
                let image = std::fs::read(scratch.path())?;
                trace!(bytes = image.len(), "database image exported");
                Ok(Some(Bytes::from(image)))
            }
        }
    }

    pub fn result(&self) -> Result<&ResultView> {
        self.connection()?;
        Ok(&self.result)
    }

    pub fn result_mut(&mut self) -> Result<&mut ResultView> {
        self.connection()?;
        Ok(&mut self.result)
    }

    /// Releases the connection and its buffers. Closing twice fails.
    pub fn close(&mut self) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(Error::Closed);
        }
        self.state = ConnectionState::Closed;
        self.geojson.release();
        self.result.free();
        match self.conn.take() {
            Some(conn) => conn.close().map_err(|(_, err)| Error::Engine(err)),
            None => Ok(()),
        }
    }
}

impl Drop for EngineConnection {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(vfs: &Vfs) -> EngineConnection {
        EngineConnection::open(Source::Memory, SplOptions::default(), vfs).expect("open")
    }

    fn params(values: Vec<Value>) -> Option<Value> {
        Some(Value::List(values))
    }

    #[test]
    fn repeated_positional_parameter() {
        let vfs = Vfs::new(None).expect("vfs");
        let mut db = memory(&vfs);
        db.exec("select ?1 a, ?1 b", params(vec![1.into()])).expect("exec");
        let result = db.result().expect("result");
        assert_eq!(result.cols(), &["a".to_string(), "b".to_string()]);
        assert_eq!(result.rows(), &[vec![Value::from(1), Value::from(1)]]);
    }

    #[test]
    fn one_pass_per_value_when_counts_differ() {
        let vfs = Vfs::new(None).expect("vfs");
        let mut db = memory(&vfs);
        db.exec("select ? a", params(vec![1.into(), 2.into()])).expect("exec");
        let objs = db.result().expect("result").objs();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0]["a"], Value::from(1));
        assert_eq!(objs[1]["a"], Value::from(2));
    }

    #[test]
    fn named_parameters_and_duplicate_columns() {
        let vfs = Vfs::new(None).expect("vfs");
        let mut db = memory(&vfs);
        db.exec("select @a a, @a a, 3 b", Some(Value::map([("@a", 1)])))
            .expect("exec");
        let result = db.result().expect("result");
        assert_eq!(result.cols(), &["a", "a1", "b"].map(String::from));
        assert_eq!(result.first(), Value::from(vec![1, 1, 3]));
    }

    #[test]
    fn blobs_round_trip_without_geojson() {
        let vfs = Vfs::new(None).expect("vfs");
        let mut db = EngineConnection::open(
            Source::Memory,
            SplOptions::default().without_geojson(),
            &vfs,
        )
        .expect("open");
        let blob = Value::blob(vec![0u8, 255, 7, 0x7C, 0xFE]);
        db.exec("select ?", params(vec![blob.clone()])).expect("exec");
        assert_eq!(db.result().expect("result").first(), blob);
    }

    #[test]
    fn engine_errors_surface_their_text() {
        let vfs = Vfs::new(None).expect("vfs");
        let mut db = memory(&vfs);
        let err = db.exec("select * from missing", None).expect_err("missing table");
        assert!(err.to_string().contains("no such table"));
        assert_eq!(err.kind(), crate::ErrorKind::Engine);
    }

    #[test]
    fn closed_connections_reject_everything() {
        let vfs = Vfs::new(None).expect("vfs");
        let mut db = memory(&vfs);
        db.close().expect("close");
        assert_eq!(db.state(), ConnectionState::Closed);
        assert!(matches!(db.close(), Err(Error::Closed)));
        assert!(matches!(db.exec("select 1", None), Err(Error::Closed)));
        assert!(matches!(db.read("select 1"), Err(Error::Closed)));
        assert!(matches!(db.result(), Err(Error::Closed)));
        assert!(matches!(db.save(&vfs, None), Err(Error::Closed)));
    }

    #[test]
    fn images_reopen_with_the_same_rows() {
        let vfs = Vfs::new(None).expect("vfs");
        let mut db = memory(&vfs);
        db.read("create table t (v); insert into t values (1), (2);")
            .expect("script");
        let image = db.save(&vfs, None).expect("save").expect("image");
        let mut copy =
            EngineConnection::open(Source::Bytes(image), SplOptions::default(), &vfs)
                .expect("reopen");
        copy.exec("select v from t order by v", None).expect("exec");
        assert_eq!(
            copy.result().expect("result").flat(),
            vec![Value::from(1), Value::from(2)]
        );
    }

    #[test]
    fn save_load_and_attach_through_the_vfs() {
        let vfs = Vfs::new(None).expect("vfs");
        let mut db = memory(&vfs);
        db.read("create table t (v); insert into t values ('x');")
            .expect("script");
        assert!(db.save(&vfs, Some("/copy.db")).expect("save").is_none());
        assert!(vfs.root().join("copy.db").exists());

        let mut other = memory(&vfs);
        other.load(&vfs, "/copy.db").expect("load");
        other.exec("select v from t", None).expect("exec");
        assert_eq!(other.result().expect("result").first(), Value::from("x"));

        other.attach(&vfs, "/copy.db", "extra").expect("attach");
        other.exec("select count(*) from extra.t", None).expect("exec");
        assert_eq!(other.result().expect("result").first(), Value::from(1));
        other.detach("extra").expect("detach");
    }

    #[test]
    fn load_replaces_every_page_of_the_target() {
        let vfs = Vfs::new(None).expect("vfs");
        let mut small = memory(&vfs);
        small.read("create table t (v); insert into t values (1);").expect("script");
        small.save(&vfs, Some("/small.db")).expect("save");

        let mut big = memory(&vfs);
        big.read(
            "create table t (v); create table other (w);
             with recursive n(i) as (select 1 union all select i + 1 from n where i < 2000)
             insert into other select randomblob(64) from n;",
        )
        .expect("script");
        big.load(&vfs, "/small.db").expect("load");
        big.exec("select count(*) from sqlite_master where name = 'other'", None)
            .expect("exec");
        assert_eq!(big.result().expect("result").first(), Value::from(0));
        big.exec("select v from t", None).expect("exec");
        assert_eq!(big.result().expect("result").flat(), vec![Value::from(1)]);
    }
}
