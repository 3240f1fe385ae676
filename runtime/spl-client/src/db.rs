use crate::chain::{Chain, CommandQueue, Deferred, Settled, terminal};
use crate::error::{Error, Result};
use crate::spl::Spl;
use crate::transport::Client;
use bytes::Bytes;
use indexmap::IndexMap;
use spl_db::{Builtin, Command, Marker, Operation, ResultView, Value};
use std::fmt;
use std::future::IntoFuture;

/// Command chain bound to one connection handle.
pub struct Db {
    spl: Spl,
    id: u64,
    queue: CommandQueue,
}

impl Db {
    pub(crate) fn new(spl: Spl, id: u64, queue: CommandQueue) -> Self {
        Self { spl, id, queue }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn spl(&self) -> &Spl {
        &self.spl
    }

    fn command(&self, operation: impl Into<Operation>, arguments: Vec<Value>) -> Command {
        Command::new(operation, Some(self.id), arguments)
    }

    fn push(&self, operation: impl Into<Operation>, arguments: Vec<Value>) -> &Db {
        self.queue.push(self.command(operation, arguments));
        self
    }

    /// Attaches the database at `path` under `schema`.
    pub fn attach(&self, path: &str, schema: &str) -> &Db {
        self.push(Builtin::Attach, vec![path.into(), schema.into()])
    }

    pub fn detach(&self, schema: &str) -> &Db {
        self.push(Builtin::Detach, vec![schema.into()])
    }

    /// Runs one statement. The connection's result is replaced by the rows
    /// it produced.
    pub fn exec(&self, sql: &str, params: impl Into<Params>) -> &Db {
        let mut arguments = vec![Value::from(sql)];
        if let Some(par) = params.into().0 {
            arguments.push(par);
        }
        self.push(Builtin::Exec, arguments)
    }

    /// Runs a script of statements, discarding their rows.
    pub fn read(&self, sql: &str) -> &Db {
        self.push(Builtin::Read, vec![sql.into()])
    }

    pub fn load(&self, src: &str) -> &Db {
        self.push(Builtin::Load, vec![src.into()])
    }

    /// Backs the database up to `dest`, or when `None`, settles with the
    /// serialized image.
    pub fn save(&self, dest: Option<&str>) -> &Db {
        self.push(Builtin::Save, vec![Value::from(dest)])
    }

    /// Queues a call to a host extension registered for connections; the
    /// `db.` prefix is added when missing.
    pub fn call(&self, name: &str, arguments: Vec<Value>) -> &Db {
        let operation = if name.starts_with("db.") {
            name.to_string()
        } else {
            format!("db.{name}")
        };
        self.push(Operation::parse(&operation), arguments)
    }

    /// Moves the queued commands and a close onto the top-level chain.
    pub fn close(&self) -> &Spl {
        let mut commands = self.queue.drain();
        commands.push(self.command(Builtin::Close, Vec::new()));
        self.spl.enqueue(commands);
        &self.spl
    }

    /// Reads of the connection's current result.
    pub fn get(&self) -> Get<'_> {
        Get { db: self }
    }
}

impl Chain for Db {
    const MARKER: Marker = Marker::Db;

    fn client(&self) -> &Client {
        self.spl.client()
    }

    fn queue(&self) -> &CommandQueue {
        &self.queue
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("id", &self.id)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl<'a> IntoFuture for &'a Db {
    type Output = Result<Settled<&'a Db>>;
    type IntoFuture = Deferred<'a, Db>;

    fn into_future(self) -> Self::IntoFuture {
        Deferred::new(self)
    }
}

/// Terminal reads; each sends the connection's queue plus the read.
pub struct Get<'a> {
    db: &'a Db,
}

impl Get<'_> {
    async fn read(&self, builtin: Builtin) -> Result<Value> {
        terminal(self.db, self.db.command(builtin, Vec::new())).await
    }

    /// The single value of a one-column first row, otherwise the first row.
    pub async fn first(&self) -> Result<Value> {
        self.read(Builtin::ResFirst).await
    }

    pub async fn flat(&self) -> Result<Vec<Value>> {
        list(self.read(Builtin::ResFlat).await?, "values")
    }

    pub async fn rows(&self) -> Result<Vec<Vec<Value>>> {
        list(self.read(Builtin::ResRows).await?, "rows")?
            .into_iter()
            .map(|row| list(row, "a row"))
            .collect()
    }

    pub async fn cols(&self) -> Result<Vec<String>> {
        list(self.read(Builtin::ResCols).await?, "column names")?
            .into_iter()
            .map(|col| match col {
                Value::Text(name) => Ok(name),
                other => Err(Error::Decode(format!("expected a column name, got {other:?}"))),
            })
            .collect()
    }

    pub async fn objs(&self) -> Result<Vec<IndexMap<String, Value>>> {
        list(self.read(Builtin::ResObjs).await?, "objects")?
            .into_iter()
            .map(|obj| {
                obj.into_map()
                    .ok_or_else(|| Error::Decode("expected an object".to_string()))
            })
            .collect()
    }

    /// Moves the whole result into a local view and frees it remotely.
    pub async fn sync(&self) -> Result<ResultView> {
        ResultView::from_value(self.read(Builtin::ResSync).await?)
            .ok_or_else(|| Error::Decode("expected [cols, rows]".to_string()))
    }

    pub async fn free(&self) -> Result<()> {
        self.read(Builtin::ResFree).await.map(drop)
    }
}

fn list(value: Value, what: &str) -> Result<Vec<Value>> {
    value
        .into_list()
        .ok_or_else(|| Error::Decode(format!("expected a list of {what}")))
}

/// Bind parameters for [`Db::exec`]: nothing, one scalar, a positional list,
/// a named-parameter object or a list of those for repeated execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params(Option<Value>);

impl Params {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn into_value(self) -> Option<Value> {
        self.0
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params(None)
    }
}

impl From<Value> for Params {
    fn from(value: Value) -> Self {
        Params(Some(value))
    }
}

impl From<Option<Value>> for Params {
    fn from(value: Option<Value>) -> Self {
        Params(value)
    }
}

impl From<IndexMap<String, Value>> for Params {
    fn from(named: IndexMap<String, Value>) -> Self {
        Params(Some(Value::Map(named)))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Params {
    fn from(values: Vec<T>) -> Self {
        Params(Some(Value::from(values)))
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Params {
    fn from(values: [T; N]) -> Self {
        Params(Some(Value::List(values.into_iter().map(Into::into).collect())))
    }
}

macro_rules! params_from_scalar {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Params {
            fn from(value: $ty) -> Self {
                Params(Some(Value::from(value)))
            }
        })*
    };
}

params_from_scalar!(bool, i32, i64, u32, f64, &str, String, Bytes);
