//! Batch dispatcher: runs a request's commands in order against the engine,
//! the connection registry and the extension table.

use crate::config::SplOptions;
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionLibrary, Step, Target};
use crate::protocol::{Builtin, Command, InitMessage, Marker, Operation, Reply, Request, Response};
use crate::registry::Registry;
use crate::sqlite::{EngineConnection, Source};
use crate::value::Value;
use crate::vfs::{MountFile, Vfs};
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, error, trace, warn};

const VERSION_SQL: &str = "select sqlite_version() sqlite, ? spl";

/// The engine singleton: options shared by every connection plus the
/// virtual filesystem.
pub struct Engine {
    options: SplOptions,
    vfs: Vfs,
}

impl Engine {
    pub fn new(options: SplOptions, vfs: Vfs) -> Self {
        Self { options, vfs }
    }

    pub fn options(&self) -> &SplOptions {
        &self.options
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn vfs_mut(&mut self) -> &mut Vfs {
        &mut self.vfs
    }

    pub fn open(&self, source: Source) -> Result<EngineConnection> {
        EngineConnection::open(source, self.options, &self.vfs)
    }

    /// Library versions, read through a transient connection.
    pub fn version(&self) -> Result<Value> {
        let mut db = self.open(Source::Memory)?;
        db.exec(
            VERSION_SQL,
            Some(Value::List(vec![Value::from(env!("CARGO_PKG_VERSION"))])),
        )?;
        let version = db
            .result()?
            .objs()
            .into_iter()
            .next()
            .map(Value::Map)
            .unwrap_or_default();
        db.close()?;
        Ok(version)
    }
}

/// A dispatch that panicked. `response` answers the request with a
/// transport failure; the context must not be used again.
#[derive(Debug)]
pub struct Crashed {
    pub response: Response,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Everything one execution context owns. Requests are dispatched one at a
/// time; nothing here is shared across threads.
pub struct ExecutionContext {
    engine: Engine,
    registry: Registry,
    extensions: HashMap<String, Arc<dyn Extension>>,
    runtime: Runtime,
}

impl ExecutionContext {
    pub fn initialize(init: InitMessage, library: &ExtensionLibrary) -> Result<Self> {
        let extensions = library.resolve(&init.extensions)?;
        let vfs = Vfs::new(init.root)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        debug!(
            extensions = extensions.len(),
            root = %vfs.root().display(),
            "execution context initialized"
        );
        Ok(Self {
            engine: Engine::new(init.options, vfs),
            registry: Registry::new(),
            extensions,
            runtime,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs every command of the request and answers with the last result,
    /// or with the first failure.
    pub fn dispatch(&mut self, request: Request) -> Response {
        let request_id = request.request_id;
        let commands = request.operations.into_vec();
        let count = commands.len();
        let mut transfer = Vec::new();
        match self.run(commands, &mut transfer) {
            Ok(reply) => {
                trace!(request_id, commands = count, transfer = transfer.len(), "batch completed");
                Response::success(request_id, reply, transfer)
            }
            Err(err) => {
                warn!(request_id, error = %err, "batch failed");
                Response::failure(request_id, &err)
            }
        }
    }

    /// [`dispatch`](Self::dispatch) with panics caught at the request
    /// boundary.
    pub fn try_dispatch(&mut self, request: Request) -> std::result::Result<Response, Crashed> {
        let request_id = request.request_id;
        panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(request))).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            error!(request_id, panic = message, "execution context crashed");
            let err = Error::Transport(format!("Execution context crashed: {message}"));
            Crashed {
                response: Response::failure(request_id, &err),
            }
        })
    }

    fn run(&mut self, commands: Vec<Command>, transfer: &mut Vec<Bytes>) -> Result<Reply> {
        let mut reply = Reply::Value(Value::Null);
        for command in commands {
            // Only the last command's buffers are transferred.
            transfer.clear();
            reply = self.execute(command, transfer)?;
        }
        Ok(reply)
    }

    fn execute(&mut self, command: Command, transfer: &mut Vec<Bytes>) -> Result<Reply> {
        let Command {
            target_id,
            operation,
            arguments,
        } = command;
        if operation.targets_connection() {
            self.registry.get(target_id)?;
        }
        let builtin = match operation {
            Operation::Builtin(builtin) => builtin,
            Operation::Extension(name) => return self.call_extension(&name, target_id, arguments),
        };
        let args = Args {
            operation: builtin.name(),
            values: arguments,
        };
        let engine = &mut self.engine;
        match builtin {
            Builtin::Version => Ok(Reply::Value(engine.version()?)),
            Builtin::Open => {
                let id = target_id
                    .ok_or_else(|| Error::invalid_argument("db", 0, "a target id"))?;
                match self.registry.get(Some(id)) {
                    Ok(existing) if existing.is_open() => return Ok(Reply::This(Marker::Db)),
                    Ok(_) => return Err(Error::Closed),
                    Err(_) => {}
                }
                let connection = engine.open(Source::from_argument(args.values.first())?)?;
                self.registry.insert(id, connection)?;
                Ok(Reply::This(Marker::Db))
            }
            Builtin::FsMount => {
                let files = match args.values.get(2) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::List(items)) => items
                        .iter()
                        .map(MountFile::from_value)
                        .collect::<Result<Vec<_>>>()?,
                    Some(_) => return Err(Error::invalid_argument("fs.mount", 2, "a list")),
                };
                let path = args.optional_text(0)?.unwrap_or_default();
                let mountpoint = args.optional_text(1)?.unwrap_or("root");
                engine.vfs_mut().mount(path, mountpoint, files)?;
                Ok(Reply::This(Marker::Spl))
            }
            Builtin::FsUnmount => {
                engine.vfs_mut().unmount(args.text(0)?)?;
                Ok(Reply::This(Marker::Spl))
            }
            Builtin::FsFile => {
                let bytes = engine.vfs().file(args.text(0)?)?;
                transfer.push(bytes.clone());
                Ok(Reply::Value(Value::Blob(bytes)))
            }
            Builtin::FsDir => {
                let names = engine.vfs().dir(args.text(0)?)?;
                Ok(Reply::Value(Value::from(names)))
            }
            Builtin::FsUnlink => {
                engine.vfs().unlink(args.text(0)?)?;
                Ok(Reply::This(Marker::Spl))
            }
            Builtin::FsMkdir => {
                engine.vfs().mkdir(args.text(0)?)?;
                Ok(Reply::This(Marker::Spl))
            }
            _ => {
                let connection = self.registry.get_mut(target_id)?;
                connection_builtin(builtin, connection, engine, args, transfer)
            }
        }
    }

    fn call_extension(
        &mut self,
        name: &str,
        target_id: Option<u64>,
        arguments: Vec<Value>,
    ) -> Result<Reply> {
        let extension = self
            .extensions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))?;
        let target = if name.starts_with("db.") {
            Target::Db(self.registry.get_mut(target_id)?)
        } else {
            Target::Spl(&mut self.engine)
        };
        match extension.call(target, arguments)? {
            Step::Done(reply) => Ok(reply),
            Step::Later(future) => {
                trace!(operation = name, "awaiting extension");
                self.runtime.block_on(future).map(Reply::from_value)
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.registry.close_all();
    }
}

fn connection_builtin(
    builtin: Builtin,
    connection: &mut EngineConnection,
    engine: &Engine,
    args: Args,
    transfer: &mut Vec<Bytes>,
) -> Result<Reply> {
    let this = Reply::This(Marker::Db);
    match builtin {
        Builtin::Attach => {
            connection.attach(engine.vfs(), args.text(0)?, args.text(1)?)?;
            Ok(this)
        }
        Builtin::Detach => {
            connection.detach(args.text(0)?)?;
            Ok(this)
        }
        Builtin::Exec => {
            let sql = args.text(0)?.to_string();
            let par = args.values.into_iter().nth(1);
            connection.exec(&sql, par)?;
            Ok(this)
        }
        Builtin::Read => {
            connection.read(args.text(0)?)?;
            Ok(this)
        }
        Builtin::Load => {
            connection.load(engine.vfs(), args.text(0)?)?;
            Ok(this)
        }
        Builtin::Save => match connection.save(engine.vfs(), args.optional_text(0)?)? {
            Some(image) => {
                transfer.push(image.clone());
                Ok(Reply::Value(Value::Blob(image)))
            }
            None => Ok(this),
        },
        Builtin::Close => {
            connection.close()?;
            debug!("connection closed");
            Ok(Reply::This(Marker::Spl))
        }
        Builtin::ResFirst => Ok(Reply::Value(connection.result()?.first())),
        Builtin::ResFlat => Ok(Reply::Value(Value::List(connection.result()?.flat()))),
        Builtin::ResRows => Ok(Reply::Value(Value::List(
            connection
                .result()?
                .rows()
                .iter()
                .cloned()
                .map(Value::List)
                .collect(),
        ))),
        Builtin::ResCols => Ok(Reply::Value(Value::from(connection.result()?.cols().to_vec()))),
        Builtin::ResObjs => Ok(Reply::Value(Value::List(
            connection
                .result()?
                .objs()
                .into_iter()
                .map(Value::Map)
                .collect(),
        ))),
        Builtin::ResSync => {
            let view = connection.result_mut()?.take();
            transfer.extend(view.blobs());
            Ok(Reply::Value(view.into_value()))
        }
        Builtin::ResFree => {
            connection.result_mut()?.free();
            Ok(Reply::Value(Value::Null))
        }
        other => Err(Error::UnknownFunction(other.name().to_string())),
    }
}

/// Positional command arguments with typed accessors.
struct Args {
    operation: &'static str,
    values: Vec<Value>,
}

impl Args {
    fn text(&self, index: usize) -> Result<&str> {
        self.values
            .get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_argument(self.operation, index, "a string"))
    }

    fn optional_text(&self, index: usize) -> Result<Option<&str>> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text)),
            Some(_) => Err(Error::invalid_argument(self.operation, index, "a string")),
        }
    }
}
