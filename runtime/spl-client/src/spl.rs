use crate::chain::{Chain, CommandQueue, Deferred, Settled, terminal};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::pending::PendingRequests;
use crate::transport::{Client, ThreadTransport, Transport};
use bytes::Bytes;
use spl_db::{
    Builtin, Command, ExtensionDescriptor, ExtensionLibrary, InitMessage, Marker, MountFile,
    Operation, Source, SplOptions, Value,
};
use std::fmt;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Everything needed to start an execution context.
#[derive(Clone, Default)]
pub struct SplConfig {
    pub options: SplOptions,
    pub extensions: Vec<ExtensionDescriptor>,
    pub library: ExtensionLibrary,
    /// Host directory backing the virtual filesystem; a temporary directory
    /// when unset.
    pub root: Option<PathBuf>,
}

impl SplConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(mut self, options: SplOptions) -> Self {
        self.options = options;
        self
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn extension(mut self, descriptor: ExtensionDescriptor) -> Self {
        self.extensions.push(descriptor);
        self
    }

    pub fn library(mut self, library: ExtensionLibrary) -> Self {
        self.library = library;
        self
    }
}

struct SplInner {
    client: Client,
    queue: CommandQueue,
    next_handle: AtomicU64,
}

/// Top-level command chain. Clones share one queue.
#[derive(Clone)]
pub struct Spl {
    inner: Arc<SplInner>,
}

impl Spl {
    /// Starts an execution context on its own thread.
    pub async fn spawn(config: SplConfig) -> Result<Spl> {
        let SplConfig {
            options,
            extensions,
            library,
            root,
        } = config;
        let pending = Arc::new(PendingRequests::new());
        let init = InitMessage {
            options,
            extensions,
            root,
        };
        let transport = ThreadTransport::spawn(init, library, Arc::clone(&pending)).await?;
        Ok(Spl::with_transport(Arc::new(transport), pending))
    }

    /// Uses a transport that settles responses through `pending`.
    pub fn with_transport(transport: Arc<dyn Transport>, pending: Arc<PendingRequests>) -> Spl {
        Spl {
            inner: Arc::new(SplInner {
                client: Client::new(transport, pending),
                queue: CommandQueue::default(),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    fn push(&self, operation: impl Into<Operation>, arguments: Vec<Value>) -> &Spl {
        self.inner
            .queue
            .push(Command::new(operation, None, arguments));
        self
    }

    /// Opens a connection. Commands queued so far travel with it.
    pub fn db(&self, source: impl Into<Source>) -> Db {
        let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut commands = self.inner.queue.drain();
        commands.push(Command::new(
            Builtin::Open,
            Some(id),
            vec![source.into().into_argument()],
        ));
        Db::new(self.clone(), id, CommandQueue::with(commands))
    }

    pub fn version(&self) -> &Spl {
        self.push(Builtin::Version, Vec::new())
    }

    /// Queues a call to a host extension registered for the top level.
    pub fn call(&self, name: &str, arguments: Vec<Value>) -> &Spl {
        self.push(Operation::parse(name), arguments)
    }

    pub fn fs(&self) -> Fs<'_> {
        Fs { spl: self }
    }

    /// Stops the execution context. Pending requests fail with
    /// [`Error::Terminated`].
    pub fn terminate(&self) {
        self.inner.client.terminate();
    }

    pub(crate) fn enqueue(&self, commands: Vec<Command>) {
        self.inner.queue.extend(commands);
    }
}

impl Chain for Spl {
    const MARKER: Marker = Marker::Spl;

    fn client(&self) -> &Client {
        &self.inner.client
    }

    fn queue(&self) -> &CommandQueue {
        &self.inner.queue
    }
}

impl fmt::Debug for Spl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spl")
            .field("queued", &self.inner.queue.len())
            .field("pending", &self.inner.client.pending().len())
            .finish()
    }
}

impl<'a> IntoFuture for &'a Spl {
    type Output = Result<Settled<&'a Spl>>;
    type IntoFuture = Deferred<'a, Spl>;

    fn into_future(self) -> Self::IntoFuture {
        Deferred::new(self)
    }
}

/// Filesystem operations on the top-level chain.
pub struct Fs<'a> {
    spl: &'a Spl,
}

impl<'a> Fs<'a> {
    /// Mounts a host directory, or `files` as buffers, at `mountpoint`
    /// (`/root` when `None`).
    pub fn mount(&self, path: &str, mountpoint: Option<&str>, files: Vec<MountFile>) -> &'a Spl {
        let files = if files.is_empty() {
            Value::Null
        } else {
            Value::List(files.into_iter().map(MountFile::into_value).collect())
        };
        self.spl.push(
            Builtin::FsMount,
            vec![path.into(), Value::from(mountpoint), files],
        )
    }

    pub fn unmount(&self, mountpoint: &str) -> &'a Spl {
        self.spl.push(Builtin::FsUnmount, vec![mountpoint.into()])
    }

    pub fn unlink(&self, path: &str) -> &'a Spl {
        self.spl.push(Builtin::FsUnlink, vec![path.into()])
    }

    pub fn mkdir(&self, path: &str) -> &'a Spl {
        self.spl.push(Builtin::FsMkdir, vec![path.into()])
    }

    pub async fn file(&self, path: &str) -> Result<Bytes> {
        match terminal(self.spl, Command::new(Builtin::FsFile, None, vec![path.into()])).await? {
            Value::Blob(bytes) => Ok(bytes),
            other => Err(Error::Decode(format!("expected file contents, got {other:?}"))),
        }
    }

    pub async fn dir(&self, path: &str) -> Result<Vec<String>> {
        let names = terminal(self.spl, Command::new(Builtin::FsDir, None, vec![path.into()]))
            .await?
            .into_list()
            .ok_or_else(|| Error::Decode("expected a list of names".to_string()))?;
        names
            .into_iter()
            .map(|name| match name {
                Value::Text(name) => Ok(name),
                other => Err(Error::Decode(format!("expected a name, got {other:?}"))),
            })
            .collect()
    }
}
