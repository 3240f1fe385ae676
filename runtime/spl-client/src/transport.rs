//! Delivery of request batches to an execution context.

use crate::error::{Error, Result};
use crate::pending::{PendingRequests, Settlement};
use crossbeam_channel::{Receiver, Sender, unbounded};
use spl_db::{Command, ExecutionContext, ExtensionLibrary, InitMessage, Request};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub trait Transport: Send + Sync {
    /// Hands a request to the execution context. The response is delivered
    /// through the shared [`PendingRequests`].
    fn send(&self, request: Request) -> Result<()>;

    /// Stops the execution context; later sends fail.
    fn terminate(&self);
}

/// Closes the request channel and rejects everything still pending once the
/// worker thread stops, however it stops.
struct Shutdown {
    receiver: Option<Receiver<Request>>,
    pending: Arc<PendingRequests>,
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        drop(self.receiver.take());
        self.pending.abandon_all();
    }
}

/// Runs the execution context on a dedicated thread fed by a channel.
pub struct ThreadTransport {
    sender: Mutex<Option<Sender<Request>>>,
    pending: Arc<PendingRequests>,
}

impl ThreadTransport {
    /// Starts the worker thread and waits until the context is initialized.
    pub async fn spawn(
        init: InitMessage,
        library: ExtensionLibrary,
        pending: Arc<PendingRequests>,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded::<Request>();
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<(), String>>();
        let shutdown = Shutdown {
            receiver: Some(receiver),
            pending: Arc::clone(&pending),
        };
        thread::Builder::new()
            .name("spl-worker".to_string())
            .spawn(move || {
                let Some(receiver) = shutdown.receiver.as_ref() else {
                    return;
                };
                let mut context = match ExecutionContext::initialize(init, &library) {
                    Ok(context) => context,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                for request in receiver.iter() {
                    match context.try_dispatch(request) {
                        Ok(response) => shutdown.pending.settle(response),
                        Err(crashed) => {
                            shutdown.pending.settle(crashed.response);
                            break;
                        }
                    }
                }
                debug!(live = context.registry().live(), "execution context stopped");
            })
            .map_err(|err| Error::Init(err.to_string()))?;
        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                sender: Mutex::new(Some(sender)),
                pending,
            }),
            Ok(Err(message)) => Err(Error::Init(message)),
            Err(_) => Err(Error::Init("worker exited during initialization".to_string())),
        }
    }
}

impl Transport for ThreadTransport {
    fn send(&self, request: Request) -> Result<()> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(Error::Terminated)?;
        sender.send(request).map_err(|_| Error::Terminated)
    }

    fn terminate(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            debug!("terminating execution context");
        }
        drop(sender);
        self.pending.abandon_all();
    }
}

/// The control context's end of a transport.
pub struct Client {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingRequests>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, pending: Arc<PendingRequests>) -> Self {
        Self { transport, pending }
    }

    /// Sends one batch and returns the receiver its outcome arrives on.
    pub fn post(&self, commands: Vec<Command>) -> Result<Settlement> {
        let (request_id, settlement) = self.pending.register();
        trace!(request_id, commands = commands.len(), "flushing batch");
        if let Err(err) = self.transport.send(Request::batch(request_id, commands)) {
            self.pending.fail(request_id, err.clone());
            return Err(err);
        }
        Ok(settlement)
    }

    pub fn terminate(&self) {
        self.transport.terminate();
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spl_db::{
        AppliesTo, Builtin, ErrorKind, ExtensionDescriptor, ExtensionModule, Marker, Operation,
        Reply, Step, Target, Value,
    };

    async fn spawn() -> (Client, Arc<PendingRequests>) {
        let pending = Arc::new(PendingRequests::new());
        let transport = ThreadTransport::spawn(
            InitMessage::default(),
            ExtensionLibrary::new(),
            Arc::clone(&pending),
        )
        .await
        .expect("spawn");
        (Client::new(Arc::new(transport), Arc::clone(&pending)), pending)
    }

    #[tokio::test]
    async fn batches_reach_the_worker_thread() {
        let (client, pending) = spawn().await;
        let settlement = client
            .post(vec![Command::new(Builtin::Open, Some(1), Vec::new())])
            .expect("post");
        assert_eq!(
            settlement.await.expect("settled").expect("reply"),
            Reply::This(Marker::Db)
        );
        assert!(pending.is_empty());
    }

    fn explode(_: Target<'_>, _: Vec<Value>) -> spl_db::Result<Step> {
        panic!("extension exploded");
    }

    #[tokio::test]
    async fn a_crash_settles_pending_batches_and_closes_the_channel() {
        let pending = Arc::new(PendingRequests::new());
        let init = InitMessage {
            extensions: vec![
                ExtensionDescriptor::new(AppliesTo::Spl, "boom").function("explode", "explode"),
            ],
            ..InitMessage::default()
        };
        let library = ExtensionLibrary::new()
            .register("boom", ExtensionModule::new().export("explode", explode));
        let transport = ThreadTransport::spawn(init, library, Arc::clone(&pending))
            .await
            .expect("spawn");
        let client = Client::new(Arc::new(transport), Arc::clone(&pending));

        let crashed = client
            .post(vec![Command::new(Operation::parse("explode"), None, Vec::new())])
            .expect("post");
        let err = crashed.await.expect("settled").expect_err("crash");
        assert_eq!(err.kind(), Some(ErrorKind::Transport));

        let later = match client.post(vec![Command::new(Builtin::Version, None, Vec::new())]) {
            Ok(settlement) => settlement.await.expect("settled"),
            Err(err) => Err(err),
        };
        assert!(matches!(later, Err(Error::Terminated)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn terminated_transports_refuse_new_batches() {
        let (client, pending) = spawn().await;
        client.terminate();
        let err = client.post(vec![Command::new(Builtin::Version, None, Vec::new())]);
        assert!(matches!(err, Err(Error::Terminated)));
        assert!(pending.is_empty());
    }
}
