//! Deferred command chains: commands accumulate on a queue and are sent as
//! one batch when the chain is awaited or a terminal read is issued.

use crate::error::{Error, Result};
use crate::pending::Settlement;
use crate::transport::Client;
use spl_db::{Command, Marker, Reply, Value};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};

/// Commands not yet sent.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: Mutex<Vec<Command>>,
}

impl CommandQueue {
    pub(crate) fn with(commands: Vec<Command>) -> Self {
        Self {
            commands: Mutex::new(commands),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Command>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, command: Command) {
        self.lock().push(command);
    }

    pub(crate) fn extend(&self, commands: Vec<Command>) {
        self.lock().extend(commands);
    }

    pub(crate) fn drain(&self) -> Vec<Command> {
        mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A chain with its own queue that answers with its own marker.
pub trait Chain {
    const MARKER: Marker;

    #[doc(hidden)]
    fn client(&self) -> &Client;

    #[doc(hidden)]
    fn queue(&self) -> &CommandQueue;
}

/// Outcome of awaiting a chain.
#[derive(Debug)]
pub enum Settled<C> {
    /// The last command answered with this chain's marker.
    This(C),
    Value(Value),
}

impl<C> Settled<C> {
    pub fn is_this(&self) -> bool {
        matches!(self, Settled::This(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Settled::Value(value) => Some(value),
            Settled::This(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Settled::Value(value) => Some(value),
            Settled::This(_) => None,
        }
    }
}

enum State {
    Pending,
    Flushing(Settlement),
    Done,
}

/// Future returned when awaiting a chain. The queue is drained on the first
/// poll; an empty queue settles immediately without a round trip.
pub struct Deferred<'a, C> {
    chain: &'a C,
    state: State,
}

impl<'a, C: Chain> Deferred<'a, C> {
    pub(crate) fn new(chain: &'a C) -> Self {
        Self {
            chain,
            state: State::Pending,
        }
    }
}

impl<'a, C: Chain> Future for Deferred<'a, C> {
    type Output = Result<Settled<&'a C>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Pending => {
                    let commands = this.chain.queue().drain();
                    if commands.is_empty() {
                        this.state = State::Done;
                        return Poll::Ready(Ok(Settled::This(this.chain)));
                    }
                    match this.chain.client().post(commands) {
                        Ok(settlement) => this.state = State::Flushing(settlement),
                        Err(err) => {
                            this.state = State::Done;
                            return Poll::Ready(Err(err));
                        }
                    }
                }
                State::Flushing(settlement) => {
                    let outcome = ready!(Pin::new(settlement).poll(cx));
                    this.state = State::Done;
                    return Poll::Ready(match outcome {
                        Ok(Ok(reply)) => Ok(settle(this.chain, reply)),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(Error::Terminated),
                    });
                }
                State::Done => panic!("Deferred polled after completion"),
            }
        }
    }
}

fn settle<C: Chain>(chain: &C, reply: Reply) -> Settled<&C> {
    match reply {
        Reply::This(marker) if marker == C::MARKER => Settled::This(chain),
        other => Settled::Value(other.into_value()),
    }
}

/// Sends the chain's queue followed by `command` and returns the last reply.
pub(crate) async fn terminal<C: Chain>(chain: &C, command: Command) -> Result<Value> {
    let mut commands = chain.queue().drain();
    commands.push(command);
    let settlement = chain.client().post(commands)?;
    match settlement.await {
        Ok(Ok(reply)) => Ok(reply.into_value()),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::Terminated),
    }
}
