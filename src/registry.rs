//! Correlation registries: pending requests keyed by ActionID / CommandID

use crate::{
    error::{AmiError, AmiResult},
    message::AmiMessage,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::trace;

type Continuation = oneshot::Sender<AmiResult<AmiMessage>>;

/// Which registry a continuation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegistryKind {
    /// Keyed by `ActionID`, completed by the matching `Response`.
    Action,
    /// Keyed by `CommandID`, completed by the `AsyncAGI` `Exec` event.
    Agi,
    /// Keyed by `ActionID`, completed by the `OriginateResponse` event.
    Originate,
}

/// A reply that has not arrived yet.
///
/// Resolves exactly once: with the correlated message, with the protocol
/// error derived from it, or with [`AmiError::ConnectionClosed`] when the
/// client is shut down first. There is no built-in timeout; wrap it in
/// `tokio::time::timeout` when needed.
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<AmiResult<AmiMessage>>,
}

impl PendingReply {
    /// Correlation ID this reply is registered under.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = AmiResult<AmiMessage>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(AmiError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One correlation table with single-use removal.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pending: HashMap<String, Continuation>,
}

impl Registry {
    /// Register a continuation. A second registration under the same ID
    /// replaces the first, whose waiter then sees `ConnectionClosed`.
    pub(crate) fn register(&mut self, id: &str) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(id.to_string(), tx);
        PendingReply {
            id: id.to_string(),
            rx,
        }
    }

    /// Remove and return the continuation for `id`.
    fn take(&mut self, id: &str) -> Option<Continuation> {
        self.pending
            .remove(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending
            .len()
    }

    fn drain(&mut self) -> Vec<Continuation> {
        self.pending
            .drain()
            .map(|(_, tx)| tx)
            .collect()
    }
}

/// The three registries of a client. They outlive individual sockets.
#[derive(Debug, Default)]
pub(crate) struct Registries {
    actions: Registry,
    agi: Registry,
    originate: Registry,
}

impl Registries {
    fn registry_mut(&mut self, kind: RegistryKind) -> &mut Registry {
        match kind {
            RegistryKind::Action => &mut self.actions,
            RegistryKind::Agi => &mut self.agi,
            RegistryKind::Originate => &mut self.originate,
        }
    }

    pub(crate) fn register(&mut self, kind: RegistryKind, id: &str) -> PendingReply {
        self.registry_mut(kind)
            .register(id)
    }

    /// Remove the continuation for `id` without completing it.
    pub(crate) fn take(
        &mut self,
        kind: RegistryKind,
        id: &str,
    ) -> Option<oneshot::Sender<AmiResult<AmiMessage>>> {
        self.registry_mut(kind)
            .take(id)
    }

    /// Total number of outstanding continuations.
    pub(crate) fn len(&self) -> usize {
        self.actions
            .len()
            + self
                .agi
                .len()
            + self
                .originate
                .len()
    }

    /// Remove every continuation, for failing them on shutdown.
    pub(crate) fn drain(&mut self) -> Vec<oneshot::Sender<AmiResult<AmiMessage>>> {
        let mut all = self
            .actions
            .drain();
        all.extend(
            self.agi
                .drain(),
        );
        all.extend(
            self.originate
                .drain(),
        );
        all
    }
}

/// Deliver a result to a taken continuation. A dropped waiter is not an error.
pub(crate) fn complete(
    kind: RegistryKind,
    id: &str,
    tx: Option<oneshot::Sender<AmiResult<AmiMessage>>>,
    result: AmiResult<AmiMessage>,
) {
    match tx {
        Some(tx) => {
            if tx
                .send(result)
                .is_err()
            {
                trace!("{:?} waiter for {} went away", kind, id);
            }
        }
        None => trace!("No {:?} continuation for {}", kind, id),
    }
}
