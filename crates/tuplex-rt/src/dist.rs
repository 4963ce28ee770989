//! The distribution boundary.
//!
//! The engine only decides *whether* work or data belongs to another process;
//! moving it there is the job of a [`Transport`]. Inbound messages are
//! replayed through [`Context::receive_message`](crate::Context::receive_message),
//! which routes them by [`CollectionId`] to the matching [`Distributable`].

use std::any::{type_name, Any};
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use fxhash::FxBuildHasher;
use parking_lot::{Mutex, RwLock};

use crate::context::ContextInner;
use crate::error::DistError;
use crate::types::{CollectionId, ProcessId, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A tag put, replayed into a tag collection.
    PutTag,
    /// An item put, replayed into an item collection.
    PutItem,
    /// A step instance created elsewhere that must run here.
    Launch,
    /// Clear a collection.
    Reset,
    /// Drop parked instances (scheduler only).
    Cleanup,
}

#[derive(Clone)]
pub struct Message {
    pub collection: CollectionId,
    pub kind: MessageKind,
    pub payload: Arc<dyn Any + Send + Sync>,
}

impl Message {
    pub fn new<P>(collection: CollectionId, kind: MessageKind, payload: P) -> Self
    where
        P: Any + Send + Sync,
    {
        Message {
            collection,
            kind,
            payload: Arc::new(payload),
        }
    }

    /// A message without payload.
    pub fn control(collection: CollectionId, kind: MessageKind) -> Self {
        Self::new(collection, kind, ())
    }

    pub fn payload<P: Any>(&self) -> Result<&P, DistError> {
        self.payload
            .downcast_ref::<P>()
            .ok_or(DistError::PayloadMismatch {
                collection: self.collection,
                expected: type_name::<P>(),
            })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("collection", &self.collection)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync {
    fn topology(&self) -> Topology;

    fn send(&self, message: Message, to: ProcessId) -> Result<(), DistError>;

    /// Sends to every process except this one.
    fn broadcast(&self, message: Message) -> Result<(), DistError>;
}

/// Anything that can replay a remote operation locally.
pub trait Distributable: Send + Sync {
    fn collection_id(&self) -> CollectionId;

    fn receive_message(&self, message: &Message) -> Result<(), DistError>;
}

/// Routes inbound messages to the collections of one context.
#[derive(Default)]
pub(crate) struct Router {
    targets: DashMap<CollectionId, Arc<dyn Distributable>, FxBuildHasher>,
}

impl Router {
    pub fn register(&self, target: Arc<dyn Distributable>) {
        self.targets.insert(target.collection_id(), target);
    }

    pub fn deliver(&self, message: &Message) -> Result<(), DistError> {
        let target = self
            .targets
            .get(&message.collection)
            .map(|t| t.value().clone())
            .ok_or(DistError::UnknownCollection(message.collection))?;
        target.receive_message(message)
    }
}

/// Single-process transport: nothing is ever remote.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn topology(&self) -> Topology {
        Topology::single()
    }

    fn send(&self, _message: Message, to: ProcessId) -> Result<(), DistError> {
        Err(DistError::NoSuchProcess(to))
    }

    fn broadcast(&self, _message: Message) -> Result<(), DistError> {
        Ok(())
    }
}

/// Connects several contexts in one process, as if each were its own process.
///
/// Messages are delivered as service tasks on the receiving context, so its
/// `wait()` covers them. Delivery errors are collected for inspection.
pub struct LoopbackNetwork {
    processes: u32,
    peers: RwLock<Vec<Weak<ContextInner>>>,
    errors: Mutex<Vec<DistError>>,
}

impl LoopbackNetwork {
    pub fn new(processes: u32) -> Arc<Self> {
        Arc::new(LoopbackNetwork {
            processes,
            peers: RwLock::new(vec![Weak::new(); processes as usize]),
            errors: Mutex::new(Vec::new()),
        })
    }

    /// Transport for the context playing process `local`.
    pub fn endpoint(self: &Arc<Self>, local: ProcessId) -> Arc<dyn Transport> {
        Arc::new(LoopbackEndpoint {
            network: self.clone(),
            local,
        })
    }

    /// Registers a context built on `endpoint(p)` as process `p`.
    pub fn attach(&self, ctx: &crate::Context) {
        let local = ctx.topology().local;
        let mut peers = self.peers.write();
        if let Some(slot) = peers.get_mut(local as usize) {
            *slot = Arc::downgrade(ctx.inner());
        }
    }

    /// Errors raised while replaying delivered messages.
    pub fn take_errors(&self) -> Vec<DistError> {
        std::mem::take(&mut *self.errors.lock())
    }

    /// Waits until every attached context is quiescent at the same time.
    pub fn wait_all(&self) {
        loop {
            let peers: Vec<Arc<ContextInner>> =
                self.peers.read().iter().filter_map(Weak::upgrade).collect();
            for peer in &peers {
                peer.wait();
            }
            if peers.iter().all(|p| p.scheduler().in_flight() == 0) {
                let epochs: Vec<u64> = peers.iter().map(|p| p.scheduler().epoch()).collect();
                for peer in &peers {
                    peer.wait();
                }
                let settled = peers
                    .iter()
                    .zip(&epochs)
                    .all(|(p, e)| p.scheduler().epoch() == *e);
                if settled {
                    return;
                }
            }
        }
    }

    fn deliver(self: &Arc<Self>, message: Message, to: ProcessId) -> Result<(), DistError> {
        let peer = self
            .peers
            .read()
            .get(to as usize)
            .ok_or(DistError::NoSuchProcess(to))?
            .upgrade()
            .ok_or(DistError::Disconnected(to))?;
        let network = self.clone();
        let target = Arc::downgrade(&peer);
        let label = format!("deliver {:?} to {}", message.kind, message.collection);
        peer.scheduler().spawn_service(label, move || {
            let Some(target) = target.upgrade() else {
                return;
            };
            if let Err(e) = target.receive_message(&message) {
                log::error!("Loopback delivery failed: {}", e);
                network.errors.lock().push(e);
            }
        });
        Ok(())
    }
}

struct LoopbackEndpoint {
    network: Arc<LoopbackNetwork>,
    local: ProcessId,
}

impl Transport for LoopbackEndpoint {
    fn topology(&self) -> Topology {
        Topology {
            local: self.local,
            processes: self.network.processes,
        }
    }

    fn send(&self, message: Message, to: ProcessId) -> Result<(), DistError> {
        self.network.deliver(message, to)
    }

    fn broadcast(&self, message: Message) -> Result<(), DistError> {
        for peer in self.topology().peers() {
            self.network.deliver(message.clone(), peer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_downcast_checks_type() {
        let msg = Message::new(CollectionId(3), MessageKind::PutTag, 17u32);
        assert_eq!(msg.payload::<u32>().unwrap(), &17);
        assert!(matches!(
            msg.payload::<String>(),
            Err(DistError::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn router_rejects_unknown_collections() {
        let router = Router::default();
        let err = router
            .deliver(&Message::control(CollectionId(9), MessageKind::Reset))
            .unwrap_err();
        assert!(matches!(err, DistError::UnknownCollection(CollectionId(9))));
    }

    #[test]
    fn local_transport_has_no_peers() {
        let t = LocalTransport;
        assert!(!t.topology().is_distributed());
        assert!(t.send(Message::control(CollectionId(1), MessageKind::Reset), 1).is_err());
    }
}
