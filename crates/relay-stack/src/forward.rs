//! Forwarding collaborator seam.
//!
//! The stack never touches real sockets. Packets leave through a
//! [`Forwarder`] and responses come back either synchronously from
//! [`Forwarder::forward`] or later via [`Forwarder::poll`], which the poll
//! driver drains on every tick. Implementations must never block.

use crate::packet::Packet;
use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use relay_common::{RelayError, RelayResult};

/// External collaborator that carries packets to the real network.
pub trait Forwarder: Send + Sync {
    /// Take one packet for delivery. May return zero or more immediate
    /// response datagrams. Failure is a flow-level error, never a crash.
    fn forward(&self, packet: &Packet) -> RelayResult<Vec<Bytes>>;

    /// Responses that completed since the last call. Must not wait.
    fn poll(&self) -> Vec<Bytes>;
}

/// Discards every packet and produces no responses.
///
/// Useful for hosts that only need the validation/accounting side of the
/// stack, and as an explicit "not wired" collaborator.
#[derive(Debug, Default)]
pub struct NullForwarder;

impl Forwarder for NullForwarder {
    fn forward(&self, _packet: &Packet) -> RelayResult<Vec<Bytes>> {
        Ok(Vec::new())
    }

    fn poll(&self) -> Vec<Bytes> {
        Vec::new()
    }
}

/// Channel-backed forwarder: the collaborator lives on the far side of a
/// pair of bounded channels.
///
/// The host (or an FFI bridge) drains `outbound` and injects response
/// datagrams through the `responses` sender. A full outbound channel is a
/// [`RelayError::ForwardingFailure`]: the collaborator is not keeping up
/// and the packet is dropped rather than buffered unboundedly.
pub struct ChannelForwarder {
    outbound_tx: Sender<Bytes>,
    outbound_rx: Receiver<Bytes>,
    response_tx: Sender<Bytes>,
    response_rx: Receiver<Bytes>,
}

impl ChannelForwarder {
    /// Create with the given per-direction channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (outbound_tx, outbound_rx) = bounded(capacity);
        let (response_tx, response_rx) = bounded(capacity);
        Self {
            outbound_tx,
            outbound_rx,
            response_tx,
            response_rx,
        }
    }

    /// Pull the next packet awaiting delivery to the network, if any.
    pub fn next_outbound(&self) -> Option<Bytes> {
        self.outbound_rx.try_recv().ok()
    }

    /// Handle for the collaborator to inject response datagrams.
    pub fn response_sender(&self) -> Sender<Bytes> {
        self.response_tx.clone()
    }

    /// Inject one response datagram directly.
    pub fn push_response(&self, bytes: Bytes) -> RelayResult<()> {
        self.response_tx
            .try_send(bytes)
            .map_err(|_| RelayError::ForwardingFailure("response channel full".into()))
    }
}

impl Forwarder for ChannelForwarder {
    fn forward(&self, packet: &Packet) -> RelayResult<Vec<Bytes>> {
        match self
            .outbound_tx
            .try_send(Bytes::copy_from_slice(packet.as_bytes()))
        {
            Ok(()) => Ok(Vec::new()),
            Err(TrySendError::Full(_)) => Err(RelayError::ForwardingFailure(
                "forward channel full".into(),
            )),
            Err(TrySendError::Disconnected(_)) => Err(RelayError::ForwardingFailure(
                "forward channel disconnected".into(),
            )),
        }
    }

    fn poll(&self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(bytes) = self.response_rx.try_recv() {
            out.push(bytes);
        }
        out
    }
}
