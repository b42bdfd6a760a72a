//! C ABI for the packet relay stack.
//!
//! Mirrors `network_stack.h`: the host (a packet tunnel provider) calls
//! `init_stack`/`shutdown_stack` around a session, feeds raw IP datagrams
//! through `process_packet`, drains responses with `get_outbound_packet`,
//! and ticks `poll_stack` on a timer. The header exposes no handle, so
//! one process-wide stack instance lives here.
//!
//! The forwarding collaborator is the host itself on the far side of this
//! boundary: `get_forward_packet` hands it the datagrams the stack wants
//! sent to the real network, `put_forward_response` takes the replies.
//!
//! Every function reports through a status code; no panic crosses the
//! boundary.

#![warn(missing_docs)]

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use relay_common::RelayError;
use relay_stack::{ChannelForwarder, RelayStack, StackConfig, TracingAuditSink};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Once};

/// Success.
pub const RELAY_STATUS_OK: i32 = 0;
/// No packet available; `written_len` is set to 0. Not an error.
pub const RELAY_STATUS_NO_DATA: i32 = 1;
/// Data-path call before `init_stack`.
pub const RELAY_ERR_NOT_INITIALIZED: i32 = -1;
/// `init_stack` while already running.
pub const RELAY_ERR_ALREADY_INITIALIZED: i32 = -2;
/// Input failed IP validation.
pub const RELAY_ERR_MALFORMED_PACKET: i32 = -3;
/// Flow table at capacity (backpressure: slow the read loop).
pub const RELAY_ERR_FLOW_TABLE_FULL: i32 = -4;
/// Outbound queue at capacity (backpressure).
pub const RELAY_ERR_QUEUE_FULL: i32 = -5;
/// Caller buffer cannot hold the head packet; retry with a larger one.
pub const RELAY_ERR_BUFFER_TOO_SMALL: i32 = -6;
/// Forwarding collaborator refused the packet.
pub const RELAY_ERR_FORWARDING: i32 = -7;
/// Null pointer or zero length from the caller.
pub const RELAY_ERR_INVALID_ARGUMENT: i32 = -8;
/// Configuration or internal failure.
pub const RELAY_ERR_INTERNAL: i32 = -9;

/// Capacity of each direction of the host forwarding bridge.
const FORWARD_CHANNEL_CAPACITY: usize = 1024;

static STACK: RelayStack = RelayStack::new();
static BRIDGE: RwLock<Option<Arc<ForwardBridge>>> = RwLock::new(None);
static TRACING_INIT: Once = Once::new();

/// Host-facing side of the forwarding collaborator.
///
/// A packet popped from the channel but too big for the caller's buffer
/// parks in `pending` so no datagram is lost to a short read.
struct ForwardBridge {
    forwarder: Arc<ChannelForwarder>,
    pending: Mutex<Option<Bytes>>,
}

impl ForwardBridge {
    fn next_outbound(&self) -> Option<Bytes> {
        let mut pending = self.pending.lock();
        if let Some(bytes) = pending.take() {
            return Some(bytes);
        }
        self.forwarder.next_outbound()
    }

    fn park(&self, bytes: Bytes) {
        *self.pending.lock() = Some(bytes);
    }
}

fn status_code(err: &RelayError) -> i32 {
    match err {
        RelayError::NotInitialized => RELAY_ERR_NOT_INITIALIZED,
        RelayError::AlreadyInitialized => RELAY_ERR_ALREADY_INITIALIZED,
        RelayError::MalformedPacket(_) => RELAY_ERR_MALFORMED_PACKET,
        RelayError::FlowTableFull => RELAY_ERR_FLOW_TABLE_FULL,
        RelayError::QueueFull => RELAY_ERR_QUEUE_FULL,
        RelayError::BufferTooSmall { .. } => RELAY_ERR_BUFFER_TOO_SMALL,
        RelayError::ForwardingFailure(_) => RELAY_ERR_FORWARDING,
        RelayError::Io(_) | RelayError::Config(_) => RELAY_ERR_INTERNAL,
    }
}

fn guarded(f: impl FnOnce() -> i32) -> i32 {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(RELAY_ERR_INTERNAL)
}

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}

fn load_config() -> StackConfig {
    match std::env::var("RELAY_CONFIG") {
        Ok(path) => StackConfig::load(&path).unwrap_or_else(|e| {
            tracing::warn!(path = %path, error = %e, "config unusable, using defaults");
            StackConfig::default()
        }),
        Err(_) => StackConfig::default(),
    }
}

/// Initialize the relay stack. Returns 0 on success.
///
/// Reads `RELAY_CONFIG` (a JSON file path) when set, otherwise runs on
/// defaults. Calling while already running fails with
/// [`RELAY_ERR_ALREADY_INITIALIZED`].
#[no_mangle]
pub extern "C" fn init_stack() -> i32 {
    guarded(|| {
        init_tracing();

        let forwarder = Arc::new(ChannelForwarder::new(FORWARD_CHANNEL_CAPACITY));
        match STACK.init(
            load_config(),
            forwarder.clone(),
            Arc::new(TracingAuditSink),
        ) {
            Ok(()) => {
                *BRIDGE.write() = Some(Arc::new(ForwardBridge {
                    forwarder,
                    pending: Mutex::new(None),
                }));
                RELAY_STATUS_OK
            }
            Err(e) => {
                tracing::error!(error = %e, "stack init failed");
                status_code(&e)
            }
        }
    })
}

/// Shut down and discard all flows and queued packets.
///
/// Waits for in-flight data-path calls on other threads to complete.
#[no_mangle]
pub extern "C" fn shutdown_stack() {
    let _ = guarded(|| {
        STACK.shutdown();
        *BRIDGE.write() = None;
        RELAY_STATUS_OK
    });
}

/// Process one inbound IP datagram (system → stack → network).
///
/// `data`/`len` describe the raw packet bytes. Returns 0 on success.
///
/// # Safety
///
/// `data` must point to `len` readable bytes for the duration of the
/// call; the stack copies what it needs before returning.
#[no_mangle]
pub unsafe extern "C" fn process_packet(data: *const u8, len: usize) -> i32 {
    if data.is_null() || len == 0 {
        return RELAY_ERR_INVALID_ARGUMENT;
    }
    let raw = std::slice::from_raw_parts(data, len);
    guarded(|| match STACK.process_packet(raw) {
        Ok(()) => RELAY_STATUS_OK,
        Err(e) => status_code(&e),
    })
}

/// Retrieve one outbound packet (network → stack → system).
///
/// On success writes the packet into `buffer`, stores the byte count in
/// `written_len`, and dequeues it. Returns [`RELAY_STATUS_NO_DATA`] with
/// `written_len = 0` when the queue is empty. On
/// [`RELAY_ERR_BUFFER_TOO_SMALL`] the packet stays queued and the same
/// bytes are retrievable with a larger buffer.
///
/// # Safety
///
/// `buffer` must point to `buffer_len` writable bytes and `written_len`
/// to a writable `usize`.
#[no_mangle]
pub unsafe extern "C" fn get_outbound_packet(
    buffer: *mut u8,
    buffer_len: usize,
    written_len: *mut usize,
) -> i32 {
    if buffer.is_null() || written_len.is_null() {
        return RELAY_ERR_INVALID_ARGUMENT;
    }
    *written_len = 0;
    let buf = std::slice::from_raw_parts_mut(buffer, buffer_len);
    guarded(|| match STACK.get_outbound_packet(buf) {
        Ok(Some(n)) => {
            written_len.write(n);
            RELAY_STATUS_OK
        }
        Ok(None) => RELAY_STATUS_NO_DATA,
        Err(e) => status_code(&e),
    })
}

/// Drive the stack's timers: expire idle flows, collect completed
/// forwarding responses, age the outbound queue. Call periodically.
#[no_mangle]
pub extern "C" fn poll_stack() {
    let _ = guarded(|| match STACK.poll() {
        Ok(()) => RELAY_STATUS_OK,
        Err(e) => status_code(&e),
    });
}

/// Pull the next packet the stack wants delivered to the real network.
///
/// The host plays the forwarding collaborator: it drains this and sends
/// the bytes over its own sockets. Semantics match
/// [`get_outbound_packet`], including the parked-head retry on
/// [`RELAY_ERR_BUFFER_TOO_SMALL`].
///
/// # Safety
///
/// Pointer contract identical to [`get_outbound_packet`].
#[no_mangle]
pub unsafe extern "C" fn get_forward_packet(
    buffer: *mut u8,
    buffer_len: usize,
    written_len: *mut usize,
) -> i32 {
    if buffer.is_null() || written_len.is_null() {
        return RELAY_ERR_INVALID_ARGUMENT;
    }
    *written_len = 0;
    let buf = std::slice::from_raw_parts_mut(buffer, buffer_len);
    guarded(|| {
        let bridge = match BRIDGE.read().clone() {
            Some(b) => b,
            None => return RELAY_ERR_NOT_INITIALIZED,
        };
        match bridge.next_outbound() {
            Some(bytes) => {
                if bytes.len() > buf.len() {
                    bridge.park(bytes);
                    return RELAY_ERR_BUFFER_TOO_SMALL;
                }
                let n = bytes.len();
                buf[..n].copy_from_slice(&bytes);
                written_len.write(n);
                RELAY_STATUS_OK
            }
            None => RELAY_STATUS_NO_DATA,
        }
    })
}

/// Inject one response datagram from the real network.
///
/// The bytes are parsed and queued on the next `poll_stack` tick.
///
/// # Safety
///
/// `data` must point to `len` readable bytes; the call copies them.
#[no_mangle]
pub unsafe extern "C" fn put_forward_response(data: *const u8, len: usize) -> i32 {
    if data.is_null() || len == 0 {
        return RELAY_ERR_INVALID_ARGUMENT;
    }
    let raw = std::slice::from_raw_parts(data, len);
    guarded(|| {
        let bridge = match BRIDGE.read().clone() {
            Some(b) => b,
            None => return RELAY_ERR_NOT_INITIALIZED,
        };
        match bridge.forwarder.push_response(Bytes::copy_from_slice(raw)) {
            Ok(()) => RELAY_STATUS_OK,
            Err(e) => status_code(&e),
        }
    })
}
