use crate::Core::config::ShuffleConfig;
use crate::Core::error::{ShuffleError, ShuffleResult, TransportError};
use crate::Core::Topology::{NodeId, Rank, Topology};
use crate::Core::Transport::{IncomingHandler, Link, Responder, RpcCallback, Transport};
use crate::Shuffler::{BroadcastFlags, Shuffle, ShuffleBuilder};
use crate::Shuffler::Structs::Message;
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::Arc;

// Error codes
pub const SHUF_SUCCESS: i32 = 0;
pub const SHUF_ERROR_NULL_POINTER: i32 = -1;
pub const SHUF_ERROR_INVALID_ARG: i32 = -2;
pub const SHUF_ERROR_CONFIG: i32 = -3;
pub const SHUF_ERROR_TRANSPORT: i32 = -4;
pub const SHUF_ERROR_SHUTDOWN: i32 = -5;
pub const SHUF_ERROR_INTERNAL: i32 = -6;

/// Broadcast flag: also deliver to the caller.
pub const SHUF_BCAST_SELF: u32 = 1;

/// Topology oracle supplied by the caller. Every function receives `ctx`.
///
/// `node_of` and `representative` return a negative value for "unknown".
/// Barriers return 0 on success.
#[repr(C)]
pub struct ShufTopologyOps {
    pub ctx: *mut c_void,
    pub global_rank: extern "C" fn(ctx: *mut c_void) -> u32,
    pub global_size: extern "C" fn(ctx: *mut c_void) -> u32,
    pub local_rank: extern "C" fn(ctx: *mut c_void) -> u32,
    pub local_size: extern "C" fn(ctx: *mut c_void) -> u32,
    pub node_of: extern "C" fn(ctx: *mut c_void, rank: u32) -> i64,
    pub representative: extern "C" fn(ctx: *mut c_void, on_node: u32, for_node: u32) -> i64,
    pub local_barrier: extern "C" fn(ctx: *mut c_void) -> i32,
    pub global_barrier: extern "C" fn(ctx: *mut c_void) -> i32,
}

/// RPC transport supplied by the caller.
///
/// `send` issues an RPC named `rpc` to `dst` (`network` is nonzero for an
/// inter-node hop). The `len` bytes at `data` stay valid until the caller
/// passes `token` to [`shuf_rpc_complete`], which it must do exactly once if
/// `send` returned 0 and never otherwise. Incoming RPCs are handed to
/// [`shuf_rpc_incoming`].
#[repr(C)]
pub struct ShufTransportOps {
    pub ctx: *mut c_void,
    pub send: extern "C" fn(
        ctx: *mut c_void,
        rpc: *const c_char,
        dst: u32,
        network: i32,
        data: *const u8,
        len: usize,
        token: *mut ShufRpcToken,
    ) -> i32,
    /// Called once at `shuf_free`, after the shuffle has shut down.
    ///
    /// Supplying it hands ownership of the transport to the shuffle. Leave it
    /// NULL when the transport is shared or outlives the handle; `shuf_free`
    /// then leaves it running.
    pub finalize: Option<extern "C" fn(ctx: *mut c_void)>,
}

/// Delivery callback: one call per message, on the delivery thread.
pub type ShufDeliverFn =
    extern "C" fn(ctx: *mut c_void, src: u32, dst: u32, msg_type: u32, data: *const u8, len: usize);

/// Acknowledgement for an incoming RPC; `status` is 0 when accepted.
pub type ShufRespondFn = extern "C" fn(ctx: *mut c_void, status: i32);

/// An in-flight RPC: owns the batch bytes until completion.
pub struct ShufRpcToken {
    peer: Rank,
    payload: Vec<u8>,
    done: RpcCallback,
}

/// Handle to a shuffle instance (opaque pointer)
pub struct ShufHandle {
    inner: Shuffle,
    transport: Arc<FfiTransport>,
}

// -----------------------------------------------------------------------------
// Adapters
// -----------------------------------------------------------------------------

/// Raw C context pointer. The C side promises its callbacks are thread safe.
#[derive(Clone, Copy)]
struct CtxPtr(*mut c_void);

unsafe impl Send for CtxPtr {}
unsafe impl Sync for CtxPtr {}

struct FfiTopology {
    ctx: CtxPtr,
    global_rank: extern "C" fn(*mut c_void) -> u32,
    global_size: extern "C" fn(*mut c_void) -> u32,
    local_rank: extern "C" fn(*mut c_void) -> u32,
    local_size: extern "C" fn(*mut c_void) -> u32,
    node_of: extern "C" fn(*mut c_void, u32) -> i64,
    representative: extern "C" fn(*mut c_void, u32, u32) -> i64,
    local_barrier: extern "C" fn(*mut c_void) -> i32,
    global_barrier: extern "C" fn(*mut c_void) -> i32,
}

fn barrier_result(which: &str, status: i32) -> ShuffleResult<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(ShuffleError::Topology {
            message: format!("{which} barrier returned {status}"),
        })
    }
}

impl Topology for FfiTopology {
    fn global_rank(&self) -> Rank {
        (self.global_rank)(self.ctx.0)
    }

    fn global_size(&self) -> usize {
        (self.global_size)(self.ctx.0) as usize
    }

    fn local_rank(&self) -> usize {
        (self.local_rank)(self.ctx.0) as usize
    }

    fn local_size(&self) -> usize {
        (self.local_size)(self.ctx.0) as usize
    }

    fn node_of(&self, rank: Rank) -> Option<NodeId> {
        NodeId::try_from((self.node_of)(self.ctx.0, rank)).ok()
    }

    fn representative(&self, on_node: NodeId, for_node: NodeId) -> Option<Rank> {
        Rank::try_from((self.representative)(self.ctx.0, on_node, for_node)).ok()
    }

    fn local_barrier(&self) -> ShuffleResult<()> {
        barrier_result("local", (self.local_barrier)(self.ctx.0))
    }

    fn global_barrier(&self) -> ShuffleResult<()> {
        barrier_result("global", (self.global_barrier)(self.ctx.0))
    }
}

struct FfiTransport {
    ctx: CtxPtr,
    send: extern "C" fn(*mut c_void, *const c_char, u32, i32, *const u8, usize, *mut ShufRpcToken) -> i32,
    finalize: Option<extern "C" fn(*mut c_void)>,
    rpc_name: std::ffi::CString,
    handler: Mutex<Option<Arc<dyn IncomingHandler>>>,
}

impl Transport for FfiTransport {
    fn send(&self, rpc: &str, dst: Rank, link: Link, payload: Vec<u8>, done: RpcCallback) -> Result<(), TransportError> {
        if rpc.as_bytes() != self.rpc_name.as_bytes() {
            return Err(TransportError::NoHandler { rpc: rpc.to_string() });
        }
        let token = Box::into_raw(Box::new(ShufRpcToken { peer: dst, payload, done }));
        let (data, len) = unsafe { ((*token).payload.as_ptr(), (*token).payload.len()) };
        let network = i32::from(link == Link::Network);

        let status = (self.send)(self.ctx.0, self.rpc_name.as_ptr(), dst, network, data, len, token);
        if status != 0 {
            // The C side did not take the token; `done` is dropped uncalled.
            let _ = unsafe { Box::from_raw(token) };
            return Err(TransportError::Rejected {
                peer: dst,
                message: format!("send returned {status}"),
            });
        }
        Ok(())
    }

    fn register(&self, rpc: &str, handler: Arc<dyn IncomingHandler>) -> Result<(), TransportError> {
        if rpc.as_bytes() != self.rpc_name.as_bytes() {
            return Err(TransportError::NoHandler { rpc: rpc.to_string() });
        }
        *self.handler.lock() = Some(handler);
        Ok(())
    }

    fn deregister(&self, _rpc: &str) {
        self.handler.lock().take();
    }

    fn finalize(&self) {
        if let Some(finalize) = self.finalize {
            finalize(self.ctx.0);
        }
    }
}

struct FfiDelivery {
    ctx: CtxPtr,
    deliver: ShufDeliverFn,
}

impl FfiDelivery {
    fn deliver(&self, message: Message) {
        (self.deliver)(
            self.ctx.0,
            message.src,
            message.dst,
            message.msg_type,
            message.payload.as_ptr(),
            message.payload.len(),
        );
    }
}

fn status_of(result: ShuffleResult<()>) -> i32 {
    match result {
        Ok(()) => SHUF_SUCCESS,
        Err(err) => {
            tracing::debug!(error = %err, "shuffle call failed");
            match err {
                ShuffleError::Config { .. } | ShuffleError::Routing { .. } | ShuffleError::Topology { .. } => {
                    SHUF_ERROR_CONFIG
                }
                ShuffleError::InvalidMessage { .. } => SHUF_ERROR_INVALID_ARG,
                ShuffleError::Transport(_) => SHUF_ERROR_TRANSPORT,
                ShuffleError::Shutdown => SHUF_ERROR_SHUTDOWN,
                ShuffleError::Malformed { .. } | ShuffleError::DeliveryPanicked { .. } => SHUF_ERROR_INTERNAL,
            }
        }
    }
}

fn build_config(options: *const c_char) -> ShuffleResult<ShuffleConfig> {
    let mut config = ShuffleConfig::from_env()?;
    if options.is_null() {
        return Ok(config);
    }
    let options = unsafe { CStr::from_ptr(options) }
        .to_str()
        .map_err(|e| ShuffleError::config(format!("options are not UTF-8: {e}")))?;
    for pair in options.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ShuffleError::config(format!("option '{pair}' is not key=value")))?;
        config.set(key, value)?;
    }
    config.validate()?;
    Ok(config)
}

unsafe fn bytes<'a>(data: *const u8, len: usize) -> Option<&'a [u8]> {
    if len == 0 {
        Some(&[])
    } else if data.is_null() {
        None
    } else {
        Some(std::slice::from_raw_parts(data, len))
    }
}

// -----------------------------------------------------------------------------
// Lifecycle
// -----------------------------------------------------------------------------

/// Create a shuffle.
///
/// # Arguments
/// * `topology` - Topology operations (copied; `ctx` must outlive the handle).
/// * `transport` - Transport operations (copied; `ctx` must outlive the handle).
/// * `options` - Comma separated `key=value` options, or NULL. Applied on top
///   of `SHUFFLE_*` environment variables.
/// * `deliver` / `deliver_ctx` - Delivery callback and its context.
///
/// # Returns
/// * Pointer to `ShufHandle`, or NULL on failure.
#[no_mangle]
pub extern "C" fn shuf_init(
    topology: *const ShufTopologyOps,
    transport: *const ShufTransportOps,
    options: *const c_char,
    deliver: Option<ShufDeliverFn>,
    deliver_ctx: *mut c_void,
) -> *mut ShufHandle {
    if topology.is_null() || transport.is_null() {
        tracing::error!("shuf_init: NULL topology or transport");
        return ptr::null_mut();
    }
    let Some(deliver) = deliver else {
        tracing::error!("shuf_init: NULL delivery callback");
        return ptr::null_mut();
    };

    let config = match build_config(options) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "shuf_init: bad options");
            return ptr::null_mut();
        }
    };
    let rpc_name = match std::ffi::CString::new(config.rpc_name.clone()) {
        Ok(name) => name,
        Err(e) => {
            tracing::error!(error = %e, "shuf_init: bad rpc name");
            return ptr::null_mut();
        }
    };

    let (topo_ops, trans_ops) = unsafe { (&*topology, &*transport) };
    let topology = Arc::new(FfiTopology {
        ctx: CtxPtr(topo_ops.ctx),
        global_rank: topo_ops.global_rank,
        global_size: topo_ops.global_size,
        local_rank: topo_ops.local_rank,
        local_size: topo_ops.local_size,
        node_of: topo_ops.node_of,
        representative: topo_ops.representative,
        local_barrier: topo_ops.local_barrier,
        global_barrier: topo_ops.global_barrier,
    });
    let transport = Arc::new(FfiTransport {
        ctx: CtxPtr(trans_ops.ctx),
        send: trans_ops.send,
        finalize: trans_ops.finalize,
        rpc_name,
        handler: Mutex::new(None),
    });
    let delivery = FfiDelivery {
        ctx: CtxPtr(deliver_ctx),
        deliver,
    };

    // The C transport belongs to the caller; `finalize` runs at shuf_free.
    match ShuffleBuilder::new()
        .with_config(config)
        .build(topology, transport.clone(), move |m: Message| delivery.deliver(m))
    {
        Ok(shuffle) => Box::into_raw(Box::new(ShufHandle {
            inner: shuffle,
            transport,
        })),
        Err(e) => {
            tracing::error!(error = %e, "shuf_init failed");
            ptr::null_mut()
        }
    }
}

/// Shut the shuffle down and free the handle. Flush first if pending
/// messages matter. The transport is finalized only if `finalize` was given.
#[no_mangle]
pub extern "C" fn shuf_free(handle: *mut ShufHandle) -> i32 {
    if handle.is_null() {
        return SHUF_ERROR_NULL_POINTER;
    }
    let handle = unsafe { Box::from_raw(handle) };
    let ShufHandle { inner, transport } = *handle;
    let status = status_of(inner.shutdown());
    transport.finalize();
    status
}

// -----------------------------------------------------------------------------
// Send API
// -----------------------------------------------------------------------------

/// Send a message.
///
/// # Returns
/// * 0 once the bytes are queued (not an end-to-end acknowledgement).
#[no_mangle]
pub extern "C" fn shuf_enqueue(handle: *mut ShufHandle, dst: u32, msg_type: u32, data: *const u8, len: usize) -> i32 {
    if handle.is_null() {
        return SHUF_ERROR_NULL_POINTER;
    }
    let shuffle = unsafe { &(*handle).inner };
    let Some(slice) = (unsafe { bytes(data, len) }) else {
        return SHUF_ERROR_NULL_POINTER;
    };
    status_of(shuffle.enqueue(dst, msg_type, slice))
}

/// Send a message to every rank. `flags` may include `SHUF_BCAST_SELF`.
#[no_mangle]
pub extern "C" fn shuf_enqueue_broadcast(
    handle: *mut ShufHandle,
    msg_type: u32,
    data: *const u8,
    len: usize,
    flags: u32,
) -> i32 {
    if handle.is_null() {
        return SHUF_ERROR_NULL_POINTER;
    }
    let shuffle = unsafe { &(*handle).inner };
    let Some(slice) = (unsafe { bytes(data, len) }) else {
        return SHUF_ERROR_NULL_POINTER;
    };
    let Some(flags) = BroadcastFlags::from_bits(flags) else {
        return SHUF_ERROR_INVALID_ARG;
    };
    status_of(shuffle.enqueue_broadcast(msg_type, slice, flags))
}

// -----------------------------------------------------------------------------
// Flush API
// -----------------------------------------------------------------------------

fn with_shuffle(handle: *mut ShufHandle, f: impl FnOnce(&Shuffle) -> ShuffleResult<()>) -> i32 {
    if handle.is_null() {
        return SHUF_ERROR_NULL_POINTER;
    }
    status_of(f(unsafe { &(*handle).inner }))
}

#[no_mangle]
pub extern "C" fn shuf_flush_originqs(handle: *mut ShufHandle) -> i32 {
    with_shuffle(handle, Shuffle::flush_origin_queues)
}

#[no_mangle]
pub extern "C" fn shuf_flush_relayqs(handle: *mut ShufHandle) -> i32 {
    with_shuffle(handle, Shuffle::flush_relay_queues)
}

#[no_mangle]
pub extern "C" fn shuf_flush_remoteqs(handle: *mut ShufHandle) -> i32 {
    with_shuffle(handle, Shuffle::flush_remote_queues)
}

#[no_mangle]
pub extern "C" fn shuf_flush_delivery(handle: *mut ShufHandle) -> i32 {
    with_shuffle(handle, Shuffle::flush_delivery)
}

#[no_mangle]
pub extern "C" fn shuf_flush_all(handle: *mut ShufHandle) -> i32 {
    with_shuffle(handle, Shuffle::flush_all)
}

#[no_mangle]
pub extern "C" fn shuf_barrier(handle: *mut ShufHandle) -> i32 {
    with_shuffle(handle, Shuffle::barrier)
}

#[no_mangle]
pub extern "C" fn shuf_local_barrier(handle: *mut ShufHandle) -> i32 {
    with_shuffle(handle, Shuffle::local_barrier)
}

// -----------------------------------------------------------------------------
// Topology accessors (negative on NULL handle)
// -----------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn shuf_rank(handle: *const ShufHandle) -> i64 {
    if handle.is_null() {
        return SHUF_ERROR_NULL_POINTER as i64;
    }
    unsafe { (*handle).inner.rank() as i64 }
}

#[no_mangle]
pub extern "C" fn shuf_size(handle: *const ShufHandle) -> i64 {
    if handle.is_null() {
        return SHUF_ERROR_NULL_POINTER as i64;
    }
    unsafe { (*handle).inner.size() as i64 }
}

#[no_mangle]
pub extern "C" fn shuf_local_rank(handle: *const ShufHandle) -> i64 {
    if handle.is_null() {
        return SHUF_ERROR_NULL_POINTER as i64;
    }
    unsafe { (*handle).inner.local_rank() as i64 }
}

#[no_mangle]
pub extern "C" fn shuf_local_size(handle: *const ShufHandle) -> i64 {
    if handle.is_null() {
        return SHUF_ERROR_NULL_POINTER as i64;
    }
    unsafe { (*handle).inner.local_size() as i64 }
}

// -----------------------------------------------------------------------------
// Transport upcalls
// -----------------------------------------------------------------------------

/// Hand an incoming RPC to the shuffle. The bytes are copied before this
/// returns. `respond(respond_ctx, status)` is called exactly once, possibly
/// later and from another thread, when the batch is accepted (0) or refused.
#[no_mangle]
pub extern "C" fn shuf_rpc_incoming(
    handle: *mut ShufHandle,
    from: u32,
    data: *const u8,
    len: usize,
    respond: Option<ShufRespondFn>,
    respond_ctx: *mut c_void,
) -> i32 {
    if handle.is_null() {
        return SHUF_ERROR_NULL_POINTER;
    }
    let Some(respond) = respond else {
        return SHUF_ERROR_NULL_POINTER;
    };
    let Some(slice) = (unsafe { bytes(data, len) }) else {
        return SHUF_ERROR_NULL_POINTER;
    };

    let transport = unsafe { &(*handle).transport };
    let ctx = CtxPtr(respond_ctx);
    let reply: Responder = Box::new(move |result| {
        let ctx = ctx;
        let status = match result {
            Ok(()) => SHUF_SUCCESS,
            Err(TransportError::Closed) => SHUF_ERROR_SHUTDOWN,
            Err(_) => SHUF_ERROR_TRANSPORT,
        };
        respond(ctx.0, status);
    });

    let handler = transport.handler.lock().clone();
    match handler {
        Some(handler) => {
            handler.on_rpc(from, slice.to_vec(), reply);
            SHUF_SUCCESS
        }
        None => {
            reply(Err(TransportError::Closed));
            SHUF_ERROR_SHUTDOWN
        }
    }
}

/// Complete an RPC issued through `ShufTransportOps::send`. `status` is 0
/// when the peer accepted the batch. Consumes the token.
#[no_mangle]
pub extern "C" fn shuf_rpc_complete(token: *mut ShufRpcToken, status: i32) -> i32 {
    if token.is_null() {
        return SHUF_ERROR_NULL_POINTER;
    }
    let token = unsafe { Box::from_raw(token) };
    let ShufRpcToken { peer, payload, done } = *token;
    let result = if status == 0 {
        Ok(())
    } else if status == SHUF_ERROR_SHUTDOWN {
        Err(TransportError::Closed)
    } else {
        Err(TransportError::Failed {
            peer,
            message: format!("completion status {status} ({} bytes)", payload.len()),
        })
    };
    drop(payload);
    done(result);
    SHUF_SUCCESS
}
