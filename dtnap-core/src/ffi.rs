//! C ABI for linking dtnap-core as a static library from C/C++ hosts.
//! Nodes, endpoints and received messages are `u64` registry tokens; errors are negative codes
//! (see `error.rs`). Blocking calls (`dtnap_bp_receive`, `dtnap_bp_send` under admission
//! control) must be made from a thread the host can spare.

use std::os::raw::c_int;
use std::slice;
use std::str;
use std::sync::Arc;

use log::warn;

use crate::access::{AccessPoint, OpenOptions, Received};
use crate::admin::AdminDatabase;
use crate::bp::{BpSendOptions, BundleMeta, Custody, Eid, Priority, ReportFlags};
use crate::error::{Error, INVALID_ARGUMENT, STALE_HANDLE};
use crate::loopback::{LoopbackBp, LoopbackNode};
use crate::proxy::Proxy;
use crate::registry::Registry;

/// Bumped on any incompatible change of the functions below.
pub const ABI_VERSION: u8 = 1;

struct NodeHandle {
    node: LoopbackNode,
    bp: Proxy<LoopbackBp>,
}

#[derive(Clone)]
struct EndpointHandle {
    node: Arc<NodeHandle>,
    ap: Arc<AccessPoint<LoopbackBp>>,
}

static NODES: Registry<Arc<NodeHandle>> = Registry::new();
static ENDPOINTS: Registry<EndpointHandle> = Registry::new();
static MESSAGES: Registry<Arc<Received<BundleMeta>>> = Registry::new();

/// Returns the ABI version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn dtnap_abi_version() -> u8 {
    ABI_VERSION
}

/// Create an in-process node with a store of `store_capacity` bytes and attach its bundle engine.
/// Returns a node token, or 0 on failure.
#[no_mangle]
pub extern "C" fn dtnap_node_create(node_nbr: u64, store_capacity: u64) -> u64 {
    let node = LoopbackNode::new(node_nbr, store_capacity as usize);
    match Proxy::attach(node.bp(), node_nbr) {
        Ok(bp) => NODES.insert(Arc::new(NodeHandle { node, bp })),
        Err(e) => {
            warn!("dtnap_node_create: {e}");
            0
        }
    }
}

/// Interrupt and close every endpoint of the node, then drop it. Returns 0, or a negative code for a stale token.
#[no_mangle]
pub extern "C" fn dtnap_node_destroy(node: u64) -> c_int {
    match NODES.remove(node) {
        Some(handle) => {
            handle.bp.shutdown();
            0
        }
        None => STALE_HANDLE,
    }
}

/// Register a bundle endpoint (UTF-8 eid of eid_len bytes). Returns 0 or a negative code.
#[no_mangle]
pub extern "C" fn dtnap_node_add_endpoint(node: u64, eid: *const u8, eid_len: usize, discard: c_int) -> c_int {
    let Some(handle) = NODES.get(node) else {
        return STALE_HANDLE;
    };
    let eid = match unsafe { eid_arg(eid, eid_len) } {
        Ok(eid) => eid,
        Err(code) => return code,
    };
    match handle.node.add_endpoint(&eid, discard != 0) {
        Ok(()) => 0,
        Err(code) => code.as_i32(),
    }
}

/// Open a bundle endpoint on the node. Returns an endpoint token (> 0) or a negative code.
#[no_mangle]
pub extern "C" fn dtnap_bp_open(
    node: u64,
    eid: *const u8,
    eid_len: usize,
    detained: c_int,
    admission_control: c_int,
) -> i64 {
    let Some(handle) = NODES.get(node) else {
        return STALE_HANDLE as i64;
    };
    let eid = match unsafe { eid_arg(eid, eid_len) } {
        Ok(eid) => eid,
        Err(code) => return code as i64,
    };
    let options = OpenOptions {
        detained: detained != 0,
        admission_control: admission_control != 0,
    };
    match handle.bp.open(eid, options) {
        Ok(ap) => ENDPOINTS.insert(EndpointHandle { node: handle, ap }) as i64,
        Err(e) => failure("dtnap_bp_open", e) as i64,
    }
}

/// Close an endpoint. A receive blocked on it returns the connection-aborted code. Returns 0 or a negative code.
#[no_mangle]
pub extern "C" fn dtnap_bp_close(ep: u64) -> c_int {
    let Some(handle) = ENDPOINTS.remove(ep) else {
        return STALE_HANDLE;
    };
    // The node may already be gone, in which case the access point is closed too.
    let _ = handle.node.bp.close(&handle.ap);
    handle.ap.close();
    0
}

/// Wake a receive blocked on the endpoint. Never blocks. Returns 0 or a negative code.
#[no_mangle]
pub extern "C" fn dtnap_bp_interrupt(ep: u64) -> c_int {
    match ENDPOINTS.get(ep) {
        Some(handle) => {
            handle.ap.interrupt();
            0
        }
        None => STALE_HANDLE,
    }
}

/// Send data_len bytes to dest (UTF-8 eid). priority: 0 bulk, 1 standard, 2 expedited.
/// custody: 0 none, 1 optional, 2 required. retx_timer in seconds, 0 for none. Returns 0 or a negative code.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn dtnap_bp_send(
    ep: u64,
    dest: *const u8,
    dest_len: usize,
    data: *const u8,
    data_len: usize,
    ttl: u32,
    priority: c_int,
    custody: c_int,
    report_flags: u8,
    ack_requested: c_int,
    retx_timer: u32,
) -> c_int {
    let Some(handle) = ENDPOINTS.get(ep) else {
        return STALE_HANDLE;
    };
    let dest = match unsafe { eid_arg(dest, dest_len) } {
        Ok(eid) => eid,
        Err(code) => return code,
    };
    if data.is_null() && data_len > 0 {
        return INVALID_ARGUMENT;
    }
    let payload: &[u8] = if data_len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(data, data_len) }
    };
    let priority = match priority {
        0 => Priority::Bulk,
        1 => Priority::Standard,
        2 => Priority::Expedited,
        _ => return INVALID_ARGUMENT,
    };
    let custody = match custody {
        0 => Custody::None,
        1 => Custody::SourceOptional,
        2 => Custody::SourceRequired,
        _ => return INVALID_ARGUMENT,
    };
    let options = BpSendOptions {
        ttl,
        priority,
        custody,
        report_flags: ReportFlags::from_bits(report_flags),
        ack_requested: ack_requested != 0,
        retx_timer,
        ..BpSendOptions::default()
    };
    match handle.ap.send(&dest, payload, &options) {
        Ok(()) => 0,
        Err(e) => failure("dtnap_bp_send", e),
    }
}

/// Block until a bundle arrives. Returns a message token (> 0) or a negative code
/// (interrupted: -4, endpoint closed meanwhile: -5).
#[no_mangle]
pub extern "C" fn dtnap_bp_receive(ep: u64) -> i64 {
    let Some(handle) = ENDPOINTS.get(ep) else {
        return STALE_HANDLE as i64;
    };
    match handle.ap.receive() {
        Ok(received) => MESSAGES.insert(Arc::new(received)) as i64,
        Err(e) => e.code() as i64,
    }
}

/// Payload length of a received message, or a negative code.
#[no_mangle]
pub extern "C" fn dtnap_message_len(msg: u64) -> i64 {
    match MESSAGES.get(msg) {
        Some(m) => m.payload.len() as i64,
        None => STALE_HANDLE as i64,
    }
}

/// Copy up to out_len payload bytes into out_buf. Returns bytes written, or a negative code.
#[no_mangle]
pub extern "C" fn dtnap_message_read(msg: u64, out_buf: *mut u8, out_len: usize) -> i64 {
    let Some(m) = MESSAGES.get(msg) else {
        return STALE_HANDLE as i64;
    };
    let n = m.payload.len().min(out_len);
    if n == 0 {
        return 0;
    }
    if out_buf.is_null() {
        return INVALID_ARGUMENT as i64;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(m.payload.as_ptr(), n);
    }
    n as i64
}

/// Write the bincode-encoded `BundleMeta` of a message to out_buf. Returns bytes written, or a negative code
/// (also when out_buf is too small).
#[no_mangle]
pub extern "C" fn dtnap_message_meta(msg: u64, out_buf: *mut u8, out_len: usize) -> i64 {
    let Some(m) = MESSAGES.get(msg) else {
        return STALE_HANDLE as i64;
    };
    let encoded = match bincode::serialize(&m.meta) {
        Ok(bytes) => bytes,
        Err(_) => return INVALID_ARGUMENT as i64,
    };
    if out_buf.is_null() || encoded.len() > out_len {
        return INVALID_ARGUMENT as i64;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(encoded.as_ptr(), encoded.len());
    }
    encoded.len() as i64
}

/// Free a received message. Returns 0 or a negative code for a stale token.
#[no_mangle]
pub extern "C" fn dtnap_message_free(msg: u64) -> c_int {
    match MESSAGES.remove(msg) {
        Some(_) => 0,
        None => STALE_HANDLE,
    }
}

/// Live objects and bytes in use in the node's store. Returns 0 or a negative code.
#[no_mangle]
pub extern "C" fn dtnap_store_usage(node: u64, out_objects: *mut u64, out_bytes: *mut u64) -> c_int {
    if out_objects.is_null() || out_bytes.is_null() {
        return INVALID_ARGUMENT;
    }
    let Some(handle) = NODES.get(node) else {
        return STALE_HANDLE;
    };
    let usage = handle.node.usage();
    unsafe {
        *out_objects = usage.objects as u64;
        *out_bytes = usage.bytes_in_use as u64;
    }
    0
}

/// Parse a UTF-8 eid from a raw buffer.
///
/// # Safety
/// `ptr` must be valid for `len` bytes when non-null.
unsafe fn eid_arg(ptr: *const u8, len: usize) -> Result<Eid, c_int> {
    if ptr.is_null() || len == 0 {
        return Err(INVALID_ARGUMENT);
    }
    let bytes = slice::from_raw_parts(ptr, len);
    let text = str::from_utf8(bytes).map_err(|_| INVALID_ARGUMENT)?;
    text.parse().map_err(|e: Error| e.code())
}

fn failure(call: &str, e: Error) -> c_int {
    if !e.is_retryable() {
        warn!("{call}: {e}");
    }
    e.code()
}
