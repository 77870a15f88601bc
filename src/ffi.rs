//! Foreign Function Interface (FFI) for cross-platform integration.
//!
//! Provides C-compatible bindings for use with:
//! - Android via JNI
//! - iOS via Swift/Objective-C
//! - Any language with C FFI support
//!
//! ## Memory Safety
//!
//! All FFI functions follow these conventions:
//! - Handles are opaque pointers to Rust-managed resources
//! - Callers must explicitly free resources using the provided free functions
//! - All strings are null-terminated C strings
//! - Errors are returned as negative integers or NULL pointers
//!
//! ## Thread Safety
//!
//! `tunlink_connect` blocks and must run on a dedicated thread; every other
//! exported function is thread-safe.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;
use std::sync::Arc;

use crate::client::{ClientConfig, ClientSession};
use crate::creds::ProvideCreds;
use crate::event::{Event, HostCallbacks};
use crate::stats::StatsBank;
use crate::tls::MemoryTlsFactory;
use crate::tun::{ChannelTun, TunPump};

/// Result code indicating success.
pub const TUNLINK_OK: c_int = 0;
/// Result code indicating generic error.
pub const TUNLINK_ERROR: c_int = -1;
/// Result code indicating invalid argument.
pub const TUNLINK_ERROR_INVALID_ARG: c_int = -2;
/// Result code indicating the connection ended with an error.
pub const TUNLINK_ERROR_CONNECT: c_int = -3;
/// Result code indicating authentication failure.
pub const TUNLINK_ERROR_AUTH: c_int = -4;

/// Host callbacks delivered over C function pointers.
///
/// `user_data` is passed back verbatim; the caller guarantees it stays valid
/// and usable from the session thread for the handle's lifetime.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TunlinkCallbacks {
    pub user_data: *mut c_void,
    /// Lifecycle event: name, info, fatal flag.
    pub on_event:
        Option<extern "C" fn(*mut c_void, *const c_char, *const c_char, c_int)>,
    /// One log line.
    pub on_log: Option<extern "C" fn(*mut c_void, *const c_char)>,
}

struct CHost {
    callbacks: TunlinkCallbacks,
}

// The caller promises user_data is usable across threads.
unsafe impl Send for CHost {}
unsafe impl Sync for CHost {}

impl HostCallbacks for CHost {
    fn event(&self, event: &Event) {
        if let Some(cb) = self.callbacks.on_event {
            let name = CString::new(event.id.name()).unwrap_or_default();
            let info = CString::new(event.info.as_str()).unwrap_or_default();
            cb(
                self.callbacks.user_data,
                name.as_ptr(),
                info.as_ptr(),
                event.fatal as c_int,
            );
        }
    }

    fn log(&self, line: &str) {
        if let Some(cb) = self.callbacks.on_log {
            let line = CString::new(line).unwrap_or_default();
            cb(self.callbacks.user_data, line.as_ptr());
        }
    }
}

/// Opaque handle to a client session.
pub struct TunlinkSession {
    session: Arc<ClientSession>,
    tun: TunPump,
}

/// Initialize the library.
///
/// Thread-safe and callable multiple times (subsequent calls are no-ops).
#[no_mangle]
pub extern "C" fn tunlink_init() -> c_int {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_target(false)
            .init();
    });
    TUNLINK_OK
}

/// Create a session from a profile string.
///
/// Returns NULL on invalid arguments.
#[no_mangle]
pub unsafe extern "C" fn tunlink_session_new(
    profile: *const c_char,
    callbacks: TunlinkCallbacks,
) -> *mut TunlinkSession {
    if profile.is_null() {
        return ptr::null_mut();
    }
    let profile = match CStr::from_ptr(profile).to_str() {
        Ok(s) => s.to_string(),
        Err(_) => return ptr::null_mut(),
    };

    let config = ClientConfig {
        profile,
        ..ClientConfig::default()
    };
    let (tun, pump) = ChannelTun::new("tunlink0");
    let session = Arc::new(ClientSession::new(
        config,
        Arc::new(CHost { callbacks }),
        Arc::new(MemoryTlsFactory::default()),
        Box::new(tun),
    ));

    Box::into_raw(Box::new(TunlinkSession { session, tun: pump }))
}

/// Install credentials. Call before `tunlink_connect`.
#[no_mangle]
pub unsafe extern "C" fn tunlink_provide_creds(
    handle: *mut TunlinkSession,
    username: *const c_char,
    password: *const c_char,
    response: *const c_char,
) -> c_int {
    let Some(handle) = handle.as_ref() else {
        return TUNLINK_ERROR_INVALID_ARG;
    };
    let to_string = |ptr: *const c_char| -> Option<String> {
        if ptr.is_null() {
            Some(String::new())
        } else {
            CStr::from_ptr(ptr).to_str().ok().map(str::to_string)
        }
    };
    let (Some(username), Some(password), Some(response)) =
        (to_string(username), to_string(password), to_string(response))
    else {
        return TUNLINK_ERROR_INVALID_ARG;
    };

    handle.session.provide_creds(ProvideCreds {
        username,
        password,
        response,
        ..ProvideCreds::default()
    });
    TUNLINK_OK
}

/// Run the session until disconnect. Blocks the calling thread.
#[no_mangle]
pub unsafe extern "C" fn tunlink_connect(handle: *mut TunlinkSession) -> c_int {
    let Some(handle) = handle.as_ref() else {
        return TUNLINK_ERROR_INVALID_ARG;
    };
    let status = handle.session.connect();
    if !status.error {
        TUNLINK_OK
    } else if status.status == "AUTH_FAILED" {
        TUNLINK_ERROR_AUTH
    } else {
        TUNLINK_ERROR_CONNECT
    }
}

/// Stop a running session. Thread-safe.
#[no_mangle]
pub unsafe extern "C" fn tunlink_stop(handle: *mut TunlinkSession) {
    if let Some(handle) = handle.as_ref() {
        handle.session.stop();
    }
}

/// Pause a running session. Thread-safe.
#[no_mangle]
pub unsafe extern "C" fn tunlink_pause(handle: *mut TunlinkSession, reason: *const c_char) {
    if let Some(handle) = handle.as_ref() {
        let reason = if reason.is_null() {
            String::new()
        } else {
            CStr::from_ptr(reason).to_string_lossy().into_owned()
        };
        handle.session.pause(&reason);
    }
}

/// Resume a paused session. Thread-safe.
#[no_mangle]
pub unsafe extern "C" fn tunlink_resume(handle: *mut TunlinkSession) {
    if let Some(handle) = handle.as_ref() {
        handle.session.resume();
    }
}

/// Reconnect after `seconds`. Thread-safe.
#[no_mangle]
pub unsafe extern "C" fn tunlink_reconnect(handle: *mut TunlinkSession, seconds: u64) {
    if let Some(handle) = handle.as_ref() {
        handle.session.reconnect(seconds);
    }
}

/// Number of readable counter slots.
#[no_mangle]
pub extern "C" fn tunlink_stats_n() -> c_int {
    StatsBank::n() as c_int
}

/// Read one counter slot. Thread-safe.
#[no_mangle]
pub unsafe extern "C" fn tunlink_stats_value(handle: *mut TunlinkSession, index: c_int) -> i64 {
    let Some(handle) = handle.as_ref() else {
        return 0;
    };
    if index < 0 {
        return 0;
    }
    handle.session.stats_value(index as usize) as i64
}

/// Stable name of counter slot `index`. Caller must not free the pointer.
#[no_mangle]
pub extern "C" fn tunlink_stats_name(index: c_int) -> *const c_char {
    use std::sync::OnceLock;
    static NAMES: OnceLock<Vec<CString>> = OnceLock::new();
    let names = NAMES.get_or_init(|| {
        (0..StatsBank::n())
            .map(|i| CString::new(StatsBank::name(i).unwrap_or("")).unwrap_or_default())
            .collect()
    });
    match names.get(index.max(0) as usize) {
        Some(name) => name.as_ptr(),
        None => ptr::null(),
    }
}

/// Feed one IP packet from the platform tun into the session.
#[no_mangle]
pub unsafe extern "C" fn tunlink_tun_write(
    handle: *mut TunlinkSession,
    data: *const u8,
    len: usize,
) -> c_int {
    let Some(handle) = handle.as_ref() else {
        return TUNLINK_ERROR_INVALID_ARG;
    };
    if data.is_null() {
        return TUNLINK_ERROR_INVALID_ARG;
    }
    let packet = std::slice::from_raw_parts(data, len).to_vec();
    handle.tun.inject(packet);
    len as c_int
}

/// Take one decrypted IP packet for the platform tun, if any.
///
/// Returns the packet length, 0 when none is pending, or a negative error.
#[no_mangle]
pub unsafe extern "C" fn tunlink_tun_read(
    handle: *mut TunlinkSession,
    buffer: *mut u8,
    buffer_len: usize,
) -> c_int {
    let Some(handle) = handle.as_ref() else {
        return TUNLINK_ERROR_INVALID_ARG;
    };
    if buffer.is_null() {
        return TUNLINK_ERROR_INVALID_ARG;
    }
    match handle.tun.outbound() {
        Some(packet) if packet.len() <= buffer_len => {
            ptr::copy_nonoverlapping(packet.as_ptr(), buffer, packet.len());
            packet.len() as c_int
        }
        Some(_) => TUNLINK_ERROR,
        None => 0,
    }
}

/// Free a session handle.
///
/// # Safety
///
/// The handle must have been returned by `tunlink_session_new` and not
/// previously freed; the session must not be running.
#[no_mangle]
pub unsafe extern "C" fn tunlink_session_free(handle: *mut TunlinkSession) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Get error description for a result code. Caller must not free the
/// pointer.
#[no_mangle]
pub extern "C" fn tunlink_error_string(code: c_int) -> *const c_char {
    let msg: &[u8] = match code {
        TUNLINK_OK => b"Success\0",
        TUNLINK_ERROR => b"Unknown error\0",
        TUNLINK_ERROR_INVALID_ARG => b"Invalid argument\0",
        TUNLINK_ERROR_CONNECT => b"Connection failed\0",
        TUNLINK_ERROR_AUTH => b"Authentication failed\0",
        _ => b"Unknown error code\0",
    };
    msg.as_ptr() as *const c_char
}
