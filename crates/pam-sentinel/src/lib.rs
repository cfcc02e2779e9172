//! pam_sentinel — PAM module for Sentinel face authentication.
//!
//! Thin blocking client that calls `authenticate_pam` on the sentineld
//! control socket. The PAM module never owns the camera or runs inference
//! directly.
//!
//! # Safety
//!
//! All Rust logic is wrapped in `catch_unwind` — a panic unwinding across
//! the `extern "C"` boundary would be undefined behavior.
//!
//! Every error path returns `PAM_IGNORE` (25), which tells the PAM stack to
//! skip this module and continue to the next (e.g., password). We never
//! return `PAM_AUTH_ERR` to avoid locking the user out if the daemon is
//! unavailable.

use std::ffi::CStr;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::panic;
use std::time::Duration;

use serde_json::{json, Value};

// PAM constants
const PAM_SUCCESS: libc::c_int = 0;
const PAM_AUTHINFO_UNAVAIL: libc::c_int = 9;
const PAM_IGNORE: libc::c_int = 25;

const DEFAULT_SOCKET_PATH: &str = "/run/sentinel/sentinel.sock";
/// Socket read timeout: the daemon's own session timeout plus margin.
const REPLY_TIMEOUT: Duration = Duration::from_secs(40);

extern "C" {
    fn pam_get_user(
        pamh: *mut libc::c_void,
        user: *mut *const libc::c_char,
        prompt: *const libc::c_char,
    ) -> libc::c_int;
}

/// Call `authenticate_pam` over the daemon socket and return the verdict
/// string (`SUCCESS`, `FAILURE`, `REQUIRE_2FA`, `BLOCKED_INTRUDER`,
/// `TIMEOUT`, `LOCKOUT`).
fn authenticate_face(username: &str) -> Result<String, Box<dyn std::error::Error>> {
    let socket_path =
        std::env::var("SENTINEL_SOCKET_PATH").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string());

    let stream = UnixStream::connect(&socket_path)?;
    stream.set_read_timeout(Some(REPLY_TIMEOUT))?;

    let request = json!({
        "jsonrpc": "2.0",
        "method": "authenticate_pam",
        "params": { "user": username },
        "id": 1,
    });
    let mut writer = stream.try_clone()?;
    let mut line = serde_json::to_vec(&request)?;
    line.push(b'\n');
    writer.write_all(&line)?;

    let mut response = String::new();
    BufReader::new(stream).read_line(&mut response)?;
    let response: Value = serde_json::from_str(response.trim())?;

    if let Some(error) = response.get("error") {
        return Err(format!(
            "daemon error: {}",
            error["message"].as_str().unwrap_or("unknown")
        )
        .into());
    }

    let result = &response["result"];
    if result["success"].as_bool() != Some(true) {
        return Err(format!(
            "authentication unavailable: {}",
            result["error"].as_str().unwrap_or("unknown")
        )
        .into());
    }

    Ok(result["result"].as_str().unwrap_or("FAILURE").to_string())
}

/// PAM authentication entry point.
///
/// Called by the PAM stack when `auth sufficient pam_sentinel.so` is
/// configured. Extracts the username via `pam_get_user`, then runs a full
/// face-unlock session through the daemon.
///
/// Returns:
/// - `PAM_SUCCESS` (0) if the face matched
/// - `PAM_AUTHINFO_UNAVAIL` (9) on `BLOCKED_INTRUDER` — the stack should
///   fall through to password, and the event is already audited
/// - `PAM_IGNORE` (25) on any other outcome — no match, 2FA required,
///   daemon down, error, panic
///
/// # Safety
///
/// `pamh` must be a valid PAM handle provided by the PAM framework.
/// This function is called by the PAM stack via `dlopen` — it must never
/// panic across the FFI boundary (enforced by `catch_unwind`).
#[no_mangle]
pub unsafe extern "C" fn pam_sm_authenticate(
    pamh: *mut libc::c_void,
    _flags: libc::c_int,
    _argc: libc::c_int,
    _argv: *const *const libc::c_char,
) -> libc::c_int {
    let result = panic::catch_unwind(|| {
        // Extract username from PAM handle
        let mut user_ptr: *const libc::c_char = std::ptr::null();
        let ret = pam_get_user(pamh, &mut user_ptr, std::ptr::null());
        if ret != PAM_SUCCESS || user_ptr.is_null() {
            eprintln!("pam_sentinel: failed to get username (ret={})", ret);
            return PAM_IGNORE;
        }

        let username = match CStr::from_ptr(user_ptr).to_str() {
            Ok(s) => s,
            Err(_) => {
                eprintln!("pam_sentinel: username is not valid UTF-8");
                return PAM_IGNORE;
            }
        };

        match authenticate_face(username) {
            Ok(verdict) => match verdict.as_str() {
                "SUCCESS" => {
                    eprintln!("pam_sentinel: face matched for user '{}'", username);
                    PAM_SUCCESS
                }
                "BLOCKED_INTRUDER" => {
                    eprintln!("pam_sentinel: blocked identity at camera for '{}'", username);
                    PAM_AUTHINFO_UNAVAIL
                }
                other => {
                    eprintln!("pam_sentinel: no face unlock for '{}' ({})", username, other);
                    PAM_IGNORE
                }
            },
            Err(e) => {
                eprintln!("pam_sentinel: error: {}", e);
                PAM_IGNORE
            }
        }
    });

    result.unwrap_or(PAM_IGNORE)
}

/// PAM credential management entry point (required by the PAM ABI).
///
/// Sentinel does not manage credentials — always returns `PAM_IGNORE`.
///
/// # Safety
///
/// `_pamh` must be a valid PAM handle. This function is a no-op stub.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_setcred(
    _pamh: *mut libc::c_void,
    _flags: libc::c_int,
    _argc: libc::c_int,
    _argv: *const *const libc::c_char,
) -> libc::c_int {
    PAM_IGNORE
}
