//! Transaction id seeding.
//!
//! Each engine numbers its calls from its own 32-bit counter. The starting
//! point mixes the clock, the process id and a process-wide salt so that
//! engines created at the same moment, in this or another process on the same
//! host, start far apart and their in-flight xids do not collide at a server.
//!
//! The salt starts at zero when the process loads, advances by
//! [`XID_SALT_STRIDE`] for every engine created and is never reset. It is an
//! atomic, so engines may be created concurrently from any thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Distance between the seeds of two engines created back to back.
pub const XID_SALT_STRIDE: u32 = 0x0100_0000;

static XID_SALT: AtomicU32 = AtomicU32::new(0);

/// Returns the first xid for a new engine and advances the salt.
pub(crate) fn initial_xid() -> u32 {
    let salt = XID_SALT.fetch_add(XID_SALT_STRIDE, Ordering::Relaxed);
    // wall clock: a process-relative Instant would start every process near zero
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    salt.wrapping_add(now_ms).wrapping_add(std::process::id() << 16)
}
