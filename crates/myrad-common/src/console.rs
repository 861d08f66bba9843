// console.rs — tool console output, once-only warnings, fatal exit

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

static VERBOSE: AtomicBool = AtomicBool::new(false);
static RD_BUFFER: Mutex<Option<String>> = Mutex::new(None);
static WARNED: Mutex<Option<HashSet<String>>> = Mutex::new(None);

pub fn set_verbose(on: bool) {
    VERBOSE.store(on, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

// ============================================================
// Redirect buffer (captures output for the MPI worker log channel)
// ============================================================

pub fn begin_redirect() {
    let mut buf = RD_BUFFER.lock().unwrap();
    *buf = Some(String::new());
}

pub fn end_redirect() -> Option<String> {
    let mut buf = RD_BUFFER.lock().unwrap();
    buf.take()
}

// ============================================================
// Printing
// ============================================================

/// General-purpose print. Appends to the redirect buffer if one is active.
pub fn qprintf(msg: &str) {
    {
        let mut buf = RD_BUFFER.lock().unwrap();
        if let Some(ref mut s) = *buf {
            s.push_str(msg);
            return;
        }
    }
    print!("{}", msg);
}

/// Verbose-only print, controlled by the -verbose switch.
pub fn qdprintf(msg: &str) {
    if is_verbose() {
        qprintf(msg);
    }
}

/// Warn exactly once per key. Geometry defects fire per-sample and would
/// otherwise flood a multi-hour run's log.
pub fn warn_once(key: &str, msg: &str) {
    let mut guard = WARNED.lock().unwrap();
    let set = guard.get_or_insert_with(HashSet::new);
    if set.insert(key.to_string()) {
        log::warn!("{}", msg);
    }
}

/// Clear the warn-once guards, e.g. between maps in a batch run.
pub fn reset_warn_once() {
    let mut guard = WARNED.lock().unwrap();
    *guard = None;
}

/// Unrecoverable error: partial lighting output would silently corrupt
/// the map, so print and exit non-zero.
pub fn fatal_error(msg: &str) -> ! {
    log::error!("{}", msg);
    eprintln!("************ ERROR ************\n{}", msg);
    std::process::exit(1);
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_captures() {
        begin_redirect();
        qprintf("hello ");
        qprintf("world");
        let captured = end_redirect().unwrap();
        assert_eq!(captured, "hello world");
    }

    #[test]
    fn test_redirect_empty_after_end() {
        begin_redirect();
        let _ = end_redirect();
        assert!(end_redirect().is_none());
    }
}
