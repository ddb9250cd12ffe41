//! Fixed-interval busy polling used for every asynchronous wait.
//!
//! None of these waits has a deadline. A caller that needs one must bound the
//! wait from the outside.

use std::thread;
use std::time::Duration;

/// Sleep in `interval` steps until `ready` returns true.
pub fn wait_until(interval: Duration, mut ready: impl FnMut() -> bool) {
    while !ready() {
        thread::sleep(interval);
    }
}

/// Sleep in `interval` steps until `check` yields a value.
pub fn wait_for<T>(interval: Duration, mut check: impl FnMut() -> Option<T>) -> T {
    loop {
        if let Some(value) = check() {
            return value;
        }
        thread::sleep(interval);
    }
}
