//! Shared utility functions used across the codebase.

use std::sync::{Mutex, MutexGuard};

/// Parse a boolean flag the way environment overrides spell it.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
///
/// Guarded values here are plain bookkeeping (pids, subtask lists) that stay
/// consistent even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " y ", "On"] {
            assert!(parse_bool(value), "{}", value);
        }
        for value in ["0", "false", "no", "", "maybe"] {
            assert!(!parse_bool(value), "{}", value);
        }
    }

    #[test]
    fn lock_recovers_from_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let clone = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert_eq!(*lock(&mutex), 1);
    }
}
