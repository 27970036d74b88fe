//! Process-wide reporting of storage failures.
//!
//! Persistent backends swallow I/O and decoding failures so that a corrupted cache degrades to
//! misses. Each failure is handed once to the installed handler, which logs by default.

use std::sync::{Arc, RwLock};

use crate::StorageError;

type Handler = Arc<dyn Fn(&StorageError) + Send + Sync>;

static HANDLER: RwLock<Option<Handler>> = RwLock::new(None);

pub fn set_storage_error_handler(handler: impl Fn(&StorageError) + Send + Sync + 'static) {
    let mut guard = HANDLER.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(Arc::new(handler));
}

/// Restores the default handler, which logs through `tracing`.
pub fn reset_storage_error_handler() {
    let mut guard = HANDLER.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = None;
}

pub fn report_storage_error(error: &StorageError) {
    let handler = HANDLER
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();

    match handler {
        Some(handler) => handler(error),
        None => tracing::error!("normalized cache storage failure: {error}"),
    }
}
