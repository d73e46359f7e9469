use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

/// Events emitted while a batch runs.
#[derive(Clone, Debug)]
pub enum ConvertProgress {
    TrackStarted {
        index: usize,
        total: usize,
        path: PathBuf,
    },
    BlockWritten {
        index: usize,
        bytes: u64,
    },
    TrackFinished {
        index: usize,
        converted: bool,
    },
    Finished {
        converted: usize,
        total: usize,
    },
}

type ProgressCb = Box<dyn Fn(ConvertProgress) + Send + 'static>;

static CONVERT_PROGRESS_CB: OnceLock<Mutex<Option<ProgressCb>>> = OnceLock::new();

pub fn set_convert_progress_callback(cb: impl Fn(ConvertProgress) + Send + 'static) {
    let slot = CONVERT_PROGRESS_CB.get_or_init(|| Mutex::new(None));
    if let Ok(mut g) = slot.lock() {
        *g = Some(Box::new(cb));
    }
}

pub fn clear_convert_progress_callback() {
    if let Some(m) = CONVERT_PROGRESS_CB.get() {
        if let Ok(mut g) = m.lock() {
            *g = None;
        }
    }
}

pub fn emit_convert_progress(event: ConvertProgress) {
    if let Some(m) = CONVERT_PROGRESS_CB.get() {
        if let Ok(g) = m.lock() {
            if let Some(cb) = &*g {
                cb(event);
            }
        }
    }
}
