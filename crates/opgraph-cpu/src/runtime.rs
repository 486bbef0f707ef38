//! Process-wide CPU runtime.
//!
//! Compilation needs the runtime; it is brought up lazily by
//! [`ensure_initialized`], at most once until [`shutdown`] tears it down.
//! Concurrent callers share one instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

/// Environment variable holding runtime flags.
pub const OPTIONS_ENV: &str = "OPGRAPH_CPU_OPTIONS";

/// Runtime flags, read once when the runtime comes up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuOptions {
    /// Fail execution when any computed value is NaN or infinite.
    pub check_finite: bool,
    /// Emit a `trace!` event per evaluated node.
    pub trace_kernels: bool,
}

impl CpuOptions {
    pub fn from_env() -> Self {
        match std::env::var(OPTIONS_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::default(),
        }
    }

    /// Parse comma or whitespace separated flags. Unknown flags are ignored.
    pub fn parse(value: &str) -> Self {
        let mut options = Self::default();
        for flag in value
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
        {
            match flag {
                "check-finite" => options.check_finite = true,
                "trace-kernels" => options.trace_kernels = true,
                other => warn!(flag = other, env = OPTIONS_ENV, "ignoring unknown flag"),
            }
        }
        options
    }
}

/// Shared state of an initialized runtime.
#[derive(Debug)]
pub struct Runtime {
    options: CpuOptions,
    generation: u64,
}

impl Runtime {
    pub fn options(&self) -> &CpuOptions {
        &self.options
    }

    /// Incremented every time the runtime is brought up.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

static RUNTIME: Mutex<Option<Arc<Runtime>>> = parking_lot::const_mutex(None);
static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Bring the runtime up if it is not running, and return it.
///
/// Safe to call repeatedly and from many threads.
pub fn ensure_initialized() -> Arc<Runtime> {
    let mut slot = RUNTIME.lock();
    if let Some(runtime) = slot.as_ref() {
        return Arc::clone(runtime);
    }
    let generation = GENERATION.fetch_add(1, Ordering::SeqCst) + 1;
    let options = CpuOptions::from_env();
    info!(generation, ?options, "initialized CPU runtime");
    let runtime = Arc::new(Runtime {
        options,
        generation,
    });
    *slot = Some(Arc::clone(&runtime));
    runtime
}

/// Tear the runtime down. Executables compiled earlier keep their handle.
///
/// Returns whether a runtime was running.
pub fn shutdown() -> bool {
    let taken = RUNTIME.lock().take();
    if let Some(runtime) = &taken {
        info!(generation = runtime.generation, "shut down CPU runtime");
    }
    taken.is_some()
}

pub fn is_initialized() -> bool {
    RUNTIME.lock().is_some()
}
