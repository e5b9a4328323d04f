//! Single-flight cache for the compiled module
//!
//! The first caller starts compilation on a detached task; everyone arriving
//! while it runs subscribes to the same outcome. Success is kept for the
//! lifetime of the cache. Failure is handed to every waiter and then
//! forgotten, so the next call starts a fresh attempt.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use wasmtime::Engine;

use crate::module::{CompiledModule, ModuleError, ModuleSource};

type Outcome = Option<Result<Arc<CompiledModule>, ModuleError>>;

enum Slot {
    Empty,
    Pending {
        generation: u64,
        outcome: watch::Receiver<Outcome>,
    },
    Ready(Arc<CompiledModule>),
}

/// Process-wide holder of the compiled compute module
pub struct ModuleCache {
    engine: Engine,
    source: Arc<dyn ModuleSource>,
    max_module_size: u64,
    slot: Arc<Mutex<Slot>>,
    generation: AtomicU64,
    compilations: AtomicUsize,
}

impl ModuleCache {
    /// Create an empty cache; nothing is fetched until the first [`get`](Self::get)
    pub fn new(engine: Engine, source: Arc<dyn ModuleSource>, max_module_size: u64) -> Self {
        Self {
            engine,
            source,
            max_module_size,
            slot: Arc::new(Mutex::new(Slot::Empty)),
            generation: AtomicU64::new(0),
            compilations: AtomicUsize::new(0),
        }
    }

    /// Get the compiled module, compiling it if no attempt is outstanding
    #[instrument(skip(self), fields(origin = %self.source.describe()))]
    pub async fn get(&self) -> Result<Arc<CompiledModule>, ModuleError> {
        let (generation, outcome) = {
            let mut slot = lock(&self.slot);
            match &*slot {
                Slot::Ready(module) => return Ok(Arc::clone(module)),
                Slot::Pending {
                    generation,
                    outcome,
                } => {
                    debug!(generation, "waiting on in-flight compilation");
                    (*generation, outcome.clone())
                }
                Slot::Empty => self.start_compilation(&mut slot),
            }
        };

        self.wait(generation, outcome).await
    }

    /// Whether a compiled module is cached
    pub fn is_ready(&self) -> bool {
        matches!(&*lock(&self.slot), Slot::Ready(_))
    }

    /// Number of compilation attempts started so far
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    /// Engine modules are compiled against
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn start_compilation(&self, slot: &mut Slot) -> (u64, watch::Receiver<Outcome>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(None);
        *slot = Slot::Pending {
            generation,
            outcome: rx.clone(),
        };
        self.compilations.fetch_add(1, Ordering::SeqCst);
        debug!(generation, "starting compilation");

        let engine = self.engine.clone();
        let source = Arc::clone(&self.source);
        let max_module_size = self.max_module_size;
        let shared = Arc::clone(&self.slot);

        // Detached so a cancelled caller cannot strand the other waiters
        tokio::spawn(async move {
            let result = compile_from_source(engine, source, max_module_size).await;

            {
                let mut slot = lock(&shared);
                if matches!(&*slot, Slot::Pending { generation: g, .. } if *g == generation) {
                    *slot = match &result {
                        Ok(module) => Slot::Ready(Arc::clone(module)),
                        Err(_) => Slot::Empty,
                    };
                }
            }

            // Receivers may all be gone; the slot already holds the outcome
            let _ = tx.send(Some(result));
        });

        (generation, rx)
    }

    async fn wait(
        &self,
        generation: u64,
        mut outcome: watch::Receiver<Outcome>,
    ) -> Result<Arc<CompiledModule>, ModuleError> {
        match outcome.wait_for(Option::is_some).await {
            Ok(value) => match &*value {
                Some(result) => result.clone(),
                None => Err(ModuleError::Aborted("empty compilation outcome".to_string())),
            },
            Err(_) => {
                // The compilation task went away without reporting back
                let mut slot = lock(&self.slot);
                if matches!(&*slot, Slot::Pending { generation: g, .. } if *g == generation) {
                    *slot = Slot::Empty;
                }
                Err(ModuleError::Aborted(
                    "compilation task ended without a result".to_string(),
                ))
            }
        }
    }
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("source", &self.source)
            .field("max_module_size", &self.max_module_size)
            .field("ready", &self.is_ready())
            .field("compilations", &self.compilations())
            .finish()
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn compile_from_source(
    engine: Engine,
    source: Arc<dyn ModuleSource>,
    max_module_size: u64,
) -> Result<Arc<CompiledModule>, ModuleError> {
    let origin = source.describe();
    let bytes = source.fetch().await.inspect_err(|e| {
        warn!(origin, error = %e, "module fetch failed");
    })?;

    let size = bytes.len() as u64;
    if size > max_module_size {
        warn!(origin, size, limit = max_module_size, "module too large");
        return Err(ModuleError::TooLarge {
            origin,
            size,
            limit: max_module_size,
        });
    }

    let start = Instant::now();
    let task_origin = origin.clone();
    let module = tokio::task::spawn_blocking(move || {
        CompiledModule::compile(&engine, &bytes, &task_origin)
    })
    .await
    .map_err(|e| ModuleError::Aborted(e.to_string()))?
    .inspect_err(|e| warn!(origin, error = %e, "module compilation failed"))?;

    info!(
        origin,
        size,
        elapsed = format_args!("{:.3}s", start.elapsed().as_secs_f64()),
        "module compiled"
    );

    Ok(Arc::new(module))
}
