// ABOUTME: In-process JavaScript sandbox on an embedded V8 isolate
// ABOUTME: Fresh isolate per call on a dedicated thread, captured console output, watchdog timeout

//! V8 isolates are `!Send`, so each execution gets its own OS thread with a
//! fresh `JsRuntime`. The caller races the result channel against the wall
//! clock while a watchdog thread terminates the isolate at the same deadline,
//! which is what actually stops CPU-bound loops.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde_json::Value;
use sysinfo::{ProcessRefreshKind, System};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::backend::{BackendOutcome, CancelSignal, IsolationBackend, SandboxJob};
use crate::error::{Result, SandboxError};
use crate::types::{ExecutionOutput, LogStream, ResourceUsage};

pub const TIMED_OUT: &str = "timed out";
pub const MEMORY_LIMIT_EXCEEDED: &str = "memory limit exceeded";

const SUPPORTED_LANGUAGES: &[&str] = &["javascript", "js"];

/// Strips host access and code generation, installs output capture.
/// `__PARAMS__` is replaced with the JSON encoded inputs.
const BOOTSTRAP: &str = r#"
((inputs) => {
    const lines = [];
    const render = (value) => {
        if (typeof value === 'string') return value;
        try {
            const json = JSON.stringify(value);
            return json === undefined ? String(value) : json;
        } catch (_) {
            return String(value);
        }
    };
    const capture = (...args) => { lines.push(args.map(render).join(' ')); };

    globalThis.console = Object.freeze({
        log: capture, info: capture, warn: capture, error: capture, debug: capture,
    });
    globalThis.print = capture;

    Object.defineProperty(globalThis, '__runboxDrain', {
        value: () => JSON.stringify(lines.splice(0, lines.length)),
        enumerable: false, writable: false, configurable: false,
    });

    const deepFreeze = (obj) => {
        if (obj && typeof obj === 'object') {
            Object.values(obj).forEach(deepFreeze);
            Object.freeze(obj);
        }
        return obj;
    };
    Object.defineProperty(globalThis, 'params', {
        value: deepFreeze(inputs), enumerable: true, writable: false, configurable: false,
    });

    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    const AsyncGeneratorFunction = (async function* () {}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {
        Object.defineProperty(ctor.prototype, 'constructor', {
            value: undefined, configurable: false, writable: false,
        });
    }
    delete globalThis.Deno;
    delete globalThis.eval;
    delete globalThis.Function;
})(__PARAMS__);
"#;

/// Embedded-interpreter tier. JavaScript only.
#[derive(Debug, Clone, Default)]
pub struct InProcessSandbox;

impl InProcessSandbox {
    pub fn new() -> Self {
        Self
    }

    pub fn supports_language(language: &str) -> bool {
        SUPPORTED_LANGUAGES.contains(&language.to_lowercase().as_str())
    }
}

#[async_trait]
impl IsolationBackend for InProcessSandbox {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn supports(&self, language: &str) -> bool {
        Self::supports_language(language)
    }

    async fn run(&self, job: SandboxJob, _cancel: CancelSignal) -> Result<BackendOutcome> {
        if !Self::supports_language(&job.submission.language) {
            return Err(SandboxError::UnsupportedLanguage(job.submission.language));
        }

        let timeout = job.limits.timeout();
        let heap_bytes = usize::try_from(job.limits.memory_mb().saturating_mul(1024 * 1024))
            .unwrap_or(usize::MAX);
        let params = serde_json::to_string(&job.submission.inputs)?;
        let code = job.submission.code.clone();
        let started = Instant::now();
        job.started.mark_started();

        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name(format!("runbox-v8-{}", job.execution_id))
            .spawn(move || {
                let result = run_isolated(&code, &params, timeout, heap_bytes);
                if tx.send(result).is_err() {
                    debug!("In-process result receiver dropped");
                }
            })?;

        // The watchdog terminates the isolate at the deadline; this race bounds
        // the caller even if termination is slow to land.
        let script = tokio::select! {
            result = rx => result.map_err(|_| SandboxError::Crash("sandbox thread panicked".to_string()))?,
            _ = tokio::time::sleep(timeout + Duration::from_millis(50)) => {
                warn!("In-process execution {} exceeded its deadline", job.execution_id);
                ScriptResult::TimedOut
            }
        };

        let usage = ResourceUsage {
            execution_time_ms: started.elapsed().as_millis() as u64,
            max_memory_mb: current_process_memory_mb(),
            cpu_percent: 0.0,
        };

        for line in script.output() {
            job.events.log(&job.execution_id, LogStream::Stdout, line.clone());
        }

        match script {
            ScriptResult::Completed { value, output } => Ok(BackendOutcome {
                success: true,
                output: ExecutionOutput {
                    value,
                    output,
                    exit_code: None,
                    artifacts: Vec::new(),
                    artifacts_truncated: false,
                },
                error: None,
                usage,
            }),
            ScriptResult::Threw { message, output } => Ok(BackendOutcome {
                success: false,
                output: ExecutionOutput {
                    value: Value::Null,
                    output,
                    exit_code: None,
                    artifacts: Vec::new(),
                    artifacts_truncated: false,
                },
                error: Some(message),
                usage,
            }),
            ScriptResult::HeapLimit => Ok(BackendOutcome {
                success: false,
                error: Some(MEMORY_LIMIT_EXCEEDED.to_string()),
                usage,
                ..Default::default()
            }),
            ScriptResult::TimedOut => Err(SandboxError::Timeout {
                millis: job.limits.execution_time_ms(),
            }),
        }
    }
}

/// Outcome of one isolate run, produced on the V8 thread
#[derive(Debug)]
enum ScriptResult {
    Completed { value: Value, output: Vec<String> },
    Threw { message: String, output: Vec<String> },
    HeapLimit,
    TimedOut,
}

impl ScriptResult {
    fn output(&self) -> &[String] {
        match self {
            ScriptResult::Completed { output, .. } | ScriptResult::Threw { output, .. } => output,
            ScriptResult::HeapLimit | ScriptResult::TimedOut => &[],
        }
    }
}

/// Decides whether a run finished or timed out. Whichever side settles the
/// gate first wins, so the watchdog never terminates a finished script.
#[derive(Debug, Default)]
struct RunGate(AtomicU8);

impl RunGate {
    const RUNNING: u8 = 0;
    const FINISHED: u8 = 1;
    const EXPIRED: u8 = 2;

    /// Called by the script thread. False if the deadline won.
    fn finish(&self) -> bool {
        self.settle(Self::FINISHED)
    }

    /// Called by the watchdog. False if the script already finished.
    fn expire(&self) -> bool {
        self.settle(Self::EXPIRED)
    }

    fn settle(&self, to: u8) -> bool {
        self.0
            .compare_exchange(Self::RUNNING, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the HeapLimitState owned by `run_isolated`,
    // which is declared before the runtime and therefore outlives it.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    // Headroom for the termination to unwind
    current_heap_limit + 1024 * 1024
}

/// Runs on the dedicated thread. Never touches the tokio runtime.
fn run_isolated(code: &str, params: &str, timeout: Duration, heap_bytes: usize) -> ScriptResult {
    let heap_state: Box<HeapLimitState>;
    let mut runtime = JsRuntime::new(RuntimeOptions {
        create_params: Some(v8::CreateParams::default().heap_limits(0, heap_bytes)),
        ..Default::default()
    });

    heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let bootstrap = BOOTSTRAP.replace("__PARAMS__", params);
    if let Err(e) = runtime.execute_script("[runbox:bootstrap]", bootstrap) {
        return ScriptResult::Threw {
            message: format!("sandbox bootstrap failed: {}", e),
            output: Vec::new(),
        };
    }

    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let gate = Arc::new(RunGate::default());
    let watchdog_gate = gate.clone();
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
            if watchdog_gate.expire() {
                watchdog_handle.terminate_execution();
            }
        }
    });

    let executed = runtime.execute_script("[runbox:snippet]", code.to_string());
    let finished_in_time = gate.finish();

    let _ = done_tx.send(());
    let _ = watchdog.join();

    if heap_state.triggered.load(Ordering::SeqCst) {
        return ScriptResult::HeapLimit;
    }
    if !finished_in_time {
        return ScriptResult::TimedOut;
    }

    match executed {
        Ok(global) => {
            let value = to_json(&mut runtime, global);
            ScriptResult::Completed {
                value,
                output: drain_output(&mut runtime),
            }
        }
        Err(e) => {
            let message = match e.downcast_ref::<deno_core::error::JsError>() {
                Some(js) => js
                    .exception_message
                    .trim_start_matches("Uncaught ")
                    .to_string(),
                None => e.to_string(),
            };
            ScriptResult::Threw {
                message,
                output: drain_output(&mut runtime),
            }
        }
    }
}

/// Convert the snippet's completion value to JSON
fn to_json(runtime: &mut JsRuntime, global: v8::Global<v8::Value>) -> Value {
    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, global);

    if local.is_undefined() || local.is_null() {
        return Value::Null;
    }
    if local.is_function() || local.is_symbol() {
        return Value::String(local.to_rust_string_lossy(scope));
    }

    v8::json::stringify(scope, local)
        .map(|s| s.to_rust_string_lossy(scope))
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| Value::String(local.to_rust_string_lossy(scope)))
}

fn drain_output(runtime: &mut JsRuntime) -> Vec<String> {
    let drained = match runtime.execute_script("[runbox:drain]", "__runboxDrain()".to_string()) {
        Ok(global) => global,
        Err(e) => {
            warn!("Failed to drain sandbox output: {}", e);
            return Vec::new();
        }
    };

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, drained);
    let json = local.to_rust_string_lossy(scope);
    serde_json::from_str(&json).unwrap_or_default()
}

/// Resident memory of the host process in MB
pub fn current_process_memory_mb() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory());
    system
        .process(pid)
        .map(|p| p.memory() / (1024 * 1024))
        .unwrap_or(0)
}
