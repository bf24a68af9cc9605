//! Sandboxed execution engine.
//!
//! Every invocation builds a fresh Rhai engine on a blocking worker thread,
//! wires in the capabilities allowed by its [`CapabilityConfig`] and runs the
//! script under a wall-clock budget. When the budget elapses a watchdog flips
//! an interrupt flag which the engine's progress hook turns into a
//! termination at the next instruction. Workers that still have not returned
//! after a short grace period are abandoned.

mod error;
pub mod fetch;
pub mod policy;
pub mod utils;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Module, Position, Scope};
use serde_json::Value;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::store::{Globals, Store};

pub use error::{ExecutionError, ExecutionResult};
pub use fetch::{FetchOptions, FetchResponse};
use fetch::Fetcher;
pub use policy::{CapabilityConfig, NetworkCapability, RequestContext};

/// Extra time granted to a worker after the interrupt fires before it is
/// abandoned.
pub const ABANDON_GRACE: Duration = Duration::from_millis(500);

/// Runs scripts against the shared store.
#[derive(Clone)]
pub struct Sandbox {
    store: Arc<Store>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("store", &self.store.path())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Run the source; the result is whatever ends up in `exports`.
    Script,
    /// Evaluate the source to a callable and invoke it with no arguments.
    Job,
}

impl Sandbox {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Run `script` and return its `exports` as JSON.
    pub async fn execute(&self, script: &str, config: CapabilityConfig) -> ExecutionResult<Value> {
        self.run(script, Mode::Script, config).await
    }

    /// Evaluate a cron job expression and call the resulting function.
    pub async fn execute_job(&self, job: &str, config: CapabilityConfig) -> ExecutionResult<Value> {
        self.run(job, Mode::Job, config).await
    }

    async fn run(
        &self,
        source: &str,
        mode: Mode,
        config: CapabilityConfig,
    ) -> ExecutionResult<Value> {
        if source.trim().is_empty() {
            return Err(ExecutionError::EmptyScript);
        }
        config.validate()?;

        let invocation_id = Uuid::new_v4();
        let budget = config.timeout;
        let budget_secs = config.budget_secs();
        let started = Instant::now();
        let interrupt = Arc::new(AtomicBool::new(false));

        let watchdog = {
            let interrupt = Arc::clone(&interrupt);
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                interrupt.store(true, Ordering::Relaxed);
            })
        };

        let interpreter = Interpreter {
            invocation_id,
            store: Arc::clone(&self.store),
            globals: self.store.globals_get(),
            deadline: started + budget,
            handle: Handle::current(),
            interrupt: Arc::clone(&interrupt),
            budget_secs,
            config,
        };
        let source = source.to_string();
        let worker = tokio::task::spawn_blocking(move || interpreter.run(&source, mode));

        let result = match tokio::time::timeout(budget + ABANDON_GRACE, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ExecutionError::Panic(panic_message(join_err))),
            Err(_) => {
                interrupt.store(true, Ordering::Relaxed);
                tracing::warn!(%invocation_id, "Abandoning unresponsive script worker");
                Err(ExecutionError::Timeout { budget_secs })
            }
        };
        watchdog.abort();

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(_) => tracing::debug!(%invocation_id, duration_ms, "Script finished"),
            Err(err) => tracing::info!(
                %invocation_id,
                duration_ms,
                kind = err.kind(),
                error = %err,
                "Script failed"
            ),
        }
        result
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return "script worker cancelled".into();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "script worker panicked".into()
    }
}

/// Error value raised by host functions; classified as a capability error.
#[derive(Debug, Clone)]
struct HostFault(String);

fn host_fault(err: impl std::fmt::Display) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(HostFault(err.to_string())), Position::NONE).into()
}

fn classify(err: &EvalAltResult, budget_secs: u64) -> ExecutionError {
    match err {
        EvalAltResult::ErrorTerminated(..) => ExecutionError::Timeout { budget_secs },
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => classify(inner, budget_secs),
        EvalAltResult::ErrorRuntime(value, _) => match value.clone().try_cast::<HostFault>() {
            Some(HostFault(message)) => ExecutionError::HostCapability(message),
            None => ExecutionError::Syntax(err.to_string()),
        },
        other => ExecutionError::Syntax(other.to_string()),
    }
}

/// Everything one invocation needs, moved onto the worker thread.
struct Interpreter {
    invocation_id: Uuid,
    store: Arc<Store>,
    globals: Globals,
    deadline: Instant,
    handle: Handle,
    interrupt: Arc<AtomicBool>,
    budget_secs: u64,
    config: CapabilityConfig,
}

impl Interpreter {
    fn run(self, source: &str, mode: Mode) -> ExecutionResult<Value> {
        let engine = self.build_engine();
        let mut scope = self.build_scope()?;
        let budget_secs = self.budget_secs;

        let ast = engine
            .compile(source)
            .map_err(|err| ExecutionError::Syntax(err.to_string()))?;

        match mode {
            Mode::Script => engine
                .run_ast_with_scope(&mut scope, &ast)
                .map_err(|err| classify(&err, budget_secs))?,
            Mode::Job => {
                let target: Dynamic = engine
                    .eval_ast_with_scope(&mut scope, &ast)
                    .map_err(|err| classify(&err, budget_secs))?;
                let Some(job) = target.try_cast::<FnPtr>() else {
                    return Err(ExecutionError::Syntax(
                        "cron job must evaluate to a function".into(),
                    ));
                };
                job.call::<Dynamic>(&engine, &ast, ())
                    .map_err(|err| classify(&err, budget_secs))?;
            }
        }

        let exports = scope
            .get_value::<Dynamic>("exports")
            .map(Dynamic::flatten)
            .unwrap_or_default();
        rhai::serde::from_dynamic::<Value>(&exports)
            .map_err(|err| ExecutionError::Syntax(format!("exports cannot be converted: {err}")))
    }

    fn build_scope(&self) -> ExecutionResult<Scope<'static>> {
        let globals = rhai::serde::to_dynamic(&*self.globals)
            .map_err(|err| ExecutionError::Panic(format!("globals snapshot: {err}")))?;
        let request = match &self.config.request {
            Some(request) => rhai::serde::to_dynamic(request)
                .map_err(|err| ExecutionError::Panic(format!("request descriptor: {err}")))?,
            None => Dynamic::UNIT,
        };

        let mut scope = Scope::new();
        scope.push("exports", rhai::Map::new());
        scope.push_constant_dynamic("globals", globals);
        scope.push_constant_dynamic("request", request);
        Ok(scope)
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.set_max_call_levels(64);
        engine.set_max_expr_depths(64, 64);
        engine.set_max_string_size(16 * 1024 * 1024);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(100_000);

        let interrupt = Arc::clone(&self.interrupt);
        engine.on_progress(move |_| {
            interrupt
                .load(Ordering::Relaxed)
                .then_some(Dynamic::UNIT)
        });

        let id = self.invocation_id;
        engine.on_print(move |text| tracing::info!(invocation_id = %id, "{text}"));
        engine.on_debug(move |text, _source, pos| {
            tracing::debug!(invocation_id = %id, position = %pos, "{text}");
        });

        let fetcher = Fetcher::new(self.config.net.clone(), self.deadline, self.handle.clone());
        let by_options = fetcher.clone();
        engine.register_fn("fetch", move |options: rhai::Map| fetch_with_map(&by_options, options));
        let by_url = fetcher.clone();
        engine.register_fn("fetch", move |url: &str| {
            rhai::serde::to_dynamic(by_url.fetch(FetchOptions::get(url)))
        });

        engine.register_static_module("utils", utils_module(fetcher).into());
        if self.config.allow_cron {
            engine.register_static_module("cron", cron_module(Arc::clone(&self.store)).into());
        }
        engine
    }
}

fn fetch_with_map(fetcher: &Fetcher, options: rhai::Map) -> Result<Dynamic, Box<EvalAltResult>> {
    let response = match rhai::serde::from_dynamic::<FetchOptions>(&Dynamic::from_map(options)) {
        Ok(options) => fetcher.fetch(options),
        Err(err) => FetchResponse::failed(format!("invalid fetch options: {err}")),
    };
    rhai::serde::to_dynamic(response)
}

fn utils_module(fetcher: Fetcher) -> Module {
    let mut module = Module::new();
    module.set_native_fn("btoa", |input: &str| Ok(utils::btoa(input)));
    module.set_native_fn("atob", |input: &str| utils::atob(input).map_err(host_fault));
    module.set_native_fn("uniqid", |len: rhai::INT| {
        Ok(utils::uniqid(usize::try_from(len).unwrap_or_default()))
    });
    module.set_native_fn("md5", |input: &str| Ok(utils::md5(input)));
    module.set_native_fn("sha256", |input: &str| Ok(utils::sha256(input)));
    module.set_native_fn("sha512", |input: &str| Ok(utils::sha512(input)));
    // `bcrypt` and `bcrypt_check` are legacy names; both speak argon2 PHC strings.
    for name in ["hash_password", "bcrypt"] {
        module.set_native_fn(name, |password: &str| {
            utils::hash_password(password).map_err(host_fault)
        });
    }
    for name in ["verify_password", "bcrypt_check"] {
        module.set_native_fn(name, |hash: &str, password: &str| {
            Ok(utils::verify_password(hash, password))
        });
    }
    module.set_native_fn("fetch", move |options: rhai::Map| fetch_with_map(&fetcher, options));
    module
}

fn cron_module(store: Arc<Store>) -> Module {
    let mut module = Module::new();

    let reader = Arc::clone(&store);
    module.set_native_fn("list", move || rhai::serde::to_dynamic(reader.crons_get()));

    let writer = Arc::clone(&store);
    module.set_native_fn("set", move |key: &str, interval: &str, job: &str| {
        writer.crons_set(key, interval, job).map_err(host_fault)
    });

    module.set_native_fn("unset", move |key: &str| store.crons_unset(key).map_err(host_fault));
    module
}
