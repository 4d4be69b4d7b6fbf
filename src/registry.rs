use std::collections::HashMap;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

use crate::http::manager::{HttpHostControl, HttpHostManager};
use crate::schema;
use crate::streams::StreamManager;

pub trait SlotExecutor {
    fn run_slot(
        &mut self,
        ctx: &mut Context,
        name: &str,
        local_state: Value,
        slot_vars: Value,
    ) -> Result<Value>;
}

#[derive(Debug)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution cancelled")
    }
}

impl std::error::Error for CancelledError {}

/// `not_found`: no registration or binding matches the requested id.
#[derive(Debug)]
pub struct NotFoundError(pub String);

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function not found: {}", self.0)
    }
}

impl std::error::Error for NotFoundError {}

/// `missing_binding`: a contract id has no implementation bound to it.
#[derive(Debug)]
pub struct MissingBindingError(pub String);

impl fmt::Display for MissingBindingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no binding for contract: {}", self.0)
    }
}

impl std::error::Error for MissingBindingError {}

/// `input_validation_failed`: input failed the registered input schema.
#[derive(Debug)]
pub struct InputValidationError {
    pub id: String,
    pub diagnostic: String,
}

impl fmt::Display for InputValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input validation failed for {}: {}",
            self.id, self.diagnostic
        )
    }
}

impl std::error::Error for InputValidationError {}

/// `output_validation_failed`: handler output failed the registered output schema.
#[derive(Debug)]
pub struct OutputValidationError {
    pub id: String,
    pub diagnostic: String,
}

impl fmt::Display for OutputValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "output validation failed for {}: {}",
            self.id, self.diagnostic
        )
    }
}

impl std::error::Error for OutputValidationError {}

pub trait Func: Send + Sync {
    fn call(&self, ctx: &mut Context, input: Value, meta: Option<Value>) -> Result<Value>;
}

impl<F> Func for F
where
    F: Fn(&mut Context, Value, Option<Value>) -> Result<Value> + Send + Sync + 'static,
{
    fn call(&self, ctx: &mut Context, input: Value, meta: Option<Value>) -> Result<Value> {
        (self)(ctx, input, meta)
    }
}

/// Metadata frozen at registration time: declared input/output schemas, the
/// contract this implementation claims to satisfy, and the declared
/// inputs/outputs used to filter what a handler observes and exposes.
#[derive(Default, Clone)]
pub struct RegisterOptions {
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub implements: Option<String>,
    pub inputs: Option<Vec<String>>,
    pub outputs: Option<Vec<String>>,
    pub slots: Option<Vec<String>>,
}

pub struct RegistryEntry {
    handler: Arc<dyn Func>,
    opts: RegisterOptions,
}

struct RegistryInner {
    funcs: HashMap<String, Arc<RegistryEntry>>,
    bindings: HashMap<String, String>,
}

impl RegistryInner {
    fn new() -> Self {
        Self {
            funcs: HashMap::new(),
            bindings: HashMap::new(),
        }
    }
}

#[derive(Clone)]
struct RegistrySnapshot {
    bindings: HashMap<String, String>,
    funcs: HashMap<String, Arc<RegistryEntry>>,
}

pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::new())),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, func: F)
    where
        F: Func + 'static,
    {
        self.register_with_options(name, func, RegisterOptions::default());
    }

    pub fn register_with_options<F>(&self, name: impl Into<String>, func: F, opts: RegisterOptions)
    where
        F: Func + 'static,
    {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.funcs.insert(
            name.into(),
            Arc::new(RegistryEntry {
                handler: Arc::new(func),
                opts,
            }),
        );
    }

    pub fn set_binding(&self, contract: impl Into<String>, implementation: impl Into<String>) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner
            .bindings
            .insert(contract.into(), implementation.into());
    }

    pub fn set_bindings(&self, bindings: HashMap<String, String>) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        for (contract, implementation) in bindings {
            inner.bindings.insert(contract, implementation);
        }
    }

    /// Reports whether `name` has a direct registration (ignoring bindings).
    pub fn lookup_direct(&self, name: &str) -> bool {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.funcs.contains_key(name)
    }

    pub fn call(
        &self,
        ctx: &mut Context,
        name: &str,
        input: Value,
        meta: Option<Value>,
    ) -> Result<Value> {
        ctx.call(name, input, meta)
    }

    pub fn context(&self) -> Context {
        Context::new(self.inner.clone(), Arc::new(AtomicBool::new(false)))
    }

    pub fn context_with_cancellation(&self, token: Arc<AtomicBool>) -> Context {
        Context::new(self.inner.clone(), token)
    }
}

pub struct Context {
    registry: Arc<Mutex<RegistryInner>>,
    run_slot_handler: Option<Box<dyn SlotExecutor + 'static>>,
    streams: StreamManager,
    http_hosts: HttpHostManager,
    registry_scope_stack: Vec<RegistrySnapshot>,
    log_tag_stack: Vec<Map<String, Value>>,
    spec_captured_logs: Vec<Value>,
    cancellation: Arc<AtomicBool>,
    cleanup_stack: Vec<Vec<Box<dyn FnOnce() + Send>>>,
    raw_input_stack: Vec<Value>,
}

impl Context {
    fn new(registry: Arc<Mutex<RegistryInner>>, cancellation: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            run_slot_handler: None,
            streams: StreamManager::new(),
            http_hosts: HttpHostManager::new(),
            registry_scope_stack: Vec::new(),
            log_tag_stack: Vec::new(),
            spec_captured_logs: Vec::new(),
            cancellation,
            cleanup_stack: vec![Vec::new()],
            raw_input_stack: Vec::new(),
        }
    }

    fn resolve_entry(&self, name: &str) -> Result<Arc<RegistryEntry>> {
        let inner = self.registry.lock().expect("registry poisoned");
        if let Some(entry) = inner.funcs.get(name) {
            return Ok(entry.clone());
        }
        if let Some(binding) = inner.bindings.get(name) {
            if let Some(entry) = inner.funcs.get(binding) {
                return Ok(entry.clone());
            }
        }
        if name.starts_with("lcod://contract/") && !inner.bindings.contains_key(name) {
            return Err(MissingBindingError(name.to_string()).into());
        }
        Err(NotFoundError(name.to_string()).into())
    }

    /// Cancellation check, entry resolution, input sanitisation/schema
    /// validation, handler invocation, output projection/schema validation.
    pub fn call(&mut self, name: &str, input: Value, meta: Option<Value>) -> Result<Value> {
        self.ensure_not_cancelled()?;
        let entry = self.resolve_entry(name)?;

        let pushed_raw_input = entry.opts.inputs.is_some();
        if pushed_raw_input {
            self.raw_input_stack.push(input.clone());
        }
        let sanitised_input = match &entry.opts.inputs {
            Some(declared) => project_keys(&input, declared),
            None => input,
        };

        if let Some(schema) = &entry.opts.input_schema {
            if let Err(diagnostic) = schema::validate(&sanitised_input, schema) {
                if pushed_raw_input {
                    self.raw_input_stack.pop();
                }
                return Err(InputValidationError {
                    id: name.to_string(),
                    diagnostic,
                }
                .into());
            }
        }

        let result = entry.handler.call(self, sanitised_input, meta);

        if pushed_raw_input {
            self.raw_input_stack.pop();
        }

        let output = result?;

        let output = match &entry.opts.outputs {
            Some(declared) => project_keys(&output, declared),
            None => output,
        };

        if let Some(schema) = &entry.opts.output_schema {
            if let Err(diagnostic) = schema::validate(&output, schema) {
                return Err(OutputValidationError {
                    id: name.to_string(),
                    diagnostic,
                }
                .into());
            }
        }

        Ok(output)
    }

    pub fn replace_run_slot_handler(
        &mut self,
        handler: Option<Box<dyn SlotExecutor + 'static>>,
    ) -> Option<Box<dyn SlotExecutor + 'static>> {
        std::mem::replace(&mut self.run_slot_handler, handler)
    }

    pub fn run_slot(
        &mut self,
        name: &str,
        local_state: Option<Value>,
        slot_vars: Option<Value>,
    ) -> Result<Value> {
        self.ensure_not_cancelled()?;
        let result = self.run_slot_bypassing_cancellation(name, local_state, slot_vars);
        self.ensure_not_cancelled()?;
        result
    }

    /// Like `run_slot` but skips the cancellation gate on entry. Reserved for
    /// `try`'s `finally` slot, which spec.md §5 requires to run even when
    /// cancellation is already pending.
    pub fn run_slot_bypassing_cancellation(
        &mut self,
        name: &str,
        local_state: Option<Value>,
        slot_vars: Option<Value>,
    ) -> Result<Value> {
        let mut handler = self
            .run_slot_handler
            .take()
            .ok_or_else(|| anyhow!("runSlot not available in this context"))?;
        let local = local_state.unwrap_or(Value::Null);
        let slot = slot_vars.unwrap_or(Value::Null);
        let result = handler.run_slot(self, name, local, slot);
        self.run_slot_handler = Some(handler);
        result
    }

    /// Sugar over `run_slot("children", ...)` for handlers that only ever
    /// run a single, unnamed child sequence.
    pub fn run_children(
        &mut self,
        local_state: Option<Value>,
        slot_vars: Option<Value>,
    ) -> Result<Value> {
        self.run_slot("children", local_state, slot_vars)
    }

    pub fn push_scope(&mut self) {
        self.cleanup_stack.push(Vec::new());
    }

    pub fn pop_scope(&mut self) {
        if let Some(finalisers) = self.cleanup_stack.pop() {
            for finaliser in finalisers.into_iter().rev() {
                finaliser();
            }
        }
    }

    /// Registers a finaliser that runs once, LIFO, when the current cleanup
    /// scope is popped.
    pub fn defer<F>(&mut self, finaliser: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.cleanup_stack.is_empty() {
            self.cleanup_stack.push(Vec::new());
        }
        self.cleanup_stack
            .last_mut()
            .expect("cleanup scope always present")
            .push(Box::new(finaliser));
    }

    pub fn current_raw_input(&self) -> Option<&Value> {
        self.raw_input_stack.last()
    }

    pub fn streams_mut(&mut self) -> &mut StreamManager {
        &mut self.streams
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn register_http_host(&mut self, control: HttpHostControl) -> Value {
        self.http_hosts.register(control)
    }

    pub fn stop_http_host(&mut self, handle: &Value) -> Result<Value> {
        self.http_hosts.stop(handle)
    }

    pub fn stop_all_http_hosts(&mut self) {
        self.http_hosts.stop_all();
    }

    pub fn enter_registry_scope(&mut self, bindings: Option<HashMap<String, String>>) -> Result<()> {
        let snapshot = {
            let inner = self.registry.lock().expect("registry poisoned");
            RegistrySnapshot {
                bindings: inner.bindings.clone(),
                funcs: inner.funcs.clone(),
            }
        };
        let mut merged_bindings = snapshot.bindings.clone();
        if let Some(overrides) = bindings {
            for (contract, implementation) in overrides {
                merged_bindings.insert(contract, implementation);
            }
        }
        {
            let mut inner = self.registry.lock().expect("registry poisoned");
            inner.bindings = merged_bindings;
        }
        self.registry_scope_stack.push(snapshot);
        Ok(())
    }

    pub fn leave_registry_scope(&mut self) -> Result<()> {
        if let Some(previous) = self.registry_scope_stack.pop() {
            let mut inner = self.registry.lock().expect("registry poisoned");
            inner.bindings = previous.bindings;
            inner.funcs = previous.funcs;
        }
        Ok(())
    }

    pub fn fork(&self) -> Context {
        let mut cloned = Context::new(self.registry.clone(), self.cancellation.clone());
        cloned.log_tag_stack = self.log_tag_stack.clone();
        cloned.spec_captured_logs = self.spec_captured_logs.clone();
        cloned
    }

    pub fn registry_clone(&self) -> Registry {
        Registry {
            inner: self.registry.clone(),
        }
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation.clone()
    }

    pub fn set_cancellation_token(&mut self, token: Arc<AtomicBool>) {
        self.cancellation = token;
    }

    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::SeqCst)
    }

    pub fn ensure_not_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CancelledError.into())
        } else {
            Ok(())
        }
    }

    pub fn push_log_tags(&mut self, tags: Map<String, Value>) {
        if tags.is_empty() {
            return;
        }
        self.log_tag_stack.push(tags);
    }

    pub fn pop_log_tags(&mut self) {
        self.log_tag_stack.pop();
    }

    pub fn log_tag_stack(&self) -> &[Map<String, Value>] {
        &self.log_tag_stack
    }

    pub fn binding_for(&self, contract: &str) -> Option<String> {
        let inner = self.registry.lock().expect("registry poisoned");
        inner.bindings.get(contract).cloned()
    }

    /// Reports whether `id` (direct registration or bound contract) exists.
    pub fn has_binding_or_registration(&self, id: &str) -> bool {
        let inner = self.registry.lock().expect("registry poisoned");
        inner.funcs.contains_key(id) || inner.bindings.contains_key(id)
    }

    pub fn push_spec_log(&mut self, entry: Value) {
        self.spec_captured_logs.push(entry);
    }

    pub fn spec_captured_logs(&self) -> &[Value] {
        &self.spec_captured_logs
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.http_hosts.stop_all();
        while let Some(finalisers) = self.cleanup_stack.pop() {
            for finaliser in finalisers.into_iter().rev() {
                finaliser();
            }
        }
    }
}

/// Projects `value` down to `keys`, filling missing keys with `null` and
/// dropping anything not declared.
fn project_keys(value: &Value, keys: &[String]) -> Value {
    let source = value.as_object();
    let mut out = Map::new();
    for key in keys {
        let projected = source
            .and_then(|map| map.get(key))
            .cloned()
            .unwrap_or(Value::Null);
        out.insert(key.clone(), projected);
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_resolves_direct_and_bound_ids() {
        let registry = Registry::new();
        registry.register("lcod://impl/echo@1", |_ctx: &mut Context, input, _meta| {
            Ok(input)
        });
        registry.set_binding("lcod://contract/echo@1", "lcod://impl/echo@1");

        let mut ctx = registry.context();
        let direct = ctx.call("lcod://impl/echo@1", json!({ "v": 1 }), None).unwrap();
        assert_eq!(direct, json!({ "v": 1 }));

        let bound = ctx.call("lcod://contract/echo@1", json!({ "v": 2 }), None).unwrap();
        assert_eq!(bound, json!({ "v": 2 }));
    }

    #[test]
    fn call_fails_missing_binding_and_not_found() {
        let registry = Registry::new();
        let mut ctx = registry.context();

        let err = ctx
            .call("lcod://contract/missing@1", json!(null), None)
            .unwrap_err();
        assert!(err.is::<MissingBindingError>());

        let err = ctx.call("lcod://impl/missing@1", json!(null), None).unwrap_err();
        assert!(err.is::<NotFoundError>());
    }

    #[test]
    fn declared_inputs_are_projected_and_raw_input_is_retained() {
        let registry = Registry::new();
        registry.register_with_options(
            "lcod://impl/check@1",
            |ctx: &mut Context, input: Value, _meta| {
                let raw = ctx.current_raw_input().cloned().unwrap();
                Ok(json!({ "sanitised": input, "raw": raw }))
            },
            RegisterOptions {
                inputs: Some(vec!["a".to_string()]),
                ..Default::default()
            },
        );

        let mut ctx = registry.context();
        let result = ctx
            .call("lcod://impl/check@1", json!({ "a": 1, "b": 2 }), None)
            .unwrap();
        assert_eq!(result["sanitised"], json!({ "a": 1 }));
        assert_eq!(result["raw"], json!({ "a": 1, "b": 2 }));
        assert!(ctx.current_raw_input().is_none());
    }

    #[test]
    fn declared_outputs_are_projected_missing_to_null() {
        let registry = Registry::new();
        registry.register_with_options(
            "lcod://impl/partial@1",
            |_ctx: &mut Context, _input, _meta| Ok(json!({ "kept": 1, "dropped": 2 })),
            RegisterOptions {
                outputs: Some(vec!["kept".to_string(), "missing".to_string()]),
                ..Default::default()
            },
        );
        let mut ctx = registry.context();
        let result = ctx.call("lcod://impl/partial@1", json!(null), None).unwrap();
        assert_eq!(result, json!({ "kept": 1, "missing": Value::Null }));
    }

    #[test]
    fn input_schema_violation_raises_input_validation_error() {
        let registry = Registry::new();
        registry.register_with_options(
            "lcod://impl/typed@1",
            |_ctx: &mut Context, input, _meta| Ok(input),
            RegisterOptions {
                input_schema: Some(json!({ "type": "object", "required": ["name"] })),
                ..Default::default()
            },
        );
        let mut ctx = registry.context();
        let err = ctx.call("lcod://impl/typed@1", json!({}), None).unwrap_err();
        assert!(err.is::<InputValidationError>());
    }

    #[test]
    fn defer_runs_lifo_on_scope_pop() {
        use std::sync::{Arc, Mutex};
        let registry = Registry::new();
        let mut ctx = registry.context();
        let order = Arc::new(Mutex::new(Vec::new()));

        ctx.push_scope();
        let o1 = order.clone();
        ctx.defer(move || o1.lock().unwrap().push(1));
        let o2 = order.clone();
        ctx.defer(move || o2.lock().unwrap().push(2));
        ctx.pop_scope();

        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn cancellation_is_sticky() {
        let registry = Registry::new();
        let mut ctx = registry.context();
        assert!(ctx.ensure_not_cancelled().is_ok());
        ctx.cancel();
        assert!(ctx.ensure_not_cancelled().is_err());
        assert!(ctx.is_cancelled());
    }
}
