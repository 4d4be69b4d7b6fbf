use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};

use crate::registry::{Context, SlotExecutor};

const KERNEL_LOG_ID: &str = "lcod://kernel/log@1";
const OPTIONAL_MARKER: &str = "__lcod_optional__";
const SPREADS_KEY: &str = "__lcod_spreads__";

/// Raised by `ctx.run_slot` when a step declares no slot by that name.
/// `lcod://contract/compose/run_slot@1` downcasts against this to implement
/// its `optional` flag.
#[derive(Debug)]
pub struct SlotNotFoundError(pub String);

impl fmt::Display for SlotNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot not found: {}", self.0)
    }
}

impl std::error::Error for SlotNotFoundError {}

#[derive(Debug, Clone)]
pub struct Step {
    pub call: String,
    pub inputs: Map<String, Value>,
    pub out: Map<String, Value>,
    pub collect_path: Option<String>,
    pub children: Option<StepChildren>,
}

#[derive(Debug, Clone)]
pub enum StepChildren {
    Map(HashMap<String, Vec<Step>>),
    List(Vec<Step>),
}

// --- normalisation -------------------------------------------------------

fn strip_optional_suffix(key: &str) -> (String, bool) {
    if key.len() > 1 && key.ends_with('?') {
        (key[..key.len() - 1].to_string(), true)
    } else {
        (key.to_string(), false)
    }
}

fn wrap_optional(value: Value) -> Value {
    let mut map = Map::new();
    map.insert(OPTIONAL_MARKER.to_string(), Value::Bool(true));
    map.insert("value".to_string(), value);
    Value::Object(map)
}

fn unwrap_optional(value: &Value) -> (bool, &Value) {
    if let Value::Object(map) = value {
        if map.get(OPTIONAL_MARKER) == Some(&Value::Bool(true)) {
            if let Some(inner) = map.get("value") {
                return (true, inner);
            }
        }
    }
    (false, value)
}

fn is_spread_key(key: &str) -> bool {
    key == "..." || key.starts_with("...")
}

fn normalize_in_spread(value: &Value) -> Value {
    let mut descriptor = Map::new();
    match value {
        Value::String(s) => {
            descriptor.insert("source".to_string(), Value::String(s.clone()));
        }
        Value::Object(obj) => {
            if let Some(source) = obj.get("source").or_else(|| obj.get("value")) {
                descriptor.insert("source".to_string(), source.clone());
            }
            if let Some(pick) = obj.get("pick") {
                descriptor.insert("pick".to_string(), pick.clone());
            }
            if let Some(optional) = obj.get("optional") {
                descriptor.insert("optional".to_string(), optional.clone());
            }
        }
        other => {
            descriptor.insert("source".to_string(), other.clone());
        }
    }
    Value::Object(descriptor)
}

fn normalize_out_spread(value: &Value) -> Value {
    let mut descriptor = Map::new();
    if let Value::Object(obj) = value {
        if let Some(pick) = obj.get("pick") {
            descriptor.insert("pick".to_string(), pick.clone());
        }
        if let Some(optional) = obj.get("optional") {
            descriptor.insert("optional".to_string(), optional.clone());
        }
    }
    Value::Object(descriptor)
}

/// Expands bare-sequence/`=`/`?`/`...` sugar in a step's `in` map. Identity
/// (`=`) expands to `$.<key>`; already-canonical entries pass through
/// untouched, so repeated normalisation is a no-op.
fn normalize_in_map(raw: &Map<String, Value>) -> Map<String, Value> {
    let mut normalized = Map::new();
    let mut spreads = Vec::new();

    for (raw_key, raw_value) in raw {
        if is_spread_key(raw_key) {
            spreads.push(normalize_in_spread(raw_value));
            continue;
        }
        let (key, optional) = strip_optional_suffix(raw_key);
        let resolved = if raw_value.as_str() == Some("=") {
            Value::String(format!("$.{key}"))
        } else {
            raw_value.clone()
        };
        let stored = if optional { wrap_optional(resolved) } else { resolved };
        normalized.insert(key, stored);
    }

    if !spreads.is_empty() {
        normalized.insert(SPREADS_KEY.to_string(), Value::Array(spreads));
    }
    normalized
}

/// Same sugar as `normalize_in_map` but identity (`=`) expands to the alias
/// name itself, matching output-projection semantics.
fn normalize_out_map(raw: &Map<String, Value>) -> Map<String, Value> {
    let mut normalized = Map::new();
    let mut spreads = Vec::new();

    for (raw_key, raw_value) in raw {
        if is_spread_key(raw_key) {
            spreads.push(normalize_out_spread(raw_value));
            continue;
        }
        let (alias, optional) = strip_optional_suffix(raw_key);
        let resolved = if raw_value.as_str() == Some("=") {
            Value::String(alias.clone())
        } else {
            raw_value.clone()
        };
        let stored = if optional { wrap_optional(resolved) } else { resolved };
        normalized.insert(alias, stored);
    }

    if !spreads.is_empty() {
        normalized.insert(SPREADS_KEY.to_string(), Value::Array(spreads));
    }
    normalized
}

fn normalize_step(raw: &Value) -> Result<Step> {
    let obj = raw
        .as_object()
        .ok_or_else(|| anyhow!("compose step must be an object"))?;
    let call = obj
        .get("call")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("compose step missing `call`"))?
        .to_string();
    let raw_in = obj.get("in").and_then(Value::as_object).cloned().unwrap_or_default();
    let raw_out = obj
        .get("out")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let collect_path = obj
        .get("collectPath")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    // `slots` is accepted as a synonym for `children`, used by contracts
    // (e.g. `run_slot@1`) that want to name arbitrary slots explicitly.
    let children_raw = obj.get("children").or_else(|| obj.get("slots"));
    let children = match children_raw {
        Some(Value::Array(arr)) => Some(StepChildren::List(normalize_steps(arr)?)),
        Some(Value::Object(map)) => {
            let mut normalized = HashMap::new();
            for (name, steps_value) in map {
                let arr = steps_value
                    .as_array()
                    .ok_or_else(|| anyhow!("children slot `{name}` must be an array of steps"))?;
                normalized.insert(name.clone(), normalize_steps(arr)?);
            }
            Some(StepChildren::Map(normalized))
        }
        Some(_) => return Err(anyhow!("`children` must be an array or object of named slots")),
        None => None,
    };

    Ok(Step {
        call,
        inputs: normalize_in_map(&raw_in),
        out: normalize_out_map(&raw_out),
        collect_path,
        children,
    })
}

fn normalize_steps(arr: &[Value]) -> Result<Vec<Step>> {
    arr.iter().map(normalize_step).collect()
}

/// Canonicalises a raw `compose: [...]` array into executable `Step`s.
/// Idempotent: normalising an already-canonical document is a no-op.
pub fn parse_compose(value: &Value) -> Result<Vec<Step>> {
    let arr = value
        .as_array()
        .ok_or_else(|| anyhow!("compose document must be a list of steps"))?;
    normalize_steps(arr)
}

// --- path resolution ------------------------------------------------------

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for part in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(part)?,
            Value::Array(arr) => {
                let idx: usize = part.parse().ok()?;
                current = arr.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

fn resolve_binding_value(value: &Value, state: &Value, slot_vars: &Value) -> Option<Value> {
    match value {
        Value::String(s) if s == "__lcod_state__" => Some(state.clone()),
        Value::String(s) if s == "$slot" => Some(slot_vars.clone()),
        Value::String(s) if s == "$" => Some(state.clone()),
        Value::String(s) if s.starts_with("$slot.") => get_path(slot_vars, &s[6..]).cloned(),
        Value::String(s) if s.starts_with("$.") => get_path(state, &s[2..]).cloned(),
        // Nested step definitions are passed through unresolved so handlers
        // can evaluate them as sub-plans.
        Value::Object(obj) if obj.contains_key("call") => Some(value.clone()),
        other => Some(other.clone()),
    }
}

fn apply_input_spread(
    descriptor: &Value,
    state: &Value,
    slot_vars: &Value,
    map: &mut Map<String, Value>,
) -> Result<()> {
    let source = descriptor.get("source").and_then(Value::as_str).unwrap_or("");
    let optional = descriptor
        .get("optional")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let resolved = resolve_binding_value(&Value::String(source.to_string()), state, slot_vars);
    let Some(resolved) = resolved else {
        if optional {
            return Ok(());
        }
        return Err(anyhow!("spread source `{source}` did not resolve"));
    };
    let Some(obj) = resolved.as_object() else {
        if optional {
            return Ok(());
        }
        return Err(anyhow!("spread source `{source}` is not an object"));
    };

    match descriptor.get("pick").and_then(Value::as_array) {
        Some(keys) => {
            for key in keys {
                if let Some(key) = key.as_str() {
                    if let Some(v) = obj.get(key) {
                        map.insert(key.to_string(), v.clone());
                    }
                }
            }
        }
        None => {
            for (key, v) in obj {
                map.insert(key.clone(), v.clone());
            }
        }
    }
    Ok(())
}

/// Spread-first evaluation, then literal/path-ref/slot-ref/`__lcod_state__`/
/// optional resolution for the remaining declared keys.
fn build_input(step: &Step, state: &Value, slot_vars: &Value) -> Result<Value> {
    let mut map = Map::new();

    if let Some(spreads) = step.inputs.get(SPREADS_KEY).and_then(Value::as_array) {
        for descriptor in spreads {
            apply_input_spread(descriptor, state, slot_vars, &mut map)?;
        }
    }

    for (key, raw) in &step.inputs {
        if key == SPREADS_KEY {
            continue;
        }
        let (optional, inner) = unwrap_optional(raw);
        match resolve_binding_value(inner, state, slot_vars) {
            Some(value) => {
                map.insert(key.clone(), value);
            }
            None if !optional => {
                map.insert(key.clone(), Value::Null);
            }
            None => {}
        }
    }

    Ok(Value::Object(map))
}

fn apply_output_spread(descriptor: &Value, result: &Value, state: &mut Map<String, Value>) {
    let Some(obj) = result.as_object() else {
        return;
    };
    match descriptor.get("pick").and_then(Value::as_array) {
        Some(keys) => {
            for key in keys {
                if let Some(key) = key.as_str() {
                    if let Some(v) = obj.get(key) {
                        state.insert(key.to_string(), v.clone());
                    }
                }
            }
        }
        None => {
            for (key, v) in obj {
                state.insert(key.clone(), v.clone());
            }
        }
    }
}

/// Spread-then-keyed output application, dropping optional projections whose
/// resolved value is null.
fn apply_output(out: &Map<String, Value>, result: &Value, state: &mut Map<String, Value>) {
    if let Some(spreads) = out.get(SPREADS_KEY).and_then(Value::as_array) {
        for descriptor in spreads {
            apply_output_spread(descriptor, result, state);
        }
    }

    for (alias, proj) in out {
        if alias == SPREADS_KEY {
            continue;
        }
        let (optional, inner) = unwrap_optional(proj);
        let resolved = match inner {
            Value::String(s) if s == "$" => result.clone(),
            Value::String(key) => result
                .as_object()
                .and_then(|m| m.get(key))
                .cloned()
                .unwrap_or(Value::Null),
            other => other.clone(),
        };
        if optional && resolved.is_null() {
            continue;
        }
        state.insert(alias.clone(), resolved);
    }
}

// --- engine -----------------------------------------------------------------

struct StepSlotExecutor {
    children: Option<StepChildren>,
}

impl SlotExecutor for StepSlotExecutor {
    fn run_slot(
        &mut self,
        ctx: &mut Context,
        name: &str,
        local_state: Value,
        slot_vars: Value,
    ) -> Result<Value> {
        let steps: Option<&Vec<Step>> = match &self.children {
            Some(StepChildren::List(list)) if name == "children" => Some(list),
            Some(StepChildren::Map(map)) => map.get(name),
            _ => None,
        };
        let Some(steps) = steps else {
            return Err(SlotNotFoundError(name.to_string()).into());
        };
        ctx.push_scope();
        let result = run_compose_inner(ctx, steps, local_state, slot_vars);
        ctx.pop_scope();
        result
    }
}

fn build_meta(step: &Step, slot_vars: &Value) -> Value {
    let mut meta = Map::new();
    if let Some(children) = &step.children {
        let children_value = match children {
            StepChildren::List(list) => Value::Array(vec![Value::Null; list.len()]),
            StepChildren::Map(map) => {
                let mut m = Map::new();
                for (name, steps) in map {
                    m.insert(name.clone(), Value::Array(vec![Value::Null; steps.len()]));
                }
                Value::Object(m)
            }
        };
        meta.insert("children".to_string(), children_value);
    }
    meta.insert("slot".to_string(), slot_vars.clone());
    if let Some(path) = &step.collect_path {
        meta.insert("collectPath".to_string(), Value::String(path.clone()));
    }
    Value::Object(meta)
}

fn emit_kernel_log(ctx: &mut Context, payload: Value) {
    if !ctx.has_binding_or_registration(KERNEL_LOG_ID) {
        return;
    }
    let _ = ctx.call(KERNEL_LOG_ID, payload, None);
}

fn object_keys(value: &Value) -> Vec<Value> {
    value
        .as_object()
        .map(|m| m.keys().map(|k| Value::String(k.clone())).collect())
        .unwrap_or_default()
}

fn log_step_start(ctx: &mut Context, index: usize, call: &str, input: &Value, slot_vars: &Value) {
    emit_kernel_log(
        ctx,
        json!({
            "level": "trace",
            "message": "compose step start",
            "data": {
                "index": index,
                "call": call,
                "inputKeys": object_keys(input),
                "slotKeys": object_keys(slot_vars),
            }
        }),
    );
}

fn log_step_success(ctx: &mut Context, index: usize, call: &str, result: &Value, elapsed: Duration) {
    let result_shape = match result {
        Value::Object(_) => Value::Array(object_keys(result)),
        Value::Array(arr) => json!(arr.len()),
        other => Value::String(value_kind(other).to_string()),
    };
    emit_kernel_log(
        ctx,
        json!({
            "level": "trace",
            "message": "compose step success",
            "data": {
                "index": index,
                "call": call,
                "durationMs": elapsed.as_secs_f64() * 1000.0,
                "resultShape": result_shape,
            }
        }),
    );
}

fn log_step_error(ctx: &mut Context, index: usize, call: &str, err: &anyhow::Error, elapsed: Duration) {
    emit_kernel_log(
        ctx,
        json!({
            "level": "error",
            "message": "compose step error",
            "data": { "index": index, "call": call, "durationMs": elapsed.as_secs_f64() * 1000.0 },
            "error": { "message": err.to_string() },
        }),
    );
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn run_compose_inner(
    ctx: &mut Context,
    steps: &[Step],
    initial_state: Value,
    slot_vars: Value,
) -> Result<Value> {
    let mut state = initial_state.as_object().cloned().unwrap_or_default();

    for (index, step) in steps.iter().enumerate() {
        ctx.ensure_not_cancelled()?;

        let current_state = Value::Object(state.clone());
        let input = build_input(step, &current_state, &slot_vars)?;
        let meta = build_meta(step, &slot_vars);

        let previous_handler = ctx.replace_run_slot_handler(Some(Box::new(StepSlotExecutor {
            children: step.children.clone(),
        })));

        log_step_start(ctx, index, &step.call, &input, &slot_vars);
        ctx.push_scope();
        let start = Instant::now();
        let call_result = ctx.call(&step.call, input, Some(meta));
        ctx.pop_scope();
        ctx.replace_run_slot_handler(previous_handler);

        let result = match call_result {
            Ok(value) => value,
            Err(err) => {
                log_step_error(ctx, index, &step.call, &err, start.elapsed());
                return Err(err);
            }
        };

        apply_output(&step.out, &result, &mut state);
        log_step_success(ctx, index, &step.call, &result, start.elapsed());
    }

    Ok(Value::Object(state))
}

/// Runs a canonical compose document against `ctx`, threading `initial_state`
/// sequentially through each step.
pub fn run_compose(ctx: &mut Context, steps: &[Step], initial_state: Value) -> Result<Value> {
    run_compose_inner(ctx, steps, initial_state, Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn echo_registry() -> Registry {
        let registry = Registry::new();
        registry.register(
            "lcod://impl/echo@1",
            |_ctx: &mut Context, input: Value, _meta| Ok(input),
        );
        registry
    }

    #[test]
    fn identity_shorthand_expands_in_and_out() {
        let steps = parse_compose(&json!([
            {
                "call": "lcod://impl/echo@1",
                "in": { "foo": "=" },
                "out": { "bar": "=" }
            }
        ]))
        .unwrap();
        let step = &steps[0];
        assert_eq!(step.inputs.get("foo").unwrap(), &json!("$.foo"));
        assert_eq!(step.out.get("bar").unwrap(), &json!("bar"));
    }

    #[test]
    fn normalisation_is_idempotent() {
        let doc = json!([
            {
                "call": "lcod://impl/echo@1",
                "in": { "foo": "=", "lit?": 1 },
                "out": { "bar?": "=" },
                "children": { "then": [ { "call": "lcod://impl/echo@1" } ] }
            }
        ]);
        let once = parse_compose(&doc).unwrap();
        let reparsed: Value = json!([{
            "call": once[0].call,
            "in": Value::Object(once[0].inputs.clone()),
            "out": Value::Object(once[0].out.clone()),
        }]);
        let twice = parse_compose(&reparsed).unwrap();
        assert_eq!(twice[0].inputs, once[0].inputs);
        assert_eq!(twice[0].out, once[0].out);
    }

    #[test]
    fn optional_projection_drops_missing_output_key() {
        let registry = echo_registry();
        let mut ctx = registry.context();
        let steps = parse_compose(&json!([
            {
                "call": "lcod://impl/echo@1",
                "in": { "value": 1 },
                "out": { "missing?": "absent" }
            }
        ]))
        .unwrap();
        let result = run_compose(&mut ctx, &steps, json!({})).unwrap();
        assert_eq!(result, json!({}));
    }

    #[test]
    fn spread_copies_own_keys_of_source() {
        let registry = echo_registry();
        let mut ctx = registry.context();
        let steps = parse_compose(&json!([
            {
                "call": "lcod://impl/echo@1",
                "in": { "...": "$.payload" }
            }
        ]))
        .unwrap();
        let result = run_compose(
            &mut ctx,
            &steps,
            json!({ "payload": { "a": 1, "b": 2 } }),
        )
        .unwrap();
        assert_eq!(result, json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn spread_pick_copies_only_selected_keys() {
        let registry = echo_registry();
        let mut ctx = registry.context();
        let steps = parse_compose(&json!([
            {
                "call": "lcod://impl/echo@1",
                "in": { "...lock": { "source": "$.payload", "pick": ["a"] } }
            }
        ]))
        .unwrap();
        let result = run_compose(
            &mut ctx,
            &steps,
            json!({ "payload": { "a": 1, "b": 2 } }),
        )
        .unwrap();
        assert_eq!(result, json!({ "a": 1 }));
    }

    #[test]
    fn state_threads_sequentially() {
        let registry = echo_registry();
        let mut ctx = registry.context();
        let steps = parse_compose(&json!([
            { "call": "lcod://impl/echo@1", "in": { "value": 1 }, "out": { "first": "value" } },
            { "call": "lcod://impl/echo@1", "in": { "value": "$.first" }, "out": { "second": "value" } }
        ]))
        .unwrap();
        let result = run_compose(&mut ctx, &steps, json!({})).unwrap();
        assert_eq!(result, json!({ "first": 1, "second": 1 }));
    }
}
