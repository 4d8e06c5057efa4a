//! Evaluation of the site's obfuscation script.
//!
//! The script runs inside an embedded interpreter with nothing but the
//! language builtins: no console, timers, network or file access. A new
//! interpreter is created for every call.

use crate::error::EvaluationError;
use boa_engine::{property::Attribute, Context, JsString, JsValue, Source};
use serde_json::Value;

/// The variable the site's image script assigns its url list to.
pub const RESULT_VAR: &str = "d";

const LOOP_ITERATION_LIMIT: u64 = 1_000_000;
const RECURSION_LIMIT: usize = 256;

/// Runs `source` with `context` bound as global string variables and returns
/// whatever the script left in [`RESULT_VAR`].
pub fn evaluate(source: &str, context: &[(&str, &str)]) -> Result<Value, EvaluationError> {
    evaluate_with_result(source, context, RESULT_VAR)
}

pub fn evaluate_with_result(
    source: &str,
    context: &[(&str, &str)],
    result_var: &str,
) -> Result<Value, EvaluationError> {
    let mut js = Context::default();
    js.runtime_limits_mut()
        .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
    js.runtime_limits_mut().set_recursion_limit(RECURSION_LIMIT);

    for (name, value) in context {
        js.register_global_property(
            JsString::from(*name),
            JsValue::from(JsString::from(*value)),
            Attribute::all(),
        )
        .map_err(|e| EvaluationError::Script(e.to_string()))?;
    }

    js.eval(Source::from_bytes(source))
        .map_err(|e| EvaluationError::Script(e.to_string()))?;

    let global = js.global_object();
    let key = JsString::from(result_var);
    let assigned = global
        .has_property(key.clone(), &mut js)
        .map_err(|e| EvaluationError::Script(e.to_string()))?;
    if !assigned {
        return Err(EvaluationError::MissingResult(result_var.to_string()));
    }

    let value = global
        .get(key, &mut js)
        .map_err(|e| EvaluationError::Script(e.to_string()))?;
    if value.is_undefined() || value.is_null() {
        return Err(EvaluationError::MissingResult(result_var.to_string()));
    }

    value
        .to_json(&mut js)
        .map_err(|e| EvaluationError::Conversion(e.to_string()))
}
