//! JSON Schema validation of worker inputs.

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::description::ParamOverrides;

const PARAM_OVERRIDES_SCHEMA: &str = include_str!("../schemas/param_overrides.schema.json");

/// Validate a JSON instance against a JSON Schema (Draft 2020-12).
pub fn validate_json(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Parse parameter overrides, rejecting anything but a flat map of scalars.
pub fn parse_param_overrides(raw: &str) -> Result<ParamOverrides> {
    let instance: Value = serde_json::from_str(raw).context("parse params json")?;
    let schema: Value =
        serde_json::from_str(PARAM_OVERRIDES_SCHEMA).context("parse param overrides schema")?;
    validate_json(&instance, &schema)?;
    serde_json::from_value(instance).context("decode param overrides")
}
