//! Generated sub-experiment description.
//!
//! The generated file is a fixed preamble, one `'key' : value,` line per
//! override sorted by key, and a fixed postamble that merges the overrides
//! over the base description staged next to it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// File name of the staged base description inside a workspace.
pub const BASE_DESCRIPTION_FILE: &str = "base.cfg";
/// File name of the generated description inside a workspace.
pub const GENERATED_DESCRIPTION_FILE: &str = "description.cfg";

const PREAMBLE: &str = "\
# ----------------------------------------------------------------------
# Generated sub-experiment description.
#
# This file is written by the hypersearch worker for a single model
# evaluation. Manual changes are overwritten the next time the model
# is evaluated.
# ----------------------------------------------------------------------

config = {
";

const POSTAMBLE: &str = "\
}

merge_base_description('base.cfg', config)
";

/// Typed override value for one hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(&quote(value)),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

/// Overrides keyed by parameter name. Sorted iteration keeps output stable.
pub type ParamOverrides = BTreeMap<String, ParamValue>;

/// Render the generated description for `overrides`.
pub fn render_description(overrides: &ParamOverrides) -> String {
    let mut out = String::from(PREAMBLE);
    for (key, value) in overrides {
        out.push_str(&format!("  {} : {},\n", quote(key), value));
    }
    out.push_str(POSTAMBLE);
    out
}

/// Single-quote `input`, escaping backslashes, quotes and control characters.
fn quote(input: &str) -> String {
    let mut quoted = String::with_capacity(input.len() + 2);
    quoted.push('\'');
    for ch in input.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(rendered: &str) -> &str {
        rendered
            .strip_prefix(PREAMBLE)
            .and_then(|rest| rest.strip_suffix(POSTAMBLE))
            .expect("preamble and postamble")
    }

    #[test]
    fn renders_sorted_lines_with_typed_values() {
        let mut overrides = ParamOverrides::new();
        overrides.insert("zeta".to_string(), ParamValue::from(3));
        overrides.insert("alpha".to_string(), ParamValue::from("tanh"));
        overrides.insert("mid".to_string(), ParamValue::from(true));
        overrides.insert(
            "rate".to_string(),
            ParamValue::Number(serde_json::Number::from_f64(0.25).expect("finite")),
        );

        let rendered = render_description(&overrides);
        assert_eq!(
            body(&rendered),
            "  'alpha' : 'tanh',\n  'mid' : true,\n  'rate' : 0.25,\n  'zeta' : 3,\n"
        );
    }

    #[test]
    fn empty_overrides_render_preamble_and_postamble_only() {
        let rendered = render_description(&ParamOverrides::new());
        assert_eq!(body(&rendered), "");
        assert!(rendered.contains(BASE_DESCRIPTION_FILE));
    }

    #[test]
    fn escapes_quotes_in_keys_and_values() {
        let mut overrides = ParamOverrides::new();
        overrides.insert("it's".to_string(), ParamValue::from("a\\b'c"));
        let rendered = render_description(&overrides);
        assert_eq!(body(&rendered), "  'it\\'s' : 'a\\\\b\\'c',\n");
    }

    #[test]
    fn param_values_deserialize_untagged() {
        let parsed: ParamOverrides =
            serde_json::from_str(r#"{"a": "x", "b": 2, "c": false, "d": 1.5}"#).expect("parse");
        assert_eq!(parsed["a"], ParamValue::from("x"));
        assert_eq!(parsed["b"], ParamValue::from(2));
        assert_eq!(parsed["c"], ParamValue::from(false));
        assert!(matches!(parsed["d"], ParamValue::Number(_)));
    }
}
