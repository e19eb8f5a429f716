//! `${name}` placeholder expansion.
//!
//! Pure string-to-string: no environment or filesystem lookups. Every
//! placeholder must name a declared variable, `$$` is a literal `$`, and a
//! `$` followed by anything else is kept as-is.

use std::collections::BTreeMap;

use crate::ConfigError;

/// Expand every `${name}` in `input` using `vars`.
pub fn substitute(input: &str, vars: &BTreeMap<String, String>) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        if let Some(after) = tail.strip_prefix('$') {
            out.push('$');
            rest = after;
        } else if let Some(body) = tail.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| ConfigError::UnterminatedPlaceholder(input.to_string()))?;
            let name = &body[..end];
            let value = vars
                .get(name)
                .ok_or_else(|| ConfigError::UnknownVariable(name.to_string()))?;
            out.push_str(value);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = tail;
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Resolve variables that reference other variables.
///
/// Returns a map where every value is free of placeholders. A variable that
/// (transitively) references itself is a [`ConfigError::VariableCycle`].
pub fn resolve_vars(vars: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut resolved = BTreeMap::new();
    for name in vars.keys() {
        let mut stack = Vec::new();
        resolve_one(name, vars, &mut resolved, &mut stack)?;
    }
    Ok(resolved)
}

fn resolve_one(
    name: &str,
    vars: &BTreeMap<String, String>,
    resolved: &mut BTreeMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<String, ConfigError> {
    if let Some(v) = resolved.get(name) {
        return Ok(v.clone());
    }
    if stack.iter().any(|s| s == name) {
        stack.push(name.to_string());
        return Err(ConfigError::VariableCycle(stack.join(" -> ")));
    }
    let raw = vars
        .get(name)
        .ok_or_else(|| ConfigError::UnknownVariable(name.to_string()))?;

    stack.push(name.to_string());
    for dep in placeholders(raw) {
        resolve_one(dep, vars, resolved, stack)?;
    }
    stack.pop();

    let value = substitute(raw, resolved)?;
    resolved.insert(name.to_string(), value.clone());
    Ok(value)
}

/// Names referenced by `${...}` in `input`, skipping `$$` escapes.
fn placeholders(input: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        let tail = &rest[pos + 1..];
        if let Some(after) = tail.strip_prefix('$') {
            rest = after;
        } else if let Some(body) = tail.strip_prefix('{') {
            match body.find('}') {
                Some(end) => {
                    names.push(&body[..end]);
                    rest = &body[end + 1..];
                }
                None => break,
            }
        } else {
            rest = tail;
        }
    }
    names
}
