//  Zmirror: ZFS snapshot replication with bookmark-aware planning
//  Copyright (C) 2026  The zmirror authors

//  This program is free software: you can redistribute it and/or modify
//  it under the terms of the GNU General Public License as published by
//  the Free Software Foundation, either version 3 of the License, or
//  (at your option) any later version.

//  This program is distributed in the hope that it will be useful,
//  but WITHOUT ANY WARRANTY; without even the implied warranty of
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//  GNU General Public License for more details.

//  You should have received a copy of the GNU General Public License
//  along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::repl::error::{Error, Result};
use regex_lite::Regex;
use std::collections::HashMap;

/// Parses the --log-config-file payload: JSON with two comment conventions
/// (a line whose first non-whitespace character is `#` is dropped; a `#…#`
/// run within a line is stripped) and `${NAME[:DEFAULT]}` interpolation
/// resolved against --log-config-var values.
pub fn parse(text: &str, vars: &HashMap<String, String>) -> Result<serde_json::Value> {
    let uncommented = strip_comments(text);
    let resolved = interpolate(&uncommented, vars)?;
    serde_json::from_str(&resolved)
        .map_err(|e| Error::usage(format!("malformed log config file: {e}")))
}

fn strip_comments(text: &str) -> String {
    let inline = Regex::new("#[^#]*#").expect("static pattern");
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        out.push_str(&inline.replace_all(line, ""));
        out.push('\n');
    }
    out
}

fn interpolate(text: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(Error::usage("unterminated ${…} in log config file"));
        };
        let body = &after[..end];
        let (name, default) = match body.split_once(':') {
            Some((name, default)) => (name, Some(default)),
            None => (body, None),
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::usage(format!(
                "invalid variable name {name:?} in log config file"
            )));
        }
        match vars.get(name).map(String::as_str).or(default) {
            Some(value) => out.push_str(value),
            None => {
                return Err(Error::usage(format!(
                    "undefined variable ${{{name}}} in log config file"
                )));
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Parses one --log-config-var NAME:VALUE argument.
pub fn parse_var(arg: &str) -> std::result::Result<(String, String), String> {
    let Some((name, value)) = arg.split_once(':') else {
        return Err(format!("expected NAME:VALUE, got {arg:?}"));
    };
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("invalid log config variable name {name:?}"));
    }
    Ok((name.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn plain_json_passes_through() {
        let v = parse(r#"{"level": "info"}"#, &HashMap::new()).unwrap();
        assert_eq!(v["level"], "info");
    }

    #[test]
    fn hash_line_comments_are_dropped() {
        let text = "  # a full-line comment\n{\"a\": 1}\n# another\n";
        let v = parse(text, &HashMap::new()).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn inline_hash_runs_are_stripped() {
        let text = "{\"a\": 1 #comment#, \"b\": 2}";
        let v = parse(text, &HashMap::new()).unwrap();
        assert_eq!(v["b"], 2);
    }

    #[test]
    fn interpolation_prefers_user_vars_over_defaults() {
        let text = r#"{"level": "${LEVEL:info}", "prefix": "${PREFIX:zm}"}"#;
        let v = parse(text, &vars(&[("LEVEL", "debug")])).unwrap();
        assert_eq!(v["level"], "debug");
        assert_eq!(v["prefix"], "zm");
    }

    #[test]
    fn unresolved_without_default_is_fatal() {
        let err = parse(r#"{"x": "${MISSING}"}"#, &HashMap::new()).unwrap_err();
        assert_eq!(err.exit_code(), crate::repl::error::EXIT_USAGE);
    }

    #[test]
    fn bad_variable_names_are_rejected() {
        assert!(parse(r#"{"x": "${}"}"#, &HashMap::new()).is_err());
        assert!(parse(r#"{"x": "${A B}"}"#, &HashMap::new()).is_err());
        assert!(parse(r#"{"x": "${A"}"#, &HashMap::new()).is_err());
    }

    #[test]
    fn empty_default_is_allowed() {
        let v = parse(r#"{"x": "${A:}"}"#, &HashMap::new()).unwrap();
        assert_eq!(v["x"], "");
    }

    #[test]
    fn var_argument_parsing() {
        assert_eq!(
            parse_var("name:value:with:colons").unwrap(),
            ("name".to_string(), "value:with:colons".to_string())
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var(":value").is_err());
        assert!(parse_var("bad name:v").is_err());
    }
}
