//! Substitutes `{token}` placeholders in string configuration values with
//! values derived from per-process request metadata.

use crate::config::ConfigValue;
use crate::error::TemplateError;
use crate::probe::ProcessRequestRecord;

/// Expand every `{token}` occurrence in `value` using `proc_data`.
///
/// Literal text outside `{…}` runs is copied verbatim. A fully-expanded
/// string consisting only of decimal digits is coerced to
/// [`ConfigValue::Int`]; anything else stays a [`ConfigValue::Str`].
pub fn expand(value: &str, proc_data: &ProcessRequestRecord) -> Result<ConfigValue, TemplateError> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find('{') {
        let Some(end_rel) = rest[start..].find('}') else {
            out.push_str(rest);
            rest = "";
            break;
        };
        let end = start + end_rel;

        out.push_str(&rest[..start]);
        let token = &rest[start + 1..end];
        out.push_str(&resolve_token(token, proc_data)?);
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    if !out.is_empty() && out.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = out.parse::<i64>() {
            return Ok(ConfigValue::Int(n));
        }
    }
    Ok(ConfigValue::Str(out))
}

fn resolve_token(token: &str, proc_data: &ProcessRequestRecord) -> Result<String, TemplateError> {
    match token {
        "port" => proc_data
            .ports
            .first()
            .map(|p| p.to_string())
            .ok_or_else(|| TemplateError::MissingPort(token.to_string())),
        "port.high" => proc_data
            .ports
            .last()
            .map(|p| p.to_string())
            .ok_or_else(|| TemplateError::MissingPort(token.to_string())),
        other => Err(TemplateError::UnknownToken(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc_data(ports: Vec<u16>) -> ProcessRequestRecord {
        ProcessRequestRecord {
            pid: 1,
            vpid: 1,
            check: "x".into(),
            ports,
        }
    }

    #[test]
    fn literal_without_tokens_is_idempotent() {
        let p = proc_data(vec![]);
        assert_eq!(expand("http://localhost/", &p).unwrap(), ConfigValue::Str("http://localhost/".into()));
    }

    #[test]
    fn expands_port_token() {
        let p = proc_data(vec![9000, 9001]);
        assert_eq!(
            expand("http://{port}/status", &p).unwrap(),
            ConfigValue::Str("http://9000/status".into())
        );
    }

    #[test]
    fn expands_port_high_token() {
        let p = proc_data(vec![9000, 9001]);
        assert_eq!(expand("{port.high}", &p).unwrap(), ConfigValue::Int(9001));
    }

    #[test]
    fn all_digit_result_coerces_to_int() {
        let p = proc_data(vec![9000]);
        assert_eq!(expand("{port}", &p).unwrap(), ConfigValue::Int(9000));
    }

    #[test]
    fn unknown_token_errors() {
        let p = proc_data(vec![9000]);
        assert!(matches!(
            expand("{bogus}", &p),
            Err(TemplateError::UnknownToken(ref t)) if t == "bogus"
        ));
    }

    #[test]
    fn missing_port_errors() {
        let p = proc_data(vec![]);
        assert!(matches!(expand("{port}", &p), Err(TemplateError::MissingPort(_))));
    }
}
