//! Validation helpers for forms and mapping of backend validation errors.

use std::collections::BTreeMap;

use serde::Deserialize;
use validator::ValidationError;

const MIN_PASSWORD_LENGTH: usize = 8;

/// Validates that a password is long enough and mixes letters with digits.
///
/// # Examples
///
/// ```ignore
/// validate_password("hunter22") // Ok
/// validate_password("short1")   // Err - too short
/// validate_password("onlyletters") // Err - no digit
/// ```
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        let mut err = ValidationError::new("password_length");
        err.message = Some(
            format!("Password must be at least {MIN_PASSWORD_LENGTH} characters").into(),
        );
        return Err(err);
    }

    let has_letter = password.chars().any(char::is_alphabetic);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_letter && has_digit) {
        let mut err = ValidationError::new("password_format");
        err.message = Some("Password must contain letters and digits".into());
        return Err(err);
    }

    Ok(())
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    loc: Vec<serde_json::Value>,
    msg: String,
}

/// Map a backend `422` body (`{"detail":[{"loc":["body","email"],"msg":".."}]}`) to field errors.
///
/// Returns `None` when the body is not structured, in which case callers show a notification.
pub fn parse_backend_errors(body: &str) -> Option<BTreeMap<String, Vec<String>>> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for detail in parsed.detail {
        // The last location segment names the field; "body"/"query" prefixes are noise.
        let field = detail
            .loc
            .last()
            .and_then(|segment| match segment {
                serde_json::Value::String(name) => Some(name.clone()),
                serde_json::Value::Number(index) => Some(index.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "form".into());
        fields.entry(field).or_default().push(detail.msg);
    }
    (!fields.is_empty()).then_some(fields)
}

#[derive(Deserialize)]
struct DetailBody {
    detail: String,
}

/// Extract the human-readable `detail` of an unstructured backend error.
pub fn detail_message(body: &str) -> Option<String> {
    serde_json::from_str::<DetailBody>(body)
        .ok()
        .map(|parsed| parsed.detail)
        .filter(|detail| !detail.is_empty())
}
