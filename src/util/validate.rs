use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{invalid_data, InvalidDataReason, NimbusResult};

pub const MAX_PAGING_TAKE: u32 = 500;

/// Key paths addressing document metadata rather than body fields.
pub const KEY_PATH_ID: &str = "$id";
pub const KEY_PATH_CREATED: &str = "$created";
pub const KEY_PATH_MODIFIED: &str = "$modified";

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Identifiers (collection ids, document ids, subscription ids) are
/// non-empty sequences of `[A-Za-z0-9_-]`.
pub fn validate_identifier(identifier: &str) -> NimbusResult<()> {
    if identifier.is_empty() || !identifier.chars().all(is_identifier_char) {
        return Err(invalid_data(
            InvalidDataReason::InvalidIdentifierFormat,
            format!("'{identifier}' is not a valid identifier"),
        ));
    }
    Ok(())
}

/// A key path is either one of the special metadata paths or a dotted
/// sequence of identifier segments.
pub fn validate_key_path(key_path: &str) -> NimbusResult<()> {
    if matches!(key_path, KEY_PATH_ID | KEY_PATH_CREATED | KEY_PATH_MODIFIED) {
        return Ok(());
    }
    if key_path.is_empty() {
        return Err(invalid_data(
            InvalidDataReason::InvalidKeyPath,
            "key path must not be empty",
        ));
    }
    for segment in key_path.split('.') {
        if segment.is_empty() || !segment.chars().all(is_identifier_char) {
            return Err(invalid_data(
                InvalidDataReason::InvalidKeyPath,
                format!("'{key_path}' is not a valid key path"),
            ));
        }
    }
    Ok(())
}

/// Document bodies must be JSON objects whose keys are free of `.` at every
/// nesting level.
pub fn validate_document_value(value: &JsonMap<String, JsonValue>) -> NimbusResult<()> {
    validate_object_keys(value)
}

fn validate_object_keys(object: &JsonMap<String, JsonValue>) -> NimbusResult<()> {
    for (key, value) in object {
        if key.contains('.') {
            return Err(invalid_data(
                InvalidDataReason::InvalidDocument,
                format!("document key '{key}' must not contain '.'"),
            ));
        }
        validate_nested_value(value)?;
    }
    Ok(())
}

fn validate_nested_value(value: &JsonValue) -> NimbusResult<()> {
    match value {
        JsonValue::Object(object) => validate_object_keys(object),
        JsonValue::Array(items) => {
            for item in items {
                validate_nested_value(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn validate_paging_take(take: u32) -> NimbusResult<()> {
    if take > MAX_PAGING_TAKE {
        return Err(invalid_data(
            InvalidDataReason::InvalidLimit,
            format!("take must be at most {MAX_PAGING_TAKE}, got {take}"),
        ));
    }
    Ok(())
}
