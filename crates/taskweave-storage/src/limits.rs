// Size enforcement for long execution fields.
//
// Long JSON fields are bounded by a configured KB limit; exceeding it fails
// the write. state_info is instead truncated, so failure messages can never
// make an execution unwritable.

use serde_json::Value;
use taskweave_core::{EngineError, Result};

/// Max bytes kept in `state_info`
pub const STATE_INFO_MAX_BYTES: usize = 65_532;

/// Validate the serialized size of a long JSON field against the limit.
/// A negative limit disables the check.
pub fn validate_long_field(limit_kb: i64, field: &str, value: &Value) -> Result<()> {
    if limit_kb < 0 || value.is_null() {
        return Ok(());
    }

    let size_bytes = serde_json::to_string(value)
        .map(|s| s.len() as i64)
        .unwrap_or(0);
    let size_kb = size_bytes / 1024;

    if size_kb > limit_kb {
        return Err(EngineError::SizeLimitExceeded {
            field: field.to_string(),
            size_kb,
            limit_kb,
        });
    }

    Ok(())
}

/// Truncate `state_info` to its column limit, on a char boundary.
pub fn cut_state_info(info: Option<String>) -> Option<String> {
    info.map(|s| {
        if s.len() <= STATE_INFO_MAX_BYTES {
            s
        } else {
            let mut end = STATE_INFO_MAX_BYTES;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            s[..end].to_string()
        }
    })
}
