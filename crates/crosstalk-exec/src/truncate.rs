//! Output truncation for sub-exec results.
//!
//! Command output can be arbitrarily large; results forwarded to agents and
//! operator clients are capped. The head is kept (invocation context and
//! first errors live there) and a fixed suffix marks the cut.

/// Suffix appended when output exceeds the cap.
pub const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Default cap on captured output (bytes of UTF-8, cut on a char boundary).
pub const DEFAULT_OUTPUT_CAP: usize = 200 * 1024;

/// Cap `output` at `max_bytes`. Returns the (possibly cut) text and whether
/// truncation happened. The cut lands on a char boundary so multi-byte
/// sequences are never split.
pub fn cap_output(output: &str, max_bytes: usize) -> (String, bool) {
    if output.len() <= max_bytes {
        return (output.to_owned(), false);
    }

    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut result = String::with_capacity(cut + TRUNCATION_SUFFIX.len() + 1);
    result.push_str(&output[..cut]);
    if !result.ends_with('\n') {
        result.push('\n');
    }
    result.push_str(TRUNCATION_SUFFIX);
    (result, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
