//! Output filter for template rendering. Rendered HTML is scanned for
//! `javascript:`-scheme attribute values before anything reaches the
//! writer; the check runs on the fully rendered buffer, so a scheme
//! assembled at runtime from fragments is caught the same way a
//! literal one is.

use crate::eval::error::RuntimeError;
use crate::range::Range;

/// Rejects rendered output that would hand a `javascript:` URL to an
/// attribute. Browsers ignore control characters and case inside the
/// scheme, so the scan does too.
pub(crate) fn ensure_safe(html: &str, range: Range) -> Result<(), RuntimeError> {
    if has_script_scheme(html) {
        Err(RuntimeError::UnsafeOutput(range))
    } else {
        Ok(())
    }
}

fn has_script_scheme(html: &str) -> bool {
    // Browsers strip ASCII controls and whitespace when parsing a URL
    // scheme, so `java\tscript:` is still live. Mirror that before
    // matching.
    let normalized: Vec<u8> = html
        .bytes()
        .filter(|b| *b > 0x20)
        .map(|b| b.to_ascii_lowercase())
        .collect();
    let needle = b"javascript:";
    for start in memchr_all(&normalized, needle) {
        if in_attribute_value(&normalized[..start]) {
            return true;
        }
    }
    false
}

/// Whether the text immediately before a match puts it in attribute
/// value position: `=`, `='` or `="`.
fn in_attribute_value(prefix: &[u8]) -> bool {
    let mut i = prefix.len();
    if i > 0 && (prefix[i - 1] == b'\'' || prefix[i - 1] == b'"') {
        i -= 1;
    }
    i > 0 && prefix[i - 1] == b'='
}

fn memchr_all<'a>(haystack: &'a [u8], needle: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
    (0..haystack.len().saturating_sub(needle.len() - 1))
        .filter(move |&i| &haystack[i..i + needle.len()] == needle)
}
