//! Canonical column naming.
//!
//! Every column identifier the connector exposes is produced here. Schema
//! discovery, query translation and the response normalizers all import
//! [`sanitize`]; none of them derive names on their own.

use crate::error::ConnectorError;

/// Maps a display name to its canonical column name.
///
/// Every character outside `[A-Za-z0-9_]` becomes `_`, runs of `_` collapse to
/// one, and leading/trailing `_` are stripped. The function is idempotent.
/// An input with no ASCII letters or digits yields an empty string; callers
/// that declare columns should use [`try_sanitize`] instead.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_underscore = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_underscore && !out.is_empty() {
                out.push('_');
            }
            pending_underscore = false;
            out.push(ch);
        } else {
            pending_underscore = true;
        }
    }

    out
}

/// Like [`sanitize`], but an empty result is a configuration error.
pub fn try_sanitize(name: &str) -> Result<String, ConnectorError> {
    let canonical = sanitize(name);
    if canonical.is_empty() {
        return Err(ConnectorError::InvalidColumnName(name.to_string()));
    }
    Ok(canonical)
}

/// Canonical test vectors shared by every module that names columns.
#[cfg(test)]
pub(crate) const TEST_VECTORS: &[(&str, &str)] = &[
    ("105-EP01b. Malaria Total", "105_EP01b_Malaria_Total"),
    ("Organisation unit", "Organisation_unit"),
    ("Period", "Period"),
    ("ANC 1st visit", "ANC_1st_visit"),
    ("  padded  name  ", "padded_name"),
    ("__already__canonical__", "already_canonical"),
    ("snake_case_name", "snake_case_name"),
    ("a--b..c", "a_b_c"),
    ("Malaria (confirmed) %", "Malaria_confirmed"),
    ("Über-Anzahl", "ber_Anzahl"),
    ("SUM(105-EP01b. Malaria Total)", "SUM_105_EP01b_Malaria_Total"),
    ("123", "123"),
];
