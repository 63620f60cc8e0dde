//! Maps a caller's column or aggregate reference onto an actual result column.
//!
//! Steps, first success wins:
//! 1. exact match;
//! 2. `FN(inner)` → `FN(sanitize(inner))`, exact;
//! 3. a column `FN(reference)` wrapping the reference;
//! 4. sanitized reference against sanitized columns;
//! 5. case-insensitive;
//! 6. alphanumerics only, case-insensitive.
//!
//! A step that matches several columns fails with
//! [`ConnectorError::AmbiguousColumn`]. There is no positional fallback.

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ConnectorError, Result};
use crate::sanitize::sanitize;

static AGGREGATE_WRAPPER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*$").expect("aggregate wrapper regex")
});

/// Splits `FN(inner)` into `("FN", "inner")`.
pub fn unwrap_aggregate(reference: &str) -> Option<(&str, &str)> {
    let captures = AGGREGATE_WRAPPER.captures(reference)?;
    let function = captures.get(1)?.as_str();
    let inner = captures.get(2)?.as_str().trim();
    Some((function, inner))
}

fn alphanumeric(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn pick<'a>(
    requested: &str,
    step: u8,
    candidates: Vec<&'a String>,
) -> Result<Option<&'a String>> {
    match candidates.as_slice() {
        [] => Ok(None),
        [only] => {
            debug!("Resolved {:?} to {:?} at step {}", requested, only, step);
            Ok(Some(only))
        }
        _ => Err(ConnectorError::AmbiguousColumn {
            requested: requested.to_string(),
            candidates: candidates.into_iter().cloned().collect(),
        }),
    }
}

/// Returns the name of the column of `actual` that `requested` refers to.
pub fn resolve(requested: &str, actual: &[String]) -> Result<String> {
    resolve_index(requested, actual).map(|index| actual[index].clone())
}

pub fn resolve_index(requested: &str, actual: &[String]) -> Result<usize> {
    let found = cascade(requested, actual)?.ok_or_else(|| ConnectorError::ColumnNotFound {
        requested: requested.to_string(),
        available: actual.to_vec(),
    })?;
    actual
        .iter()
        .position(|c| c == found)
        .ok_or_else(|| ConnectorError::ColumnNotFound {
            requested: requested.to_string(),
            available: actual.to_vec(),
        })
}

fn cascade<'a>(requested: &str, actual: &'a [String]) -> Result<Option<&'a String>> {
    let filter = |matches: &dyn Fn(&str) -> bool| -> Vec<&'a String> {
        actual.iter().filter(|c| matches(c.as_str())).collect()
    };

    if let Some(found) = pick(requested, 1, filter(&|c: &str| c == requested))? {
        return Ok(Some(found));
    }

    if let Some((function, inner)) = unwrap_aggregate(requested) {
        let rewrapped = format!("{}({})", function, sanitize(inner));
        if let Some(found) = pick(requested, 2, filter(&|c: &str| c == rewrapped))? {
            return Ok(Some(found));
        }
    }

    let sanitized = sanitize(requested);
    let wraps_requested = |c: &str| {
        unwrap_aggregate(c).map_or(false, |(_, inner)| inner == requested || inner == sanitized)
    };
    if let Some(found) = pick(requested, 3, filter(&wraps_requested))? {
        return Ok(Some(found));
    }

    if !sanitized.is_empty() {
        if let Some(found) = pick(requested, 4, filter(&|c: &str| sanitize(c) == sanitized))? {
            return Ok(Some(found));
        }
    }

    let lowered = requested.to_lowercase();
    if let Some(found) = pick(requested, 5, filter(&|c: &str| c.to_lowercase() == lowered))? {
        return Ok(Some(found));
    }

    let normalized = alphanumeric(requested);
    if normalized.is_empty() {
        return Ok(None);
    }
    pick(requested, 6, filter(&|c: &str| alphanumeric(c) == normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::TEST_VECTORS;
    use rstest::rstest;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_wrapped_display_name_resolves_by_sanitizing_inner() {
        let actual = columns(&["SUM(105_EP01b_Malaria_Total)"]);
        assert_eq!(
            resolve("SUM(105-EP01b. Malaria Total)", &actual).unwrap(),
            "SUM(105_EP01b_Malaria_Total)"
        );
    }

    #[rstest]
    #[case::exact("Period", &["Organisation_unit", "Period"], "Period")]
    #[case::rewrap_inner("AVG(ANC 1st visit)", &["AVG(ANC_1st_visit)", "SUM(ANC_1st_visit)"], "AVG(ANC_1st_visit)")]
    #[case::reverse_wrap("ANC_1st_visit", &["Period", "SUM(ANC_1st_visit)"], "SUM(ANC_1st_visit)")]
    #[case::reverse_wrap_display("ANC 1st visit", &["Period", "SUM(ANC_1st_visit)"], "SUM(ANC_1st_visit)")]
    #[case::sanitized("Organisation unit", &["Period", "Organisation_unit"], "Organisation_unit")]
    #[case::case_insensitive("organisation_unit", &["Organisation_unit"], "Organisation_unit")]
    #[case::alphanumeric_only("ORG-UNIT", &["org_unit"], "org_unit")]
    #[case::alphanumeric_spacing("Organisationunit", &["Organisation_unit"], "Organisation_unit")]
    fn test_cascade_steps(#[case] requested: &str, #[case] actual: &[&str], #[case] expected: &str) {
        assert_eq!(resolve(requested, &columns(actual)).unwrap(), expected);
    }

    #[test]
    fn test_declared_display_names_round_trip() {
        for (display, canonical) in TEST_VECTORS {
            let actual = columns(&["unrelated", canonical]);
            assert_eq!(resolve(display, &actual).unwrap(), *canonical, "{}", display);
        }
    }

    #[test]
    fn test_several_wrappers_are_ambiguous() {
        let actual = columns(&["SUM(x)", "AVG(x)"]);
        match resolve("x", &actual) {
            Err(ConnectorError::AmbiguousColumn {
                requested,
                candidates,
            }) => {
                assert_eq!(requested, "x");
                assert_eq!(candidates, actual);
            }
            other => panic!("expected AmbiguousColumn, got {:?}", other),
        }
    }

    #[rstest]
    #[case::unknown("Malaria deaths")]
    #[case::punctuation_only("%%")]
    fn test_unresolved_reference_names_available_columns(#[case] requested: &str) {
        let actual = columns(&["Organisation_unit", "Period"]);
        match resolve(requested, &actual) {
            Err(ConnectorError::ColumnNotFound {
                requested: r,
                available,
            }) => {
                assert_eq!(r, requested);
                assert_eq!(available, actual);
            }
            other => panic!("expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_unwrap_aggregate() {
        assert_eq!(unwrap_aggregate("SUM( a b )"), Some(("SUM", "a b")));
        assert_eq!(
            unwrap_aggregate("COUNT_DISTINCT(Period)"),
            Some(("COUNT_DISTINCT", "Period"))
        );
        assert_eq!(unwrap_aggregate("Malaria (confirmed) %"), None);
        assert_eq!(unwrap_aggregate("plain"), None);
    }
}
