// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::collections::HashMap;
use yare::parameterized;

struct MapSource(HashMap<String, Value>);

impl MapSource {
    fn new<const N: usize>(pairs: [(&str, Value); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

impl FieldSource for MapSource {
    fn field(&self, name: &str) -> Value {
        self.0
            .get(name)
            .cloned()
            .unwrap_or(Value::Str(String::new()))
    }
}

fn ct_source(file_count: f64) -> MapSource {
    MapSource::new([
        ("Modality", Value::Str("CT".to_string())),
        ("SeriesDescription", Value::Str("HEAD W/O CONTRAST".to_string())),
        ("FileCount", Value::Num(file_count)),
        ("OffPeak", Value::Bool(false)),
    ])
}

fn eval(input: &str, source: &MapSource) -> bool {
    Expr::parse(input).unwrap().eval(source)
}

#[test]
fn modality_and_file_count() {
    let expr = r#"Modality == "CT" and FileCount >= 3"#;
    assert!(eval(expr, &ct_source(3.0)));
    assert!(!eval(expr, &ct_source(2.0)));
}

#[parameterized(
    eq_true = { r#"Modality == "CT""#, true },
    eq_false = { r#"Modality == "MR""#, false },
    ne = { r#"Modality != "MR""#, true },
    lt = { "FileCount < 10", true },
    ge = { "FileCount >= 5", true },
    gt_false = { "FileCount > 5", false },
    contains_yes = { r#"SeriesDescription contains "HEAD""#, true },
    contains_no = { r#"SeriesDescription contains "SPINE""#, false },
    regex = { r#"SeriesDescription matches "(?i)head""#, true },
    regex_no = { r#"SeriesDescription matches "^CONTRAST""#, false },
    not_op = { r#"not OffPeak"#, true },
    symbols = { r#"Modality == "CT" && FileCount >= 5 || OffPeak"#, true },
)]
fn operators(input: &str, expected: bool) {
    assert_eq!(eval(input, &ct_source(5.0)), expected, "{}", input);
}

#[test]
fn unresolved_tag_is_empty_string() {
    let source = ct_source(1.0);
    assert!(eval(r#"StationName == """#, &source));
    assert!(!eval(r#"StationName == "CT99""#, &source));
    // Empty string is falsy as a bare operand
    assert!(!eval("StationName", &source));
    assert!(eval("Modality", &source));
}

#[test]
fn parentheses_group_subexpressions() {
    let source = ct_source(2.0);
    assert!(eval(
        r#"(Modality == "MR" or Modality == "CT") and FileCount >= 2"#,
        &source
    ));
    assert!(!eval(
        r#"Modality == "MR" or (Modality == "CT" and FileCount >= 3)"#,
        &source
    ));
}

#[test]
fn numeric_comparison_applies_to_numeric_strings() {
    let source = MapSource::new([("AccessionNumber", Value::Str("042".to_string()))]);
    // "042" parses as 42, so numeric equality holds
    assert!(eval("AccessionNumber == 42", &source));
    assert!(eval("AccessionNumber < 100", &source));
}

#[test]
fn lexical_comparison_when_not_numeric() {
    let source = ct_source(1.0);
    assert!(eval(r#"Modality > "AA""#, &source));
    assert!(!eval(r#"Modality < "AA""#, &source));
}

#[test]
fn keywords_are_case_insensitive() {
    let source = ct_source(5.0);
    assert!(eval(r#"Modality == "CT" AND FileCount >= 3"#, &source));
    assert!(eval(r#"NOT OffPeak"#, &source));
}

#[test]
fn unknown_field_is_rejected_at_parse_time() {
    assert!(matches!(
        Expr::parse(r#"PatientWeight > 100"#),
        Err(ParseError::UnknownField(name)) if name == "PatientWeight"
    ));
}

#[test]
fn invalid_regex_is_rejected_at_parse_time() {
    assert!(matches!(
        Expr::parse(r#"Modality matches "[""#),
        Err(ParseError::InvalidRegex { .. })
    ));
}

#[test]
fn matches_requires_literal_pattern() {
    assert!(matches!(
        Expr::parse("Modality matches Modality"),
        Err(ParseError::MatchesNeedsLiteral)
    ));
}

#[parameterized(
    unterminated = { r#"Modality == "CT"# },
    trailing = { r#"Modality == "CT" garbage"# },
    dangling_op = { "FileCount >=" },
    bad_char = { "FileCount >= #3" },
)]
fn malformed_expressions_fail_to_parse(input: &str) {
    assert!(Expr::parse(input).is_err(), "{}", input);
}

#[test]
fn short_circuit_or_skips_rhs() {
    // The rhs would be falsy; or short-circuits on the truthy lhs
    let source = ct_source(5.0);
    assert!(eval(r#"Modality == "CT" or StationName == "missing""#, &source));
}

#[test]
fn single_quoted_strings() {
    let source = ct_source(1.0);
    assert!(eval("Modality == 'CT'", &source));
}
