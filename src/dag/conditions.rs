//! Match-condition accumulation for the HTTPProxy include graph.
//!
//! Walking an include chain accumulates a prefix and a set of header and
//! query matches. A leaf route's own conditions merge into the
//! accumulated set; the result becomes the route's match in the DAG.

use crate::apis::MatchCondition;
use crate::dag::{
    HeaderMatch, HeaderMatchKind, PathMatch, QueryParamMatch, QueryParamMatchKind, Reason,
};

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConditionError {
    #[error("{0}")]
    Path(String),

    #[error("{0}")]
    Header(String),

    #[error("{0}")]
    Duplicate(String),
}

impl ConditionError {
    pub(crate) fn reason(&self) -> Reason {
        match self {
            ConditionError::Path(_) => Reason::PathMatchConditionsNotValid,
            ConditionError::Header(_) => Reason::HeaderMatchConditionsNotValid,
            ConditionError::Duplicate(_) => Reason::DuplicateMatchConditions,
        }
    }
}

/// An accumulated set of match conditions.
#[derive(Clone, Debug, Default)]
pub(crate) struct Conditions {
    pub prefix: String,
    pub exact: Option<String>,
    pub regex: Option<String>,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
}

impl Conditions {
    /// Parse one condition block list (from an include or a route).
    pub(crate) fn from_block(block: &[MatchCondition]) -> Result<Self, ConditionError> {
        let mut conditions = Conditions::default();
        let mut path_conditions = 0;

        for condition in block {
            let set = [
                condition.prefix.is_some(),
                condition.exact.is_some(),
                condition.regex.is_some(),
            ]
            .iter()
            .filter(|s| **s)
            .count();
            if set > 1 {
                return Err(ConditionError::Path(
                    "a condition may set at most one of prefix, exact and regex".to_string(),
                ));
            }
            if set == 1 {
                path_conditions += 1;
                if path_conditions > 1 {
                    return Err(ConditionError::Path(
                        "at most one path condition is allowed per condition block".to_string(),
                    ));
                }
            }

            if let Some(prefix) = &condition.prefix {
                if !prefix.starts_with('/') {
                    return Err(ConditionError::Path(format!(
                        "prefix condition {prefix:?} must start with /"
                    )));
                }
                conditions.prefix = prefix.clone();
            }
            if let Some(exact) = &condition.exact {
                if !exact.starts_with('/') {
                    return Err(ConditionError::Path(format!(
                        "exact condition {exact:?} must start with /"
                    )));
                }
                conditions.exact = Some(exact.clone());
            }
            if let Some(regex) = &condition.regex {
                conditions.regex = Some(regex.clone());
            }

            if let Some(header) = &condition.header {
                conditions.headers.push(parse_header(header)?);
            }
            if let Some(query) = &condition.query_parameter {
                conditions.query_params.push(parse_query(query)?);
            }
        }

        check_duplicates(&conditions)?;
        Ok(conditions)
    }

    /// Merge a child block into this accumulated set, as happens at each
    /// include edge. Exact and regex conditions only make sense on the
    /// final (route) block: an include cannot delegate below an exact
    /// match.
    pub(crate) fn extend(&self, child: &Conditions) -> Result<Conditions, ConditionError> {
        if self.exact.is_some() || self.regex.is_some() {
            return Err(ConditionError::Path(
                "exact and regex conditions cannot be combined with includes".to_string(),
            ));
        }

        let mut merged = Conditions {
            prefix: join_prefix(&self.prefix, &child.prefix),
            exact: child.exact.clone(),
            regex: child.regex.clone(),
            headers: self.headers.clone(),
            query_params: self.query_params.clone(),
        };
        merged.headers.extend(child.headers.iter().cloned());
        merged.query_params.extend(child.query_params.iter().cloned());

        check_duplicates(&merged)?;
        Ok(merged)
    }

    /// The final path match for a route built from this set.
    pub(crate) fn path_match(&self) -> PathMatch {
        if let Some(exact) = &self.exact {
            return PathMatch::Exact(join_prefix(&self.prefix, exact));
        }
        if let Some(regex) = &self.regex {
            if self.prefix.is_empty() || self.prefix == "/" {
                return PathMatch::Regex(regex.clone());
            }
            return PathMatch::Regex(format!("{}{}", self.prefix, regex));
        }
        if self.prefix.is_empty() {
            PathMatch::Prefix("/".to_string())
        } else {
            PathMatch::Prefix(self.prefix.clone())
        }
    }
}

/// Concatenate two prefixes, normalizing the joint so `/a/` + `/b` and
/// `/a` + `/b` both yield `/a/b`.
fn join_prefix(parent: &str, child: &str) -> String {
    if parent.is_empty() || parent == "/" {
        return if child.is_empty() { "/".to_string() } else { child.to_string() };
    }
    if child.is_empty() || child == "/" {
        return parent.to_string();
    }
    let parent = parent.strip_suffix('/').unwrap_or(parent);
    format!("{parent}{child}")
}

fn parse_header(
    header: &crate::apis::HeaderMatchCondition,
) -> Result<HeaderMatch, ConditionError> {
    let mut kinds = Vec::new();
    if let Some(exact) = &header.exact {
        kinds.push(HeaderMatchKind::Exact(exact.clone()));
    }
    if let Some(contains) = &header.contains {
        kinds.push(HeaderMatchKind::Contains(contains.clone()));
    }
    if let Some(regex) = &header.regex {
        kinds.push(HeaderMatchKind::Regex(regex.clone()));
    }
    if header.present {
        kinds.push(HeaderMatchKind::Present);
    }

    if kinds.len() != 1 {
        return Err(ConditionError::Header(format!(
            "header condition {:?} must set exactly one of exact, contains, present and regex",
            header.name
        )));
    }

    Ok(HeaderMatch {
        name: header.name.to_ascii_lowercase(),
        kind: kinds.remove(0),
        invert: header.invert,
    })
}

fn parse_query(
    query: &crate::apis::QueryParameterMatchCondition,
) -> Result<QueryParamMatch, ConditionError> {
    let kind = match (&query.exact, query.present) {
        (Some(value), false) => QueryParamMatchKind::Exact {
            value: value.clone(),
            ignore_case: query.ignore_case,
        },
        (None, true) => QueryParamMatchKind::Present,
        _ => {
            return Err(ConditionError::Header(format!(
                "query parameter condition {:?} must set exactly one of exact and present",
                query.name
            )))
        }
    };

    Ok(QueryParamMatch {
        name: query.name.clone(),
        kind,
    })
}

/// Header and query conditions may not repeat across the accumulated
/// chain: a duplicate is either redundant or unsatisfiable, and both
/// point at a configuration mistake.
fn check_duplicates(conditions: &Conditions) -> Result<(), ConditionError> {
    for (i, header) in conditions.headers.iter().enumerate() {
        if conditions.headers[..i].iter().any(|other| other == header) {
            return Err(ConditionError::Duplicate(format!(
                "duplicate header condition on {:?}",
                header.name
            )));
        }
    }
    for (i, query) in conditions.query_params.iter().enumerate() {
        if conditions.query_params[..i].iter().any(|other| other.name == query.name) {
            return Err(ConditionError::Duplicate(format!(
                "duplicate query parameter condition on {:?}",
                query.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn block(value: serde_json::Value) -> Vec<MatchCondition> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_prefix_must_start_with_slash() {
        let err = Conditions::from_block(&block(json!([{"prefix": "api"}]))).unwrap_err();
        assert!(matches!(err, ConditionError::Path(_)));
    }

    #[test]
    fn test_at_most_one_path_condition() {
        let err = Conditions::from_block(&block(json!([
            {"prefix": "/a"},
            {"prefix": "/b"},
        ])))
        .unwrap_err();
        assert!(matches!(err, ConditionError::Path(_)));

        let err =
            Conditions::from_block(&block(json!([{"prefix": "/a", "exact": "/b"}]))).unwrap_err();
        assert!(matches!(err, ConditionError::Path(_)));
    }

    #[test]
    fn test_prefix_concatenation() {
        let parent = Conditions::from_block(&block(json!([{"prefix": "/api"}]))).unwrap();
        let child = Conditions::from_block(&block(json!([{"prefix": "/v1"}]))).unwrap();

        let merged = parent.extend(&child).unwrap();
        assert_eq!(merged.path_match(), PathMatch::Prefix("/api/v1".to_string()));

        let with_slash = Conditions {
            prefix: "/api/".to_string(),
            ..Default::default()
        };
        let merged = with_slash.extend(&child).unwrap();
        assert_eq!(merged.path_match(), PathMatch::Prefix("/api/v1".to_string()));
    }

    #[test]
    fn test_exact_under_include_prefix() {
        let parent = Conditions::from_block(&block(json!([{"prefix": "/api"}]))).unwrap();
        let leaf = Conditions::from_block(&block(json!([{"exact": "/health"}]))).unwrap();

        let merged = parent.extend(&leaf).unwrap();
        assert_eq!(merged.path_match(), PathMatch::Exact("/api/health".to_string()));
    }

    #[test]
    fn test_header_conditions_accumulate() {
        let parent = Conditions::from_block(&block(json!([
            {"header": {"name": "X-Team", "exact": "infra"}},
        ])))
        .unwrap();
        let child = Conditions::from_block(&block(json!([
            {"header": {"name": "X-Canary", "present": true}},
        ])))
        .unwrap();

        let merged = parent.extend(&child).unwrap();
        assert_eq!(merged.headers.len(), 2);
    }

    #[test]
    fn test_duplicate_headers_across_chain() {
        let parent = Conditions::from_block(&block(json!([
            {"header": {"name": "X-Team", "exact": "infra"}},
        ])))
        .unwrap();
        let child = parent.clone();

        let err = parent.extend(&child).unwrap_err();
        assert!(matches!(err, ConditionError::Duplicate(_)));
    }

    #[test]
    fn test_header_names_compared_case_insensitively() {
        let parent = Conditions::from_block(&block(json!([
            {"header": {"name": "X-Team", "exact": "infra"}},
        ])))
        .unwrap();
        let child = Conditions::from_block(&block(json!([
            {"header": {"name": "x-team", "exact": "infra"}},
        ])))
        .unwrap();

        let err = parent.extend(&child).unwrap_err();
        assert!(matches!(err, ConditionError::Duplicate(_)));
    }

    #[test]
    fn test_header_condition_requires_exactly_one_kind() {
        let err = Conditions::from_block(&block(json!([
            {"header": {"name": "X-Team"}},
        ])))
        .unwrap_err();
        assert!(matches!(err, ConditionError::Header(_)));

        let err = Conditions::from_block(&block(json!([
            {"header": {"name": "X-Team", "exact": "a", "present": true}},
        ])))
        .unwrap_err();
        assert!(matches!(err, ConditionError::Header(_)));
    }

    #[test]
    fn test_empty_block_matches_everything() {
        let conditions = Conditions::from_block(&[]).unwrap();
        assert_eq!(conditions.path_match(), PathMatch::Prefix("/".to_string()));
    }
}
