use once_cell::sync::Lazy;
use pep508_rs::{Pep508Error, Requirement};
use regex::Regex;
use std::str::FromStr;

/// Parses a requirement string, tolerating one well known defect of upstream metadata: a missing
/// comma between two version bounds, e.g. `elasticsearch-dsl (>=7.2.0<8.0.0)`.
///
/// The string is first parsed strictly. On failure a comma is inserted between a release digit
/// and a directly following comparator and parsing is retried; if that succeeds a warning naming
/// the original string and `context` (typically `"<parent-name> <parent-version>"`) is emitted.
/// No other repairs are attempted, anything else surfaces the original parse error.
pub fn parse_requirement_fixup(
    requirement: &str,
    context: &str,
) -> Result<Requirement, Pep508Error> {
    match Requirement::from_str(requirement) {
        Ok(parsed) => Ok(parsed),
        Err(err) => {
            static MISSING_COMMA: Lazy<Regex> =
                Lazy::new(|| Regex::new(r"(\d)([<>=~^!])").unwrap());
            let patched = MISSING_COMMA.replace_all(requirement, "${1},${2}");
            if patched != requirement {
                if let Ok(parsed) = Requirement::from_str(&patched) {
                    tracing::warn!(
                        "Requirement `{requirement}` for {context} is invalid (missing comma)"
                    );
                    return Ok(parsed);
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_valid_requirement_is_untouched() {
        let parsed = parse_requirement_fixup(
            "elasticsearch-dsl (>=7.2.0,<8.0.0)",
            "django-elasticsearch-dsl 7.2.2",
        )
        .unwrap();
        assert_eq!(parsed.name, "elasticsearch-dsl");
        assert!(!logs_contain("missing comma"));
    }

    #[traced_test]
    #[test]
    fn test_missing_comma_is_repaired() {
        let correct = parse_requirement_fixup(
            "elasticsearch-dsl (>=7.2.0,<8.0.0)",
            "django-elasticsearch-dsl 7.2.2",
        )
        .unwrap();
        let wrong = parse_requirement_fixup(
            "elasticsearch-dsl (>=7.2.0<8.0.0)",
            "django-elasticsearch-dsl 7.2.2",
        )
        .unwrap();
        assert_eq!(wrong.version_or_url, correct.version_or_url);
        assert!(logs_contain(
            "Requirement `elasticsearch-dsl (>=7.2.0<8.0.0)` for django-elasticsearch-dsl 7.2.2 is invalid (missing comma)"
        ));
    }

    #[test]
    fn test_fixup_is_stable() {
        let once = parse_requirement_fixup("foo (>=1.0<2.0)", "bar 1.0").unwrap();
        let twice = parse_requirement_fixup(&once.to_string(), "bar 1.0").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unrepairable_error_is_original() {
        assert!(parse_requirement_fixup("###", "bar 1.0").is_err());
    }
}
