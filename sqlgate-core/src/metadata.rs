//! Directive parsing for the comment header of a SQL script.
//!
//! Scripts describe themselves with `--` comment lines near the top of the file:
//!
//! ```sql
//! -- Author: jane
//! -- Purpose: backfill missing invoice totals
//! -- Target: production
//! -- Date: 2024-03-01
//! -- DirectProd
//! UPDATE invoices SET ...
//! ```
//!
//! Only the first [`METADATA_WINDOW_LINES`] lines are examined. Anything below
//! that, or any line that is not a `--` comment, is script content.
//!
//! The `DirectProd` marker is deliberately permissive: it matches in several
//! spellings (`DirectProd`, `Direct-Prod`, `direct_prod`, `Direct Production`),
//! and a bare marker with no value counts as enabled. Only an explicit value
//! other than `true`/`yes`/`1` turns it off.

use crate::environment::Environment;

/// Number of leading lines scanned for directives.
pub const METADATA_WINDOW_LINES: usize = 20;

/// Directives found in a script header. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptMetadata {
    pub author: Option<String>,
    pub purpose: Option<String>,
    /// Declared target, if the directive named a known environment.
    pub target: Option<Environment>,
    pub date: Option<String>,
    pub direct_prod: bool,
}

impl ScriptMetadata {
    /// The declared target, falling back to staging.
    pub fn target_or_default(&self) -> Environment {
        self.target.unwrap_or(Environment::Staging)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectiveKey {
    Author,
    Purpose,
    Target,
    Date,
    DirectProd,
}

impl DirectiveKey {
    fn from_normalized(key: &str) -> Option<Self> {
        match key {
            "author" => Some(DirectiveKey::Author),
            "purpose" => Some(DirectiveKey::Purpose),
            "target" | "targetdatabase" | "targetenvironment" | "targetenv" => {
                Some(DirectiveKey::Target)
            }
            "date" => Some(DirectiveKey::Date),
            "directprod" | "directproduction" => Some(DirectiveKey::DirectProd),
            _ => None,
        }
    }
}

/// Lower-case the key and drop separators so `Direct-Prod`, `direct_prod`
/// and `Direct Prod` all compare equal.
fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

fn is_boolean_word(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "1" | "false" | "no" | "0"
    )
}

/// Split one comment body into a recognized key and its (possibly empty) value.
fn parse_directive(body: &str) -> Option<(DirectiveKey, Option<&str>)> {
    if let Some(idx) = body.find([':', '=']) {
        let key = DirectiveKey::from_normalized(&normalize_key(&body[..idx]))?;
        let value = body[idx + 1..].trim();
        return Some((key, (!value.is_empty()).then_some(value)));
    }

    if let Some(key) = DirectiveKey::from_normalized(&normalize_key(body)) {
        return Some((key, None));
    }

    // `-- DirectProd yes` without a separator.
    let (head, last) = body.rsplit_once(char::is_whitespace)?;
    if is_boolean_word(last) {
        if let Some(DirectiveKey::DirectProd) = DirectiveKey::from_normalized(&normalize_key(head))
        {
            return Some((DirectiveKey::DirectProd, Some(last)));
        }
    }
    None
}

/// Extract metadata from the header of a script. Never fails.
pub fn parse_metadata(content: &str) -> ScriptMetadata {
    let mut metadata = ScriptMetadata::default();

    for line in content.lines().take(METADATA_WINDOW_LINES) {
        let Some(body) = line.trim().strip_prefix("--") else {
            continue;
        };
        let Some((key, value)) = parse_directive(body.trim()) else {
            continue;
        };

        match key {
            DirectiveKey::Author => metadata.author = value.map(str::to_string),
            DirectiveKey::Purpose => metadata.purpose = value.map(str::to_string),
            DirectiveKey::Date => metadata.date = value.map(str::to_string),
            DirectiveKey::Target => {
                metadata.target = value.and_then(|v| v.parse::<Environment>().ok());
            }
            DirectiveKey::DirectProd => {
                metadata.direct_prod = value.map_or(true, is_truthy);
            }
        }
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bare_direct_prod_marker_enables_bypass() {
        let metadata = parse_metadata("-- DirectProd\nSELECT 1;");
        assert!(metadata.direct_prod);
    }

    #[test]
    fn test_direct_prod_spellings() {
        for header in [
            "-- DirectProd: true",
            "-- direct-prod: yes",
            "-- DIRECT_PROD = 1",
            "-- Direct Prod",
            "-- DirectProduction: YES",
            "-- DirectProd:",
            "-- DirectProd yes",
        ] {
            let metadata = parse_metadata(&format!("{header}\nSELECT 1;"));
            assert!(metadata.direct_prod, "expected bypass for {header:?}");
        }
    }

    #[test]
    fn test_direct_prod_explicitly_disabled() {
        for header in ["-- DirectProd: false", "-- DirectProd: no", "-- DirectProd = 0"] {
            let metadata = parse_metadata(&format!("{header}\nSELECT 1;"));
            assert!(!metadata.direct_prod, "expected no bypass for {header:?}");
        }
    }

    #[test]
    fn test_target_production() {
        let metadata = parse_metadata("-- Target: production\nDELETE FROM t;");
        assert_eq!(metadata.target, Some(Environment::Production));
        assert_eq!(metadata.target_or_default(), Environment::Production);
    }

    #[test]
    fn test_target_database_spelling_case_insensitive() {
        let metadata = parse_metadata("-- TargetDatabase: STAGING\n");
        assert_eq!(metadata.target, Some(Environment::Staging));
    }

    #[test]
    fn test_unknown_target_falls_back_to_staging() {
        let metadata = parse_metadata("-- Target: prod-eu\n");
        assert_eq!(metadata.target, None);
        assert_eq!(metadata.target_or_default(), Environment::Staging);
    }

    #[test]
    fn test_no_directives_uses_defaults() {
        let metadata = parse_metadata("UPDATE t SET x = 1;\n");
        assert_eq!(metadata, ScriptMetadata::default());
        assert_eq!(metadata.target_or_default(), Environment::Staging);
        assert!(!metadata.direct_prod);
    }

    #[test]
    fn test_all_fields() {
        let script = "\
-- Author: jane
-- Purpose: fix totals
-- Date: 2024-03-01
-- Target: staging
UPDATE invoices SET total = 0 WHERE total IS NULL;
";
        let metadata = parse_metadata(script);
        assert_eq!(metadata.author.as_deref(), Some("jane"));
        assert_eq!(metadata.purpose.as_deref(), Some("fix totals"));
        assert_eq!(metadata.date.as_deref(), Some("2024-03-01"));
        assert_eq!(metadata.target, Some(Environment::Staging));
        assert!(!metadata.direct_prod);
    }

    #[test]
    fn test_purpose_keeps_colons_in_value() {
        let metadata = parse_metadata("-- Purpose: ratio fix: step 2\n");
        assert_eq!(metadata.purpose.as_deref(), Some("ratio fix: step 2"));
    }

    #[test]
    fn test_directives_past_window_are_ignored() {
        let mut script = "SELECT 1;\n".repeat(METADATA_WINDOW_LINES);
        script.push_str("-- DirectProd\n-- Target: production\n");
        let metadata = parse_metadata(&script);
        assert!(!metadata.direct_prod);
        assert_eq!(metadata.target, None);
    }

    #[test]
    fn test_directive_on_last_line_of_window_is_read() {
        let mut script = "\n".repeat(METADATA_WINDOW_LINES - 1);
        script.push_str("-- DirectProd\n");
        assert!(parse_metadata(&script).direct_prod);
    }

    #[test]
    fn test_ordinary_comments_are_inert() {
        let metadata = parse_metadata("-- this script touches production data\nSELECT 1;");
        assert_eq!(metadata, ScriptMetadata::default());
    }

    #[test]
    fn test_block_comment_is_not_a_directive() {
        let metadata = parse_metadata("/* DirectProd */\nSELECT 1;");
        assert!(!metadata.direct_prod);
    }

    proptest! {
        #[test]
        fn parse_never_panics(content in ".{0,400}") {
            let _ = parse_metadata(&content);
        }

        #[test]
        fn bodies_without_comments_have_default_metadata(
            lines in proptest::collection::vec("[A-Za-z0-9 ;,=()*]{0,40}", 0..30)
        ) {
            let content = lines.join("\n");
            prop_assert_eq!(parse_metadata(&content), ScriptMetadata::default());
        }
    }
}
