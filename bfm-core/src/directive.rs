//! Parse `bfm:*` comment directives from script file headers.
//!
//! Directives appear in the leading comment block of migration payloads,
//! using `--` comments for SQL scripts and `//` comments for JSON scripts:
//! ```sql
//! -- bfm:backend postgresql
//! -- bfm:connection main
//! -- bfm:schema public
//! -- bfm:depends add_users,add_orders
//! -- bfm:requires {"connection":"kv","target":"seed_flags","target_type":"name"}
//! CREATE TABLE ...
//! ```

use crate::error::{BfmError, Result};
use crate::script::StructuredDependency;

/// Parsed directives from a script file header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptDirectives {
    /// Target store kind: `-- bfm:backend postgresql`
    pub backend: Option<String>,
    /// Logical connection name: `-- bfm:connection main`
    pub connection: Option<String>,
    /// Schema tag: `-- bfm:schema public`
    pub schema: Option<String>,
    /// Simple name dependencies: `-- bfm:depends add_users,add_orders`
    pub depends: Vec<String>,
    /// Structured dependencies, one JSON object per `-- bfm:requires` line.
    pub requires: Vec<StructuredDependency>,
}

/// Strip a directive prefix, ensuring the prefix is followed by whitespace or
/// end of string. This prevents prefix collisions like "bfm:schema" matching
/// "bfm:schemas".
fn strip_directive_prefix<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if let Some(rest) = line.strip_prefix(prefix) {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            Some(rest.trim())
        } else {
            None
        }
    } else {
        None
    }
}

/// Strip the comment marker for the payload flavor: `--` for SQL, `//` for JSON.
fn strip_comment_marker(line: &str) -> Option<&str> {
    line.strip_prefix("--")
        .or_else(|| line.strip_prefix("//"))
        .map(str::trim)
}

/// Parse `bfm:*` directives from a payload's leading comment block.
///
/// Only comment lines at the top of the file are considered; parsing stops
/// at the first non-empty, non-comment line.
pub fn parse_directives(payload: &str) -> Result<ScriptDirectives> {
    let mut directives = ScriptDirectives::default();

    for line in payload.lines() {
        let trimmed = line.trim();

        // Skip empty lines at the top
        if trimmed.is_empty() {
            continue;
        }

        let Some(comment_body) = strip_comment_marker(trimmed) else {
            break;
        };

        if let Some(value) = strip_directive_prefix(comment_body, "bfm:backend") {
            if !value.is_empty() {
                directives.backend = Some(value.to_string());
            }
        } else if let Some(value) = strip_directive_prefix(comment_body, "bfm:connection") {
            if !value.is_empty() {
                directives.connection = Some(value.to_string());
            }
        } else if let Some(value) = strip_directive_prefix(comment_body, "bfm:schema") {
            if !value.is_empty() {
                directives.schema = Some(value.to_string());
            }
        } else if let Some(value) = strip_directive_prefix(comment_body, "bfm:depends") {
            for item in value.split(',') {
                let item = item.trim();
                if !item.is_empty() {
                    directives.depends.push(item.to_string());
                }
            }
        } else if let Some(value) = strip_directive_prefix(comment_body, "bfm:requires") {
            if !value.is_empty() {
                let dep: StructuredDependency = serde_json::from_str(value).map_err(|e| {
                    BfmError::ScriptParseError(format!(
                        "Invalid bfm:requires directive '{}': {}",
                        value, e
                    ))
                })?;
                directives.requires.push(dep);
            }
        }
    }

    Ok(directives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::DependencyTargetType;

    #[test]
    fn test_parse_backend_and_connection() {
        let sql = "-- bfm:backend postgresql\n-- bfm:connection main\nCREATE TABLE foo();";
        let d = parse_directives(sql).unwrap();
        assert_eq!(d.backend.as_deref(), Some("postgresql"));
        assert_eq!(d.connection.as_deref(), Some("main"));
        assert!(d.schema.is_none());
    }

    #[test]
    fn test_parse_schema() {
        let sql = "-- bfm:schema analytics\nCREATE TABLE foo();";
        let d = parse_directives(sql).unwrap();
        assert_eq!(d.schema.as_deref(), Some("analytics"));
    }

    #[test]
    fn test_parse_depends_list() {
        let sql = "-- bfm:depends add_users, add_orders\nCREATE TABLE foo();";
        let d = parse_directives(sql).unwrap();
        assert_eq!(d.depends, vec!["add_users", "add_orders"]);
    }

    #[test]
    fn test_parse_requires_json() {
        let sql = "-- bfm:requires {\"connection\":\"main\",\"target\":\"add_users\",\"target_type\":\"name\"}\nCREATE TABLE foo();";
        let d = parse_directives(sql).unwrap();
        assert_eq!(d.requires.len(), 1);
        assert_eq!(d.requires[0].connection, "main");
        assert_eq!(d.requires[0].target_type, DependencyTargetType::Name);
    }

    #[test]
    fn test_parse_requires_bad_json_errors() {
        let sql = "-- bfm:requires {not json}\nCREATE TABLE foo();";
        assert!(parse_directives(sql).is_err());
    }

    #[test]
    fn test_json_comment_marker() {
        let payload = "// bfm:backend etcd\n// bfm:connection kv\n[{\"op\":\"put\",\"key\":\"a\",\"value\":\"1\"}]";
        let d = parse_directives(payload).unwrap();
        assert_eq!(d.backend.as_deref(), Some("etcd"));
        assert_eq!(d.connection.as_deref(), Some("kv"));
    }

    #[test]
    fn test_stops_at_non_comment_line() {
        let sql = "-- bfm:connection main\nCREATE TABLE foo();\n-- bfm:connection other\n";
        let d = parse_directives(sql).unwrap();
        assert_eq!(d.connection.as_deref(), Some("main"));
    }

    #[test]
    fn test_skips_leading_blank_lines() {
        let sql = "\n\n-- bfm:backend greptimedb\nCREATE TABLE metrics();";
        let d = parse_directives(sql).unwrap();
        assert_eq!(d.backend.as_deref(), Some("greptimedb"));
    }

    #[test]
    fn test_plain_comments_ignored() {
        let sql = "-- creates the users table\nCREATE TABLE users();";
        let d = parse_directives(sql).unwrap();
        assert_eq!(d, ScriptDirectives::default());
    }

    #[test]
    fn test_prefix_boundary() {
        // "bfm:schemas" must not match "bfm:schema"
        let sql = "-- bfm:schemas a,b\nCREATE TABLE foo();";
        let d = parse_directives(sql).unwrap();
        assert!(d.schema.is_none());
    }

    #[test]
    fn test_empty_values_ignored() {
        let sql = "-- bfm:depends\n-- bfm:schema\nCREATE TABLE foo();";
        let d = parse_directives(sql).unwrap();
        assert!(d.depends.is_empty());
        assert!(d.schema.is_none());
    }

    #[test]
    fn test_empty_payload() {
        let d = parse_directives("").unwrap();
        assert_eq!(d, ScriptDirectives::default());
    }
}
