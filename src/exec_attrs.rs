//! Attributes embedded at the top of EXECUTE scripts.
//!
//! A script may open with comment lines that say where it applies:
//!
//! ```text
//! --*-- Local-Table: orders, order_lines,
//! --*--     customers
//! --*-- Need-View: order_totals
//! ALTER TABLE @orders@ ADD COLUMN note TEXT;
//! ```
//!
//! A trailing comma continues the value list on the next attribute line.
//! Parsing stops at the first line that is not a comment.
//!
//! `Local-Table` matches a table registered on the applying queue and
//! `Local-Destination` additionally needs its destination table to exist.
//! `Need-Table` and `Need-View` match objects in the local schema.
//!
//! A script without attributes always runs. If every attribute matches it
//! runs, if none matches it is skipped, and a partial match is an error.
//! `@name@` in the body is replaced with the quoted destination of a
//! matched local table.

use crate::error::{ReplicationError, Result};
use crate::store::quote_ident;
use std::collections::{BTreeMap, HashMap};

const META_PREFIX: &str = "--*--";

/// Attribute keys understood on SQLite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecAttr {
    LocalTable,
    LocalDestination,
    NeedTable,
    NeedView,
}

impl ExecAttr {
    fn parse(script: &str, key: &str) -> Result<Self> {
        match key.to_ascii_lowercase().as_str() {
            "local-table" => Ok(Self::LocalTable),
            "local-destination" => Ok(Self::LocalDestination),
            "need-table" => Ok(Self::NeedTable),
            "need-view" => Ok(Self::NeedView),
            // SQLite has no sequences, functions or schemas to look up.
            "local-sequence" | "need-sequence" | "need-function" | "need-schema" => {
                Err(invalid(script, format!("attribute {key} is not supported")))
            }
            _ => Err(invalid(script, format!("unknown attribute {key}"))),
        }
    }

    fn matches(self, name: &str, ctx: &ExecContext<'_>) -> bool {
        match self {
            Self::LocalTable => ctx.local.contains_key(name),
            Self::LocalDestination => ctx
                .local
                .get(name)
                .is_some_and(|dest| ctx.schema_has(dest, "table")),
            Self::NeedTable => ctx.schema_has(name, "table"),
            Self::NeedView => ctx.schema_has(name, "view"),
        }
    }
}

/// What a node knows when deciding whether a script applies.
pub struct ExecContext<'a> {
    /// Registered table name to local destination table.
    pub local: &'a HashMap<String, String>,
    /// Schema object name to its type (`table` or `view`).
    pub schema: &'a HashMap<String, String>,
}

impl ExecContext<'_> {
    fn schema_has(&self, name: &str, kind: &str) -> bool {
        self.schema.get(name).is_some_and(|t| t == kind)
    }
}

/// Parsed attribute block of one EXECUTE script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecAttrs {
    attrs: BTreeMap<ExecAttr, Vec<String>>,
}

impl ExecAttrs {
    /// Parse the attribute block of `sql`. `script` names it in errors.
    pub fn parse(script: &str, sql: &str) -> Result<Self> {
        let mut attrs = Self::default();
        let mut continued: Option<ExecAttr> = None;

        for line in sql.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !line.starts_with("--") {
                break;
            }
            let Some(rest) = line.strip_prefix(META_PREFIX) else {
                continue;
            };
            let rest = rest.trim();
            if rest.is_empty() {
                continue;
            }

            let (key, values) = match continued.take() {
                Some(key) => (key, rest),
                None => {
                    let (key, values) = rest
                        .split_once(':')
                        .ok_or_else(|| invalid(script, format!("malformed attribute line: {rest}")))?;
                    (ExecAttr::parse(script, key.trim())?, values.trim())
                }
            };
            if values.ends_with(',') {
                continued = Some(key);
            }
            attrs.attrs.entry(key).or_default().extend(
                values
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(String::from),
            );
        }
        Ok(attrs)
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.values().all(Vec::is_empty)
    }

    /// Values listed under `attr`.
    pub fn values(&self, attr: ExecAttr) -> &[String] {
        self.attrs.get(&attr).map(Vec::as_slice).unwrap_or_default()
    }

    /// Decide whether the script runs here.
    pub fn need_execute(&self, script: &str, ctx: &ExecContext<'_>) -> Result<bool> {
        let mut matched = Vec::new();
        let mut missed = Vec::new();
        for (attr, names) in &self.attrs {
            for name in names {
                if attr.matches(name, ctx) {
                    matched.push(name.as_str());
                } else {
                    missed.push(name.as_str());
                }
            }
        }
        match (matched.is_empty(), missed.is_empty()) {
            (_, true) => Ok(true),
            (true, false) => Ok(false),
            (false, false) => Err(invalid(
                script,
                format!(
                    "attributes match partially: matched [{}], missed [{}]",
                    matched.join(", "),
                    missed.join(", ")
                ),
            )),
        }
    }

    /// Replace `@table@` placeholders with quoted local destinations.
    pub fn rewrite(&self, sql: &str, ctx: &ExecContext<'_>) -> String {
        let mut sql = sql.to_string();
        for attr in [ExecAttr::LocalTable, ExecAttr::LocalDestination] {
            for name in self.values(attr) {
                if let Some(dest) = ctx.local.get(name) {
                    sql = sql.replace(&format!("@{name}@"), &quote_ident(dest));
                }
            }
        }
        sql
    }
}

fn invalid(script: &str, message: String) -> ReplicationError {
    ReplicationError::Execute {
        name: script.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const SCRIPT: &str = "
--*-- Local-Table: orders, order_lines,
--*--     customers
--*-- Need-View: order_totals
-- plain comment
--*-- Need-Table: audit
ALTER TABLE @orders@ ADD COLUMN note TEXT;
--*-- Need-Table: ignored_after_body
";

    #[test]
    fn test_parse_continuation_and_stop() {
        let attrs = ExecAttrs::parse("001.sql", SCRIPT).unwrap();
        assert_eq!(
            attrs.values(ExecAttr::LocalTable),
            ["orders", "order_lines", "customers"]
        );
        assert_eq!(attrs.values(ExecAttr::NeedView), ["order_totals"]);
        assert_eq!(attrs.values(ExecAttr::NeedTable), ["audit"]);
        assert!(attrs.values(ExecAttr::LocalDestination).is_empty());
    }

    #[test]
    fn test_parse_rejects_unknown_and_unsupported_keys() {
        let err = ExecAttrs::parse("x.sql", "--*-- Need-Colour: red\nSELECT 1;").unwrap_err();
        assert!(matches!(err, ReplicationError::Execute { ref name, .. } if name == "x.sql"));

        let err = ExecAttrs::parse("x.sql", "--*-- Need-Sequence: s1\nSELECT 1;").unwrap_err();
        assert!(err.to_string().contains("not supported"));

        assert!(ExecAttrs::parse("x.sql", "--*-- no colon here").is_err());
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let attrs = ExecAttrs::parse("x.sql", "--*-- need-table: t1\n").unwrap();
        assert_eq!(attrs.values(ExecAttr::NeedTable), ["t1"]);
    }

    #[test]
    fn test_need_execute() {
        let local = map(&[("orders", "orders_local")]);
        let schema = map(&[("orders_local", "table"), ("totals", "view")]);
        let ctx = ExecContext {
            local: &local,
            schema: &schema,
        };

        let plain = ExecAttrs::parse("a.sql", "CREATE TABLE t (id INTEGER PRIMARY KEY);").unwrap();
        assert!(plain.is_empty());
        assert!(plain.need_execute("a.sql", &ctx).unwrap());

        let all = ExecAttrs::parse(
            "b.sql",
            "--*-- Local-Destination: orders\n--*-- Need-View: totals\nSELECT 1;",
        )
        .unwrap();
        assert!(all.need_execute("b.sql", &ctx).unwrap());

        let none = ExecAttrs::parse("c.sql", "--*-- Local-Table: invoices\nSELECT 1;").unwrap();
        assert!(!none.need_execute("c.sql", &ctx).unwrap());

        // a view does not satisfy Need-Table
        let wrong_kind = ExecAttrs::parse("d.sql", "--*-- Need-Table: totals\nSELECT 1;").unwrap();
        assert!(!wrong_kind.need_execute("d.sql", &ctx).unwrap());

        let mixed = ExecAttrs::parse("e.sql", "--*-- Local-Table: orders, invoices\nSELECT 1;").unwrap();
        let err = mixed.need_execute("e.sql", &ctx).unwrap_err();
        assert!(err.to_string().contains("invoices"));
    }

    #[test]
    fn test_rewrite_uses_local_destination() {
        let local = map(&[("orders", "orders_local")]);
        let schema = HashMap::new();
        let ctx = ExecContext {
            local: &local,
            schema: &schema,
        };
        let attrs = ExecAttrs::parse("a.sql", "--*-- Local-Table: orders\n").unwrap();
        assert_eq!(
            attrs.rewrite("ALTER TABLE @orders@ ADD COLUMN x;", &ctx),
            "ALTER TABLE \"orders_local\" ADD COLUMN x;"
        );
    }
}
