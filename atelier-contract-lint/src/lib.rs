#![deny(clippy::print_stdout, clippy::print_stderr)]

//! CI-time source linter for the three tenant contracts: no tenant id
//! read from request-shaped values, no bare `or_where` outside an
//! explicit group, and an auth guard (or an allowlisted public marker)
//! on every state-changing endpoint. The report is deterministic so CI
//! diffs stay readable.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::PathBuf;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use walkdir::WalkDir;

pub const RULE_TENANT_SAFETY: &str = "tenant-safety";
pub const RULE_BRACKETED_DISJUNCTION: &str = "bracketed-disjunction";
pub const RULE_AUTHORIZATION_CONTRACT: &str = "authorization-contract";

/// Lines of lookback when deciding whether an `or_where` sits inside an
/// explicit group.
const GROUP_LOOKBACK: usize = 5;
/// Lines of lookahead when searching an endpoint body for its guard.
const GUARD_LOOKAHEAD: usize = 15;

#[derive(Debug, Error)]
pub enum LintError {
    #[error("allowlist unreadable: {0}")]
    Allowlist(String),
    #[error("scan failed: {0}")]
    Scan(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Allowlist {
    #[serde(default, rename = "allow")]
    entries: Vec<AllowEntry>,
}

/// One allowlist grant, keyed by file path and scope (the enclosing
/// function). The reason is mandatory: a grant without a rationale is a
/// smell the reviewer should see.
#[derive(Debug, Clone, Deserialize)]
pub struct AllowEntry {
    pub path: String,
    pub rule: String,
    #[serde(default)]
    pub scope: Option<String>,
    pub reason: String,
}

impl Allowlist {
    pub fn from_toml(raw: &str) -> Result<Self, LintError> {
        let allowlist: Allowlist =
            toml::from_str(raw).map_err(|err| LintError::Allowlist(err.to_string()))?;
        for entry in &allowlist.entries {
            if entry.reason.trim().is_empty() {
                return Err(LintError::Allowlist(format!(
                    "entry for {} has no reason",
                    entry.path
                )));
            }
        }
        Ok(allowlist)
    }

    fn permits(&self, path: &str, rule: &str, scope: &str) -> bool {
        self.entries.iter().any(|entry| {
            entry.rule == rule
                && path.ends_with(&entry.path)
                && entry
                    .scope
                    .as_deref()
                    .is_none_or(|allowed| allowed == scope)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub path: String,
    pub line: usize,
    pub rule: &'static str,
    /// Enclosing function, when one is in scope.
    pub scope: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub files_scanned: usize,
    pub violations: Vec<Violation>,
}

impl Report {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Stable rendering sorted by path then line.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for violation in &self.violations {
            let _ = writeln!(
                out,
                "{}:{}: [{}] {} (in {})",
                violation.path, violation.line, violation.rule, violation.message, violation.scope
            );
        }
        let _ = writeln!(
            out,
            "{} file(s) scanned, {} violation(s)",
            self.files_scanned,
            self.violations.len()
        );
        out
    }
}

struct Patterns {
    request_tenant_id: Regex,
    unscoped_call: Regex,
    or_where: Regex,
    grouped: Regex,
    fn_decl: Regex,
    endpoint: Regex,
    guard: Regex,
    public_marker: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, LintError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| LintError::Scan(format!("pattern: {err}")))
        };
        Ok(Self {
            request_tenant_id: compile(
                r"\b(body|payload|params|query|input|request|req)\s*\.\s*tenant_id\b",
            )?,
            unscoped_call: compile(r"\.\s*unscoped_\w+\s*\(")?,
            or_where: compile(r"\.\s*or_where\s*\(")?,
            grouped: compile(r"\.\s*grouped\s*\(")?,
            fn_decl: compile(r"\bfn\s+(\w+)")?,
            endpoint: compile(r"//\s*endpoint:\s*(GET|POST|PUT|PATCH|DELETE)\b")?,
            guard: compile(r"verify_access|verify_step_up|\.handle\s*\(")?,
            public_marker: compile(r"//\s*public-endpoint:\s*\S")?,
        })
    }
}

pub struct ContractLinter {
    root: PathBuf,
    allowlist: Allowlist,
}

impl ContractLinter {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allowlist: Allowlist::default(),
        }
    }

    #[must_use]
    pub fn with_allowlist(mut self, allowlist: Allowlist) -> Self {
        self.allowlist = allowlist;
        self
    }

    pub fn scan(&self) -> Result<Report, LintError> {
        let patterns = Patterns::compile()?;
        let mut report = Report::default();

        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                name != "target" && name != ".git" && name != "examples"
            });
        for entry in walker {
            let entry = entry.map_err(|err| LintError::Scan(err.to_string()))?;
            if !entry.file_type().is_file()
                || entry.path().extension().is_none_or(|ext| ext != "rs")
            {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let source = fs::read_to_string(entry.path())?;
            report.files_scanned += 1;
            self.scan_file(&patterns, &relative, &source, &mut report.violations);
        }

        report
            .violations
            .sort_by(|a, b| (a.path.as_str(), a.line).cmp(&(b.path.as_str(), b.line)));
        Ok(report)
    }

    fn scan_file(
        &self,
        patterns: &Patterns,
        path: &str,
        source: &str,
        violations: &mut Vec<Violation>,
    ) {
        let lines: Vec<&str> = source.lines().collect();
        let mut scope = String::from("module");
        let mut in_tests = false;

        for (index, line) in lines.iter().enumerate() {
            if line.contains("#[cfg(test)]") {
                // Test modules exercise internals on purpose.
                in_tests = true;
            }
            if let Some(captures) = patterns.fn_decl.captures(line)
                && let Some(name) = captures.get(1)
            {
                scope = name.as_str().to_string();
            }
            if in_tests {
                continue;
            }
            let number = index + 1;

            if patterns.request_tenant_id.is_match(line)
                && !self.allowlist.permits(path, RULE_TENANT_SAFETY, &scope)
            {
                violations.push(Violation {
                    path: path.to_string(),
                    line: number,
                    rule: RULE_TENANT_SAFETY,
                    scope: scope.clone(),
                    message: "tenant id read from a request-shaped value; derive it from the \
                              ambient context"
                        .into(),
                });
            }

            if patterns.unscoped_call.is_match(line)
                && !self.allowlist.permits(path, RULE_TENANT_SAFETY, &scope)
            {
                violations.push(Violation {
                    path: path.to_string(),
                    line: number,
                    rule: RULE_TENANT_SAFETY,
                    scope: scope.clone(),
                    message: "unscoped table access outside the allowlist".into(),
                });
            }

            if patterns.or_where.is_match(line) {
                let lookback_start = index.saturating_sub(GROUP_LOOKBACK);
                let grouped_nearby = lines[lookback_start..=index]
                    .iter()
                    .any(|candidate| patterns.grouped.is_match(candidate));
                if !grouped_nearby
                    && !self
                        .allowlist
                        .permits(path, RULE_BRACKETED_DISJUNCTION, &scope)
                {
                    violations.push(Violation {
                        path: path.to_string(),
                        line: number,
                        rule: RULE_BRACKETED_DISJUNCTION,
                        scope: scope.clone(),
                        message: "bare or_where outside an explicit group".into(),
                    });
                }
            }

            if let Some(captures) = patterns.endpoint.captures(line) {
                let method = captures.get(1).map_or("", |m| m.as_str());
                if matches!(method, "POST" | "PUT" | "PATCH" | "DELETE") {
                    self.check_endpoint(patterns, path, &lines, index, violations);
                }
            }
        }
    }

    /// A state-changing endpoint must either carry a guard call in its
    /// body or an explicit public marker with a rationale.
    fn check_endpoint(
        &self,
        patterns: &Patterns,
        path: &str,
        lines: &[&str],
        annotation_index: usize,
        violations: &mut Vec<Violation>,
    ) {
        let body_end = (annotation_index + GUARD_LOOKAHEAD).min(lines.len());
        let window = &lines[annotation_index..body_end];

        let guarded = window
            .iter()
            .any(|candidate| patterns.guard.is_match(candidate));
        let marked_public = window
            .iter()
            .any(|candidate| patterns.public_marker.is_match(candidate));

        let scope = window
            .iter()
            .find_map(|candidate| {
                patterns
                    .fn_decl
                    .captures(candidate)
                    .and_then(|captures| captures.get(1))
                    .map(|name| name.as_str().to_string())
            })
            .unwrap_or_else(|| "module".to_string());

        if !guarded
            && !marked_public
            && !self
                .allowlist
                .permits(path, RULE_AUTHORIZATION_CONTRACT, &scope)
        {
            violations.push(Violation {
                path: path.to_string(),
                line: annotation_index + 1,
                rule: RULE_AUTHORIZATION_CONTRACT,
                scope,
                message: "state-changing endpoint without an auth guard or public marker".into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn scan_source(source: &str, allowlist: Option<&str>) -> Report {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::write(dir.path().join("src/sample.rs"), source).expect("write");

        let mut linter = ContractLinter::new(dir.path());
        if let Some(raw) = allowlist {
            linter = linter.with_allowlist(Allowlist::from_toml(raw).expect("allowlist"));
        }
        linter.scan().expect("scan")
    }

    #[test]
    fn flags_tenant_id_from_request_values() {
        let report = scan_source(
            "fn create(&self) {\n    let tenant = payload.tenant_id;\n}\n",
            None,
        );
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule, RULE_TENANT_SAFETY);
        assert_eq!(report.violations[0].scope, "create");
        assert_eq!(report.violations[0].line, 2);
    }

    #[test]
    fn flags_unscoped_access_unless_allowlisted() {
        let source = "async fn pump(&self) {\n    let due = self.events.unscoped_scan(|e| true).await;\n}\n";
        let report = scan_source(source, None);
        assert_eq!(report.violations.len(), 1);

        let allow = r#"
            [[allow]]
            path = "src/sample.rs"
            rule = "tenant-safety"
            scope = "pump"
            reason = "relay claims rows across tenants by design"
        "#;
        let report = scan_source(source, Some(allow));
        assert!(report.is_clean(), "{}", report.render());
    }

    #[test]
    fn bare_or_where_is_flagged_grouped_is_not() {
        let bare = "fn list(&self) {\n    let q = q.or_where(|t| t.flagged);\n}\n";
        let report = scan_source(bare, None);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule, RULE_BRACKETED_DISJUNCTION);

        let grouped = "fn list(&self) {\n    let q = q.grouped(|g| {\n        g.or_where(|t| t.flagged)\n    });\n}\n";
        let report = scan_source(grouped, None);
        assert!(report.is_clean(), "{}", report.render());
    }

    #[test]
    fn state_changing_endpoints_need_a_guard_or_marker() {
        let unguarded = "// endpoint: POST /bookings\npub async fn create_booking(&self) {\n    do_work().await;\n}\n";
        let report = scan_source(unguarded, None);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule, RULE_AUTHORIZATION_CONTRACT);
        assert_eq!(report.violations[0].scope, "create_booking");

        let guarded = "// endpoint: POST /bookings\npub async fn create_booking(&self, token: &str) {\n    let claims = self.tokens.verify_access(token)?;\n}\n";
        assert!(scan_source(guarded, None).is_clean());

        let public = "// endpoint: POST /auth/register\n// public-endpoint: bootstrap\npub async fn register(&self) {\n    do_work().await;\n}\n";
        assert!(scan_source(public, None).is_clean());

        let read_only = "// endpoint: GET /bookings\npub async fn list_bookings(&self) {\n    do_work().await;\n}\n";
        assert!(scan_source(read_only, None).is_clean());
    }

    #[test]
    fn test_modules_are_skipped() {
        let source = "fn real() {}\n#[cfg(test)]\nmod tests {\n    fn t() { let x = payload.tenant_id; }\n}\n";
        assert!(scan_source(source, None).is_clean());
    }

    #[test]
    fn report_rendering_is_deterministic_and_sorted() {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::write(
            dir.path().join("src/b.rs"),
            "fn f() { let x = body.tenant_id; }\n",
        )
        .expect("write");
        fs::write(
            dir.path().join("src/a.rs"),
            "fn g() { let x = query.tenant_id; }\n",
        )
        .expect("write");

        let report = ContractLinter::new(dir.path()).scan().expect("scan");
        assert_eq!(report.violations.len(), 2);
        assert!(report.violations[0].path.ends_with("a.rs"));
        assert!(report.violations[1].path.ends_with("b.rs"));
        assert!(report.render().contains("2 violation(s)"));
    }

    #[test]
    fn allowlist_requires_a_reason() {
        let err = Allowlist::from_toml(
            r#"
            [[allow]]
            path = "src/sample.rs"
            rule = "tenant-safety"
            reason = "  "
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, LintError::Allowlist(_)));
    }
}
