//! Syntax validation: the artifact must parse and have the expected shape.

use super::hcl::{self, HclBlock};
use super::Validator;
use crate::core::types::{
    Finding, GeneratedArtifact, InfrastructureRequest, Severity, SubVerdict, TargetFormat,
    ValidatorKind,
};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static VAR_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bvar\.([A-Za-z_][A-Za-z0-9_-]*)").expect("valid regex"));

/// Allowed top-level Terraform blocks and their label counts.
const TOP_LEVEL: &[(&str, usize)] = &[
    ("resource", 2),
    ("data", 2),
    ("variable", 1),
    ("output", 1),
    ("provider", 1),
    ("module", 1),
    ("terraform", 0),
    ("locals", 0),
];

pub struct SyntaxValidator;

impl Validator for SyntaxValidator {
    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Syntax
    }

    fn required(&self) -> bool {
        true
    }

    fn validate(&self, artifact: &GeneratedArtifact, _request: &InfrastructureRequest) -> SubVerdict {
        let findings = check(artifact.format(), artifact.content());
        SubVerdict::from_findings(ValidatorKind::Syntax, true, findings)
    }
}

/// Syntax findings for raw source text of the given format.
pub fn check(format: TargetFormat, source: &str) -> Vec<Finding> {
    match format {
        TargetFormat::Terraform => check_terraform(source),
        TargetFormat::Kubernetes => check_kubernetes(source),
        TargetFormat::Ansible => check_ansible(source),
        TargetFormat::Docker => check_compose(source),
    }
}

// ============================================================================
// Terraform
// ============================================================================

fn check_terraform(source: &str) -> Vec<Finding> {
    let blocks = match hcl::parse(source) {
        Ok(b) => b,
        Err(e) => {
            return vec![Finding::new("hcl-parse", Severity::Critical, e.message).at_line(e.line)]
        }
    };
    let mut findings = Vec::new();

    for block in &blocks {
        match TOP_LEVEL.iter().find(|(k, _)| *k == block.keyword) {
            None => findings.push(
                Finding::new(
                    "unknown-block",
                    Severity::High,
                    format!("unknown top-level block '{}'", block.keyword),
                )
                .at_line(block.line),
            ),
            Some((_, labels)) if block.labels.len() != *labels => findings.push(
                Finding::new(
                    "block-labels",
                    Severity::High,
                    format!(
                        "'{}' block takes {} label(s), found {}",
                        block.keyword,
                        labels,
                        block.labels.len()
                    ),
                )
                .at_line(block.line),
            ),
            Some(_) => {}
        }
    }

    if !blocks
        .iter()
        .any(|b| matches!(b.keyword.as_str(), "resource" | "module" | "data"))
    {
        findings.push(Finding::new(
            "no-resources",
            Severity::High,
            "configuration declares no resources",
        ));
    }

    let mut seen = BTreeSet::new();
    for block in hcl::resources(&blocks) {
        if !seen.insert(block.address()) {
            findings.push(
                Finding::new(
                    "duplicate-resource",
                    Severity::High,
                    format!("resource {} declared more than once", block.address()),
                )
                .at_line(block.line),
            );
        }
    }

    let declared: BTreeSet<&str> = blocks
        .iter()
        .filter(|b| b.keyword == "variable")
        .filter_map(|b| b.labels.first().map(String::as_str))
        .collect();
    let mut reported = BTreeSet::new();
    for block in blocks.iter().flat_map(HclBlock::walk) {
        for attr in &block.attributes {
            for cap in VAR_REF_RE.captures_iter(&attr.value) {
                let name = &cap[1];
                if !declared.contains(name) && reported.insert(name.to_string()) {
                    findings.push(
                        Finding::new(
                            "undeclared-variable",
                            Severity::High,
                            format!("reference to undeclared variable '{}'", name),
                        )
                        .at_line(attr.line),
                    );
                }
            }
        }
    }
    findings
}

// ============================================================================
// YAML formats
// ============================================================================

fn yaml_error(e: &serde_yaml_ng::Error) -> Finding {
    let finding = Finding::new("yaml-parse", Severity::Critical, e.to_string());
    match e.location() {
        Some(loc) => finding.at_line(loc.line()),
        None => finding,
    }
}

/// First line of each `---`-separated document.
pub(crate) fn document_starts(source: &str) -> Vec<usize> {
    let mut starts = vec![1];
    for (idx, line) in source.lines().enumerate() {
        if line.trim_end() == "---" && idx > 0 {
            starts.push(idx + 2);
        }
    }
    starts
}

fn check_kubernetes(source: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    let starts = document_starts(source);
    let mut documents = 0;
    for (idx, doc) in serde_yaml_ng::Deserializer::from_str(source).enumerate() {
        let value = match serde_yaml_ng::Value::deserialize(doc) {
            Ok(v) => v,
            Err(e) => {
                findings.push(yaml_error(&e));
                return findings;
            }
        };
        if value.is_null() {
            continue;
        }
        documents += 1;
        let line = starts.get(idx).copied().unwrap_or(1);
        let Some(map) = value.as_mapping() else {
            findings.push(
                Finding::new("manifest-shape", Severity::High, "document is not a mapping")
                    .at_line(line),
            );
            continue;
        };
        for field in ["apiVersion", "kind"] {
            if map.get(field).and_then(|v| v.as_str()).is_none() {
                findings.push(
                    Finding::new(
                        "manifest-field",
                        Severity::High,
                        format!("document {} is missing '{}'", idx + 1, field),
                    )
                    .at_line(line),
                );
            }
        }
        if value["metadata"]["name"].as_str().is_none() {
            findings.push(
                Finding::new(
                    "manifest-field",
                    Severity::High,
                    format!("document {} is missing 'metadata.name'", idx + 1),
                )
                .at_line(line),
            );
        }
    }
    if documents == 0 && findings.is_empty() {
        findings.push(Finding::new(
            "empty-manifest",
            Severity::High,
            "manifest contains no documents",
        ));
    }
    findings
}

/// Line of the n-th top-level list item (`- ` at column 0).
fn play_line(source: &str, n: usize) -> Option<usize> {
    source
        .lines()
        .enumerate()
        .filter(|(_, l)| l.starts_with("- "))
        .nth(n)
        .map(|(i, _)| i + 1)
}

fn check_ansible(source: &str) -> Vec<Finding> {
    let value: serde_yaml_ng::Value = match serde_yaml_ng::from_str(source) {
        Ok(v) => v,
        Err(e) => return vec![yaml_error(&e)],
    };
    let Some(plays) = value.as_sequence().filter(|s| !s.is_empty()) else {
        return vec![Finding::new(
            "playbook-shape",
            Severity::High,
            "playbook must be a non-empty list of plays",
        )];
    };

    let mut findings = Vec::new();
    for (i, play) in plays.iter().enumerate() {
        let at = |f: Finding| match play_line(source, i) {
            Some(line) => f.at_line(line),
            None => f,
        };
        if play["hosts"].as_str().is_none() {
            findings.push(at(Finding::new(
                "play-field",
                Severity::High,
                format!("play {} has no 'hosts'", i + 1),
            )));
        }
        match play["tasks"].as_sequence() {
            None => findings.push(at(Finding::new(
                "play-field",
                Severity::High,
                format!("play {} has no 'tasks' list", i + 1),
            ))),
            Some(tasks) => {
                for (t, task) in tasks.iter().enumerate() {
                    if task["name"].as_str().is_none() {
                        findings.push(at(Finding::new(
                            "task-name",
                            Severity::Medium,
                            format!("task {} of play {} has no name", t + 1, i + 1),
                        )));
                    }
                }
            }
        }
    }
    findings
}

// ============================================================================
// Docker Compose
// ============================================================================

/// Line on which a top-level service key is declared.
fn service_line(source: &str, name: &str) -> Option<usize> {
    let key = format!("{}:", name);
    source
        .lines()
        .position(|l| l.strip_prefix("  ").is_some_and(|rest| rest.trim_end() == key))
        .map(|i| i + 1)
}

fn check_compose(source: &str) -> Vec<Finding> {
    let value: serde_yaml_ng::Value = match serde_yaml_ng::from_str(source) {
        Ok(v) => v,
        Err(e) => return vec![yaml_error(&e)],
    };
    let Some(services) = value["services"].as_mapping().filter(|m| !m.is_empty()) else {
        return vec![Finding::new(
            "compose-shape",
            Severity::High,
            "compose file must have a non-empty 'services' mapping",
        )];
    };

    let mut findings = Vec::new();
    for (key, service) in services {
        let name = key.as_str().unwrap_or("?");
        let at = |f: Finding| match service_line(source, name) {
            Some(line) => f.at_line(line),
            None => f,
        };
        if !service.is_mapping() {
            findings.push(at(Finding::new(
                "service-shape",
                Severity::High,
                format!("service '{}' is not a mapping", name),
            )));
            continue;
        }
        if service["image"].as_str().is_none() && service["build"].is_null() {
            findings.push(at(Finding::new(
                "service-field",
                Severity::High,
                format!("service '{}' has neither 'image' nor 'build'", name),
            )));
        }
        for dep in service["depends_on"].as_sequence().into_iter().flatten() {
            let dep = dep.as_str().unwrap_or_default();
            if !services.contains_key(dep) {
                findings.push(at(Finding::new(
                    "unknown-dependency",
                    Severity::High,
                    format!("service '{}' depends on undefined service '{}'", name, dep),
                )));
            }
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::VerdictStatus;

    fn status(format: TargetFormat, src: &str) -> VerdictStatus {
        SubVerdict::from_findings(ValidatorKind::Syntax, true, check(format, src)).status
    }

    #[test]
    fn test_syntax_terraform_ok() {
        let src = "variable \"name\" {\n  type = string\n}\n\nresource \"aws_s3_bucket\" \"b\" {\n  bucket = var.name\n}\n";
        assert!(check(TargetFormat::Terraform, src).is_empty());
    }

    #[test]
    fn test_syntax_terraform_unbalanced() {
        let findings = check(TargetFormat::Terraform, "resource \"a\" \"b\" {\n  x = 1\n");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].line, Some(1));
    }

    #[test]
    fn test_syntax_terraform_structure() {
        let src = "resource \"only_one_label\" {\n}\n\nwidget \"x\" {\n}\n";
        let rules: Vec<String> = check(TargetFormat::Terraform, src)
            .into_iter()
            .map(|f| f.rule)
            .collect();
        assert!(rules.contains(&"block-labels".to_string()));
        assert!(rules.contains(&"unknown-block".to_string()));
        assert_eq!(status(TargetFormat::Terraform, src), VerdictStatus::Fail);
    }

    #[test]
    fn test_syntax_terraform_undeclared_and_duplicate() {
        let src = "resource \"a\" \"b\" {\n  x = var.missing\n}\nresource \"a\" \"b\" {\n}\n";
        let rules: Vec<String> = check(TargetFormat::Terraform, src)
            .into_iter()
            .map(|f| f.rule)
            .collect();
        assert_eq!(rules, vec!["duplicate-resource", "undeclared-variable"]);
    }

    #[test]
    fn test_syntax_terraform_no_resources() {
        let findings = check(TargetFormat::Terraform, "locals {\n  a = 1\n}\n");
        assert_eq!(findings[0].rule, "no-resources");
    }

    #[test]
    fn test_syntax_kubernetes() {
        let ok = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: prod\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n";
        assert!(check(TargetFormat::Kubernetes, ok).is_empty());

        let missing = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: prod\n---\nkind: Service\nmetadata: {}\n";
        let findings = check(TargetFormat::Kubernetes, missing);
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.line == Some(6)));

        let broken = "apiVersion: v1\nkind: [unclosed\n";
        let findings = check(TargetFormat::Kubernetes, broken);
        assert_eq!(findings[0].rule, "yaml-parse");
        assert_eq!(findings[0].severity, Severity::Critical);

        assert_eq!(
            check(TargetFormat::Kubernetes, "# only a comment\n")[0].rule,
            "empty-manifest"
        );
    }

    #[test]
    fn test_syntax_ansible() {
        let ok = "- name: p\n  hosts: all\n  tasks:\n    - name: t\n      ping: {}\n";
        assert!(check(TargetFormat::Ansible, ok).is_empty());

        let bad = "- name: p\n  tasks:\n    - ping: {}\n";
        let findings = check(TargetFormat::Ansible, bad);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].line, Some(1));
        assert_eq!(status(TargetFormat::Ansible, bad), VerdictStatus::Fail);

        assert_eq!(
            check(TargetFormat::Ansible, "hosts: all\n")[0].rule,
            "playbook-shape"
        );
    }

    #[test]
    fn test_syntax_compose() {
        let ok = "services:\n  web:\n    image: nginx:1.27\n  proxy:\n    image: nginx:1.27-alpine\n    depends_on:\n    - web\n";
        assert!(check(TargetFormat::Docker, ok).is_empty());

        let bad = "services:\n  web:\n    ports:\n    - 80:80\n    depends_on:\n    - db\n";
        let findings = check(TargetFormat::Docker, bad);
        let rules: Vec<&str> = findings.iter().map(|f| f.rule.as_str()).collect();
        assert_eq!(rules, vec!["service-field", "unknown-dependency"]);
        assert_eq!(findings[0].line, Some(2));
        assert_eq!(status(TargetFormat::Docker, bad), VerdictStatus::Fail);

        assert_eq!(
            check(TargetFormat::Docker, "version: '3.8'\n")[0].rule,
            "compose-shape"
        );
    }
}
