//! Compliance checks: encryption at rest, required tags and labels, backup
//! retention.

use super::hcl::{self, HclBlock};
use super::syntax::document_starts;
use super::Validator;
use crate::core::config::ValidationSettings;
use crate::core::types::{
    Finding, GeneratedArtifact, InfrastructureRequest, Severity, SubVerdict, TargetFormat,
    ValidatorKind,
};
use regex::Regex;
use serde::Deserialize;
use serde_yaml_ng::Value;

const REQUIRED_LABELS: &[&str] = &["app", "managed-by"];

pub struct ComplianceValidator {
    settings: ValidationSettings,
}

impl ComplianceValidator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self { settings }
    }

    pub fn check(&self, format: TargetFormat, source: &str) -> Vec<Finding> {
        match format {
            TargetFormat::Terraform => self.check_terraform(source),
            TargetFormat::Kubernetes => check_kubernetes(source),
            TargetFormat::Ansible | TargetFormat::Docker => Vec::new(),
        }
    }

    fn check_terraform(&self, source: &str) -> Vec<Finding> {
        let Ok(blocks) = hcl::parse(source) else {
            return Vec::new();
        };
        let mut findings = self.check_tags(&blocks);
        findings.extend(check_encryption(&blocks));
        findings.extend(self.check_backups(&blocks));
        findings
    }

    fn missing_tags(&self, text: &str) -> Vec<String> {
        self.settings
            .required_tags
            .iter()
            .filter(|tag| {
                let pattern = format!(r#"(?i)(^|[\s{{,])"?{}"?\s*="#, regex::escape(tag));
                !Regex::new(&pattern).is_ok_and(|re| re.is_match(text))
            })
            .cloned()
            .collect()
    }

    fn check_tags(&self, blocks: &[HclBlock]) -> Vec<Finding> {
        if self.settings.required_tags.is_empty() {
            return Vec::new();
        }
        let locals: Vec<&HclBlock> = blocks.iter().filter(|b| b.keyword == "locals").collect();
        let resolve = |value: &str| -> String {
            let v = value.trim();
            match v.strip_prefix("local.") {
                Some(name) => locals
                    .iter()
                    .find_map(|l| l.attr(name))
                    .map(|a| a.value.clone())
                    .unwrap_or_default(),
                None => v.to_string(),
            }
        };

        let default_tags = blocks
            .iter()
            .filter(|b| b.keyword == "provider")
            .flat_map(|p| p.children("default_tags"))
            .find_map(|d| d.attr("tags"))
            .map(|a| resolve(&a.value));
        if let Some(text) = default_tags {
            let missing = self.missing_tags(&text);
            if missing.is_empty() {
                return Vec::new();
            }
            return vec![Finding::new(
                "required-tags",
                Severity::Medium,
                format!("provider default_tags lack {}", missing.join(", ")),
            )];
        }

        let mut findings = Vec::new();
        let mut tagged = 0;
        for res in hcl::resources(blocks) {
            let Some(attr) = ["tags", "labels"].iter().find_map(|k| res.attr(k)).or_else(|| {
                res.children("settings").find_map(|s| s.attr("user_labels"))
            }) else {
                continue;
            };
            tagged += 1;
            let missing = self.missing_tags(&resolve(&attr.value));
            if !missing.is_empty() {
                findings.push(
                    Finding::new(
                        "required-tags",
                        Severity::Medium,
                        format!("{} lacks tags {}", res.address(), missing.join(", ")),
                    )
                    .at_line(attr.line),
                );
            }
        }
        if tagged == 0 {
            findings.push(Finding::new(
                "required-tags",
                Severity::Medium,
                "no default_tags and no tagged resources",
            ));
        }
        findings
    }

    fn check_backups(&self, blocks: &[HclBlock]) -> Vec<Finding> {
        let min = self.settings.min_backup_retention_days;
        let mut findings = Vec::new();
        for res in hcl::resources(blocks) {
            let key = match res.resource_type() {
                Some("aws_db_instance") | Some("aws_rds_cluster") => "backup_retention_period",
                Some("azurerm_postgresql_flexible_server") => "backup_retention_days",
                _ => continue,
            };
            // AWS keeps one day when unset
            let days = res.attr(key).and_then(|a| a.as_i64()).unwrap_or(1);
            if days < min {
                findings.push(
                    Finding::new(
                        "backup-retention",
                        Severity::Medium,
                        format!("{} keeps backups {} day(s), minimum is {}", res.address(), days, min),
                    )
                    .at_line(res.line),
                );
            }
        }
        findings
    }
}

impl Validator for ComplianceValidator {
    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Compliance
    }

    fn required(&self) -> bool {
        self.settings.compliance_required
    }

    fn validate(&self, artifact: &GeneratedArtifact, _request: &InfrastructureRequest) -> SubVerdict {
        let findings = self.check(artifact.format(), artifact.content());
        SubVerdict::from_findings(ValidatorKind::Compliance, self.required(), findings)
    }
}

fn unencrypted(address: &str, line: usize, what: &str) -> Finding {
    Finding::new(
        "encryption-at-rest",
        Severity::High,
        format!("{} {}", address, what),
    )
    .at_line(line)
}

fn check_encryption(blocks: &[HclBlock]) -> Vec<Finding> {
    let mut findings = Vec::new();
    let has_sse_resource =
        hcl::resources_of(blocks, "aws_s3_bucket_server_side_encryption_configuration")
            .next()
            .is_some();
    for res in hcl::resources(blocks) {
        let address = res.address();
        match res.resource_type() {
            Some("aws_s3_bucket") => {
                let inline = res
                    .children("server_side_encryption_configuration")
                    .next()
                    .is_some();
                if !inline && !has_sse_resource {
                    findings.push(unencrypted(&address, res.line, "has no server-side encryption"));
                }
            }
            Some("aws_db_instance") | Some("aws_rds_cluster") => {
                if !res.attr("storage_encrypted").is_some_and(|a| a.is_true()) {
                    findings.push(unencrypted(&address, res.line, "does not set storage_encrypted"));
                }
            }
            Some("aws_ebs_volume") => {
                if !res.attr("encrypted").is_some_and(|a| a.is_true()) {
                    findings.push(unencrypted(&address, res.line, "is not encrypted"));
                }
            }
            Some("aws_instance") => {
                for dev in res.children("root_block_device").chain(res.children("ebs_block_device")) {
                    if !dev.attr("encrypted").is_some_and(|a| a.is_true()) {
                        findings.push(unencrypted(&address, dev.line, "has an unencrypted volume"));
                    }
                }
            }
            Some("aws_launch_template") => {
                for ebs in res.children("block_device_mappings").flat_map(|m| m.children("ebs")) {
                    if !ebs.attr("encrypted").is_some_and(|a| a.is_true()) {
                        findings.push(unencrypted(&address, ebs.line, "maps an unencrypted volume"));
                    }
                }
            }
            Some("azurerm_storage_account") => {
                if res
                    .attr("infrastructure_encryption_enabled")
                    .is_some_and(|a| a.value.trim() == "false")
                {
                    findings.push(unencrypted(&address, res.line, "disables infrastructure encryption"));
                }
            }
            _ => {}
        }
    }
    findings
}

fn check_kubernetes(source: &str) -> Vec<Finding> {
    let starts = document_starts(source);
    let mut findings = Vec::new();
    for (idx, de) in serde_yaml_ng::Deserializer::from_str(source).enumerate() {
        let Ok(doc) = Value::deserialize(de) else {
            return findings;
        };
        let Some(kind) = doc["kind"].as_str() else {
            continue;
        };
        let line = starts.get(idx).copied().unwrap_or(1);
        let name = doc["metadata"]["name"].as_str().unwrap_or("?");

        if kind == "PersistentVolumeClaim" {
            let class = doc["spec"]["storageClassName"].as_str().unwrap_or_default();
            if !class.contains("encrypt") {
                findings.push(
                    Finding::new(
                        "encryption-at-rest",
                        Severity::High,
                        format!("PersistentVolumeClaim/{} uses unencrypted storage class '{}'", name, class),
                    )
                    .at_line(line),
                );
            }
        }

        if kind == "Namespace" {
            continue;
        }
        let mut missing: Vec<&str> = REQUIRED_LABELS
            .iter()
            .copied()
            .filter(|l| doc["metadata"]["labels"][*l].as_str().is_none())
            .collect();
        let templated = matches!(
            kind,
            "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job"
        );
        if templated
            && doc["spec"]["template"]["metadata"]["labels"]["app"].as_str().is_none()
            && !missing.contains(&"app")
        {
            missing.push("app");
        }
        if !missing.is_empty() {
            findings.push(
                Finding::new(
                    "required-labels",
                    Severity::Medium,
                    format!("{}/{} lacks labels {}", kind, name, missing.join(", ")),
                )
                .at_line(line),
            );
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ComplianceValidator {
        ComplianceValidator::new(ValidationSettings::default())
    }

    fn rules(format: TargetFormat, src: &str) -> Vec<String> {
        validator().check(format, src).into_iter().map(|f| f.rule).collect()
    }

    const TAGGED: &str = "provider \"aws\" {\n  default_tags {\n    tags = local.common_tags\n  }\n}\n\nlocals {\n  common_tags = {\n    Environment = \"prod\"\n    Owner = \"me\"\n    Project = \"p\"\n    CostCenter = \"c\"\n  }\n}\n";

    #[test]
    fn test_compliance_default_tags_resolve_locals() {
        let src = format!("{}\nresource \"aws_ebs_volume\" \"v\" {{\n  encrypted = true\n}}\n", TAGGED);
        assert!(rules(TargetFormat::Terraform, &src).is_empty());
    }

    #[test]
    fn test_compliance_missing_tags() {
        let src = "resource \"aws_ebs_volume\" \"v\" {\n  encrypted = true\n  tags = {\n    Owner = \"me\"\n  }\n}\n";
        let findings = validator().check(TargetFormat::Terraform, src);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Medium);
        assert!(findings[0].message.contains("Environment, Project, CostCenter"));

        let untagged = "resource \"aws_ebs_volume\" \"v\" {\n  encrypted = true\n}\n";
        assert_eq!(rules(TargetFormat::Terraform, untagged), vec!["required-tags"]);
    }

    #[test]
    fn test_compliance_encryption() {
        let src = format!(
            "{}\nresource \"aws_s3_bucket\" \"b\" {{\n  bucket = \"x\"\n}}\n\nresource \"aws_db_instance\" \"d\" {{\n  storage_encrypted = false\n  backup_retention_period = 7\n}}\n",
            TAGGED
        );
        let findings = validator().check(TargetFormat::Terraform, &src);
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.rule == "encryption-at-rest" && f.severity == Severity::High));
    }

    #[test]
    fn test_compliance_backup_retention() {
        let src = format!(
            "{}\nresource \"aws_db_instance\" \"d\" {{\n  storage_encrypted = true\n  backup_retention_period = 3\n}}\n",
            TAGGED
        );
        let findings = validator().check(TargetFormat::Terraform, &src);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule, "backup-retention");
        assert_eq!(findings[0].severity, Severity::Medium);
    }

    #[test]
    fn test_compliance_kubernetes() {
        let src = "apiVersion: v1\nkind: PersistentVolumeClaim\nmetadata:\n  name: data\n  labels:\n    app: web\n    managed-by: autodevops\nspec:\n  storageClassName: standard\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  labels:\n    app: web\nspec:\n  template:\n    metadata:\n      labels:\n        app: web\n    spec:\n      containers: []\n";
        let findings = validator().check(TargetFormat::Kubernetes, src);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].rule, "encryption-at-rest");
        assert_eq!(findings[0].line, Some(1));
        assert_eq!(findings[1].rule, "required-labels");
        assert!(findings[1].message.contains("managed-by"));
        assert_eq!(findings[1].line, Some(11));
    }
}
