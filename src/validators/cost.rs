//! Monthly cost estimate from a static on-demand price table.
//!
//! Never blocks: the worst it does is add a `Low` finding when the estimate
//! exceeds the configured budget.

use super::hcl::{self, HclBlock};
use super::Validator;
use crate::core::config::ValidationSettings;
use crate::core::types::{
    CostEstimate, CostLineItem, Finding, GeneratedArtifact, InfrastructureRequest, Severity,
    SubVerdict, TargetFormat, ValidatorKind,
};
use serde::Deserialize;
use serde_yaml_ng::Value;

/// USD per hour, on-demand.
const HOURLY: &[(&str, f64)] = &[
    // aws ec2
    ("t2.micro", 0.0116),
    ("t3.micro", 0.0104),
    ("t3.small", 0.0208),
    ("t3.medium", 0.0416),
    ("t3.large", 0.0832),
    ("m5.large", 0.096),
    ("m5.xlarge", 0.192),
    ("c5.large", 0.085),
    // aws rds
    ("db.t3.micro", 0.017),
    ("db.t3.small", 0.034),
    ("db.t3.medium", 0.068),
    ("db.m5.large", 0.171),
    // azure
    ("Standard_B1s", 0.0104),
    ("Standard_B2s", 0.0416),
    ("Standard_D2s_v3", 0.096),
    ("B_Standard_B1ms", 0.0207),
    // gcp
    ("e2-micro", 0.0084),
    ("e2-small", 0.0168),
    ("e2-medium", 0.0335),
    ("n1-standard-1", 0.0475),
    ("db-f1-micro", 0.0105),
];

const ALB_HOURLY: f64 = 0.0225;
const S3_GB_MONTH: f64 = 0.023;
const S3_ASSUMED_GB: f64 = 100.0;
const K8S_CPU_HOURLY: f64 = 0.0316;
const K8S_GIB_HOURLY: f64 = 0.0035;
const PV_GB_MONTH: f64 = 0.10;

fn hourly_price(size: &str) -> Option<f64> {
    HOURLY.iter().find(|(s, _)| *s == size).map(|(_, p)| *p)
}

fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub struct CostValidator {
    settings: ValidationSettings,
}

impl CostValidator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self { settings }
    }

    fn hourly_item(&self, resource: String, unit: &str, quantity: f64, hourly: f64) -> CostLineItem {
        CostLineItem {
            resource,
            unit: unit.to_string(),
            quantity,
            hourly_usd: hourly,
            monthly_usd: round_cents(quantity * hourly * self.settings.hours_per_month),
        }
    }

    fn monthly_item(&self, resource: String, unit: &str, quantity: f64, per_unit_month: f64) -> CostLineItem {
        let monthly = quantity * per_unit_month;
        CostLineItem {
            resource,
            unit: unit.to_string(),
            quantity,
            hourly_usd: monthly / self.settings.hours_per_month,
            monthly_usd: round_cents(monthly),
        }
    }

    /// Estimate plus any findings about unpriced resources or the budget.
    pub fn estimate(&self, format: TargetFormat, source: &str) -> (CostEstimate, Vec<Finding>) {
        let mut findings = Vec::new();
        let line_items = match format {
            TargetFormat::Terraform => self.terraform_items(source, &mut findings),
            TargetFormat::Kubernetes => self.kubernetes_items(source),
            TargetFormat::Ansible | TargetFormat::Docker => Vec::new(),
        };
        let monthly = round_cents(line_items.iter().map(|i| i.monthly_usd).sum());
        if monthly > self.settings.monthly_budget_usd {
            findings.push(Finding::new(
                "over-budget",
                Severity::Low,
                format!(
                    "estimated ${:.2}/month exceeds budget ${:.2}",
                    monthly, self.settings.monthly_budget_usd
                ),
            ));
        }
        (
            CostEstimate {
                monthly_usd: monthly,
                line_items,
            },
            findings,
        )
    }

    fn priced(
        &self,
        res: &HclBlock,
        size: Option<&str>,
        quantity: f64,
        findings: &mut Vec<Finding>,
    ) -> Option<CostLineItem> {
        let size = size?;
        match hourly_price(size) {
            Some(p) => Some(self.hourly_item(format!("{} ({})", res.address(), size), "instance-hour", quantity, p)),
            None => {
                findings.push(
                    Finding::new(
                        "unpriced",
                        Severity::Info,
                        format!("no price for {} size '{}'", res.address(), size),
                    )
                    .at_line(res.line),
                );
                None
            }
        }
    }

    fn terraform_items(&self, source: &str, findings: &mut Vec<Finding>) -> Vec<CostLineItem> {
        let Ok(blocks) = hcl::parse(source) else {
            return Vec::new();
        };
        let literal = |b: &HclBlock, key: &str| b.attr(key).and_then(|a| a.literal()).map(str::to_string);
        let template_size = |resource_type: &str, key: &str| {
            hcl::resources_of(&blocks, resource_type)
                .next()
                .and_then(|t| literal(t, key))
        };

        let mut items = Vec::new();
        for res in hcl::resources(&blocks) {
            let count = |key: &str| res.attr(key).and_then(|a| a.as_i64()).unwrap_or(1).max(0) as f64;
            let item = match res.resource_type() {
                Some("aws_instance") => {
                    self.priced(res, literal(res, "instance_type").as_deref(), 1.0, findings)
                }
                Some("aws_autoscaling_group") => self.priced(
                    res,
                    template_size("aws_launch_template", "instance_type").as_deref(),
                    count("desired_capacity"),
                    findings,
                ),
                Some("aws_db_instance") => {
                    let multi_az = res.attr("multi_az").is_some_and(|a| a.is_true());
                    let n = if multi_az { 2.0 } else { 1.0 };
                    self.priced(res, literal(res, "instance_class").as_deref(), n, findings)
                }
                Some("aws_lb") => Some(self.hourly_item(res.address(), "lb-hour", 1.0, ALB_HOURLY)),
                Some("aws_s3_bucket") => Some(self.monthly_item(
                    res.address(),
                    "GB-month (assumed)",
                    S3_ASSUMED_GB,
                    S3_GB_MONTH,
                )),
                Some("azurerm_linux_virtual_machine_scale_set") => self.priced(
                    res,
                    literal(res, "sku").as_deref(),
                    count("instances"),
                    findings,
                ),
                Some("azurerm_postgresql_flexible_server") => {
                    self.priced(res, literal(res, "sku_name").as_deref(), 1.0, findings)
                }
                Some("google_compute_region_instance_group_manager") => self.priced(
                    res,
                    template_size("google_compute_instance_template", "machine_type").as_deref(),
                    count("target_size"),
                    findings,
                ),
                Some("google_sql_database_instance") => {
                    let tier = res.children("settings").find_map(|s| literal(s, "tier"));
                    self.priced(res, tier.as_deref(), 1.0, findings)
                }
                _ => None,
            };
            items.extend(item);
        }
        items
    }

    fn kubernetes_items(&self, source: &str) -> Vec<CostLineItem> {
        let mut items = Vec::new();
        for de in serde_yaml_ng::Deserializer::from_str(source) {
            let Ok(doc) = Value::deserialize(de) else {
                break;
            };
            let kind = doc["kind"].as_str().unwrap_or_default();
            let name = format!("{}/{}", kind, doc["metadata"]["name"].as_str().unwrap_or("?"));
            match kind {
                "Deployment" | "StatefulSet" => {
                    let replicas = doc["spec"]["replicas"].as_i64().unwrap_or(1).max(0) as f64;
                    let (mut cpu, mut gib) = (0.0, 0.0);
                    for c in doc["spec"]["template"]["spec"]["containers"]
                        .as_sequence()
                        .into_iter()
                        .flatten()
                    {
                        let res = &c["resources"];
                        let pick = |key: &str| {
                            res["limits"][key]
                                .as_str()
                                .or_else(|| res["requests"][key].as_str())
                                .map(str::to_string)
                        };
                        cpu += pick("cpu").as_deref().and_then(parse_cpu).unwrap_or(0.1);
                        gib += pick("memory").as_deref().and_then(parse_memory_gib).unwrap_or(0.125);
                    }
                    let hourly = cpu * K8S_CPU_HOURLY + gib * K8S_GIB_HOURLY;
                    items.push(self.hourly_item(name, "replica-hour", replicas, hourly));
                }
                "PersistentVolumeClaim" => {
                    let gib = doc["spec"]["resources"]["requests"]["storage"]
                        .as_str()
                        .and_then(parse_memory_gib)
                        .unwrap_or(0.0);
                    items.push(self.monthly_item(name, "GB-month", gib, PV_GB_MONTH));
                }
                _ => {}
            }
        }
        items
    }
}

/// Kubernetes CPU quantity in cores: `250m`, `0.5`, `2`.
pub fn parse_cpu(q: &str) -> Option<f64> {
    let q = q.trim();
    match q.strip_suffix('m') {
        Some(milli) => milli.parse::<f64>().ok().map(|m| m / 1000.0),
        None => q.parse().ok(),
    }
}

/// Kubernetes memory quantity in GiB: `128Mi`, `1Gi`, `512M`, `1G`.
pub fn parse_memory_gib(q: &str) -> Option<f64> {
    let q = q.trim();
    const UNITS: &[(&str, f64)] = &[
        ("Ki", 1.0 / (1024.0 * 1024.0)),
        ("Mi", 1.0 / 1024.0),
        ("Gi", 1.0),
        ("Ti", 1024.0),
        ("K", 1e3 / 1073741824.0),
        ("M", 1e6 / 1073741824.0),
        ("G", 1e9 / 1073741824.0),
    ];
    for (suffix, factor) in UNITS {
        if let Some(n) = q.strip_suffix(suffix) {
            return n.parse::<f64>().ok().map(|v| v * factor);
        }
    }
    q.parse::<f64>().ok().map(|bytes| bytes / 1073741824.0)
}

impl Validator for CostValidator {
    fn kind(&self) -> ValidatorKind {
        ValidatorKind::Cost
    }

    fn required(&self) -> bool {
        false
    }

    fn validate(&self, artifact: &GeneratedArtifact, _request: &InfrastructureRequest) -> SubVerdict {
        let (estimate, findings) = self.estimate(artifact.format(), artifact.content());
        tracing::debug!(monthly_usd = estimate.monthly_usd, items = estimate.line_items.len(), "cost estimate");
        let mut sub = SubVerdict::from_findings(ValidatorKind::Cost, false, findings);
        sub.cost = Some(estimate);
        sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(budget: f64) -> CostValidator {
        CostValidator::new(ValidationSettings {
            monthly_budget_usd: budget,
            ..ValidationSettings::default()
        })
    }

    const ASG: &str = "resource \"aws_launch_template\" \"app\" {\n  instance_type = \"t3.micro\"\n}\n\nresource \"aws_autoscaling_group\" \"app\" {\n  desired_capacity = 3\n}\n\nresource \"aws_lb\" \"app\" {\n  internal = false\n}\n";

    #[test]
    fn test_cost_asg_and_lb() {
        let (est, findings) = validator(1000.0).estimate(TargetFormat::Terraform, ASG);
        assert!(findings.is_empty());
        assert_eq!(est.line_items.len(), 2);
        // 3 * 0.0104 * 730 and 0.0225 * 730
        assert!((est.line_items[0].monthly_usd - 22.78).abs() < 0.011);
        assert!((est.line_items[1].monthly_usd - 16.42).abs() < 0.011);
        assert!((est.monthly_usd - 39.2).abs() < 0.02);
    }

    #[test]
    fn test_cost_over_budget_is_low() {
        let (_, findings) = validator(10.0).estimate(TargetFormat::Terraform, ASG);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Low);
        assert_eq!(findings[0].rule, "over-budget");
    }

    #[test]
    fn test_cost_unknown_size_is_info() {
        let src = "resource \"aws_instance\" \"a\" {\n  instance_type = \"x9.huge\"\n}\n";
        let (est, findings) = validator(1000.0).estimate(TargetFormat::Terraform, src);
        assert!(est.line_items.is_empty());
        assert_eq!(findings[0].severity, Severity::Info);
    }

    #[test]
    fn test_cost_kubernetes_replicas() {
        let src = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 5\n  template:\n    spec:\n      containers:\n        - name: web\n          resources:\n            requests:\n              cpu: 1000m\n              memory: 1Gi\n";
        let (est, _) = validator(1000.0).estimate(TargetFormat::Kubernetes, src);
        assert_eq!(est.line_items.len(), 1);
        let item = &est.line_items[0];
        assert_eq!(item.quantity, 5.0);
        assert!((item.hourly_usd - 0.0351).abs() < 1e-9);
    }

    #[test]
    fn test_cost_quantities() {
        assert_eq!(parse_cpu("250m"), Some(0.25));
        assert_eq!(parse_cpu("2"), Some(2.0));
        assert_eq!(parse_memory_gib("512Mi"), Some(0.5));
        assert_eq!(parse_memory_gib("2Gi"), Some(2.0));
        assert_eq!(parse_memory_gib("lots"), None);
    }

    #[test]
    fn test_cost_never_blocks() {
        let v = validator(0.0);
        assert!(!v.required());
    }
}
