//! Terraform (HCL) generator for AWS, Azure, and GCP.
//!
//! Every artifact carries the provider setup, the shared variables, and a
//! `common_tags` local holding the required tag set.

use super::Generator;
use crate::core::config::GenerationSettings;
use crate::core::error::GenerationError;
use crate::core::types::{
    AttrValue, InfrastructureRequest, Provider, ResourceKind, RetrievedContext, TargetFormat,
};

const KINDS: &[ResourceKind] = &[
    ResourceKind::Compute,
    ResourceKind::Network,
    ResourceKind::Storage,
    ResourceKind::Database,
];

pub struct TerraformGenerator {
    settings: GenerationSettings,
}

impl TerraformGenerator {
    pub fn new(settings: GenerationSettings) -> Self {
        Self { settings }
    }
}

impl Generator for TerraformGenerator {
    fn name(&self) -> &'static str {
        "terraform"
    }

    fn format(&self) -> TargetFormat {
        TargetFormat::Terraform
    }

    fn kinds(&self) -> &'static [ResourceKind] {
        KINDS
    }

    fn render(
        &self,
        request: &InfrastructureRequest,
        _context: &RetrievedContext,
    ) -> Result<String, GenerationError> {
        let provider = request.provider();
        if !provider.is_cloud() {
            return Err(GenerationError::new(format!(
                "terraform generator has no provider mapping for {}",
                provider
            )));
        }

        let mut blocks = vec![
            terraform_block(provider),
            provider_block(provider),
            common_variables(request),
            locals_block(provider, &self.settings),
        ];
        let body = match (provider, request.kind()) {
            (Provider::Aws, ResourceKind::Compute) => aws_compute(request),
            (Provider::Aws, ResourceKind::Network) => aws_network(request),
            (Provider::Aws, ResourceKind::Storage) => aws_storage(request),
            (Provider::Aws, ResourceKind::Database) => aws_database(request),
            (Provider::Azure, ResourceKind::Compute) => azure_compute(request),
            (Provider::Azure, ResourceKind::Network) => azure_network(request),
            (Provider::Azure, ResourceKind::Storage) => azure_storage(request),
            (Provider::Azure, ResourceKind::Database) => azure_database(request),
            (Provider::Gcp, ResourceKind::Compute) => gcp_compute(request),
            (Provider::Gcp, ResourceKind::Network) => gcp_network(request),
            (Provider::Gcp, ResourceKind::Storage) => gcp_storage(request),
            (Provider::Gcp, ResourceKind::Database) => gcp_database(request),
            (p, k) => {
                return Err(GenerationError::new(format!(
                    "terraform generator cannot render {} on {}",
                    k, p
                )))
            }
        };
        blocks.extend(body?);
        Ok(blocks.join("\n\n") + "\n")
    }
}

// ============================================================================
// Shared blocks
// ============================================================================

fn terraform_block(provider: Provider) -> String {
    let (name, source, version) = match provider {
        Provider::Azure => ("azurerm", "hashicorp/azurerm", "~> 3.0"),
        Provider::Gcp => ("google", "hashicorp/google", "~> 5.0"),
        _ => ("aws", "hashicorp/aws", "~> 5.0"),
    };
    [
        "terraform {".to_string(),
        "  required_version = \">= 1.5\"".to_string(),
        String::new(),
        "  required_providers {".to_string(),
        format!("    {} = {{", name),
        format!("      source  = \"{}\"", source),
        format!("      version = \"{}\"", version),
        "    }".to_string(),
        "  }".to_string(),
        "}".to_string(),
    ]
    .join("\n")
}

fn provider_block(provider: Provider) -> String {
    match provider {
        Provider::Azure => "provider \"azurerm\" {\n  features {}\n}".to_string(),
        Provider::Gcp => [
            "provider \"google\" {",
            "  project = var.project_id",
            "  region  = var.region",
            "}",
        ]
        .join("\n"),
        _ => [
            "provider \"aws\" {",
            "  region = var.region",
            "",
            "  default_tags {",
            "    tags = local.common_tags",
            "  }",
            "}",
        ]
        .join("\n"),
    }
}

fn variable(name: &str, description: &str, default: Option<&str>) -> String {
    let mut lines = vec![
        format!("variable \"{}\" {{", name),
        format!("  description = \"{}\"", description),
        "  type        = string".to_string(),
    ];
    if let Some(d) = default {
        lines.push(format!("  default     = \"{}\"", d));
    }
    lines.push("}".to_string());
    lines.join("\n")
}

fn common_variables(request: &InfrastructureRequest) -> String {
    let mut vars = vec![
        variable("name_prefix", "Prefix for resource names", Some(&request.name())),
        variable(
            "environment",
            "Deployment environment",
            Some(&request.text_attr("environment", "production")),
        ),
        variable(
            "region",
            "Provider region",
            Some(&request.text_attr("region", "us-east-1")),
        ),
    ];
    if request.provider() == Provider::Gcp {
        vars.push(variable("project_id", "GCP project id", None));
    }
    vars.join("\n\n")
}

fn locals_block(provider: Provider, settings: &GenerationSettings) -> String {
    // GCP labels must be lowercase
    let (name, env, owner, project, cost) = match provider {
        Provider::Gcp => ("common_labels", "environment", "owner", "project", "costcenter"),
        _ => ("common_tags", "Environment", "Owner", "Project", "CostCenter"),
    };
    let managed = if provider == Provider::Gcp {
        "managed_by"
    } else {
        "ManagedBy"
    };
    [
        "locals {".to_string(),
        format!("  {} = {{", name),
        format!("    {} = var.environment", env),
        format!("    {} = \"{}\"", owner, settings.owner),
        format!("    {} = var.name_prefix", project),
        format!("    {} = \"{}\"", cost, settings.cost_center),
        format!("    {} = \"autodevops\"", managed),
        "  }".to_string(),
        "}".to_string(),
    ]
    .join("\n")
}

fn ingress(description: &str, port: i64, cidr: Option<&str>, source_sg: Option<&str>) -> Vec<String> {
    let mut lines = vec![
        "  ingress {".to_string(),
        format!("    description = \"{}\"", description),
        format!("    from_port   = {}", port),
        format!("    to_port     = {}", port),
        "    protocol    = \"tcp\"".to_string(),
    ];
    if let Some(c) = cidr {
        lines.push(format!("    cidr_blocks = [\"{}\"]", c));
    }
    if let Some(sg) = source_sg {
        lines.push(format!("    security_groups = [{}]", sg));
    }
    lines.push("  }".to_string());
    lines
}

fn egress_all() -> Vec<String> {
    [
        "  egress {",
        "    from_port   = 0",
        "    to_port     = 0",
        "    protocol    = \"-1\"",
        "    cidr_blocks = [\"0.0.0.0/0\"]",
        "  }",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn ports(request: &InfrastructureRequest) -> Vec<i64> {
    match request.attr("ports") {
        Some(AttrValue::List(items)) => items.iter().filter_map(AttrValue::as_i64).collect(),
        Some(AttrValue::Int(p)) => vec![*p],
        _ => Vec::new(),
    }
}

// ============================================================================
// AWS
// ============================================================================

fn aws_compute(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let instances = request.int_attr("instances", request.int_attr("replicas", 1));
    let with_lb = request.bool_attr("has_load_balancer", false);
    let port = request.int_attr("service_port", 80);
    let instance_type = request.text_attr("instance_type", "t3.micro");
    let use_asg = instances > 1 || with_lb || request.bool_attr("autoscale", false);

    let mut blocks = vec![
        variable("vpc_id", "VPC to deploy into", None),
        [
            "variable \"subnet_ids\" {",
            "  description = \"Subnets for instances and the load balancer\"",
            "  type        = list(string)",
            "}",
        ]
        .join("\n"),
        [
            "data \"aws_ami\" \"ubuntu\" {",
            "  most_recent = true",
            "  owners      = [\"099720109477\"]",
            "",
            "  filter {",
            "    name   = \"name\"",
            "    values = [\"ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*\"]",
            "  }",
            "}",
        ]
        .join("\n"),
    ];

    if with_lb {
        let mut lb_sg = vec![
            "resource \"aws_security_group\" \"lb\" {".to_string(),
            "  name_prefix = \"${var.name_prefix}-lb-\"".to_string(),
            "  vpc_id      = var.vpc_id".to_string(),
            String::new(),
        ];
        lb_sg.extend(ingress("HTTP", 80, Some("0.0.0.0/0"), None));
        lb_sg.push(String::new());
        lb_sg.extend(ingress("HTTPS", 443, Some("0.0.0.0/0"), None));
        lb_sg.push(String::new());
        lb_sg.extend(egress_all());
        lb_sg.push("}".to_string());
        blocks.push(lb_sg.join("\n"));
    }

    let mut app_sg = vec![
        "resource \"aws_security_group\" \"app\" {".to_string(),
        "  name_prefix = \"${var.name_prefix}-app-\"".to_string(),
        "  vpc_id      = var.vpc_id".to_string(),
        String::new(),
    ];
    if with_lb {
        app_sg.extend(ingress(
            "Application traffic from the load balancer",
            port,
            None,
            Some("aws_security_group.lb.id"),
        ));
    } else {
        app_sg.extend(ingress("Application traffic", port, Some("0.0.0.0/0"), None));
    }
    app_sg.push(String::new());
    app_sg.extend(egress_all());
    app_sg.push("}".to_string());
    blocks.push(app_sg.join("\n"));

    if !use_asg {
        blocks.push(
            [
                "resource \"aws_instance\" \"app\" {".to_string(),
                "  ami                    = data.aws_ami.ubuntu.id".to_string(),
                format!("  instance_type          = \"{}\"", instance_type),
                "  subnet_id              = var.subnet_ids[0]".to_string(),
                "  vpc_security_group_ids = [aws_security_group.app.id]".to_string(),
                String::new(),
                "  root_block_device {".to_string(),
                "    volume_size = 20".to_string(),
                "    volume_type = \"gp3\"".to_string(),
                "    encrypted   = true".to_string(),
                "  }".to_string(),
                String::new(),
                "  metadata_options {".to_string(),
                "    http_tokens = \"required\"".to_string(),
                "  }".to_string(),
                "}".to_string(),
            ]
            .join("\n"),
        );
        blocks.push(
            "output \"instance_id\" {\n  value = aws_instance.app.id\n}".to_string(),
        );
        return Ok(blocks);
    }

    blocks.push(
        [
            "resource \"aws_launch_template\" \"app\" {".to_string(),
            "  name_prefix   = \"${var.name_prefix}-\"".to_string(),
            "  image_id      = data.aws_ami.ubuntu.id".to_string(),
            format!("  instance_type = \"{}\"", instance_type),
            String::new(),
            "  vpc_security_group_ids = [aws_security_group.app.id]".to_string(),
            String::new(),
            "  block_device_mappings {".to_string(),
            "    device_name = \"/dev/sda1\"".to_string(),
            String::new(),
            "    ebs {".to_string(),
            "      volume_size = 20".to_string(),
            "      volume_type = \"gp3\"".to_string(),
            "      encrypted   = true".to_string(),
            "    }".to_string(),
            "  }".to_string(),
            String::new(),
            "  metadata_options {".to_string(),
            "    http_tokens = \"required\"".to_string(),
            "  }".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
    );

    let min_size = request.int_attr("min_size", instances).min(instances);
    let mut max_size = request.int_attr("max_size", instances).max(instances);
    if request.bool_attr("autoscale", false) && !request.attributes().contains_key("max_size") {
        max_size = instances * 2;
    }
    let mut asg = vec![
        "resource \"aws_autoscaling_group\" \"app\" {".to_string(),
        "  name_prefix         = \"${var.name_prefix}-\"".to_string(),
        format!("  min_size            = {}", min_size),
        format!("  max_size            = {}", max_size),
        format!("  desired_capacity    = {}", instances),
        "  vpc_zone_identifier = var.subnet_ids".to_string(),
    ];
    if with_lb {
        asg.push("  target_group_arns   = [aws_lb_target_group.app.arn]".to_string());
        asg.push("  health_check_type   = \"ELB\"".to_string());
    }
    asg.extend(
        [
            "",
            "  launch_template {",
            "    id      = aws_launch_template.app.id",
            "    version = \"$Latest\"",
            "  }",
            "}",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    blocks.push(asg.join("\n"));

    if with_lb {
        blocks.push(
            [
                "resource \"aws_lb\" \"app\" {",
                "  name                       = \"${var.name_prefix}-alb\"",
                "  internal                   = false",
                "  load_balancer_type         = \"application\"",
                "  security_groups            = [aws_security_group.lb.id]",
                "  subnets                    = var.subnet_ids",
                "  drop_invalid_header_fields = true",
                "}",
            ]
            .join("\n"),
        );
        blocks.push(
            [
                "resource \"aws_lb_target_group\" \"app\" {".to_string(),
                "  name     = \"${var.name_prefix}-tg\"".to_string(),
                format!("  port     = {}", port),
                "  protocol = \"HTTP\"".to_string(),
                "  vpc_id   = var.vpc_id".to_string(),
                String::new(),
                "  health_check {".to_string(),
                "    path    = \"/\"".to_string(),
                "    matcher = \"200-399\"".to_string(),
                "  }".to_string(),
                "}".to_string(),
            ]
            .join("\n"),
        );
        blocks.push(
            [
                "resource \"aws_lb_listener\" \"http\" {",
                "  load_balancer_arn = aws_lb.app.arn",
                "  port              = 80",
                "  protocol          = \"HTTP\"",
                "",
                "  default_action {",
                "    type             = \"forward\"",
                "    target_group_arn = aws_lb_target_group.app.arn",
                "  }",
                "}",
            ]
            .join("\n"),
        );
        blocks.push(
            "output \"load_balancer_dns\" {\n  value = aws_lb.app.dns_name\n}".to_string(),
        );
    }
    Ok(blocks)
}

fn aws_network(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let cidr = request.text_attr("cidr", "10.0.0.0/16");
    let mut blocks = vec![
        "data \"aws_availability_zones\" \"available\" {\n  state = \"available\"\n}".to_string(),
        variable("flow_log_role_arn", "IAM role used by VPC flow logs", None),
        [
            "resource \"aws_vpc\" \"main\" {".to_string(),
            format!("  cidr_block           = \"{}\"", cidr),
            "  enable_dns_support   = true".to_string(),
            "  enable_dns_hostnames = true".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
        [
            "resource \"aws_subnet\" \"private\" {",
            "  count             = 2",
            "  vpc_id            = aws_vpc.main.id",
            "  cidr_block        = cidrsubnet(aws_vpc.main.cidr_block, 8, count.index)",
            "  availability_zone = data.aws_availability_zones.available.names[count.index]",
            "}",
        ]
        .join("\n"),
        [
            "resource \"aws_cloudwatch_log_group\" \"flow\" {",
            "  name              = \"/vpc/${var.name_prefix}/flow-logs\"",
            "  retention_in_days = 30",
            "}",
        ]
        .join("\n"),
        [
            "resource \"aws_flow_log\" \"main\" {",
            "  vpc_id          = aws_vpc.main.id",
            "  traffic_type    = \"ALL\"",
            "  log_destination = aws_cloudwatch_log_group.flow.arn",
            "  iam_role_arn    = var.flow_log_role_arn",
            "}",
        ]
        .join("\n"),
    ];

    let mut open: Vec<i64> = ports(request);
    if let Some(p) = request.attr("service_port").and_then(AttrValue::as_i64) {
        open.push(p);
    }
    if request.bool_attr("has_load_balancer", false) {
        open.extend([80, 443]);
    }
    open.sort_unstable();
    open.dedup();
    if !open.is_empty() {
        let mut sg = vec![
            "resource \"aws_security_group\" \"edge\" {".to_string(),
            "  name_prefix = \"${var.name_prefix}-edge-\"".to_string(),
            "  vpc_id      = aws_vpc.main.id".to_string(),
        ];
        for p in open {
            sg.push(String::new());
            sg.extend(ingress(&format!("Port {}", p), p, Some("0.0.0.0/0"), None));
        }
        sg.push(String::new());
        sg.extend(egress_all());
        sg.push("}".to_string());
        blocks.push(sg.join("\n"));
    }
    blocks.push("output \"vpc_id\" {\n  value = aws_vpc.main.id\n}".to_string());
    Ok(blocks)
}

fn aws_storage(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let bucket = request.text_attr("bucket", "${var.name_prefix}-${var.environment}");
    let versioning = if request.bool_attr("versioning", true) {
        "Enabled"
    } else {
        "Suspended"
    };
    let mut blocks = vec![
        format!(
            "resource \"aws_s3_bucket\" \"main\" {{\n  bucket = \"{}\"\n}}",
            bucket
        ),
        [
            "resource \"aws_s3_bucket_versioning\" \"main\" {".to_string(),
            "  bucket = aws_s3_bucket.main.id".to_string(),
            String::new(),
            "  versioning_configuration {".to_string(),
            format!("    status = \"{}\"", versioning),
            "  }".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
    ];
    if request.bool_attr("encrypted", true) {
        blocks.push(
            [
                "resource \"aws_s3_bucket_server_side_encryption_configuration\" \"main\" {",
                "  bucket = aws_s3_bucket.main.id",
                "",
                "  rule {",
                "    apply_server_side_encryption_by_default {",
                "      sse_algorithm = \"AES256\"",
                "    }",
                "  }",
                "}",
            ]
            .join("\n"),
        );
    }
    blocks.push(
        [
            "resource \"aws_s3_bucket_public_access_block\" \"main\" {",
            "  bucket = aws_s3_bucket.main.id",
            "",
            "  block_public_acls       = true",
            "  block_public_policy     = true",
            "  ignore_public_acls      = true",
            "  restrict_public_buckets = true",
            "}",
        ]
        .join("\n"),
    );
    blocks.push("output \"bucket_arn\" {\n  value = aws_s3_bucket.main.arn\n}".to_string());
    Ok(blocks)
}

fn db_engine(request: &InfrastructureRequest) -> Result<(&'static str, &'static str), GenerationError> {
    match request.text_attr("engine", "postgres").to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" => Ok(("postgres", "15")),
        "mysql" | "mariadb" => Ok(("mysql", "8.0")),
        other => Err(GenerationError::new(format!("unsupported database engine '{}'", other))),
    }
}

fn aws_database(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let (engine, version) = db_engine(request)?;
    let size = request.int_attr("size", 20);
    let class = request.text_attr("instance_class", "db.t3.micro");
    Ok(vec![
        [
            "variable \"db_password\" {",
            "  description = \"Master password, supplied at apply time\"",
            "  type        = string",
            "  sensitive   = true",
            "}",
        ]
        .join("\n"),
        [
            "resource \"aws_db_instance\" \"main\" {".to_string(),
            "  identifier                = \"${var.name_prefix}-${var.environment}\"".to_string(),
            format!("  engine                    = \"{}\"", engine),
            format!("  engine_version            = \"{}\"", version),
            format!("  instance_class            = \"{}\"", class),
            format!("  allocated_storage         = {}", size),
            format!(
                "  storage_encrypted         = {}",
                request.bool_attr("encrypted", true)
            ),
            format!(
                "  backup_retention_period   = {}",
                request.int_attr("backup_days", 7)
            ),
            format!("  multi_az                  = {}", request.bool_attr("multi_az", false)),
            "  publicly_accessible       = false".to_string(),
            "  skip_final_snapshot       = false".to_string(),
            "  final_snapshot_identifier = \"${var.name_prefix}-final\"".to_string(),
            "  username                  = \"dbadmin\"".to_string(),
            "  password                  = var.db_password".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
        "output \"db_endpoint\" {\n  value = aws_db_instance.main.endpoint\n}".to_string(),
    ])
}

// ============================================================================
// Azure
// ============================================================================

fn azure_resource_group() -> String {
    [
        "resource \"azurerm_resource_group\" \"main\" {",
        "  name     = \"${var.name_prefix}-${var.environment}-rg\"",
        "  location = var.region",
        "  tags     = local.common_tags",
        "}",
    ]
    .join("\n")
}

fn azure_compute(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let instances = request.int_attr("instances", request.int_attr("replicas", 1));
    let sku = request.text_attr("instance_type", "Standard_B1s");
    Ok(vec![
        variable("subnet_id", "Subnet for the scale set", None),
        variable("ssh_public_key", "Admin SSH public key", None),
        azure_resource_group(),
        [
            "resource \"azurerm_linux_virtual_machine_scale_set\" \"app\" {".to_string(),
            "  name                = \"${var.name_prefix}-vmss\"".to_string(),
            "  resource_group_name = azurerm_resource_group.main.name".to_string(),
            "  location            = azurerm_resource_group.main.location".to_string(),
            format!("  sku                 = \"{}\"", sku),
            format!("  instances           = {}", instances),
            "  admin_username      = \"azureuser\"".to_string(),
            "  tags                = local.common_tags".to_string(),
            String::new(),
            "  admin_ssh_key {".to_string(),
            "    username   = \"azureuser\"".to_string(),
            "    public_key = var.ssh_public_key".to_string(),
            "  }".to_string(),
            String::new(),
            "  source_image_reference {".to_string(),
            "    publisher = \"Canonical\"".to_string(),
            "    offer     = \"0001-com-ubuntu-server-jammy\"".to_string(),
            "    sku       = \"22_04-lts\"".to_string(),
            "    version   = \"latest\"".to_string(),
            "  }".to_string(),
            String::new(),
            "  os_disk {".to_string(),
            "    storage_account_type = \"Standard_LRS\"".to_string(),
            "    caching              = \"ReadWrite\"".to_string(),
            "  }".to_string(),
            String::new(),
            "  network_interface {".to_string(),
            "    name    = \"nic\"".to_string(),
            "    primary = true".to_string(),
            String::new(),
            "    ip_configuration {".to_string(),
            "      name      = \"internal\"".to_string(),
            "      primary   = true".to_string(),
            "      subnet_id = var.subnet_id".to_string(),
            "    }".to_string(),
            "  }".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
    ])
}

fn azure_network(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let cidr = request.text_attr("cidr", "10.0.0.0/16");
    Ok(vec![
        azure_resource_group(),
        [
            "resource \"azurerm_virtual_network\" \"main\" {".to_string(),
            "  name                = \"${var.name_prefix}-vnet\"".to_string(),
            format!("  address_space       = [\"{}\"]", cidr),
            "  location            = azurerm_resource_group.main.location".to_string(),
            "  resource_group_name = azurerm_resource_group.main.name".to_string(),
            "  tags                = local.common_tags".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
        [
            "resource \"azurerm_subnet\" \"private\" {",
            "  name                 = \"private\"",
            "  resource_group_name  = azurerm_resource_group.main.name",
            "  virtual_network_name = azurerm_virtual_network.main.name",
            "  address_prefixes     = [cidrsubnet(azurerm_virtual_network.main.address_space[0], 8, 1)]",
            "}",
        ]
        .join("\n"),
    ])
}

fn azure_storage(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let account: String = request
        .text_attr("bucket", &format!("{}data", request.name()))
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(24)
        .collect();
    Ok(vec![
        azure_resource_group(),
        [
            "resource \"azurerm_storage_account\" \"main\" {".to_string(),
            format!("  name                              = \"{}\"", account),
            "  resource_group_name               = azurerm_resource_group.main.name".to_string(),
            "  location                          = azurerm_resource_group.main.location".to_string(),
            "  account_tier                      = \"Standard\"".to_string(),
            "  account_replication_type          = \"GRS\"".to_string(),
            "  min_tls_version                   = \"TLS1_2\"".to_string(),
            "  allow_nested_items_to_be_public   = false".to_string(),
            format!(
                "  infrastructure_encryption_enabled = {}",
                request.bool_attr("encrypted", true)
            ),
            "  tags                              = local.common_tags".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
    ])
}

fn azure_database(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let (engine, _) = db_engine(request)?;
    if engine != "postgres" {
        return Err(GenerationError::new(
            "azure database generation supports postgres only",
        ));
    }
    let size_mb = request.int_attr("size", 32) * 1024;
    Ok(vec![
        "variable \"db_password\" {\n  type      = string\n  sensitive = true\n}".to_string(),
        azure_resource_group(),
        [
            "resource \"azurerm_postgresql_flexible_server\" \"main\" {".to_string(),
            "  name                   = \"${var.name_prefix}-${var.environment}-pg\"".to_string(),
            "  resource_group_name    = azurerm_resource_group.main.name".to_string(),
            "  location               = azurerm_resource_group.main.location".to_string(),
            "  version                = \"15\"".to_string(),
            "  sku_name               = \"B_Standard_B1ms\"".to_string(),
            format!("  storage_mb             = {}", size_mb),
            format!(
                "  backup_retention_days  = {}",
                request.int_attr("backup_days", 7)
            ),
            "  administrator_login    = \"dbadmin\"".to_string(),
            "  administrator_password = var.db_password".to_string(),
            "  tags                   = local.common_tags".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
    ])
}

// ============================================================================
// GCP
// ============================================================================

fn gcp_compute(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let instances = request.int_attr("instances", request.int_attr("replicas", 1));
    let machine = request.text_attr("instance_type", "e2-small");
    Ok(vec![
        [
            "resource \"google_compute_instance_template\" \"app\" {".to_string(),
            "  name_prefix  = \"${var.name_prefix}-\"".to_string(),
            format!("  machine_type = \"{}\"", machine),
            "  labels       = local.common_labels".to_string(),
            String::new(),
            "  disk {".to_string(),
            "    source_image = \"debian-cloud/debian-12\"".to_string(),
            "    auto_delete  = true".to_string(),
            "    boot         = true".to_string(),
            "  }".to_string(),
            String::new(),
            "  network_interface {".to_string(),
            "    network = \"default\"".to_string(),
            "  }".to_string(),
            String::new(),
            "  shielded_instance_config {".to_string(),
            "    enable_secure_boot = true".to_string(),
            "  }".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
        [
            "resource \"google_compute_region_instance_group_manager\" \"app\" {".to_string(),
            "  name               = \"${var.name_prefix}-mig\"".to_string(),
            "  base_instance_name = var.name_prefix".to_string(),
            "  region             = var.region".to_string(),
            format!("  target_size        = {}", instances),
            String::new(),
            "  version {".to_string(),
            "    instance_template = google_compute_instance_template.app.id".to_string(),
            "  }".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
    ])
}

fn gcp_network(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let cidr = request.text_attr("cidr", "10.0.0.0/16");
    Ok(vec![
        [
            "resource \"google_compute_network\" \"main\" {",
            "  name                    = \"${var.name_prefix}-net\"",
            "  auto_create_subnetworks = false",
            "}",
        ]
        .join("\n"),
        [
            "resource \"google_compute_subnetwork\" \"private\" {".to_string(),
            "  name                     = \"${var.name_prefix}-private\"".to_string(),
            format!("  ip_cidr_range            = \"{}\"", cidr),
            "  region                   = var.region".to_string(),
            "  network                  = google_compute_network.main.id".to_string(),
            "  private_ip_google_access = true".to_string(),
            "}".to_string(),
        ]
        .join("\n"),
    ])
}

fn gcp_storage(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let bucket = request.text_attr("bucket", "${var.project_id}-${var.name_prefix}");
    Ok(vec![[
        "resource \"google_storage_bucket\" \"main\" {".to_string(),
        format!("  name                        = \"{}\"", bucket),
        "  location                    = upper(var.region)".to_string(),
        "  uniform_bucket_level_access = true".to_string(),
        "  public_access_prevention    = \"enforced\"".to_string(),
        "  labels                      = local.common_labels".to_string(),
        String::new(),
        "  versioning {".to_string(),
        format!("    enabled = {}", request.bool_attr("versioning", true)),
        "  }".to_string(),
        "}".to_string(),
    ]
    .join("\n")])
}

fn gcp_database(request: &InfrastructureRequest) -> Result<Vec<String>, GenerationError> {
    let (engine, _) = db_engine(request)?;
    let version = if engine == "postgres" {
        "POSTGRES_15"
    } else {
        "MYSQL_8_0"
    };
    Ok(vec![[
        "resource \"google_sql_database_instance\" \"main\" {".to_string(),
        "  name                = \"${var.name_prefix}-${var.environment}\"".to_string(),
        format!("  database_version    = \"{}\"", version),
        "  region              = var.region".to_string(),
        "  deletion_protection = true".to_string(),
        String::new(),
        "  settings {".to_string(),
        format!(
            "    tier        = \"{}\"",
            request.text_attr("instance_class", "db-f1-micro")
        ),
        "    user_labels = local.common_labels".to_string(),
        String::new(),
        "    backup_configuration {".to_string(),
        "      enabled = true".to_string(),
        "    }".to_string(),
        String::new(),
        "    ip_configuration {".to_string(),
        "      ipv4_enabled = false".to_string(),
        "    }".to_string(),
        "  }".to_string(),
        "}".to_string(),
    ]
    .join("\n")])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::test_support::request;
    use serde_json::json;

    fn render(fields: serde_json::Value) -> String {
        TerraformGenerator::new(GenerationSettings::default())
            .render(&request(fields), &RetrievedContext::empty())
            .unwrap()
    }

    #[test]
    fn test_terraform_web_app_with_lb() {
        let hcl = render(json!({"kind": "compute", "provider": "aws", "instances": 3, "hasLoadBalancer": true}));
        assert!(hcl.contains("resource \"aws_autoscaling_group\" \"app\""));
        assert!(hcl.contains("desired_capacity    = 3"));
        assert!(hcl.contains("resource \"aws_lb\" \"app\""));
        assert!(hcl.contains("resource \"aws_lb_listener\" \"http\""));
        assert!(hcl.contains("security_groups = [aws_security_group.lb.id]"));
        assert!(hcl.contains("encrypted   = true"));
        for tag in ["Environment", "Owner", "Project", "CostCenter"] {
            assert!(hcl.contains(&format!("    {} = ", tag)), "missing {}", tag);
        }
        assert!(!hcl.contains("aws_instance"));
    }

    #[test]
    fn test_terraform_single_instance() {
        let hcl = render(json!({"kind": "compute", "provider": "aws", "instance_type": "t3.small"}));
        assert!(hcl.contains("resource \"aws_instance\" \"app\""));
        assert!(hcl.contains("instance_type          = \"t3.small\""));
        assert!(!hcl.contains("aws_autoscaling_group"));
    }

    #[test]
    fn test_terraform_autoscale_bounds() {
        let hcl = render(json!({"kind": "compute", "provider": "aws", "instances": 2, "autoscale": true}));
        assert!(hcl.contains("min_size            = 2"));
        assert!(hcl.contains("max_size            = 4"));
    }

    #[test]
    fn test_terraform_storage_encryption_toggle() {
        let hcl = render(json!({"kind": "storage", "provider": "aws", "bucket": "logs"}));
        assert!(hcl.contains("aws_s3_bucket_server_side_encryption_configuration"));
        assert!(hcl.contains("bucket = \"logs\""));
        assert!(hcl.contains("block_public_acls       = true"));

        let hcl = render(json!({"kind": "storage", "provider": "aws", "encrypted": false}));
        assert!(!hcl.contains("server_side_encryption"));
    }

    #[test]
    fn test_terraform_database() {
        let hcl = render(json!({"kind": "database", "provider": "aws", "engine": "mysql", "name": "orders"}));
        assert!(hcl.contains("engine                    = \"mysql\""));
        assert!(hcl.contains("storage_encrypted         = true"));
        assert!(hcl.contains("backup_retention_period   = 7"));
        assert!(hcl.contains("password                  = var.db_password"));
        assert!(hcl.contains("default     = \"orders\""));
    }

    #[test]
    fn test_terraform_unknown_engine() {
        let err = TerraformGenerator::new(GenerationSettings::default())
            .render(
                &request(json!({"kind": "database", "provider": "aws", "engine": "oracle"})),
                &RetrievedContext::empty(),
            )
            .unwrap_err();
        assert!(err.message.contains("oracle"));
    }

    #[test]
    fn test_terraform_network_ports() {
        let hcl = render(json!({"kind": "network", "provider": "aws", "ports": [22, 443]}));
        assert!(hcl.contains("resource \"aws_vpc\" \"main\""));
        assert!(hcl.contains("from_port   = 22"));
        assert!(hcl.contains("resource \"aws_flow_log\" \"main\""));
    }

    #[test]
    fn test_terraform_azure_and_gcp() {
        let hcl = render(json!({"kind": "compute", "provider": "azure", "instances": 2}));
        assert!(hcl.contains("provider \"azurerm\""));
        assert!(hcl.contains("instances           = 2"));
        assert!(hcl.contains("tags                = local.common_tags"));

        let hcl = render(json!({"kind": "storage", "provider": "gcp", "bucket": "b1"}));
        assert!(hcl.contains("resource \"google_storage_bucket\" \"main\""));
        assert!(hcl.contains("costcenter = \"engineering\""));
        assert!(hcl.contains("variable \"project_id\""));
    }

    #[test]
    fn test_terraform_rejects_non_cloud_provider() {
        let err = TerraformGenerator::new(GenerationSettings::default())
            .render(
                &request(json!({"kind": "compute", "provider": "on-prem", "format": "terraform", "instances": 1})),
                &RetrievedContext::empty(),
            )
            .unwrap_err();
        assert!(err.message.contains("on-prem"));
    }
}
