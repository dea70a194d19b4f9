//! Intent resolution: raw key/value intent → canonical `InfrastructureRequest`.
//!
//! Keys are normalized to snake_case and alias groups are folded together.
//! Two spellings of the same field with different values is an ambiguity,
//! never a silent pick. Conversation context only fills fields the raw
//! intent leaves absent. Resolution is a pure function of its inputs.

use super::error::ResolutionError;
use super::types::*;
use std::collections::BTreeMap;

const KIND_KEYS: &[&str] = &["kind", "resource_kind", "resource_type", "resource"];
const PROVIDER_KEYS: &[&str] = &["provider", "cloud", "cloud_provider"];
const FORMAT_KEYS: &[&str] = &["format", "output_format", "target_format", "iac_type", "target"];
const ACTION_KEYS: &[&str] = &["action", "intent"];

/// Attribute aliases folded onto a canonical key.
const ATTRIBUTE_ALIASES: &[(&str, &str)] = &[
    ("count", "instances"),
    ("instance_count", "instances"),
    ("num_instances", "instances"),
    ("node_count", "instances"),
    ("replica_count", "replicas"),
    ("port", "service_port"),
    ("load_balancer", "has_load_balancer"),
    ("with_load_balancer", "has_load_balancer"),
    ("encryption", "encrypted"),
    ("env", "environment"),
];

const SUPPORTED_ACTIONS: &[&str] = &["create", "update", "scale", "deploy", "provision"];

/// Attributes that make a request about a concrete resource.
pub fn identifying_attributes(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Compute => &[
            "name",
            "instances",
            "replicas",
            "instance_type",
            "image",
            "has_load_balancer",
            "service_port",
        ],
        ResourceKind::Network => &["name", "cidr", "ports", "service_port", "has_load_balancer"],
        ResourceKind::Storage => &["name", "bucket", "size", "encrypted", "versioning"],
        ResourceKind::Database => &["name", "engine", "size", "instance_class"],
        ResourceKind::Pipeline => &["name", "stages", "repository"],
    }
}

/// Normalize a field key: camelCase and kebab-case become snake_case.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev: Option<char> = None;
    for c in key.trim().chars() {
        if c.is_ascii_uppercase() {
            if prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit()) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' || c == ' ' || c == '.' || c == '_' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn canonical_key(normalized: &str) -> &str {
    ATTRIBUTE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(normalized)
}

/// Resolve a raw intent into a canonical request.
pub fn resolve(
    raw: &RawIntent,
    context: &ConversationContext,
) -> Result<InfrastructureRequest, ResolutionError> {
    let fields = normalize_fields(raw)?;

    let kind = match pick(&fields, KIND_KEYS)? {
        Some((key, value)) => parse_kind(key, value)?,
        None => {
            return Err(ResolutionError::Missing {
                field: "kind".to_string(),
            })
        }
    };

    let provider = match pick(&fields, PROVIDER_KEYS)? {
        Some((key, value)) => parse_provider(key, value)?,
        None => context.provider.ok_or_else(|| ResolutionError::Missing {
            field: "provider".to_string(),
        })?,
    };

    let format = match pick(&fields, FORMAT_KEYS)? {
        Some((key, value)) => parse_format(key, value)?,
        None => context.format.unwrap_or_else(|| default_format(provider)),
    };

    if let Some((key, value)) = pick(&fields, ACTION_KEYS)? {
        let action = text_of(key, value)?.to_ascii_lowercase();
        if !SUPPORTED_ACTIONS.contains(&action.as_str()) {
            return Err(ResolutionError::Invalid {
                field: key.to_string(),
                reason: format!(
                    "unsupported action '{}' (expected one of: {})",
                    action,
                    SUPPORTED_ACTIONS.join(", ")
                ),
            });
        }
    }

    let mut attributes = BTreeMap::new();
    for (key, value) in &fields {
        let key = key.as_str();
        if KIND_KEYS.contains(&key)
            || PROVIDER_KEYS.contains(&key)
            || FORMAT_KEYS.contains(&key)
            || ACTION_KEYS.contains(&key)
        {
            continue;
        }
        if let Some(v) = to_attr(key, value)? {
            attributes.insert(key.to_string(), v);
        }
    }

    // a name carried over from the conversation identifies the resource too
    if let Some(name) = &context.name {
        attributes
            .entry("name".to_string())
            .or_insert_with(|| AttrValue::Text(name.clone()));
    }

    let identifying = identifying_attributes(kind);
    if !identifying.iter().any(|k| attributes.contains_key(*k)) {
        return Err(ResolutionError::Missing {
            field: format!("one of {}", identifying.join("|")),
        });
    }

    check_attributes(&mut attributes)?;
    apply_defaults(&mut attributes, kind, provider, format, context);

    Ok(InfrastructureRequest::new(kind, provider, format, attributes))
}

/// Normalize keys and fold aliases; differing values under one key are ambiguous.
fn normalize_fields(
    raw: &RawIntent,
) -> Result<BTreeMap<String, serde_json::Value>, ResolutionError> {
    let mut fields: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    let mut origin: BTreeMap<String, &str> = BTreeMap::new();
    for (key, value) in &raw.fields {
        if value.is_null() {
            continue;
        }
        let normalized = normalize_key(key);
        if normalized.is_empty() {
            continue;
        }
        let canonical = canonical_key(&normalized).to_string();
        match fields.get(&canonical) {
            Some(existing) if existing != value => {
                let first = origin.get(&canonical).copied().unwrap_or_default();
                return Err(ResolutionError::Ambiguous {
                    candidates: vec![
                        format!("{}={}", first, existing),
                        format!("{}={}", key, value),
                    ],
                    field: canonical,
                });
            }
            Some(_) => {}
            None => {
                origin.insert(canonical.clone(), key.as_str());
                fields.insert(canonical, value.clone());
            }
        }
    }
    Ok(fields)
}

/// Find the single value among an alias group.
fn pick<'a>(
    fields: &'a BTreeMap<String, serde_json::Value>,
    keys: &[&'a str],
) -> Result<Option<(&'a str, &'a serde_json::Value)>, ResolutionError> {
    let present: Vec<(&str, &serde_json::Value)> = keys
        .iter()
        .filter_map(|k| fields.get_key_value(*k).map(|(k, v)| (k.as_str(), v)))
        .collect();
    match present.as_slice() {
        [] => Ok(None),
        [only] => Ok(Some(*only)),
        [first, rest @ ..] => {
            let same = rest
                .iter()
                .all(|(_, v)| normalized_text(v) == normalized_text(first.1));
            if same {
                Ok(Some(*first))
            } else {
                Err(ResolutionError::Ambiguous {
                    field: keys[0].to_string(),
                    candidates: present
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect(),
                })
            }
        }
    }
}

fn normalized_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.trim().to_ascii_lowercase(),
        other => other.to_string(),
    }
}

fn text_of<'a>(key: &str, value: &'a serde_json::Value) -> Result<&'a str, ResolutionError> {
    value.as_str().map(str::trim).ok_or_else(|| ResolutionError::Invalid {
        field: key.to_string(),
        reason: format!("expected a string, got {}", value),
    })
}

/// Accept a single value or a list; a list naming several distinct values is ambiguous.
fn single_choice<T: PartialEq + Copy + ToString>(
    key: &str,
    value: &serde_json::Value,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ResolutionError> {
    let texts: Vec<&str> = match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|i| text_of(key, i))
            .collect::<Result<_, _>>()?,
        other => vec![text_of(key, other)?],
    };
    let mut choices: Vec<T> = Vec::new();
    for text in &texts {
        let choice = parse(text).ok_or_else(|| ResolutionError::Invalid {
            field: key.to_string(),
            reason: format!("unrecognized value '{}'", text),
        })?;
        if !choices.contains(&choice) {
            choices.push(choice);
        }
    }
    match choices.as_slice() {
        [] => Err(ResolutionError::Missing {
            field: key.to_string(),
        }),
        [one] => Ok(*one),
        many => Err(ResolutionError::Ambiguous {
            field: key.to_string(),
            candidates: many.iter().map(|c| c.to_string()).collect(),
        }),
    }
}

fn parse_kind(key: &str, value: &serde_json::Value) -> Result<ResourceKind, ResolutionError> {
    single_choice(key, value, |s| {
        let s = normalize_key(s);
        match s.as_str() {
            "compute" | "vm" | "server" | "instance" | "instances" | "ec2" | "web_app"
            | "webapp" | "web_application" | "application" | "app" | "container"
            | "deployment" | "service" => Some(ResourceKind::Compute),
            "network" | "networking" | "vpc" | "subnet" | "load_balancer" | "lb" => {
                Some(ResourceKind::Network)
            }
            "storage" | "s3" | "bucket" | "blob" | "object_storage" | "volume" | "disk" => {
                Some(ResourceKind::Storage)
            }
            "database" | "db" | "rds" | "postgres" | "postgresql" | "mysql" | "sql" => {
                Some(ResourceKind::Database)
            }
            "pipeline" | "ci" | "cicd" | "ci_cd" | "ci/cd" => Some(ResourceKind::Pipeline),
            _ => None,
        }
    })
}

fn parse_provider(key: &str, value: &serde_json::Value) -> Result<Provider, ResolutionError> {
    single_choice(key, value, |s| match normalize_key(s).as_str() {
        "aws" | "amazon" | "amazon_web_services" => Some(Provider::Aws),
        "azure" | "microsoft" | "microsoft_azure" => Some(Provider::Azure),
        "gcp" | "google" | "google_cloud" | "gce" => Some(Provider::Gcp),
        "on_prem" | "onprem" | "on_premises" | "bare_metal" | "local" => Some(Provider::OnPrem),
        "k8s" | "kubernetes" => Some(Provider::K8s),
        _ => None,
    })
}

fn parse_format(key: &str, value: &serde_json::Value) -> Result<TargetFormat, ResolutionError> {
    single_choice(key, value, |s| match normalize_key(s).as_str() {
        "terraform" | "tf" | "hcl" => Some(TargetFormat::Terraform),
        "kubernetes" | "k8s" | "kubectl" | "manifest" => Some(TargetFormat::Kubernetes),
        "ansible" | "playbook" => Some(TargetFormat::Ansible),
        "docker" | "compose" | "docker_compose" => Some(TargetFormat::Docker),
        _ => None,
    })
}

/// Format used when neither the intent nor the context names one.
pub fn default_format(provider: Provider) -> TargetFormat {
    match provider {
        Provider::K8s => TargetFormat::Kubernetes,
        Provider::OnPrem => TargetFormat::Ansible,
        Provider::Aws | Provider::Azure | Provider::Gcp => TargetFormat::Terraform,
    }
}

/// Region used when neither the intent nor the context names one.
pub fn default_region(provider: Provider) -> Option<&'static str> {
    match provider {
        Provider::Aws => Some("us-east-1"),
        Provider::Azure => Some("eastus"),
        Provider::Gcp => Some("us-central1"),
        Provider::OnPrem | Provider::K8s => None,
    }
}

fn to_attr(key: &str, value: &serde_json::Value) -> Result<Option<AttrValue>, ResolutionError> {
    let invalid = |reason: String| ResolutionError::Invalid {
        field: key.to_string(),
        reason,
    };
    let attr = match value {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::Bool(b) => AttrValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AttrValue::Int(i)
            } else if n.is_u64() {
                return Err(invalid(format!("integer {} is out of range", n)));
            } else {
                match n.as_f64() {
                    Some(x) if x.is_finite() => AttrValue::Float(x),
                    _ => return Err(invalid(format!("number {} is not finite", n))),
                }
            }
        }
        serde_json::Value::String(s) => typed_text(s),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if item.is_array() || item.is_object() {
                    return Err(invalid("nested collections are not supported".to_string()));
                }
                if let Some(v) = to_attr(key, item)? {
                    out.push(v);
                }
            }
            AttrValue::List(out)
        }
        serde_json::Value::Object(_) => {
            return Err(invalid("nested objects are not supported".to_string()))
        }
    };
    Ok(Some(attr))
}

/// Strings that spell a boolean or integer become typed values.
fn typed_text(s: &str) -> AttrValue {
    let t = s.trim();
    match t.to_ascii_lowercase().as_str() {
        "true" | "yes" => return AttrValue::Bool(true),
        "false" | "no" => return AttrValue::Bool(false),
        _ => {}
    }
    match t.parse::<i64>() {
        Ok(n) => AttrValue::Int(n),
        Err(_) => AttrValue::Text(t.to_string()),
    }
}

fn check_attributes(attributes: &mut BTreeMap<String, AttrValue>) -> Result<(), ResolutionError> {
    for key in ["instances", "replicas", "min_size", "max_size"] {
        if let Some(v) = attributes.get(key) {
            match v.as_i64() {
                Some(n) if n >= 1 => {}
                _ => {
                    return Err(ResolutionError::Invalid {
                        field: key.to_string(),
                        reason: format!("expected a positive integer, got {}", v),
                    })
                }
            }
        }
    }

    if let (Some(i), Some(r)) = (attributes.get("instances"), attributes.get("replicas")) {
        if i != r {
            return Err(ResolutionError::Ambiguous {
                field: "replicas".to_string(),
                candidates: vec![format!("instances={}", i), format!("replicas={}", r)],
            });
        }
    }

    if let Some(v) = attributes.get("service_port") {
        match v.as_i64() {
            Some(p) if (1..=65535).contains(&p) => {}
            _ => {
                return Err(ResolutionError::Invalid {
                    field: "service_port".to_string(),
                    reason: format!("expected a port in 1..=65535, got {}", v),
                })
            }
        }
    }

    for key in ["has_load_balancer", "encrypted", "versioning", "autoscale"] {
        if let Some(v) = attributes.get(key) {
            if v.as_bool().is_none() {
                return Err(ResolutionError::Invalid {
                    field: key.to_string(),
                    reason: format!("expected a boolean, got {}", v),
                });
            }
        }
    }

    if let Some(AttrValue::Text(env)) = attributes.get("environment") {
        let canonical = match env.to_ascii_lowercase().as_str() {
            "prod" | "production" => "production",
            "stage" | "staging" => "staging",
            "dev" | "development" => "development",
            "test" | "testing" => "test",
            _ => "",
        };
        if !canonical.is_empty() {
            attributes.insert(
                "environment".to_string(),
                AttrValue::Text(canonical.to_string()),
            );
        }
    }
    Ok(())
}

fn apply_defaults(
    attributes: &mut BTreeMap<String, AttrValue>,
    kind: ResourceKind,
    provider: Provider,
    format: TargetFormat,
    context: &ConversationContext,
) {
    let mut fill = |key: &str, value: AttrValue| {
        attributes.entry(key.to_string()).or_insert(value);
    };

    fill(
        "environment",
        AttrValue::Text(
            context
                .environment
                .clone()
                .unwrap_or_else(|| "production".to_string()),
        ),
    );
    fill(
        "name",
        AttrValue::Text(context.name.clone().unwrap_or_else(|| "app".to_string())),
    );
    if let Some(region) = context
        .region
        .clone()
        .or_else(|| default_region(provider).map(str::to_string))
    {
        fill("region", AttrValue::Text(region));
    }

    if kind == ResourceKind::Compute
        && !attributes.contains_key("instances")
        && !attributes.contains_key("replicas")
    {
        let key = match format {
            TargetFormat::Kubernetes | TargetFormat::Docker => "replicas",
            TargetFormat::Terraform | TargetFormat::Ansible => "instances",
        };
        attributes.insert(key.to_string(), AttrValue::Int(1));
    }
}
