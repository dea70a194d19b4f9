//! Natural-language intent extraction.
//!
//! Keyword and pattern rules produce a `RawIntent` from a prompt. When the
//! rules leave the resource kind or provider undetermined, an optional
//! language model is asked to fill only those two fields.

use super::config::LlmSettings;
use super::types::RawIntent;
use crate::collab::llm::{LanguageModel, LlmError};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const ACTION_KEYWORDS: &[(&str, &[&str])] = &[
    ("create", &["create", "deploy", "setup", "set up", "provision", "build", "launch", "spin up"]),
    ("update", &["modify", "update", "change", "reconfigure"]),
    ("delete", &["delete", "remove", "destroy", "terminate", "tear down", "decommission"]),
    ("scale", &["scale", "resize"]),
];

const FORMAT_KEYWORDS: &[(&str, &[&str])] = &[
    ("terraform", &["terraform", "tf", "hcl"]),
    ("kubernetes", &["kubernetes", "k8s", "kubectl", "manifest", "pod", "pods"]),
    ("ansible", &["ansible", "playbook", "role"]),
    ("docker", &["docker", "compose", "dockerfile"]),
];

const PROVIDER_KEYWORDS: &[(&str, &[&str])] = &[
    ("aws", &["aws", "amazon", "ec2", "s3", "rds"]),
    ("azure", &["azure", "microsoft", "blob"]),
    ("gcp", &["gcp", "google cloud", "gce", "gcs"]),
    ("k8s", &["kubernetes", "k8s", "cluster"]),
    ("on-prem", &["on-prem", "on prem", "on-premises", "bare metal", "datacenter"]),
];

const KIND_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "compute",
        &["web app", "webapp", "web application", "application", "server", "servers",
          "instance", "instances", "vm", "vms", "ec2", "container", "microservice", "api"],
    ),
    ("network", &["vpc", "subnet", "network"]),
    ("storage", &["bucket", "s3", "blob", "object storage", "storage"]),
    ("database", &["database", "db", "rds", "postgres", "postgresql", "mysql"]),
    ("pipeline", &["pipeline", "ci/cd", "cicd"]),
];

static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*(instance|replica|node|server|pod|vm)s?\b").expect("valid regex")
});
static PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bport\s+(\d{1,5})\b").expect("valid regex"));
static INSTANCE_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([tm][2-7][a-z]?\.(?:nano|micro|small|medium|large|xlarge|2xlarge))\b")
        .expect("valid regex")
});
static REGION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b((?:us|eu|ap|sa|ca|me|af)-(?:east|west|north|south|central|northeast|southeast)-\d)\b")
        .expect("valid regex")
});
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:named|called)\s+["']?([a-z0-9][a-z0-9-]*)"#).expect("valid regex")
});
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\s*(gb|tb)\b").expect("valid regex"));
static MIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bmin(?:imum)?\s+(?:of\s+)?(\d+)").expect("valid regex"));
static MAX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bmax(?:imum)?\s+(?:of\s+)?(\d+)").expect("valid regex"));

/// Whole-word (or whole-phrase) containment.
fn mentions(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + keyword.len()..].chars().next();
        let boundary = |c: Option<char>| c.is_none_or(|c| !c.is_ascii_alphanumeric());
        boundary(before) && boundary(after)
    })
}

/// Labels whose keywords occur in `text`, highest score first. Ties keep all.
fn best_matches(text: &str, table: &[(&'static str, &[&str])]) -> Vec<&'static str> {
    let scores: Vec<(&str, usize)> = table
        .iter()
        .map(|(label, kws)| (*label, kws.iter().filter(|k| mentions(text, k)).count()))
        .filter(|(_, n)| *n > 0)
        .collect();
    let Some(top) = scores.iter().map(|(_, n)| *n).max() else {
        return Vec::new();
    };
    scores
        .into_iter()
        .filter(|(_, n)| *n == top)
        .map(|(l, _)| l)
        .collect()
}

fn all_matches(text: &str, table: &[(&'static str, &[&str])]) -> Vec<&'static str> {
    table
        .iter()
        .filter(|(_, kws)| kws.iter().any(|k| mentions(text, k)))
        .map(|(l, _)| *l)
        .collect()
}

fn choice_value(labels: Vec<&str>) -> Option<serde_json::Value> {
    match labels.as_slice() {
        [] => None,
        [one] => Some(serde_json::Value::from(*one)),
        many => Some(serde_json::Value::from(many.to_vec())),
    }
}

/// Rule-based extraction. Unknown or unmentioned fields are simply absent.
pub fn extract_rules(prompt: &str) -> RawIntent {
    let text = prompt.to_lowercase();
    let mut raw = RawIntent::new();
    if text.trim().is_empty() {
        return raw;
    }

    if let Some((action, _)) = ACTION_KEYWORDS
        .iter()
        .find(|(_, kws)| kws.iter().any(|k| mentions(&text, k)))
    {
        raw = raw.with("action", *action);
    }
    if let Some(v) = choice_value(best_matches(&text, FORMAT_KEYWORDS)) {
        raw = raw.with("format", v);
    }
    if let Some(v) = choice_value(best_matches(&text, PROVIDER_KEYWORDS)) {
        raw = raw.with("provider", v);
    }
    // every mentioned kind is kept: "a web app and a database" is ambiguous
    if let Some(v) = choice_value(all_matches(&text, KIND_KEYWORDS)) {
        raw = raw.with("kind", v);
    }

    if let Some(c) = COUNT_RE.captures(&text) {
        if let Ok(n) = c[1].parse::<i64>() {
            let key = match &c[2] {
                "replica" | "pod" => "replicas",
                _ => "instances",
            };
            raw = raw.with(key, n);
        }
    }
    if let Some(c) = PORT_RE.captures(&text) {
        if let Ok(p) = c[1].parse::<i64>() {
            raw = raw.with("service_port", p);
        }
    }
    if ["load balancer", "load-balanced", "load balanced", "lb", "alb", "elb"]
        .iter()
        .any(|k| mentions(&text, k))
    {
        raw = raw.with("has_load_balancer", true);
    }
    if ["unencrypted", "without encryption", "no encryption"]
        .iter()
        .any(|k| mentions(&text, k))
    {
        raw = raw.with("encrypted", false);
    } else if text.contains("encrypt") {
        raw = raw.with("encrypted", true);
    }
    if mentions(&text, "versioning") || mentions(&text, "versioned") {
        raw = raw.with("versioning", true);
    }
    if text.contains("auto") && text.contains("scal") {
        raw = raw.with("autoscale", true);
    }
    if let Some(c) = INSTANCE_TYPE_RE.captures(&text) {
        raw = raw.with("instance_type", &c[1]);
    }
    if let Some(c) = REGION_RE.captures(&text) {
        raw = raw.with("region", &c[1]);
    }
    if let Some(c) = NAME_RE.captures(&text) {
        raw = raw.with("name", &c[1]);
    }
    if let Some(c) = SIZE_RE.captures(&text) {
        if let Ok(n) = c[1].parse::<i64>() {
            let gb = if &c[2] == "tb" { n * 1024 } else { n };
            raw = raw.with("size", gb);
        }
    }
    if let Some(c) = MIN_RE.captures(&text) {
        if let Ok(n) = c[1].parse::<i64>() {
            raw = raw.with("min_size", n);
        }
    }
    if let Some(c) = MAX_RE.captures(&text) {
        if let Ok(n) = c[1].parse::<i64>() {
            raw = raw.with("max_size", n);
        }
    }
    for (engine, kws) in [("postgres", ["postgres", "postgresql"]), ("mysql", ["mysql", "mariadb"])] {
        if kws.iter().any(|k| mentions(&text, k)) {
            raw = raw.with("engine", engine);
            break;
        }
    }
    for (env, kws) in [
        ("production", ["production", "prod"]),
        ("staging", ["staging", "stage"]),
        ("development", ["development", "dev"]),
    ] {
        if kws.iter().any(|k| mentions(&text, k)) {
            raw = raw.with("environment", env);
            break;
        }
    }
    raw
}

fn has_any(raw: &RawIntent, keys: &[&str]) -> bool {
    raw.fields
        .keys()
        .any(|k| keys.contains(&super::resolver::normalize_key(k).as_str()))
}

/// Combines rule extraction with an optional language-model fallback.
pub struct IntentExtractor {
    model: Option<Arc<dyn LanguageModel>>,
    settings: LlmSettings,
}

impl IntentExtractor {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            model: None,
            settings,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Extract from `prompt`, overlay `explicit` (which wins), then ask the
    /// model for kind/provider if either is still missing.
    pub async fn extract(&self, prompt: &str, explicit: &RawIntent) -> RawIntent {
        let raw = extract_rules(prompt).overlay(explicit);
        let missing_kind = !has_any(&raw, &["kind", "resource_kind", "resource_type", "resource"]);
        let missing_provider = !has_any(&raw, &["provider", "cloud", "cloud_provider"]);
        if !(missing_kind || missing_provider) || prompt.trim().is_empty() {
            return raw;
        }
        let Some(model) = &self.model else {
            return raw;
        };

        match self.ask(model.as_ref(), prompt).await {
            Ok(suggested) => {
                let mut fill = RawIntent::new();
                if missing_kind {
                    if let Some(v) = suggested.get("kind") {
                        fill = fill.with("kind", v.clone());
                    }
                }
                if missing_provider {
                    if let Some(v) = suggested.get("provider") {
                        fill = fill.with("provider", v.clone());
                    }
                }
                tracing::debug!(model = model.name(), filled = fill.fields.len(), "model fallback");
                raw.fill_from(&fill)
            }
            Err(e) => {
                tracing::warn!(model = model.name(), error = %e, "model fallback failed; using rule extraction only");
                raw
            }
        }
    }

    async fn ask(&self, model: &dyn LanguageModel, prompt: &str) -> Result<RawIntent, LlmError> {
        let request = fallback_prompt(prompt);
        let mut attempt = 0u32;
        loop {
            match model.complete(&request).await {
                Ok(text) => return parse_model_reply(&text),
                Err(LlmError::Transient(msg)) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(200u64 << attempt.min(6));
                    tracing::debug!(attempt, error = %msg, "retrying model call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn fallback_prompt(prompt: &str) -> String {
    format!(
        "Classify this infrastructure request. Reply with a single JSON object \
         {{\"kind\": one of compute|network|storage|database|pipeline, \
         \"provider\": one of aws|azure|gcp|on-prem|k8s}}. Use null when unsure.\n\n\
         Request: {}",
        prompt
    )
}

/// Pull the first JSON object out of a model reply; keep only string fields.
fn parse_model_reply(text: &str) -> Result<RawIntent, LlmError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(LlmError::Fatal("reply contains no JSON object".to_string()));
    };
    if end < start {
        return Err(LlmError::Fatal("reply contains no JSON object".to_string()));
    }
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text[start..=end])
        .map_err(|e| LlmError::Fatal(format!("reply is not valid JSON: {}", e)))?;
    let mut raw = RawIntent::new();
    for (k, v) in map {
        if let serde_json::Value::String(s) = v {
            if !s.trim().is_empty() {
                raw = raw.with(&k, s);
            }
        }
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedModel {
        replies: std::sync::Mutex<Vec<Result<String, LlmError>>>,
        calls: AtomicU32,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: std::sync::Mutex::new(replies),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(LlmError::Fatal("no more replies".into()));
            }
            replies.remove(0)
        }
    }

    #[test]
    fn test_intent_regexes_compile() {
        for re in [&*COUNT_RE, &*PORT_RE, &*INSTANCE_TYPE_RE, &*REGION_RE, &*NAME_RE, &*SIZE_RE, &*MIN_RE, &*MAX_RE] {
            assert!(!re.as_str().is_empty());
        }
    }

    #[test]
    fn test_intent_web_app_prompt() {
        let raw = extract_rules("Deploy a web app on AWS with 3 instances behind a load balancer");
        assert_eq!(raw.get("action"), Some(&serde_json::json!("create")));
        assert_eq!(raw.get("provider"), Some(&serde_json::json!("aws")));
        assert_eq!(raw.get("kind"), Some(&serde_json::json!("compute")));
        assert_eq!(raw.get("instances"), Some(&serde_json::json!(3)));
        assert_eq!(raw.get("has_load_balancer"), Some(&serde_json::json!(true)));
        assert!(raw.get("format").is_none());
    }

    #[test]
    fn test_intent_k8s_prompt() {
        let raw = extract_rules("Create a kubernetes deployment with 5 replicas on port 80");
        assert_eq!(raw.get("provider"), Some(&serde_json::json!("k8s")));
        assert_eq!(raw.get("format"), Some(&serde_json::json!("kubernetes")));
        assert_eq!(raw.get("replicas"), Some(&serde_json::json!(5)));
        assert_eq!(raw.get("service_port"), Some(&serde_json::json!(80)));
    }

    #[test]
    fn test_intent_storage_prompt() {
        let raw = extract_rules("Provision an unencrypted S3 bucket called audit-logs in eu-west-1");
        assert_eq!(raw.get("kind"), Some(&serde_json::json!("storage")));
        assert_eq!(raw.get("encrypted"), Some(&serde_json::json!(false)));
        assert_eq!(raw.get("name"), Some(&serde_json::json!("audit-logs")));
        assert_eq!(raw.get("region"), Some(&serde_json::json!("eu-west-1")));
    }

    #[test]
    fn test_intent_multiple_kinds_kept() {
        let raw = extract_rules("set up a web app and a postgres database on aws");
        assert_eq!(
            raw.get("kind"),
            Some(&serde_json::json!(["compute", "database"]))
        );
        assert_eq!(raw.get("engine"), Some(&serde_json::json!("postgres")));
    }

    #[test]
    fn test_intent_word_boundaries() {
        // "api" inside "rapid" and "db" inside "dbg" must not match
        let raw = extract_rules("rapid dbg");
        assert!(raw.get("kind").is_none());
        assert!(mentions("an ec2 box", "ec2"));
        assert!(!mentions("tf2", "tf"));
    }

    #[test]
    fn test_intent_empty_prompt() {
        assert!(extract_rules("   ").is_empty());
    }

    #[test]
    fn test_intent_parse_model_reply() {
        let raw = parse_model_reply("Sure! {\"kind\": \"storage\", \"provider\": null}").unwrap();
        assert_eq!(raw.get("kind"), Some(&serde_json::json!("storage")));
        assert!(raw.get("provider").is_none());
        assert!(parse_model_reply("no json here").is_err());
    }

    #[tokio::test]
    async fn test_intent_model_fills_missing_only() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            "{\"kind\": \"database\", \"provider\": \"gcp\"}".into(),
        )]));
        let extractor = IntentExtractor::new(LlmSettings::default()).with_model(model.clone());
        let raw = extractor
            .extract("I need something on aws for my orders", &RawIntent::new())
            .await;
        assert_eq!(raw.get("provider"), Some(&serde_json::json!("aws")));
        assert_eq!(raw.get("kind"), Some(&serde_json::json!("database")));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_intent_model_not_called_when_complete() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let extractor = IntentExtractor::new(LlmSettings::default()).with_model(model.clone());
        let explicit = RawIntent::new().with("kind", "storage").with("provider", "aws");
        let raw = extractor.extract("whatever", &explicit).await;
        assert_eq!(raw.get("kind"), Some(&serde_json::json!("storage")));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intent_model_retries_transient() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LlmError::Transient("503".into())),
            Err(LlmError::Transient("503".into())),
            Ok("{\"kind\": \"network\"}".into()),
        ]));
        let extractor = IntentExtractor::new(LlmSettings::default()).with_model(model.clone());
        let raw = extractor
            .extract("something for the aws team", &RawIntent::new())
            .await;
        assert_eq!(raw.get("kind"), Some(&serde_json::json!("network")));
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intent_model_failure_degrades() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LlmError::Transient("timeout".into())),
            Err(LlmError::Transient("timeout".into())),
            Err(LlmError::Transient("timeout".into())),
        ]));
        let extractor = IntentExtractor::new(LlmSettings::default()).with_model(model.clone());
        let raw = extractor.extract("something on aws", &RawIntent::new()).await;
        assert!(raw.get("kind").is_none());
        // one call plus max_retries (2) retries
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }
}
