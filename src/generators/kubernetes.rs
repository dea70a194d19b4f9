//! Kubernetes manifest generator.
//!
//! Documents are built as JSON values and serialized to YAML, then joined
//! with `---` separators in a fixed order.

use super::Generator;
use crate::core::config::GenerationSettings;
use crate::core::error::GenerationError;
use crate::core::types::{
    AttrValue, InfrastructureRequest, ResourceKind, RetrievedContext, TargetFormat,
};
use serde_json::{json, Value};

const KINDS: &[ResourceKind] = &[
    ResourceKind::Compute,
    ResourceKind::Network,
    ResourceKind::Storage,
];

pub struct KubernetesGenerator {
    settings: GenerationSettings,
}

impl KubernetesGenerator {
    pub fn new(settings: GenerationSettings) -> Self {
        Self { settings }
    }

    fn labels(&self, request: &InfrastructureRequest) -> Value {
        json!({
            "app": request.name(),
            "managed-by": "autodevops",
            "environment": request.text_attr("environment", "production"),
            "owner": self.settings.owner,
            "cost-center": self.settings.cost_center,
        })
    }

    fn metadata(&self, request: &InfrastructureRequest, name: &str) -> Value {
        json!({
            "name": name,
            "namespace": namespace(request),
            "labels": self.labels(request),
        })
    }

    fn namespace_doc(&self, request: &InfrastructureRequest) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": namespace(request),
                "labels": self.labels(request),
            },
        })
    }

    fn compute(&self, request: &InfrastructureRequest) -> Vec<Value> {
        let name = request.name();
        let replicas = request.int_attr("replicas", request.int_attr("instances", 1));
        let image = request.text_attr("image", &self.settings.default_image);
        let port = request.int_attr("service_port", 80);

        let mut resources = json!({
            "requests": {
                "cpu": request.text_attr("cpu_request", "100m"),
                "memory": request.text_attr("memory_request", "128Mi"),
            }
        });
        let mut limits = serde_json::Map::new();
        if let Some(cpu) = request.attr("cpu_limit") {
            limits.insert("cpu".into(), Value::String(cpu.to_string()));
        }
        if let Some(mem) = request.attr("memory_limit") {
            limits.insert("memory".into(), Value::String(mem.to_string()));
        }
        if !limits.is_empty() {
            resources["limits"] = Value::Object(limits);
        }

        let mut docs = vec![
            self.namespace_doc(request),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": self.metadata(request, &format!("{}-config", name)),
                "data": {
                    "ENVIRONMENT": request.text_attr("environment", "production"),
                },
            }),
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": self.metadata(request, &name),
                "spec": {
                    "replicas": replicas,
                    "selector": {"matchLabels": {"app": name}},
                    "template": {
                        "metadata": {"labels": self.labels(request)},
                        "spec": {
                            "securityContext": {
                                "runAsNonRoot": true,
                                "runAsUser": 1000,
                                "fsGroup": 2000,
                            },
                            "containers": [{
                                "name": name,
                                "image": image,
                                "ports": [{"containerPort": port}],
                                "envFrom": [{"configMapRef": {"name": format!("{}-config", name)}}],
                                "resources": resources,
                                "securityContext": {
                                    "allowPrivilegeEscalation": false,
                                    "readOnlyRootFilesystem": true,
                                    "capabilities": {"drop": ["ALL"]},
                                },
                                "readinessProbe": {
                                    "tcpSocket": {"port": port},
                                    "initialDelaySeconds": 5,
                                    "periodSeconds": 10,
                                },
                            }],
                        },
                    },
                },
            }),
        ];

        if request.attr("service_port").is_some() || request.bool_attr("has_load_balancer", false) {
            docs.push(self.service(request, port));
        }
        if request.bool_attr("autoscale", false) {
            let min = request.int_attr("min_size", replicas);
            let max = request.int_attr("max_size", replicas * 2).max(min);
            docs.push(json!({
                "apiVersion": "autoscaling/v2",
                "kind": "HorizontalPodAutoscaler",
                "metadata": self.metadata(request, &name),
                "spec": {
                    "scaleTargetRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": name},
                    "minReplicas": min,
                    "maxReplicas": max,
                    "metrics": [{
                        "type": "Resource",
                        "resource": {
                            "name": "cpu",
                            "target": {"type": "Utilization", "averageUtilization": 70},
                        },
                    }],
                },
            }));
        }
        docs
    }

    fn service(&self, request: &InfrastructureRequest, port: i64) -> Value {
        let name = request.name();
        let service_type = if request.bool_attr("has_load_balancer", false) {
            "LoadBalancer"
        } else {
            "ClusterIP"
        };
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": self.metadata(request, &name),
            "spec": {
                "type": service_type,
                "selector": {"app": name},
                "ports": [{"port": port, "targetPort": port, "protocol": "TCP"}],
            },
        })
    }

    fn network(&self, request: &InfrastructureRequest) -> Vec<Value> {
        let name = request.name();
        let port = request.int_attr("service_port", 80);
        let host = request.text_attr("host", &format!("{}.example.com", name));
        vec![
            self.namespace_doc(request),
            self.service(request, port),
            json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": self.metadata(request, &name),
                "spec": {
                    "rules": [{
                        "host": host,
                        "http": {"paths": [{
                            "path": "/",
                            "pathType": "Prefix",
                            "backend": {"service": {"name": name, "port": {"number": port}}},
                        }]},
                    }],
                },
            }),
        ]
    }

    fn storage(&self, request: &InfrastructureRequest) -> Vec<Value> {
        let class = if request.bool_attr("encrypted", true) {
            "encrypted-ssd"
        } else {
            "standard"
        };
        vec![
            self.namespace_doc(request),
            json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": self.metadata(request, &format!("{}-data", request.name())),
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "storageClassName": class,
                    "resources": {"requests": {"storage": format!("{}Gi", request.int_attr("size", 10))}},
                },
            }),
        ]
    }
}

fn namespace(request: &InfrastructureRequest) -> String {
    match request.attr("namespace") {
        Some(AttrValue::Text(ns)) => ns.clone(),
        _ => request.text_attr("environment", "production"),
    }
}

impl Generator for KubernetesGenerator {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn format(&self) -> TargetFormat {
        TargetFormat::Kubernetes
    }

    fn kinds(&self) -> &'static [ResourceKind] {
        KINDS
    }

    fn render(
        &self,
        request: &InfrastructureRequest,
        _context: &RetrievedContext,
    ) -> Result<String, GenerationError> {
        let docs = match request.kind() {
            ResourceKind::Compute => self.compute(request),
            ResourceKind::Network => self.network(request),
            ResourceKind::Storage => self.storage(request),
            other => {
                return Err(GenerationError::new(format!(
                    "kubernetes generator cannot render {}",
                    other
                )))
            }
        };
        let mut rendered = Vec::with_capacity(docs.len());
        for doc in &docs {
            let yaml = serde_yaml_ng::to_string(doc)
                .map_err(|e| GenerationError::new(format!("manifest serialization: {}", e)))?;
            rendered.push(yaml);
        }
        Ok(rendered.join("---\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::test_support::request;

    fn docs(fields: Value) -> Vec<serde_yaml_ng::Value> {
        let text = KubernetesGenerator::new(GenerationSettings::default())
            .render(&request(fields), &RetrievedContext::empty())
            .unwrap();
        text.split("---\n")
            .map(|d| serde_yaml_ng::from_str(d).unwrap())
            .collect()
    }

    fn kinds(docs: &[serde_yaml_ng::Value]) -> Vec<String> {
        docs.iter()
            .map(|d| d["kind"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_kubernetes_deployment_with_service() {
        let d = docs(json!({"kind": "compute", "provider": "k8s", "replicas": 5, "servicePort": 8080, "name": "api"}));
        assert_eq!(kinds(&d), vec!["Namespace", "ConfigMap", "Deployment", "Service"]);
        let deploy = &d[2];
        assert_eq!(deploy["spec"]["replicas"].as_i64(), Some(5));
        assert_eq!(deploy["metadata"]["labels"]["app"].as_str(), Some("api"));
        assert_eq!(deploy["metadata"]["labels"]["managed-by"].as_str(), Some("autodevops"));
        let container = &deploy["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"].as_str(), Some("nginx:1.27"));
        assert_eq!(
            container["securityContext"]["allowPrivilegeEscalation"].as_bool(),
            Some(false)
        );
        assert!(container["resources"]["limits"].is_null());
        assert_eq!(d[3]["spec"]["type"].as_str(), Some("ClusterIP"));
    }

    #[test]
    fn test_kubernetes_limits_and_autoscale() {
        let d = docs(json!({
            "kind": "compute", "provider": "k8s", "replicas": 2,
            "cpu_limit": "500m", "memory_limit": "256Mi", "autoscale": true
        }));
        assert_eq!(kinds(&d).last().map(String::as_str), Some("HorizontalPodAutoscaler"));
        let container = &d[2]["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["resources"]["limits"]["cpu"].as_str(), Some("500m"));
        let hpa = d.last().unwrap();
        assert_eq!(hpa["spec"]["minReplicas"].as_i64(), Some(2));
        assert_eq!(hpa["spec"]["maxReplicas"].as_i64(), Some(4));
    }

    #[test]
    fn test_kubernetes_network_ingress() {
        let d = docs(json!({"kind": "network", "provider": "k8s", "name": "web", "hasLoadBalancer": true}));
        assert_eq!(kinds(&d), vec!["Namespace", "Service", "Ingress"]);
        assert_eq!(d[1]["spec"]["type"].as_str(), Some("LoadBalancer"));
    }

    #[test]
    fn test_kubernetes_storage_class() {
        let d = docs(json!({"kind": "storage", "provider": "k8s", "size": 50}));
        assert_eq!(d[1]["spec"]["storageClassName"].as_str(), Some("encrypted-ssd"));
        assert_eq!(d[1]["spec"]["resources"]["requests"]["storage"].as_str(), Some("50Gi"));
        let d = docs(json!({"kind": "storage", "provider": "k8s", "encrypted": false}));
        assert_eq!(d[1]["spec"]["storageClassName"].as_str(), Some("standard"));
    }

    #[test]
    fn test_kubernetes_namespace_follows_environment() {
        let d = docs(json!({"kind": "storage", "provider": "k8s", "size": 5, "environment": "dev"}));
        assert_eq!(d[0]["metadata"]["name"].as_str(), Some("development"));
        assert_eq!(d[1]["metadata"]["namespace"].as_str(), Some("development"));
    }
}
