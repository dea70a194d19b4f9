//! Docker Compose generator for single-host application stacks.
//!
//! A compute request becomes an application service (optionally built from
//! an inline multi-stage Dockerfile) with an nginx front service when a load
//! balancer is requested. A database request becomes a stateful service with
//! a named volume. Credentials are always `${VAR}` interpolations resolved by
//! compose from the caller's environment.

use super::Generator;
use crate::core::config::GenerationSettings;
use crate::core::error::GenerationError;
use crate::core::types::{InfrastructureRequest, ResourceKind, RetrievedContext, TargetFormat};
use serde_json::{json, Map, Value};

const KINDS: &[ResourceKind] = &[ResourceKind::Compute, ResourceKind::Database];

const NETWORK: &str = "app-network";
const PROXY_IMAGE: &str = "nginx:1.27-alpine";

pub struct DockerGenerator {
    settings: GenerationSettings,
}

impl DockerGenerator {
    pub fn new(settings: GenerationSettings) -> Self {
        Self { settings }
    }

    fn labels(&self, request: &InfrastructureRequest) -> Value {
        json!({
            "managed-by": "autodevops",
            "environment": request.text_attr("environment", "production"),
            "owner": self.settings.owner,
            "cost-center": self.settings.cost_center,
        })
    }

    fn compute(&self, request: &InfrastructureRequest) -> (Map<String, Value>, Map<String, Value>) {
        let name = request.name();
        let port = request.int_attr("service_port", 80);
        let replicas = request.int_attr("replicas", request.int_attr("instances", 1)).max(1);
        let behind_proxy = request.bool_attr("has_load_balancer", false);

        let mut app = json!({
            "restart": "unless-stopped",
            "user": "1000:1000",
            "security_opt": ["no-new-privileges:true"],
            "environment": {
                "PORT": port.to_string(),
                "APP_ENV": request.text_attr("environment", "production"),
            },
            "networks": [NETWORK],
            "labels": self.labels(request),
            "healthcheck": {
                "test": ["CMD", "curl", "-f", format!("http://localhost:{}/health", port)],
                "interval": "30s",
                "timeout": "3s",
                "retries": 3,
                "start_period": "40s",
            },
            "deploy": {
                "resources": {
                    "limits": {
                        "cpus": request.text_attr("cpu_limit", "0.50"),
                        "memory": request.text_attr("memory_limit", "512M"),
                    },
                },
            },
        });
        if request.bool_attr("build", false) {
            let base = request.text_attr("base_image", "python:3.12-slim");
            app["build"] = json!({"context": ".", "dockerfile_inline": dockerfile(&base, port)});
        } else {
            app["image"] = json!(request.text_attr("image", &self.settings.default_image));
        }
        if replicas > 1 {
            app["deploy"]["replicas"] = json!(replicas);
        }
        // replicas cannot share a published host port
        if behind_proxy || replicas > 1 {
            app["expose"] = json!([port.to_string()]);
        } else {
            app["ports"] = json!([format!("{}:{}", port, port)]);
        }

        let mut services = Map::new();
        services.insert(name.clone(), app);
        if behind_proxy {
            services.insert(
                format!("{}-proxy", name),
                json!({
                    "image": PROXY_IMAGE,
                    "restart": "unless-stopped",
                    "ports": ["80:80"],
                    "depends_on": [name],
                    "networks": [NETWORK],
                    "labels": self.labels(request),
                    "deploy": {"resources": {"limits": {"cpus": "0.25", "memory": "128M"}}},
                }),
            );
        }
        (services, Map::new())
    }

    fn database(
        &self,
        request: &InfrastructureRequest,
    ) -> Result<(Map<String, Value>, Map<String, Value>), GenerationError> {
        let name = request.name();
        let volume = format!("{}-data", name);
        let engine = request.text_attr("engine", "postgres").to_ascii_lowercase();
        let (image, data_dir, environment, health_test) = match engine.as_str() {
            "postgres" | "postgresql" => (
                "postgres:16-alpine",
                "/var/lib/postgresql/data",
                json!({
                    "POSTGRES_DB": name,
                    "POSTGRES_USER": name,
                    "POSTGRES_PASSWORD": "${POSTGRES_PASSWORD:?POSTGRES_PASSWORD must be set}",
                }),
                vec!["CMD-SHELL".to_string(), format!("pg_isready -U {}", name)],
            ),
            "mysql" | "mariadb" => (
                "mariadb:11.4",
                "/var/lib/mysql",
                json!({
                    "MARIADB_DATABASE": name,
                    "MARIADB_USER": name,
                    "MARIADB_PASSWORD": "${MARIADB_PASSWORD:?MARIADB_PASSWORD must be set}",
                    "MARIADB_ROOT_PASSWORD": "${MARIADB_ROOT_PASSWORD:?MARIADB_ROOT_PASSWORD must be set}",
                }),
                vec![
                    "CMD".to_string(),
                    "healthcheck.sh".to_string(),
                    "--connect".to_string(),
                ],
            ),
            "redis" => (
                "redis:7-alpine",
                "/data",
                json!({}),
                vec!["CMD".to_string(), "redis-cli".to_string(), "ping".to_string()],
            ),
            other => {
                return Err(GenerationError::new(format!(
                    "unsupported database engine '{}'",
                    other
                )))
            }
        };

        let service = json!({
            "image": image,
            "restart": "unless-stopped",
            "environment": environment,
            "volumes": [format!("{}:{}", volume, data_dir)],
            "networks": [NETWORK],
            "labels": self.labels(request),
            "healthcheck": {
                "test": health_test,
                "interval": "10s",
                "timeout": "5s",
                "retries": 5,
            },
            "deploy": {
                "resources": {
                    "limits": {
                        "cpus": request.text_attr("cpu_limit", "1.0"),
                        "memory": request.text_attr("memory_limit", "1G"),
                    },
                },
            },
        });
        let mut services = Map::new();
        services.insert(name, service);
        let mut volumes = Map::new();
        volumes.insert(volume, json!({}));
        Ok((services, volumes))
    }
}

/// Multi-stage Dockerfile that runs the application as an unprivileged user.
fn dockerfile(base: &str, port: i64) -> String {
    format!(
        "FROM {base} AS builder
WORKDIR /app
COPY . .
RUN mkdir -p /install && if [ -f requirements.txt ]; then pip install --no-cache-dir --prefix=/install -r requirements.txt; fi

FROM {base}
RUN useradd -m -u 1000 appuser
WORKDIR /app
COPY --from=builder /install /usr/local
COPY --from=builder --chown=appuser:appuser /app /app
USER appuser
EXPOSE {port}
ENV PORT={port} PYTHONUNBUFFERED=1
HEALTHCHECK --interval=30s --timeout=3s --start-period=40s --retries=3 CMD curl -f http://localhost:{port}/health || exit 1
CMD [\"python\", \"app.py\"]
"
    )
}

impl Generator for DockerGenerator {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn format(&self) -> TargetFormat {
        TargetFormat::Docker
    }

    fn kinds(&self) -> &'static [ResourceKind] {
        KINDS
    }

    fn render(
        &self,
        request: &InfrastructureRequest,
        _context: &RetrievedContext,
    ) -> Result<String, GenerationError> {
        let (services, volumes) = match request.kind() {
            ResourceKind::Compute => self.compute(request),
            ResourceKind::Database => self.database(request)?,
            other => {
                return Err(GenerationError::new(format!(
                    "docker generator cannot render {}",
                    other
                )))
            }
        };
        let mut compose = json!({
            "name": request.name(),
            "services": services,
            "networks": {NETWORK: {"driver": "bridge"}},
        });
        if !volumes.is_empty() {
            compose["volumes"] = Value::Object(volumes);
        }
        serde_yaml_ng::to_string(&compose)
            .map_err(|e| GenerationError::new(format!("compose serialization: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::test_support::request;

    fn compose(fields: Value) -> serde_yaml_ng::Value {
        let text = DockerGenerator::new(GenerationSettings::default())
            .render(&request(fields), &RetrievedContext::empty())
            .unwrap();
        serde_yaml_ng::from_str(&text).unwrap()
    }

    #[test]
    fn test_docker_single_service_publishes_port() {
        let c = compose(json!({"kind": "compute", "provider": "on-prem", "format": "docker", "name": "web", "servicePort": 8080}));
        let web = &c["services"]["web"];
        assert_eq!(web["ports"][0].as_str(), Some("8080:8080"));
        assert_eq!(web["user"].as_str(), Some("1000:1000"));
        assert!(web["deploy"]["resources"]["limits"]["memory"].is_string());
        assert!(web["deploy"]["replicas"].is_null());
        assert_eq!(c["networks"][NETWORK]["driver"].as_str(), Some("bridge"));
    }

    #[test]
    fn test_docker_load_balancer_adds_proxy() {
        let c = compose(json!({
            "kind": "compute", "provider": "on-prem", "format": "docker", "name": "shop",
            "replicas": 3, "hasLoadBalancer": true
        }));
        let app = &c["services"]["shop"];
        assert_eq!(app["deploy"]["replicas"].as_i64(), Some(3));
        assert!(app["ports"].is_null());
        assert_eq!(app["expose"][0].as_str(), Some("80"));
        let proxy = &c["services"]["shop-proxy"];
        assert_eq!(proxy["image"].as_str(), Some(PROXY_IMAGE));
        assert_eq!(proxy["depends_on"][0].as_str(), Some("shop"));
    }

    #[test]
    fn test_docker_build_uses_inline_dockerfile() {
        let c = compose(json!({"kind": "compute", "provider": "on-prem", "format": "docker", "name": "api", "build": true}));
        let api = &c["services"]["api"];
        assert!(api["image"].is_null());
        let inline = api["build"]["dockerfile_inline"].as_str().unwrap();
        assert!(inline.contains("AS builder"));
        assert!(inline.contains("USER appuser"));
        assert!(inline.contains("EXPOSE 80"));
    }

    #[test]
    fn test_docker_database_password_interpolated() {
        let c = compose(json!({"kind": "database", "provider": "on-prem", "format": "docker", "name": "orders"}));
        let db = &c["services"]["orders"];
        assert_eq!(db["image"].as_str(), Some("postgres:16-alpine"));
        assert!(db["environment"]["POSTGRES_PASSWORD"]
            .as_str()
            .unwrap()
            .starts_with("${POSTGRES_PASSWORD"));
        assert!(c["volumes"]["orders-data"].is_mapping());
    }

    #[test]
    fn test_docker_rejects_storage() {
        let err = DockerGenerator::new(GenerationSettings::default())
            .render(
                &request(json!({"kind": "storage", "provider": "aws", "name": "b"})),
                &RetrievedContext::empty(),
            )
            .unwrap_err();
        assert!(err.message.contains("cannot render"));
    }
}
