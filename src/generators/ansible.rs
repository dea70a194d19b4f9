//! Ansible playbook generator for host-level compute, database, and CI
//! pipeline provisioning.

use super::Generator;
use crate::core::config::GenerationSettings;
use crate::core::error::GenerationError;
use crate::core::types::{
    AttrValue, InfrastructureRequest, ResourceKind, RetrievedContext, TargetFormat,
};
use serde_json::{json, Value};

const KINDS: &[ResourceKind] = &[
    ResourceKind::Compute,
    ResourceKind::Database,
    ResourceKind::Pipeline,
];

pub struct AnsibleGenerator {
    settings: GenerationSettings,
}

impl AnsibleGenerator {
    pub fn new(settings: GenerationSettings) -> Self {
        Self { settings }
    }

    fn play(&self, request: &InfrastructureRequest, title: &str, tasks: Vec<Value>) -> Value {
        let mut all_tasks = vec![json!({
            "name": "Update package cache",
            "ansible.builtin.apt": {"update_cache": true, "cache_valid_time": 3600},
        })];
        all_tasks.extend(tasks);
        json!({
            "name": format!("{} ({})", title, request.name()),
            "hosts": request.text_attr("hosts", "all"),
            "become": true,
            "vars": {
                "environment_name": request.text_attr("environment", "production"),
                "owner": self.settings.owner,
                "cost_center": self.settings.cost_center,
                "managed_by": "autodevops",
            },
            "tasks": all_tasks,
        })
    }

    fn compute(&self, request: &InfrastructureRequest) -> Vec<Value> {
        let name = request.name();
        let port = request.int_attr("service_port", 80);
        let tasks = vec![
            json!({
                "name": "Install nginx",
                "ansible.builtin.apt": {"name": "nginx", "state": "present"},
            }),
            json!({
                "name": format!("Allow application port {}", port),
                "community.general.ufw": {"rule": "allow", "port": port.to_string(), "proto": "tcp"},
            }),
            json!({
                "name": format!("Write {} site configuration", name),
                "ansible.builtin.copy": {
                    "dest": format!("/etc/nginx/conf.d/{}.conf", name),
                    "content": format!("server {{\n  listen {};\n  server_name {};\n}}\n", port, name),
                    "mode": "0644",
                },
            }),
            json!({
                "name": "Enable and start nginx",
                "ansible.builtin.service": {"name": "nginx", "state": "started", "enabled": true},
            }),
        ];
        vec![self.play(request, "Provision compute hosts", tasks)]
    }

    fn database(&self, request: &InfrastructureRequest) -> Result<Vec<Value>, GenerationError> {
        let (package, service) = match request
            .text_attr("engine", "postgres")
            .to_ascii_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => ("postgresql", "postgresql"),
            "mysql" | "mariadb" => ("mariadb-server", "mariadb"),
            other => {
                return Err(GenerationError::new(format!(
                    "unsupported database engine '{}'",
                    other
                )))
            }
        };
        let name = request.name();
        let backup_days = request.int_attr("backup_days", 7);
        let tasks = vec![
            json!({
                "name": format!("Install {}", package),
                "ansible.builtin.apt": {"name": package, "state": "present"},
            }),
            json!({
                "name": format!("Enable and start {}", service),
                "ansible.builtin.service": {"name": service, "state": "started", "enabled": true},
            }),
            json!({
                "name": format!("Create database user for {}", name),
                "ansible.builtin.command": {
                    "cmd": format!("create-db-user {} --password-file /run/secrets/{}", name, name),
                },
                "environment": {"DB_PASSWORD": "{{ vault_db_password }}"},
                "no_log": true,
            }),
            json!({
                "name": format!("Schedule nightly backups kept {} days", backup_days),
                "ansible.builtin.cron": {
                    "name": format!("{}-backup", name),
                    "hour": "2",
                    "minute": "0",
                    "job": format!("/usr/local/bin/db-backup {} --retain-days {}", name, backup_days),
                },
            }),
        ];
        Ok(vec![self.play(request, "Provision database hosts", tasks)])
    }

    fn pipeline(&self, request: &InfrastructureRequest) -> Vec<Value> {
        let name = request.name();
        let stages: Vec<String> = match request.attr("stages") {
            Some(AttrValue::List(items)) => items.iter().map(|s| s.to_string()).collect(),
            Some(other) => vec![other.to_string()],
            None => vec!["build".into(), "test".into(), "deploy".into()],
        };
        let mut tasks = vec![
            json!({
                "name": "Install git",
                "ansible.builtin.apt": {"name": "git", "state": "present"},
            }),
            json!({
                "name": format!("Create {} workspace", name),
                "ansible.builtin.file": {"path": format!("/opt/{}", name), "state": "directory", "mode": "0755"},
            }),
        ];
        if let Some(repo) = request.attr("repository") {
            tasks.push(json!({
                "name": "Check out repository",
                "ansible.builtin.git": {"repo": repo.to_string(), "dest": format!("/opt/{}/src", name)},
            }));
        }
        for stage in &stages {
            tasks.push(json!({
                "name": format!("Install {} stage script", stage),
                "ansible.builtin.copy": {
                    "dest": format!("/opt/{}/{}.sh", name, stage),
                    "content": format!("#!/bin/sh\nset -eu\necho \"running {} stage\"\n", stage),
                    "mode": "0755",
                },
            }));
        }
        vec![self.play(request, "Provision CI pipeline", tasks)]
    }
}

impl Generator for AnsibleGenerator {
    fn name(&self) -> &'static str {
        "ansible"
    }

    fn format(&self) -> TargetFormat {
        TargetFormat::Ansible
    }

    fn kinds(&self) -> &'static [ResourceKind] {
        KINDS
    }

    fn render(
        &self,
        request: &InfrastructureRequest,
        _context: &RetrievedContext,
    ) -> Result<String, GenerationError> {
        let plays = match request.kind() {
            ResourceKind::Compute => self.compute(request),
            ResourceKind::Database => self.database(request)?,
            ResourceKind::Pipeline => self.pipeline(request),
            other => {
                return Err(GenerationError::new(format!(
                    "ansible generator cannot render {}",
                    other
                )))
            }
        };
        serde_yaml_ng::to_string(&plays)
            .map_err(|e| GenerationError::new(format!("playbook serialization: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::test_support::request;

    fn plays(fields: Value) -> serde_yaml_ng::Value {
        let text = AnsibleGenerator::new(GenerationSettings::default())
            .render(&request(fields), &RetrievedContext::empty())
            .unwrap();
        serde_yaml_ng::from_str(&text).unwrap()
    }

    fn task_names(play: &serde_yaml_ng::Value) -> Vec<String> {
        play["tasks"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_ansible_compute_play() {
        let p = plays(json!({"kind": "compute", "provider": "on-prem", "instances": 2, "name": "web"}));
        let play = &p[0];
        assert_eq!(play["hosts"].as_str(), Some("all"));
        assert_eq!(play["become"].as_bool(), Some(true));
        assert!(task_names(play).contains(&"Install nginx".to_string()));
        assert_eq!(play["vars"]["managed_by"].as_str(), Some("autodevops"));
    }

    #[test]
    fn test_ansible_database_uses_vault_password() {
        let text = AnsibleGenerator::new(GenerationSettings::default())
            .render(
                &request(json!({"kind": "database", "provider": "on-prem", "engine": "mysql"})),
                &RetrievedContext::empty(),
            )
            .unwrap();
        assert!(text.contains("{{ vault_db_password }}"));
        assert!(text.contains("mariadb-server"));
        assert!(text.contains("--retain-days 7"));
    }

    #[test]
    fn test_ansible_pipeline_stages() {
        let p = plays(json!({
            "kind": "pipeline", "provider": "on-prem", "name": "ci",
            "stages": ["lint", "build"], "repository": "https://git.example.com/app.git"
        }));
        let names = task_names(&p[0]);
        assert!(names.contains(&"Check out repository".to_string()));
        assert!(names.contains(&"Install lint stage script".to_string()));
        assert!(names.contains(&"Install build stage script".to_string()));
    }

    #[test]
    fn test_ansible_rejects_unknown_engine() {
        let err = AnsibleGenerator::new(GenerationSettings::default())
            .render(
                &request(json!({"kind": "database", "provider": "on-prem", "engine": "db2"})),
                &RetrievedContext::empty(),
            )
            .unwrap_err();
        assert!(err.message.contains("db2"));
    }
}
