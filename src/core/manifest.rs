//! Manifest synthesis — merge substituted workloads and the compose fragments
//! contributed by provisioners into one compose document.
//!
//! Every map in [`Manifest`] is a BTreeMap and every list is built in sorted
//! order, so the rendered document depends only on the inputs' content.

use super::error::SynthesisError;
use super::types::{
    ConfigEntry, Manifest, OutputValue, ResolvedResource, Service, ServiceConfig, WorkloadSpec,
};
use std::collections::{BTreeMap, BTreeSet};

/// Label carrying the originating workload name.
pub const WORKLOAD_LABEL: &str = "dev.score.workload";

/// Service name for a workload container.
pub fn service_name(workload: &str, container: &str) -> String {
    format!("{}-{}", workload, container)
}

struct Builder {
    manifest: Manifest,
    owners: BTreeMap<String, String>,
    volume_owners: BTreeMap<String, String>,
}

impl Builder {
    fn add_service(&mut self, name: String, owner: String, service: Service) -> Result<(), SynthesisError> {
        if let Some(first) = self.owners.get(&name) {
            return Err(SynthesisError::ServiceCollision {
                name,
                first: first.clone(),
                second: owner,
            });
        }
        self.owners.insert(name.clone(), owner);
        self.manifest.services.insert(name, service);
        Ok(())
    }

    fn add_volume(&mut self, name: &str, owner: &str, definition: &serde_yaml_ng::Value) -> Result<(), SynthesisError> {
        match self.manifest.volumes.get(name) {
            Some(existing) if existing != definition => Err(SynthesisError::VolumeConflict {
                name: name.to_string(),
                first: self.volume_owners.get(name).cloned().unwrap_or_default(),
                second: owner.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.manifest.volumes.insert(name.to_string(), definition.clone());
                self.volume_owners.insert(name.to_string(), owner.to_string());
                Ok(())
            }
        }
    }
}

fn port_mapping(port: u16, target: Option<u16>, protocol: Option<&str>) -> String {
    let mut mapping = format!("{}:{}", port, target.unwrap_or(port));
    if let Some(p) = protocol.map(str::to_lowercase).filter(|p| p != "tcp") {
        mapping.push('/');
        mapping.push_str(&p);
    }
    mapping
}

fn workload_services(
    spec: &WorkloadSpec,
    depends_on: &[String],
    configs: &mut BTreeMap<String, ConfigEntry>,
) -> Vec<(String, Service)> {
    let workload = spec.name();
    let first = spec
        .containers
        .keys()
        .next()
        .map(|c| service_name(workload, c));

    let mut out = Vec::with_capacity(spec.containers.len());
    for (index, (cname, container)) in spec.containers.iter().enumerate() {
        let name = service_name(workload, cname);
        let mut service = Service {
            image: Some(container.image.clone()),
            entrypoint: (!container.command.is_empty()).then(|| container.command.clone()),
            command: (!container.args.is_empty()).then(|| container.args.clone()),
            depends_on: depends_on.to_vec(),
            labels: BTreeMap::from([(WORKLOAD_LABEL.to_string(), workload.to_string())]),
            ..Default::default()
        };

        for (var, value) in &container.variables {
            match value {
                OutputValue::Secret(s) => {
                    service.secrets.insert(var.clone(), s.secret.clone());
                }
                OutputValue::Value(v) => {
                    service.environment.insert(var.clone(), v.clone());
                }
            }
        }

        if index == 0 {
            if let Some(svc) = &spec.service {
                let mut ports: Vec<_> = svc.ports.iter().collect();
                ports.sort_by(|a, b| a.0.cmp(b.0));
                service.ports = ports
                    .into_iter()
                    .map(|(_, p)| port_mapping(p.port, p.target_port, p.protocol.as_deref()))
                    .collect();
            }
        } else {
            service.network_mode = first.as_ref().map(|f| format!("service:{}", f));
        }

        service.volumes = container
            .volumes
            .iter()
            .map(|v| {
                let mut mount = format!("{}:{}", v.source, v.target);
                if v.read_only {
                    mount.push_str(":ro");
                }
                mount
            })
            .collect();

        for (i, file) in container.files.iter().enumerate() {
            let config = format!("{}-file-{}", name, i);
            configs.insert(
                config.clone(),
                ConfigEntry {
                    content: file.content.clone(),
                },
            );
            service.configs.push(ServiceConfig {
                source: config,
                target: file.target.clone(),
                mode: file.mode.clone(),
            });
        }

        out.push((name, service));
    }
    out
}

/// Merge workloads and the resources they use into one manifest.
///
/// `specs` must already be substituted. Only resources requested by `specs`
/// contribute services and volumes.
pub fn synthesize(
    specs: &[WorkloadSpec],
    resolved: &BTreeMap<String, ResolvedResource>,
) -> Result<Manifest, SynthesisError> {
    let mut builder = Builder {
        manifest: Manifest::default(),
        owners: BTreeMap::new(),
        volume_owners: BTreeMap::new(),
    };

    let used: BTreeSet<&str> = specs.iter().flat_map(|s| s.resource_ids()).collect();
    for id in &used {
        let Some(resource) = resolved.get(*id) else {
            continue;
        };
        let owner = format!("resource '{}'", id);
        for (name, service) in &resource.services {
            builder.add_service(name.clone(), owner.clone(), service.clone())?;
        }
        for (name, definition) in &resource.volumes {
            builder.add_volume(name, &owner, definition)?;
        }
    }

    let mut sorted: Vec<&WorkloadSpec> = specs.iter().collect();
    sorted.sort_by(|a, b| a.name().cmp(b.name()));
    for spec in sorted {
        let depends_on: Vec<String> = spec
            .resource_ids()
            .filter_map(|id| resolved.get(id))
            .flat_map(|r| r.services.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let owner = format!("workload '{}'", spec.name());
        let mut configs = BTreeMap::new();
        for (name, service) in workload_services(spec, &depends_on, &mut configs) {
            builder.add_service(name, owner.clone(), service)?;
        }
        builder.manifest.configs.extend(configs);
    }

    tracing::debug!(
        services = builder.manifest.services.len(),
        volumes = builder.manifest.volumes.len(),
        "synthesized manifest"
    );
    Ok(builder.manifest)
}

/// Render a manifest as YAML.
pub fn render(manifest: &Manifest) -> Result<String, SynthesisError> {
    serde_yaml_ng::to_string(manifest).map_err(|e| SynthesisError::Render(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Provisioned;

    fn spec(yaml: &str) -> WorkloadSpec {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn pg() -> BTreeMap<String, ResolvedResource> {
        let provisioned: Provisioned = serde_yaml_ng::from_str(
            r#"
outputs:
  host: pg-db
services:
  pg-db:
    image: postgres:17
volumes:
  pg-db-data:
    driver: local
"#,
        )
        .unwrap();
        BTreeMap::from([(
            "db".to_string(),
            ResolvedResource::new("blake3:x".to_string(), "template://pg", provisioned),
        )])
    }

    const WEB: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: web
service:
  ports:
    www:
      port: 8080
      targetPort: 80
    metrics:
      port: 9090
      protocol: UDP
containers:
  main:
    image: nginx
    command: ["/bin/app"]
    args: ["--serve"]
    variables:
      Z_LAST: "1"
      A_FIRST: pg-db
      PASSWORD:
        secret: arn:pw
    volumes:
      - source: data
        target: /data
        readOnly: true
    files:
      - target: /etc/app.conf
        mode: "0644"
        content: hello
  sidecar:
    image: envoy
resources:
  db:
    type: postgres
"#;

    #[test]
    fn test_services_per_container() {
        let m = synthesize(&[spec(WEB)], &pg()).unwrap();
        let names: Vec<_> = m.services.keys().cloned().collect();
        assert_eq!(names, vec!["pg-db", "web-main", "web-sidecar"]);

        let main = &m.services["web-main"];
        assert_eq!(main.image.as_deref(), Some("nginx"));
        assert_eq!(main.entrypoint, Some(vec!["/bin/app".to_string()]));
        assert_eq!(main.command, Some(vec!["--serve".to_string()]));
        assert_eq!(main.ports, vec!["9090:9090/udp", "8080:80"]);
        assert_eq!(main.volumes, vec!["data:/data:ro"]);
        assert_eq!(main.secrets["PASSWORD"], "arn:pw");
        assert!(!main.environment.contains_key("PASSWORD"));
        assert_eq!(main.depends_on, vec!["pg-db"]);

        let sidecar = &m.services["web-sidecar"];
        assert_eq!(sidecar.network_mode.as_deref(), Some("service:web-main"));
        assert!(sidecar.ports.is_empty());
    }

    #[test]
    fn test_environment_sorted_in_output() {
        let m = synthesize(&[spec(WEB)], &pg()).unwrap();
        let yaml = render(&m).unwrap();
        let a = yaml.find("A_FIRST").unwrap();
        let z = yaml.find("Z_LAST").unwrap();
        assert!(a < z);
    }

    #[test]
    fn test_files_become_configs() {
        let m = synthesize(&[spec(WEB)], &pg()).unwrap();
        assert_eq!(m.configs["web-main-file-0"].content, "hello");
        let mount = &m.services["web-main"].configs[0];
        assert_eq!(mount.target, "/etc/app.conf");
        assert_eq!(mount.mode.as_deref(), Some("0644"));
    }

    #[test]
    fn test_provisioner_volumes_merged() {
        let m = synthesize(&[spec(WEB)], &pg()).unwrap();
        assert!(m.volumes.contains_key("pg-db-data"));
    }

    #[test]
    fn test_unused_resource_contributes_nothing() {
        let no_db = WEB.replace("resources:\n  db:\n    type: postgres\n", "");
        let m = synthesize(&[spec(&no_db)], &pg()).unwrap();
        assert!(!m.services.contains_key("pg-db"));
        assert!(m.volumes.is_empty());
    }

    #[test]
    fn test_service_collision() {
        // workload "pg" with container "db" collides with the provisioner's "pg-db"
        let clash = WEB
            .replace("name: web", "name: pg")
            .replace("  main:\n", "  db:\n");
        let err = synthesize(&[spec(&clash)], &pg()).unwrap_err();
        assert!(matches!(err, SynthesisError::ServiceCollision { ref name, .. } if name == "pg-db"));
    }

    #[test]
    fn test_volume_conflict() {
        let mut resolved = pg();
        let mut other = resolved["db"].clone();
        other.services.clear();
        other.volumes.insert(
            "pg-db-data".to_string(),
            serde_yaml_ng::from_str("driver: nfs").unwrap(),
        );
        resolved.insert("db2".to_string(), other);
        let two = WEB.replace(
            "resources:\n  db:\n    type: postgres\n",
            "resources:\n  db:\n    type: postgres\n  db2:\n    type: postgres\n",
        );
        let err = synthesize(&[spec(&two)], &resolved).unwrap_err();
        assert!(matches!(err, SynthesisError::VolumeConflict { .. }));
    }

    #[test]
    fn test_input_order_irrelevant() {
        let worker = spec(&WEB.replace("name: web", "name: worker"));
        let a = render(&synthesize(&[spec(WEB), worker.clone()], &pg()).unwrap()).unwrap();
        let b = render(&synthesize(&[worker, spec(WEB)], &pg()).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_port_mapping() {
        assert_eq!(port_mapping(80, None, None), "80:80");
        assert_eq!(port_mapping(80, Some(8080), Some("TCP")), "80:8080");
        assert_eq!(port_mapping(53, None, Some("udp")), "53:53/udp");
    }
}
