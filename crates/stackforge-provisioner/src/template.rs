// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Template renderer: turns a [`ProjectConfig`] into a [`ProjectManifest`].
//!
//! Rendering is pure. The same config and context always produce the same
//! manifest, which is what makes [`diff`] meaningful for in-place updates.
//!
//! # Services
//!
//! | Service | Image | Host port | Probe |
//! |---------|-------|-----------|-------|
//! | `db` | postgres | `db_port` | `pg_isready` |
//! | `meta` | postgres-meta | - | TCP 8080 |
//! | `auth` | gotrue | - | HTTP 9999 `/health` |
//! | `rest` | postgrest | - | TCP 3000 |
//! | `realtime` | realtime | - | TCP 4000 |
//! | `storage` | storage-api | - | HTTP 5000 `/status` |
//! | `kong` | kong | `api_port` | TCP 8000 |
//! | `studio` | studio (when `studio_port != 0`) | `studio_port` | HTTP 3000 `/api/profile` |
//!
//! Services reach each other on the project network by their logical name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::adapter::{HealthProbe, PortBinding, ServiceSpec, VolumeMount};
use crate::project::{ProjectConfig, ResourceLimits};

/// Mount point of the file storage volume inside the `storage` service.
pub const STORAGE_ROOT: &str = "/var/lib/storage";

/// Mount point of the database volume inside the `db` service.
pub const DB_DATA_ROOT: &str = "/var/lib/postgresql/data";

/// Logical name of the database service.
pub const DB_SERVICE: &str = "db";

/// Logical name of the file storage service.
pub const STORAGE_SERVICE: &str = "storage";

const META_IMAGE: &str = "supabase/postgres-meta:v0.68.0";
const AUTH_IMAGE: &str = "supabase/gotrue:v2.99.0";
const REST_IMAGE: &str = "postgrest/postgrest:v11.2.0";
const REALTIME_IMAGE: &str = "supabase/realtime:v2.25.35";
const STORAGE_IMAGE: &str = "supabase/storage-api:v0.43.11";
const KONG_IMAGE: &str = "kong:2.8.1";
const STUDIO_IMAGE: &str = "supabase/studio:20230921-d657f29";

/// Placement settings shared by all projects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateContext {
    /// Host name clients use to reach published ports.
    pub public_host: String,
    /// Base domain; projects are served at `https://{id}.{domain}` when set.
    pub domain_base: Option<String>,
    /// Postgres image repository.
    pub postgres_image: String,
    /// Postgres image tag.
    pub postgres_version: String,
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            domain_base: None,
            postgres_image: "supabase/postgres".to_string(),
            postgres_version: "14.2".to_string(),
        }
    }
}

/// A volume owned by a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Logical name (`db`, `storage`).
    pub logical: String,
    /// Runtime volume name.
    pub name: String,
}

/// Rendered runtime description of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectManifest {
    /// Project reference.
    pub project_id: String,
    /// Network all services attach to.
    pub network: String,
    /// Volumes to create before any container.
    pub volumes: Vec<VolumeSpec>,
    /// Services in creation order.
    pub services: Vec<ServiceSpec>,
    /// Public API endpoint.
    pub endpoint: String,
    /// Database endpoint without credentials.
    pub db_endpoint: String,
}

impl ProjectManifest {
    /// Look up a service by logical name.
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Runtime name of a volume by logical name.
    pub fn volume(&self, logical: &str) -> Option<&str> {
        self.volumes
            .iter()
            .find(|v| v.logical == logical)
            .map(|v| v.name.as_str())
    }
}

fn resource_name(project_id: &str, suffix: &str) -> String {
    format!("stackforge-{project_id}-{suffix}")
}

/// Render the manifest for a project.
pub fn render(config: &ProjectConfig, ctx: &TemplateContext) -> ProjectManifest {
    let id = &config.project_id;
    let network = resource_name(id, "net");
    let db_volume = resource_name(id, "db-data");
    let storage_volume = resource_name(id, "storage");

    let endpoint = match &ctx.domain_base {
        Some(domain) => format!("https://{id}.{domain}"),
        None => format!("http://{}:{}", ctx.public_host, config.api_port),
    };
    let db_endpoint = format!(
        "postgresql://postgres@{}:{}/postgres",
        ctx.public_host, config.db_port
    );

    let pw = config.db_password.as_str();
    let jwt = config.jwt_secret.as_str();
    let limits = split_limits(config.limits, if config.studio_port != 0 { 8 } else { 7 });

    let mut services = Vec::with_capacity(8);

    services.push(ServiceSpec {
        name: DB_SERVICE.to_string(),
        container_name: resource_name(id, "db"),
        image: format!("{}:{}", ctx.postgres_image, ctx.postgres_version),
        command: vec![
            "postgres".into(),
            "-c".into(),
            "listen_addresses=*".into(),
        ],
        env: env([
            ("POSTGRES_HOST", "/var/run/postgresql"),
            ("POSTGRES_PORT", "5432"),
            ("POSTGRES_DB", "postgres"),
            ("POSTGRES_PASSWORD", pw),
            ("PGPASSWORD", pw),
            ("JWT_SECRET", jwt),
            ("JWT_EXP", "3600"),
        ]),
        ports: vec![PortBinding {
            host_port: config.db_port,
            container_port: 5432,
        }],
        mounts: vec![VolumeMount {
            volume: db_volume.clone(),
            target: DB_DATA_ROOT.to_string(),
        }],
        depends_on: vec![],
        probe: HealthProbe::Command {
            command: vec![
                "pg_isready".into(),
                "-U".into(),
                "postgres".into(),
                "-h".into(),
                "localhost".into(),
            ],
        },
        limits,
    });

    services.push(ServiceSpec {
        name: "meta".to_string(),
        container_name: resource_name(id, "meta"),
        image: META_IMAGE.to_string(),
        command: vec![],
        env: env([
            ("PG_META_PORT", "8080"),
            ("PG_META_DB_HOST", DB_SERVICE),
            ("PG_META_DB_PORT", "5432"),
            ("PG_META_DB_NAME", "postgres"),
            ("PG_META_DB_USER", "supabase_admin"),
            ("PG_META_DB_PASSWORD", pw),
        ]),
        ports: vec![],
        mounts: vec![],
        depends_on: vec![DB_SERVICE.into()],
        probe: HealthProbe::Tcp { port: 8080 },
        limits,
    });

    services.push(ServiceSpec {
        name: "auth".to_string(),
        container_name: resource_name(id, "auth"),
        image: AUTH_IMAGE.to_string(),
        command: vec![],
        env: env([
            ("GOTRUE_API_HOST", "0.0.0.0"),
            ("GOTRUE_API_PORT", "9999"),
            ("API_EXTERNAL_URL", endpoint.as_str()),
            ("GOTRUE_DB_DRIVER", "postgres"),
            (
                "GOTRUE_DB_DATABASE_URL",
                format!("postgres://supabase_auth_admin:{pw}@db:5432/postgres").as_str(),
            ),
            ("GOTRUE_SITE_URL", endpoint.as_str()),
            ("GOTRUE_DISABLE_SIGNUP", "false"),
            ("GOTRUE_JWT_ADMIN_ROLES", "service_role"),
            ("GOTRUE_JWT_AUD", "authenticated"),
            ("GOTRUE_JWT_DEFAULT_GROUP_NAME", "authenticated"),
            ("GOTRUE_JWT_EXP", "3600"),
            ("GOTRUE_JWT_SECRET", jwt),
            ("GOTRUE_EXTERNAL_EMAIL_ENABLED", "true"),
            ("GOTRUE_MAILER_AUTOCONFIRM", "false"),
        ]),
        ports: vec![],
        mounts: vec![],
        depends_on: vec![DB_SERVICE.into()],
        probe: HealthProbe::Http {
            port: 9999,
            path: "/health".into(),
        },
        limits,
    });

    services.push(ServiceSpec {
        name: "rest".to_string(),
        container_name: resource_name(id, "rest"),
        image: REST_IMAGE.to_string(),
        command: vec!["postgrest".into()],
        env: env([
            (
                "PGRST_DB_URI",
                format!("postgres://authenticator:{pw}@db:5432/postgres").as_str(),
            ),
            ("PGRST_DB_SCHEMAS", "public,storage,graphql_public"),
            ("PGRST_DB_ANON_ROLE", "anon"),
            ("PGRST_JWT_SECRET", jwt),
            ("PGRST_DB_USE_LEGACY_GUCS", "false"),
        ]),
        ports: vec![],
        mounts: vec![],
        depends_on: vec![DB_SERVICE.into()],
        probe: HealthProbe::Tcp { port: 3000 },
        limits,
    });

    services.push(ServiceSpec {
        name: "realtime".to_string(),
        container_name: resource_name(id, "realtime"),
        image: REALTIME_IMAGE.to_string(),
        command: vec![],
        env: env([
            ("PORT", "4000"),
            ("DB_HOST", DB_SERVICE),
            ("DB_PORT", "5432"),
            ("DB_USER", "supabase_admin"),
            ("DB_PASSWORD", pw),
            ("DB_NAME", "postgres"),
            ("DB_AFTER_CONNECT_QUERY", "SET search_path TO _realtime"),
            ("DB_ENC_KEY", "supabaserealtime"),
            ("API_JWT_SECRET", jwt),
            ("SECRET_KEY_BASE", jwt),
            ("FLY_ALLOC_ID", "fly123"),
            ("FLY_APP_NAME", "realtime"),
            ("ERL_AFLAGS", "-proto_dist inet_tcp"),
            ("ENABLE_TAILSCALE", "false"),
            ("DNS_NODES", "''"),
        ]),
        ports: vec![],
        mounts: vec![],
        depends_on: vec![DB_SERVICE.into()],
        probe: HealthProbe::Tcp { port: 4000 },
        limits,
    });

    services.push(ServiceSpec {
        name: STORAGE_SERVICE.to_string(),
        container_name: resource_name(id, "storage"),
        image: STORAGE_IMAGE.to_string(),
        command: vec![],
        env: env([
            ("ANON_KEY", config.anon_key.as_str()),
            ("SERVICE_KEY", config.service_key.as_str()),
            ("POSTGREST_URL", "http://rest:3000"),
            ("PGRST_JWT_SECRET", jwt),
            (
                "DATABASE_URL",
                format!("postgres://supabase_storage_admin:{pw}@db:5432/postgres").as_str(),
            ),
            ("FILE_SIZE_LIMIT", "52428800"),
            ("STORAGE_BACKEND", "file"),
            ("FILE_STORAGE_BACKEND_PATH", STORAGE_ROOT),
            ("TENANT_ID", id.as_str()),
            ("REGION", config.region.as_str()),
            ("GLOBAL_S3_BUCKET", "stub"),
        ]),
        ports: vec![],
        mounts: vec![VolumeMount {
            volume: storage_volume.clone(),
            target: STORAGE_ROOT.to_string(),
        }],
        depends_on: vec![DB_SERVICE.into(), "rest".into()],
        probe: HealthProbe::Http {
            port: 5000,
            path: "/status".into(),
        },
        limits,
    });

    services.push(ServiceSpec {
        name: "kong".to_string(),
        container_name: resource_name(id, "kong"),
        image: KONG_IMAGE.to_string(),
        command: vec![],
        env: env([
            ("KONG_DATABASE", "off"),
            ("KONG_DECLARATIVE_CONFIG_STRING", kong_config(config).to_string().as_str()),
            ("KONG_DNS_ORDER", "LAST,A,CNAME"),
            ("KONG_PLUGINS", "request-transformer,cors,key-auth,acl"),
            ("KONG_NGINX_PROXY_PROXY_BUFFER_SIZE", "160k"),
            ("KONG_NGINX_PROXY_PROXY_BUFFERS", "64 160k"),
        ]),
        ports: vec![PortBinding {
            host_port: config.api_port,
            container_port: 8000,
        }],
        mounts: vec![],
        depends_on: vec![
            "auth".into(),
            "rest".into(),
            "realtime".into(),
            STORAGE_SERVICE.into(),
            "meta".into(),
        ],
        probe: HealthProbe::Tcp { port: 8000 },
        limits,
    });

    if config.studio_port != 0 {
        services.push(ServiceSpec {
            name: "studio".to_string(),
            container_name: resource_name(id, "studio"),
            image: STUDIO_IMAGE.to_string(),
            command: vec![],
            env: env([
                ("STUDIO_PG_META_URL", "http://meta:8080"),
                ("POSTGRES_PASSWORD", pw),
                ("DEFAULT_ORGANIZATION_NAME", config.organization_id.as_str()),
                ("DEFAULT_PROJECT_NAME", config.project_name.as_str()),
                ("SUPABASE_URL", "http://kong:8000"),
                ("SUPABASE_PUBLIC_URL", endpoint.as_str()),
                ("SUPABASE_ANON_KEY", config.anon_key.as_str()),
                ("SUPABASE_SERVICE_KEY", config.service_key.as_str()),
                ("DASHBOARD_USERNAME", config.dashboard_user.as_str()),
                ("DASHBOARD_PASSWORD", config.dashboard_pass.as_str()),
            ]),
            ports: vec![PortBinding {
                host_port: config.studio_port,
                container_port: 3000,
            }],
            mounts: vec![],
            depends_on: vec!["meta".into(), "kong".into()],
            probe: HealthProbe::Http {
                port: 3000,
                path: "/api/profile".into(),
            },
            limits,
        });
    }

    ProjectManifest {
        project_id: id.clone(),
        network,
        volumes: vec![
            VolumeSpec {
                logical: DB_SERVICE.to_string(),
                name: db_volume,
            },
            VolumeSpec {
                logical: STORAGE_SERVICE.to_string(),
                name: storage_volume,
            },
        ],
        services,
        endpoint,
        db_endpoint,
    }
}

fn env<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Spread project-wide limits evenly across `services` containers.
fn split_limits(limits: ResourceLimits, services: u64) -> ResourceLimits {
    ResourceLimits {
        cpu_millicores: limits.cpu_millicores / services,
        memory_bytes: limits.memory_bytes / services,
        storage_bytes: limits.storage_bytes,
    }
}

/// Declarative gateway config routing the public API to the services.
fn kong_config(config: &ProjectConfig) -> serde_json::Value {
    let route = |name: &str, url: &str, path: &str| {
        json!({
            "name": name,
            "url": url,
            "routes": [{ "name": format!("{name}-all"), "strip_path": true, "paths": [path] }],
            "plugins": [{ "name": "cors" }],
        })
    };
    json!({
        "_format_version": "2.1",
        "_transform": true,
        "consumers": [
            { "username": "anon", "keyauth_credentials": [{ "key": config.anon_key }] },
            { "username": "service_role", "keyauth_credentials": [{ "key": config.service_key }] },
        ],
        "services": [
            route("auth-v1", "http://auth:9999/", "/auth/v1/"),
            route("rest-v1", "http://rest:3000/", "/rest/v1/"),
            route("realtime-v1", "http://realtime:4000/socket/", "/realtime/v1/"),
            route("storage-v1", "http://storage:5000/", "/storage/v1/"),
            route("meta", "http://meta:8080/", "/pg/"),
        ],
    })
}

/// Services whose container must be recreated to go from `current` to
/// `desired`, including services added or removed. Creation order of
/// `desired` is preserved; removed services come last.
pub fn diff(current: &ProjectManifest, desired: &ProjectManifest) -> Vec<String> {
    let mut changed: Vec<String> = desired
        .services
        .iter()
        .filter(|svc| current.service(&svc.name) != Some(*svc))
        .map(|svc| svc.name.clone())
        .collect();
    changed.extend(
        current
            .services
            .iter()
            .filter(|svc| desired.service(&svc.name).is_none())
            .map(|svc| svc.name.clone()),
    );
    changed
}

/// First field that differs between two configs and may not change after
/// creation.
pub fn immutable_change(current: &ProjectConfig, desired: &ProjectConfig) -> Option<&'static str> {
    if current.project_id != desired.project_id {
        Some("project_id")
    } else if current.organization_id != desired.organization_id {
        Some("organization_id")
    } else if current.region != desired.region {
        Some("region")
    } else if current.db_password != desired.db_password {
        Some("db_password")
    } else if current.jwt_secret != desired.jwt_secret {
        Some("jwt_secret")
    } else {
        None
    }
}

// Commands run inside service containers. The mock adapter interprets the
// same command lines, so they live next to the service definitions.

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Logical dump of the database to stdout.
pub fn dump_database_command() -> Vec<String> {
    argv(&[
        "pg_dump",
        "-U",
        "postgres",
        "-d",
        "postgres",
        "--clean",
        "--if-exists",
        "--no-owner",
    ])
}

/// Replay a logical dump read from stdin.
pub fn restore_database_command() -> Vec<String> {
    argv(&[
        "psql",
        "-U",
        "postgres",
        "-d",
        "postgres",
        "-v",
        "ON_ERROR_STOP=1",
        "-q",
    ])
}

/// Run one SQL query and print the bare result.
pub fn sql_query_command(sql: &str) -> Vec<String> {
    argv(&["psql", "-U", "postgres", "-d", "postgres", "-t", "-A", "-c", sql])
}

/// Tar the storage volume to stdout.
pub fn archive_storage_command() -> Vec<String> {
    argv(&["tar", "-cf", "-", "-C", STORAGE_ROOT, "."])
}

/// Extract a tar read from stdin into the storage volume.
pub fn extract_storage_command() -> Vec<String> {
    argv(&["tar", "-xf", "-", "-C", STORAGE_ROOT])
}

/// Remove every file in the storage volume.
pub fn wipe_storage_command() -> Vec<String> {
    argv(&["find", STORAGE_ROOT, "-mindepth", "1", "-delete"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::fixtures::config;

    #[test]
    fn test_render_is_deterministic() {
        let cfg = config("p1", 5433, 54321);
        let ctx = TemplateContext::default();
        assert_eq!(render(&cfg, &ctx), render(&cfg, &ctx));
    }

    #[test]
    fn test_render_services_and_ports() {
        let cfg = config("p1", 5433, 54321);
        let manifest = render(&cfg, &TemplateContext::default());
        let names: Vec<_> = manifest.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["db", "meta", "auth", "rest", "realtime", "storage", "kong"]);
        assert_eq!(manifest.service("db").unwrap().ports[0].host_port, 5433);
        assert_eq!(manifest.service("kong").unwrap().ports[0].host_port, 54321);
        assert_eq!(manifest.network, "stackforge-p1-net");
        assert_eq!(manifest.volume("storage"), Some("stackforge-p1-storage"));
        assert_eq!(manifest.endpoint, "http://localhost:54321");
        assert_eq!(manifest.db_endpoint, "postgresql://postgres@localhost:5433/postgres");
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let mut cfg = config("p1", 5433, 54321);
        cfg.studio_port = 3001;
        let manifest = render(&cfg, &TemplateContext::default());
        for (i, svc) in manifest.services.iter().enumerate() {
            for dep in &svc.depends_on {
                let pos = manifest.services.iter().position(|s| &s.name == dep).unwrap();
                assert!(pos < i, "{} depends on later {}", svc.name, dep);
            }
        }
        assert!(manifest.service("studio").is_some());
    }

    #[test]
    fn test_domain_endpoint() {
        let ctx = TemplateContext {
            domain_base: Some("stack.example.com".into()),
            ..TemplateContext::default()
        };
        let manifest = render(&config("abc", 5433, 54321), &ctx);
        assert_eq!(manifest.endpoint, "https://abc.stack.example.com");
    }

    #[test]
    fn test_diff_only_affected_services() {
        let ctx = TemplateContext::default();
        let before = config("p1", 5433, 54321);
        let mut after = before.clone();
        after.api_port = 54400;
        let changed = diff(&render(&before, &ctx), &render(&after, &ctx));
        // The endpoint moves with the gateway port, so auth follows.
        assert_eq!(changed, vec!["auth".to_string(), "kong".to_string()]);

        let mut with_studio = before.clone();
        with_studio.studio_port = 3001;
        let changed = diff(&render(&before, &ctx), &render(&with_studio, &ctx));
        assert_eq!(changed, vec!["studio".to_string()]);
        let changed = diff(&render(&with_studio, &ctx), &render(&before, &ctx));
        assert_eq!(changed, vec!["studio".to_string()]);
    }

    #[test]
    fn test_key_rotation_touches_gateway_and_storage() {
        let ctx = TemplateContext::default();
        let before = config("p1", 5433, 54321);
        let mut after = before.clone();
        after.anon_key = "rotated".into();
        let changed = diff(&render(&before, &ctx), &render(&after, &ctx));
        assert_eq!(changed, vec!["storage".to_string(), "kong".to_string()]);
    }

    #[test]
    fn test_immutable_fields() {
        let before = config("p1", 5433, 54321);
        let mut after = before.clone();
        after.project_name = "renamed".into();
        assert_eq!(immutable_change(&before, &after), None);
        after.db_password = "y".into();
        assert_eq!(immutable_change(&before, &after), Some("db_password"));
        let mut moved = before.clone();
        moved.region = "eu".into();
        assert_eq!(immutable_change(&before, &moved), Some("region"));
    }
}
