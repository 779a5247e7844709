// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command lines for the container runtime.
//!
//! Nothing here runs anything; each function only builds an [`Invocation`].

use crate::runner::Invocation;
use cluster_common::layout::{
    RemoteLayout, APPLICATION_SERVICE, CACHE_CONTAINER, ROUTER_CONTAINER,
    ROUTER_INIT_CONTAINER, STORAGE_CONTAINER,
};
use cluster_common::protocol::{
    ContainerHealthcheck, HealthStatus, ProtocolError, StartApplication,
    StartCache, StartRouter, StartStorage, TaskState,
};
use std::net::Ipv4Addr;

pub const DOCKER: &str = "docker";

/// Inside the storage container, where the login-path bundle is written.
const LOGIN_FILE_IN_CONTAINER: &str = "/var/run/mysqld/.mylogin.cnf";
const STORE_CREDENTIALS_SCRIPT: &str = "/opt/store_credentials.exp";
const STORAGE_SSL_DIR: &str = "/etc/mysql/ssl";
const APPLICATION_SSL_DIR: &str = "/etc/ssl/certs";

// Compose service names in the router's compose file.
const COMPOSE_INIT_SERVICE: &str = "initcontainer";
const COMPOSE_MAIN_SERVICE: &str = "maincontainer";

fn docker() -> Invocation {
    Invocation::new(DOCKER)
}

fn healthcheck_args(command: &str, hc: &ContainerHealthcheck) -> Vec<String> {
    vec![
        "--health-cmd".to_string(),
        command.to_string(),
        "--health-interval".to_string(),
        format!("{}s", hc.interval_secs),
        "--health-timeout".to_string(),
        format!("{}s", hc.timeout_secs),
        "--health-retries".to_string(),
        hc.retries.to_string(),
        "--health-start-period".to_string(),
        format!("{}s", hc.start_period_secs),
    ]
}

fn read_only_mount(source: &camino::Utf8Path, file: &str) -> [String; 2] {
    [
        "--mount".to_string(),
        format!(
            "type=bind,source={source},\
             target={APPLICATION_SSL_DIR}/{file},readonly"
        ),
    ]
}

fn read_only_bind(source: &camino::Utf8Path, target: &str) -> [String; 2] {
    ["--volume".to_string(), format!("{source}:{target}:ro")]
}

/// Lists containers (running or not) named exactly `name`.
pub fn find_container(name: &str) -> Invocation {
    docker().args([
        "ps",
        "--all",
        "--filter",
        format!("name=^{name}$").as_str(),
        "--format",
        "{{.Names}}",
    ])
}

pub fn start_existing_container(name: &str) -> Invocation {
    docker().args(["start", name])
}

pub fn run_storage(layout: &RemoteLayout, req: &StartStorage) -> Invocation {
    let mut inv = docker().args([
        "run",
        "--detach",
        "--name",
        STORAGE_CONTAINER,
        "--restart",
        "always",
        "--network",
        "host",
        "--cap-add",
        "SYS_NICE",
    ]);
    inv = inv
        .arg("--security-opt")
        .arg(format!("seccomp={}", layout.storage_seccomp_profile()))
        .args(["--env", "MYSQL_INITDB_SKIP_TZINFO=true"])
        .args([
            "--env",
            "MYSQL_ROOT_PASSWORD_FILE=/var/run/mysqld/mysql_root_password",
        ])
        .arg("--env")
        .arg(format!("SERVER_ID={}", req.server_id))
        .args(read_only_bind(
            &layout.storage_root_password(),
            "/var/run/mysqld/mysql_root_password",
        ))
        .args(read_only_bind(
            &layout.storage_ca_chain(),
            &format!("{STORAGE_SSL_DIR}/superset_cluster_ca_certificate.pem"),
        ))
        .args(read_only_bind(
            &layout.storage_key(),
            &format!("{STORAGE_SSL_DIR}/mysql_server_key.pem"),
        ))
        .args(read_only_bind(
            &layout.storage_certificate(),
            &format!("{STORAGE_SSL_DIR}/mysql_server_certificate.pem"),
        ))
        .args(healthcheck_args("mysqladmin ping", &req.healthcheck));
    inv.arg(&req.image)
}

/// Runs the credential-storing script in the storage container.  The
/// script prints the resulting login-path file, base64 encoded.
pub fn export_login_bundle(storage_nodes: &[String]) -> Invocation {
    docker()
        .args(["exec", "--user", "root", "--env"])
        .arg(format!("MYSQL_TEST_LOGIN_FILE={LOGIN_FILE_IN_CONTAINER}"))
        .args([STORAGE_CONTAINER, STORE_CREDENTIALS_SCRIPT])
        .args(storage_nodes.iter().cloned())
        .secret_output()
}

/// The environment the router's compose file is interpolated with.
pub fn router_environment(
    req: &StartRouter,
) -> Result<Vec<(String, String)>, ProtocolError> {
    let [primary, first, second] = req.replication_members()?;
    let hc = &req.healthcheck;
    Ok(vec![
        ("VIRTUAL_IP_ADDRESS".to_string(), req.virtual_ip.to_string()),
        ("VIRTUAL_NETWORK_MASK".to_string(), req.mask.to_string()),
        ("VIRTUAL_NETWORK_INTERFACE".to_string(), req.interface.clone()),
        (
            "VIRTUAL_NETWORK".to_string(),
            format!("{}/{}", req.network_address, req.mask),
        ),
        ("PRIMARY_MYSQL_NODE".to_string(), primary.to_string()),
        ("SECONDARY_FIRST_MYSQL_NODE".to_string(), first.to_string()),
        ("SECONDARY_SECOND_MYSQL_NODE".to_string(), second.to_string()),
        ("MYSQL_NODES".to_string(), req.storage_nodes.join(",")),
        (
            "HEALTHCHECK_START_PERIOD".to_string(),
            hc.start_period_secs.to_string(),
        ),
        ("HEALTHCHECK_INTERVAL".to_string(), hc.interval_secs.to_string()),
        ("HEALTHCHECK_TIMEOUT".to_string(), hc.timeout_secs.to_string()),
        ("HEALTHCHECK_RETRIES".to_string(), hc.retries.to_string()),
        ("STATE".to_string(), req.state.vrrp_state().to_string()),
        ("PRIORITY".to_string(), req.priority.to_string()),
    ])
}

fn compose_up(
    layout: &RemoteLayout,
    req: &StartRouter,
    service: &str,
) -> Result<Invocation, ProtocolError> {
    let mut inv = docker()
        .args(["compose", "--file"])
        .arg(layout.router_compose_file().to_string())
        .args(["up", service]);
    if service == COMPOSE_MAIN_SERVICE {
        inv = inv.arg("--detach");
    }
    inv = inv.arg("--quiet-pull");
    for (key, value) in router_environment(req)? {
        inv = inv.env(&key, value);
    }
    Ok(inv)
}

/// Runs the router's one-shot bootstrap container to completion.
pub fn router_init(
    layout: &RemoteLayout,
    req: &StartRouter,
) -> Result<Invocation, ProtocolError> {
    compose_up(layout, req, COMPOSE_INIT_SERVICE)
}

pub fn router_main(
    layout: &RemoteLayout,
    req: &StartRouter,
) -> Result<Invocation, ProtocolError> {
    compose_up(layout, req, COMPOSE_MAIN_SERVICE)
}

pub fn swarm_state() -> Invocation {
    docker().args(["info", "--format", "{{.Swarm.LocalNodeState}}"])
}

pub fn swarm_init(advertise_addr: Ipv4Addr) -> Invocation {
    docker()
        .args(["swarm", "init", "--advertise-addr"])
        .arg(advertise_addr.to_string())
}

pub fn find_network(name: &str) -> Invocation {
    docker().args([
        "network",
        "ls",
        "--filter",
        format!("name=^{name}$").as_str(),
        "--format",
        "{{.Name}}",
    ])
}

pub fn create_overlay_network(name: &str) -> Invocation {
    docker().args([
        "network",
        "create",
        "--driver",
        "overlay",
        "--attachable",
        name,
    ])
}

pub fn run_cache(req: &StartCache) -> Invocation {
    docker()
        .args([
            "run",
            "--detach",
            "--name",
            CACHE_CONTAINER,
            "--hostname",
            CACHE_CONTAINER,
            "--restart",
            "always",
            "--network",
            req.network.as_str(),
        ])
        .args(healthcheck_args("redis-cli ping", &req.healthcheck))
        .arg(&req.image)
}

pub fn find_secret(name: &str) -> Invocation {
    docker().args([
        "secret",
        "ls",
        "--filter",
        format!("name={name}").as_str(),
        "--format",
        "{{.Name}}",
    ])
}

pub fn remove_secret(name: &str) -> Invocation {
    docker().args(["secret", "rm", name])
}

/// Creates a runtime secret from a file, so its value never appears on a
/// command line.
pub fn create_secret(name: &str, path: &camino::Utf8Path) -> Invocation {
    docker().args(["secret", "create", name, path.as_str()])
}

pub fn find_service(name: &str) -> Invocation {
    docker().args([
        "service",
        "ls",
        "--filter",
        format!("name={name}").as_str(),
        "--format",
        "{{.Name}}",
    ])
}

pub fn remove_service(name: &str) -> Invocation {
    docker().args(["service", "rm", name])
}

pub fn create_application_service(
    layout: &RemoteLayout,
    req: &StartApplication,
) -> Invocation {
    let mut inv = docker().args([
        "service",
        "create",
        "--detach",
        "--name",
        APPLICATION_SERVICE,
        "--network",
        req.network.as_str(),
        "--replicas-max-per-node",
        "1",
        "--publish",
        "published=443,target=443",
    ]);
    for secret in &req.secrets {
        inv = inv.args(["--secret", secret.name.as_str()]);
    }
    inv.arg("--env")
        .arg(format!("VIRTUAL_IP_ADDRESS={}", req.virtual_ip))
        .args(read_only_mount(
            &layout.application_certificate(),
            "superset_cluster_certificate.pem",
        ))
        .args(read_only_mount(
            &layout.application_key(),
            "superset_cluster_key.pem",
        ))
        .args(healthcheck_args(
            "curl -f http://localhost:8088/health",
            &req.healthcheck,
        ))
        .arg(&req.image)
}

pub fn inspect_health(container: &str) -> Invocation {
    docker().args([
        "inspect",
        "--format",
        "{{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}",
        container,
    ])
}

pub fn service_tasks(service: &str) -> Invocation {
    docker().args([
        "service",
        "ps",
        "--no-trunc",
        "--format",
        "{{.CurrentState}}",
        service,
    ])
}

pub fn container_logs(container: &str, tail: u32) -> Invocation {
    docker().args(["logs", "--tail", tail.to_string().as_str(), container])
}

pub fn service_logs(service: &str, tail: u32) -> Invocation {
    docker().args([
        "service",
        "logs",
        "--no-trunc",
        "--tail",
        tail.to_string().as_str(),
        service,
    ])
}

/// The router is two containers: its bootstrap container's log explains
/// most start-up failures, so it is collected too.
pub fn router_log_sources() -> [&'static str; 2] {
    [ROUTER_INIT_CONTAINER, ROUTER_CONTAINER]
}

pub fn parse_health_status(output: &str) -> HealthStatus {
    match output.trim() {
        "healthy" => HealthStatus::Healthy,
        "unhealthy" => HealthStatus::Unhealthy,
        "starting" => HealthStatus::Starting,
        _ => HealthStatus::None,
    }
}

/// Reads the state of the newest task from `docker service ps` output,
/// e.g. `Running 5 seconds ago`.
pub fn parse_task_state(output: &str) -> TaskState {
    output
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .map(TaskState::from_runtime)
        .unwrap_or(TaskState::Unknown)
}

/// True if the `--format {{.Name}}` listing contains exactly `name`.
pub fn listing_contains(output: &str, name: &str) -> bool {
    output.lines().any(|line| line.trim() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_common::protocol::{RouterState, SecretFile};

    fn healthcheck() -> ContainerHealthcheck {
        ContainerHealthcheck {
            interval_secs: 5,
            timeout_secs: 10,
            retries: 3,
            start_period_secs: 90,
        }
    }

    fn router() -> StartRouter {
        StartRouter {
            virtual_ip: Ipv4Addr::new(172, 18, 0, 8),
            mask: 16,
            network_address: Ipv4Addr::new(172, 18, 0, 0),
            interface: "eth0".to_string(),
            storage_nodes: vec![
                "node-0".to_string(),
                "node-1".to_string(),
                "node-2".to_string(),
                "node-3".to_string(),
            ],
            state: RouterState::Backup,
            priority: 90,
            healthcheck: healthcheck(),
        }
    }

    #[test]
    fn storage_container() {
        let layout = RemoteLayout::new("/opt/superset-cluster");
        let inv = run_storage(
            &layout,
            &StartStorage {
                image: "mysql-server:latest".to_string(),
                server_id: 7,
                healthcheck: healthcheck(),
            },
        );
        let line = inv.to_string();
        assert!(line.starts_with("docker run --detach --name mysql"));
        assert!(line.contains(
            "seccomp=/opt/superset-cluster/mysql-server/seccomp.json"
        ));
        assert!(line.contains("--env SERVER_ID=7"));
        assert!(line.contains(
            "/opt/superset-cluster/mysql-server/mysql_root_password:\
             /var/run/mysqld/mysql_root_password:ro"
        ));
        assert!(line
            .contains("--health-cmd mysqladmin ping --health-interval 5s"));
        assert!(line.contains("--health-start-period 90s"));
        assert_eq!(
            inv.args.last().map(String::as_str),
            Some("mysql-server:latest")
        );
        assert!(inv.env.is_empty());
    }

    #[test]
    fn router_environment_is_explicit() {
        let layout = RemoteLayout::new("/opt/superset-cluster");
        let inv = router_main(&layout, &router()).unwrap();
        assert_eq!(
            inv.to_string(),
            "docker compose --file \
             /opt/superset-cluster/mysql-mgmt/docker_compose.yml \
             up maincontainer --detach --quiet-pull"
        );
        let env: std::collections::BTreeMap<_, _> =
            inv.env.into_iter().collect();
        assert_eq!(env["STATE"], "BACKUP");
        assert_eq!(env["PRIORITY"], "90");
        assert_eq!(env["VIRTUAL_NETWORK"], "172.18.0.0/16");
        assert_eq!(env["PRIMARY_MYSQL_NODE"], "node-0");
        assert_eq!(env["SECONDARY_FIRST_MYSQL_NODE"], "node-1");
        assert_eq!(env["SECONDARY_SECOND_MYSQL_NODE"], "node-2");
        assert_eq!(env["MYSQL_NODES"], "node-0,node-1,node-2,node-3");
        assert_eq!(env["HEALTHCHECK_START_PERIOD"], "90");

        let init = router_init(&layout, &router()).unwrap();
        assert!(!init.args.contains(&"--detach".to_string()));
    }

    #[test]
    fn router_needs_three_storage_nodes() {
        let layout = RemoteLayout::new("/opt/superset-cluster");
        let mut req = router();
        req.storage_nodes.truncate(2);
        assert_eq!(
            router_init(&layout, &req).unwrap_err(),
            ProtocolError::TooFewStorageNodes { found: 2 }
        );
        assert!(router_environment(&req).is_err());
    }

    #[test]
    fn application_service_uses_secret_references() {
        let layout = RemoteLayout::new("/opt/superset-cluster");
        let inv = create_application_service(
            &layout,
            &StartApplication {
                image: "superset:latest".to_string(),
                network: "superset-network".to_string(),
                virtual_ip: Ipv4Addr::new(10, 0, 0, 5),
                secrets: vec![SecretFile {
                    name: "superset_secret_key".to_string(),
                    path: layout.application_secret("superset_secret_key"),
                }],
                healthcheck: healthcheck(),
            },
        );
        let line = inv.to_string();
        assert!(line.contains("--secret superset_secret_key"));
        assert!(line.contains("--env VIRTUAL_IP_ADDRESS=10.0.0.5"));
        assert!(line.contains("--replicas-max-per-node 1"));
        assert!(line.contains(
            "source=/opt/superset-cluster/superset/superset_cluster_key.pem"
        ));
        assert!(!line.contains("secrets/superset_secret_key"));
    }

    #[test]
    fn login_bundle_output_is_secret() {
        let inv = export_login_bundle(&["a".to_string(), "b".to_string()]);
        assert!(inv.secret_output);
        assert!(inv
            .to_string()
            .ends_with("mysql /opt/store_credentials.exp a b"));
    }

    #[test]
    fn runtime_output_parsing() {
        assert_eq!(parse_health_status("healthy\n"), HealthStatus::Healthy);
        assert_eq!(parse_health_status("starting"), HealthStatus::Starting);
        assert_eq!(parse_health_status("none"), HealthStatus::None);
        assert_eq!(
            parse_task_state("Running 5 seconds ago\nShutdown 1 minute ago"),
            TaskState::Running
        );
        assert_eq!(
            parse_task_state("Preparing 2 seconds ago"),
            TaskState::Preparing
        );
        assert_eq!(parse_task_state(""), TaskState::Unknown);
        assert!(listing_contains("superset-network\n", "superset-network"));
        assert!(!listing_contains("superset-network-2\n", "superset-network"));
    }
}
