//! Generate load on a test cluster: many namespaces with a few services each
use std::collections::BTreeMap;

use clap::Parser;
use k8s_openapi::{
    api::core::v1::{
        Container, Namespace, Node, ObjectReference, Pod, PodSpec, Secret, Service, ServiceAccount,
        ServicePort, ServiceSpec,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ByteString,
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;
use tokio::time::Instant;
use tracing::{info, warn};

const NS_PREFIX: &str = "lns-";
const NODE_NAME: &str = "node1";
const SERVICE_ACCOUNT: &str = "default";
const TOKEN_SECRET: &str = "default-token";

#[derive(Parser, Debug)]
#[command(name = "loader")]
struct Args {
    /// Namespaces to converge on, named `lns-<i>`
    #[arg(long, default_value_t = 3000)]
    namespaces: usize,

    /// Services to create in every namespace, named `svc-<i>-<j>`
    #[arg(long, default_value_t = 1)]
    services_per_namespace: usize,

    /// Target a bare apiserver without controllers: also create a node and a running pod per namespace
    #[arg(long)]
    local: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let client = kubelite::client::connect().await?;

    if let Err(err) = ensure_namespaces(&client, &args).await {
        warn!(error = %err, "failed to converge namespaces");
    }
    ensure_services(&client, args.namespaces, args.services_per_namespace).await;
    Ok(())
}

async fn ensure_namespaces(client: &Client, args: &Args) -> anyhow::Result<()> {
    let started = Instant::now();
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let all = namespaces.list(&ListParams::default()).await?;
    let existing = all
        .items
        .iter()
        .filter(|ns| ns.name_any().starts_with(NS_PREFIX))
        .count();
    info!(total = all.items.len(), desired = args.namespaces, existing, elapsed = ?started.elapsed(), "namespaces");

    if args.local {
        let nodes: Api<Node> = Api::all(client.clone());
        let node = Node {
            metadata: ObjectMeta {
                name: Some(NODE_NAME.into()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        };
        if let Err(err) = nodes.create(&PostParams::default(), &node).await {
            warn!(error = %err, "failed to create node");
        }
    }

    let started = Instant::now();
    if existing < args.namespaces {
        for i in existing..args.namespaces {
            let name = format!("{NS_PREFIX}{i}");
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    labels: Some(BTreeMap::from([("istio-injection".to_string(), "enabled".to_string())])),
                    ..ObjectMeta::default()
                },
                ..Namespace::default()
            };
            namespaces.create(&PostParams::default(), &ns).await?;
            if args.local {
                create_service_account(client, &name).await;
                create_running_pod(client, &name).await;
            }
        }
        info!(elapsed = ?started.elapsed(), "created namespaces");
    } else if existing > args.namespaces {
        let dp = DeleteParams::foreground().grace_period(1);
        for i in args.namespaces..existing {
            let name = format!("{NS_PREFIX}{i}");
            if let Err(err) = namespaces.delete(&name, &dp).await {
                warn!(namespace = %name, error = %err, "failed to delete namespace");
            }
        }
        info!(elapsed = ?started.elapsed(), "deleted namespaces");
    }
    Ok(())
}

/// Without a token controller, ServiceAccount admission rejects pods until the
/// account and its token secret exist
async fn create_service_account(client: &Client, namespace: &str) {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(TOKEN_SECRET.into()),
            annotations: Some(BTreeMap::from([
                ("kubernetes.io/service-account.name".to_string(), SERVICE_ACCOUNT.to_string()),
                ("kubernetes.io/service-account.uid".to_string(), "1".to_string()),
            ])),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/service-account-token".into()),
        data: Some(BTreeMap::from([("token".to_string(), ByteString(b"1".to_vec()))])),
        ..Secret::default()
    };
    if let Err(err) = secrets.create(&PostParams::default(), &secret).await {
        warn!(%namespace, error = %err, "failed to create token secret");
    }

    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(SERVICE_ACCOUNT.into()),
            annotations: Some(BTreeMap::from([(
                "kubernetes.io/enforce-mountable-secrets".to_string(),
                "false".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        secrets: Some(vec![ObjectReference {
            name: Some(TOKEN_SECRET.into()),
            uid: Some("1".into()),
            ..ObjectReference::default()
        }]),
        ..ServiceAccount::default()
    };
    if let Err(err) = accounts.create(&PostParams::default(), &account).await {
        warn!(%namespace, error = %err, "failed to create service account");
    }
}

/// Without a scheduler or kubelet, pods only get an IP and phase if we set them
async fn create_running_pod(client: &Client, namespace: &str) {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = Pod {
        metadata: ObjectMeta {
            name: Some("default".into()),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            service_account_name: Some(SERVICE_ACCOUNT.into()),
            node_name: Some(NODE_NAME.into()),
            automount_service_account_token: Some(false),
            containers: vec![Container {
                name: "test".into(),
                image: Some("ubuntu".into()),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        status: None,
    };
    if let Err(err) = pods.create(&PostParams::default(), &pod).await {
        warn!(%namespace, error = %err, "failed to create pod");
        return;
    }
    let status = Patch::Merge(json!({
        "status": { "podIP": "10.0.1.1", "hostIP": "10.11.1.1", "phase": "Running" }
    }));
    if let Err(err) = pods.patch_status("default", &PatchParams::default(), &status).await {
        warn!(%namespace, error = %err, "failed to update pod status");
    }
}

/// Best-effort: create failures (usually "already exists") are ignored
async fn ensure_services(client: &Client, namespaces: usize, per_namespace: usize) {
    let started = Instant::now();
    let mut failed = 0;
    for i in 0..namespaces {
        let services: Api<Service> = Api::namespaced(client.clone(), &format!("{NS_PREFIX}{i}"));
        for j in 0..per_namespace {
            let svc = Service {
                metadata: ObjectMeta {
                    name: Some(format!("svc-{i}-{j}")),
                    ..ObjectMeta::default()
                },
                spec: Some(ServiceSpec {
                    ports: Some(vec![ServicePort {
                        name: Some("http-main".into()),
                        port: 80,
                        protocol: Some("TCP".into()),
                        ..ServicePort::default()
                    }]),
                    ..ServiceSpec::default()
                }),
                status: None,
            };
            if services.create(&PostParams::default(), &svc).await.is_err() {
                failed += 1;
            }
        }
    }
    info!(elapsed = ?started.elapsed(), failed, "services");
}
