use std::{collections::BTreeMap, fmt::Debug};

use crate::{
    config::KubeNamespace,
    docker::ResolvedImages,
    engine::{apply_in_order, ApplyError, LiveState, ProvisioningEngine, ResourceId},
    spec::{ImageRef, StackSpec},
};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        autoscaling::v2::{
            CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
            MetricSpec, MetricTarget, ResourceMetricSource,
        },
        core::v1::{
            Container, ContainerPort, HTTPGetAction, Namespace, PodSpec, PodTemplateSpec, Probe,
            ResourceRequirements, Service, ServicePort, ServiceSpec, TopologySpreadConstraint,
        },
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer,
            NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
    },
};
use kube::{
    api::{Patch, PatchParams},
    core::ObjectMeta,
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

const FIELD_MANAGER: &str = "webstack";
const ZONE_KEY: &str = "topology.kubernetes.io/zone";

/// Everything one stack turns into, in apply order.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    Namespace(Namespace),
    NetworkPolicy(NetworkPolicy),
    Deployment(Deployment),
    Service(Service),
    Autoscaler(HorizontalPodAutoscaler),
}

impl Manifest {
    fn meta(&self) -> &ObjectMeta {
        match self {
            Manifest::Namespace(r) => r.meta(),
            Manifest::NetworkPolicy(r) => r.meta(),
            Manifest::Deployment(r) => r.meta(),
            Manifest::Service(r) => r.meta(),
            Manifest::Autoscaler(r) => r.meta(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Manifest::Namespace(_) => "Namespace",
            Manifest::NetworkPolicy(_) => "NetworkPolicy",
            Manifest::Deployment(_) => "Deployment",
            Manifest::Service(_) => "Service",
            Manifest::Autoscaler(_) => "HorizontalPodAutoscaler",
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.kind(), self.meta().name.clone().unwrap_or_default())
    }

    async fn apply(&self, client: &Client, namespace: &KubeNamespace) -> anyhow::Result<()> {
        let ns = namespace.as_str();
        match self {
            Manifest::Namespace(r) => server_side_apply(Api::all(client.clone()), r).await,
            Manifest::NetworkPolicy(r) => {
                server_side_apply(Api::namespaced(client.clone(), ns), r).await
            }
            Manifest::Deployment(r) => {
                server_side_apply(Api::namespaced(client.clone(), ns), r).await
            }
            Manifest::Service(r) => server_side_apply(Api::namespaced(client.clone(), ns), r).await,
            Manifest::Autoscaler(r) => {
                server_side_apply(Api::namespaced(client.clone(), ns), r).await
            }
        }
    }
}

/// Render a stack as kubernetes objects. Every container needs an entry in `images`.
pub fn render(
    stack: &StackSpec,
    namespace: &KubeNamespace,
    images: &ResolvedImages,
) -> anyhow::Result<Vec<Manifest>> {
    stack.validate()?;
    let app_port = stack.app_port().context("stack has no application port")?;
    let service_name = dns_label(stack.service.name.as_str());
    let selector: BTreeMap<String, String> = [
        ("app.kubernetes.io/name".to_string(), service_name.clone()),
        ("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string()),
    ]
    .into();
    let meta = |name: &str| ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.as_str().to_string()),
        labels: Some(selector.clone()),
        ..Default::default()
    };

    let mut ns_labels: BTreeMap<String, String> = [
        ("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string()),
        ("webstack/cluster".to_string(), dns_label(stack.cluster.name.as_str())),
    ]
    .into();
    if stack.cluster.container_insights {
        ns_labels.insert("webstack/monitoring".to_string(), "enabled".to_string());
    }
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.as_str().to_string()),
            labels: Some(ns_labels),
            ..Default::default()
        },
        ..Default::default()
    };

    let policy_name = dns_label(stack.security_group.name.as_str());
    let policy = network_policy(stack, meta(&policy_name), &selector);
    let deployment = deployment(stack, meta(&service_name), &selector, images)?;
    let service = load_balancer(stack, meta(&service_name), &selector, app_port);
    let autoscaler = autoscaler(stack, meta(&service_name), &service_name)?;

    Ok(vec![
        Manifest::Namespace(ns),
        Manifest::NetworkPolicy(policy),
        Manifest::Deployment(deployment),
        Manifest::Service(service),
        Manifest::Autoscaler(autoscaler),
    ])
}

fn network_policy(
    stack: &StackSpec,
    metadata: ObjectMeta,
    selector: &BTreeMap<String, String>,
) -> NetworkPolicy {
    let sg = &stack.security_group;
    let ingress = sg
        .ingress
        .iter()
        .map(|rule| NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                ip_block: Some(IPBlock {
                    cidr: rule.peer.clone(),
                    except: None,
                }),
                ..Default::default()
            }]),
            ports: Some(vec![NetworkPolicyPort {
                port: Some(IntOrString::Int(rule.port.into())),
                protocol: Some(rule.protocol.as_str().to_string()),
                ..Default::default()
            }]),
        })
        .collect();

    // an Egress policy type without egress rules denies all outbound traffic
    let mut policy_types = vec!["Ingress".to_string()];
    if !sg.allow_all_outbound {
        policy_types.push("Egress".to_string());
    }

    let mut metadata = metadata;
    metadata.annotations =
        Some([("webstack/description".to_string(), sg.description.clone())].into());

    NetworkPolicy {
        metadata,
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(selector.clone()),
                match_expressions: None,
            },
            policy_types: Some(policy_types),
            ingress: Some(ingress),
            egress: None,
        }),
        ..Default::default()
    }
}

fn deployment(
    stack: &StackSpec,
    metadata: ObjectMeta,
    selector: &BTreeMap<String, String>,
    images: &ResolvedImages,
) -> anyhow::Result<Deployment> {
    let limits: BTreeMap<String, Quantity> = [
        ("cpu".to_string(), Quantity(format!("{}m", millicores(stack.task.resources.cpu)))),
        (
            "memory".to_string(),
            Quantity(format!("{}Mi", stack.task.resources.memory_mib)),
        ),
    ]
    .into();
    let lb = &stack.service.load_balancer;

    let mut containers = Vec::new();
    let mut pod_annotations = BTreeMap::new();
    let mut seen = BTreeMap::new();
    for spec in &stack.task.containers {
        let name = dns_label(spec.name.as_str());
        if let Some(other) = seen.insert(name.clone(), &spec.name) {
            anyhow::bail!(
                "containers {other} and {} both render as kubernetes container {name}",
                spec.name
            );
        }
        let image = images
            .get(&spec.name)
            .with_context(|| format!("no image resolved for container {}", spec.name))?;
        let ports: Vec<ContainerPort> = spec
            .port_mappings
            .iter()
            .map(|m| ContainerPort {
                container_port: m.container_port.into(),
                protocol: Some(m.protocol.as_str().to_string()),
                ..Default::default()
            })
            .collect();
        let readiness_probe = spec.port_mappings.first().map(|m| Probe {
            http_get: Some(HTTPGetAction {
                path: Some(lb.health_check_path.clone()),
                port: IntOrString::Int(m.container_port.into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        pod_annotations.insert(
            format!("webstack/log-stream-prefix.{name}"),
            spec.logging.stream_prefix.clone(),
        );
        containers.push(Container {
            name,
            image: Some(image.clone()),
            // built images are content addressed and only exist locally
            image_pull_policy: match spec.image {
                ImageRef::Asset(_) => Some("IfNotPresent".to_string()),
                ImageRef::Registry(_) => None,
            },
            ports: Some(ports),
            readiness_probe,
            resources: Some(ResourceRequirements {
                limits: Some(limits.clone()),
                requests: Some(limits.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let pod_spec = PodSpec {
        containers,
        topology_spread_constraints: Some(vec![TopologySpreadConstraint {
            max_skew: 1,
            topology_key: ZONE_KEY.to_string(),
            when_unsatisfiable: "ScheduleAnyway".to_string(),
            label_selector: Some(LabelSelector {
                match_labels: Some(selector.clone()),
                match_expressions: None,
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let mut metadata = metadata;
    metadata.annotations = Some(
        [
            ("webstack/task".to_string(), stack.task.name.to_string()),
            ("webstack/network".to_string(), stack.network.name.to_string()),
            ("webstack/max-azs".to_string(), stack.network.max_azs.to_string()),
        ]
        .into(),
    );

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(to_i32(stack.service.desired_count, "desired count")?),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector.clone()),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn load_balancer(
    stack: &StackSpec,
    metadata: ObjectMeta,
    selector: &BTreeMap<String, String>,
    app_port: u16,
) -> Service {
    let lb = &stack.service.load_balancer;
    let ports = vec![ServicePort {
        name: Some("http".to_string()),
        port: lb.listener_port.into(),
        target_port: Some(IntOrString::Int(app_port.into())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some(if lb.public { "LoadBalancer" } else { "ClusterIP" }.to_string()),
            selector: Some(selector.clone()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn autoscaler(
    stack: &StackSpec,
    metadata: ObjectMeta,
    deployment: &str,
) -> anyhow::Result<HorizontalPodAutoscaler> {
    let scaling = &stack.scaling;
    Ok(HorizontalPodAutoscaler {
        metadata,
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: deployment.to_string(),
            },
            min_replicas: Some(to_i32(scaling.min_capacity, "min capacity")?),
            max_replicas: to_i32(scaling.max_capacity, "max capacity")?,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(to_i32(
                            scaling.target_utilization_percent,
                            "utilization target",
                        )?),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            behavior: None,
        }),
        status: None,
    })
}

/// 1024 cpu units make one core.
fn millicores(cpu_units: u32) -> u64 {
    u64::from(cpu_units) * 1000 / 1024
}

fn to_i32(n: u32, what: &str) -> anyhow::Result<i32> {
    i32::try_from(n).with_context(|| format!("{what} {n} does not fit a kubernetes int32"))
}

/// object names must be DNS-1123 labels
fn dns_label(name_for_humans: &str) -> String {
    let mut s: String = name_for_humans
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .take(61)
        .collect();
    if !s.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        s = format!("a{}", s);
    };
    if !s.ends_with(|c: char| c.is_ascii_alphanumeric()) {
        s = format!("{}a", s);
    };
    s
}

/// Print manifests as a multi document yaml stream.
pub fn to_yaml(manifests: &[Manifest]) -> anyhow::Result<String> {
    let mut out = String::new();
    for manifest in manifests {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(manifest)?);
    }
    Ok(out)
}

/// Applies stacks to the cluster of the current kube context.
pub struct KubeEngine {
    client: Client,
    namespace: KubeNamespace,
}

impl KubeEngine {
    pub async fn try_default(namespace: KubeNamespace) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client, namespace })
    }
}

#[async_trait]
impl ProvisioningEngine for KubeEngine {
    async fn apply(
        &self,
        stack: &StackSpec,
        images: &ResolvedImages,
    ) -> Result<LiveState, ApplyError> {
        let manifests = match render(stack, &self.namespace, images) {
            Ok(manifests) => manifests,
            Err(cause) => {
                return Err(ApplyError {
                    partial: LiveState::default(),
                    failed: ResourceId::new("Stack", stack.name.to_string()),
                    cause,
                })
            }
        };
        info!(namespace = ?self.namespace, resources = manifests.len(), "applying stack");

        apply_in_order(&manifests, Manifest::id, |manifest| {
            let manifest = manifest.clone();
            let client = self.client.clone();
            let namespace = self.namespace.clone();
            async move { manifest.apply(&client, &namespace).await }
        })
        .await
    }
}

/// Dry run first so a rejected object leaves nothing behind, then apply for real.
async fn server_side_apply<K>(api: Api<K>, resource: &K) -> anyhow::Result<()>
where
    K: Clone + DeserializeOwned + Serialize + Debug + Resource,
    <K as kube::Resource>::DynamicType: Default,
{
    let name = resource.meta().name.as_ref().context("resource is unnamed")?;

    for patch_params in [
        PatchParams {
            dry_run: true,
            force: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
            field_validation: None,
        },
        PatchParams {
            dry_run: false,
            force: true,
            field_manager: Some(FIELD_MANAGER.to_string()),
            field_validation: None,
        },
    ] {
        debug!(%name, dry_run = patch_params.dry_run, "patching");
        api.patch(name, &patch_params, &Patch::Apply(resource.clone()))
            .await?;
    }

    Ok(())
}
