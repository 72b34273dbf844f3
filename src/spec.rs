//! The spec graph: a declarative description of the infrastructure that should exist.
//!
//! Entities refer to each other by [`ResourceName`]. Nothing here talks to a cloud or a
//! cluster; see [`crate::engine`] for that.

use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Matches any IPv4 source address.
pub const ANY_IPV4: &str = "0.0.0.0/0";

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for ResourceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An isolated address space with subnets spread over several availability zones.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkSpec {
    pub name: ResourceName,
    pub max_azs: u32,
}

/// Compute limits shared by a task and the service that runs it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceLimits {
    /// 1024 units is one vCPU.
    pub cpu: u32,
    pub memory_mib: u32,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    pub name: ResourceName,
    pub resources: ResourceLimits,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContainerSpec {
    pub name: ResourceName,
    pub image: ImageRef,
    pub logging: LogConfig,
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImageRef {
    /// Built from local sources at deploy time.
    Asset(ImageSource),
    /// Already published, pulled as is.
    Registry(String),
}

/// A container image that can be built from a directory.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImageSource {
    pub directory: PathBuf,
    /// Relative to `directory`.
    pub file: PathBuf,
}

/// Standard output and error are shipped to the log aggregator under `stream_prefix`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LogConfig {
    pub stream_prefix: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterSpec {
    pub name: ResourceName,
    /// Forward cluster level resource metrics to the monitoring sink.
    pub container_insights: bool,
    pub network: ResourceName,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SecurityGroupSpec {
    pub name: ResourceName,
    pub description: String,
    pub network: ResourceName,
    pub allow_all_outbound: bool,
    pub ingress: Vec<AccessRule>,
}

/// Permits inbound traffic from `peer` on `port`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AccessRule {
    pub peer: String,
    pub protocol: Protocol,
    pub port: u16,
}

impl AccessRule {
    pub fn tcp_from_anywhere(port: u16) -> Self {
        Self {
            peer: ANY_IPV4.to_string(),
            protocol: Protocol::Tcp,
            port,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoadBalancerSpec {
    /// Internet facing when true, internal otherwise.
    pub public: bool,
    pub listener_port: u16,
    pub health_check_path: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceSpec {
    pub name: ResourceName,
    pub cluster: ResourceName,
    pub task: ResourceName,
    pub desired_count: u32,
    pub resources: ResourceLimits,
    pub load_balancer: LoadBalancerSpec,
    pub security_groups: Vec<ResourceName>,
}

/// Bounds and trigger for the external autoscaling loop.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScalingPolicy {
    pub name: ResourceName,
    pub service: ResourceName,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub target_utilization_percent: u32,
}

/// The complete graph for one stack.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StackSpec {
    pub name: ResourceName,
    pub network: NetworkSpec,
    pub cluster: ClusterSpec,
    pub task: TaskSpec,
    pub security_group: SecurityGroupSpec,
    pub service: ServiceSpec,
    pub scaling: ScalingPolicy,
}

impl StackSpec {
    /// Check the cross-entity invariants of the graph.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.check_references()?;

        if self.network.max_azs == 0 {
            return Err(ValidationError::NoZones(self.network.name.to_string()));
        }
        if self.task.containers.is_empty() {
            return Err(ValidationError::EmptyTask(self.task.name.to_string()));
        }

        // the task and the service must agree on limits
        if self.task.resources != self.service.resources {
            return Err(ValidationError::ResourceMismatch {
                task: self.task.name.to_string(),
                service: self.service.name.to_string(),
                task_cpu: self.task.resources.cpu,
                task_memory: self.task.resources.memory_mib,
                service_cpu: self.service.resources.cpu,
                service_memory: self.service.resources.memory_mib,
            });
        }

        self.check_ports()?;

        let ScalingPolicy {
            min_capacity: min,
            max_capacity: max,
            target_utilization_percent: target,
            ..
        } = self.scaling;
        if min > max {
            return Err(ValidationError::CapacityBounds { min, max });
        }
        let desired = self.service.desired_count;
        if desired < min || desired > max {
            return Err(ValidationError::DesiredOutOfBounds { desired, min, max });
        }
        if !(1..=100).contains(&target) {
            return Err(ValidationError::UtilizationTarget(target));
        }

        Ok(())
    }

    fn check_references(&self) -> Result<(), ValidationError> {
        let dangling = |from: &ResourceName, kind: &'static str, name: &ResourceName| {
            ValidationError::DanglingReference {
                from: from.to_string(),
                kind,
                name: name.to_string(),
            }
        };

        if self.cluster.network != self.network.name {
            return Err(dangling(&self.cluster.name, "network", &self.cluster.network));
        }
        if self.security_group.network != self.network.name {
            return Err(dangling(
                &self.security_group.name,
                "network",
                &self.security_group.network,
            ));
        }
        if self.service.cluster != self.cluster.name {
            return Err(dangling(&self.service.name, "cluster", &self.service.cluster));
        }
        if self.service.task != self.task.name {
            return Err(dangling(&self.service.name, "task", &self.service.task));
        }
        if let Some(sg) = self
            .service
            .security_groups
            .iter()
            .find(|sg| **sg != self.security_group.name)
        {
            return Err(dangling(&self.service.name, "security group", sg));
        }
        if self.scaling.service != self.service.name {
            return Err(dangling(&self.scaling.name, "service", &self.scaling.service));
        }
        Ok(())
    }

    /// A stack serves one application port: exactly one access rule admits it and every
    /// container port mapping uses it.
    fn check_ports(&self) -> Result<(), ValidationError> {
        if self.service.load_balancer.listener_port == 0 {
            return Err(ValidationError::ZeroPort);
        }

        let port = match self.security_group.ingress.as_slice() {
            [rule] => rule.port,
            rules => return Err(ValidationError::AccessRuleCount(rules.len())),
        };
        if port == 0 {
            return Err(ValidationError::ZeroPort);
        }

        for container in &self.task.containers {
            for mapping in &container.port_mappings {
                if mapping.container_port != port {
                    return Err(ValidationError::PortMismatch {
                        container: container.name.to_string(),
                        container_port: mapping.container_port,
                        admitted: vec![port],
                    });
                }
            }
        }

        let exposed = self
            .task
            .containers
            .iter()
            .any(|c| !c.port_mappings.is_empty());
        if !exposed {
            return Err(ValidationError::UnusedAccessRule { port });
        }

        Ok(())
    }

    /// The port admitted by the access rule, if there is exactly one.
    pub fn app_port(&self) -> Option<u16> {
        match self.security_group.ingress.as_slice() {
            [rule] => Some(rule.port),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compose::compose, config::StackConfig};

    fn stack() -> StackSpec {
        compose(&StackConfig::default()).unwrap()
    }

    #[test]
    fn composed_stack_is_valid() {
        assert_eq!(stack().validate(), Ok(()));
    }

    #[test]
    fn diverging_resources_are_rejected() {
        let mut s = stack();
        s.service.resources.memory_mib = 1024;
        assert!(matches!(
            s.validate(),
            Err(ValidationError::ResourceMismatch {
                task_memory: 512,
                service_memory: 1024,
                ..
            })
        ));
    }

    #[test]
    fn container_port_must_be_admitted() {
        let mut s = stack();
        s.task.containers[0].port_mappings[0].container_port = 8080;
        assert_eq!(
            s.validate(),
            Err(ValidationError::PortMismatch {
                container: "NextJsFargateContainer".into(),
                container_port: 8080,
                admitted: vec![3000],
            })
        );
    }

    #[test]
    fn access_rule_must_lead_somewhere() {
        let mut s = stack();
        s.task.containers[0].port_mappings.clear();
        assert_eq!(
            s.validate(),
            Err(ValidationError::UnusedAccessRule { port: 3000 })
        );
    }

    #[test]
    fn only_one_application_port() {
        // a second container on its own port, with a rule to match
        let mut s = stack();
        let mut sidecar = s.task.containers[0].clone();
        sidecar.name = "Sidecar".into();
        sidecar.port_mappings[0].container_port = 8080;
        s.task.containers.push(sidecar);
        s.security_group.ingress.push(AccessRule::tcp_from_anywhere(8080));
        assert_eq!(s.validate(), Err(ValidationError::AccessRuleCount(2)));

        // the same port admitted twice
        let mut s = stack();
        s.security_group.ingress.push(AccessRule::tcp_from_anywhere(3000));
        assert_eq!(s.validate(), Err(ValidationError::AccessRuleCount(2)));

        // nothing admitted at all
        let mut s = stack();
        s.security_group.ingress.clear();
        assert_eq!(s.validate(), Err(ValidationError::AccessRuleCount(0)));
        assert_eq!(s.app_port(), None);

        // a second container sharing the one port is fine
        let mut s = stack();
        let mut sidecar = s.task.containers[0].clone();
        sidecar.name = "Sidecar".into();
        s.task.containers.push(sidecar);
        assert_eq!(s.validate(), Ok(()));
        assert_eq!(s.app_port(), Some(3000));
    }

    #[test]
    fn zero_listener_port_is_rejected() {
        let mut s = stack();
        s.service.load_balancer.listener_port = 0;
        assert_eq!(s.validate(), Err(ValidationError::ZeroPort));
    }

    #[test]
    fn dangling_references_are_rejected() {
        let mut s = stack();
        s.service.cluster = "SomeOtherCluster".into();
        assert_eq!(
            s.validate(),
            Err(ValidationError::DanglingReference {
                from: "NextJsFargateService".into(),
                kind: "cluster",
                name: "SomeOtherCluster".into(),
            })
        );

        let mut s = stack();
        s.scaling.service = "Nope".into();
        assert!(matches!(
            s.validate(),
            Err(ValidationError::DanglingReference { kind: "service", .. })
        ));
    }

    #[test]
    fn empty_task_is_rejected() {
        let mut s = stack();
        s.task.containers.clear();
        assert_eq!(
            s.validate(),
            Err(ValidationError::EmptyTask("NextJsFargateTaskDefinition".into()))
        );
    }

    #[test]
    fn json_round_trip_keeps_validity() {
        let s = stack();
        let json = serde_json::to_string_pretty(&s).unwrap();
        assert!(json.contains("\"asset\""));
        assert!(json.contains("\"TCP\""));
        let back: StackSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert_eq!(back.validate(), Ok(()));
    }
}
