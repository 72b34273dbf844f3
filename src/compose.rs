//! Builds a [`StackSpec`] from a [`StackConfig`].
//!
//! Composition is pure: the same config always yields the same graph, and nothing is
//! read from the filesystem or the network while composing.

use crate::{
    config::StackConfig,
    error::ValidationError,
    spec::{
        AccessRule, ClusterSpec, ContainerSpec, ImageRef, ImageSource, LoadBalancerSpec,
        LogConfig, NetworkSpec, PortMapping, Protocol, ResourceLimits, ResourceName,
        ScalingPolicy, SecurityGroupSpec, ServiceSpec, StackSpec, TaskSpec,
    },
};

/// Compose and validate the whole graph.
pub fn compose(config: &StackConfig) -> Result<StackSpec, ValidationError> {
    if config.app_port == 0 || config.listener_port == 0 {
        return Err(ValidationError::ZeroPort);
    }

    let resources = ResourceLimits {
        cpu: config.cpu,
        memory_mib: config.memory_mib,
    };

    let network = network(config);
    let cluster = cluster(config, &network);
    let task = task(config, resources);
    let security_group = security_group(config, &network);
    let service = service(config, &cluster, &task, &security_group, resources);
    let scaling = scaling(config, &service);

    let stack = StackSpec {
        name: config.name.as_str().into(),
        network,
        cluster,
        task,
        security_group,
        service,
        scaling,
    };
    stack.validate()?;
    Ok(stack)
}

fn named(config: &StackConfig, suffix: &str) -> ResourceName {
    format!("{}{}", config.name, suffix).into()
}

fn network(config: &StackConfig) -> NetworkSpec {
    NetworkSpec {
        name: named(config, "Vpc"),
        max_azs: config.max_azs,
    }
}

fn cluster(config: &StackConfig, network: &NetworkSpec) -> ClusterSpec {
    ClusterSpec {
        name: named(config, "ECSCluster"),
        container_insights: config.container_insights,
        network: network.name.clone(),
    }
}

fn image(config: &StackConfig) -> ImageRef {
    match &config.image {
        Some(reference) => ImageRef::Registry(reference.clone()),
        None => ImageRef::Asset(ImageSource {
            directory: config.build_context.clone(),
            file: config.build_file.clone(),
        }),
    }
}

fn task(config: &StackConfig, resources: ResourceLimits) -> TaskSpec {
    let container = ContainerSpec {
        name: named(config, "Container"),
        image: image(config),
        logging: LogConfig {
            stream_prefix: config.log_stream_prefix.clone(),
        },
        port_mappings: vec![PortMapping {
            container_port: config.app_port,
            protocol: Protocol::Tcp,
        }],
    };
    TaskSpec {
        name: named(config, "TaskDefinition"),
        resources,
        containers: vec![container],
    }
}

fn security_group(config: &StackConfig, network: &NetworkSpec) -> SecurityGroupSpec {
    SecurityGroupSpec {
        name: named(config, "-security-group"),
        description: format!("{} Security Group", config.name),
        network: network.name.clone(),
        allow_all_outbound: config.allow_all_outbound,
        ingress: vec![AccessRule::tcp_from_anywhere(config.app_port)],
    }
}

fn service(
    config: &StackConfig,
    cluster: &ClusterSpec,
    task: &TaskSpec,
    security_group: &SecurityGroupSpec,
    resources: ResourceLimits,
) -> ServiceSpec {
    ServiceSpec {
        name: named(config, "Service"),
        cluster: cluster.name.clone(),
        task: task.name.clone(),
        desired_count: config.desired_count,
        resources,
        load_balancer: LoadBalancerSpec {
            public: config.public_load_balancer,
            listener_port: config.listener_port,
            health_check_path: config.health_check_path.clone(),
        },
        security_groups: vec![security_group.name.clone()],
    }
}

fn scaling(config: &StackConfig, service: &ServiceSpec) -> ScalingPolicy {
    ScalingPolicy {
        name: named(config, "CpuScaling"),
        service: service.name.clone(),
        min_capacity: config.min_capacity,
        max_capacity: config.max_capacity,
        target_utilization_percent: config.target_utilization_percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ANY_IPV4;

    #[test]
    fn composing_twice_is_identical() {
        let config = StackConfig::default();
        let a = compose(&config).unwrap();
        let b = compose(&config).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn defaults_match_reference_stack() {
        let stack = compose(&StackConfig::default()).unwrap();

        let desired = stack.service.desired_count;
        assert!((1..=2).contains(&desired));
        assert_eq!(stack.scaling.min_capacity, 1);
        assert_eq!(stack.scaling.max_capacity, 2);
        assert_eq!(stack.scaling.target_utilization_percent, 70);

        assert_eq!(
            stack.security_group.ingress,
            vec![AccessRule {
                peer: ANY_IPV4.to_string(),
                protocol: Protocol::Tcp,
                port: 3000,
            }]
        );

        let limits = ResourceLimits {
            cpu: 256,
            memory_mib: 512,
        };
        assert_eq!(stack.task.resources, limits);
        assert_eq!(stack.service.resources, limits);
        assert!(stack.service.load_balancer.public);
        assert!(stack.cluster.container_insights);
        assert_eq!(stack.network.max_azs, 2);
        assert_eq!(stack.cluster.name.as_str(), "NextJsFargateECSCluster");
    }

    #[test]
    fn access_rule_port_matches_every_container_port() {
        for port in [80, 3000, 8080, 65535] {
            let config = StackConfig {
                app_port: port,
                ..StackConfig::default()
            };
            let stack = compose(&config).unwrap();
            for container in &stack.task.containers {
                for mapping in &container.port_mappings {
                    assert!(stack
                        .security_group
                        .ingress
                        .iter()
                        .all(|rule| rule.port == mapping.container_port));
                }
            }
            assert_eq!(stack.app_port(), Some(port));
        }
    }

    #[test]
    fn inverted_capacity_fails() {
        let config = StackConfig {
            min_capacity: 3,
            max_capacity: 2,
            desired_count: 2,
            ..StackConfig::default()
        };
        assert_eq!(
            compose(&config),
            Err(ValidationError::CapacityBounds { min: 3, max: 2 })
        );
    }

    #[test]
    fn desired_count_outside_bounds_fails() {
        let config = StackConfig {
            desired_count: 5,
            ..StackConfig::default()
        };
        assert_eq!(
            compose(&config),
            Err(ValidationError::DesiredOutOfBounds {
                desired: 5,
                min: 1,
                max: 2
            })
        );
    }

    #[test]
    fn bad_utilization_target_fails() {
        for target in [0, 101] {
            let config = StackConfig {
                target_utilization_percent: target,
                ..StackConfig::default()
            };
            assert_eq!(
                compose(&config),
                Err(ValidationError::UtilizationTarget(target))
            );
        }
    }

    #[test]
    fn zero_listener_port_fails() {
        let config = StackConfig {
            listener_port: 0,
            ..StackConfig::default()
        };
        assert_eq!(compose(&config), Err(ValidationError::ZeroPort));
    }

    #[test]
    fn zero_port_fails() {
        let config = StackConfig {
            app_port: 0,
            ..StackConfig::default()
        };
        assert_eq!(compose(&config), Err(ValidationError::ZeroPort));
    }

    #[test]
    fn build_context_only_changes_image_source() {
        let base = compose(&StackConfig::default()).unwrap();
        let moved = compose(&StackConfig {
            build_context: "../elsewhere".into(),
            ..StackConfig::default()
        })
        .unwrap();

        assert_ne!(base, moved);
        assert_eq!(
            moved.task.containers[0].image,
            ImageRef::Asset(ImageSource {
                directory: "../elsewhere".into(),
                file: "Dockerfile".into(),
            })
        );

        // put the original image back and everything else must be unchanged
        let mut restored = moved.clone();
        restored.task.containers[0].image = base.task.containers[0].image.clone();
        assert_eq!(restored, base);
    }

    #[test]
    fn registry_image_skips_build() {
        let stack = compose(&StackConfig {
            image: Some("nginx:1.25".into()),
            ..StackConfig::default()
        })
        .unwrap();
        assert_eq!(
            stack.task.containers[0].image,
            ImageRef::Registry("nginx:1.25".into())
        );
    }
}
