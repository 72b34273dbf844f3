use thiserror::Error;

/// An inconsistency detected while composing or checking a stack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(
        "container {container} exposes port {container_port} \
         but the access rules only admit {admitted:?}"
    )]
    PortMismatch {
        container: String,
        container_port: u16,
        admitted: Vec<u16>,
    },
    #[error("a stack has exactly one access rule for its application port, found {0}")]
    AccessRuleCount(usize),
    #[error("access rule admits port {port} which no container exposes")]
    UnusedAccessRule { port: u16 },
    #[error("application port must be non-zero")]
    ZeroPort,
    #[error("scaling bounds are inverted: min_capacity {min} > max_capacity {max}")]
    CapacityBounds { min: u32, max: u32 },
    #[error("desired count {desired} is outside the scaling bounds [{min}, {max}]")]
    DesiredOutOfBounds { desired: u32, min: u32, max: u32 },
    #[error(
        "task {task} declares cpu {task_cpu} / memory {task_memory}MiB but service {service} \
         declares cpu {service_cpu} / memory {service_memory}MiB"
    )]
    ResourceMismatch {
        task: String,
        service: String,
        task_cpu: u32,
        task_memory: u32,
        service_cpu: u32,
        service_memory: u32,
    },
    #[error("{from} references {kind} {name}, which is not part of the stack")]
    DanglingReference {
        from: String,
        kind: &'static str,
        name: String,
    },
    #[error("cpu utilization target must be within 1..=100, got {0}")]
    UtilizationTarget(u32),
    #[error("task {0} has no containers")]
    EmptyTask(String),
    #[error("network {0} must span at least one availability zone")]
    NoZones(String),
}
