//! Built-in repair rule table and target name maps.
//!
//! Rules are evaluated in order; the first pattern that equals or prefixes the
//! check name wins. The allow-lists are the only targets any command may touch.

use crate::types::{ProblemType, RepairAction, RepairLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairRule {
    pub pattern: &'static str,
    pub problem_type: ProblemType,
    pub level: RepairLevel,
    pub action: RepairAction,
}

impl RepairRule {
    const fn new(
        pattern: &'static str,
        problem_type: ProblemType,
        level: RepairLevel,
        action: RepairAction,
    ) -> Self {
        Self {
            pattern,
            problem_type,
            level,
            action,
        }
    }

    pub fn matches(&self, check_name: &str) -> bool {
        let prefix = self.pattern.trim_end_matches('*');
        check_name == self.pattern || check_name.starts_with(prefix)
    }
}

use ProblemType as P;
use RepairAction as A;
use RepairLevel as L;

pub static REPAIR_RULES: &[RepairRule] = &[
    // Services
    RepairRule::new("Service:app-gateway", P::ServiceDown, L::Auto, A::RestartService),
    RepairRule::new("Service:app-telegram", P::ServiceDown, L::Auto, A::RestartService),
    RepairRule::new("Service:app-monitoring", P::ServiceDown, L::Auto, A::RestartService),
    RepairRule::new("Service:app-repair", P::ServiceDown, L::Auto, A::RestartService),
    // Containers
    RepairRule::new("Docker:app-postgres", P::ContainerDown, L::Auto, A::RestartContainer),
    RepairRule::new("Docker:app-redis", P::ContainerDown, L::Auto, A::RestartContainer),
    RepairRule::new("Docker:app-webui", P::ContainerDown, L::Auto, A::RestartContainer),
    // Core dependencies
    RepairRule::new("Redis", P::DependencyDown, L::Auto, A::RestartContainer),
    RepairRule::new("PostgreSQL", P::DependencyDown, L::Auto, A::RestartContainer),
    RepairRule::new("Gateway API", P::GatewayError, L::Auto, A::RestartService),
    // Resources
    RepairRule::new("Disk", P::DiskFull, L::Auto, A::CleanupDisk),
    RepairRule::new("CPU", P::HighCpu, L::Auto, A::LogAndWait),
    RepairRule::new("RAM", P::HighRam, L::Auto, A::LogAndWait),
];

/// Check names with this prefix belong to dispatcher agents.
pub const AGENT_CHECK_PREFIX: &str = "Agent:";

static SERVICE_MAP: &[(&str, &str)] = &[
    ("Service:app-gateway", "app-gateway"),
    ("Service:app-telegram", "app-telegram"),
    ("Service:app-monitoring", "app-monitoring"),
    ("Service:app-repair", "app-repair"),
    ("Gateway API", "app-gateway"),
];

static CONTAINER_MAP: &[(&str, &str)] = &[
    ("Docker:app-postgres", "app-postgres"),
    ("Docker:app-redis", "app-redis"),
    ("Docker:app-webui", "app-webui"),
    ("Redis", "app-redis"),
    ("PostgreSQL", "app-postgres"),
];

pub const ALLOWED_SERVICES: &[&str] = &[
    "app-gateway",
    "app-telegram",
    "app-monitoring",
    "app-repair",
];

pub const ALLOWED_CONTAINERS: &[&str] = &["app-postgres", "app-redis", "app-webui"];

pub fn find_rule(check_name: &str) -> Option<&'static RepairRule> {
    REPAIR_RULES.iter().find(|r| r.matches(check_name))
}

pub fn service_for_check(check_name: &str) -> Option<&'static str> {
    lookup(SERVICE_MAP, check_name)
}

pub fn container_for_check(check_name: &str) -> Option<&'static str> {
    lookup(CONTAINER_MAP, check_name)
}

pub fn is_allowed_service(name: &str) -> bool {
    ALLOWED_SERVICES.contains(&name)
}

pub fn is_allowed_container(name: &str) -> bool {
    ALLOWED_CONTAINERS.contains(&name)
}

fn lookup(map: &[(&str, &'static str)], check_name: &str) -> Option<&'static str> {
    map.iter()
        .find(|(check, _)| *check == check_name)
        .map(|(_, target)| *target)
}
