//! Role- and policy-based access control.
//!
//! Authorization is deny-by-default and two-layered:
//! 1. role permissions — dotted permission strings attached to roles, with
//!    `*` matching exactly one dotted segment;
//! 2. policies — richer allow/deny rules over resources, actions, entity
//!    include/exclude lists and typed conditions.
//!
//! Unknown condition types and unknown operators evaluate false. That
//! fail-closed default is safety-relevant and must not be relaxed.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use regennexus_core::{Json, unix_seconds};

/// Checks a permission string against a pattern where `*` matches within a
/// single dotted segment (`sensor.*:read` matches `sensor.temp:read` but
/// not `sensor.outdoor.temp:read`).
pub fn match_permission(pattern: &str, permission: &str) -> bool {
    if pattern == permission {
        return true;
    }
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let value_segments: Vec<&str> = permission.split('.').collect();
    if pattern_segments.len() != value_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(value_segments.iter())
        .all(|(pattern, value)| segment_glob(pattern, value))
}

/// Glob match within one dot-free segment; `*` matches any run of
/// characters, including an empty one.
fn segment_glob(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// Whether a policy allows or denies what it matches. A matching deny rule
/// always wins over matching allow rules.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

/// Entity scoping of a policy: either a flat allow-list or explicit
/// include/exclude lists.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EntityConstraint {
    List(Vec<String>),
    Scoped {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exclude: Option<Vec<String>>,
    },
}

impl EntityConstraint {
    fn admits(&self, entity_id: &str) -> bool {
        match self {
            EntityConstraint::List(list) => list.iter().any(|e| e == entity_id),
            EntityConstraint::Scoped { include, exclude } => {
                if let Some(include) = include
                    && !include.iter().any(|e| e == entity_id)
                {
                    return false;
                }
                if let Some(exclude) = exclude
                    && exclude.iter().any(|e| e == entity_id)
                {
                    return false;
                }
                true
            }
        }
    }
}

/// Comparison operator for attribute conditions.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    In,
    Contains,
}

/// A typed policy condition. Anything that deserializes into
/// [`Condition::Unknown`] evaluates false.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Requires the evaluation time to fall inside `[start_time, end_time]`.
    TimeRange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
    },
    /// Requires the caller's IP to fall inside at least one CIDR range.
    IpRange { allowed_ips: Vec<String> },
    /// Compares an entity attribute from the evaluation context.
    Attribute {
        attribute: String,
        value: Json,
        #[serde(default)]
        operator: Operator,
    },
    /// Forward-compatibility catch-all; always evaluates false.
    #[serde(untagged)]
    Unknown(Json),
}

/// Context supplied to policy evaluation.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    /// Evaluation time override; defaults to now.
    pub current_time: Option<u64>,
    /// Caller address, for `ip_range` conditions.
    pub client_ip: Option<IpAddr>,
    /// Attributes of the acting entity, for `attribute` conditions.
    pub entity_attributes: BTreeMap<String, Json>,
}

impl AccessContext {
    pub fn with_time(mut self, current_time: u64) -> Self {
        self.current_time = Some(current_time);
        self
    }

    pub fn with_client_ip(mut self, client_ip: IpAddr) -> Self {
        self.client_ip = Some(client_ip);
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>, value: Json) -> Self {
        self.entity_attributes.insert(attribute.into(), value);
        self
    }
}

impl Condition {
    fn evaluate(&self, ctx: &AccessContext) -> bool {
        match self {
            Condition::TimeRange {
                start_time,
                end_time,
            } => {
                let now = ctx.current_time.unwrap_or_else(unix_seconds);
                if let Some(start) = start_time
                    && now < *start
                {
                    return false;
                }
                if let Some(end) = end_time
                    && now > *end
                {
                    return false;
                }
                true
            }
            Condition::IpRange { allowed_ips } => {
                let Some(client_ip) = ctx.client_ip else {
                    return false;
                };
                allowed_ips
                    .iter()
                    .any(|range| cidr_contains(range, client_ip))
            }
            Condition::Attribute {
                attribute,
                value,
                operator,
            } => {
                let actual = ctx
                    .entity_attributes
                    .get(attribute)
                    .cloned()
                    .unwrap_or(Json::Null);
                match operator {
                    Operator::Eq => &actual == value,
                    Operator::Ne => &actual != value,
                    Operator::Gt => match (actual.as_f64(), value.as_f64()) {
                        (Some(actual), Some(value)) => actual > value,
                        _ => false,
                    },
                    Operator::Lt => match (actual.as_f64(), value.as_f64()) {
                        (Some(actual), Some(value)) => actual < value,
                        _ => false,
                    },
                    Operator::In => value
                        .as_array()
                        .map(|candidates| candidates.contains(&actual))
                        .unwrap_or(false),
                    Operator::Contains => match (&actual, value) {
                        (Json::String(actual), Json::String(needle)) => actual.contains(needle),
                        (Json::Array(actual), needle) => actual.contains(needle),
                        _ => false,
                    },
                }
            }
            Condition::Unknown(raw) => {
                log::warn!(condition = raw.to_string(); "unknown condition type, failing closed");
                false
            }
        }
    }
}

/// Checks whether an address falls inside a CIDR range (or equals a bare
/// address). Malformed ranges and mixed address families never match.
fn cidr_contains(range: &str, address: IpAddr) -> bool {
    let (base, bits) = match range.split_once('/') {
        Some((base, bits)) => {
            let Ok(bits) = bits.parse::<u32>() else {
                return false;
            };
            (base, Some(bits))
        }
        None => (range, None),
    };
    let Ok(base) = base.parse::<IpAddr>() else {
        return false;
    };

    match (base, address) {
        (IpAddr::V4(base), IpAddr::V4(address)) => {
            let bits = bits.unwrap_or(32);
            if bits > 32 {
                return false;
            }
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            u32::from(base) & mask == u32::from(address) & mask
        }
        (IpAddr::V6(base), IpAddr::V6(address)) => {
            let bits = bits.unwrap_or(128);
            if bits > 128 {
                return false;
            }
            let mask = if bits == 0 {
                0
            } else {
                u128::MAX << (128 - bits)
            };
            u128::from(base) & mask == u128::from(address) & mask
        }
        _ => false,
    }
}

/// A richer allow/deny rule. Absent `resources` / `actions` match anything;
/// list entries may use single-segment wildcards, and the entry `*` matches
/// everything.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Policy {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<EntityConstraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub effect: Effect,
}

impl Policy {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resources: None,
            actions: None,
            entities: None,
            conditions: Vec::new(),
            effect: Effect::Allow,
        }
    }

    fn matches(&self, entity_id: &str, resource: &str, action: &str, ctx: &AccessContext) -> bool {
        if let Some(resources) = &self.resources
            && !list_matches(resources, resource)
        {
            return false;
        }
        if let Some(actions) = &self.actions
            && !list_matches(actions, action)
        {
            return false;
        }
        if let Some(entities) = &self.entities
            && !entities.admits(entity_id)
        {
            return false;
        }
        self.conditions.iter().all(|c| c.evaluate(ctx))
    }
}

fn list_matches(list: &[String], value: &str) -> bool {
    list.iter()
        .any(|entry| entry == "*" || match_permission(entry, value))
}

/// Role assignment, permission checks and policy evaluation.
pub struct PolicyEngine {
    policies: RwLock<BTreeMap<String, Policy>>,
    entity_roles: RwLock<HashMap<String, BTreeSet<String>>>,
    role_permissions: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(BTreeMap::new()),
            entity_roles: RwLock::new(HashMap::new()),
            role_permissions: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_policy(&self, policy: Policy) {
        log::info!(policy = policy.id.as_str(); "policy added");
        self.policies.write().insert(policy.id.clone(), policy);
    }

    pub fn remove_policy(&self, policy_id: &str) {
        if self.policies.write().remove(policy_id).is_some() {
            log::info!(policy = policy_id; "policy removed");
        }
    }

    pub fn assign_role(&self, entity_id: &str, role: &str) {
        self.entity_roles
            .write()
            .entry(entity_id.to_string())
            .or_default()
            .insert(role.to_string());
        log::info!(entity = entity_id, role = role; "role assigned");
    }

    pub fn revoke_role(&self, entity_id: &str, role: &str) {
        if let Some(roles) = self.entity_roles.write().get_mut(entity_id) {
            roles.remove(role);
        }
    }

    pub fn define_role_permissions<I, S>(&self, role: &str, permissions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.role_permissions.write().insert(
            role.to_string(),
            permissions.into_iter().map(Into::into).collect(),
        );
    }

    /// All permissions an entity holds through its roles.
    pub fn entity_permissions(&self, entity_id: &str) -> BTreeSet<String> {
        let roles = self.entity_roles.read();
        let permissions = self.role_permissions.read();
        roles
            .get(entity_id)
            .into_iter()
            .flatten()
            .filter_map(|role| permissions.get(role))
            .flatten()
            .cloned()
            .collect()
    }

    /// Whether the entity holds a permission, literally or through a
    /// single-segment wildcard grant.
    pub fn check_permission(&self, entity_id: &str, permission: &str) -> bool {
        self.entity_permissions(entity_id)
            .iter()
            .any(|granted| match_permission(granted, permission))
    }

    /// Evaluates access of `entity_id` to `(resource, action)`: first the
    /// synthesized `resource:action` permission, then the policy table.
    /// Deny-by-default; a matching deny policy always wins.
    pub fn evaluate(
        &self,
        entity_id: &str,
        resource: &str,
        action: &str,
        ctx: &AccessContext,
    ) -> bool {
        let permission = format!("{resource}:{action}");
        if self.check_permission(entity_id, &permission) {
            return true;
        }

        let policies = self.policies.read();
        let mut allowed = false;
        for policy in policies.values() {
            if policy.matches(entity_id, resource, action, ctx) {
                match policy.effect {
                    Effect::Deny => {
                        log::debug!(entity = entity_id, policy = policy.id.as_str(); "denied by policy");
                        return false;
                    }
                    Effect::Allow => allowed = true,
                }
            }
        }
        allowed
    }
}
