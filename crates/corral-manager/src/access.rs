//! Authorization evaluator for one cluster
//!
//! Mirrors the cluster's ClusterRoles and ClusterRoleBindings in memory and
//! answers "may this user do this" without an API round trip. The caches are
//! fed by watchers (see `controllers`); until their first relist completes the
//! evaluator knows nothing and denies everything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule};
use kube::ResourceExt;
use parking_lot::RwLock;

const WILDCARD: &str = "*";

/// The caller of a request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// User name
    pub name: String,
    /// Groups the user belongs to
    pub groups: Vec<String>,
}

impl UserInfo {
    /// Create a user with groups
    pub fn new<I, S>(name: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

/// What the caller wants to do
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceAttributes {
    /// API verb (get, list, create, ...)
    pub verb: String,
    /// API group; empty for the core group
    pub api_group: String,
    /// Plural resource name
    pub resource: String,
}

impl ResourceAttributes {
    /// Attributes for a verb on a resource in an API group
    pub fn new(
        verb: impl Into<String>,
        api_group: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            verb: verb.into(),
            api_group: api_group.into(),
            resource: resource.into(),
        }
    }
}

#[derive(Clone, Debug)]
struct Binding {
    role: String,
    users: Vec<String>,
    groups: Vec<String>,
}

impl Binding {
    fn from_object(binding: &ClusterRoleBinding) -> Option<Self> {
        if binding.role_ref.kind != "ClusterRole" {
            return None;
        }
        let mut users = Vec::new();
        let mut groups = Vec::new();
        for subject in binding.subjects.iter().flatten() {
            match subject.kind.as_str() {
                "User" => users.push(subject.name.clone()),
                "Group" => groups.push(subject.name.clone()),
                "ServiceAccount" => users.push(format!(
                    "system:serviceaccount:{}:{}",
                    subject.namespace.as_deref().unwrap_or_default(),
                    subject.name
                )),
                _ => {}
            }
        }
        Some(Self {
            role: binding.role_ref.name.clone(),
            users,
            groups,
        })
    }

    fn applies_to(&self, user: &UserInfo) -> bool {
        self.users.iter().any(|u| u == &user.name)
            || self.groups.iter().any(|g| user.groups.contains(g))
    }
}

fn matches(values: Option<&Vec<String>>, wanted: &str) -> bool {
    values
        .map(|vs| vs.iter().any(|v| v == WILDCARD || v == wanted))
        .unwrap_or(false)
}

fn rule_allows(rule: &PolicyRule, attrs: &ResourceAttributes) -> bool {
    let verb_ok = rule
        .verbs
        .iter()
        .any(|v| v == WILDCARD || v == &attrs.verb);
    verb_ok
        && matches(rule.api_groups.as_ref(), &attrs.api_group)
        && matches(rule.resources.as_ref(), &attrs.resource)
}

/// RBAC evaluator over one cluster's cluster-scoped roles
#[derive(Debug, Default)]
pub struct AccessControl {
    roles: RwLock<HashMap<String, Vec<PolicyRule>>>,
    bindings: RwLock<HashMap<String, Binding>>,
    synced: AtomicBool,
}

impl AccessControl {
    /// Create an empty evaluator
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a ClusterRole
    pub fn apply_role(&self, role: &ClusterRole) {
        self.roles
            .write()
            .insert(role.name_any(), role.rules.clone().unwrap_or_default());
    }

    /// Forget a ClusterRole
    pub fn delete_role(&self, name: &str) {
        self.roles.write().remove(name);
    }

    /// Replace every ClusterRole after a relist
    pub fn replace_roles(&self, roles: impl IntoIterator<Item = ClusterRole>) {
        let fresh = roles
            .into_iter()
            .map(|r| (r.name_any(), r.rules.unwrap_or_default()))
            .collect();
        *self.roles.write() = fresh;
    }

    /// Insert or update a ClusterRoleBinding
    pub fn apply_binding(&self, binding: &ClusterRoleBinding) {
        let name = binding.name_any();
        match Binding::from_object(binding) {
            Some(b) => {
                self.bindings.write().insert(name, b);
            }
            None => {
                self.bindings.write().remove(&name);
            }
        }
    }

    /// Forget a ClusterRoleBinding
    pub fn delete_binding(&self, name: &str) {
        self.bindings.write().remove(name);
    }

    /// Replace every ClusterRoleBinding after a relist
    pub fn replace_bindings(&self, bindings: impl IntoIterator<Item = ClusterRoleBinding>) {
        let fresh = bindings
            .into_iter()
            .filter_map(|b| Binding::from_object(&b).map(|parsed| (b.name_any(), parsed)))
            .collect();
        *self.bindings.write() = fresh;
    }

    /// Mark the caches as populated
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// Whether both caches have completed a relist
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Names of the ClusterRoles bound to the user, sorted
    pub fn roles_for(&self, user: &UserInfo) -> Vec<String> {
        let mut roles: Vec<String> = self
            .bindings
            .read()
            .values()
            .filter(|b| b.applies_to(user))
            .map(|b| b.role.clone())
            .collect();
        roles.sort_unstable();
        roles.dedup();
        roles
    }

    /// Whether any bound role allows the request
    pub fn can(&self, user: &UserInfo, attrs: &ResourceAttributes) -> bool {
        if !self.is_synced() {
            return false;
        }
        let role_names = self.roles_for(user);
        let roles = self.roles.read();
        role_names
            .iter()
            .filter_map(|name| roles.get(name))
            .flatten()
            .any(|rule| rule_allows(rule, attrs))
    }
}
