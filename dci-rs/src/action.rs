//! Action resolution for resource modules.
//!
//! A module invocation carries a bag of parameters. Which of them are
//! supplied decides whether the caller wants to list, get, create, update
//! or delete a resource. [`resolve`] encodes that decision; it is total and
//! free of side effects. Checking that the chosen action has what it needs
//! (a `name` to create, ...) is left to the module layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Key holding the desired lifecycle state of the resource.
pub const STATE_KEY: &str = "state";
/// Value of [`STATE_KEY`] requesting removal.
pub const ABSENT: &str = "absent";
/// Key holding the resource identifier.
pub const ID_KEY: &str = "id";

/// Parameters of one module invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, Value>);

impl ParameterSet {
    pub fn new() -> Self {
        ParameterSet::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// The value of `key`, if it is [present](is_present).
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| is_present(v))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Truthiness of a boolean-ish parameter: present and not `false`.
    pub fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.as_str(), "true" | "yes" | "1"),
            Some(_) => true,
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        ParameterSet(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Whether a parameter value counts as supplied: not null, and not an
/// empty string, list or object. `false` and `0` are supplied values.
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Keys that never take part in the decision: authentication, paging and
/// embedding hints, free-text search and the lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedKeys(BTreeSet<String>);

impl ExcludedKeys {
    pub fn standard() -> Self {
        ExcludedKeys::from_keys([
            "dci_login",
            "dci_password",
            "dci_cs_url",
            "dci_client_id",
            "dci_api_secret",
            "embed",
            "mime",
            STATE_KEY,
            "where",
            "query",
            "sort",
            "limit",
            "active",
            "has_pre_release_access",
        ])
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExcludedKeys(keys.into_iter().map(Into::into).collect())
    }

    /// Add resource-specific keys on top of this set.
    pub fn extend<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }
}

impl Default for ExcludedKeys {
    fn default() -> Self {
        ExcludedKeys::standard()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedAction {
    List,
    Get,
    Update,
    Create,
    Delete,
}

/// Pick the action intended by `params`. First matching rule wins:
///
/// 1. `state` is `absent` → [`Delete`](ResolvedAction::Delete)
/// 2. no determining key → [`List`](ResolvedAction::List)
/// 3. only `id` → [`Get`](ResolvedAction::Get)
/// 4. `id` and something else → [`Update`](ResolvedAction::Update)
/// 5. anything else → [`Create`](ResolvedAction::Create)
pub fn resolve(params: &ParameterSet, excluded: &ExcludedKeys) -> ResolvedAction {
    if params.0.get(STATE_KEY).and_then(Value::as_str) == Some(ABSENT) {
        return ResolvedAction::Delete;
    }

    let determining: BTreeSet<&str> = params
        .0
        .iter()
        .filter(|(k, v)| !excluded.contains(k) && is_present(v))
        .map(|(k, _)| k.as_str())
        .collect();

    if determining.is_empty() {
        ResolvedAction::List
    } else if determining.len() == 1 && determining.contains(ID_KEY) {
        ResolvedAction::Get
    } else if determining.contains(ID_KEY) {
        ResolvedAction::Update
    } else {
        ResolvedAction::Create
    }
}

/// Actions of the job module, refined from a [`ResolvedAction`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JobAction {
    Standard(ResolvedAction),
    /// Record a jobstate on the job.
    Status,
    SetKeyValue,
    SetTags,
    /// Schedule an update job succeeding this one.
    JobUpdate,
    /// Schedule an upgrade job succeeding this one.
    Upgrade,
    /// Create a job letting the server pick its components.
    Schedule,
}

impl JobAction {
    pub fn from_params(params: &ParameterSet) -> Self {
        // `update`, `upgrade` and `key`/`value` are instructions rather than
        // fields of the job.
        let excluded = ExcludedKeys::standard().extend(["update", "upgrade", "value"]);
        let action = resolve(params, &excluded);
        let lineage = params.flag("update") || params.flag("upgrade");
        match action {
            ResolvedAction::Get if lineage => {
                if params.flag("upgrade") {
                    JobAction::Upgrade
                } else {
                    JobAction::JobUpdate
                }
            }
            // Tags take precedence over a lineage request, and an upgrade
            // over an update.
            ResolvedAction::Update => {
                if params.contains("status") {
                    JobAction::Status
                } else if params.contains("key") {
                    JobAction::SetKeyValue
                } else if params.get("tags").is_some_and(is_present) {
                    JobAction::SetTags
                } else if params.flag("upgrade") {
                    JobAction::Upgrade
                } else if params.flag("update") {
                    JobAction::JobUpdate
                } else {
                    JobAction::Standard(ResolvedAction::Update)
                }
            }
            ResolvedAction::Create
                if !params.contains("components") && !params.contains("components_by_query") =>
            {
                JobAction::Schedule
            }
            other => JobAction::Standard(other),
        }
    }
}

/// Actions of the topic module, refined from a [`ResolvedAction`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TopicAction {
    Standard(ResolvedAction),
    AttachTeam,
}

impl TopicAction {
    pub fn from_params(params: &ParameterSet) -> Self {
        match resolve(params, &ExcludedKeys::standard()) {
            ResolvedAction::Update if params.contains("team_ids") => TopicAction::AttachTeam,
            other => TopicAction::Standard(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn resolve_std(params: &ParameterSet) -> ResolvedAction {
        resolve(params, &ExcludedKeys::standard())
    }

    #[test]
    fn test_resolve_scenarios() {
        assert_eq!(resolve_std(&ParameterSet::new()), ResolvedAction::List);
        assert_eq!(
            resolve_std(&ParameterSet::new().with("id", "abc")),
            ResolvedAction::Get
        );
        assert_eq!(
            resolve_std(&ParameterSet::new().with("id", "abc").with("name", "x")),
            ResolvedAction::Update
        );
        assert_eq!(
            resolve_std(&ParameterSet::new().with("name", "x")),
            ResolvedAction::Create
        );
        assert_eq!(
            resolve_std(&ParameterSet::new().with("id", "abc").with("state", "absent")),
            ResolvedAction::Delete
        );
    }

    #[test]
    fn test_where_clause_still_lists() {
        let params = ParameterSet::new().with("where", "label:PRODUCT_OWNER");
        assert_eq!(resolve_std(&params), ResolvedAction::List);
    }

    #[test]
    fn test_excluded_keys_never_change_the_result() {
        let bases = [
            ParameterSet::new(),
            ParameterSet::new().with("id", "abc"),
            ParameterSet::new().with("id", "abc").with("name", "x"),
            ParameterSet::new().with("name", "x"),
        ];
        let noise = [
            json!(null),
            json!(""),
            json!("value"),
            json!(true),
            json!(["a"]),
            json!({"k": 1}),
        ];
        for base in &bases {
            let expected = resolve_std(base);
            for key in ["dci_login", "embed", "where", "query", "active", "mime"] {
                for value in &noise {
                    let params = base.clone().with(key, value.clone());
                    assert_eq!(resolve_std(&params), expected, "{key}={value}");
                }
            }
        }
    }

    #[test]
    fn test_state_present_is_not_delete() {
        let params = ParameterSet::new().with("id", "abc").with("state", "present");
        assert_eq!(resolve_std(&params), ResolvedAction::Get);
    }

    #[test]
    fn test_empty_values_are_absent() {
        let params = ParameterSet::new()
            .with("id", "abc")
            .with("name", "")
            .with("tags", json!([]))
            .with("data", json!({}))
            .with("comment", Value::Null);
        assert_eq!(resolve_std(&params), ResolvedAction::Get);

        let params = ParameterSet::new().with("name", "").with("team_id", Value::Null);
        assert_eq!(resolve_std(&params), ResolvedAction::List);
    }

    #[test]
    fn test_false_counts_as_supplied() {
        let params = ParameterSet::new().with("id", "abc").with("export_control", false);
        assert_eq!(resolve_std(&params), ResolvedAction::Update);
    }

    #[test]
    fn test_custom_exclusions() {
        let excluded = ExcludedKeys::standard().extend(["dest"]);
        let params = ParameterSet::new().with("id", "abc").with("dest", "/tmp");
        assert_eq!(resolve(&params, &excluded), ResolvedAction::Get);
        assert_eq!(resolve_std(&params), ResolvedAction::Update);
    }

    #[test]
    fn test_job_actions() {
        let job = |p: ParameterSet| JobAction::from_params(&p);

        assert_eq!(
            job(ParameterSet::new().with("id", "j").with("status", "success")),
            JobAction::Status
        );
        assert_eq!(
            job(ParameterSet::new()
                .with("id", "j")
                .with("key", "answer")
                .with("value", 42.0)),
            JobAction::SetKeyValue
        );
        assert_eq!(
            job(ParameterSet::new().with("id", "j").with("upgrade", true)),
            JobAction::Upgrade
        );
        assert_eq!(
            job(ParameterSet::new().with("id", "j").with("update", true)),
            JobAction::JobUpdate
        );
        assert_eq!(
            job(ParameterSet::new().with("id", "j").with("update", false)),
            JobAction::Standard(ResolvedAction::Get)
        );
        assert_eq!(
            job(ParameterSet::new().with("id", "j").with("tags", json!(["ci"]))),
            JobAction::SetTags
        );
        assert_eq!(
            job(ParameterSet::new()
                .with("id", "j")
                .with("upgrade", true)
                .with("tags", json!(["ci"]))),
            JobAction::SetTags
        );
        assert_eq!(
            job(ParameterSet::new()
                .with("id", "j")
                .with("update", true)
                .with("upgrade", true)),
            JobAction::Upgrade
        );
        assert_eq!(
            job(ParameterSet::new().with("topic", "OSP16")),
            JobAction::Schedule
        );
        assert_eq!(
            job(ParameterSet::new()
                .with("topic", "OSP16")
                .with("components", json!(["c1"]))),
            JobAction::Standard(ResolvedAction::Create)
        );
        assert_eq!(
            job(ParameterSet::new().with("id", "j").with("state", "absent")),
            JobAction::Standard(ResolvedAction::Delete)
        );
    }

    #[test]
    fn test_topic_attach_team() {
        let params = ParameterSet::new()
            .with("id", "t")
            .with("team_ids", json!(["a", "b"]));
        assert_eq!(TopicAction::from_params(&params), TopicAction::AttachTeam);
        let params = ParameterSet::new().with("id", "t").with("name", "new");
        assert_eq!(
            TopicAction::from_params(&params),
            TopicAction::Standard(ResolvedAction::Update)
        );
    }
}
