use std::cmp::Ordering;
use std::time::Duration;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeId};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration shared by the coordinator, the query façade and the
/// bundled stores.
#[derive(Clone, Debug)]
pub struct ForestConfig {
    entity_name: String,
    table_name: String,
    id_column: String,
    tie_break: TieBreak,
    default_delete_mode: DeleteMode,
    include_roots_as_siblings: bool,
    lock_timeout: Duration,
    advisory_lock_strategy: AdvisoryLockStrategy,
}

impl ForestConfig {
    /// Create a configuration for the logical entity and the table backing it.
    pub fn new(entity_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        let entity_name = entity_name.into();
        let table_name = table_name.into();

        let default_lock = AdvisoryLockStrategy::Namespaced(AdvisoryLockKey::derived_from(
            &entity_name,
            &table_name,
        ));

        Self {
            entity_name,
            table_name,
            id_column: "id".to_string(),
            tie_break: TieBreak::default(),
            default_delete_mode: DeleteMode::default(),
            include_roots_as_siblings: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            advisory_lock_strategy: default_lock,
        }
    }

    /// Merge options produced by [`ForestOptions`].
    pub(crate) fn apply_options(mut self, options: ForestOptions) -> Self {
        if let Some(id_column) = options.id_column {
            self.id_column = id_column;
        }
        if let Some(tie_break) = options.tie_break {
            self.tie_break = tie_break;
        }
        if let Some(mode) = options.default_delete_mode {
            self.default_delete_mode = mode;
        }
        if let Some(include) = options.include_roots_as_siblings {
            self.include_roots_as_siblings = include;
        }
        if let Some(millis) = options.lock_timeout_ms {
            self.lock_timeout = Duration::from_millis(millis);
        }
        if let Some(strategy) = options.advisory_lock_strategy {
            self.advisory_lock_strategy = strategy;
        }
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Column holding the node id; its serial sequence allocates new ids.
    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    /// Rule ordering siblings that share a priority.
    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Mode used by [`delete_default`](crate::coordinator::MutationCoordinator::delete_default).
    pub fn default_delete_mode(&self) -> DeleteMode {
        self.default_delete_mode
    }

    /// Whether roots count as each other's siblings.
    pub fn include_roots_as_siblings(&self) -> bool {
        self.include_roots_as_siblings
    }

    /// Upper bound on waiting for tree locks.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Advisory lock strategy (PostgreSQL store only).
    pub fn advisory_lock_strategy(&self) -> &AdvisoryLockStrategy {
        &self.advisory_lock_strategy
    }

    /// Sibling ordering: ascending priority, then the configured id rule.
    pub fn sibling_order(&self, a: &Node, b: &Node) -> Ordering {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| self.tie_break.compare(a.id(), b.id()))
    }
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self::new("node", "nodes")
    }
}

/// Builder-style options, also loadable with serde.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForestOptions {
    id_column: Option<String>,
    tie_break: Option<TieBreak>,
    default_delete_mode: Option<DeleteMode>,
    include_roots_as_siblings: Option<bool>,
    lock_timeout_ms: Option<u64>,
    advisory_lock_strategy: Option<AdvisoryLockStrategy>,
}

impl ForestOptions {
    pub fn id_column(mut self, value: impl Into<String>) -> Self {
        self.id_column = Some(value.into());
        self
    }

    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = Some(tie_break);
        self
    }

    pub fn default_delete_mode(mut self, mode: DeleteMode) -> Self {
        self.default_delete_mode = Some(mode);
        self
    }

    pub fn include_roots_as_siblings(mut self, include: bool) -> Self {
        self.include_roots_as_siblings = Some(include);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn advisory_lock_strategy(mut self, strategy: AdvisoryLockStrategy) -> Self {
        self.advisory_lock_strategy = Some(strategy);
        self
    }

    pub fn apply(self, base: ForestConfig) -> ForestConfig {
        base.apply_options(self)
    }
}

/// How siblings with equal priority are ordered.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    IdAscending,
    IdDescending,
}

impl TieBreak {
    pub fn compare(self, a: NodeId, b: NodeId) -> Ordering {
        match self {
            TieBreak::IdAscending => a.cmp(&b),
            TieBreak::IdDescending => b.cmp(&a),
        }
    }
}

/// What happens to the subtree of a deleted node.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Remove the node and everything below it.
    #[default]
    Cascade,
    /// Hand the node's children to its parent, after the existing siblings.
    ReparentChildrenToGrandparent,
}

/// Key used for PostgreSQL advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdvisoryLockKey(String);

impl AdvisoryLockKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn derived_from(entity: &str, table: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(entity.as_bytes());
        hasher.update(b"/");
        hasher.update(table.as_bytes());
        let crc = hasher.finalize();
        Self(format!("closure-forest::{entity}::{table}::{crc:x}"))
    }
}

/// Configuration describing how to acquire advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryLockStrategy {
    Disabled,
    Namespaced(AdvisoryLockKey),
}

impl AdvisoryLockStrategy {
    pub fn key(&self) -> Option<&AdvisoryLockKey> {
        match self {
            AdvisoryLockStrategy::Disabled => None,
            AdvisoryLockStrategy::Namespaced(key) => Some(key),
        }
    }
}
