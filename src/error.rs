/// Error types for the tessera kernel.
///
/// This module provides the exhaustive error hierarchy for every fallible
/// kernel operation. All errors are well-typed and identify the offending
/// entity so callers (and transports built on top of the kernel) can render
/// precise messages without re-deriving context.
use thiserror::Error;

/// The unified error type for kernel operations.
///
/// All fallible kernel operations return `Result<T, KernelError>`. Validation
/// and business-rule failures are surfaced unchanged; underlying store
/// failures are wrapped in `StoreError` with the original message attached.
/// Retries are never automatic — every multi-tessella operation is
/// transactional, so a failure here never leaves partial state behind.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A res, genus, taxonomy, workspace, branch, or action could not be
    /// found by id or name.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// What sort of thing was being looked up (e.g. "res", "genus").
        kind: &'static str,
        /// The id or name that was looked up.
        id: String,
    },

    /// A name collision occurred on create/define.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// What sort of thing collided.
        kind: &'static str,
        /// The colliding name.
        name: String,
    },

    /// A define/evolve call failed schema validation.
    #[error("schema invalid: {reason}")]
    SchemaInvalid {
        /// Description of the validation failure.
        reason: String,
    },

    /// An `evolve_genus` call attempted to remove or retype an existing
    /// element instead of adding to it.
    #[error("evolution of genus '{genus_id}' is non-additive: {reason}")]
    EvolutionNonAdditive {
        /// The genus being evolved.
        genus_id: String,
        /// Why the diff was rejected.
        reason: String,
    },

    /// Creation was blocked because the genus is deprecated.
    #[error("genus '{genus_id}' is deprecated")]
    GenusDeprecated {
        /// The deprecated genus.
        genus_id: String,
    },

    /// Creation was blocked because the owning taxonomy/science is archived.
    #[error("taxonomy '{taxonomy_id}' is archived")]
    TaxonomyArchived {
        /// The archived taxonomy.
        taxonomy_id: String,
    },

    /// A direct status transition was attempted that is not an edge in the
    /// genus's transition graph.
    #[error("no direct transition from '{from}' to '{to}' on genus '{genus_id}'")]
    InvalidTransition {
        /// The genus whose transition graph was consulted.
        genus_id: String,
        /// The status transitioned from.
        from: String,
        /// The status that was requested.
        to: String,
    },

    /// BFS found no path to the requested target status.
    #[error(
        "no transition path to '{target}' on genus '{genus_id}'; reachable states: {reachable:?}"
    )]
    NoTransitionPath {
        /// The genus whose transition graph was searched.
        genus_id: String,
        /// The status that could not be reached.
        target: String,
        /// States that *are* reachable from the initial state, for the error message.
        reachable: Vec<String>,
    },

    /// A feature write was attempted while the parent's status is not in
    /// the feature genus's `editable_parent_statuses`.
    #[error("parent '{parent_id}' in status '{status}' is not editable for this feature")]
    ParentNotEditable {
        /// The parent res.
        parent_id: String,
        /// The parent's current status.
        status: String,
    },

    /// A relationship's member count for some role violated its cardinality.
    #[error("role '{role}' cardinality violation: expected {expected}, got {actual}")]
    CardinalityViolation {
        /// The role whose cardinality was violated.
        role: String,
        /// A description of the expected cardinality.
        expected: String,
        /// The number of members actually supplied.
        actual: usize,
    },

    /// A relationship member's genus was not in the role's `valid_member_genera`.
    #[error(
        "member '{member_id}' has genus '{member_genus_id}' which is not valid for role '{role}'"
    )]
    MemberGenusMismatch {
        /// The offending member.
        member_id: String,
        /// The member's actual genus.
        member_genus_id: String,
        /// The role that rejected it.
        role: String,
    },

    /// An action's declared resource precondition (required status) was not met.
    #[error("precondition failed for resource '{resource}': {reason}")]
    PreconditionFailed {
        /// The bound resource name from the action definition.
        resource: String,
        /// Why the precondition failed.
        reason: String,
    },

    /// A required action parameter was missing or wrongly typed.
    #[error("bad parameter '{parameter}': {reason}")]
    BadParameter {
        /// The parameter name.
        parameter: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A handler token referred to an unknown resource or parameter.
    #[error("unresolved token '{token}'")]
    TokenResolution {
        /// The literal token text that failed to resolve.
        token: String,
    },

    /// `merge_branch` without `force` found overlapping edits.
    #[error("merge conflict: {0} res touched on both branches")]
    MergeConflict(usize),

    /// The underlying store failed in a way unrelated to validation.
    #[error("store error: {0}")]
    StoreError(String),

    /// A JSON (de)serialization error surfaced from the store's structured values.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
