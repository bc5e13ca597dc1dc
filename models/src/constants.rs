/// Helper macro to avoid retyping the API group of the shim resources when creating further
/// string constants from it. When given no parameters, this returns the API group. When given a
/// string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! shim_domain {
    () => {
        "runtime.k8s.containerd.io"
    };
    ($s:literal) => {
        concat!(shim_domain!(), "/", $s)
    };
}

pub const API_VERSION: &str = shim_domain!("v1alpha1");

/// Guards a `Shim` against removal until every node has uninstalled it.
pub const SHIM_FINALIZER: &str = concat!("shim.", shim_domain!(), "/finalizer");

/// Prefix of the `Node` annotation through which node-side installers report progress.
/// The full key is `<prefix>/<shim namespace>.<shim name>`.
pub const NODE_REPORT_ANNOTATION_PREFIX: &str = concat!("shim.", shim_domain!());

pub const CONTROLLER: &str = "shim-controller";

// Condition types
pub const CONDITION_VALID: &str = "Valid";
pub const CONDITION_ROLLOUT_COMPLETE: &str = "RolloutComplete";
pub const CONDITION_NODE_INSTALL_FAILED: &str = "NodeInstallFailed";
pub const CONDITION_TERMINATING: &str = "Terminating";

// Condition reasons
pub const REASON_SPEC_VALID: &str = "SpecValid";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_ALL_NODES_UPGRADED: &str = "AllNodesUpgraded";
pub const REASON_ROLLOUT_IN_PROGRESS: &str = "RolloutInProgress";
pub const REASON_SOURCE_CHANGED: &str = "SourceChanged";
pub const REASON_INSTALLER_REPORTED_FAILURE: &str = "InstallerReportedFailure";
pub const REASON_NO_FAILURES: &str = "NoFailures";
pub const REASON_CLEANUP_PENDING: &str = "CleanupPending";
pub const REASON_CLEANUP_FAILED: &str = "CleanupFailed";
