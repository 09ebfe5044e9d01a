//! # gamefleet-api
//!
//! Resource model shared by the gamefleet operator.
//!
//! ## Resources
//!
//! - `Fleet`: desired pool of game servers (standingBy target, max cap,
//!   crash policy, pod template, ports to expose) plus its observed status
//! - `Instance`: one game-server attempt owned by a fleet
//! - `Pod`: the backing process of an instance, same name, owned by it
//! - `Node`: the host a pod is placed on, used to resolve public addresses
//!
//! All resources share `ObjectMeta` and implement [`Resource`]. Ownership is
//! expressed through controller owner references, exactly one per object.

mod fleet;
mod instance;
mod meta;
mod node;
mod pod;

pub use fleet::*;
pub use instance::*;
pub use meta::*;
pub use node::*;
pub use pod::*;

/// Well-known names used on resources.
pub mod names {
    /// Finalizer guarding port release before an instance disappears.
    pub const INSTANCE_FINALIZER: &str = "gameservers.gamefleet.dev/finalizer";

    /// Pod annotation read by the node autoscaler.
    pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

    /// Name of the sidecar container injected into every game-server pod.
    pub const SIDECAR_CONTAINER_NAME: &str = "gamefleet-sidecar";

    /// Name of the init container injected into every game-server pod.
    pub const INIT_CONTAINER_NAME: &str = "initcontainer";

    pub const LABEL_BUILD_ID: &str = "BuildID";
    pub const LABEL_BUILD_NAME: &str = "BuildName";
    pub const LABEL_OWNING_GAME_SERVER: &str = "OwningGameServer";
    pub const LABEL_OWNING_OPERATOR: &str = "OwningOperator";

    /// Value of `OwningOperator` on pods we create.
    pub const OPERATOR_NAME: &str = "gamefleet";
}
