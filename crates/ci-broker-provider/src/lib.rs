//! The VM provider contract consumed by the host scheduler, expressed
//! as an `async_trait` trait object (`Arc<dyn Provider>`), matching the
//! `spool::Spool` trait-object pattern used elsewhere for pluggable
//! storage backends. This crate carries only the contract and a test
//! double; the real microVM backend (kernel args, cloud-init, TAP and
//! iptables plumbing) is out of scope per the design notes and lives
//! outside this workspace.

use async_trait::async_trait;
use ci_broker_slots::SlotHandle;
use ci_broker_types::WorkflowJobEvent;

#[cfg(any(test, feature = "test-util"))]
mod fake;
#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeProvider;

mod null;
mod registry;

pub use null::NullProvider;
pub use registry::{build, register, registered_names, ProviderFactory};

/// A capability set for launching and tearing down one-shot microVMs
/// bound to slots in a `SlotPool`. Implementations must validate local
/// preconditions in `init` (binary paths, kernel devices, privileges)
/// and fail fast there rather than partway through `start_runner`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Validate host preconditions. Idempotent; called once at host
    /// scheduler startup. A failure here is fatal (`PreconditionFailed`)
    /// and the host process exits.
    async fn init(&self) -> anyhow::Result<()>;

    /// Acquire a slot. Delegates to the shared `SlotPool`; never blocks
    /// beyond the pool's mutex.
    fn next(&self) -> Option<SlotHandle>;

    /// Release a slot without ever having started a VM on it.
    fn done(&self, slot: SlotHandle);

    /// Launch a VM bound to `slot`. No job is assigned to it yet — the
    /// VM's own bootstrap calls the job-lease consumer (§4.5) once it
    /// has booted, which is why this takes no `WorkflowJobEvent`. Must
    /// return once the VM has been asked to start, not once it has
    /// finished booting. On error the caller releases the slot; this
    /// call must not leave the slot half-initialized.
    async fn start_runner(&self, slot: &SlotHandle) -> anyhow::Result<()>;

    /// Locate the VM by the runner-name embedded in `event`, terminate
    /// it, and free its slot. Must free the slot even if termination
    /// itself reports an error (the message is still acked either way).
    async fn stop_runner(&self, event: &WorkflowJobEvent) -> anyhow::Result<()>;

    /// Opaque status snapshot rendered by the `/status` endpoint.
    fn status(&self) -> serde_json::Value;
}
