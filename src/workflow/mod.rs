//! KYC onboarding workflow engine.
//!
//! `WorkflowEngine` owns the persisted `WorkflowState` and is the only
//! thing that mutates it. Access policy and consistency repair are pure
//! functions over the state and step-data presence; navigation, provider
//! callbacks and expiry are layered on the engine.

pub mod callback;
pub mod engine;
pub mod expiry;
pub mod latch;
pub mod navigation;
pub mod persist;
pub mod policy;
pub mod repair;
pub mod schedule;
pub mod sequence;
pub mod session;
pub mod state;

pub use callback::{CallbackOutcome, CallbackParams, ProviderStatus, Reconciliation};
pub use engine::{EntryOutcome, EntryQuery, FlowStatus, RedirectReason, WorkflowEngine};
pub use expiry::{ExpiryMonitor, TokenValidity};
pub use navigation::{NavigationOutcome, NavigationSnapshot};
pub use persist::WorkflowStore;
pub use policy::StepDataPresence;
pub use repair::StatusChange;
pub use sequence::StepSequence;
pub use session::SessionBinder;
pub use state::{FlowMode, StepId, StepStatus, WorkflowState};
