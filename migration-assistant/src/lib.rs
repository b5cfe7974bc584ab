// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Audit a fleet of Labs instances for readiness to move to a new
//! datacenter.
//!
//! The pipeline runs in order: the [`directory`] lists the instances an
//! operator administers, the [`registry`] filters them, and the
//! [`coordinator`] runs the [`checks`] battery against each one through a
//! [`transport`], gating every instance on a single connectivity decision
//! made by the [`gate`].  The [`report`] module turns the recorded outcomes
//! into verdicts.

pub mod checks;
pub mod cmd;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod fakes;
pub mod gate;
pub mod instance;
pub mod registry;
pub mod report;
pub mod transport;

pub use config::Config;
pub use coordinator::{audit_fleet, execute, AuditError, RunContext};
pub use instance::{
    CheckName, CheckOutcome, Connectivity, Finding, Instance, InstanceKey,
};
pub use registry::{EmptyFleetError, ExclusionPolicy, Registry};
pub use report::{summarize, RunSummary, Verdict};
