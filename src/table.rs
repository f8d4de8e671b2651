//! The shared process table.
//!
//! One slot per managed process, keyed by name. The liveness loop, startup,
//! shutdown and the regenerate-and-restart sequence all go through this
//! table; every state change of a slot happens inside one lock section, so a
//! reader never sees a terminated handle flagged as running.

use std::sync::Arc;

use thiserror::Error;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::events::Event;
use crate::process::{ProcessSpec, SlotState};
use crate::relay;
use crate::runner::{self, SpawnError};

/// One supervised server and the relay attached to its current output.
pub struct ManagedProcess {
    pub spec: ProcessSpec,
    pub state: SlotState,
    pub pid: Option<u32>,
    /// Bumped every time a new handle is installed.
    pub generation: u64,
    child: Option<Child>,
    relay: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            state: SlotState::Absent,
            pid: None,
            generation: 0,
            child: None,
            relay: None,
        }
    }
}

/// Read-only view of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub name: String,
    pub state: SlotState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub relay_attached: bool,
}

/// A supervised process found dead by the liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitedProcess {
    pub name: String,
    pub code: Option<i32>,
}

/// A handle taken out of the table, to be stopped by the caller.
pub struct Detached {
    pub child: Child,
    pub pid: Option<u32>,
    pub relay: Option<JoinHandle<()>>,
}

/// A freshly installed handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launched {
    pub pid: Option<u32>,
    pub generation: u64,
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("duplicate process name {0}")]
    Duplicate(String),
    #[error("unknown process {0}")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Clone, Default)]
pub struct ProcessTable {
    slots: Arc<Mutex<Vec<ManagedProcess>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty (`Absent`) slot for `spec`.
    pub async fn insert(&self, spec: ProcessSpec) -> Result<(), TableError> {
        let mut slots = self.slots.lock().await;
        if slots.iter().any(|slot| slot.spec.name == spec.name) {
            return Err(TableError::Duplicate(spec.name));
        }
        slots.push(ManagedProcess::new(spec));
        Ok(())
    }

    pub async fn spec(&self, name: &str) -> Option<ProcessSpec> {
        let slots = self.slots.lock().await;
        slots.iter().find(|s| s.spec.name == name).map(|s| s.spec.clone())
    }

    pub async fn set_state(&self, name: &str, state: SlotState) -> Result<(), TableError> {
        let mut slots = self.slots.lock().await;
        let slot = find_mut(&mut slots, name)?;
        slot.state = state;
        Ok(())
    }

    /// Installs a freshly spawned handle and its relay, leaving the slot `Running`.
    ///
    /// A relay still attached to a previous handle is aborted, so a slot never
    /// feeds the console from two streams.
    pub async fn install(
        &self,
        name: &str,
        child: Child,
        relay: JoinHandle<()>,
    ) -> Result<u64, TableError> {
        let mut slots = self.slots.lock().await;
        let slot = find_mut(&mut slots, name)?;
        if let Some(old) = slot.relay.replace(relay) {
            old.abort();
        }
        slot.pid = child.id();
        slot.child = Some(child);
        slot.generation += 1;
        slot.state = SlotState::Running;
        Ok(slot.generation)
    }

    /// Spawns the process for slot `name`, attaches a fresh relay and installs both.
    ///
    /// The slot is `Starting` while the spawn runs and drops back to `Absent`
    /// if it fails.
    pub async fn launch(
        &self,
        spec: &ProcessSpec,
        tx: mpsc::UnboundedSender<Event>,
    ) -> Result<Launched, LaunchError> {
        self.set_state(&spec.name, SlotState::Starting).await?;
        let mut child = match runner::spawn(spec) {
            Ok(child) => child,
            Err(err) => {
                self.set_state(&spec.name, SlotState::Absent).await?;
                return Err(err.into());
            }
        };
        let pid = child.id();
        let relay = relay::attach(
            &spec.name,
            spec.color.clone(),
            child.stdout.take(),
            child.stderr.take(),
            tx,
        );
        let generation = self.install(&spec.name, child, relay).await?;
        Ok(Launched { pid, generation })
    }

    /// Takes the handle of a running slot and marks it `Absent` in one step.
    ///
    /// Returns `None` when the slot holds no handle (already down).
    pub async fn detach_for_restart(&self, name: &str) -> Result<Option<Detached>, TableError> {
        self.detach(name, SlotState::Absent).await
    }

    /// Takes the handle of a slot for shutdown, marking it `Exiting`.
    pub async fn detach_for_shutdown(&self, name: &str) -> Result<Option<Detached>, TableError> {
        self.detach(name, SlotState::Exiting).await
    }

    async fn detach(&self, name: &str, state: SlotState) -> Result<Option<Detached>, TableError> {
        let mut slots = self.slots.lock().await;
        let slot = find_mut(&mut slots, name)?;
        slot.state = state;
        let pid = slot.pid.take();
        let relay = slot.relay.take();
        Ok(slot.child.take().map(|child| Detached { child, pid, relay }))
    }

    /// Checks every `Running` slot, in table order, for an exited handle.
    ///
    /// Slots found dead are moved to `Exiting` so they are reported once.
    pub async fn poll_exits(&self) -> Vec<ExitedProcess> {
        let mut slots = self.slots.lock().await;
        let mut exited = Vec::new();
        for slot in slots.iter_mut() {
            if !slot.state.is_supervised() {
                continue;
            }
            let Some(child) = slot.child.as_mut() else {
                continue;
            };
            let code = match child.try_wait() {
                Ok(None) => continue,
                Ok(Some(status)) => status.code(),
                Err(err) => {
                    tracing::warn!(process = %slot.spec.name, error = %err, "liveness check failed");
                    None
                }
            };
            slot.state = SlotState::Exiting;
            slot.child = None;
            slot.pid = None;
            exited.push(ExitedProcess {
                name: slot.spec.name.clone(),
                code,
            });
        }
        exited
    }

    /// Takes the relays still attached to slots, e.g. of processes that exited.
    pub async fn take_relays(&self) -> Vec<JoinHandle<()>> {
        let mut slots = self.slots.lock().await;
        slots.iter_mut().filter_map(|slot| slot.relay.take()).collect()
    }

    pub async fn snapshot(&self) -> Vec<SlotSnapshot> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .map(|s| SlotSnapshot {
                name: s.spec.name.clone(),
                state: s.state,
                pid: s.pid,
                generation: s.generation,
                relay_attached: s.relay.as_ref().map(|r| !r.is_finished()).unwrap_or(false),
            })
            .collect()
    }
}

fn find_mut<'a>(slots: &'a mut [ManagedProcess], name: &str) -> Result<&'a mut ManagedProcess, TableError> {
    slots
        .iter_mut()
        .find(|slot| slot.spec.name == name)
        .ok_or_else(|| TableError::Unknown(name.to_string()))
}
