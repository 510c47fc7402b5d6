// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Arbitration engine
//!
//! Owns the client registry and the enabled / suspended flags, and drives
//! the live online set towards the intersection of all client requests.
//!
//! ```text
//!   Disabled --set_enabled(true)--> Enabled <--suspend/resume--> Suspended
//!       ^                              |
//!       +----set_enabled(false)--------+   (all CPUs forced online first)
//! ```
//!
//! Every public operation holds the state lock for its whole duration,
//! including the blocking hotplug calls, so at most one reconciliation is
//! in flight at any time.
//!
//! Two conditions are fatal and panic: a resolved target without any CPU
//! or without the boot CPU. Running on such a topology is worse than
//! stopping.

use crate::hotplug::ApplyOutcome;
use crate::hotplug::ApplyResult;
use crate::hotplug::HotplugDriver;
use crate::registry::ClientId;
use crate::registry::ClientKind;
use crate::registry::Registry;
use crate::resolver;
use crate::Cpumask;
use crate::HotplugOps;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::error;
use log::info;
use log::warn;
use serde::Serialize;
use std::sync::Mutex;

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Reconcile {
    /// Arbitration is disabled, nothing was applied.
    Disabled,
    /// Deferred until resume.
    Suspended,
    /// The live online mask could not be read.
    Skipped { reason: String },
    /// The live online set already matches the target.
    NoChange,
    Applied(ApplyResult),
}

/// Result of a client mask request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Reconciled(Reconcile),
    /// No such client. The request is accepted without effect.
    UnknownClient,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub kind: ClientKind,
    pub mask: Cpumask,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub suspended: bool,
    pub nr_cpus: usize,
    pub possible: Cpumask,
    pub online: Option<Cpumask>,
    pub last_applied: Cpumask,
    pub resolved: Option<Cpumask>,
    pub nr_clients: usize,
    pub nr_reconciles: u64,
    pub nr_failures: u64,
}

struct EngineState {
    enabled: bool,
    suspended: bool,
    registry: Registry,
    /// Always contains the boot CPU.
    last_applied: Cpumask,
    nr_reconciles: u64,
    nr_failures: u64,
}

pub struct Engine<O: HotplugOps> {
    driver: HotplugDriver<O>,
    possible: Cpumask,
    state: Mutex<EngineState>,
}

impl<O: HotplugOps> Engine<O> {
    /// Build a disabled engine with the SYSTEM and SYSFS clients both
    /// requesting every possible CPU.
    pub fn new(ops: O) -> Result<Self> {
        let possible = ops.possible_mask();
        if !possible.test_cpu(0) {
            bail!("possible cpumask {} does not contain the boot cpu", possible);
        }

        let mut last_applied = ops
            .online_mask()
            .context("Failed to read the initial online cpumask")?;
        last_applied.set_cpu(0)?;

        let mut registry = Registry::new();
        registry.register(ClientId::System, possible.clone(), ClientKind::Internal)?;
        registry.register(ClientId::Sysfs, possible.clone(), ClientKind::Internal)?;

        info!(
            "cpuhp: {} possible cpus ({}), online {}",
            possible.weight(),
            possible.to_cpulist(),
            last_applied.to_cpulist()
        );

        Ok(Self {
            driver: HotplugDriver::new(ops),
            possible,
            state: Mutex::new(EngineState {
                enabled: false,
                suspended: false,
                registry,
                last_applied,
                nr_reconciles: 0,
                nr_failures: 0,
            }),
        })
    }

    pub fn ops(&self) -> &O {
        self.driver.ops()
    }

    pub fn nr_cpus(&self) -> usize {
        self.possible.len()
    }

    pub fn possible(&self) -> &Cpumask {
        &self.possible
    }

    /// Parse a hex mask string at this engine's width.
    pub fn parse_mask(&self, mask: &str) -> Result<Cpumask> {
        Cpumask::from_str(mask, self.nr_cpus())
    }

    fn check_width(&self, mask: &Cpumask) -> Result<()> {
        if mask.len() != self.nr_cpus() {
            bail!(
                "cpumask {} has width {}, expected {}",
                mask,
                mask.len(),
                self.nr_cpus()
            );
        }
        Ok(())
    }

    /// Check, without changing anything, that `mask` as the request of `id`
    /// still resolves to a valid target. Callers taking masks from outside
    /// use this to reject a request before it reaches the fatal path of
    /// [`Engine::request`] and [`Engine::register_client`].
    ///
    /// The boot CPU survives an intersection only if every mask has it, so
    /// masks checked concurrently cannot combine into an invalid target.
    pub fn check_mask(&self, id: &ClientId, mask: &Cpumask) -> Result<()> {
        self.check_width(mask)?;
        let state = self.state.lock().unwrap();
        let others = state
            .registry
            .iter()
            .filter(|client| client.id() != id)
            .map(|client| client.requested());
        resolver::compute(&self.possible, others.chain(std::iter::once(mask)))
            .with_context(|| format!("cpumask {} rejected for client {}", mask, id))?;
        Ok(())
    }

    pub fn register_client(
        &self,
        id: ClientId,
        mask: Cpumask,
        kind: ClientKind,
    ) -> Result<Reconcile> {
        self.check_width(&mask)?;
        let mut state = self.state.lock().unwrap();
        info!("registering client {} mask={}", id, mask);
        state.registry.register(id, mask, kind)?;
        Ok(self.reconcile_locked(&mut state))
    }

    /// Update the mask of an existing client. A request from an unknown
    /// client changes nothing and is reported as such.
    pub fn request(&self, id: &ClientId, mask: Cpumask) -> Result<RequestOutcome> {
        self.check_width(&mask)?;
        let mut state = self.state.lock().unwrap();
        if state.registry.request(id, mask).is_err() {
            debug!("ignoring request from unknown client {}", id);
            return Ok(RequestOutcome::UnknownClient);
        }
        Ok(RequestOutcome::Reconciled(self.reconcile_locked(&mut state)))
    }

    /// Clients cannot be removed; always succeeds without effect.
    pub fn unregister_client(&self, id: &ClientId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.registry.unregister(id)?;
        Ok(())
    }

    pub fn set_enabled(&self, enable: bool) -> Result<Reconcile> {
        let mut state = self.state.lock().unwrap();

        if enable {
            if !state.enabled {
                info!("cpuhp enabled");
            }
            state.enabled = true;
            return Ok(self.reconcile_locked(&mut state));
        }

        if !state.enabled {
            return Ok(Reconcile::Disabled);
        }

        // Nobody arbitrates once disabled, so leave every CPU online.
        let online = self
            .ops()
            .online_mask()
            .context("Failed to read online cpumask, staying enabled")?;
        let result = self.driver.apply(&self.possible, &online);
        state.last_applied = result.online.clone();
        if let ApplyOutcome::AppliedPartially { failed_cpu, reason } = &result.outcome {
            state.nr_failures += 1;
            error!(
                "cannot disable: cpu{} failed to come online ({}), staying enabled",
                failed_cpu, reason
            );
            bail!(
                "failed to bring cpu{} online ({}), cpuhp stays enabled",
                failed_cpu,
                reason
            );
        }

        state.enabled = false;
        info!("cpuhp disabled, online {}", result.online.to_cpulist());
        Ok(match result.outcome {
            ApplyOutcome::NoChange => Reconcile::NoChange,
            _ => Reconcile::Applied(result),
        })
    }

    pub fn reconcile(&self) -> Reconcile {
        let mut state = self.state.lock().unwrap();
        self.reconcile_locked(&mut state)
    }

    fn reconcile_locked(&self, state: &mut EngineState) -> Reconcile {
        if !state.enabled {
            return Reconcile::Disabled;
        }
        if state.suspended {
            debug!("suspended, deferring reconcile");
            return Reconcile::Suspended;
        }

        let online = match self.ops().online_mask() {
            Ok(v) => v,
            Err(e) => {
                error!("failed to read online cpumask ({:#})", e);
                state.nr_failures += 1;
                return Reconcile::Skipped {
                    reason: format!("{e:#}"),
                };
            }
        };

        if online != state.last_applied {
            warn!(
                "online cpus changed behind our back: expected {}, found {}",
                state.last_applied.to_cpulist(),
                online.to_cpulist()
            );
        }

        let target = match resolver::compute(&self.possible, state.registry.masks()) {
            Ok(v) => v,
            Err(e) => panic!("cpuhp: invalid cpumask resolution: {e}"),
        };

        if target == online {
            state.last_applied = online;
            return Reconcile::NoChange;
        }

        info!(
            "reconciling online cpus {} -> {}",
            online.to_cpulist(),
            target.to_cpulist()
        );
        let result = self.driver.apply(&target, &online);
        state.nr_reconciles += 1;
        if !result.is_complete() {
            state.nr_failures += 1;
            warn!(
                "partial hotplug: wanted {}, reached {}",
                target.to_cpulist(),
                result.online.to_cpulist()
            );
        }
        state.last_applied = result.online.clone();
        Reconcile::Applied(result)
    }

    pub fn on_suspend_prepare(&self) {
        let mut state = self.state.lock().unwrap();
        debug!("suspend prepare");
        state.suspended = true;
    }

    /// Leave the suspended state and apply everything requested meanwhile.
    pub fn on_post_resume(&self) -> Reconcile {
        let mut state = self.state.lock().unwrap();
        debug!("post resume");
        state.suspended = false;
        self.reconcile_locked(&mut state)
    }

    /// Limit the online CPUs to `[0, max_cpus)` on behalf of the QoS
    /// client. The count is clamped so that the boot CPU always remains.
    pub fn on_qos_max_changed(&self, max_cpus: usize) -> Result<RequestOutcome> {
        let count = max_cpus.clamp(1, self.nr_cpus());
        debug!("qos max cpus {} (effective {})", max_cpus, count);
        self.request(&ClientId::Qos, Cpumask::first(count, self.nr_cpus()))
    }

    pub fn on_qos_min_changed(&self, min_cpus: usize) {
        debug!("qos min cpus {} ignored, minimum limits are not supported", min_cpus);
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let state = self.state.lock().unwrap();
        state
            .registry
            .iter()
            .map(|c| ClientInfo {
                name: c.id().to_string(),
                kind: c.kind(),
                mask: c.requested().clone(),
            })
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.state.lock().unwrap();
        EngineStatus {
            enabled: state.enabled,
            suspended: state.suspended,
            nr_cpus: self.nr_cpus(),
            possible: self.possible.clone(),
            online: self.ops().online_mask().ok(),
            last_applied: state.last_applied.clone(),
            resolved: resolver::compute(&self.possible, state.registry.masks()).ok(),
            nr_clients: state.registry.len(),
            nr_reconciles: state.nr_reconciles,
            nr_failures: state.nr_failures,
        }
    }
}
