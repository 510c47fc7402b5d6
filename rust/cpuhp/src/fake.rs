// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-memory hotplug backend.
//!
//! Keeps an online mask instead of touching the host and records every
//! transition it was asked to perform. Used by the tests and by the daemon's
//! dry-run mode.

use crate::Cpumask;
use crate::HotplugOps;
use anyhow::bail;
use anyhow::Result;
use log::info;
use std::collections::BTreeSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugCall {
    Up(usize),
    Down(usize),
}

#[derive(Debug)]
struct FakeState {
    online: Cpumask,
    calls: Vec<HotplugCall>,
    failing: BTreeSet<usize>,
}

#[derive(Debug)]
pub struct FakeHotplug {
    possible: Cpumask,
    state: Mutex<FakeState>,
}

impl FakeHotplug {
    /// A platform with `nr_cpus` possible CPUs of which `online` are up.
    pub fn new(nr_cpus: usize, online: &Cpumask) -> Self {
        let possible = Cpumask::full(nr_cpus);
        Self {
            state: Mutex::new(FakeState {
                online: online.and(&possible),
                calls: vec![],
                failing: BTreeSet::new(),
            }),
            possible,
        }
    }

    /// Make every following transition of `cpu` fail.
    pub fn fail_cpu(&self, cpu: usize) {
        self.state.lock().unwrap().failing.insert(cpu);
    }

    pub fn heal_cpu(&self, cpu: usize) {
        self.state.lock().unwrap().failing.remove(&cpu);
    }

    /// Change the online set behind the engine's back.
    pub fn set_online(&self, online: &Cpumask) {
        self.state.lock().unwrap().online = online.clone();
    }

    /// Transitions performed so far, in call order.
    pub fn calls(&self) -> Vec<HotplugCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn transition(&self, call: HotplugCall) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);

        let (cpu, up) = match call {
            HotplugCall::Up(cpu) => (cpu, true),
            HotplugCall::Down(cpu) => (cpu, false),
        };
        if !self.possible.test_cpu(cpu) {
            bail!("cpu{} is not possible", cpu);
        }
        if state.failing.contains(&cpu) {
            bail!("cpu{} transition rejected", cpu);
        }

        info!("fake: cpu{} {}", cpu, if up { "online" } else { "offline" });
        match up {
            true => state.online.set_cpu(cpu),
            false => state.online.clear_cpu(cpu),
        }
    }
}

impl HotplugOps for FakeHotplug {
    fn cpu_up(&self, cpu: usize) -> Result<()> {
        self.transition(HotplugCall::Up(cpu))
    }

    fn cpu_down(&self, cpu: usize) -> Result<()> {
        self.transition(HotplugCall::Down(cpu))
    }

    fn online_mask(&self) -> Result<Cpumask> {
        Ok(self.state.lock().unwrap().online.clone())
    }

    fn possible_mask(&self) -> Cpumask {
        self.possible.clone()
    }
}
