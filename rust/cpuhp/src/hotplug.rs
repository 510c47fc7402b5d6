// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Hotplug driver
//!
//! Moves the live online set towards a target mask using the primitives of
//! a [`HotplugOps`] backend.
//!
//! CPUs are brought up in ascending order and brought down in descending
//! order. Some cluster topologies need the higher numbered big cores to go
//! offline before the lower numbered ones.
//!
//! A bring-up failure aborts the rest of the pass, including all
//! bring-downs: a CPU which refuses to come up is most likely broken and
//! will keep failing. Bring-down failures are logged and skipped.

use crate::Cpumask;
use anyhow::Result;
use log::debug;
use log::warn;
use serde::Serialize;

/// Primitives the engine needs from the platform. Implementations may
/// block; the engine always calls them with its state lock held.
pub trait HotplugOps: Send + Sync {
    /// Bring one CPU online.
    fn cpu_up(&self, cpu: usize) -> Result<()>;

    /// Take one CPU offline.
    fn cpu_down(&self, cpu: usize) -> Result<()>;

    /// The CPUs currently online.
    fn online_mask(&self) -> Result<Cpumask>;

    /// Every CPU the platform could ever bring online. Fixed for the
    /// lifetime of the backend.
    fn possible_mask(&self) -> Cpumask;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub bring_up: Cpumask,
    pub bring_down: Cpumask,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.bring_up.is_empty() && self.bring_down.is_empty()
    }
}

pub fn diff(target: &Cpumask, online: &Cpumask) -> Diff {
    Diff {
        bring_up: target.and_not(online),
        bring_down: online.and_not(target),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    NoChange,
    Applied,
    AppliedPartially { failed_cpu: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    /// The online mask actually reached.
    pub online: Cpumask,
    #[serde(flatten)]
    pub outcome: ApplyOutcome,
}

impl ApplyResult {
    pub fn is_complete(&self) -> bool {
        !matches!(self.outcome, ApplyOutcome::AppliedPartially { .. })
    }
}

pub struct HotplugDriver<O: HotplugOps> {
    ops: O,
}

impl<O: HotplugOps> HotplugDriver<O> {
    pub fn new(ops: O) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// `target` and `online` must have the same width.
    pub fn apply(&self, target: &Cpumask, online: &Cpumask) -> ApplyResult {
        assert_eq!(
            target.len(),
            online.len(),
            "target and online cpumask widths differ"
        );
        let diff = diff(target, online);
        let mut reached = online.clone();

        if diff.is_empty() {
            return ApplyResult {
                online: reached,
                outcome: ApplyOutcome::NoChange,
            };
        }

        assert!(
            !diff.bring_down.test_cpu(0),
            "refusing to take the boot cpu offline (target={target} online={online})"
        );

        for cpu in diff.bring_up.iter() {
            debug!("cpu{cpu}: bringing up");
            match self.ops.cpu_up(cpu) {
                Ok(()) => reached
                    .set_cpu(cpu)
                    .expect("bring-up cpu within the online mask width"),
                Err(e) => {
                    warn!("cpu{cpu}: failed to bring up ({e:#}), aborting hotplug pass");
                    return ApplyResult {
                        online: reached,
                        outcome: ApplyOutcome::AppliedPartially {
                            failed_cpu: cpu,
                            reason: format!("{e:#}"),
                        },
                    };
                }
            }
        }

        let mut first_failure = None;
        for cpu in diff.bring_down.iter().rev() {
            debug!("cpu{cpu}: bringing down");
            match self.ops.cpu_down(cpu) {
                Ok(()) => reached
                    .clear_cpu(cpu)
                    .expect("bring-down cpu taken from the online mask"),
                Err(e) => {
                    warn!("cpu{cpu}: failed to bring down ({e:#})");
                    if first_failure.is_none() {
                        first_failure = Some((cpu, format!("{e:#}")));
                    }
                }
            }
        }

        let outcome = match first_failure {
            Some((failed_cpu, reason)) => ApplyOutcome::AppliedPartially { failed_cpu, reason },
            None => ApplyOutcome::Applied,
        };
        ApplyResult {
            online: reached,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHotplug;
    use crate::fake::HotplugCall::{Down, Up};

    fn mask(s: &str) -> Cpumask {
        Cpumask::from_str(s, 8).unwrap()
    }

    #[test]
    fn test_diff() {
        let d = diff(&mask("06"), &mask("03"));
        assert_eq!(d.bring_up, mask("04"));
        assert_eq!(d.bring_down, mask("01"));
        assert!(diff(&mask("03"), &mask("03")).is_empty());
    }

    #[test]
    fn test_no_change() {
        let driver = HotplugDriver::new(FakeHotplug::new(8, &mask("0f")));
        let res = driver.apply(&mask("0f"), &mask("0f"));
        assert_eq!(res.outcome, ApplyOutcome::NoChange);
        assert_eq!(res.online, mask("0f"));
        assert!(driver.ops().calls().is_empty());
    }

    #[test]
    fn test_bring_up_ascending() {
        let driver = HotplugDriver::new(FakeHotplug::new(8, &mask("01")));
        let res = driver.apply(&mask("0f"), &mask("01"));
        assert_eq!(driver.ops().calls(), vec![Up(1), Up(2), Up(3)]);
        assert_eq!(res.outcome, ApplyOutcome::Applied);
        assert_eq!(res.online, mask("0f"));
    }

    #[test]
    fn test_bring_down_descending() {
        let driver = HotplugDriver::new(FakeHotplug::new(8, &mask("0f")));
        let res = driver.apply(&mask("01"), &mask("0f"));
        assert_eq!(driver.ops().calls(), vec![Down(3), Down(2), Down(1)]);
        assert_eq!(res.online, mask("01"));
    }

    #[test]
    fn test_up_before_down() {
        let driver = HotplugDriver::new(FakeHotplug::new(8, &mask("03")));
        let res = driver.apply(&mask("0d"), &mask("03"));
        assert_eq!(driver.ops().calls(), vec![Up(2), Up(3), Down(1)]);
        assert_eq!(res.online, mask("0d"));
    }

    #[test]
    fn test_bring_up_failure_stops_pass() {
        let fake = FakeHotplug::new(8, &mask("03"));
        fake.fail_cpu(3);
        let driver = HotplugDriver::new(fake);
        let res = driver.apply(&mask("3d"), &mask("03"));

        // cpu1 would have been brought down, cpu4/5 brought up.
        assert_eq!(driver.ops().calls(), vec![Up(2), Up(3)]);
        assert_eq!(res.online, mask("07"));
        match res.outcome {
            ApplyOutcome::AppliedPartially { failed_cpu, .. } => assert_eq!(failed_cpu, 3),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!res.is_complete());
    }

    #[test]
    fn test_bring_down_failure_continues() {
        let fake = FakeHotplug::new(8, &mask("0f"));
        fake.fail_cpu(2);
        let driver = HotplugDriver::new(fake);
        let res = driver.apply(&mask("01"), &mask("0f"));

        assert_eq!(driver.ops().calls(), vec![Down(3), Down(2), Down(1)]);
        assert_eq!(res.online, mask("05"));
        match res.outcome {
            ApplyOutcome::AppliedPartially { failed_cpu, .. } => assert_eq!(failed_cpu, 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "boot cpu")]
    fn test_refuses_boot_cpu_down() {
        let driver = HotplugDriver::new(FakeHotplug::new(8, &mask("03")));
        driver.apply(&mask("02"), &mask("03"));
    }

    #[test]
    #[should_panic(expected = "widths differ")]
    fn test_refuses_mismatched_widths() {
        let driver = HotplugDriver::new(FakeHotplug::new(8, &mask("01")));
        let wide = Cpumask::from_str("0x101", 16).unwrap();
        driver.apply(&wide, &mask("01"));
    }
}
