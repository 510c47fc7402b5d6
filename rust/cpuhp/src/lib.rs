// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU hotplug arbitration
//!
//! Several independent parties want a say in which CPUs are online: the
//! platform policy, an administrator, PM QoS limits, thermal or camera
//! daemons. Each of them registers as a *client* and states the cpumask it
//! wants online. The engine resolves the conflict by intersecting all
//! requests, so a CPU stays online only if no client asked for it to go
//! away, and then drives the live online set towards that target.
//!
//! ```
//!     use cpuhp::fake::FakeHotplug;
//!     use cpuhp::ClientId;
//!     use cpuhp::Cpumask;
//!     use cpuhp::Engine;
//!
//!     let online = Cpumask::from_str("0x01", 8).unwrap();
//!     let engine = Engine::new(FakeHotplug::new(8, &online)).unwrap();
//!     engine.set_enabled(true).unwrap();
//!
//!     let half = engine.parse_mask("0x0f").unwrap();
//!     engine.request(&ClientId::Sysfs, half.clone()).unwrap();
//!     assert_eq!(engine.status().last_applied, half);
//! ```
//!
//! ## Components
//!
//! - [`Cpumask`]: fixed-width CPU set with hex and cpulist parsing.
//! - [`registry`]: clients and their latest request.
//! - [`resolver`]: intersection of all requests, with the boot CPU
//!   invariant.
//! - [`hotplug`]: ordered application of a target through [`HotplugOps`].
//! - [`Engine`]: the single-lock orchestrator with suspend and QoS hooks.
//! - [`admin`]: JSON over UNIX socket administrative surface.
//! - [`SysfsHotplug`] and [`fake::FakeHotplug`]: backends.

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;

pub mod registry;
pub use registry::ClientId;
pub use registry::ClientKind;

pub mod resolver;

pub mod hotplug;
pub use hotplug::HotplugOps;

mod engine;
pub use engine::ClientInfo;
pub use engine::Engine;
pub use engine::EngineStatus;
pub use engine::Reconcile;
pub use engine::RequestOutcome;

mod platform;
pub use platform::SysfsHotplug;
pub use platform::SYSFS_CPU_ROOT;

pub mod fake;

pub mod admin;
pub use admin::AdminClient;
pub use admin::AdminServer;
