// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Effective target computation.
//!
//! The target is the AND of every client request: a CPU stays online only
//! if nobody asked for it to go away.

use crate::Cpumask;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The intersection left no CPU at all.
    Empty,
    /// The intersection does not contain CPU 0.
    BootCpuOffline(Cpumask),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Empty => write!(f, "resolved cpumask is empty"),
            ResolveError::BootCpuOffline(mask) => {
                write!(f, "resolved cpumask {mask} does not contain the boot cpu")
            }
        }
    }
}

impl std::error::Error for ResolveError {}

/// Intersect `masks`, starting from `possible`.
pub fn compute<'a>(
    possible: &Cpumask,
    masks: impl IntoIterator<Item = &'a Cpumask>,
) -> Result<Cpumask, ResolveError> {
    let mut target = possible.clone();
    for mask in masks {
        target &= mask;
    }

    if target.is_empty() {
        return Err(ResolveError::Empty);
    }
    if !target.test_cpu(0) {
        return Err(ResolveError::BootCpuOffline(target));
    }

    Ok(target)
}
