// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Hotplug backend driving the Linux CPU sysfs interface.
//!
//! `<root>/possible` and `<root>/online` are read as cpulists and CPUs are
//! switched by writing to `<root>/cpuN/online`. The root defaults to
//! `/sys/devices/system/cpu` and can be pointed elsewhere for testing.

use crate::cpumask::read_cpulist;
use crate::Cpumask;
use crate::HotplugOps;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Debug)]
pub struct SysfsHotplug {
    root: PathBuf,
    possible: Cpumask,
}

impl SysfsHotplug {
    pub fn new() -> Result<Self> {
        Self::with_root(SYSFS_CPU_ROOT)
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = PathBuf::from(root.as_ref());
        let path = root.join("possible");
        let possible = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let cpus = read_cpulist(&possible)?;
        let nr_cpus = match cpus.iter().max() {
            Some(max) => max + 1,
            None => bail!("No possible cpus listed in {}", path.display()),
        };

        let mut mask = Cpumask::new(nr_cpus);
        for cpu in cpus {
            mask.set_cpu(cpu)?;
        }
        debug!("sysfs: {} possible cpus under {}", mask.weight(), root.display());

        Ok(Self {
            root,
            possible: mask,
        })
    }

    fn set_online(&self, cpu: usize, online: bool) -> Result<()> {
        if !self.possible.test_cpu(cpu) {
            bail!("cpu{} is not a possible cpu", cpu);
        }

        let path = self.root.join(format!("cpu{cpu}")).join("online");
        let value = if online { "1" } else { "0" };
        fs::write(&path, value)
            .with_context(|| format!("Failed to write {} to {}", value, path.display()))
    }
}

impl HotplugOps for SysfsHotplug {
    fn cpu_up(&self, cpu: usize) -> Result<()> {
        self.set_online(cpu, true)
    }

    fn cpu_down(&self, cpu: usize) -> Result<()> {
        self.set_online(cpu, false)
    }

    fn online_mask(&self) -> Result<Cpumask> {
        let path = self.root.join("online");
        let online = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Cpumask::from_cpulist(&online, self.possible.len())
    }

    fn possible_mask(&self) -> Cpumask {
        self.possible.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(possible: &str, online: &str, nr_cpus: usize) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("possible"), possible).unwrap();
        fs::write(tmp.path().join("online"), online).unwrap();
        for cpu in 0..nr_cpus {
            let dir = tmp.path().join(format!("cpu{cpu}"));
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join("online"), "1\n").unwrap();
        }
        tmp
    }

    #[test]
    fn test_reads_masks() {
        let tmp = fake_sysfs("0-7\n", "0-3,6\n", 8);
        let hp = SysfsHotplug::with_root(tmp.path()).unwrap();

        assert!(hp.possible_mask().is_full());
        assert_eq!(hp.possible_mask().len(), 8);
        assert_eq!(
            hp.online_mask().unwrap().iter().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 6]
        );
    }

    #[test]
    fn test_sparse_possible() {
        let tmp = fake_sysfs("0-1,4\n", "0\n", 5);
        let hp = SysfsHotplug::with_root(tmp.path()).unwrap();
        assert_eq!(hp.possible_mask().len(), 5);
        assert_eq!(hp.possible_mask().to_cpulist(), "0-1,4");
        assert!(hp.cpu_up(3).is_err());
    }

    #[test]
    fn test_writes_online_files() {
        let tmp = fake_sysfs("0-3\n", "0-3\n", 4);
        let hp = SysfsHotplug::with_root(tmp.path()).unwrap();

        hp.cpu_down(2).unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join("cpu2/online")).unwrap(),
            "0"
        );
        hp.cpu_up(2).unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join("cpu2/online")).unwrap(),
            "1"
        );
    }

    #[test]
    fn test_missing_files() {
        let tmp = TempDir::new().unwrap();
        assert!(SysfsHotplug::with_root(tmp.path()).is_err());

        let tmp = fake_sysfs("0-3\n", "0-3\n", 4);
        fs::remove_file(tmp.path().join("online")).unwrap();
        let hp = SysfsHotplug::with_root(tmp.path()).unwrap();
        assert!(hp.online_mask().is_err());

        fs::remove_dir_all(tmp.path().join("cpu3")).unwrap();
        assert!(hp.cpu_down(3).is_err());
    }
}
