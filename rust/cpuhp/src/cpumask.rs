// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A fixed-width set of CPU ids used for every request, target and online
//! set the engine deals with.
//!
//! Unlike a host-global mask, every Cpumask carries its own width
//! (`nr_cpus`, one past the highest possible CPU id). All masks handled by
//! one engine share the same width, which is taken from the possible mask
//! of its hotplug backend.
//!
//! Masks can be created empty, full, or from a hexadecimal string. The
//! hexadecimal string also supports the special values "none" and "all":
//!
//!```
//!     use cpuhp::Cpumask;
//!     let mask = Cpumask::from_str("0xf0", 8).unwrap();
//!     assert!(mask.test_cpu(4));
//!     assert!(!mask.test_cpu(0));
//!
//!     let all = Cpumask::from_str("all", 8).unwrap();
//!     assert!(all.is_full());
//!     assert_eq!(format!("{all}"), "ff");
//!```
//!
//! Sysfs style cpulists are accepted as well:
//!
//!```
//!     use cpuhp::Cpumask;
//!     let mask = Cpumask::from_cpulist("0-3,6", 8).unwrap();
//!     assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 6]);
//!```

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use serde::Serialize;
use serde::Serializer;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask covering CPUs `[0, nr_cpus)`.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with every CPU in `[0, nr_cpus)` set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask holding exactly CPUs `[0, count)`. `count` is clamped
    /// to the width of the mask.
    pub fn first(count: usize, nr_cpus: usize) -> Cpumask {
        let mut mask = Self::new(nr_cpus);
        mask.mask[..count.min(nr_cpus)].fill(true);
        mask
    }

    /// Build a Cpumask object from a hexadecimal string.
    pub fn from_str(cpumask: &str, nr_cpus: usize) -> Result<Cpumask> {
        match cpumask.trim() {
            "none" => return Ok(Self::new(nr_cpus)),
            "all" => return Ok(Self::full(nr_cpus)),
            _ => {}
        }
        let hex_str = {
            let trimmed = cpumask.trim();
            let mut tmp_str = trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
                .unwrap_or(trimmed)
                .replace(['_', ','], "");
            if tmp_str.is_empty() {
                bail!("Empty cpumask");
            }
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Self::new(nr_cpus);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= nr_cpus {
                    bail!(
                        concat!(
                            "Found cpu ({}) in cpumask ({}) which is larger",
                            " than the number of possible cpus ({})"
                        ),
                        cpu,
                        cpumask,
                        nr_cpus
                    );
                }
                mask.mask.set(cpu, true);
            }
        }

        Ok(mask)
    }

    /// Build a Cpumask from a cpulist such as `0-3,6`, the format used by
    /// `/sys/devices/system/cpu/{online,possible}`.
    pub fn from_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Self::new(nr_cpus);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)
                .with_context(|| format!("cpulist {:?} out of range", cpulist.trim()))?;
        }

        Ok(mask)
    }

    /// Set all bits in the Cpumask to 1
    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    /// Set all bits in the Cpumask to 0
    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. CPUs beyond
    /// the width of the mask are reported as not set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// Return true if the Cpumask has all bits set, false otherwise.
    pub fn is_full(&self) -> bool {
        self.mask.all()
    }

    /// The width of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new &= other;
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new |= other;
        new
    }

    /// Create a Cpumask holding the CPUs of the current Cpumask which are not
    /// set in `other`.
    pub fn and_not(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        let len = new.len();
        for cpu in other.iter().take_while(|cpu| *cpu < len) {
            new.mask.set(cpu, false);
        }
        new
    }

    /// Iterate over the CPUs set in the Cpumask in ascending order. The
    /// iterator is double ended, `.rev()` walks from the highest CPU down.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let nr_cpus = self.len().max(1);
        let mut masks = vec![0u32; nr_cpus.div_ceil(32)];
        for cpu in self.iter() {
            masks[cpu / 32] |= 1 << (cpu % 32);
        }

        // Print the highest 32bit. Trim digits beyond the width.
        let width = match nr_cpus.div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or_default();
        match case {
            'X' => write!(f, "{top:0width$X}")?,
            _ => write!(f, "{top:0width$x}")?,
        }

        // The rest in descending order.
        for submask in masks.iter().rev() {
            match case {
                'X' => write!(f, ",{submask:08X}")?,
                _ => write!(f, ",{submask:08x}")?,
            }
        }
        Ok(())
    }

    /// Render the mask as a cpulist, e.g. `0-3,6`.
    pub fn to_cpulist(&self) -> String {
        let mut groups: Vec<(usize, usize)> = vec![];
        for cpu in self.iter() {
            match groups.last_mut() {
                Some((_, end)) if *end + 1 == cpu => *end = cpu,
                _ => groups.push((cpu, cpu)),
            }
        }
        groups
            .iter()
            .map(|(start, end)| match start == end {
                true => format!("{start}"),
                false => format!("{start}-{end}"),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        if min > max {
            bail!("Inverted range in cpulist {}", group.trim());
        }
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl Serialize for Cpumask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        self.mask &= &rhs.mask;
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        self.mask |= &rhs.mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpus(mask: &Cpumask) -> Vec<usize> {
        mask.iter().collect()
    }

    #[test]
    fn test_from_str_hex() {
        let mask = Cpumask::from_str("0xa", 8).unwrap();
        assert_eq!(cpus(&mask), vec![1, 3]);

        let mask = Cpumask::from_str("f0", 8).unwrap();
        assert_eq!(cpus(&mask), vec![4, 5, 6, 7]);

        let mask = Cpumask::from_str("0x1_01", 16).unwrap();
        assert_eq!(cpus(&mask), vec![0, 8]);
    }

    #[test]
    fn test_from_str_special_values() {
        assert!(Cpumask::from_str("none", 8).unwrap().is_empty());
        assert!(Cpumask::from_str("all", 8).unwrap().is_full());
    }

    #[test]
    fn test_from_str_rejects_out_of_range_cpu() {
        assert!(Cpumask::from_str("0x100", 8).is_err());
        assert!(Cpumask::from_str("0xzz", 8).is_err());
        assert!(Cpumask::from_str("0x", 8).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Cpumask::from_str("0x3", 8).unwrap().to_string(), "03");
        assert_eq!(Cpumask::full(4).to_string(), "f");
        assert_eq!(
            format!("{:X}", Cpumask::from_str("0x1_0000_00ab", 40).unwrap()),
            "01,000000AB"
        );
    }

    #[test]
    fn test_cpulist() {
        let mask = Cpumask::from_cpulist("0-2,5\n", 8).unwrap();
        assert_eq!(cpus(&mask), vec![0, 1, 2, 5]);
        assert_eq!(mask.to_cpulist(), "0-2,5");
        assert!(Cpumask::from_cpulist("", 8).unwrap().is_empty());
        assert!(Cpumask::from_cpulist("0-8", 8).is_err());
        assert!(read_cpulist("3-1").is_err());
        assert!(read_cpulist("a").is_err());
    }

    #[test]
    fn test_first() {
        assert_eq!(Cpumask::first(2, 8), Cpumask::from_str("0x3", 8).unwrap());
        assert!(Cpumask::first(100, 8).is_full());
        assert!(Cpumask::first(0, 8).is_empty());
    }

    #[test]
    fn test_set_ops() {
        let a = Cpumask::from_str("0x3", 8).unwrap();
        let b = Cpumask::from_str("0x6", 8).unwrap();
        assert_eq!(a.and(&b), Cpumask::from_str("0x2", 8).unwrap());
        assert_eq!(a.or(&b), Cpumask::from_str("0x7", 8).unwrap());
        assert_eq!(b.and_not(&a), Cpumask::from_str("0x4", 8).unwrap());
        assert_eq!(a.and_not(&b), Cpumask::from_str("0x1", 8).unwrap());
    }

    #[test]
    fn test_and_not_wider_mask() {
        let narrow = Cpumask::from_str("0xf", 4).unwrap();
        let wide = Cpumask::from_str("0x1a", 8).unwrap();
        let res = narrow.and_not(&wide);
        assert_eq!(res.len(), 4);
        assert_eq!(res.to_cpulist(), "0,2");
    }

    #[test]
    fn test_iter_descending() {
        let mask = Cpumask::from_str("0xe", 8).unwrap();
        assert_eq!(mask.iter().rev().collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn test_set_and_clear() {
        let mut mask = Cpumask::new(4);
        mask.set_cpu(3).unwrap();
        assert!(mask.test_cpu(3));
        mask.clear_cpu(3).unwrap();
        assert!(!mask.test_cpu(3));
        assert!(mask.set_cpu(4).is_err());
        assert!(!mask.test_cpu(100));
    }
}
