// According to Intel 64 and IA-32 architectures software developer's manual,
// volume 3B, MSR_PKG_ENERGY_STATUS reports the measured energy usage of the
// package. The other domains have their own *_ENERGY_STATUS register.

use std::{
    fs::File,
    io,
    os::unix::prelude::FileExt,
    process::{Command, Stdio},
};

use anyhow::{anyhow, Context};
use regex::Regex;

use crate::cpus::{check_socket_cpus, CpuId};
use crate::domains::EnergyDomain;
use crate::{EnergySource, Node};

type Addr = u64;

/// MSR registers' addresses for Intel RAPL domains
mod intel {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0x00000606;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0x00000611;
    pub const MSR_PP0_ENERGY_STATUS: Addr = 0x00000639;
    pub const MSR_PP1_ENERGY_STATUS: Addr = 0x00000641;
    pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x00000619;
}

/// MSR registers' addresses for AMD RAPL domains
mod amd {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0xc0010299;
    pub const MSR_CORE_ENERGY_STATUS: Addr = 0xc001029a;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0xc001029b;
}

/// Mask to apply when reading the energy values: the counters are stored in
/// the low 32 bits of the register.
const MSR_ENERGY_MASK: u64 = 0xffffffff;

/// Number of distinct values of an MSR energy counter: the counter wraps
/// back to zero after `MSR_COUNTER_RANGE * energy_unit` joules.
const MSR_COUNTER_RANGE: u64 = 1 << 32;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RaplVendor {
    Intel,
    Amd,
}

/// Reads the RAPL MSR values (via /dev/cpu/<cpu_id>/msr, for one CPU per socket).
pub struct MsrSource {
    /// MSR file descriptors, indexed by socket
    msr_per_socket: Vec<RaplMsrAccess>,
    vendor: RaplVendor,
    /// Wraparound modulus, in joules
    max_counter_value: f64,
}

struct RaplMsrAccess {
    /// File descriptor to the MSR device of one cpu
    fd: File,
    /// RAPL energy unit (a f32 would be enough but we only do f64-math with it)
    energy_unit: f64,
}

impl MsrSource {
    pub fn new(cpus: &[CpuId]) -> anyhow::Result<MsrSource> {
        check_socket_cpus(cpus)?;
        let vendor = cpu_vendor()?;
        let msr_per_socket = cpus
            .iter()
            .map(|CpuId { cpu, .. }| {
                let path = format!("/dev/cpu/{cpu}/msr");
                let fd = File::open(&path).with_context(|| format!("open {path}"))?;
                let energy_unit = read_energy_unit(&fd, vendor)?;
                Ok(RaplMsrAccess { fd, energy_unit })
            })
            .collect::<anyhow::Result<Vec<RaplMsrAccess>>>()?;

        // the energy status unit is a property of the CPU model, every socket
        // reports the same one
        let max_counter_value = msr_per_socket
            .first()
            .map(|msr| MSR_COUNTER_RANGE as f64 * msr.energy_unit)
            .unwrap_or(0.0);

        Ok(MsrSource {
            msr_per_socket,
            vendor,
            max_counter_value,
        })
    }
}

impl EnergySource for MsrSource {
    fn node_count(&self) -> u64 {
        self.msr_per_socket.len() as u64
    }

    fn supports_domain(&self, domain: EnergyDomain) -> bool {
        domain_msr_address(domain, self.vendor).is_some()
    }

    fn read_energy(&mut self, domain: EnergyDomain, node: Node) -> anyhow::Result<f64> {
        let msr = self
            .msr_per_socket
            .get(node as usize)
            .with_context(|| format!("no MSR access for node {node}"))?;
        let addr = domain_msr_address(domain, self.vendor)
            .with_context(|| format!("domain {domain} has no MSR on this vendor"))?;

        let msr_value = read_msr(&msr.fd, addr)
            .with_context(|| format!("failed to read MSR {addr:#x} for domain {domain}"))?;
        let counter_value = msr_value & MSR_ENERGY_MASK;

        Ok(counter_value as f64 * msr.energy_unit)
    }

    fn max_counter_value(&self) -> f64 {
        self.max_counter_value
    }
}

fn read_msr(msr: &File, at: Addr) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    msr.read_exact_at(&mut buf, at)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Extracts the energy unit from the Model Specific Register `msr`.
///
/// # Wrong values
///
/// Note that the returned energy unit may not apply for all measurements,
/// because some architectures use a different unit for some domains (e.g. DRAM).
/// This is platform-dependent, and not implemented here.
///
/// See [Linux source code - rapl.c](https://github.com/torvalds/linux/blob/0036fb00a756a2f6e360d44e2e3d2200a8afbc9b/arch/x86/events/rapl.c#L612)
fn read_energy_unit(msr: &File, vendor: RaplVendor) -> anyhow::Result<f64> {
    let offset = match vendor {
        RaplVendor::Intel => intel::MSR_RAPL_POWER_UNIT,
        RaplVendor::Amd => amd::MSR_RAPL_POWER_UNIT,
    };
    let msr_value = read_msr(msr, offset).context("failed to read the RAPL power unit MSR")?;
    Ok(energy_unit_from_power_unit_msr(msr_value))
}

/// The value we're interested in is "energy status unit" at bits 12:8 (mask 0x1F00).
/// The energy unit, aka "multiplier", is 1/(2^esu) = (1/2)^esu.
/// When we read an energy value from the MSR, the actual value is
/// `msr_value * multiplier` Joules.
fn energy_unit_from_power_unit_msr(msr_value: u64) -> f64 {
    let esu = (msr_value & 0x1F00) >> 8;
    0.5_f64.powi(esu as i32)
}

pub fn cpu_vendor() -> anyhow::Result<RaplVendor> {
    // run: LC_ALL=C lscpu
    let child = Command::new("lscpu")
        .env("LC_ALL", "C")
        .stdout(Stdio::piped())
        .spawn()
        .context("lscpu should be executable")?;
    let finished = child.wait_with_output()?;
    let stdout = std::str::from_utf8(&finished.stdout)?;

    parse_vendor(stdout)
}

fn parse_vendor(lscpu_output: &str) -> anyhow::Result<RaplVendor> {
    // find the Vendor ID
    let vendor_regex = Regex::new(r"Vendor ID:\s+(\w+)")?;
    let group = vendor_regex
        .captures(lscpu_output)
        .context("vendor id not found in lscpu output")?
        .get(1)
        .unwrap();
    let vendor = group.as_str().trim();

    // turn it into the right enum variant
    match vendor {
        "AuthenticAMD" => Ok(RaplVendor::Amd),
        "GenuineIntel" => Ok(RaplVendor::Intel),
        _ => Err(anyhow!("Unsupported CPU vendor {vendor}")),
    }
}

pub fn domain_msr_address(domain: EnergyDomain, vendor: RaplVendor) -> Option<Addr> {
    match vendor {
        RaplVendor::Intel => match domain {
            EnergyDomain::Package => Some(intel::MSR_PKG_ENERGY_STATUS),
            EnergyDomain::Core => Some(intel::MSR_PP0_ENERGY_STATUS),
            EnergyDomain::Uncore => Some(intel::MSR_PP1_ENERGY_STATUS),
            EnergyDomain::Dram => Some(intel::MSR_DRAM_ENERGY_STATUS),
        },
        RaplVendor::Amd => match domain {
            EnergyDomain::Package => Some(amd::MSR_PKG_ENERGY_STATUS),
            EnergyDomain::Core => Some(amd::MSR_CORE_ENERGY_STATUS),
            EnergyDomain::Uncore => None,
            EnergyDomain::Dram => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{domain_msr_address, energy_unit_from_power_unit_msr, parse_vendor, RaplVendor};
    use crate::domains::EnergyDomain;

    #[test]
    fn intel_has_every_domain_amd_does_not() {
        for domain in EnergyDomain::ALL {
            assert!(domain_msr_address(domain, RaplVendor::Intel).is_some());
        }
        assert!(domain_msr_address(EnergyDomain::Package, RaplVendor::Amd).is_some());
        assert!(domain_msr_address(EnergyDomain::Core, RaplVendor::Amd).is_some());
        assert!(domain_msr_address(EnergyDomain::Uncore, RaplVendor::Amd).is_none());
        assert!(domain_msr_address(EnergyDomain::Dram, RaplVendor::Amd).is_none());
    }

    #[test]
    fn test_energy_unit() {
        // esu = 16 (the usual Intel value): unit = 2^-16
        let msr_value = (0xA0E03 & !0x1F00) | (16 << 8);
        assert_eq!(energy_unit_from_power_unit_msr(msr_value), 1.0 / 65536.0);

        // esu = 0: raw joules
        assert_eq!(energy_unit_from_power_unit_msr(0), 1.0);
    }

    #[test]
    fn test_parse_vendor() {
        let intel = "Architecture:        x86_64\nVendor ID:           GenuineIntel\n";
        assert!(matches!(parse_vendor(intel), Ok(RaplVendor::Intel)));

        let amd = "Vendor ID:           AuthenticAMD\n";
        assert!(matches!(parse_vendor(amd), Ok(RaplVendor::Amd)));

        let other = "Vendor ID:           Cyrix\n";
        assert!(parse_vendor(other).is_err());
    }
}
