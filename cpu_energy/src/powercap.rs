// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fmt::Display,
    fs::{self, File},
    io::{Read, Seek},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use enum_map::EnumMap;

use crate::domains::EnergyDomain;
use crate::{EnergySource, Node};

const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";
const POWERCAP_ENERGY_UNIT: f64 = 0.000_001; // 1 microjoule

/// Hierarchy of power zones
pub struct PowerZoneHierarchy {
    /// All the zones in the same Vec.
    pub flat: Vec<PowerZone>,
    /// The top zones. To access their children, use [PowerZone::children].
    pub top: Vec<PowerZone>,
}

/// A power zone.
#[derive(Debug, Clone)]
pub struct PowerZone {
    /// The name of the zone, as returned by powercap, for instance `package-0` or `core`.
    pub name: String,

    /// The energy domain measured by the zone, as an enum
    pub domain: EnergyDomain,

    /// The path of the zone in sysfs, for instance
    /// `/sys/devices/virtual/powercap/intel-rapl/intel-rapl:0`.
    ///
    /// Note that in the above path, `intel-rapl` is the "control type"
    /// and "intel-rapl:0" is the power zone.
    pub path: PathBuf,

    /// The sub-zones (can be empty).
    pub children: Vec<PowerZone>,

    /// The id of the socket that "contains" this zone.
    pub socket_id: u32,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }

    fn fmt_rec(&self, f: &mut std::fmt::Formatter<'_>, level: i8) -> std::fmt::Result {
        let mut indent = "  ".repeat(level as _);
        if level > 0 {
            indent.insert(0, '\n');
        }

        let powercap_name = &self.name;
        let domain = self.domain;
        let path = self.path.to_string_lossy();

        write!(f, "{indent}- {powercap_name} ({domain}) \t\t: {path}")?;
        for subzone in &self.children {
            subzone.fmt_rec(f, level + 1)?;
        }
        Ok(())
    }
}

impl Display for PowerZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_rec(f, 0)
    }
}

fn parse_zone_name(name: &str) -> Option<EnergyDomain> {
    match name {
        "core" => Some(EnergyDomain::Core),
        "uncore" => Some(EnergyDomain::Uncore),
        "dram" => Some(EnergyDomain::Dram),
        _ if name.starts_with("package-") => Some(EnergyDomain::Package),
        // psys and other exotic zones are not measured
        _ => None,
    }
}

/// Discovers all the RAPL power zones in the powercap sysfs.
pub fn all_power_zones() -> anyhow::Result<PowerZoneHierarchy> {
    /// Recursively explore a power zone
    fn explore_rec(
        dir: &Path,
        parent_socket: Option<u32>,
        flat: &mut Vec<PowerZone>,
    ) -> anyhow::Result<Vec<PowerZone>> {
        let mut zones = Vec::new();
        for e in fs::read_dir(dir)? {
            let entry = e?;
            let path = entry.path();
            let file_name = path.file_name().unwrap().to_string_lossy();

            if path.is_dir() && file_name.starts_with(POWER_ZONE_PREFIX) {
                let name_path = path.join("name");
                let name = fs::read_to_string(&name_path)?.trim().to_owned();
                let socket_id = {
                    if let Some(parent_id) = parent_socket {
                        Some(parent_id)
                    } else if let Some(id_str) = name.strip_prefix("package-") {
                        let id: u32 = id_str
                            .parse()
                            .with_context(|| format!("Failed to extract package id from '{name}'"))?;
                        Some(id)
                    } else {
                        None
                    }
                };
                let Some(domain) = parse_zone_name(&name) else {
                    log::debug!("skipping powercap zone {name}");
                    continue;
                };
                let Some(socket_id) = socket_id else {
                    log::debug!("skipping powercap zone {name}: no socket");
                    continue;
                };
                let children = explore_rec(&path, Some(socket_id), flat)?; // recursively explore
                let zone = PowerZone {
                    name,
                    domain,
                    path,
                    children,
                    socket_id,
                };
                zones.push(zone.clone());
                flat.push(zone);
            }
        }
        zones.sort_by_key(|z| z.path.to_string_lossy().to_string());
        Ok(zones)
    }
    let mut flat = Vec::new();
    let top = explore_rec(Path::new(POWERCAP_RAPL_PATH), None, &mut flat)?;
    Ok(PowerZoneHierarchy { flat, top })
}

/// Reads the energy counters through the powercap sysfs.
pub struct PowercapSource {
    /// The opened `energy_uj` files, indexed by (node, domain)
    zones: Vec<EnumMap<EnergyDomain, Option<File>>>,
    /// Architectural support, per domain: a domain is supported if at least
    /// one zone measures it
    domain_present: EnumMap<EnergyDomain, bool>,
    /// Wraparound modulus, in joules
    max_counter_value: f64,
}

impl PowercapSource {
    pub fn new(zones: &[&PowerZone]) -> anyhow::Result<PowercapSource> {
        if zones.is_empty() {
            return Err(anyhow!("At least one power zone is required for PowercapSource"));
        }

        let node_count = zones.iter().map(|z| z.socket_id + 1).max().unwrap_or(0);
        let mut opened: Vec<EnumMap<EnergyDomain, Option<File>>> =
            std::iter::repeat_with(EnumMap::default)
                .take(node_count as usize)
                .collect();
        let mut domain_present = EnumMap::default();
        let mut max_energy_uj: u64 = 0;

        for zone in zones {
            let file = File::open(zone.energy_path())
                .with_context(|| format!("open {}", zone.energy_path().to_string_lossy()))?;

            let str_max_energy_uj = fs::read_to_string(zone.max_energy_path())
                .with_context(|| format!("read {}", zone.max_energy_path().to_string_lossy()))?;

            let zone_max_uj: u64 = str_max_energy_uj
                .trim_end()
                .parse()
                .with_context(|| format!("parse max_energy_range_uj: '{str_max_energy_uj}'"))?;

            // The zones can have different ranges (dram is usually narrower
            // than package). The correction modulus is unique, keeping the
            // largest range guarantees that every corrected delta stays >= 0.
            max_energy_uj = max_energy_uj.max(zone_max_uj);

            domain_present[zone.domain] = true;
            opened[zone.socket_id as usize][zone.domain] = Some(file);
        }

        Ok(PowercapSource {
            zones: opened,
            domain_present,
            max_counter_value: max_energy_uj as f64 * POWERCAP_ENERGY_UNIT,
        })
    }
}

impl EnergySource for PowercapSource {
    fn node_count(&self) -> u64 {
        self.zones.len() as u64
    }

    fn supports_domain(&self, domain: EnergyDomain) -> bool {
        self.domain_present[domain]
    }

    fn read_energy(&mut self, domain: EnergyDomain, node: Node) -> anyhow::Result<f64> {
        let file = self
            .zones
            .get_mut(node as usize)
            .and_then(|domains| domains[domain].as_mut())
            .with_context(|| format!("no powercap zone for node {node}, domain {domain}"))?;

        // read the file from the beginning
        // the content of `energy_uj` never exceeds 16 bytes
        let mut content = String::with_capacity(16);
        file.rewind()?;
        file.read_to_string(&mut content)?;

        let energy_uj: u64 = content
            .trim_end()
            .parse()
            .with_context(|| format!("failed to parse energy_uj: '{}'", content.trim_end()))?;

        Ok(energy_uj as f64 * POWERCAP_ENERGY_UNIT)
    }

    fn max_counter_value(&self) -> f64 {
        self.max_counter_value
    }
}

#[cfg(test)]
mod tests {
    use super::parse_zone_name;
    use crate::domains::EnergyDomain;

    #[test]
    fn test_parse_zone_name() {
        assert_eq!(parse_zone_name("package-0"), Some(EnergyDomain::Package));
        assert_eq!(parse_zone_name("package-13"), Some(EnergyDomain::Package));
        assert_eq!(parse_zone_name("core"), Some(EnergyDomain::Core));
        assert_eq!(parse_zone_name("uncore"), Some(EnergyDomain::Uncore));
        assert_eq!(parse_zone_name("dram"), Some(EnergyDomain::Dram));
        assert_eq!(parse_zone_name("psys"), None);
        assert_eq!(parse_zone_name("mmio"), None);
    }
}
