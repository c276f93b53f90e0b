use anyhow::{Context, Result};
use enum_map::EnumMap;
use log::debug;
use perf_event_open_sys as sys;
use std::{
    fs::{self, File},
    io::{self, Read},
    os::fd::FromRawFd,
    path::Path,
};

use crate::cpus::{check_socket_cpus, CpuId};
use crate::domains::EnergyDomain;
use crate::{EnergySource, Node};

// See https://github.com/torvalds/linux/commit/4788e5b4b2338f85fa42a712a182d8afd65d7c58
// for an explaination of the RAPL PMU driver.

/// The PMU accumulates the energy on 64 bits, the counters virtually never wrap.
const PERF_COUNTER_RANGE: f64 = u64::MAX as f64;

#[derive(Debug)]
pub struct PowerEvent {
    /// The name of the power event, as reported by the sysfs. This corresponds to a RAPL **domain name**, like "pkg".
    pub name: String,
    /// The energy domain measured by the event, as an enum.
    pub domain: EnergyDomain,
    /// The event code to use as a "config" field for perf_event_open
    pub code: u8,
    /// should be "Joules"
    pub unit: String,
    /// The scale to apply in order to get joules (`energy_j = count * scale`).
    /// Should be "0x1.0p-32" (thus, f32 is fine)
    pub scale: f32,
}

impl PowerEvent {
    /// Make a system call to [perf_event_open](https://www.man7.org/linux/man-pages/man2/perf_event_open.2.html)
    /// with `attr.config = self.code` and `attr.type = pmu_type`.
    ///
    /// # Arguments
    /// * `pmu_type` - The type of the RAPL PMU, given by [`pmu_type()`].
    /// * `cpu_id` - Defines which CPU (core) to monitor, given by [`crate::cpus::cpus_to_monitor()`]
    pub fn perf_event_open(&self, pmu_type: u32, cpu_id: u32) -> std::io::Result<i32> {
        // Only some combination of (pid, cpu) are valid.
        // For RAPL PMU events, we use (-1, cpu) which means "all processes, one cpu".
        let pid = -1; // all processes
        let cpu = cpu_id as i32;

        let mut attr = sys::bindings::perf_event_attr::default();
        attr.config = self.code.into();
        attr.type_ = pmu_type;
        attr.size = core::mem::size_of_val(&attr) as u32;
        debug!("{attr:?}");

        let result = unsafe { sys::perf_event_open(&mut attr, pid, cpu, -1, 0) };
        if result == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(result)
        }
    }
}

/// Retrieves the type of the RAPL PMU (Power Monitoring Unit) in the Linux kernel.
pub fn pmu_type() -> Result<u32> {
    let path = Path::new("/sys/devices/power/type");
    let read = fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    let typ = read
        .trim_end()
        .parse()
        .with_context(|| format!("Failed to parse {path:?}: '{read}'"))?;
    Ok(typ)
}

fn parse_event_name(name: &str) -> Option<EnergyDomain> {
    match name {
        "pkg" => Some(EnergyDomain::Package),
        "cores" => Some(EnergyDomain::Core),
        "gpu" => Some(EnergyDomain::Uncore),
        "ram" => Some(EnergyDomain::Dram),
        // psys and other exotic events are not measured
        _ => None,
    }
}

fn parse_event_code(read: &str) -> Result<u8> {
    let code_str = read
        .trim_end()
        .strip_prefix("event=0x")
        .with_context(|| format!("Failed to strip the event code: '{read}'"))?;
    let code = u8::from_str_radix(code_str, 16).with_context(|| format!("Failed to parse the event code: '{read}'"))?; // hexadecimal
    Ok(code)
}

/// Retrieves the usable RAPL power events exposed in sysfs.
/// There can be more than just `pkg`, `cores`, `gpu` and `ram`, the others
/// are skipped.
pub fn all_power_events() -> Result<Vec<PowerEvent>> {
    let mut events: Vec<PowerEvent> = Vec::new();

    fn read_event_code(path: &Path) -> Result<u8> {
        let read = fs::read_to_string(path)?;
        parse_event_code(&read)
    }

    fn read_event_unit(main: &Path) -> Result<String> {
        let mut path = main.to_path_buf();
        path.set_extension("unit");
        let unit_str = fs::read_to_string(path)?.trim_end().to_string();
        Ok(unit_str)
    }

    fn read_event_scale(main: &Path) -> Result<f32> {
        let mut path = main.to_path_buf();
        path.set_extension("scale");
        let read = fs::read_to_string(&path)?;
        let scale = read
            .trim_end()
            .parse()
            .with_context(|| format!("Failed to parse {path:?}: '{read}'"))?;
        Ok(scale)
    }

    // Find all the events
    for e in fs::read_dir("/sys/devices/power/events")? {
        let entry = e?;
        let path = entry.path();
        let file_name = path.file_name().unwrap().to_string_lossy();
        // only list the main file, not *.unit nor *.scale
        if path.is_file() && !file_name.contains('.') {
            // The files are named "energy-pkg", "energy-ram", ...
            if let Some(event_name) = file_name.strip_prefix("energy-") {
                let Some(domain) = parse_event_name(event_name) else {
                    debug!("skipping power event {event_name}");
                    continue;
                };
                // We have the name of the event, we can read all the info
                let name = event_name.to_owned();
                let code = read_event_code(&path)?;
                let unit = read_event_unit(&path)?;
                let scale = read_event_scale(&path)?;
                events.push(PowerEvent {
                    name,
                    domain,
                    code,
                    unit,
                    scale,
                })
            }
        }
    }
    Ok(events)
}

/// Reads the energy counters through the RAPL PMU, with perf_event_open.
pub struct PerfEventSource {
    /// The opened events, indexed by (node, domain)
    events: Vec<EnumMap<EnergyDomain, Option<OpenedPowerEvent>>>,
    /// Architectural support, per domain: a domain is supported if its
    /// power event exists
    domain_present: EnumMap<EnergyDomain, bool>,
    /// Wraparound modulus, in joules
    max_counter_value: f64,
}

struct OpenedPowerEvent {
    fd: File,
    scale: f64,
}

impl PerfEventSource {
    pub fn new(socket_cpus: &[CpuId], events: &[&PowerEvent]) -> anyhow::Result<PerfEventSource> {
        check_socket_cpus(socket_cpus)?;
        let pmu_type = pmu_type()?;

        let mut opened: Vec<EnumMap<EnergyDomain, Option<OpenedPowerEvent>>> =
            std::iter::repeat_with(EnumMap::default)
                .take(socket_cpus.len())
                .collect();
        let mut domain_present = EnumMap::default();
        let mut max_counter_value: f64 = 0.0;

        for CpuId { cpu, socket } in socket_cpus {
            for event in events {
                let raw_fd = event
                    .perf_event_open(pmu_type, *cpu)
                    .with_context(|| format!("perf_event_open failed for {}", event.name))?;
                let fd = unsafe { File::from_raw_fd(raw_fd) };
                let scale = event.scale as f64;

                // the scale can differ between events, keep the largest
                // modulus so that every corrected delta stays >= 0
                max_counter_value = max_counter_value.max(PERF_COUNTER_RANGE * scale);

                domain_present[event.domain] = true;
                opened[*socket as usize][event.domain] = Some(OpenedPowerEvent { fd, scale });
            }
        }

        Ok(PerfEventSource {
            events: opened,
            domain_present,
            max_counter_value,
        })
    }
}

impl EnergySource for PerfEventSource {
    fn node_count(&self) -> u64 {
        self.events.len() as u64
    }

    fn supports_domain(&self, domain: EnergyDomain) -> bool {
        self.domain_present[domain]
    }

    fn read_energy(&mut self, domain: EnergyDomain, node: Node) -> anyhow::Result<f64> {
        let evt = self
            .events
            .get_mut(node as usize)
            .and_then(|domains| domains[domain].as_mut())
            .with_context(|| format!("no power event for node {node}, domain {domain}"))?;

        let counter_value = read_perf_event(&mut evt.fd)
            .with_context(|| format!("failed to read the power event for domain {domain}"))?;

        Ok(counter_value as f64 * evt.scale)
    }

    fn max_counter_value(&self) -> f64 {
        self.max_counter_value
    }
}

fn read_perf_event(fd: &mut File) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    // rewind() is INVALID for perf events, we must read "at the cursor" every time
    fd.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::{parse_event_code, parse_event_name};
    use crate::domains::EnergyDomain;

    #[test]
    fn test_parse_event_name() {
        assert_eq!(parse_event_name("pkg"), Some(EnergyDomain::Package));
        assert_eq!(parse_event_name("cores"), Some(EnergyDomain::Core));
        assert_eq!(parse_event_name("gpu"), Some(EnergyDomain::Uncore));
        assert_eq!(parse_event_name("ram"), Some(EnergyDomain::Dram));
        assert_eq!(parse_event_name("psys"), None);
    }

    #[test]
    fn test_parse_event_code() {
        assert_eq!(parse_event_code("event=0x02\n").unwrap(), 2);
        assert_eq!(parse_event_code("event=0x1a").unwrap(), 0x1a);
        assert!(parse_event_code("config=0x02").is_err());
    }
}
