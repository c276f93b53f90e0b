use std::fmt;

use clap::ValueEnum;
use enum_map::Enum;

/// The power domains measured independently by the CPU.
///
/// The declaration order is the hardware identifier order and is used to
/// index the per-domain tables, do not reorder the variants.
#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EnergyDomain {
    /// entire socket
    Package,
    /// power plane 0: the cores
    Core,
    /// power plane 1: uncore (iGPU, interconnect)
    Uncore,
    /// memory controller
    Dram,
}

impl EnergyDomain {
    pub const ALL: [EnergyDomain; 4] = [
        EnergyDomain::Package,
        EnergyDomain::Core,
        EnergyDomain::Uncore,
        EnergyDomain::Dram,
    ];

    /// The name of the domain in the emitted series identifiers.
    pub fn name(self) -> &'static str {
        match self {
            EnergyDomain::Package => "package",
            EnergyDomain::Core => "core",
            EnergyDomain::Uncore => "uncore",
            EnergyDomain::Dram => "dram",
        }
    }
}

impl fmt::Display for EnergyDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use enum_map::Enum;

    use super::EnergyDomain;

    #[test]
    fn catalog_order_matches_table_indices() {
        for (i, domain) in EnergyDomain::ALL.into_iter().enumerate() {
            assert_eq!(domain.into_usize(), i);
        }
        assert_eq!(EnergyDomain::ALL.len(), EnergyDomain::LENGTH);
    }

    #[test]
    fn domain_names() {
        let names: Vec<&str> = EnergyDomain::ALL.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["package", "core", "uncore", "dram"]);
    }
}
