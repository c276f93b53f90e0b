use crate::domains::EnergyDomain;
use crate::Node;

/// Name of the plugin, used as the first component of the series identifiers.
pub const PLUGIN_NAME: &str = "intel_cpu_energy";

/// Receives the cumulative energy observations produced by a sampling pass.
///
/// A sink failure never aborts a sampling pass: the accumulated state is
/// updated before the emission and carries over to the next pass.
pub trait MetricSink {
    /// Accepts one observation: the total joules consumed by `domain` of
    /// `node` since the meter was created.
    fn emit(&mut self, node: Node, domain: EnergyDomain, cumulative_joules: f64)
        -> anyhow::Result<()>;
}

/// Formats the identifier of a series, of the form
/// `plugin-instance/type-instance`, e.g. `intel_cpu_energy-cpu0/energy-package`.
pub fn series_identifier(node: Node, domain: EnergyDomain) -> String {
    format!("{PLUGIN_NAME}-cpu{node}/energy-{}", domain.name())
}
