pub mod cpus;
pub mod domains;
pub mod meter;
pub mod msr;
pub mod perf_event;
pub mod powercap;
pub mod schedule;
pub mod sink;

pub use cpus::CpuId;
pub use domains::EnergyDomain;
pub use meter::{AccumulatorState, EnergyMeter, ReadError, SupportTable};
pub use sink::MetricSink;

/// Identifies one physical CPU package (socket), as a dense index `0..node_count`.
pub type Node = u32;

/// Gives access to the cumulative energy counters of the CPU.
///
/// Implementations read the counters through one of the kernel interfaces
/// (see [`msr`], [`powercap`], [`perf_event`]). Opening the interface is the
/// constructor's job and is the only fatal failure point; the file
/// descriptors are released on drop.
pub trait EnergySource: Send {
    /// Number of nodes (physical CPU packages) whose counters can be read.
    ///
    /// Fixed for the lifetime of the source.
    fn node_count(&self) -> u64;

    /// Whether `domain` is supported by this CPU model, according to the
    /// underlying interface.
    ///
    /// A `true` answer does not guarantee that a read will succeed: some
    /// steppings advertise a domain whose counter cannot actually be read.
    fn supports_domain(&self, domain: EnergyDomain) -> bool;

    /// Reads the raw value of the energy counter of `domain` on `node`, in joules.
    ///
    /// The value is cumulative and wraps back to zero after
    /// [`max_counter_value`](EnergySource::max_counter_value) joules.
    fn read_energy(&mut self, domain: EnergyDomain, node: Node) -> anyhow::Result<f64>;

    /// Value at which the raw counters wrap back to zero, in joules.
    fn max_counter_value(&self) -> f64;
}
