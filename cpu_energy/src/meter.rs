use enum_map::EnumMap;
use thiserror::Error;

use crate::domains::EnergyDomain;
use crate::sink::MetricSink;
use crate::{EnergySource, Node};

/// Which (node, domain) pairs can actually be read.
///
/// Built once by [`EnergyMeter::new`]. A pair whose first read fails is
/// excluded for the lifetime of the process: entries never go back from
/// unsupported to supported.
pub struct SupportTable {
    per_node: Vec<EnumMap<EnergyDomain, bool>>,
}

impl SupportTable {
    fn new(node_count: usize) -> SupportTable {
        SupportTable {
            per_node: vec![EnumMap::default(); node_count],
        }
    }

    pub fn node_count(&self) -> usize {
        self.per_node.len()
    }

    pub fn is_supported(&self, node: Node, domain: EnergyDomain) -> bool {
        self.per_node[node as usize][domain]
    }

    fn set_supported(&mut self, node: Node, domain: EnergyDomain) {
        self.per_node[node as usize][domain] = true;
    }

    /// The readable pairs, in increasing node order then domain order.
    /// This is the order in which the sampling pass reads and emits.
    pub fn supported_pairs(&self) -> impl Iterator<Item = (Node, EnergyDomain)> + '_ {
        self.per_node.iter().enumerate().flat_map(|(node, domains)| {
            domains
                .iter()
                .filter(|(_, supported)| **supported)
                .map(move |(domain, _)| (node as Node, domain))
        })
    }
}

/// Accumulation state of one (node, domain) pair.
#[derive(Debug, Default, Clone, Copy)]
struct AccumulatorEntry {
    /// Raw value of the hardware counter at the previous read, in joules.
    last_raw_sample: f64,
    /// Total joules consumed since the meter was created.
    /// Never decreases between two successful sampling passes.
    cumulative_joules: f64,
}

/// The per-(node, domain) accumulation table.
///
/// Mutated only by [`EnergyMeter::sample_once`]; discarded with the meter,
/// a process restart starts the totals back at zero.
pub struct AccumulatorState {
    per_node: Vec<EnumMap<EnergyDomain, AccumulatorEntry>>,
}

impl AccumulatorState {
    fn new(node_count: usize) -> AccumulatorState {
        AccumulatorState {
            per_node: vec![EnumMap::default(); node_count],
        }
    }

    fn init_entry(&mut self, node: Node, domain: EnergyDomain, first_raw_sample: f64) {
        self.per_node[node as usize][domain] = AccumulatorEntry {
            last_raw_sample: first_raw_sample,
            cumulative_joules: 0.0,
        };
    }

    /// Applies a new raw sample and returns the updated cumulative total.
    ///
    /// `max_counter_value` is the wraparound modulus of the raw counter.
    /// At most one wraparound is assumed between two samples; the sampling
    /// interval must be bounded accordingly (see [`crate::schedule`]).
    fn apply(
        &mut self,
        node: Node,
        domain: EnergyDomain,
        new_sample: f64,
        max_counter_value: f64,
    ) -> f64 {
        let entry = &mut self.per_node[node as usize][domain];
        let mut delta = new_sample - entry.last_raw_sample;

        // the counter wrapped back to zero since the previous read
        if delta < 0.0 {
            delta += max_counter_value;
        }

        entry.last_raw_sample = new_sample;
        entry.cumulative_joules += delta;
        entry.cumulative_joules
    }

    pub fn cumulative_joules(&self, node: Node, domain: EnergyDomain) -> f64 {
        self.per_node[node as usize][domain].cumulative_joules
    }
}

/// Error returned when a supported counter could not be read during a
/// sampling pass.
///
/// The pass is aborted; the updates already applied in the same pass are
/// kept and the next scheduled pass retries naturally.
#[derive(Debug, Error)]
#[error("failed to read the {domain} energy counter of node {node}")]
pub struct ReadError {
    pub node: Node,
    pub domain: EnergyDomain,
    #[source]
    pub source: anyhow::Error,
}

/// Samples the energy counters of an [`EnergySource`] and maintains an
/// overflow-corrected cumulative total per (node, domain) pair.
pub struct EnergyMeter {
    source: Box<dyn EnergySource>,
    supported: SupportTable,
    state: AccumulatorState,
}

impl EnergyMeter {
    /// Probes every (node, domain) pair once and prepares the accumulation state.
    ///
    /// A domain that claims to be supported but fails its first read is
    /// logged and permanently excluded from sampling.
    pub fn new(source: Box<dyn EnergySource>) -> EnergyMeter {
        EnergyMeter::with_domains(source, &EnergyDomain::ALL)
    }

    /// Like [`EnergyMeter::new`], but only probes the listed domains.
    pub fn with_domains(mut source: Box<dyn EnergySource>, domains: &[EnergyDomain]) -> EnergyMeter {
        let node_count = source.node_count() as usize;
        log::info!("found {node_count} nodes (physical CPUs)");

        let mut supported = SupportTable::new(node_count);
        let mut state = AccumulatorState::new(node_count);

        for node in 0..node_count as Node {
            for domain in EnergyDomain::ALL {
                if !domains.contains(&domain) || !source.supports_domain(domain) {
                    continue;
                }
                match source.read_energy(domain, node) {
                    Ok(first_sample) => {
                        supported.set_supported(node, domain);
                        state.init_entry(node, domain, first_sample);
                    }
                    Err(e) => {
                        log::warn!(
                            "node {node} claims it supports domain {domain} but an attempt \
                             to read it has failed: {e:#}. \
                             Will not try to read this domain of this node again."
                        );
                    }
                }
            }
        }

        EnergyMeter {
            source,
            supported,
            state,
        }
    }

    /// Performs one sampling pass: reads every supported pair, applies the
    /// wraparound correction, and emits one cumulative observation per pair.
    ///
    /// A failed read aborts the pass and returns the error; the pairs
    /// already updated in this pass keep their new state. A failed emission
    /// is logged and does not stop the pass: the accumulation must not
    /// depend on the sink.
    pub fn sample_once(&mut self, sink: &mut dyn MetricSink) -> Result<(), ReadError> {
        let max_counter_value = self.source.max_counter_value();

        for node in 0..self.supported.node_count() as Node {
            for domain in EnergyDomain::ALL {
                if !self.supported.is_supported(node, domain) {
                    continue;
                }

                let new_sample = match self.source.read_energy(domain, node) {
                    Ok(value) => value,
                    Err(source) => {
                        return Err(ReadError { node, domain, source });
                    }
                };

                let cumulative = self.state.apply(node, domain, new_sample, max_counter_value);

                if let Err(e) = sink.emit(node, domain, cumulative) {
                    log::error!(
                        "failed to submit the energy of node {node}, domain {domain}: {e:#}"
                    );
                }
            }
        }

        Ok(())
    }

    pub fn support_table(&self) -> &SupportTable {
        &self.supported
    }

    pub fn accumulator(&self) -> &AccumulatorState {
        &self.state
    }

    /// The cumulative joules of a pair, or `None` if the pair is not readable.
    pub fn cumulative_joules(&self, node: Node, domain: EnergyDomain) -> Option<f64> {
        self.supported
            .is_supported(node, domain)
            .then(|| self.state.cumulative_joules(node, domain))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;

    use super::{EnergyMeter, ReadError};
    use crate::domains::EnergyDomain;
    use crate::sink::MetricSink;
    use crate::{EnergySource, Node};

    /// Source whose reads are scripted: each call to `read_energy` consumes
    /// the next result, in call order. The calls themselves are recorded.
    struct FakeSource {
        nodes: u64,
        claimed_domains: Vec<EnergyDomain>,
        max_counter_value: f64,
        reads: Arc<Mutex<VecDeque<anyhow::Result<f64>>>>,
        calls: Arc<Mutex<Vec<(Node, EnergyDomain)>>>,
    }

    impl FakeSource {
        fn new(nodes: u64, claimed_domains: &[EnergyDomain], max_counter_value: f64) -> FakeSource {
            FakeSource {
                nodes,
                claimed_domains: claimed_domains.to_vec(),
                max_counter_value,
                reads: Arc::new(Mutex::new(VecDeque::new())),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn script(&self, results: Vec<anyhow::Result<f64>>) {
            self.reads.lock().unwrap().extend(results);
        }

        fn handles(
            &self,
        ) -> (
            Arc<Mutex<VecDeque<anyhow::Result<f64>>>>,
            Arc<Mutex<Vec<(Node, EnergyDomain)>>>,
        ) {
            (Arc::clone(&self.reads), Arc::clone(&self.calls))
        }
    }

    impl EnergySource for FakeSource {
        fn node_count(&self) -> u64 {
            self.nodes
        }

        fn supports_domain(&self, domain: EnergyDomain) -> bool {
            self.claimed_domains.contains(&domain)
        }

        fn read_energy(&mut self, domain: EnergyDomain, node: Node) -> anyhow::Result<f64> {
            self.calls.lock().unwrap().push((node, domain));
            self.reads
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no scripted read left")))
        }

        fn max_counter_value(&self) -> f64 {
            self.max_counter_value
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        emitted: Vec<(Node, EnergyDomain, f64)>,
        failures_left: u32,
    }

    impl MetricSink for RecordingSink {
        fn emit(
            &mut self,
            node: Node,
            domain: EnergyDomain,
            cumulative_joules: f64,
        ) -> anyhow::Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(anyhow!("sink unavailable"));
            }
            self.emitted.push((node, domain, cumulative_joules));
            Ok(())
        }
    }

    use EnergyDomain::{Dram, Package};

    #[test]
    fn wraparound_scenario() {
        let source = FakeSource::new(1, &[Package], 100.0);
        source.script(vec![Ok(10.0), Ok(95.0), Ok(20.0), Ok(50.0)]);

        let mut meter = EnergyMeter::new(Box::new(source));
        assert_eq!(meter.cumulative_joules(0, Package), Some(0.0));

        let mut sink = RecordingSink::default();
        meter.sample_once(&mut sink).unwrap();
        meter.sample_once(&mut sink).unwrap();
        meter.sample_once(&mut sink).unwrap();

        assert_eq!(
            sink.emitted,
            vec![
                (0, Package, 85.0),  // 95 - 10
                (0, Package, 110.0), // wrapped: (20 - 95) + 100
                (0, Package, 140.0), // 50 - 20
            ]
        );
        assert_eq!(meter.cumulative_joules(0, Package), Some(140.0));
    }

    #[test]
    fn no_wrap_delta_is_exact() {
        let source = FakeSource::new(1, &[Package], 1000.0);
        source.script(vec![Ok(10.0), Ok(10.0), Ok(10.5)]);

        let mut meter = EnergyMeter::new(Box::new(source));
        let mut sink = RecordingSink::default();
        meter.sample_once(&mut sink).unwrap();
        meter.sample_once(&mut sink).unwrap();

        assert_eq!(sink.emitted, vec![(0, Package, 0.0), (0, Package, 0.5)]);
    }

    #[test]
    fn cumulative_never_decreases() {
        let source = FakeSource::new(1, &[Package], 100.0);
        let raws = [3.0, 50.0, 99.9, 7.0, 7.0, 42.0, 1.0, 88.0];
        source.script(raws.iter().map(|&r| Ok(r)).collect());

        let mut meter = EnergyMeter::new(Box::new(source));
        let mut sink = RecordingSink::default();
        for _ in 1..raws.len() {
            meter.sample_once(&mut sink).unwrap();
        }

        let series: Vec<f64> = sink.emitted.iter().map(|(_, _, j)| *j).collect();
        for pair in series.windows(2) {
            assert!(pair[1] >= pair[0], "cumulative energy decreased: {series:?}");
        }
    }

    #[test]
    fn probe_failure_excludes_pair_permanently() {
        let source = FakeSource::new(1, &[Package, Dram], 100.0);
        // package probes fine, dram claims support but cannot be read
        source.script(vec![Ok(5.0), Err(anyhow!("dram counter not implemented"))]);
        let (reads, calls) = source.handles();

        let mut meter = EnergyMeter::new(Box::new(source));
        assert!(meter.support_table().is_supported(0, Package));
        assert!(!meter.support_table().is_supported(0, Dram));
        assert_eq!(meter.cumulative_joules(0, Dram), None);

        reads.lock().unwrap().extend([Ok(6.0), Ok(7.0)]);
        let mut sink = RecordingSink::default();
        meter.sample_once(&mut sink).unwrap();
        meter.sample_once(&mut sink).unwrap();

        // dram was read once (the failed probe) and never again
        assert_eq!(
            *calls.lock().unwrap(),
            vec![(0, Package), (0, Dram), (0, Package), (0, Package)]
        );
        assert_eq!(sink.emitted, vec![(0, Package, 1.0), (0, Package, 2.0)]);
    }

    #[test]
    fn unclaimed_domain_is_never_read() {
        let source = FakeSource::new(2, &[], 100.0);
        let (_, calls) = source.handles();

        let mut meter = EnergyMeter::new(Box::new(source));
        let mut sink = RecordingSink::default();
        meter.sample_once(&mut sink).unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert!(sink.emitted.is_empty());
    }

    #[test]
    fn read_failure_aborts_pass_but_keeps_partial_progress() {
        let source = FakeSource::new(2, &[Package], 100.0);
        source.script(vec![Ok(10.0), Ok(20.0)]); // initial probes
        let (reads, _) = source.handles();

        let mut meter = EnergyMeter::new(Box::new(source));
        let mut sink = RecordingSink::default();

        // node 0 reads fine, node 1 fails: the pass stops there
        reads
            .lock()
            .unwrap()
            .extend([Ok(15.0), Err(anyhow!("device busy"))]);
        let err: ReadError = meter.sample_once(&mut sink).unwrap_err();
        assert_eq!((err.node, err.domain), (1, Package));

        // the successful update of node 0 is retained
        assert_eq!(sink.emitted, vec![(0, Package, 5.0)]);
        assert_eq!(meter.cumulative_joules(0, Package), Some(5.0));
        assert_eq!(meter.cumulative_joules(1, Package), Some(0.0));

        // the next tick retries both pairs from the carried-over state
        reads.lock().unwrap().extend([Ok(16.0), Ok(30.0)]);
        meter.sample_once(&mut sink).unwrap();
        assert_eq!(meter.cumulative_joules(0, Package), Some(6.0));
        assert_eq!(meter.cumulative_joules(1, Package), Some(10.0));
    }

    #[test]
    fn emit_failure_does_not_stop_the_pass() {
        let source = FakeSource::new(2, &[Package], 100.0);
        source.script(vec![Ok(10.0), Ok(20.0), Ok(11.0), Ok(22.0)]);

        let mut meter = EnergyMeter::new(Box::new(source));
        let mut sink = RecordingSink {
            failures_left: 1, // reject the first observation of the pass
            ..RecordingSink::default()
        };
        meter.sample_once(&mut sink).unwrap();

        // both accumulators were updated, only the second emission went through
        assert_eq!(sink.emitted, vec![(1, Package, 2.0)]);
        assert_eq!(meter.cumulative_joules(0, Package), Some(1.0));
        assert_eq!(meter.cumulative_joules(1, Package), Some(2.0));
    }

    #[test]
    fn no_nodes_is_inert() {
        let source = FakeSource::new(0, &[Package, Dram], 100.0);
        let (_, calls) = source.handles();

        let mut meter = EnergyMeter::new(Box::new(source));
        let mut sink = RecordingSink::default();
        meter.sample_once(&mut sink).unwrap();
        meter.sample_once(&mut sink).unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert!(sink.emitted.is_empty());
    }

    #[test]
    fn emission_order_is_node_then_domain() {
        let source = FakeSource::new(2, &[Package, Dram], 1000.0);
        source.script(vec![
            Ok(1.0),
            Ok(2.0),
            Ok(3.0),
            Ok(4.0), // probes
            Ok(2.0),
            Ok(4.0),
            Ok(6.0),
            Ok(8.0), // first pass
        ]);

        let mut meter = EnergyMeter::new(Box::new(source));
        assert_eq!(
            meter.support_table().supported_pairs().collect::<Vec<_>>(),
            vec![(0, Package), (0, Dram), (1, Package), (1, Dram)]
        );

        let mut sink = RecordingSink::default();
        meter.sample_once(&mut sink).unwrap();
        assert_eq!(
            sink.emitted,
            vec![
                (0, Package, 1.0),
                (0, Dram, 2.0),
                (1, Package, 3.0),
                (1, Dram, 4.0),
            ]
        );
    }

    #[test]
    fn domain_filter_restricts_probing() {
        let source = FakeSource::new(1, &[Package, Dram], 100.0);
        source.script(vec![Ok(5.0)]);
        let (_, calls) = source.handles();

        let meter = EnergyMeter::with_domains(Box::new(source), &[Package]);
        assert!(meter.support_table().is_supported(0, Package));
        assert!(!meter.support_table().is_supported(0, Dram));
        assert_eq!(*calls.lock().unwrap(), vec![(0, Package)]);
    }
}
