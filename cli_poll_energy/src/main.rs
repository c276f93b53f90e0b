use anyhow::ensure;
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use cpu_energy::perf_event::{self, PerfEventSource, PowerEvent};
use cpu_energy::powercap::{self, PowerZone, PowerZoneHierarchy, PowercapSource};
use cpu_energy::{cpus, msr, schedule, EnergyDomain, EnergyMeter, EnergySource};

use cli::{Cli, Commands, OutputType, SourceType};

mod cli;
mod poller;

const MEASUREMENTS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const WRITER_BUFFER_CAPACITY: usize = 8192 * 10;

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    match cli.command {
        Commands::Info => print_info(),
        Commands::Poll {
            source,
            domains,
            interval,
            output,
            output_file,
        } => {
            ensure!(interval > 0.0, "the sampling interval must be positive");
            // counters must be read often enough to catch every wraparound
            let period = schedule::bounded_interval(Duration::from_secs_f64(interval));

            let domains = domains.unwrap_or_else(|| EnergyDomain::ALL.to_vec());
            let source = build_source(source, &domains)?;
            let meter = EnergyMeter::with_domains(source, &domains);

            if meter.support_table().supported_pairs().next().is_none() {
                warn!("no readable (node, domain) pair, nothing will be reported");
            }

            // prepare the output, if any
            let writer: Box<dyn Write + Send> = match output {
                OutputType::None => Box::new(std::io::sink()),
                OutputType::Stdout => Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, std::io::stdout())),
                OutputType::File => {
                    let filename = if let Some(f) = output_file {
                        f
                    } else {
                        // create the csv file
                        let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
                        format!("energy-{now}.csv")
                    };
                    let file = File::create(filename)?;
                    let writer = BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, file);
                    // return the writer
                    Box::new(writer)
                }
            };

            poller::run(meter, writer, period, MEASUREMENTS_FLUSH_INTERVAL).await
        }
    }
}

fn build_source(kind: SourceType, domains: &[EnergyDomain]) -> anyhow::Result<Box<dyn EnergySource>> {
    match kind {
        SourceType::Msr => {
            let socket_cpus = cpus::cpus_to_monitor()?;
            Ok(Box::new(msr::MsrSource::new(&socket_cpus)?))
        }
        SourceType::Powercap => {
            let power_zones = powercap::all_power_zones()?;
            // the powercap zones are organized in a hierarchy, the flat view has them all
            let filtered_zones: Vec<&PowerZone> = power_zones
                .flat
                .iter()
                .filter(|z| domains.contains(&z.domain))
                .collect();
            Ok(Box::new(PowercapSource::new(&filtered_zones)?))
        }
        SourceType::PerfEvent => {
            let socket_cpus = cpus::cpus_to_monitor()?;
            let perf_events = perf_event::all_power_events()?;
            let filtered_events: Vec<&PowerEvent> =
                perf_events.iter().filter(|e| domains.contains(&e.domain)).collect();
            Ok(Box::new(PerfEventSource::new(&socket_cpus, &filtered_events)?))
        }
    }
}

fn print_info() -> anyhow::Result<()> {
    // get cpu info, accessible perf events and power zones
    let all_cpus = cpus::online_cpus()?;
    let socket_cpus = cpus::cpus_to_monitor()?;
    let perf_events = perf_event::all_power_events()?;
    let power_zones = powercap::all_power_zones()?;

    let n_sockets = socket_cpus.len();
    let n_cpu_cores = all_cpus.len();
    info!("{n_sockets}/{n_cpu_cores} monitorable CPU (cores) found: {socket_cpus:?}");

    // check the consistency of the RAPL interfaces
    let available_domains = check_domains_consistency(&perf_events, &power_zones);

    println!("\nFound RAPL perf events:");
    for evt in &perf_events {
        println!("- {evt:?}");
    }

    println!("\nFound powercap zones:");
    for zone in &power_zones.top {
        println!("{zone}");
    }

    println!("\nAll available energy domains: {}", mkstring(&available_domains, ", "));
    Ok(())
}

fn check_domains_consistency(perf_events: &[PowerEvent], power_zones: &PowerZoneHierarchy) -> Vec<EnergyDomain> {
    // get all the domains available via perf-events
    let mut perf_domains: Vec<EnergyDomain> = perf_events.iter().map(|e| e.domain).collect();
    perf_domains.sort_by_key(|k| k.to_string());
    perf_domains.dedup_by_key(|k| k.to_string());

    // get all the domains available via Powercap
    let mut powercap_domains: Vec<EnergyDomain> = power_zones.flat.iter().map(|z| z.domain).collect();
    powercap_domains.sort_by_key(|k| k.to_string());
    powercap_domains.dedup_by_key(|k| k.to_string());

    if perf_domains != powercap_domains {
        warn!("Powercap and perf-event don't report the same RAPL domains. This may be due to a bug in powercap or in perf-event.");
        warn!("Upgrading to a newer kernel could fix the problem.");
        warn!("Perf-event: {}", mkstring(&perf_domains, ", "));
        warn!("Powercap:   {}", mkstring(&powercap_domains, ", "));

        match msr::cpu_vendor() {
            Ok(msr::RaplVendor::Amd) => warn!(
                "AMD cpus only support the \"package\" domain (and sometimes \"core\"), \
                 but their support is buggy on old Linux kernels: every event is present \
                 in the sysfs, even the unusable ones. This seems to have been fixed in \
                 Linux 5.17."
            ),
            Ok(_) => (),
            Err(e) => {
                // not dramatic, we can proceed
                warn!("Failed to detect the cpu vendor. {e}");
            }
        };
    } else {
        info!("Available energy domains: {}", mkstring(&perf_domains, ", "));
    }

    if perf_domains.len() >= powercap_domains.len() {
        perf_domains
    } else {
        powercap_domains
    }
}

/// Takes a slice of elements that can be converted to strings, converts them and joins them all.
fn mkstring<A: ToString>(elems: &[A], sep: &str) -> String {
    elems.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(sep)
}
