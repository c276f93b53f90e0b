use anyhow::anyhow;
use futures::stream::StreamExt;
use std::io::Write;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{self, Sender};
use tokio_timerfd::Interval;

use cpu_energy::sink::series_identifier;
use cpu_energy::{EnergyDomain, EnergyMeter, MetricSink, Node};

const METRIC_CHANNEL_CAPACITY: usize = 4096;

/// One cumulative energy observation, as sent to the writer task.
#[derive(Debug, Clone, Copy)]
struct Observation {
    timestamp: SystemTime,
    node: Node,
    domain: EnergyDomain,
    cumulative_joules: f64,
}

/// Sink that hands the observations over to the writer task.
struct ChannelSink {
    tx: Sender<Observation>,
}

impl MetricSink for ChannelSink {
    fn emit(&mut self, node: Node, domain: EnergyDomain, cumulative_joules: f64) -> anyhow::Result<()> {
        let obs = Observation {
            timestamp: SystemTime::now(),
            node,
            domain,
            cumulative_joules,
        };
        self.tx
            .try_send(obs)
            .map_err(|e| anyhow!("failed to hand the observation to the writer task: {e}"))
    }
}

pub async fn run(
    meter: EnergyMeter,
    mut writer: Box<dyn Write + Send>,
    sampling_period: Duration,
    measurement_flush_interval: Duration,
) -> anyhow::Result<()> {
    // open a Channel to write to the output in another thread
    let (tx, mut rx) = mpsc::channel::<Observation>(METRIC_CHANNEL_CAPACITY);

    // Start the writer task, which will receive the observations from the
    // channel and write them to the selected output.
    let handle = tokio::spawn(async move {
        let mut previous_flush: SystemTime = SystemTime::now();

        // write the csv header
        writer.write_all("timestamp_ms;identifier;cumulative_joules\n".as_bytes())?;
        while let Some(obs) = rx.recv().await {
            write_observation(&mut writer, &obs)?;

            let time_since_last_flush = obs
                .timestamp
                .duration_since(previous_flush)
                .unwrap_or(Duration::ZERO);

            if time_since_last_flush >= measurement_flush_interval {
                previous_flush = obs.timestamp;
                writer.flush()?;
            }
        }

        anyhow::Ok(())
    });

    // Start the sampling task, which will read the energy counters at regular
    // intervals and send the observations to the writer task, through the channel.
    sample_periodically(meter, sampling_period, tx).await?;

    handle.await??;

    Ok(())
}

async fn sample_periodically(
    mut meter: EnergyMeter,
    period: Duration,
    tx: Sender<Observation>,
) -> anyhow::Result<()> {
    // Underneath, this uses a periodic timer from timerfd, which has a higher
    // resolution than std::time::sleep and tokio::time::sleep.
    let mut interval = Interval::new_interval(period)?;
    let mut sink = ChannelSink { tx };

    loop {
        // wait for the next tick of the periodic timer
        interval.next().await;

        // one sampling pass: read every supported pair and emit the totals
        if let Err(e) = meter.sample_once(&mut sink) {
            // the accumulated state carries over, the next tick retries
            log::error!("sampling pass aborted: {e}: {:#}", e.source);
        }
    }
}

fn write_observation(writer: &mut dyn Write, obs: &Observation) -> anyhow::Result<()> {
    let timestamp_ms = obs.timestamp.duration_since(SystemTime::UNIX_EPOCH)?.as_millis();
    let identifier = series_identifier(obs.node, obs.domain);
    writeln!(writer, "{timestamp_ms};{identifier};{}", obs.cumulative_joules)?;
    Ok(())
}
