//! Partitioned runtime
//!
//! Users are hashed onto a fixed set of partitions. Each partition is a tokio
//! task that owns one [`PulseProcessor`] and drains a bounded command queue,
//! so every user's readings are handled in order by exactly one worker while
//! different partitions run in parallel. Outputs go to the shared
//! [`PublicationBus`].

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::PublicationBus;
use crate::config::PulseConfig;
use crate::error::ComputeError;
use crate::pipeline::{ProcessOutput, PulseProcessor};
use crate::types::{FusedMetric, Reading, SourceControl};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the user id bytes
fn fnv1a_hash(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Stable partition index for a user
pub fn partition_for(user_id: &str, partitions: usize) -> usize {
    (fnv1a_hash(user_id.as_bytes()) % partitions.max(1) as u64) as usize
}

#[derive(Debug)]
enum PartitionCommand {
    Reading(Reading),
    Control(SourceControl),
    EndSession(String),
    Flush(oneshot::Sender<()>),
    Snapshot {
        user_id: String,
        reply: oneshot::Sender<Vec<FusedMetric>>,
    },
    #[cfg(test)]
    Halt,
}

#[derive(Debug)]
struct Partition {
    sender: Option<mpsc::Sender<PartitionCommand>>,
    task: Option<JoinHandle<()>>,
}

/// Multi-partition stream processor
pub struct PulseRuntime {
    config: Arc<PulseConfig>,
    bus: PublicationBus,
    partitions: Vec<Mutex<Partition>>,
}

impl PulseRuntime {
    /// Spawn one worker per configured partition
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: PulseConfig, bus: PublicationBus) -> Result<Self, ComputeError> {
        config.validate()?;
        let config = Arc::new(config);

        let partitions = (0..config.partitions)
            .map(|idx| Mutex::new(spawn_partition(idx, &config, &bus)))
            .collect();
        info!(partitions = config.partitions, "pulse runtime started");

        Ok(Self {
            config,
            bus,
            partitions,
        })
    }

    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    pub fn bus(&self) -> &PublicationBus {
        &self.bus
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Queue a reading on its user's partition; waits only for queue capacity
    pub async fn ingest(&self, reading: Reading) -> Result<(), ComputeError> {
        let idx = partition_for(&reading.user_id, self.partitions.len());
        self.send(idx, PartitionCommand::Reading(reading)).await
    }

    pub async fn apply_control(&self, control: SourceControl) -> Result<(), ComputeError> {
        let idx = partition_for(&control.user_id, self.partitions.len());
        self.send(idx, PartitionCommand::Control(control)).await
    }

    /// Discard a user's state; nothing queued after this is affected
    pub async fn end_session(&self, user_id: &str) -> Result<(), ComputeError> {
        let idx = partition_for(user_id, self.partitions.len());
        self.send(idx, PartitionCommand::EndSession(user_id.to_string()))
            .await
    }

    /// Release every buffered reading on every partition and wait for it
    pub async fn flush(&self) -> Result<(), ComputeError> {
        let mut pending = Vec::with_capacity(self.partitions.len());
        for idx in 0..self.partitions.len() {
            let (tx, rx) = oneshot::channel();
            self.send(idx, PartitionCommand::Flush(tx)).await?;
            pending.push((idx, rx));
        }
        for (idx, rx) in pending {
            rx.await
                .map_err(|_| ComputeError::PartitionUnavailable(idx))?;
        }
        Ok(())
    }

    /// Authoritative fused state for a user, read from its partition
    pub async fn snapshot(&self, user_id: &str) -> Result<Vec<FusedMetric>, ComputeError> {
        let idx = partition_for(user_id, self.partitions.len());
        let (reply, rx) = oneshot::channel();
        self.send(
            idx,
            PartitionCommand::Snapshot {
                user_id: user_id.to_string(),
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| ComputeError::PartitionUnavailable(idx))
    }

    /// Published fused metrics older than the configured `stale_after`
    pub fn stale_metrics(&self) -> Vec<FusedMetric> {
        self.bus
            .fused()
            .stale(Utc::now(), self.config.stale_after())
    }

    /// Close every queue, let workers flush what they buffered, and join them
    pub async fn shutdown(&self) {
        let tasks: Vec<(usize, JoinHandle<()>)> = self
            .partitions
            .iter()
            .enumerate()
            .filter_map(|(idx, partition)| {
                let mut partition = partition.lock();
                partition.sender = None;
                partition.task.take().map(|task| (idx, task))
            })
            .collect();

        for (idx, task) in tasks {
            if let Err(e) = task.await {
                error!(partition = idx, error = %e, "partition worker failed");
            }
        }
        self.bus.close();
        info!("pulse runtime stopped");
    }

    async fn send(&self, idx: usize, command: PartitionCommand) -> Result<(), ComputeError> {
        let sender = self.sender(idx)?;
        match sender.send(command).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(command)) => {
                // worker is gone; its state is lost, start a fresh one
                let sender = self.respawn(idx, &sender)?;
                sender
                    .send(command)
                    .await
                    .map_err(|_| ComputeError::PartitionUnavailable(idx))
            }
        }
    }

    fn sender(&self, idx: usize) -> Result<mpsc::Sender<PartitionCommand>, ComputeError> {
        let partition = self
            .partitions
            .get(idx)
            .ok_or(ComputeError::PartitionUnavailable(idx))?;
        let partition = partition.lock();
        partition.sender.clone().ok_or(ComputeError::RuntimeClosed)
    }

    fn respawn(
        &self,
        idx: usize,
        dead: &mpsc::Sender<PartitionCommand>,
    ) -> Result<mpsc::Sender<PartitionCommand>, ComputeError> {
        let partition = self
            .partitions
            .get(idx)
            .ok_or(ComputeError::PartitionUnavailable(idx))?;
        let mut partition = partition.lock();
        let current = partition.sender.clone().ok_or(ComputeError::RuntimeClosed)?;

        // another caller may already have replaced it
        if !current.same_channel(dead) {
            return Ok(current);
        }

        error!(partition = idx, "partition worker died, respawning with empty state");
        *partition = spawn_partition(idx, &self.config, &self.bus);
        partition.sender.clone().ok_or(ComputeError::RuntimeClosed)
    }
}

fn spawn_partition(idx: usize, config: &Arc<PulseConfig>, bus: &PublicationBus) -> Partition {
    let (sender, receiver) = mpsc::channel(config.partition_queue_capacity);
    let task = tokio::spawn(run_partition(idx, Arc::clone(config), bus.clone(), receiver));
    Partition {
        sender: Some(sender),
        task: Some(task),
    }
}

async fn run_partition(
    idx: usize,
    config: Arc<PulseConfig>,
    bus: PublicationBus,
    mut commands: mpsc::Receiver<PartitionCommand>,
) {
    let mut processor = PulseProcessor::new(&config);
    let mut sweep = tokio::time::interval(std::time::Duration::from_millis(
        config.eviction_interval_ms,
    ));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    sweep.tick().await;

    debug!(partition = idx, "partition worker started");
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    PartitionCommand::Reading(reading) => {
                        // rejected readings are already logged by the processor
                        if let Ok(output) = processor.ingest_at(reading, Utc::now()) {
                            publish(&bus, output);
                        }
                        for user_id in processor.take_evicted() {
                            bus.fused().remove_user(&user_id);
                        }
                    }
                    PartitionCommand::Control(control) => {
                        publish(&bus, processor.apply_control(&control));
                    }
                    PartitionCommand::EndSession(user_id) => {
                        processor.end_session(&user_id);
                        bus.fused().remove_user(&user_id);
                    }
                    PartitionCommand::Flush(reply) => {
                        publish(&bus, processor.flush());
                        let _ = reply.send(());
                    }
                    PartitionCommand::Snapshot { user_id, reply } => {
                        let _ = reply.send(processor.snapshot(&user_id));
                    }
                    #[cfg(test)]
                    PartitionCommand::Halt => return,
                }
            }
            _ = sweep.tick() => {
                for user_id in processor.evict_idle(Utc::now()) {
                    bus.fused().remove_user(&user_id);
                }
            }
        }
    }

    let remaining = processor.flush();
    if !remaining.is_empty() {
        warn!(
            partition = idx,
            alerts = remaining.alerts.len(),
            "flushed buffered readings on shutdown"
        );
    }
    publish(&bus, remaining);
    debug!(partition = idx, "partition worker stopped");
}

fn publish(bus: &PublicationBus, output: ProcessOutput) {
    for alert in output.alerts {
        bus.publish_alert(alert);
    }
    for fused in output.fused {
        bus.publish_fused(fused);
    }
}
