//! Process group formation and device affinity.

use crate::backend::TrainingBackend;
use crate::error::{TrainingError, TrainingResult};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

pub const RANK_ENV: &str = "RANK";
pub const WORLD_SIZE_ENV: &str = "WORLD_SIZE";
pub const LOCAL_RANK_ENV: &str = "LOCAL_RANK";
pub const MASTER_ADDR_ENV: &str = "MASTER_ADDR";
pub const MASTER_PORT_ENV: &str = "MASTER_PORT";

/// Rank discovery values supplied by the process launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub master_addr: Option<String>,
    pub master_port: Option<u16>,
}

impl LaunchEnv {
    #[must_use]
    pub fn single_process() -> Self {
        Self { rank: 0, world_size: 1, local_rank: 0, master_addr: None, master_port: None }
    }

    pub fn from_env() -> TrainingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> TrainingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rank = required(&lookup, RANK_ENV)?;
        let world_size = required(&lookup, WORLD_SIZE_ENV)?;
        let local_rank = required(&lookup, LOCAL_RANK_ENV)?;

        if world_size == 0 {
            return Err(TrainingError::DistributedInit(format!("{WORLD_SIZE_ENV} must be >= 1")));
        }
        if rank >= world_size {
            return Err(TrainingError::DistributedInit(format!(
                "{RANK_ENV}={rank} is out of range for {WORLD_SIZE_ENV}={world_size}"
            )));
        }

        let master_port = match lookup(MASTER_PORT_ENV) {
            Some(raw) => Some(raw.trim().parse::<u16>().map_err(|_| {
                TrainingError::DistributedInit(format!("{MASTER_PORT_ENV} is not a port number: `{raw}`"))
            })?),
            None => None,
        };

        Ok(Self { rank, world_size, local_rank, master_addr: lookup(MASTER_ADDR_ENV), master_port })
    }
}

fn required<F>(lookup: &F, key: &str) -> TrainingResult<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)
        .ok_or_else(|| TrainingError::DistributedInit(format!("environment variable {key} is not set")))?;
    raw.trim()
        .parse()
        .map_err(|_| TrainingError::DistributedInit(format!("{key} is not a non-negative integer: `{raw}`")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Accelerator(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Accelerator(index) => write!(f, "cuda:{index}"),
        }
    }
}

fn select_device(local_rank: usize, accelerators: usize) -> TrainingResult<Device> {
    if accelerators == 0 {
        return Ok(Device::Cpu);
    }
    if local_rank >= accelerators {
        return Err(TrainingError::DistributedInit(format!(
            "{LOCAL_RANK_ENV}={local_rank} but only {accelerators} accelerator(s) are visible"
        )));
    }
    Ok(Device::Accelerator(local_rank))
}

const UNFORMED: u8 = 0;
const FORMED: u8 = 1;
const TORN_DOWN: u8 = 2;

/// Guard that lets a process form its group exactly once.
///
/// Formation is one-way: once a context has been built on the group, tearing
/// it down leaves the group unusable for the rest of the process. Only a
/// formation attempt that failed before completing returns the group to its
/// unformed state.
#[derive(Debug, Default)]
pub struct ProcessGroup {
    state: AtomicU8,
}

impl ProcessGroup {
    #[must_use]
    pub const fn new() -> Self {
        Self { state: AtomicU8::new(UNFORMED) }
    }

    /// The group shared by the whole process.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ProcessGroup>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Whether a live context currently holds the group.
    #[must_use]
    pub fn is_formed(&self) -> bool {
        self.state.load(Ordering::Acquire) == FORMED
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.state.load(Ordering::Acquire) == TORN_DOWN
    }

    fn acquire(&self) -> TrainingResult<()> {
        match self.state.compare_exchange(UNFORMED, FORMED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(TORN_DOWN) => Err(TrainingError::DistributedInit(
                "process group has been shut down and cannot be formed again".to_string(),
            )),
            Err(_) => Err(TrainingError::DistributedInit("process group is already initialized".to_string())),
        }
    }

    fn abandon(&self) {
        let _ = self.state.compare_exchange(FORMED, UNFORMED, Ordering::AcqRel, Ordering::Acquire);
    }

    fn tear_down(&self) {
        self.state.store(TORN_DOWN, Ordering::Release);
    }
}

/// Rank, world size and bound device for this process.
///
/// Passed by reference to everything that shards work or places tensors.
/// Dropping the context (or calling [`DistributedContext::shutdown`])
/// tears the process group down for good.
#[derive(Debug)]
pub struct DistributedContext {
    group: Arc<ProcessGroup>,
    rank: usize,
    world_size: usize,
    local_rank: usize,
    device: Device,
}

/// The slice of the distributed context that data sharding depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub world_size: usize,
}

impl ShardSpec {
    #[must_use]
    pub const fn single() -> Self {
        Self { rank: 0, world_size: 1 }
    }
}

impl DistributedContext {
    /// Forms the process group through `backend` and binds this process to
    /// its device. Fails if `group` is formed or has been torn down.
    pub fn initialize(
        group: &Arc<ProcessGroup>,
        env: &LaunchEnv,
        backend: &mut dyn TrainingBackend,
    ) -> TrainingResult<Self> {
        group.acquire()?;

        let device = match form(env, backend) {
            Ok(device) => device,
            Err(err) => {
                group.abandon();
                return Err(err);
            }
        };

        info!(
            rank = env.rank,
            world_size = env.world_size,
            local_rank = env.local_rank,
            device = %device,
            backend = backend.name(),
            "process group initialized"
        );

        Ok(Self {
            group: Arc::clone(group),
            rank: env.rank,
            world_size: env.world_size,
            local_rank: env.local_rank,
            device,
        })
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    #[must_use]
    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    #[must_use]
    pub fn current_device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    #[must_use]
    pub fn shard(&self) -> ShardSpec {
        ShardSpec { rank: self.rank, world_size: self.world_size }
    }

    pub fn shutdown(self) {
        debug!(rank = self.rank, "shutting down process group");
    }
}

impl Drop for DistributedContext {
    fn drop(&mut self) {
        self.group.tear_down();
    }
}

fn form(env: &LaunchEnv, backend: &mut dyn TrainingBackend) -> TrainingResult<Device> {
    backend.init_distributed(env).map_err(into_distributed)?;
    let device = select_device(env.local_rank, backend.accelerator_count())?;
    backend.bind_device(device).map_err(into_distributed)?;
    Ok(device)
}

fn into_distributed(err: TrainingError) -> TrainingError {
    match err {
        TrainingError::DistributedInit(_) => err,
        other => TrainingError::DistributedInit(other.to_string()),
    }
}
