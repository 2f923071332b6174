use std::sync::Arc;
use std::time::Duration;

use super::channel::{Channel, ChannelCore, ServiceOptions, Transport};
use super::engine::{Engine, Geometry};
use super::error::{DmaError, Result};
use super::shared::{SharedClient, SharedMaster};
use super::sim::{SimConfig, SimEngine};
use super::Ring::Ring::{CompletionQueue, DescriptorRing, STS_ROW_ENTRIES};
use crate::Core::alloc::{DmaAllocator, PrivateDmaAllocator, ShmDmaAllocator};
use crate::Core::regs::RegisterAccess;
use crate::Core::SharedMemory::{create_private_memory, create_shared_memory};

/// How a waiting caller passes time between checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStrategy {
    /// Spin. Lowest latency, burns a core.
    BusyWait,
    /// Sleep this long between checks.
    Sleep(Duration),
}

impl Default for PollStrategy {
    fn default() -> Self {
        Self::Sleep(Duration::from_micros(1))
    }
}

impl PollStrategy {
    pub fn pause(&self) {
        match self {
            Self::BusyWait => std::hint::spin_loop(),
            Self::Sleep(d) => std::thread::sleep(*d),
        }
    }
}

/// Configures and opens a [`Channel`].
///
/// `open` gives an in-process channel, `create_shared` makes this process
/// the master of a channel other processes can join, and `attach_shared`
/// joins one as a client.
pub struct ChannelBuilder {
    capacity: u32,
    sts_rows: Option<u32>,
    poll: PollStrategy,
    drain_grace: Duration,
    sync_timeout: Duration,
    scan_budget: usize,
    scanner_thread: bool,
    scanner_cpu: Option<usize>,
    max_clients: u32,
    mailbox_capacity: u32,
    port_id: u32,
    channel_id: u32,
    sim: SimConfig,
    regs: Option<Arc<dyn RegisterAccess>>,
    allocator: Option<Arc<dyn DmaAllocator>>,
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        Self {
            capacity: 256,
            sts_rows: None,
            poll: PollStrategy::default(),
            drain_grace: Duration::from_millis(1),
            sync_timeout: Duration::from_secs(1),
            scan_budget: 256,
            scanner_thread: false,
            scanner_cpu: None,
            max_clients: 8,
            mailbox_capacity: 256,
            port_id: 0,
            channel_id: 0,
            sim: SimConfig::default(),
            regs: None,
            allocator: None,
        }
    }
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring slots, including the wrap LINK and the reserved margin.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Completion queue rows of 8 entries. Defaults to enough for one
    /// entry per ring slot.
    pub fn with_completion_rows(mut self, rows: u32) -> Self {
        self.sts_rows = Some(rows);
        self
    }

    pub fn with_poll_strategy(mut self, poll: PollStrategy) -> Self {
        self.poll = poll;
        self
    }

    /// How long recovery waits for a live scanner to drain.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Upper bound on how long a `Sync` submission waits.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Completions handled per service pass.
    pub fn with_scan_budget(mut self, budget: usize) -> Self {
        self.scan_budget = budget.max(1);
        self
    }

    /// Run scanning and recovery on a dedicated thread.
    pub fn with_scanner_thread(mut self, enabled: bool) -> Self {
        self.scanner_thread = enabled;
        self
    }

    /// Pin the scanner thread to one CPU.
    pub fn with_scanner_cpu(mut self, cpu: usize) -> Self {
        self.scanner_cpu = Some(cpu);
        self
    }

    pub fn with_max_clients(mut self, max_clients: u32) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Completion records buffered per client. Power of two.
    pub fn with_mailbox_capacity(mut self, capacity: u32) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Port and channel recorded for a shared channel.
    pub fn with_channel(mut self, port_id: u32, channel_id: u32) -> Self {
        self.port_id = port_id;
        self.channel_id = channel_id;
        self
    }

    pub fn with_sim_config(mut self, sim: SimConfig) -> Self {
        self.sim = sim;
        self
    }

    /// Drive real hardware instead of the simulator.
    pub fn with_registers(mut self, regs: Arc<dyn RegisterAccess>) -> Self {
        self.regs = Some(regs);
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn DmaAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    fn geometry(&self, port_id: u32, channel_id: u32, max_clients: u32) -> Geometry {
        let rows = self
            .sts_rows
            .unwrap_or_else(|| self.capacity.div_ceil(STS_ROW_ENTRIES as u32).max(1));
        Geometry {
            capacity: self.capacity,
            sts_rows: rows,
            max_clients,
            mailbox_capacity: self.mailbox_capacity,
            port_id,
            channel_id,
        }
    }

    fn hardware(&self) -> (Arc<dyn RegisterAccess>, Option<Arc<SimEngine>>) {
        match &self.regs {
            Some(regs) => (regs.clone(), None),
            None => {
                let sim = Arc::new(SimEngine::new(self.sim.clone()));
                (sim.clone() as Arc<dyn RegisterAccess>, Some(sim))
            }
        }
    }

    fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            poll: self.poll,
            sync_timeout: self.sync_timeout,
            scan_budget: self.scan_budget,
            scanner_thread: self.scanner_thread,
            scanner_cpu: self.scanner_cpu,
        }
    }

    fn build_engine(
        &self,
        allocator: &Arc<dyn DmaAllocator>,
        geometry: Geometry,
        layout_mem: Box<dyn crate::Core::SharedMemory::SharedMemoryBackend>,
        regs: Arc<dyn RegisterAccess>,
    ) -> Result<Engine> {
        let ring = allocator.alloc(DescriptorRing::region_size(geometry.capacity))?;
        let sts = allocator.alloc(CompletionQueue::region_size(geometry.sts_rows))?;
        Engine::create(
            layout_mem,
            Arc::new(ring),
            Arc::new(sts),
            geometry,
            regs,
            self.drain_grace,
        )
    }

    /// Open a channel used only by this process.
    pub fn open(self, port_id: u32, channel_id: u32) -> Result<Channel> {
        let geometry = self.geometry(port_id, channel_id, 0);
        geometry.validate()?;

        let allocator = self
            .allocator
            .clone()
            .unwrap_or_else(|| Arc::new(PrivateDmaAllocator));
        let (regs, sim) = self.hardware();
        let layout_mem = create_private_memory(geometry.layout_size())?;
        let engine = self.build_engine(&allocator, geometry, layout_mem, regs)?;

        let core = Arc::new(ChannelCore::new(engine, sim, self.service_options()));
        Channel::start(Transport::Local(core), allocator)
    }

    /// Create a channel in `/dev/shm/<name>` and become its master.
    pub fn create_shared(self, name: &str) -> Result<Channel> {
        if self.max_clients == 0 {
            return Err(DmaError::InvalidRequest(
                "a shared channel needs at least one client slot".into(),
            ));
        }
        let geometry = self.geometry(self.port_id, self.channel_id, self.max_clients);
        geometry.validate()?;

        let allocator = self
            .allocator
            .clone()
            .unwrap_or_else(|| Arc::new(ShmDmaAllocator::new()));
        let (regs, sim) = self.hardware();
        let layout_mem = create_shared_memory(geometry.layout_size(), name)?;
        let engine = self.build_engine(&allocator, geometry, layout_mem, regs)?;

        let core = Arc::new(ChannelCore::new(engine, sim, self.service_options()));
        let master = SharedMaster::new(core, name);
        Channel::start(Transport::Master(master), allocator)
    }

    /// Join the channel at `/dev/shm/<name>` as a client.
    pub fn attach_shared(self, name: &str) -> Result<Channel> {
        let allocator = self
            .allocator
            .clone()
            .unwrap_or_else(|| Arc::new(ShmDmaAllocator::new()));
        let client = SharedClient::attach(
            name,
            &allocator,
            self.drain_grace,
            self.service_options(),
        )?;
        Channel::start(Transport::Client(client), allocator)
    }
}
