/*
Copyright 2025 The Microvisor Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use tracing::{instrument, Span};

use super::{HypervisorState, MenuOption, RunLoopCommand};
use crate::hypervisor::emulator::Emulator;
use crate::hypervisor::interrupt::InterruptController;
use crate::hypervisor::partition::Partition;
use crate::hypervisor::platform::{CapabilityCode, Platform, CAPABILITY_CHECK_ORDER};
use crate::hypervisor::snapshot::SnapshotManager;
use crate::hypervisor::vcpu::VirtualProcessor;
use crate::mem::manager::MemoryManager;
use crate::registers::RegisterName;
use crate::Result;

// Pause between run cycles when no command is pending.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Orchestrates partition, VP, memory, interrupt and snapshot components
/// into the `Initializing -> Ready -> Running -> Stopped` lifecycle, with
/// `Error` on any failed stage.
///
/// The state enum is owned here exclusively and mutated only under its lock,
/// since transitions come from both the run-loop worker and the foreground
/// command dispatcher. One long-lived worker thread consumes
/// [`RunLoopCommand`] messages; Start never spawns a second loop.
#[derive(Debug)]
pub struct HypervisorStateMachine {
    platform: Arc<dyn Platform>,
    emulator: Arc<dyn Emulator>,
    state: Arc<Mutex<HypervisorState>>,
    running: Arc<AtomicBool>,
    output: Arc<Mutex<String>>,
    memory: MemoryManager,
    interrupts: Option<InterruptController>,
    snapshots: Option<SnapshotManager>,
    // vcpu is declared before partition so the platform VP is deleted
    // before its partition on drop
    vcpu: Option<Arc<Mutex<VirtualProcessor>>>,
    partition: Partition,
    worker: Option<RunLoopWorker>,
}

#[derive(Debug)]
struct RunLoopWorker {
    tx: Sender<RunLoopCommand>,
    join_handle: Option<JoinHandle<()>>,
}

// Everything the worker thread touches, shared by Arc with the foreground.
struct RunLoopContext {
    vcpu: Arc<Mutex<VirtualProcessor>>,
    state: Arc<Mutex<HypervisorState>>,
    running: Arc<AtomicBool>,
    output: Arc<Mutex<String>>,
    rx: Receiver<RunLoopCommand>,
}

// Commits a state transition atomically and mirrors it into the output
// buffer. Lock order is always state then output.
fn transition(
    state: &Mutex<HypervisorState>,
    output: &Mutex<String>,
    to: HypervisorState,
) -> Result<()> {
    let mut current = state.lock()?;
    if *current == to {
        return Ok(());
    }
    info!("Transitioning from {} to {}", *current, to);
    {
        let mut buf = output.lock()?;
        let _ = writeln!(buf, "State: {} -> {}", *current, to);
    }
    *current = to;
    Ok(())
}

impl HypervisorStateMachine {
    /// Creates the state machine and acquires the partition handle. Failure
    /// to create the partition is fatal to the whole attempt.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(
        platform: Arc<dyn Platform>,
        emulator: Arc<dyn Emulator>,
        memory_size: u64,
    ) -> Result<Self> {
        let partition = Partition::new(platform.clone())?;
        let memory = MemoryManager::new(platform.clone(), memory_size);
        Ok(Self {
            platform,
            emulator,
            state: Arc::new(Mutex::new(HypervisorState::Initializing)),
            running: Arc::new(AtomicBool::new(false)),
            output: Arc::new(Mutex::new(String::new())),
            memory,
            interrupts: None,
            snapshots: None,
            vcpu: None,
            partition,
            worker: None,
        })
    }

    /// The current lifecycle state.
    pub fn current_state(&self) -> Result<HypervisorState> {
        Ok(*self.state.lock()?)
    }

    /// Whether the run loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The memory manager, for frontends reporting usage.
    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Takes everything accumulated in the observable output buffer.
    pub fn drain_output(&self) -> Result<String> {
        let mut buf = self.output.lock()?;
        Ok(std::mem::take(&mut *buf))
    }

    fn append_output(&self, text: &str) -> Result<()> {
        let mut buf = self.output.lock()?;
        buf.push_str(text);
        if !text.ends_with('\n') {
            buf.push('\n');
        }
        Ok(())
    }

    fn transition_state(&self, to: HypervisorState) -> Result<()> {
        transition(&self.state, &self.output, to)
    }

    // Marks the current attempt failed and hands the error back.
    fn fail_attempt(&self, e: crate::MicrovisorError) -> crate::MicrovisorError {
        error!("Start attempt failed: {}", e);
        if let Err(te) = self.transition_state(HypervisorState::Error) {
            error!("Could not record error state: {}", te);
        }
        e
    }

    /// Queries the platform capabilities in the fixed order, failing fast:
    /// the first failing query moves to `Error` and the remaining queries
    /// are never issued. Success moves to `Ready`.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn check_capability(&self) -> Result<()> {
        self.transition_state(HypervisorState::Initializing)?;
        for code in CAPABILITY_CHECK_ORDER {
            let value = self
                .platform
                .get_capability(code)
                .map_err(|e| self.fail_attempt(e))?;
            debug!("Capability {:?} = {:#x}", code, value);
            if code == CapabilityCode::HypervisorPresent && value == 0 {
                return Err(self.fail_attempt(crate::new_error!(
                    "No hypervisor is present on this host"
                )));
            }
        }
        self.transition_state(HypervisorState::Ready)
    }

    /// Finalizes partition setup, creates VP 0 and constructs the virtual
    /// processor and interrupt/memory components. Each step's failure
    /// short-circuits to `Error`. Idempotent once the VP exists.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn setup_partition(&mut self) -> Result<()> {
        if self.vcpu.is_some() {
            debug!("Partition already set up; skipping");
            return Ok(());
        }

        if let Err(e) = self.partition.setup() {
            return Err(self.fail_attempt(e));
        }
        if let Err(e) = self.partition.create_virtual_processor(0) {
            return Err(self.fail_attempt(e));
        }

        let handle = self.partition.handle();
        let vcpu = VirtualProcessor::new(self.platform.clone(), handle, 0, self.emulator.clone());
        self.vcpu = Some(Arc::new(Mutex::new(vcpu)));

        let mut interrupts = InterruptController::new(self.platform.clone(), handle, 0);
        if let Err(e) = interrupts.setup() {
            return Err(self.fail_attempt(e));
        }
        self.interrupts = Some(interrupts);

        if let Err(e) = self.memory.initialize() {
            return Err(self.fail_attempt(e));
        }
        Ok(())
    }

    /// Re-runs the idempotent component initializations and brings up the
    /// snapshot manager. Success moves to `Running`.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn initialize_components(&mut self) -> Result<()> {
        let handle = self.partition.handle();
        if let Some(interrupts) = &mut self.interrupts {
            if let Err(e) = interrupts.setup() {
                return Err(self.fail_attempt(e));
            }
        }
        if let Err(e) = self.memory.initialize() {
            return Err(self.fail_attempt(e));
        }

        let snapshots = SnapshotManager::new(self.platform.clone(), handle, 0);
        if let Err(e) = snapshots.initialize() {
            return Err(self.fail_attempt(e));
        }
        self.snapshots = Some(snapshots);

        self.transition_state(HypervisorState::Running)
    }

    /// Runs the full start sequence and hands the run loop to the worker.
    /// A second Start while running is a logged no-op.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            warn!("Hypervisor is already running");
            self.append_output("Hypervisor is already running")?;
            return Ok(());
        }

        self.check_capability()?;
        self.setup_partition()?;
        self.initialize_components()?;

        self.running.store(true, Ordering::Release);
        let tx = self.ensure_worker()?;
        tx.send(RunLoopCommand::Start)?;
        self.append_output("Hypervisor started")?;
        Ok(())
    }

    /// Requests a cooperative stop: clears the running flag and tells the
    /// worker. The in-flight run cycle finishes first.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            warn!("Hypervisor is not running");
            self.append_output("Hypervisor is not running")?;
            return Ok(());
        }
        self.running.store(false, Ordering::Release);
        if let Some(worker) = &self.worker {
            worker.tx.send(RunLoopCommand::Stop)?;
        }
        self.append_output("Stop requested")?;
        Ok(())
    }

    /// Asks the running loop to restore the VP's saved state.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn restart(&self) -> Result<()> {
        if !self.is_running() {
            warn!("Cannot restart: hypervisor is not running");
            self.append_output("Cannot restart: hypervisor is not running")?;
            return Ok(());
        }
        if let Some(worker) = &self.worker {
            worker.tx.send(RunLoopCommand::Restart)?;
        }
        Ok(())
    }

    /// Injects an edge-triggered interrupt with the given vector into VP 0.
    /// This is the seam RPC/GUI frontends drive.
    pub fn inject_interrupt(&self, vector: u32) -> Result<()> {
        match &self.interrupts {
            Some(interrupts) => interrupts.inject_interrupt(vector),
            None => {
                error!("No interrupt controller available");
                self.append_output("No interrupt controller available")
            }
        }
    }

    /// Dispatches one interactive command. Commands that need a virtual
    /// processor log an error when none exists instead of failing.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn handle_menu_option(&mut self, option: MenuOption) -> Result<()> {
        match option {
            MenuOption::Start => self.start(),
            MenuOption::Stop => self.stop(),
            MenuOption::Restart => self.restart(),
            MenuOption::SaveSnapshot => {
                let (Some(snapshots), Some(vcpu)) = (&mut self.snapshots, &self.vcpu) else {
                    error!("Cannot save snapshot: hypervisor has not been set up");
                    return self.append_output("Cannot save snapshot: hypervisor has not been set up");
                };
                {
                    let mut vp = vcpu.lock()?;
                    snapshots.save_snapshot(&mut vp)?;
                }
                self.append_output("Snapshot saved")
            }
            MenuOption::RestoreSnapshot => {
                let Some(snapshots) = &self.snapshots else {
                    error!("Cannot restore snapshot: hypervisor has not been set up");
                    return self
                        .append_output("Cannot restore snapshot: hypervisor has not been set up");
                };
                snapshots.restore_snapshot()?;
                self.append_output("Snapshot restore handled")
            }
            MenuOption::DumpRegisters => {
                let Some(vcpu) = &self.vcpu else {
                    return self.report_missing_vcpu();
                };
                let dump = {
                    let mut vp = vcpu.lock()?;
                    vp.get_registers()?;
                    vp.dump_registers()
                };
                self.append_output(&dump)
            }
            MenuOption::SetRegisters => {
                let Some(vcpu) = &self.vcpu else {
                    return self.report_missing_vcpu();
                };
                vcpu.lock()?.set_registers()?;
                self.append_output("Registers pushed to platform")
            }
            MenuOption::GetRegisters => {
                let Some(vcpu) = &self.vcpu else {
                    return self.report_missing_vcpu();
                };
                vcpu.lock()?.get_registers()?;
                self.append_output("Registers fetched from platform")
            }
            MenuOption::SetMemorySize(bytes) => {
                self.memory.update_memory_size(bytes);
                self.memory.initialize()?;
                self.append_output(&format!("Memory size set to {bytes} bytes"))
            }
            MenuOption::GetSpecificRegister(name) => {
                let Some(vcpu) = &self.vcpu else {
                    return self.report_missing_vcpu();
                };
                match RegisterName::from_str(&name) {
                    Ok(register) => {
                        let value = vcpu.lock()?.get_specific_register(register);
                        match value {
                            Ok(value) => {
                                self.append_output(&format!("{register} = {value:#018x}"))
                            }
                            Err(e) => self.append_output(&e.to_string()),
                        }
                    }
                    Err(e) => {
                        warn!("{}", e);
                        self.append_output(&e.to_string())
                    }
                }
            }
            MenuOption::SetSpecificRegister(name, value) => {
                let Some(vcpu) = &self.vcpu else {
                    return self.report_missing_vcpu();
                };
                match RegisterName::from_str(&name) {
                    Ok(register) => match vcpu.lock()?.set_specific_register(register, value) {
                        Ok(()) => {
                            self.append_output(&format!("{register} set to {value:#018x}"))
                        }
                        Err(e) => self.append_output(&e.to_string()),
                    },
                    Err(e) => {
                        warn!("{}", e);
                        self.append_output(&e.to_string())
                    }
                }
            }
            MenuOption::ConfigureVm(config) => {
                let Some(vcpu) = &self.vcpu else {
                    return self.report_missing_vcpu();
                };
                vcpu.lock()?.configure_vm(config)?;
                self.append_output("VM configuration applied")
            }
            MenuOption::GetVmConfig => {
                let Some(vcpu) = &self.vcpu else {
                    return self.report_missing_vcpu();
                };
                let json = vcpu.lock()?.vm_config_json()?;
                self.append_output(&json)
            }
            MenuOption::Quit => self.shutdown(),
        }
    }

    fn report_missing_vcpu(&self) -> Result<()> {
        error!("No virtual processor available");
        self.append_output("No virtual processor available")
    }

    /// Stops the loop and terminates the worker thread.
    pub fn shutdown(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.tx.send(RunLoopCommand::Shutdown);
            if let Some(handle) = worker.join_handle {
                if handle.join().is_err() {
                    error!("Run loop worker panicked during shutdown");
                }
            }
        }
        Ok(())
    }

    // Spawns the single run-loop worker on first use and returns its
    // command channel.
    fn ensure_worker(&mut self) -> Result<Sender<RunLoopCommand>> {
        if let Some(worker) = &self.worker {
            return Ok(worker.tx.clone());
        }
        let Some(vcpu) = &self.vcpu else {
            return Err(crate::error::MicrovisorError::VirtualProcessorNotInitialized());
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        let ctx = RunLoopContext {
            vcpu: vcpu.clone(),
            state: self.state.clone(),
            running: self.running.clone(),
            output: self.output.clone(),
            rx,
        };
        let join_handle = std::thread::Builder::new()
            .name("microvisor-run-loop".to_string())
            .spawn(move || Self::worker_main(ctx))?;
        self.worker = Some(RunLoopWorker {
            tx: tx.clone(),
            join_handle: Some(join_handle),
        });
        Ok(tx)
    }

    // The worker thread: idles on the channel until Start, then alternates
    // between polling for out-of-band commands and executing run cycles.
    fn worker_main(ctx: RunLoopContext) {
        let mut active = false;
        loop {
            let command = if active {
                match ctx.rx.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => return,
                }
            } else {
                match ctx.rx.recv() {
                    Ok(command) => Some(command),
                    Err(_) => return,
                }
            };

            match command {
                Some(RunLoopCommand::Start) => {
                    if active {
                        debug!("Run loop already active");
                    } else {
                        info!("Run loop started");
                        active = true;
                    }
                    continue;
                }
                Some(RunLoopCommand::Continue) => continue,
                Some(RunLoopCommand::Restart) => {
                    if !active {
                        debug!("Ignoring restart while idle");
                        continue;
                    }
                    if let Err(e) = Self::restore_vcpu(&ctx) {
                        error!("Restart failed: {}", e);
                        Self::abort_run(&ctx);
                        active = false;
                    }
                    continue;
                }
                Some(RunLoopCommand::Stop) => {
                    if active {
                        active = false;
                        ctx.running.store(false, Ordering::Release);
                        let _ = transition(&ctx.state, &ctx.output, HypervisorState::Stopped);
                        info!("Run loop stopped");
                    }
                    continue;
                }
                Some(RunLoopCommand::Shutdown) => return,
                None => {}
            }

            // No command pending: honor the flag, then run one cycle.
            if !ctx.running.load(Ordering::Acquire) {
                active = false;
                let _ = transition(&ctx.state, &ctx.output, HypervisorState::Stopped);
                info!("Run loop stopped");
                continue;
            }
            match Self::run_cycle(&ctx) {
                Ok(()) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    error!("Run cycle failed: {}", e);
                    Self::abort_run(&ctx);
                    active = false;
                }
            }
        }
    }

    // One save -> run -> dump -> restore cycle. Save/restore failures abort
    // the loop; a failed run primitive is operation-local and the loop
    // keeps going.
    fn run_cycle(ctx: &RunLoopContext) -> Result<()> {
        let mut vp = ctx.vcpu.lock()?;
        vp.save_state()?;
        match vp.run() {
            Ok(exit) => debug!("Run cycle exit: {:?}", exit),
            Err(e) => error!("Run primitive failed: {}", e),
        }
        {
            let dump = vp.dump_registers();
            let mut buf = ctx.output.lock()?;
            buf.push_str(&dump);
        }
        vp.restore_state()?;
        Ok(())
    }

    fn restore_vcpu(ctx: &RunLoopContext) -> Result<()> {
        let mut vp = ctx.vcpu.lock()?;
        vp.restore_state()
    }

    fn abort_run(ctx: &RunLoopContext) {
        ctx.running.store(false, Ordering::Release);
        let _ = transition(&ctx.state, &ctx.output, HypervisorState::Error);
    }
}

impl Drop for HypervisorStateMachine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.tx.send(RunLoopCommand::Shutdown);
            if let Some(handle) = worker.join_handle {
                let _ = handle.join();
            }
        }
    }
}
