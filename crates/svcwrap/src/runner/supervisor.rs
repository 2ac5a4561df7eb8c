use std::sync::{Arc, Mutex};
use std::time::Duration;
use svcwrap_core::{
    DownloadTask, EventLogger, ExitCallback, ExtensionSet, HookKind, LogHandler, LogStatusSink,
    ManagedProcess, ProcessId, ProcessManager, Result, ServiceConfig, ServiceState,
    ServiceStatusReporter, SpawnRequest, StatusSink, TracingEventLogger, WrapperError,
    WrapperExtension, run_downloads,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::controller::ProcessController;
use super::hooks::HookRunner;
use crate::catch::Recover;
use crate::factory::create_process_manager;

/// Custom control code the service manager sends ahead of a system shutdown
pub const SERVICE_CONTROL_PRESHUTDOWN: u32 = 0x0F;

/// Upper bound on waiting for output copy loops after a process exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Ends the wrapper after the main process exited on its own
pub trait Terminator: Send + Sync {
    fn terminate(&self, exit_code: i32);
}

/// Exits the current process with the child's exit code
#[derive(Debug, Default)]
pub struct ExitProcessTerminator;

impl Terminator for ExitProcessTerminator {
    fn terminate(&self, exit_code: i32) {
        info!(exit_code, "Exiting wrapper");
        std::process::exit(exit_code);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    ShuttingDown,
}

pub struct SupervisorBuilder {
    config: ServiceConfig,
    manager: Option<Arc<dyn ProcessManager>>,
    sink: Option<Arc<dyn StatusSink>>,
    events: Option<Arc<dyn EventLogger>>,
    terminator: Option<Arc<dyn Terminator>>,
    extensions: ExtensionSet,
}

impl SupervisorBuilder {
    pub fn process_manager(mut self, manager: Arc<dyn ProcessManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventLogger>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn extension(mut self, extension: Arc<dyn WrapperExtension>) -> Self {
        self.extensions.register(extension);
        self
    }

    pub fn build(self) -> Result<Supervisor> {
        self.config.validate()?;

        let events = self
            .events
            .unwrap_or_else(|| Arc::new(TracingEventLogger::new(self.config.id.clone())));
        let manager = self.manager.unwrap_or_else(create_process_manager);
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogStatusSink));
        let reporter = Arc::new(ServiceStatusReporter::new(sink, self.config.wait_hint()));
        let controller =
            ProcessController::new(manager, events.clone()).with_sleep_time(self.config.sleep_time());

        Ok(Supervisor {
            inner: Arc::new(Inner {
                hooks: HookRunner::new(events.clone()),
                config: self.config,
                controller,
                reporter,
                events,
                extensions: self.extensions,
                terminator: self
                    .terminator
                    .unwrap_or_else(|| Arc::new(ExitProcessTerminator)),
                state: Mutex::new(SupervisorState::Stopped),
                main: Mutex::new(None),
                log: Mutex::new(None),
            }),
        })
    }
}

/// Drives one service through start, stop and shutdown requests
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    controller: ProcessController,
    hooks: HookRunner,
    reporter: Arc<ServiceStatusReporter>,
    events: Arc<dyn EventLogger>,
    extensions: ExtensionSet,
    terminator: Arc<dyn Terminator>,
    state: Mutex<SupervisorState>,
    main: Mutex<Option<Arc<ManagedProcess>>>,
    log: Mutex<Option<Arc<LogHandler>>>,
}

impl Supervisor {
    pub fn builder(config: ServiceConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            manager: None,
            sink: None,
            events: None,
            terminator: None,
            extensions: ExtensionSet::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.lock_state()
    }

    pub fn reporter(&self) -> &Arc<ServiceStatusReporter> {
        &self.inner.reporter
    }

    /// The main process while it is supervised
    pub fn main_process(&self) -> Option<Arc<ManagedProcess>> {
        self.inner.lock_main().clone()
    }

    /// Start the service; `args` from the start request extend the configured arguments.
    ///
    /// On failure everything started so far is torn down and Stopped is reported.
    pub async fn handle_start(&self, args: &[String]) -> Result<()> {
        self.inner
            .transition(&[SupervisorState::Stopped], SupervisorState::Starting)?;

        match self.inner.start_sequence(args).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.abort_start(&e).await;
                Err(e)
            }
        }
    }

    /// Stop the service. A no-op unless it is running.
    pub async fn handle_stop(&self) -> Result<()> {
        if !self.inner.claim_stop(SupervisorState::Stopping)? {
            return Ok(());
        }
        self.inner.stop_sequence().await;
        Ok(())
    }

    /// System shutdown; runs the regular stop sequence
    pub async fn handle_shutdown(&self) -> Result<()> {
        if !self.inner.claim_stop(SupervisorState::ShuttingDown)? {
            return Ok(());
        }
        info!(service = %self.inner.config.id, "System is shutting down");
        self.inner.events.info("Stopping service for system shutdown");
        self.inner.stop_sequence().await;
        Ok(())
    }

    /// Custom control codes; only preshutdown is acted upon, and only when intercepted
    pub async fn handle_custom_command(&self, code: u32) -> Result<()> {
        if code == SERVICE_CONTROL_PRESHUTDOWN && self.inner.config.intercept_preshutdown {
            return self.handle_shutdown().await;
        }
        debug!(code, "Ignoring custom control code");
        Ok(())
    }
}

impl Inner {
    async fn start_sequence(self: &Arc<Self>, args: &[String]) -> Result<()> {
        let config = &self.config;
        self.reporter.begin_pending(ServiceState::StartPending)?;
        self.extensions.wrapper_started();

        if !config.downloads.is_empty() {
            let _keep_alive = self.reporter.keep_alive(config.sleep_time());
            let tasks = config.downloads.iter().cloned().map(DownloadTask::new).collect();
            let finished = run_downloads(tasks, self.events.as_ref()).await?;
            info!(count = finished.len(), "Downloads finished");
        }

        self.hooks
            .run(&self.controller, config, HookKind::PreStart, self.progress())
            .await;

        let log = Arc::new(LogHandler::new(
            &config.log,
            config.log_base_name(),
            self.events.clone(),
        ));
        let mut arguments = config.arguments.clone();
        arguments.extend(args.iter().cloned());
        let request = SpawnRequest::new(&config.executable, arguments)
            .working_directory(config.working_directory.clone())
            .env(config.env.clone())
            .hide_window(config.hide_window)
            .priority(config.priority);

        let (exit_tx, exit_rx) = oneshot::channel();
        let on_exit: ExitCallback = Box::new(move |pid, code| {
            let _ = exit_tx.send((pid, code));
        });

        self.events.info(&format!(
            "Starting {} {}",
            request.executable,
            request.arguments.join(" ")
        ));
        let process = Arc::new(self.controller.start(request, Some(log.as_ref()), Some(on_exit)).await?);
        *self.lock_main() = Some(process.clone());
        *self.lock_log() = Some(log);
        self.extensions.process_started(&process);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok((pid, code)) = exit_rx.await {
                inner.on_main_exit(pid, code).await;
            }
        });

        self.hooks
            .run(&self.controller, config, HookKind::PostStart, self.progress())
            .await;

        {
            let mut state = self.lock_state();
            if *state != SupervisorState::Starting {
                debug!(state = ?*state, "Main process ended during startup");
                return Ok(());
            }
            *state = SupervisorState::Running;
        }
        self.reporter.signal_running()?;
        info!(service = %config.id, pid = %process.pid(), "Service running");
        self.events.info("Started successfully");
        Ok(())
    }

    async fn abort_start(&self, e: &WrapperError) {
        error!(service = %self.config.id, error = %e, "Service failed to start");
        self.events.error(&format!("Failed to start service: {e}"));
        self.set_state(SupervisorState::Stopping);

        self.hooks
            .stop_all(&self.controller, self.config.stop_timeout())
            .await;
        let process = self.lock_main().take();
        if let Some(process) = process {
            self.controller
                .stop_tree(&process, self.config.stop_timeout(), true)
                .await;
        }
        self.shutdown_logs();

        self.reporter
            .signal_stopped(1)
            .recover(self.events.as_ref(), "Failed to report stopped status");
        self.set_state(SupervisorState::Stopped);
    }

    async fn stop_sequence(&self) {
        let config = &self.config;
        info!(service = %config.id, "Stopping service");
        self.set_state(SupervisorState::Stopping);
        self.reporter
            .begin_pending(ServiceState::StopPending)
            .recover(self.events.as_ref(), "Failed to report stop pending");
        self.extensions.before_wrapper_stopped();

        self.hooks
            .run(&self.controller, config, HookKind::PreStop, self.progress())
            .await;

        let process = self.lock_main().take();
        if let Some(process) = process {
            if config.has_stop_command() {
                self.run_stop_command(&process).await;
            } else {
                let _keep_alive = self.reporter.keep_alive(config.sleep_time());
                self.controller
                    .stop_tree(&process, config.stop_timeout(), config.stop_parent_process_first)
                    .await;
            }
            self.extensions.process_terminated(&process);
            if !process.output_drained(OUTPUT_DRAIN_TIMEOUT).await {
                warn!(pid = %process.pid(), "Output still being copied after the process stopped");
            }
        }
        self.shutdown_logs();

        self.hooks
            .run(&self.controller, config, HookKind::PostStop, self.progress())
            .await;

        self.events.info("Stopped successfully");
        self.reporter
            .signal_stopped(0)
            .recover(self.events.as_ref(), "Failed to report stopped status");
        self.set_state(SupervisorState::Stopped);
    }

    /// Run the configured stop command, then wait for the main process.
    ///
    /// A main process still running a stop timeout after the command finished
    /// has its tree stopped.
    async fn run_stop_command(&self, process: &ManagedProcess) {
        let config = &self.config;
        let request = SpawnRequest::new(
            config.effective_stop_executable(),
            config.stop_arguments.clone().unwrap_or_default(),
        )
        .working_directory(config.working_directory.clone())
        .env(config.env.clone())
        .hide_window(config.hide_window);

        match self.controller.start(request, None, None).await {
            Ok(stopper) => {
                info!(pid = %stopper.pid(), "Running stop command");
                let code = self.controller.wait_for_exit(&stopper, self.progress()).await;
                if code != 0 {
                    self.events
                        .warning(&format!("Stop command exited with code {code}"));
                }
            }
            Err(e) => {
                self.events.error(&format!("Failed to run stop command: {e}"));
            }
        }

        let deadline = tokio::time::Instant::now() + config.stop_timeout();
        let mut progress = self.progress();
        loop {
            if process.wait_timeout(config.sleep_time()).await.is_some() {
                return;
            }
            progress();
            if tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        warn!(pid = %process.pid(), "Main process outlived the stop command");
        let _keep_alive = self.reporter.keep_alive(config.sleep_time());
        self.controller
            .stop_tree(process, config.stop_timeout(), config.stop_parent_process_first)
            .await;
    }

    /// The main process exited without a stop request
    async fn on_main_exit(&self, pid: ProcessId, code: i32) {
        {
            let mut state = self.lock_state();
            match *state {
                SupervisorState::Starting | SupervisorState::Running => {
                    *state = SupervisorState::Stopping;
                }
                _ => {
                    debug!(pid = %pid, code, "Main process exited during stop");
                    return;
                }
            }
        }

        let main = self.lock_main().take();
        let Some(process) = main else {
            return;
        };
        warn!(pid = %pid, code, "Main process exited unexpectedly");
        self.events.error(&format!(
            "Child process [{pid} - {}] terminated with {code}",
            process.command()
        ));
        self.extensions.process_terminated(&process);

        self.hooks
            .stop_all(&self.controller, self.config.stop_timeout())
            .await;
        self.controller
            .stop_descendants(&process, self.config.stop_timeout())
            .await;
        process.output_drained(OUTPUT_DRAIN_TIMEOUT).await;
        self.shutdown_logs();

        if code == 0 {
            self.reporter
                .signal_stopped(0)
                .recover(self.events.as_ref(), "Failed to report stopped status");
        }
        self.set_state(SupervisorState::Stopped);
        self.terminator.terminate(code);
    }

    /// Move from Running into a stopping state; false when there is nothing to stop
    fn claim_stop(&self, target: SupervisorState) -> Result<bool> {
        let mut state = self.lock_state();
        match *state {
            SupervisorState::Running => {
                *state = target;
                Ok(true)
            }
            SupervisorState::Starting => Err(WrapperError::InvalidState(
                "cannot stop while the service is starting".to_string(),
            )),
            other => {
                debug!(state = ?other, "Ignoring stop request");
                Ok(false)
            }
        }
    }

    fn transition(&self, from: &[SupervisorState], to: SupervisorState) -> Result<()> {
        let mut state = self.lock_state();
        if !from.contains(&*state) {
            return Err(WrapperError::InvalidState(format!(
                "cannot move from {:?} to {to:?}",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    fn progress(&self) -> impl FnMut() + '_ {
        move || {
            self.reporter
                .signal_pending()
                .recover(self.events.as_ref(), "Failed to report progress");
        }
    }

    fn shutdown_logs(&self) {
        if let Some(log) = self.lock_log().take() {
            log.shutdown();
        }
    }

    fn set_state(&self, state: SupervisorState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_main(&self) -> std::sync::MutexGuard<'_, Option<Arc<ManagedProcess>>> {
        self.main.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, Option<Arc<LogHandler>>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}
