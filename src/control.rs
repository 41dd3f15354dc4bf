use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{Command, CommandResponse};
use crate::guard::{Guard, GuardOpts, GuardState};
use crate::secrets::Secrets;
use crate::stats::UnitStatsCache;
use crate::unit::{self, Unit, UnitStore};

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

struct ControllerUnit {
    unit: Unit,
    guard: Arc<Guard>,
}

/// Owner of all guards. Fleet-level commands are serialized through a single
/// command channel; the command loop is the only place the guard list and the
/// on-disk unit configs are mutated, which is what makes them safe without
/// further locking.
pub struct Controller {
    store: UnitStore,
    stats: Arc<UnitStatsCache>,
    global_env: BTreeMap<String, String>,
    units: Vec<ControllerUnit>,
    command_tx: mpsc::Sender<Command>,
    command_rx: Option<mpsc::Receiver<Command>>,
}

impl Controller {
    /// Loads all units from the workspace and builds one guard per unit. The
    /// guard environment is the unit's env followed by the global env; both
    /// had their secret placeholders expanded at load time.
    pub fn new(
        dir: impl AsRef<Path>,
        secrets: Arc<Secrets>,
        global_env: BTreeMap<String, String>,
    ) -> anyhow::Result<Self> {
        let store = UnitStore::new(dir.as_ref(), secrets)?;
        let loaded = store
            .load_all()
            .with_context(|| format!("load units in {}", store.dir().display()))?;

        let stats = Arc::new(UnitStatsCache::new());
        // Serialized operator requests: one in flight at a time.
        let (command_tx, command_rx) = mpsc::channel(1);

        let mut controller = Self {
            store,
            stats,
            global_env,
            units: Vec::new(),
            command_tx,
            command_rx: Some(command_rx),
        };
        for u in loaded {
            let guard = controller.build_guard(&u);
            controller.stats.add(&u.name, u.config.enabled);
            controller.units.push(ControllerUnit { unit: u, guard });
        }
        Ok(controller)
    }

    /// Absolute workspace directory.
    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    /// Cloneable operator-facing API. Commands go through the command
    /// channel; stat queries read the stats cache directly.
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            command_tx: self.command_tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    fn guard_opts(&self, unit: &Unit) -> GuardOpts {
        let mut env = unit.config.env.clone();
        env.extend(self.global_env.iter().map(|(k, v)| format!("{k}={v}")));
        GuardOpts::new(unit.program_path())
            .with_args(unit.config.args.clone())
            .with_env(env)
            .with_wd(unit.dir.clone())
            .with_restart_after(Duration::from_secs(unit.config.restart_after_sec))
    }

    fn build_guard(&self, unit: &Unit) -> Arc<Guard> {
        let guard = Arc::new(Guard::new(self.guard_opts(unit)));
        let stats = Arc::clone(&self.stats);
        let name = unit.name.clone();
        // Constant-time map mutation only; the guard invokes this
        // synchronously on every transition.
        guard.set_on_change(move |state| match state {
            GuardState::RunningStarted { pid } => stats.started(&name, pid),
            GuardState::RunningStopped | GuardState::NotRunning => stats.stopped(&name),
        });
        guard
    }

    /// Runs guards, the stats ticker and the command loop until `cancel`
    /// fires, then waits up to 5 s for the guards to finish.
    pub async fn run_ctx(mut self, cancel: CancellationToken) {
        info!("controller: run");
        let mut guards: JoinSet<()> = JoinSet::new();
        for cu in &self.units {
            info!("controller: run {:?}", cu.unit.name);
            // Each guard gets its own child token, so a single guard can be
            // cancelled without tearing down the fleet.
            let token = cancel.child_token();
            let guard = Arc::clone(&cu.guard);
            guards.spawn(async move { guard.run_ctx(token).await });
        }

        {
            let stats = Arc::clone(&self.stats);
            let token = cancel.child_token();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(STATS_INTERVAL);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => stats.collect(),
                    }
                }
            });
        }

        let mut command_rx = match self.command_rx.take() {
            Some(rx) => rx,
            None => {
                warn!("controller run loop started twice");
                return;
            }
        };

        info!("controller: loop");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &cancel, &mut guards).await,
                    None => break,
                }
            }
        }

        let drain = async {
            while guards.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
            warn!("controller: timeout in wait for all guards done");
        } else {
            info!("controller: all guards are done");
        }
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        cancel: &CancellationToken,
        guards: &mut JoinSet<()>,
    ) {
        let (resp, reply) = match cmd {
            Command::StartAll { reply } => (self.start_all().await, reply),
            Command::StopAll { reply } => (self.stop_all().await, reply),
            Command::Start { unit, reply } => (self.start_unit(&unit).await, reply),
            Command::Stop { unit, reply } => (self.stop_unit(&unit).await, reply),
            Command::Enable { unit, reply } => (self.enable_unit(&unit).await, reply),
            Command::Disable { unit, reply } => (self.disable_unit(&unit).await, reply),
            Command::Deploy {
                unit,
                staging_dir,
                reply,
            } => (
                self.deploy(&unit, &staging_dir, cancel, guards).await,
                reply,
            ),
        };
        resp.log();
        // The requester may have given up; that is not our problem.
        let _ = reply.send(resp);
    }

    fn find_unit(&self, name: &str) -> Option<usize> {
        self.units.iter().position(|cu| cu.unit.name == name)
    }

    async fn start_cu(cu: &ControllerUnit, resp: &mut CommandResponse) {
        if !cu.unit.config.enabled {
            resp.add_msg(format!("unit {:?} is disabled", cu.unit.name));
            return;
        }
        if cu.guard.is_started() {
            resp.add_msg(format!(
                "unit {:?} is already started with PID {}",
                cu.unit.name,
                cu.guard.pid()
            ));
            return;
        }
        match cu.guard.start().await {
            Ok(pid) => resp.add_msg(format!("started {:?} with PID {pid}", cu.unit.name)),
            Err(e) => resp.add_error(
                anyhow::Error::new(e).context(format!("start unit {:?}", cu.unit.name)),
            ),
        }
    }

    async fn stop_cu(cu: &ControllerUnit, resp: &mut CommandResponse) {
        if !cu.guard.is_started() {
            resp.add_msg(format!("unit {:?} is not started", cu.unit.name));
            return;
        }
        let pid = cu.guard.pid();
        match cu.guard.stop().await {
            Ok(()) => resp.add_msg(format!("stopped {:?}", cu.unit.name)),
            Err(e) => resp.add_error(anyhow::Error::new(e).context(format!(
                "stop unit {:?} with PID {pid}",
                cu.unit.name
            ))),
        }
    }

    async fn start_all(&self) -> CommandResponse {
        let mut resp = CommandResponse::default();
        for cu in &self.units {
            Self::start_cu(cu, &mut resp).await;
        }
        resp
    }

    async fn stop_all(&self) -> CommandResponse {
        let mut resp = CommandResponse::default();
        for cu in &self.units {
            Self::stop_cu(cu, &mut resp).await;
        }
        resp
    }

    async fn start_unit(&self, name: &str) -> CommandResponse {
        let mut resp = CommandResponse::default();
        match self.find_unit(name) {
            Some(i) => Self::start_cu(&self.units[i], &mut resp).await,
            None => resp.add_error(anyhow::anyhow!("no such unit {name:?}")),
        }
        resp
    }

    async fn stop_unit(&self, name: &str) -> CommandResponse {
        let mut resp = CommandResponse::default();
        match self.find_unit(name) {
            Some(i) => Self::stop_cu(&self.units[i], &mut resp).await,
            None => resp.add_error(anyhow::anyhow!("no such unit {name:?}")),
        }
        resp
    }

    async fn enable_unit(&mut self, name: &str) -> CommandResponse {
        let mut resp = CommandResponse::default();
        let Some(i) = self.find_unit(name) else {
            resp.add_error(anyhow::anyhow!("no such unit {name:?}"));
            return resp;
        };
        let cu = &mut self.units[i];
        if cu.unit.config.enabled {
            resp.add_msg(format!("unit {name:?} is already enabled"));
            return resp;
        }
        cu.unit.config.enabled = true;
        match self.store.save_unit(&cu.unit) {
            Ok(()) => resp.add_msg(format!("enabled unit {name:?}")),
            Err(e) => resp.add_error(e.context(format!("enable unit {name:?}"))),
        }
        self.stats.enabled(name);
        resp
    }

    async fn disable_unit(&mut self, name: &str) -> CommandResponse {
        let mut resp = CommandResponse::default();
        let Some(i) = self.find_unit(name) else {
            resp.add_error(anyhow::anyhow!("no such unit {name:?}"));
            return resp;
        };
        if !self.units[i].unit.config.enabled {
            resp.add_msg(format!("unit {name:?} is already disabled"));
            return resp;
        }
        if self.units[i].guard.is_started() {
            Self::stop_cu(&self.units[i], &mut resp).await;
            if resp.has_errors() {
                return resp;
            }
        }
        let cu = &mut self.units[i];
        cu.unit.config.enabled = false;
        match self.store.save_unit(&cu.unit) {
            Ok(()) => resp.add_msg(format!("disabled unit {name:?}")),
            Err(e) => resp.add_error(e.context(format!("disable unit {name:?}"))),
        }
        self.stats.disabled(name);
        resp
    }

    /// Runs entirely inside the command loop: deploy is the one operation that
    /// touches the guard list, the unit store and a specific guard in a single
    /// logical step.
    async fn deploy(
        &mut self,
        name: &str,
        staging_dir: &Path,
        cancel: &CancellationToken,
        guards: &mut JoinSet<()>,
    ) -> CommandResponse {
        match self.find_unit(name) {
            Some(i) => self.deploy_update(i, staging_dir).await,
            None => self.deploy_create(name, staging_dir, cancel, guards).await,
        }
    }

    async fn deploy_create(
        &mut self,
        name: &str,
        staging_dir: &Path,
        cancel: &CancellationToken,
        guards: &mut JoinSet<()>,
    ) -> CommandResponse {
        let mut resp = CommandResponse::default();
        let unit = match self.store.create(name, staging_dir) {
            Ok(u) => u,
            Err(e) => {
                resp.add_error(e.context(format!("create unit {name:?}")));
                return resp;
            }
        };
        resp.add_msg(format!("unit {name:?}: created"));

        let guard = self.build_guard(&unit);
        self.stats.add(name, unit.config.enabled);

        {
            let guard = Arc::clone(&guard);
            let token = cancel.child_token();
            guards.spawn(async move { guard.run_ctx(token).await });
        }
        let enabled = unit.config.enabled;
        self.units.push(ControllerUnit {
            unit,
            guard: Arc::clone(&guard),
        });
        resp.add_msg(format!("unit {name:?}: guard is running"));

        if !enabled {
            resp.add_msg(format!("unit {name:?}: disabled"));
            return resp;
        }
        match guard.start().await {
            Ok(pid) => resp.add_msg(format!("started {name:?} with PID {pid}")),
            Err(e) => {
                resp.add_error(anyhow::Error::new(e).context(format!("start unit {name:?}")))
            }
        }
        resp
    }

    async fn deploy_update(&mut self, i: usize, staging_dir: &Path) -> CommandResponse {
        let mut resp = CommandResponse::default();
        let name = self.units[i].unit.name.clone();

        let was_running = self.units[i].guard.is_started();
        if was_running {
            // Best-effort; the update proceeds even if the old child resisted.
            if let Err(e) = self.units[i].guard.stop().await {
                resp.add_msg(format!("stopping {name:?} before update: {e}"));
            }
        }

        let unit = match self.store.update(&name, staging_dir) {
            Ok(u) => u,
            Err(e) => {
                resp.add_error(e.context(format!("update unit {name:?}")));
                return resp;
            }
        };
        let opts = self.guard_opts(&unit);
        if let Err(e) = self.units[i].guard.update_opts(opts) {
            resp.add_error(
                anyhow::Error::new(e).context(format!("update guard options for {name:?}")),
            );
            return resp;
        }
        let enabled = unit.config.enabled;
        self.units[i].unit = unit;
        resp.add_msg(format!("unit {name:?}: updated"));

        if enabled {
            self.stats.enabled(&name);
        } else {
            self.stats.disabled(&name);
        }

        if !enabled {
            resp.add_msg(format!("unit {name:?}: disabled"));
            return resp;
        }
        if !was_running {
            resp.add_msg(format!(
                "unit {name:?}: not started (was not running before)"
            ));
            return resp;
        }
        match self.units[i].guard.start().await {
            Ok(pid) => resp.add_msg(format!("started {name:?} with PID {pid}")),
            Err(e) => {
                resp.add_error(anyhow::Error::new(e).context(format!("start unit {name:?}")))
            }
        }
        resp
    }
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    command_tx: mpsc::Sender<Command>,
    stats: Arc<UnitStatsCache>,
}

impl ControllerHandle {
    pub async fn start_all(&self) -> CommandResponse {
        self.dispatch(|reply| Command::StartAll { reply }).await
    }

    pub async fn stop_all(&self) -> CommandResponse {
        self.dispatch(|reply| Command::StopAll { reply }).await
    }

    pub async fn start(&self, unit: &str) -> CommandResponse {
        let unit = unit.to_string();
        self.dispatch(move |reply| Command::Start { unit, reply })
            .await
    }

    pub async fn stop(&self, unit: &str) -> CommandResponse {
        let unit = unit.to_string();
        self.dispatch(move |reply| Command::Stop { unit, reply })
            .await
    }

    pub async fn enable(&self, unit: &str) -> CommandResponse {
        let unit = unit.to_string();
        self.dispatch(move |reply| Command::Enable { unit, reply })
            .await
    }

    pub async fn disable(&self, unit: &str) -> CommandResponse {
        let unit = unit.to_string();
        self.dispatch(move |reply| Command::Disable { unit, reply })
            .await
    }

    /// Validates the request, then hands it to the command loop.
    pub async fn deploy(&self, unit: &str, staging_dir: &Path) -> CommandResponse {
        let mut resp = CommandResponse::default();
        let unit = unit.trim();
        if unit.is_empty() {
            resp.add_error(anyhow::anyhow!("empty unit name"));
            return resp;
        }
        if let Err(e) = unit::validate_unit_dir(staging_dir) {
            resp.add_error(e.context(format!("validate unit dir {}", staging_dir.display())));
            return resp;
        }
        let unit = unit.to_string();
        let staging_dir = staging_dir.to_path_buf();
        self.dispatch(move |reply| Command::Deploy {
            unit,
            staging_dir,
            reply,
        })
        .await
    }

    /// Read-only, lock-free path: straight from the stats cache, never
    /// through the command channel.
    pub fn stat(&self, unit: &str) -> CommandResponse {
        let mut resp = CommandResponse::default();
        match self.stats.stats_descriptor(unit) {
            Ok(sd) => {
                resp.add_msg(sd.to_string());
                resp.data.push(sd);
            }
            Err(e) => resp.add_error(e),
        }
        resp
    }

    pub fn stat_all(&self) -> CommandResponse {
        let mut resp = CommandResponse::default();
        let sds = self.stats.all_stats_descriptors();
        for sd in &sds {
            resp.add_msg(sd.to_string());
        }
        resp.data = sds;
        resp
    }

    async fn dispatch(
        &self,
        make: impl FnOnce(oneshot::Sender<CommandResponse>) -> Command,
    ) -> CommandResponse {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(make(tx)).await.is_err() {
            let mut resp = CommandResponse::default();
            resp.add_error(anyhow::anyhow!("controller is not running"));
            return resp;
        }
        match rx.await {
            Ok(resp) => resp,
            Err(_) => {
                let mut resp = CommandResponse::default();
                resp.add_error(anyhow::anyhow!("controller dropped the command"));
                resp
            }
        }
    }
}
