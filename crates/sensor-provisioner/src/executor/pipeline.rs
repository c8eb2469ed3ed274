//! The build pipeline for one device: clean (optional), profile install, compile and upload
//! (optional), driven as an explicit state machine.
//!
//! Every stage goes through [`run_stage`], which turns the failures a stage body reports into a
//! [`StageStatus`] according to the stage's [`StagePolicy`]. Best-effort stages downgrade their
//! failures to warnings; the first failure of a fatal stage ends the run and every later stage is
//! reported as skipped.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::{ExecCtx, ExecEvent, StageKind, StageOutcome, StagePolicy, StageStatus};
use crate::config::{ExternalToolConfig, TimeoutsConfig};
use crate::device::DeviceId;
use crate::environment::DeviceEnvironment;
use crate::error::{Error, Result};
use crate::planner::{Plan, Task};
use crate::workspace::{self, ProjectLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Cleaning,
    InstallingProfile,
    Compiling,
    Uploading,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Cleaning => "cleaning",
            PipelineState::InstallingProfile => "installing_profile",
            PipelineState::Compiling => "compiling",
            PipelineState::Uploading => "uploading",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        }
    }

    pub fn for_stage(stage: StageKind) -> Self {
        match stage {
            StageKind::Clean => PipelineState::Cleaning,
            StageKind::InstallProfile => PipelineState::InstallingProfile,
            StageKind::Compile => PipelineState::Compiling,
            StageKind::Upload => PipelineState::Uploading,
        }
    }

    pub fn valid_next(self) -> &'static [PipelineState] {
        use PipelineState::*;
        match self {
            Idle => &[Cleaning, InstallingProfile, Failed],
            Cleaning => &[InstallingProfile, Failed],
            InstallingProfile => &[Compiling, Failed],
            Compiling => &[Uploading, Done, Failed],
            Uploading => &[Done, Failed],
            Done | Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        self.valid_next().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional stages asked for on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requested {
    pub clean: bool,
    pub upload: bool,
}

#[derive(Debug)]
pub struct PipelineRun {
    pub device: DeviceId,
    pub requested: Requested,
    pub state: PipelineState,
    pub outcomes: Vec<StageOutcome>,
    pub error: Option<Error>,
}

impl PipelineRun {
    fn new(device: DeviceId, requested: Requested) -> Self {
        Self {
            device,
            requested,
            state: PipelineState::Idle,
            outcomes: Vec::new(),
            error: None,
        }
    }

    fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::msg(format!(
                "illegal pipeline transition {} -> {}",
                self.state, next
            )));
        }
        debug!(device = %self.device, from = %self.state, to = %next, "pipeline transition");
        self.state = next;
        Ok(())
    }

    pub fn outcome(&self, stage: StageKind) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage == stage)
    }

    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Done
    }

    /// The run itself on success, the fatal error otherwise.
    pub fn into_result(mut self) -> Result<PipelineRun> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Runs the external build tool for one stage. [`CommandTool`] is the real implementation.
pub trait BuildTool {
    fn run(
        &self,
        ctx: &ExecCtx,
        stage: StageKind,
        device: &DeviceId,
        timeout: Option<Duration>,
    ) -> Result<()>;
}

/// Invokes `<command> run -e <device> [-t clean|upload]` in the project root with the device id
/// bound in the child environment.
#[derive(Debug, Clone)]
pub struct CommandTool {
    command: Vec<String>,
    device_env_var: String,
    cwd: PathBuf,
}

impl CommandTool {
    pub fn new(cfg: &ExternalToolConfig, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: cfg
                .command
                .iter()
                .filter(|s| !s.trim().is_empty())
                .cloned()
                .collect(),
            device_env_var: cfg.device_env_var.clone(),
            cwd: cwd.into(),
        }
    }

    pub fn args(&self, stage: StageKind, device: &DeviceId) -> Result<Vec<String>> {
        let mut args = vec!["run".to_string(), "-e".into(), device.to_string()];
        match stage {
            StageKind::Clean => args.extend(["-t".into(), "clean".into()]),
            StageKind::Compile => {}
            StageKind::Upload => args.extend(["-t".into(), "upload".into()]),
            StageKind::InstallProfile => {
                return Err(Error::msg(format!("{stage} does not invoke the build tool")));
            }
        }
        Ok(args)
    }

    pub fn command(&self, stage: StageKind, device: &DeviceId) -> Result<Command> {
        let Some((program, prefix)) = self.command.split_first() else {
            return Err(Error::msg("build tool command is empty"));
        };
        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .args(self.args(stage, device)?)
            .env(&self.device_env_var, device.as_str())
            .current_dir(&self.cwd);
        Ok(cmd)
    }
}

impl BuildTool for CommandTool {
    fn run(
        &self,
        ctx: &ExecCtx,
        stage: StageKind,
        device: &DeviceId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let cmd = self.command(stage, device)?;
        ctx.run_cmd(stage, cmd, timeout)
    }
}

pub struct PipelineRequest<'a> {
    pub layout: &'a ProjectLayout,
    pub environment: &'a DeviceEnvironment,
    pub requested: Requested,
    pub timeouts: TimeoutsConfig,
    pub tool: &'a dyn BuildTool,
}

/// Runs every planned stage in order. Always returns the run; a fatal failure is recorded in
/// [`PipelineRun::error`] with the state set to [`PipelineState::Failed`].
pub fn execute(req: &PipelineRequest<'_>, ctx: &mut ExecCtx) -> PipelineRun {
    let device = req.environment.id.clone();
    let mut run = PipelineRun::new(device.clone(), req.requested);
    info!(
        device = %device,
        profile = %req.environment.extends,
        clean = req.requested.clean,
        upload = req.requested.upload,
        dry_run = ctx.dry_run,
        "starting build pipeline"
    );

    let mut fatal = match Plan::for_request(req.requested.clean, req.requested.upload) {
        Ok(plan) => run_plan(&plan, req, ctx, &mut run),
        Err(e) => Some(e),
    };

    if fatal.is_none()
        && let Err(e) = run.advance(PipelineState::Done)
    {
        fatal = Some(e);
    }
    if let Some(e) = fatal {
        // Failed is reachable from every non-terminal state.
        run.state = PipelineState::Failed;
        error!(device = %device, "build pipeline failed: {e}");
        run.error = Some(e);
    } else {
        info!(device = %device, "build pipeline finished");
    }

    ctx.sink.emit(ExecEvent::PipelineDone {
        device: device.to_string(),
        ok: run.succeeded(),
        error: run.error.as_ref().map(|e| e.to_string()),
        dry_run: ctx.dry_run,
    });
    run
}

fn run_plan(
    plan: &Plan,
    req: &PipelineRequest<'_>,
    ctx: &mut ExecCtx,
    run: &mut PipelineRun,
) -> Option<Error> {
    let tasks = match plan.ordered() {
        Ok(t) => t,
        Err(e) => return Some(e),
    };
    let mut fatal = None;
    for task in tasks {
        if fatal.is_some() {
            let outcome = StageOutcome {
                stage: task.stage,
                status: StageStatus::Skipped,
                elapsed_ms: 0,
            };
            ctx.sink.emit(ExecEvent::StageFinished {
                outcome: outcome.clone(),
            });
            run.outcomes.push(outcome);
            continue;
        }
        if let Err(e) = run.advance(PipelineState::for_stage(task.stage)) {
            fatal = Some(e);
            continue;
        }
        let (outcome, err) = run_stage(task, req, ctx);
        run.outcomes.push(outcome);
        fatal = err;
    }
    fatal
}

/// Runs one stage body and applies the task's policy to whatever failed.
fn run_stage(
    task: &Task,
    req: &PipelineRequest<'_>,
    ctx: &mut ExecCtx,
) -> (StageOutcome, Option<Error>) {
    let stage = task.stage;
    ctx.set_stage(stage);
    ctx.sink.emit(ExecEvent::StageStarted { stage });
    info!(%stage, "{}", task.label);

    let start = Instant::now();
    let failures = stage_body(stage, req, ctx);
    let elapsed_ms = start.elapsed().as_millis();

    let (status, fatal) = apply_policy(stage, task.policy, failures);
    let outcome = StageOutcome {
        stage,
        status,
        elapsed_ms,
    };
    ctx.sink.emit(ExecEvent::StageFinished {
        outcome: outcome.clone(),
    });
    (outcome, fatal)
}

fn apply_policy(
    stage: StageKind,
    policy: StagePolicy,
    mut failures: Vec<Error>,
) -> (StageStatus, Option<Error>) {
    if failures.is_empty() {
        return (StageStatus::Succeeded, None);
    }
    match policy {
        StagePolicy::BestEffort => {
            for f in &failures {
                warn!(%stage, "{f} (continuing)");
            }
            let warnings = failures.iter().map(|f| f.to_string()).collect();
            (StageStatus::Warned(warnings), None)
        }
        StagePolicy::Fatal => {
            let first = failures.swap_remove(0);
            (StageStatus::Failed(first.to_string()), Some(first))
        }
    }
}

/// Failures hit while running `stage`. Fatal stages stop at their first.
fn stage_body(stage: StageKind, req: &PipelineRequest<'_>, ctx: &ExecCtx) -> Vec<Error> {
    let device = &req.environment.id;
    let timeout = req.timeouts.for_stage(stage);
    match stage {
        StageKind::Clean => clean(req, ctx, timeout),
        StageKind::InstallProfile => install_profile(req, ctx).err().into_iter().collect(),
        StageKind::Compile | StageKind::Upload => req
            .tool
            .run(ctx, stage, device, timeout)
            .err()
            .into_iter()
            .collect(),
    }
}

fn clean(req: &PipelineRequest<'_>, ctx: &ExecCtx, timeout: Option<Duration>) -> Vec<Error> {
    let layout = req.layout;
    let device = &req.environment.id;
    let mut failures = Vec::new();

    if let Err(e) = req.tool.run(ctx, StageKind::Clean, device, timeout) {
        failures.push(e);
    }

    for dir in &layout.build_dirs {
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: remove {}", dir.display()));
            continue;
        }
        match workspace::safe_remove_dir_all(&layout.root, dir) {
            Ok(true) => ctx.log(&format!("removed {}", dir.display())),
            Ok(false) => {}
            Err(e) => failures.push(e),
        }
    }

    let sdkconfig = layout.device_sdkconfig(device);
    if ctx.dry_run {
        ctx.log(&format!("DRY-RUN: remove {}", sdkconfig.display()));
    } else {
        match workspace::safe_remove_file(&layout.root, &sdkconfig) {
            Ok(true) => ctx.log(&format!("removed {}", sdkconfig.display())),
            Ok(false) => {}
            Err(e) => failures.push(e),
        }
    }
    failures
}

fn install_profile(req: &PipelineRequest<'_>, ctx: &ExecCtx) -> Result<()> {
    let profile = req.environment.extends;
    let template = req.layout.profile_template(profile);
    let target = &req.layout.sdkconfig_defaults;

    if !template.is_file() {
        return Err(Error::msg(format!(
            "profile template {} for {profile} not found",
            template.display()
        )));
    }
    if ctx.dry_run {
        ctx.log(&format!(
            "DRY-RUN: copy {} -> {}",
            template.display(),
            target.display()
        ));
        return Ok(());
    }
    fs::copy(&template, target).map_err(|e| {
        Error::io(
            format!(
                "failed to copy {} to {}",
                template.display(),
                target.display()
            ),
            e,
        )
    })?;
    ctx.log(&format!(
        "installed {} -> {}",
        template.display(),
        target.display()
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::{Arc, mpsc};

    use super::*;
    use crate::config::PathsConfig;
    use crate::executor::ChannelSink;
    use crate::profile::HardwareProfile;

    #[derive(Default)]
    struct FakeTool {
        calls: RefCell<Vec<StageKind>>,
        fail: Vec<StageKind>,
        time_out: Vec<StageKind>,
    }

    impl BuildTool for FakeTool {
        fn run(
            &self,
            ctx: &ExecCtx,
            stage: StageKind,
            _device: &DeviceId,
            _timeout: Option<Duration>,
        ) -> Result<()> {
            self.calls.borrow_mut().push(stage);
            ctx.log(&format!("fake {}", stage.id()));
            if self.fail.contains(&stage) {
                return Err(Error::ExternalToolFailure {
                    stage,
                    code: Some(1),
                });
            }
            if self.time_out.contains(&stage) {
                return Err(Error::StageTimeout { stage, secs: 1 });
            }
            Ok(())
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        layout: ProjectLayout,
        env: DeviceEnvironment,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join("sdkconfig.defaults_esp32c3_base"),
            "CONFIG_IDF_TARGET=\"esp32c3\"\n",
        )
        .unwrap();
        let layout = ProjectLayout::resolve(tmp.path(), &PathsConfig::default()).unwrap();
        let env = DeviceEnvironment {
            id: DeviceId::parse("sensor_temp").unwrap(),
            extends: HardwareProfile::Esp32c3Base,
        };
        Fixture { tmp, layout, env }
    }

    fn run_with(
        fx: &Fixture,
        tool: &FakeTool,
        requested: Requested,
        dry_run: bool,
    ) -> (PipelineRun, Vec<ExecEvent>) {
        let (tx, rx) = mpsc::channel();
        let mut ctx = ExecCtx::new(dry_run, Arc::new(ChannelSink::new(tx)));
        let req = PipelineRequest {
            layout: &fx.layout,
            environment: &fx.env,
            requested,
            timeouts: TimeoutsConfig::default(),
            tool,
        };
        let run = execute(&req, &mut ctx);
        drop(ctx);
        (run, rx.iter().collect())
    }

    fn status(run: &PipelineRun, stage: StageKind) -> Option<&StageStatus> {
        run.outcome(stage).map(|o| &o.status)
    }

    #[test]
    fn state_machine_transitions() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(Cleaning));
        assert!(Idle.can_transition_to(InstallingProfile));
        assert!(!Idle.can_transition_to(Compiling));
        assert!(Cleaning.can_transition_to(InstallingProfile));
        assert!(!Cleaning.can_transition_to(Compiling));
        assert!(Compiling.can_transition_to(Done));
        assert!(!InstallingProfile.can_transition_to(Uploading));
        assert!(Done.valid_next().is_empty());
        assert!(Failed.is_terminal());
    }

    #[test]
    fn flagless_run_installs_profile_and_compiles() {
        let fx = fixture();
        let tool = FakeTool::default();
        let (run, events) = run_with(&fx, &tool, Requested::default(), false);

        assert!(run.succeeded());
        assert_eq!(*tool.calls.borrow(), vec![StageKind::Compile]);
        assert_eq!(
            run.outcomes.iter().map(|o| o.stage).collect::<Vec<_>>(),
            vec![StageKind::InstallProfile, StageKind::Compile]
        );
        let installed = std::fs::read_to_string(fx.tmp.path().join("sdkconfig.defaults")).unwrap();
        assert!(installed.contains("esp32c3"));
        assert!(matches!(
            events.last(),
            Some(ExecEvent::PipelineDone { ok: true, .. })
        ));
    }

    #[test]
    fn clean_failure_never_blocks_profile_install() {
        let fx = fixture();
        std::fs::create_dir_all(fx.tmp.path().join(".pio/build/sensor_temp")).unwrap();
        std::fs::write(fx.tmp.path().join("sdkconfig.sensor_temp"), "x").unwrap();
        let tool = FakeTool {
            fail: vec![StageKind::Clean],
            ..Default::default()
        };
        let requested = Requested {
            clean: true,
            upload: true,
        };
        let (run, _) = run_with(&fx, &tool, requested, false);

        assert!(run.succeeded(), "{:?}", run.error);
        assert!(matches!(
            status(&run, StageKind::Clean),
            Some(StageStatus::Warned(w)) if w.len() == 1
        ));
        assert_eq!(
            *tool.calls.borrow(),
            vec![StageKind::Clean, StageKind::Compile, StageKind::Upload]
        );
        assert!(!fx.tmp.path().join(".pio/build").exists());
        assert!(!fx.tmp.path().join("sdkconfig.sensor_temp").exists());
    }

    #[test]
    fn compile_failure_skips_upload() {
        let fx = fixture();
        let tool = FakeTool {
            fail: vec![StageKind::Compile],
            ..Default::default()
        };
        let requested = Requested {
            clean: true,
            upload: true,
        };
        let (run, _) = run_with(&fx, &tool, requested, false);

        assert_eq!(run.state, PipelineState::Failed);
        assert_eq!(status(&run, StageKind::Upload), Some(&StageStatus::Skipped));
        assert!(!tool.calls.borrow().contains(&StageKind::Upload));
        let err = run.into_result().unwrap_err();
        assert!(
            matches!(err, Error::ExternalToolFailure { stage: StageKind::Compile, code: Some(1) }),
            "unexpected err: {err}"
        );
    }

    #[test]
    fn timeout_follows_stage_policy() {
        let fx = fixture();
        let tool = FakeTool {
            time_out: vec![StageKind::Clean, StageKind::Upload],
            ..Default::default()
        };
        let requested = Requested {
            clean: true,
            upload: true,
        };
        let (run, _) = run_with(&fx, &tool, requested, false);

        assert!(matches!(
            status(&run, StageKind::Clean),
            Some(StageStatus::Warned(_))
        ));
        assert_eq!(status(&run, StageKind::Compile), Some(&StageStatus::Succeeded));
        assert!(matches!(
            run.into_result(),
            Err(Error::StageTimeout {
                stage: StageKind::Upload,
                ..
            })
        ));
    }

    #[test]
    fn missing_template_fails_before_compiling() {
        let fx = fixture();
        std::fs::remove_file(fx.tmp.path().join("sdkconfig.defaults_esp32c3_base")).unwrap();
        let tool = FakeTool::default();
        let (run, _) = run_with(&fx, &tool, Requested::default(), false);

        assert_eq!(run.state, PipelineState::Failed);
        assert!(tool.calls.borrow().is_empty());
        assert_eq!(status(&run, StageKind::Compile), Some(&StageStatus::Skipped));
        let err = run.into_result().unwrap_err();
        assert!(err.to_string().contains("sdkconfig.defaults_esp32c3_base"), "{err}");
    }

    #[test]
    fn dry_run_touches_nothing_on_disk() {
        let fx = fixture();
        std::fs::create_dir_all(fx.tmp.path().join("build")).unwrap();
        let tool = FakeTool::default();
        let requested = Requested {
            clean: true,
            upload: false,
        };
        let (run, events) = run_with(&fx, &tool, requested, true);

        assert!(run.succeeded());
        assert!(fx.tmp.path().join("build").exists());
        assert!(!fx.tmp.path().join("sdkconfig.defaults").exists());
        assert!(events.iter().any(|ev| matches!(
            ev,
            ExecEvent::StageLog { stage: StageKind::InstallProfile, line } if line.starts_with("DRY-RUN: copy")
        )));
    }

    #[test]
    fn command_tool_builds_stage_invocations() {
        let cfg = ExternalToolConfig {
            command: vec!["python3".into(), "-m".into(), "platformio".into()],
            device_env_var: "SENSOR_ENV".into(),
        };
        let tool = CommandTool::new(&cfg, "/proj");
        let dev = DeviceId::parse("sensor_1").unwrap();

        assert_eq!(
            tool.args(StageKind::Clean, &dev).unwrap(),
            vec!["run", "-e", "sensor_1", "-t", "clean"]
        );
        assert_eq!(
            tool.args(StageKind::Compile, &dev).unwrap(),
            vec!["run", "-e", "sensor_1"]
        );
        assert!(tool.args(StageKind::InstallProfile, &dev).is_err());

        let cmd = tool.command(StageKind::Upload, &dev).unwrap();
        assert_eq!(cmd.get_program(), "python3");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["-m", "platformio", "run", "-e", "sensor_1", "-t", "upload"]
        );
        let envs: Vec<_> = cmd.get_envs().collect();
        assert_eq!(
            envs,
            vec![(
                std::ffi::OsStr::new("SENSOR_ENV"),
                Some(std::ffi::OsStr::new("sensor_1"))
            )]
        );
    }
}
