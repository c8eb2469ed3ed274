use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use sensor_provisioner::executor::StdoutSink;
use sensor_provisioner::provision::{self, ProvisionOptions};
use sensor_provisioner::{Result, logging};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Provision, build and optionally flash firmware for one sensor device",
    override_usage = "provision [OPTIONS] <DEVICE_ID> [clean] [upload]"
)]
struct Args {
    /// Device id, as declared by an `[env:<id>]` section of platformio.ini
    device: Option<String>,
    /// `clean` and/or `upload`, in any order
    #[arg(value_name = "STAGE")]
    stages: Vec<String>,
    /// Project root holding platformio.ini and credentials.ini
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,
    /// Resolve and render everything, but write nothing and run no tools
    #[arg(long)]
    dry_run: bool,
    /// Timeout in seconds for every external tool stage
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Build tool command (default: pio, or [tool].command in provisioner.toml)
    #[arg(long, value_name = "CMD")]
    tool: Option<String>,
    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    logging::init_tracing(args.log_json);

    let Some(device) = args.device.clone() else {
        let _ = Args::command().print_help();
        return ExitCode::FAILURE;
    };

    match run(args, device) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args, device: String) -> Result<()> {
    provision::load_dotenv(&args.project_dir);

    let mut opts = ProvisionOptions::new(args.project_dir, device);
    opts.requested = provision::parse_stage_words(&args.stages)?;
    opts.dry_run = args.dry_run;
    opts.timeout_secs = args.timeout;
    opts.tool_command = args
        .tool
        .map(|t| t.split_whitespace().map(str::to_string).collect());

    let sink = Arc::new(StdoutSink::default());
    provision::provision(&opts, sink)?;
    Ok(())
}
