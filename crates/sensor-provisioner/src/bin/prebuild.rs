use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use sensor_provisioner::config::tool;
use sensor_provisioner::logging;
use sensor_provisioner::provision;

/// Pre-build hook run by the build tool: regenerates the device config and version headers.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Project root holding platformio.ini and credentials.ini
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,
    /// Device id; read from the device environment variable (SENSOR_ENV) when omitted
    #[arg(long)]
    device: Option<String>,
    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_tracing(args.log_json);
    provision::load_dotenv(&args.project_dir);

    let device = match args.device {
        Some(d) => Some(d),
        None => {
            let var = match tool::load(&args.project_dir) {
                Ok(cfg) => cfg.tool.device_env_var,
                Err(e) => {
                    tracing::error!("{e}");
                    return ExitCode::FAILURE;
                }
            };
            std::env::var(&var).ok().filter(|v| !v.trim().is_empty())
        }
    };
    let Some(device) = device else {
        tracing::info!("no device selected; skipping header generation");
        return ExitCode::SUCCESS;
    };

    match provision::prebuild(&args.project_dir, &device) {
        Ok(report) => {
            tracing::info!(
                device = %device,
                fingerprint = %report.artifact.fingerprint,
                sha = %report.version.sha,
                "pre-build headers ready"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
