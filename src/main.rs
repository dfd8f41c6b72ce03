use anyhow::Context;
use epazote::app::{verify_services, EpazoteApp};
use epazote::config::EpazoteConfig;
use epazote::telemetry;
use std::path::Path;
use tracing::warn;

enum CliCommand {
    Run(CliOptions),
    Version,
    Help,
}

struct CliOptions {
    file: String,
    keep_going: bool,
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = match parse_cli_args()? {
        CliCommand::Run(options) => options,
        CliCommand::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliCommand::Help => {
            print_help();
            return Ok(());
        }
    };

    telemetry::init_tracing(options.debug).context("failed to initialise telemetry")?;

    if !Path::new(&options.file).exists() {
        anyhow::bail!(
            "cannot read configuration file: {}, use -h for more info",
            options.file
        );
    }

    let mut config =
        EpazoteConfig::from_path(&options.file).context("failed to load configuration")?;
    config
        .check_scan_paths()
        .context("failed to verify scan paths")?;

    let failures = verify_services(&config.services).await;
    if !failures.is_empty() {
        let rendered = failures
            .iter()
            .map(|(name, error)| format!("{name} - verify URL: {error}"))
            .collect::<Vec<_>>()
            .join("\n");
        if options.keep_going {
            warn!("{rendered}");
        } else {
            anyhow::bail!("{rendered}");
        }
    }

    let app =
        EpazoteApp::initialise(config, options.debug).context("failed to construct application")?;
    app.run().await.context("application runtime error")
}

fn parse_cli_args() -> anyhow::Result<CliCommand> {
    let mut file = "epazote.yml".to_string();
    let mut keep_going = false;
    let mut debug = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-f" => {
                file = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("expected path after -f"))?;
            }
            "-c" => keep_going = true,
            "-d" => debug = true,
            "-v" => return Ok(CliCommand::Version),
            "-h" | "--help" => return Ok(CliCommand::Help),
            other => anyhow::bail!("unrecognised argument `{other}`"),
        }
    }

    Ok(CliCommand::Run(CliOptions {
        file,
        keep_going,
        debug,
    }))
}

fn print_help() {
    println!(
        "\
Usage: epazote [OPTIONS]

Options:
  -f <file.yml>   Configuration file (default epazote.yml)
  -c              Continue on URL-reachability errors
  -d              Debug logging
  -v              Print version and exit
  -h, --help      Print this help message
"
    );
}
