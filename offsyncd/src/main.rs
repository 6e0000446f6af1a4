use std::io;

use offsyncd::daemon::{DaemonConfig, DaemonRuntime, open_oneshot, status_snapshot, validate_once};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    Validate,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--validate" => mode = CliMode::Validate,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

/// Log level comes from `RUST_LOG`, defaulting to `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: offsyncd [--status | --validate]");
        println!("  --status     Print queue, validation and storage status as JSON and exit");
        println!("  --validate   Replay pending work, revalidate cached entities and exit");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    match mode {
        CliMode::Status => {
            let engine = open_oneshot(&config).await?;
            let snapshot = status_snapshot(&engine).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            engine.dispose().await?;
            Ok(())
        }
        CliMode::Validate => {
            let engine = open_oneshot(&config).await?;
            let result = validate_once(&engine).await;
            engine.dispose().await?;
            println!("{}", serde_json::to_string_pretty(&result?)?);
            Ok(())
        }
        CliMode::Run | CliMode::Help => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["offsyncd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_status_and_validate() {
        let mode = parse_cli_mode(vec!["offsyncd".to_string(), "--status".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Status);
        let mode = parse_cli_mode(vec!["offsyncd".to_string(), "--validate".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Validate);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(vec!["offsyncd".to_string(), "-h".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["offsyncd".to_string(), "--logout".to_string()]).is_err());
    }
}
