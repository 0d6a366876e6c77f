use docsyncd::daemon::{DaemonConfig, DaemonRuntime, store_summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Status,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--status" => mode = CliMode::Status,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: docsyncd [--once | --status]");
        println!("  --once     Synchronize until both sides agree, then exit");
        println!("  --status   Print the state store summary and exit");
        return Ok(());
    }

    docsyncd::telemetry::init();
    let config = DaemonConfig::from_env()?;
    match mode {
        CliMode::Status => {
            println!("{}", store_summary(&config).await?);
            Ok(())
        }
        CliMode::Once => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            let status = daemon.run_once().await?;
            if !status.is_synchronized() {
                anyhow::bail!(
                    "not synchronized: {} pending, {} conflicted, {} failed",
                    status.counts.pending,
                    status.counts.conflicted,
                    status.counts.errors
                );
            }
            println!("synchronized {} items", status.counts.total);
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

    fn parse(args: &[&str]) -> anyhow::Result<CliMode> {
        parse_cli_mode(
            std::iter::once("docsyncd")
                .chain(args.iter().copied())
                .map(str::to_string),
        )
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse(&[]).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_once_and_status() {
        assert_eq!(parse(&["--once"]).unwrap(), CliMode::Once);
        assert_eq!(parse(&["--status"]).unwrap(), CliMode::Status);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse(&["-h"]).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse(&["--logout"]).is_err());
    }
}
