use std::path::PathBuf;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use loadhammer::engine::Engine;
use loadhammer::reporter;
use loadhammer::PlanFile;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;
// 128 + SIGINT, the conventional shell exit status for an interrupted run.
const EXIT_CANCELLED: u8 = 130;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// `loadhammer -config plan.json` or `loadhammer plan.json`.
fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("-config") | Some("--config") => args.next().map(PathBuf::from),
        Some(path) => Some(PathBuf::from(path)),
        None => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let Some(path) = config_path() else {
        eprintln!("usage: loadhammer [-config] <plan.json>");
        return ExitCode::from(EXIT_CONFIG);
    };

    let hammer = match PlanFile::load(&path) {
        Ok(file) => match file.into_hammer().await {
            Ok(hammer) => hammer,
            Err(e) => {
                error!(error = %e, "invalid plan");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        Err(e) => {
            error!(error = %e, "failed to read plan");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let sink = reporter::for_destination(&hammer.report_destination);
    let engine = Engine::new(hammer);

    match engine.run(cancel.clone(), sink).await {
        Ok(_summary) => {
            if cancel.is_cancelled() {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::from(EXIT_OK)
            }
        }
        Err(e) => {
            error!(error = %e, "run failed");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
