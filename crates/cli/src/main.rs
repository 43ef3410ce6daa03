use clap::Parser;
use config::Config;
use engine::State;
use flume::bounded;
use presaged::{
    cli::Cli,
    logging::LogWriter,
    signals::{SignalEvent, wait_for_signals},
};
use tokio::time;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.nice != 0 {
        // SAFETY: plain libc call with no pointer arguments.
        if unsafe { libc::nice(cli.nice) } < 0 {
            eprintln!("failed to renice: {}", std::io::Error::last_os_error());
        }
    }

    if !cli.foreground {
        nix::unistd::daemon(false, false)?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let log_writer = LogWriter::new(cli.logfile.as_deref())?;

    // The verbosity flag takes precedence over the environment variable:
    // `PRESAGE_LOG` can tune levels per crate but not lower the flag's
    // global level.
    let env_filter = EnvFilter::builder()
        .with_env_var("PRESAGE_LOG")
        .from_env()?
        .add_directive(cli.log_level().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(cli.logfile.is_none())
        .with_writer(log_writer.clone());

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    let config = Config::load_multiple(cli.config_paths())?;
    debug!(?config, ?cli, "starting up");

    let (signals_tx, signals_rx) = bounded(8);
    let mut signal_handle = tokio::spawn(wait_for_signals(signals_tx));

    let autosave = config.system.autosave;
    let state = State::try_new(config, cli.statefile.clone())?;

    let state_clone = state.clone();
    let mut state_handle = tokio::spawn(async move { state_clone.start().await });

    let state_clone = state.clone();
    let mut saver_handle = tokio::spawn(async move { saver(state_clone, autosave).await });

    loop {
        tokio::select! {
            // bubble up errors from the signal handler
            res = &mut signal_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("error while handling signals: {err}");
                }
                res?;
            }

            // bubble up errors from the autosaver
            res = &mut saver_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("error while autosaving: {err}");
                }
                res?;
            }

            // bubble up errors from the engine
            res = &mut state_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("engine error: {err}");
                }
                res?;
            }

            event_res = signals_rx.recv_async() => {
                match event_res? {
                    SignalEvent::ReloadConfig => {
                        if let Some(conffile) = &cli.conffile {
                            if let Err(err) = state.reload_config(conffile).await {
                                warn!(%err, "config reload failed, keeping previous config");
                            }
                        }
                        if let Some(logfile) = &cli.logfile {
                            if let Err(err) = log_writer.reopen(logfile) {
                                warn!(%err, "failed to reopen log file");
                            }
                        }
                        info!("config reloaded");
                    }
                    SignalEvent::DumpStateInfo => {
                        state.dump_info().await;
                    }
                    SignalEvent::SaveStateNow => {
                        state.write().await?;
                        info!("state saved");
                    }
                    SignalEvent::Terminate => {
                        info!("exit requested");
                        break;
                    }
                }
            }
        }
    }

    // stop ticking, then take the lock for a final save; the in-flight
    // phase finishes before the lock is granted
    state_handle.abort();
    saver_handle.abort();
    signal_handle.abort();

    state.write().await?;
    info!("state saved, exiting");
    Ok(())
}

async fn saver(state: State, period: std::time::Duration) -> Result<(), engine::Error> {
    debug!(?period, "autosave interval");
    loop {
        time::sleep(period).await;
        debug!("autosaving state");
        state.write().await?;
    }
}
