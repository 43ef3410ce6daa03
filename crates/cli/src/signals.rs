use tokio::signal::unix::{SignalKind, signal};
use tracing::debug;

/// Requests delivered by signals, drained by the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGHUP: re-read the config file and reopen the log.
    ReloadConfig,
    /// SIGUSR1: write model statistics to the log.
    DumpStateInfo,
    /// SIGUSR2: save the state immediately.
    SaveStateNow,
    /// SIGINT/SIGTERM/SIGQUIT: drain, save, and exit.
    Terminate,
}

/// Translate process signals into [`SignalEvent`]s until the channel
/// closes.
pub async fn wait_for_signals(tx: flume::Sender<SignalEvent>) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user_defined1 = signal(SignalKind::user_defined1())?;
    let mut user_defined2 = signal(SignalKind::user_defined2())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    loop {
        let event = tokio::select! {
            _ = hangup.recv() => SignalEvent::ReloadConfig,
            _ = user_defined1.recv() => SignalEvent::DumpStateInfo,
            _ = user_defined2.recv() => SignalEvent::SaveStateNow,
            _ = interrupt.recv() => SignalEvent::Terminate,
            _ = terminate.recv() => SignalEvent::Terminate,
            _ = quit.recv() => SignalEvent::Terminate,
        };
        debug!(?event, "signal received");
        tx.send_async(event).await?;
    }
}
