use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn signals_trigger_dump_reload_save_and_exit() -> io::Result<()> {
    let dir = tempdir()?;
    let config_path = dir.path().join("config.toml");
    let state_path = dir.path().join("presage.state");
    write_config(&config_path, 3600)?;

    let child = Command::new(env!("CARGO_BIN_EXE_presaged"))
        .arg("--foreground")
        .arg("--conffile")
        .arg(&config_path)
        .arg("--statefile")
        .arg(&state_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let pid = Pid::from_raw(child.id() as i32);
    sleep(Duration::from_millis(400));

    kill(pid, Signal::SIGUSR1).ok();
    sleep(Duration::from_millis(400));

    write_config(&config_path, 1800)?;
    kill(pid, Signal::SIGHUP).ok();
    sleep(Duration::from_millis(400));

    kill(pid, Signal::SIGUSR2).ok();
    sleep(Duration::from_millis(500));

    kill(pid, Signal::SIGINT).ok();
    let output = wait_for_output(child)?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    assert!(combined.contains("current config"), "output: {combined}");
    assert!(combined.contains("config reloaded"), "output: {combined}");
    assert!(combined.contains("state saved"), "output: {combined}");
    assert!(combined.contains("exit requested"), "output: {combined}");

    Ok(())
}

fn write_config(path: &Path, autosave: u64) -> io::Result<()> {
    let contents = format!(
        "[model]\ncycle = 2\n\n[system]\ndoscan = false\ndopredict = false\nautosave = {autosave}\n"
    );
    fs::write(path, contents)
}

fn wait_for_output(mut child: Child) -> io::Result<Output> {
    let start = Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            break;
        }
        if start.elapsed() > Duration::from_secs(10) {
            let _ = child.kill();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "presaged did not exit",
            ));
        }
        sleep(Duration::from_millis(50));
    }
    child.wait_with_output()
}
