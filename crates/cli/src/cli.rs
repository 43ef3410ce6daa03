use clap::Parser;
use std::path::{Path, PathBuf};

/// Command line interface for the presage daemon.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about = None, version)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub conffile: Option<PathBuf>,

    /// Path to the state file. Without one, nothing is persisted.
    #[arg(short, long, value_name = "FILE")]
    pub statefile: Option<PathBuf>,

    /// Path to the log file. Without one, logs go to stderr.
    #[arg(short, long, value_name = "FILE")]
    pub logfile: Option<PathBuf>,

    /// Nice level for the daemon process.
    #[arg(short, long, default_value_t = 0)]
    pub nice: i32,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short, long)]
    pub foreground: bool,

    /// Increase verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Configuration files to load, in override order (later wins).
    ///
    /// An explicit `--conffile` is used alone; otherwise the system config
    /// plus any `config.d` drop-ins.
    pub fn config_paths(&self) -> Vec<PathBuf> {
        if let Some(conffile) = &self.conffile {
            return vec![conffile.clone()];
        }

        let mut paths = vec![PathBuf::from("/etc/presaged/config.toml")];
        paths.extend(collect_toml(Path::new("/etc/presaged/config.d")));
        paths
    }

    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

fn collect_toml(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("toml"))
        .collect();
    paths.sort();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_conffile_wins() {
        let cli = Cli::parse_from(["presaged", "--conffile", "/tmp/custom.toml"]);
        assert_eq!(cli.config_paths(), vec![PathBuf::from("/tmp/custom.toml")]);
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(Cli::parse_from(["presaged"]).log_level(), "info");
        assert_eq!(Cli::parse_from(["presaged", "-v"]).log_level(), "debug");
        assert_eq!(Cli::parse_from(["presaged", "-vvv"]).log_level(), "trace");
    }
}
