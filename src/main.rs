use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::{env, fs};

use emu::config::Config;
use emu::error::EmuError;
use emu::system::{RunOutcome, System};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

fn load_config(path: Option<&Path>) -> Result<Config, EmuError> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| EmuError::Config(e.to_string()))
}

/// Console output filtered by `RUST_LOG` (default `info`), plus an optional
/// file sink. The guard flushes the file when dropped.
fn init_tracing(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().map_or_else(|| "kumquat.log".into(), |n| n.to_os_string());
            let appender = tracing_appender::rolling::never(directory, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn run(executable: &Path, config: Config) -> Result<RunOutcome, EmuError> {
    let data = fs::read(executable)?;
    let limit = config.max_instructions;
    let mut system = System::new(config);
    system.load_executable(&data)?;
    Ok(system.run(limit))
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(executable) = args.first().map(PathBuf::from) else {
        eprintln!("usage: kumquat <elf> [config.toml]");
        return ExitCode::from(1);
    };

    let config = match load_config(args.get(1).map(Path::new)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    let _guard = init_tracing(config.log_file.as_deref());
    info!("kumquat v{}", env!("CARGO_PKG_VERSION"));
    info!("loading {}", executable.display());

    match run(&executable, config) {
        Ok(RunOutcome::Halted { pc, op }) => {
            error!("halted at {pc:#010x} on {op:#010x}");
            ExitCode::from(3)
        }
        Ok(outcome) => {
            info!("finished: {outcome:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu::config::RendererKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_config_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/kumquat.toml"))).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(load_config(None).unwrap(), Config::default());
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config: Config = toml::from_str("renderer = \"pipeline\"\nmax_instructions = 1000\n").unwrap();
        assert_eq!(config.renderer, RendererKind::Pipeline);
        assert_eq!(config.max_instructions, Some(1000));
        assert_eq!(config.cpu_hz, Config::default().cpu_hz);
    }
}
