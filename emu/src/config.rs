use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which rasterizer implementation drives the GE.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    /// Resolves the fixed-function state on every draw call.
    #[default]
    Software,
    /// Caches resolved pipelines keyed by the state fingerprint.
    Pipeline,
}

/// Emulator settings, usually read from a TOML file by the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub renderer: RendererKind,
    /// Emulated CPU clock, used to convert microseconds to cycles.
    pub cpu_hz: u64,
    /// Size of the user partition starting at `0x0880_0000`.
    pub user_memory_size: u32,
    /// Frames a cached texture may stay unused before it is evicted.
    pub texture_kill_age: u32,
    /// Overwrite argument registers after every HLE call.
    pub poison_hle_args: bool,
    /// Optional log file, written next to the console output.
    pub log_file: Option<PathBuf>,
    /// Stop after this many instructions.
    pub max_instructions: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            renderer: RendererKind::Software,
            cpu_hz: 222_000_000,
            user_memory_size: 0x0180_0000,
            texture_kill_age: 200,
            poison_hle_args: true,
            log_file: None,
            max_instructions: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_describe_the_stock_console() {
        let config = Config::default();
        assert_eq!(config.cpu_hz, 222_000_000);
        assert_eq!(config.user_memory_size, 0x0180_0000);
        assert_eq!(config.renderer, RendererKind::Software);
        assert!(config.poison_hle_args);
    }
}
