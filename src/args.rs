use clap::Parser;
use std::path::PathBuf;

use nestcomp::config;
use nestcomp::render::RenderMode;

#[derive(Parser, Debug)]
#[command(name = "nestcomp")]
#[command(author = "Selkies Team")]
#[command(version)]
#[command(about = "Nested compositor demo host", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/nestcomp.toml")]
    pub config: PathBuf,

    /// Prefer the hardware render path (falls back to software)
    #[arg(long, action, conflicts_with = "software")]
    pub hardware: bool,

    /// Force the software render path
    #[arg(long, action)]
    pub software: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Output width override
    #[arg(long)]
    pub width: Option<u32>,

    /// Output height override
    #[arg(long)]
    pub height: Option<u32>,

    /// Stop after this many frame intervals (runs until interrupted when absent)
    #[arg(short, long)]
    pub frames: Option<u64>,

    /// Client command to launch against the compositor socket (repeatable)
    #[arg(long, value_name = "CMD")]
    pub spawn: Vec<String>,

    /// Write the last rendered frame to this PNG file
    #[arg(long)]
    pub dump_frame: Option<PathBuf>,

    /// Run even when no parent display is present
    #[arg(long, action)]
    pub no_parent_check: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Render mode forced on the command line, if any
    pub fn render_mode(&self) -> Option<RenderMode> {
        if self.hardware {
            Some(RenderMode::Hardware)
        } else if self.software {
            Some(RenderMode::Software)
        } else {
            None
        }
    }

    /// Apply size overrides to a loaded configuration
    pub fn apply(&self, config: &mut config::Config) {
        if let Some(width) = self.width {
            config.output.width = width;
        }
        if let Some(height) = self.height {
            config.output.height = height;
        }
        if let Some(mode) = self.render_mode() {
            config.render.mode = mode;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["nestcomp"]);
        assert!(args.spawn.is_empty());
        assert_eq!(args.render_mode(), None);
        assert!(args.frames.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from(["nestcomp", "--software", "--width", "800", "--frames", "10"]);
        let mut config = config::Config::default();
        config.render.mode = RenderMode::Hardware;
        args.apply(&mut config);
        assert_eq!(config.render.mode, RenderMode::Software);
        assert_eq!(config.output.width, 800);
        assert_eq!(config.output.height, 720);
        assert_eq!(args.frames, Some(10));
    }

    #[test]
    fn test_spawn_is_repeatable() {
        let args = Args::parse_from(["nestcomp", "--spawn", "foot", "--spawn", "weston-terminal -f"]);
        assert_eq!(args.spawn, vec!["foot".to_string(), "weston-terminal -f".to_string()]);
    }

    #[test]
    fn test_hardware_conflicts_with_software() {
        assert!(Args::try_parse_from(["nestcomp", "--hardware", "--software"]).is_err());
    }
}
