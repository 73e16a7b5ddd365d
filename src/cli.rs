//! CLI contract for the embedder (spec §6). Grounded on
//! `original_source/.../application.cpp`'s `init_env` (the `--home`/
//! `GX_HOME`/`--node`/`--daemon` handling), translated from manual
//! `getopt_long` parsing into a `clap` derive, the teacher's CLI crate.

use clap::Parser;
use std::path::PathBuf;

/// `--home <dir>` / `GX_HOME` / default `..`: root of the configuration
/// and scripts directory layout (spec §6).
#[derive(Debug, Parser)]
#[command(name = "coronetd", version, about = "coronet node process")]
pub struct Args {
    /// Root of the configuration/scripts directory layout. Falls back to
    /// `GX_HOME`, then `..`, exactly as `Application::init_env` does.
    #[arg(long, env = "GX_HOME")]
    pub home: Option<PathBuf>,

    /// This process's id within its node type.
    #[arg(long)]
    pub node: u32,

    /// Node type name, resolved against the loaded topology's node names.
    /// The original derives this from argv[0]'s basename
    /// (`Application::init_name`); we take it as an explicit flag instead
    /// (SPEC_FULL.md §10.4, §11 — noted as an Open Question resolution in
    /// DESIGN.md).
    #[arg(long = "node-type")]
    pub node_type: String,

    /// Path to the TOML topology file (substitutes the original's Lua
    /// `the_network` script, out of scope per spec §1).
    #[arg(long, default_value = "etc/network.toml")]
    pub config: PathBuf,

    /// Detach (fork + setsid, close stdio) before the main loop starts.
    #[arg(long)]
    pub daemon: bool,
}

impl Args {
    pub fn home_dir(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(|| PathBuf::from(".."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_defaults_to_parent_dir_when_unset() {
        let args = Args {
            home: None,
            node: 0,
            node_type: "game".into(),
            config: "etc/network.toml".into(),
            daemon: false,
        };
        assert_eq!(args.home_dir(), PathBuf::from(".."));
    }

    #[test]
    fn parses_minimal_required_flags() {
        let args = Args::parse_from(["coronetd", "--node", "1", "--node-type", "game"]);
        assert_eq!(args.node, 1);
        assert_eq!(args.node_type, "game");
        assert!(!args.daemon);
    }
}
