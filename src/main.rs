mod relayd;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "relayd",
    version,
    about = "relayd - transparent L4 TCP/UDP forwarder with HTTP-CONNECT proxy chaining"
)]
struct Cli {
    /// Path to relayd config file (.toml/.yaml/.yml). If omitted, uses RELAYD_CONFIG; then auto-detects relayd.toml > relayd.yaml > relayd.yml from CWD; then falls back to the OS default path (via directories::ProjectDirs).
    #[arg(long, env = "RELAYD_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// relayd working directory (runtime state). Defaults to /var/lib/relayd on Linux; on other OSes defaults to the per-user data dir.
    #[arg(long, env = "RELAYD_WORKDIR")]
    workdir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    relayd::run(cli.config, cli.workdir).await
}
