//! Local stand-in for the feature-voting API.
//!
//! Serves the in-memory router until Ctrl+C. With `--seed`, a demo account
//! (demo / demo-password) and a couple of features are created up front.
//!
//! Usage: cargo run --bin mock_api -- --addr 127.0.0.1:8000 --seed

use clap::Parser;
use featurevote::config::ClientConfig;
use featurevote::logging;
use featurevote::mock_server::MockServer;
use featurevote::models::VoteType;
use tracing::info;

#[derive(Parser)]
#[command(name = "mock_api")]
#[command(about = "In-memory feature-voting API", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    addr: String,

    /// Create a demo user and sample features
    #[arg(long)]
    seed: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = ClientConfig::load();
    let _log_guard = logging::init(&config);

    let server = MockServer::bind(&args.addr).await?;

    if args.seed {
        let demo = server.seed_user("demo", "demo@example.com", "demo-password");
        let other = server.seed_user("sam", "sam@example.com", "sam-password");
        let dark_mode = server.seed_feature(demo, "Dark mode", "A dark theme for the dashboard");
        let export = server.seed_feature(other, "CSV export", "Download the feature list as CSV");
        server.seed_vote(other, &dark_mode, VoteType::Upvote);
        server.seed_vote(demo, &export, VoteType::Downvote);
        info!("seeded demo data (login: demo / demo-password)");
    }

    println!("🚀 Mock API listening on {}", server.base_url());
    println!("   FEATUREVOTE_API_URL={}", server.base_url());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
