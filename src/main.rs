//! featurevote CLI
//!
//! Drives the session and feature coordinators from the command line. The
//! session lives in a sled database (`FEATUREVOTE_STORE_PATH`), so a login
//! carries over to later invocations until `logout`.
//!
//! Usage:
//!   cargo run --bin mock_api                      # local API on :8000
//!   cargo run --bin featurevote -- login -u ana -p secret
//!   cargo run --bin featurevote -- list --sort score

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use featurevote::config::ClientConfig;
use featurevote::logging;
use featurevote::models::{Feature, SortOrder, VoteType};
use featurevote::storage::SledStore;
use featurevote::{ApiClient, Credentials, FeatureCoordinator, SessionCoordinator};

#[derive(Parser)]
#[command(name = "featurevote")]
#[command(about = "CLI for the feature-voting service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// API base URL, e.g. http://127.0.0.1:8000/api (overrides FEATUREVOTE_API_URL)
    #[arg(long)]
    url: Option<String>,

    /// Session database directory (overrides FEATUREVOTE_STORE_PATH)
    #[arg(long)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        /// Defaults to the password
        #[arg(long)]
        password_confirm: Option<String>,
    },
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    Logout,
    Whoami,
    List {
        #[arg(short, long, default_value = "recent")]
        sort: SortOrder,
    },
    Show {
        id: String,
    },
    Create {
        #[arg(short, long)]
        title: String,
        #[arg(short, long)]
        description: String,
    },
    Vote {
        id: String,
        /// upvote | downvote
        vote_type: VoteType,
    },
    Unvote {
        id: String,
    },
    Delete {
        id: String,
    },
    Voters {
        id: String,
    },
}

fn check(error: Option<String>) -> Result<(), Box<dyn Error>> {
    match error {
        Some(message) => Err(message.into()),
        None => Ok(()),
    }
}

fn print_feature(feature: &Feature) {
    let mark = match feature.user_vote {
        Some(VoteType::Upvote) => " [you: up]",
        Some(VoteType::Downvote) => " [you: down]",
        None => "",
    };
    println!(
        "{:>4}  +{} -{}  {}  ({}) by {}{}",
        feature.total_score,
        feature.upvote_count,
        feature.downvote_count,
        feature.title,
        feature.id,
        feature.created_by(),
        mark
    );
}

async fn reload_and_show(features: &FeatureCoordinator, id: &str) -> Result<(), Box<dyn Error>> {
    // The coordinator already scheduled a reload; this one supersedes it so
    // the process can wait for fresh counts before exiting.
    features.load_features().await;
    let state = features.snapshot();
    check(state.error_message.clone())?;
    match state.get(id) {
        Some(feature) => print_feature(feature),
        None => println!("Feature {id} is no longer listed"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = ClientConfig::load();
    if let Some(url) = cli.url {
        config = config.with_api_url(url);
    }
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    let _log_guard = logging::init(&config);

    let api = ApiClient::new(&config.api_url)?;
    let store = SledStore::open(&config.store_path)?;
    let session = SessionCoordinator::new(api.clone(), Arc::new(store));
    let features = FeatureCoordinator::new(api, Arc::new(session.clone()));

    match cli.command {
        Commands::Register {
            username,
            email,
            password,
            password_confirm,
        } => {
            let confirm = password_confirm.unwrap_or_else(|| password.clone());
            session.register(&username, &email, &password, &confirm).await;
            check(session.error_message())?;
            println!("✅ Registered and logged in as {username}");
        }
        Commands::Login { username, password } => {
            session.login(&username, &password).await;
            check(session.error_message())?;
            println!("✅ Logged in as {username}. Session saved to {}", config.store_path.display());
        }
        Commands::Logout => {
            session.logout();
            check(session.error_message())?;
            println!("Logged out (session removed).");
        }
        Commands::Whoami => match session.current_user().filter(|_| session.is_authenticated()) {
            Some(user) => println!(
                "{} <{}> (id {}, joined {})",
                user.username, user.email, user.id, user.date_joined
            ),
            None => println!("Not logged in"),
        },
        Commands::List { sort } => {
            features.set_sort_order(sort);
            features.load_features().await;
            let state = features.snapshot();
            check(state.error_message.clone())?;
            if state.features.is_empty() {
                println!("No features yet");
            }
            for feature in &state.features {
                print_feature(feature);
            }
        }
        Commands::Show { id } => {
            let feature = features.feature(&id).await?;
            print_feature(&feature);
            if let Some(description) = &feature.description {
                println!("\n{description}");
            }
            println!("\ncreated {}", feature.created_at);
        }
        Commands::Create { title, description } => {
            features.create_feature(&title, &description).await;
            check(features.snapshot().error_message)?;
            if let Some(feature) = features.features().first() {
                println!("✅ Created");
                print_feature(feature);
            }
        }
        Commands::Vote { id, vote_type } => {
            features.vote(&id, vote_type).await;
            check(features.snapshot().error_message)?;
            reload_and_show(&features, &id).await?;
        }
        Commands::Unvote { id } => {
            features.remove_vote(&id).await;
            check(features.snapshot().error_message)?;
            reload_and_show(&features, &id).await?;
        }
        Commands::Delete { id } => {
            features.delete_feature(&id).await;
            check(features.snapshot().error_message)?;
            println!("Feature {id} deleted");
        }
        Commands::Voters { id } => {
            let voters = features.voters(&id).await?;
            println!(
                "{}: {} votes (+{} -{})",
                voters.feature_title, voters.total_votes, voters.upvotes, voters.downvotes
            );
            for vote in &voters.votes {
                println!("  {:<8} {} at {}", vote.vote_type, vote.user.username, vote.created_at);
            }
        }
    }

    Ok(())
}
