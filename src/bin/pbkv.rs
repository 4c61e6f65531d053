use clap::{Parser, Subcommand};
use pbkv::Clerk;

/// Actions that can be performed against the replicated store.
#[derive(Debug, Subcommand)]
enum Action {
    /// Get a value from the store with the provided key.
    Get { key: String },

    /// Enter a key-value pair into the store.
    Put { key: String, value: String },

    /// Hash-chaining put; prints the previous value.
    PutHash { key: String, value: String },
}

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    /// Address of the view service.
    #[clap(long, default_value = "127.0.0.1:5000")]
    viewservice: String,

    #[command(subcommand)]
    action: Action,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = App::parse();
    let mut clerk = Clerk::new("pbkv-cli", &app.viewservice)?;

    match app.action {
        Action::Get { key } => println!("{}", clerk.get(&key).await),
        Action::Put { key, value } => clerk.put(&key, &value).await,
        Action::PutHash { key, value } => println!("{}", clerk.put_hash(&key, &value).await),
    }
    Ok(())
}
