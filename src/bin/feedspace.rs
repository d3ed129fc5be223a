//! feedspace command line
//!
//! Run with: cargo run --bin feedspace -- <command>

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use feedspace::credentials::{Designation, MemberRole};
use feedspace::feed::MemoryFeedStore;
use feedspace::identity::KeyPair;
use feedspace::models::{ObjectModel, ObjectMutation, Value};
use feedspace::protocol::{discovery_topic, SimSwarm};
use feedspace::{Config, PublicKey, SpaceManager};

#[derive(Parser)]
#[command(name = "feedspace", version, about = "Replicated object spaces over append-only feeds")]
struct Cli {
    /// JSON config file. Defaults apply when missing
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a device key pair, or show the existing one
    Keygen {
        #[arg(long, default_value = "device.key")]
        out: PathBuf,
    },
    /// Print the discovery topic of a space
    Topic {
        /// Space key, hex
        space_key: String,
    },
    /// Run two devices in one process and replicate an object between them
    Demo {
        /// Title written by the first device
        #[arg(long, default_value = "hello from alice")]
        title: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_or_default(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Keygen { out } => keygen(&out),
        Command::Topic { space_key } => {
            let key: PublicKey = space_key.parse().context("invalid space key")?;
            println!("{}", hex::encode(discovery_topic(&key)));
            Ok(())
        }
        Command::Demo { title } => demo(config, title).await,
    }
}

fn keygen(out: &Path) -> Result<()> {
    let existed = out.exists();
    let keys = KeyPair::load_or_generate(out)
        .with_context(|| format!("key file {}", out.display()))?;
    if existed {
        println!("Loaded {}", out.display());
    } else {
        println!("Wrote {}", out.display());
    }
    println!("{}", keys.public_key());
    Ok(())
}

async fn demo(config: Config, title: String) -> Result<()> {
    let swarm = SimSwarm::new();
    let manager = |name: &str| {
        let keys = KeyPair::generate();
        log::info!("{} is {}", name, keys.public_key().truncate());
        SpaceManager::new(
            Arc::new(keys),
            Arc::new(MemoryFeedStore::new()),
            Arc::new(swarm.clone()),
            config.clone(),
        )
    };
    let alice = manager("alice");
    let bob = manager("bob");

    let space = alice.create_space().await?;
    println!("Space {}", space.key());

    let joined = bob
        .accept_space(space.key(), space.genesis_feed_key(), vec![alice.identity_key()])
        .await?;
    space.admit_member(bob.identity_key(), MemberRole::Editor)?;
    space.admit_feed(joined.control_feed_key(), bob.identity_key(), Designation::Control)?;
    space.admit_feed(joined.data_feed_key(), bob.identity_key(), Designation::Data)?;

    let receipt = space
        .data()
        .create::<ObjectModel>(Some(&ObjectMutation::set("title", Value::string(title))))?;
    let object_id = receipt.object_id.clone();
    if !receipt.confirmed().await {
        bail!("write was never confirmed");
    }

    let seen = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let title = joined.data().with_item(&object_id, |item| {
                item.state::<ObjectModel>()
                    .and_then(|model| model.get("title"))
                    .and_then(|v| v.as_str().map(str::to_string))
            });
            if let Some(Some(title)) = title {
                return title;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("object did not replicate")?;
    println!("Bob sees {} with title {:?}", object_id, seen);

    joined
        .data()
        .mutate::<ObjectModel>(&object_id, &ObjectMutation::set("reply", Value::string("hi alice")))?;
    joined.data().flush().await;

    let reply = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let reply = space.data().with_item(&object_id, |item| {
                item.state::<ObjectModel>()
                    .and_then(|model| model.get("reply"))
                    .and_then(|v| v.as_str().map(str::to_string))
            });
            if let Some(Some(reply)) = reply {
                return reply;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("reply did not replicate")?;
    println!("Alice sees reply {:?}", reply);

    bob.close().await;
    alice.close().await;
    Ok(())
}
