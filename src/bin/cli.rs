use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;

use crate::interpreter::{interpret, ModerationPolicy, DEFAULT_BLOCKED_LABELS, DEFAULT_THRESHOLD};

#[allow(dead_code)]
#[path = "../interpreter.rs"]
mod interpreter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a random API key to use as MOD_API_KEY
    GenerateKey {
        /// Number of random bytes in the key
        #[clap(short, long, default_value_t = 32)]
        length: usize,
    },
    /// Interpret a saved classifier response without running the server
    Interpret {
        /// File containing the raw classifier response
        file: PathBuf,

        /// Minimum score at which a blocked label blocks the image
        #[clap(short, long, env = "MODERATION_THRESHOLD", default_value_t = DEFAULT_THRESHOLD)]
        threshold: f64,

        /// Label substrings considered disallowed content
        #[clap(short, long, env = "BLOCKED_LABELS", value_delimiter = ',')]
        blocked_labels: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.cmd {
        Commands::GenerateKey { length } => {
            if length < 16 {
                bail!("Refusing to generate a key shorter than 16 bytes");
            }
            let mut key = vec![0u8; length];
            OsRng.fill_bytes(&mut key);
            println!("{}", Base64UrlUnpadded::encode_string(&key));
        }
        Commands::Interpret {
            file,
            threshold,
            blocked_labels,
        } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let raw = serde_json::from_str(&content)
                .unwrap_or_else(|_| Value::String(content.trim().to_string()));
            let policy = if blocked_labels.is_empty() {
                ModerationPolicy::new(threshold, DEFAULT_BLOCKED_LABELS)
            } else {
                ModerationPolicy::new(threshold, &blocked_labels)
            };
            let decision = interpret(raw, &policy);
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
    }
    Ok(())
}
