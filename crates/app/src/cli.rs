use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gesture_core::{ThumbsUpRule, parse_hands};

use crate::thumb::{self, ThumbCliArgs, ThumbConfig};

#[derive(Debug, Parser)]
#[command(name = "thumbhold", about = "Detects a held thumbs-up and publishes it over MQTT")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the capture, detection and streaming pipeline.
    Run(ThumbCliArgs),
    /// Classify hands from a landmark JSON file and print one verdict per hand.
    Classify {
        /// File holding `[[[x, y], ...], ...]` normalized landmarks.
        landmarks: PathBuf,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
}

pub fn handle_commands(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = ThumbConfig::try_from(args)?;
            thumb::run(config)
        }
        Command::Classify {
            landmarks,
            width,
            height,
        } => classify_file(&landmarks, width, height),
    }
}

fn classify_file(path: &Path, width: u32, height: u32) -> Result<()> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read landmarks from {}", path.display()))?;
    let hands = parse_hands(&json)
        .with_context(|| format!("Malformed landmarks in {}", path.display()))?;
    let rule = ThumbsUpRule::default();
    for (index, hand) in hands.iter().enumerate() {
        match rule.evaluate(hand, height, width) {
            Ok(verdict) => println!("hand {index}: {}", if verdict { "thumbs-up" } else { "no" }),
            Err(err) => println!("hand {index}: invalid ({err})"),
        }
    }
    if hands.is_empty() {
        println!("no hands");
    }
    Ok(())
}
