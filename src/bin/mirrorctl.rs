use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use mirror_verify::{
    compare::StructuralComparator,
    config::{Auth, RegistryConfig, Transport},
    inventory::SourceInventory,
    registry::Registry,
    verify::TargetedVerifier,
};

/// mirrorctl
#[derive(Debug, Parser)]
#[clap(name = "mirrorctl", version)]
pub struct App {
    /// source registry, `[scheme://]host[:port][/path]`
    #[clap(long, env = "MIRROR_SOURCE")]
    source: String,
    #[clap(long, env = "MIRROR_SOURCE_USER")]
    source_user: Option<String>,
    #[clap(long, env = "MIRROR_SOURCE_PASSWORD", hide_env_values = true)]
    source_password: Option<String>,
    /// talk plain HTTP to the source
    #[clap(long, env = "MIRROR_SOURCE_INSECURE")]
    source_insecure: bool,
    #[clap(long, env = "MIRROR_SOURCE_TLS_SKIP_VERIFY")]
    source_tls_skip_verify: bool,

    /// target (mirror) registry, `[scheme://]host[:port][/path]`
    #[clap(long, env = "MIRROR_TARGET")]
    target: Option<String>,
    #[clap(long, env = "MIRROR_TARGET_USER")]
    target_user: Option<String>,
    #[clap(long, env = "MIRROR_TARGET_PASSWORD", hide_env_values = true)]
    target_password: Option<String>,
    /// talk plain HTTP to the target
    #[clap(long, env = "MIRROR_TARGET_INSECURE")]
    target_insecure: bool,
    #[clap(long, env = "MIRROR_TARGET_TLS_SKIP_VERIFY")]
    target_tls_skip_verify: bool,

    /// write the detailed report to this file
    #[clap(long, global = true)]
    report: Option<PathBuf>,
    /// print and write JSON instead of text
    #[clap(long, global = true)]
    json: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum VerifyCommand {
    /// Release channels, installers, platform images and attestations
    Platform {
        /// verify this release only, skipping channel discovery
        #[clap(long)]
        tag: Option<String>,
    },
    /// Module release channels and images
    Modules {
        /// modules to verify; all modules of the source if none given
        names: Vec<String>,
    },
    /// Security databases
    Security,
    /// Platform, modules and security databases
    Full {
        #[clap(long)]
        tag: Option<String>,
        #[clap(long = "module")]
        modules: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walks both registries and diffs every repository and tag
    Compare,
    /// Checks the artifacts the source says should exist against the target
    Verify {
        #[clap(subcommand)]
        cmd: VerifyCommand,
    },
    /// Prints the expected artifact set read from the source as JSON
    Inventory {
        #[clap(long)]
        tag: Option<String>,
    },
}

impl App {
    fn source(&self) -> Result<Registry> {
        let config = RegistryConfig::new(&self.source)
            .with_auth(Auth::from_credentials(
                self.source_user.clone(),
                self.source_password.clone(),
            ))
            .with_transport(Transport {
                insecure: self.source_insecure,
                skip_tls_verify: self.source_tls_skip_verify,
            });
        Registry::connect(&config).with_context(|| format!("Invalid source {}", self.source))
    }

    fn target(&self) -> Result<Registry> {
        let url = self
            .target
            .as_deref()
            .context("--target (or MIRROR_TARGET) is required for this command")?;
        let config = RegistryConfig::new(url)
            .with_auth(Auth::from_credentials(
                self.target_user.clone(),
                self.target_password.clone(),
            ))
            .with_transport(Transport {
                insecure: self.target_insecure,
                skip_tls_verify: self.target_tls_skip_verify,
            });
        Registry::connect(&config).with_context(|| format!("Invalid target {url}"))
    }
}

/// What every command hands back for printing.
struct Outcome {
    success: bool,
    summary: String,
    detailed: String,
    json: String,
}

impl Outcome {
    fn new(success: bool, summary: String, detailed: String, value: &impl Serialize) -> Result<Self> {
        Ok(Outcome {
            success,
            summary,
            detailed,
            json: serde_json::to_string_pretty(value)?,
        })
    }
}

fn progress_bar() -> Result<ProgressBar> {
    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::with_template("[eta {eta}] {bar:40.cyan/blue} {pos}/{len} tags compared")?
            .progress_chars("##-"),
    );
    Ok(progress)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    let source = args.source()?;

    let outcome = match &args.cmd {
        Command::Inventory { tag } => {
            let expected = SourceInventory::new(source)
                .collect(tag.as_deref())
                .await
                .context("Reading source inventory")?;
            println!("{}", serde_json::to_string_pretty(&expected)?);
            return Ok(());
        }
        Command::Compare => {
            let report = StructuralComparator::new(source, args.target()?)
                .with_progress(progress_bar()?)
                .compare()
                .await
                .context("Comparing registries")?;
            Outcome::new(report.is_identical(), report.summary(), report.detailed(), &report)?
        }
        Command::Verify { cmd } => {
            let verifier = TargetedVerifier::new(source, args.target()?);
            let result = match cmd {
                VerifyCommand::Platform { tag } => verifier.verify_platform(tag.as_deref()).await,
                VerifyCommand::Modules { names } => verifier.verify_modules(names).await,
                VerifyCommand::Security => verifier.verify_security().await,
                VerifyCommand::Full { tag, modules } => {
                    verifier.verify_full(tag.as_deref(), modules).await
                }
            }
            .context("Verifying mirror")?;
            Outcome::new(result.is_success(), result.summary(), result.detailed(), &result)?
        }
    };

    if args.json {
        println!("{}", outcome.json);
    } else {
        print!("{}", outcome.summary);
    }

    if let Some(path) = &args.report {
        let contents = if args.json {
            &outcome.json
        } else {
            &outcome.detailed
        };
        std::fs::write(path, contents)
            .with_context(|| format!("Writing report to {}", path.display()))?;
    }

    if !outcome.success {
        bail!("mirror does not match the source");
    }
    Ok(())
}
