use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

pub mod bucket;
pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod external;
pub mod package;
pub mod provider;
pub mod stack;
pub mod status;
pub mod template;

#[derive(Parser)]
#[command(
    name = "cfn-stack-deployer",
    about = "Deploy SAM/CloudFormation stacks and their artifacts",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a SAM/CloudFormation stack
    Deploy(CommonArgs),
    /// Remove a deployed stack
    Remove(CommonArgs),
    /// Display service information
    Info(CommonArgs),
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Stage to target (e.g. dev, prod)
    #[arg(short, long)]
    stage: Option<String>,

    /// Region to deploy to (e.g. us-east-1)
    #[arg(short, long)]
    region: Option<String>,

    /// Stack name
    #[arg(long)]
    stack: Option<String>,

    /// Deployment bucket to upload artifacts to
    #[arg(short, long)]
    bucket: Option<String>,

    /// Template file
    #[arg(short, long)]
    template: Option<String>,

    /// Space-separated KEY=VALUE stack parameters
    #[arg(long)]
    parameter_overrides: Option<String>,

    /// Split monitoring resources into an external stack
    #[arg(long)]
    external_stack: bool,

    /// Service directory
    #[arg(long, default_value = ".")]
    service_path: PathBuf,
}

impl CommonArgs {
    fn to_options(&self) -> config::CliOptions {
        config::CliOptions {
            stage: self.stage.clone(),
            region: self.region.clone(),
            stack: self.stack.clone(),
            bucket: self.bucket.clone(),
            template: self.template.clone(),
            parameter_overrides: self.parameter_overrides.clone(),
            external_stack: self.external_stack,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            match error.code() {
                Some(code) => eprintln!("Error [{}]: {}", code, error),
                None => eprintln!("Error: {}", error),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), error::Error> {
    let args = match &cli.command {
        Command::Deploy(args) | Command::Remove(args) | Command::Info(args) => args.clone(),
    };

    let samconfig = config::SamConfig::load(&args.service_path)?;
    let resolved = config::resolve(&args.to_options(), &samconfig, None)?;

    let sdk_config = provider::load_sdk_config(Some(&resolved.region)).await;
    let cloudformation = provider::AwsCloudFormation::new(&sdk_config);

    match cli.command {
        Command::Deploy(_) => {
            let object_store = provider::AwsObjectStore::new(&sdk_config);
            commands::deploy(
                &resolved,
                &args.service_path,
                None,
                &cloudformation,
                &object_store,
                stack::POLL_INTERVAL,
            )
            .await?;
        }
        Command::Remove(_) => {
            commands::remove(&resolved, None, &cloudformation, stack::POLL_INTERVAL).await?;
        }
        Command::Info(_) => {
            commands::info(&resolved, &cloudformation).await?;
        }
    }

    Ok(())
}
