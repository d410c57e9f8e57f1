use crate::config::{BrokerArgs, ServeArgs, Settings};
use crate::relay::AmqpBroker;
use crate::server;
use crate::telemetry::{self, LogFormat};
use crate::trigger::{CliRuntime, WorkloadTrigger};
use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::sync::Arc;

/// mqrelay CLI interface
#[derive(Parser, Debug)]
#[command(name = "mqrelay", about = "Queue-to-HTTP relay with a container workload trigger")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server and the relay worker
    Serve(ServeArgs),
    /// Publish one message to the relay's queue
    Publish {
        #[command(flatten)]
        broker: BrokerArgs,
        /// Message body, sent as-is
        payload: String,
    },
    /// Launch one container and print the runtime's acknowledgment
    Trigger {
        /// Image reference
        image: String,
        /// Environment variables as KEY=VALUE, repeatable
        #[arg(short, long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        /// Container CLI to invoke
        #[arg(long, env = "MQRELAY_CONTAINER_RUNTIME", default_value = "docker")]
        runtime: String,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Commands::Serve(args) => server::run_server(Settings::try_from(args)?).await,
            Commands::Publish { broker, payload } => {
                telemetry::init(LogFormat::Text);
                let declaration = broker.declaration();
                AmqpBroker::new(broker.amqp_url)
                    .publish(&declaration, payload.as_bytes())
                    .await
                    .context("Error publishing message")?;
                println!("Published {} byte(s) to '{}'", payload.len(), declaration.name);
                Ok(())
            }
            Commands::Trigger { image, env, runtime } => {
                telemetry::init(LogFormat::Text);
                let trigger = WorkloadTrigger::new(Arc::new(CliRuntime::new(runtime)));
                let env: BTreeMap<String, String> = env.into_iter().collect();
                let receipt = trigger
                    .trigger(&image, env)
                    .await
                    .context("Error launching workload")?;
                println!(
                    "Launched '{}' (container {})",
                    receipt.image,
                    receipt.container_id.as_deref().unwrap_or("unknown")
                );
                Ok(())
            }
        }
    }
}

fn parse_env_pair(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{raw}'"))?;
    Ok((name.to_string(), value.to_string()))
}
