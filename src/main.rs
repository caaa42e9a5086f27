use clap::{Parser, Subcommand};
use vmcp_gateway::{
    app_context::AppContext,
    config::GatewayConfig,
    observability::logging::{init_logging, parse_level, LoggingConfig},
    server,
    vmcp::types::VmcpDefinition,
};

#[derive(Parser, Debug)]
#[command(name = "vmcp-gateway")]
#[command(about = "Virtual MCP aggregation gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway.
    Run {
        #[arg(long)]
        port: Option<u16>,

        #[arg(long, env = "LOG_LEVEL", default_value = "info")]
        log_level: String,

        /// Optional YAML config file with servers and vMCP definitions.
        #[arg(long)]
        config: Option<String>,
    },
    /// Start with a deterministic test fixture (one demo vMCP, no
    /// upstreams) for integration harnesses.
    ServeTest {
        #[arg(long)]
        port: Option<u16>,

        #[arg(long, env = "LOG_LEVEL", default_value = "debug")]
        log_level: String,
    },
}

fn demo_vmcp() -> VmcpDefinition {
    let mut vmcp = VmcpDefinition::named("demo");
    vmcp.description = Some("serve-test fixture".to_string());
    vmcp.system_prompt = Some("You are a test fixture.".to_string());
    vmcp.custom_prompts.push(vmcp_gateway::vmcp::types::CustomPrompt {
        name: "echo".to_string(),
        description: Some("echoes its argument".to_string()),
        arguments: None,
        template: "@param.text".to_string(),
    });
    vmcp
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, log_level) = match &cli.command {
        Command::Run {
            port,
            log_level,
            config,
        } => {
            let mut gateway_config = match config {
                Some(path) => GatewayConfig::from_file(path)?,
                None => GatewayConfig::default(),
            };
            gateway_config = gateway_config.apply_env()?;
            if let Some(port) = port {
                gateway_config.port = *port;
            }
            (gateway_config, log_level.clone())
        }
        Command::ServeTest { port, log_level } => {
            let mut gateway_config = GatewayConfig::default().apply_env()?;
            if let Some(port) = port {
                gateway_config.port = *port;
            }
            gateway_config.vmcps.push(demo_vmcp());
            (gateway_config, log_level.clone())
        }
    };
    config.validate()?;

    init_logging(&LoggingConfig {
        level: parse_level(&log_level).unwrap_or(tracing::Level::INFO),
        ..Default::default()
    });

    let app = AppContext::new(config).await?;
    server::run(app).await?;
    Ok(())
}
