//! DON Gateway - local harness.
//!
//! Runs one signed request through a `FunctionsHandler` backed by an
//! in-process DON whose nodes echo an acknowledgement, then prints the
//! aggregated result as JSON.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use k256::ecdsa::SigningKey;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use don_gateway::config::GatewayConfig;
use don_gateway::logging::init_tracing;
use don_gateway::{
    log_init_step, metrics, AllowlistSource, FunctionsHandler, Handler, LocalDon, Message, MessageBody,
    NodeConnection, StaticAllowlistSource, UserCallbackPayload,
};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "don-gateway")]
#[command(about = "Route one signed request through a simulated DON")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long, env = "DON_GATEWAY_CONFIG")]
    config: Option<String>,

    /// Log filter; overrides logging.level from the config.
    #[arg(long)]
    log_level: Option<String>,

    /// Request method.
    #[arg(long, default_value = "secrets_list")]
    method: String,

    /// Message id; a random UUID when omitted.
    #[arg(long)]
    message_id: Option<String>,

    /// JSON payload.
    #[arg(long, default_value = "{}")]
    payload_json: String,

    /// Hex secp256k1 private key of the sender; random when omitted.
    #[arg(long, env = "DON_GATEWAY_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Number of DON members left unreachable.
    #[arg(long, default_value_t = 0)]
    faulty_nodes: usize,

    /// Print Prometheus metrics after the request completes.
    #[arg(long)]
    print_metrics: bool,
}

/// Simulated node that acknowledges every request through the gateway's
/// node-message path.
#[derive(Debug)]
struct EchoNode {
    address: String,
    responses: mpsc::UnboundedSender<(String, Message)>,
}

#[async_trait]
impl NodeConnection for EchoNode {
    async fn send(&self, msg: &Message) -> anyhow::Result<()> {
        let response = Message {
            body: MessageBody {
                payload: serde_json::json!({
                    "success": true,
                    "method": msg.body.method,
                }),
                ..msg.body.clone()
            },
            signature: String::new(),
        };
        self.responses
            .send((self.address.clone(), response))
            .map_err(|e| anyhow::anyhow!("gateway stopped accepting responses: {e}"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    init_tracing(&config.logging)?;
    metrics::init_metrics()?;

    tracing::info!("Starting DON gateway harness v{}", don_gateway::VERSION);
    log_init_step!(
        1,
        4,
        "Configuration",
        format!("DON '{}', {} members, F={}", config.don.don_id, config.don.members.len(), config.don.f)
    );

    let signing_key = match &args.private_key {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key.trim_start_matches("0x")).context("private key is not hex")?;
            SigningKey::from_slice(&bytes).context("invalid secp256k1 private key")?
        }
        None => SigningKey::from_slice(&rand::random::<[u8; 32]>()).context("generated an invalid key")?,
    };
    let sender = don_gateway::Address::from_verifying_key(signing_key.verifying_key());

    let (response_tx, mut response_rx) = mpsc::unbounded_channel();
    let don = Arc::new(LocalDon::new());
    for member in config.don.members.iter().skip(args.faulty_nodes) {
        don.register(
            &member.address,
            Arc::new(EchoNode {
                address: member.address.clone(),
                responses: response_tx.clone(),
            }),
        );
    }
    drop(response_tx);
    log_init_step!(
        2,
        4,
        "Simulated DON",
        format!(
            "{} reachable, {} unreachable",
            config.don.members.len().saturating_sub(args.faulty_nodes),
            args.faulty_nodes.min(config.don.members.len())
        )
    );

    // only consulted when the handler config enables the allow-list
    let allowlist_source: Arc<dyn AllowlistSource> =
        Arc::new(StaticAllowlistSource::new(vec![sender]));
    let handler = Arc::new(FunctionsHandler::from_config(
        &config.don.handler_config,
        config.don.clone(),
        don,
        Some(allowlist_source),
    )?);
    handler.start()?;
    log_init_step!(3, 4, "Handler", "started");

    let forwarder = {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            while let Some((node, msg)) = response_rx.recv().await {
                if let Err(e) = handler.handle_node_message(msg, &node).await {
                    tracing::error!(node = %node, error = %e, "Node message rejected");
                }
            }
        })
    };

    let payload: serde_json::Value =
        serde_json::from_str(&args.payload_json).context("--payload-json is not valid JSON")?;
    let message_id = args
        .message_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut msg = Message::new(message_id, &args.method, &config.don.don_id, payload);
    msg.sign(&signing_key)?;
    log_init_step!(4, 4, "Request", format!("{} from {sender}", msg.body.message_id));

    let (callback_tx, callback_rx) = oneshot::channel();
    let result = match handler
        .handle_user_message(&CancellationToken::new(), msg, callback_tx)
        .await
    {
        Ok(()) => callback_rx
            .await
            .context("handler dropped the request without a result")?,
        Err(e) => UserCallbackPayload::failure(e.error_code(), e.to_string()),
    };

    println!("{}", serde_json::to_string_pretty(&result)?);

    handler.close().await?;
    forwarder.abort();

    if args.print_metrics {
        println!("{}", metrics::get_metrics());
    }

    tracing::info!(success = result.is_success(), "Harness finished");
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
