//! jproxy-client - demo client for the math-server behind jproxy.
//!
//! ```text
//! jproxy-client --server :8080
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{info, warn};

use jproxy::ipc::{ClientError, Framing, ListenAddr, RpcClient};
use jproxy::logging;

#[derive(Parser, Debug)]
#[command(name = "jproxy-client", version, about = "Demo client for math-server")]
struct Args {
    /// Server address (host:port or socket path)
    #[arg(long)]
    server: String,

    /// Channel framing
    #[arg(long, default_value = "raw")]
    framing: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init("jproxy_client=info");

    let addr: ListenAddr = args.server.parse()?;
    let framing: Framing = args.framing.parse()?;
    let mut client = RpcClient::connect_with_retry(&addr, framing.clone(), 5)
        .await
        .with_context(|| format!("Dial {}", addr))?;
    info!("Connected to {}", addr);

    info!("-- Sending some individual requests...");
    let sum = client.call("Math.Add", json!([1, 3, 5, 7])).await.context("Math.Add")?;
    info!("Math.Add result={}", sum);
    let quot = client
        .call("Math.Div", json!({"X": 82, "Y": 19}))
        .await
        .context("Math.Div")?;
    info!("Math.Div result={:.3}", quot.as_f64().unwrap_or_default());
    let status = client.call("Math.Status", Value::Null).await.context("Math.Status")?;
    info!("Math.Status result={}", status);

    // An error condition (division by zero)
    match client.call("Math.Div", json!({"X": 15, "Y": 0})).await {
        Err(ClientError::ServerError { code, message, .. }) => {
            info!("Math.Div err={} (code {})", message, code)
        }
        Err(e) => return Err(e).context("Math.Div"),
        Ok(quot) => bail!("Math.Div succeeded unexpectedly: result={}", quot),
    }

    info!("-- Sending a batch of requests...");
    let pairs: Vec<(i64, i64)> = (1..=5)
        .flat_map(|x| (1..=5).map(move |y| (x * 17 % 100, y * 29 % 100)))
        .collect();
    let calls = pairs
        .iter()
        .map(|(x, y)| ("Math.Mul".to_string(), json!({"X": x, "Y": y})))
        .collect();
    let results = client.batch(calls).await.context("Batch")?;
    for ((x, y), result) in pairs.iter().zip(results) {
        match result {
            Ok(product) => info!("Req {}*{}: result={}", x, y, product),
            Err(e) => warn!("Req {}*{} failed: {}", x, y, e),
        }
    }

    info!("-- Sending individual concurrent requests...");
    let mut tasks = JoinSet::new();
    for (x, y) in pairs.iter().copied() {
        let addr = addr.clone();
        let framing = framing.clone();
        tasks.spawn(async move {
            let mut client = RpcClient::connect(&addr, framing).await?;
            let diff = client.call("Math.Sub", json!({"X": x, "Y": y})).await?;
            Ok::<_, ClientError>((x, y, diff))
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined.context("Task failed")? {
            Ok((x, y, diff)) => info!("Req ({}-{}): result={}", x, y, diff),
            Err(e) => warn!("Req failed: {}", e),
        }
    }

    info!("-- Sending a notification...");
    client
        .notify("Post.Alert", json!({"Msg": "There is a fire!"}))
        .await
        .context("Notify")?;
    client.close().await?;
    Ok(())
}
