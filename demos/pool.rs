//! Load-balancing pool over several TCP servers.
//!
//! Starts four servers with different response delays, spreads requests over
//! them with the pool, then rebalances to a different set.
//!
//! ```text
//! RUST_LOG=rsocket_mux::balancer=debug cargo run --example pool
//! ```

use std::sync::Arc;
use std::time::Duration;

use rsocket_mux::transport::{Listener, Target};
use rsocket_mux::{
    BalancerConfig, Connector, LoadBalancer, MultiplexerConfig, Payload, RSocket, Responder,
    ResponderBuilder, TransportConnector,
};

async fn start_server(name: &'static str, delay: Duration) -> rsocket_mux::Result<String> {
    let listener = Listener::bind(&Target::parse("tcp://127.0.0.1:0")?).await?;
    let uri = listener.local_target()?.to_string();
    let responder = move || -> Arc<dyn Responder> {
        ResponderBuilder::new()
            .request_response(move |_p: Payload| async move {
                tokio::time::sleep(delay).await;
                Ok(Payload::from(name))
            })
            .build()
    };
    tokio::spawn(listener.serve(MultiplexerConfig::default(), responder));
    Ok(uri)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut uris = Vec::new();
    for (name, ms) in [("fast", 1), ("medium", 10), ("slow", 50), ("spare", 5)] {
        uris.push(start_server(name, Duration::from_millis(ms)).await?);
    }

    let connector: Arc<dyn Connector> = Arc::new(TransportConnector::default());
    let pool = LoadBalancer::start(uris[..3].to_vec(), connector, BalancerConfig::default())?;

    let mut counts = std::collections::BTreeMap::new();
    for _ in 0..200 {
        let reply = pool.request_response(Payload::from("ping")).await?;
        *counts.entry(reply.data_utf8()).or_insert(0) += 1;
    }
    println!("served: {counts:?}");
    println!("latency bands (ms): {:?}", pool.latency_bands());

    pool.rebalance(uris[1..].to_vec()).await?;
    let reply = pool.request_response(Payload::from("ping")).await?;
    println!("after rebalance: {} (actives {:?})", reply.data_utf8(), pool.active_uris());

    pool.close().await?;
    Ok(())
}
