//! Echo server and client over TCP.
//!
//! This example demonstrates:
//! - Serving a typed request-response handler with `serve`
//! - Connecting a client multiplexer with `TransportConnector`
//! - Fragmenting a large payload
//!
//! ```text
//! cargo run --example echo
//! RUST_LOG=rsocket_mux=debug cargo run --example echo
//! ```

use std::sync::Arc;

use rsocket_mux::transport::{Listener, Target};
use rsocket_mux::{
    Connector, MultiplexerConfig, Payload, Responder, ResponderBuilder, TransportConnector,
};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug)]
struct EchoInput {
    message: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct EchoOutput {
    echo: String,
}

fn responder() -> Arc<dyn Responder> {
    ResponderBuilder::new()
        .request_response_msgpack(|input: EchoInput| async move {
            Ok(EchoOutput {
                echo: input.message,
            })
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listener = Listener::bind(&Target::parse("tcp://127.0.0.1:0")?).await?;
    let uri = listener.local_target()?.to_string();
    tokio::spawn(listener.serve(MultiplexerConfig::default(), responder));

    let config = MultiplexerConfig {
        fragment_size: 1024,
        ..MultiplexerConfig::default()
    };
    let client = TransportConnector::new(config).connect(&uri).await?;

    #[derive(Serialize)]
    struct Request<'a> {
        message: &'a str,
    }

    let reply = client
        .request_response(Payload::from_msgpack(&Request { message: "hello" })?)
        .await?;
    println!("{:?}", reply.decode_msgpack::<EchoOutput>()?);

    let big = "x".repeat(64 * 1024);
    let reply = client
        .request_response(Payload::from_msgpack(&Request { message: &big })?)
        .await?;
    println!(
        "echoed {} bytes",
        reply.decode_msgpack::<EchoOutput>()?.echo.len()
    );

    client.close();
    Ok(())
}
