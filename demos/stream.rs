//! Request-stream and request-channel between two in-process multiplexers.
//!
//! This example demonstrates:
//! - A streaming responder producing items as demand arrives
//! - Explicit demand with `PayloadStream::request`
//! - A channel that transforms every inbound item
//!
//! ```text
//! cargo run --example stream
//! ```

use futures::StreamExt;
use rsocket_mux::{Multiplexer, Payload, ResponderBuilder};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
struct Chunk {
    index: usize,
    data: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let responder = ResponderBuilder::new()
        .request_stream(|request: Payload| {
            let count: usize = request.data_utf8().parse().unwrap_or(0);
            futures::stream::iter(0..count).map(|index| {
                Payload::from_msgpack(&Chunk {
                    index,
                    data: format!("chunk {index}"),
                })
            })
        })
        .request_channel(|inbound| {
            inbound.map(|item| {
                item.map(|p| {
                    let reversed: String = p.data_utf8().chars().rev().collect();
                    Payload::from(reversed)
                })
            })
        })
        .build();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let _server = Multiplexer::builder().responder(responder).server(b)?;
    let client = Multiplexer::builder().request_n(4).client(a)?;

    // window of 4, refilled as items are consumed
    let mut chunks = client.request_stream(Payload::from("10"));
    while let Some(item) = chunks.next().await {
        println!("{:?}", item?.decode_msgpack::<Chunk>()?);
    }

    // exactly two items, then stop
    let mut limited = client.request_stream(Payload::from("100"));
    limited.request(2);
    for _ in 0..2 {
        if let Some(item) = limited.next().await {
            println!("limited: {:?}", item?.decode_msgpack::<Chunk>()?);
        }
    }
    limited.cancel();

    let words = ["stream", "channel", "multiplexer"].map(|w| Ok(Payload::from(w)));
    let mut replies = client.request_channel(futures::stream::iter(words));
    while let Some(reply) = replies.next().await {
        println!("channel: {}", reply?.data_utf8());
    }

    client.close();
    Ok(())
}
