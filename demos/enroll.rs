//! Enroll a simulated device against a throwaway PKI
//!
//! ```text
//! RUST_LOG=debug cargo run --example enroll
//! ```

#[path = "../tests/common/mod.rs"]
mod common;

use device_enrollment::InboundRequest;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,device_enrollment=debug".into()),
        )
        .init();

    let fixture = common::Fixture::new();
    let service = fixture.service();

    let request = fixture.request(common::TOKEN);
    println!("Request:\n{}\n", serde_json::to_string_pretty(&request)?);

    let response = service
        .handle(InboundRequest::json(request.to_string(), "demo-1", fixture.now))
        .await;

    println!("Response ({}):", response.status);
    println!("{}", serde_json::to_string_pretty(&response.body)?);

    let malformed = service
        .handle(InboundRequest::json("{\"token\":\"short\"}", "demo-2", fixture.now))
        .await;
    println!("\nMalformed request ({}): {}", malformed.status, malformed.to_json()?);

    Ok(())
}
