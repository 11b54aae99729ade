use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing_subscriber::EnvFilter;
use transport_services::{Config, Context, FlowOutcome, PropertyFlag, PropertyMask};

/// Opens a flow to the host and port given on the command line and prints
/// every event the context produces until the flow connects, fails, or
/// thirty seconds pass.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().parse("info,transport_services=debug")?)
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().context("usage: open-flow <host> <port>")?;
    let port: u16 = args
        .next()
        .context("usage: open-flow <host> <port>")?
        .parse()
        .context("port must be a u16")?;

    let mut ctx = Context::new(Config::default()).context("failed to build the reactor")?;

    let mut properties = PropertyMask::EMPTY;
    properties.set(PropertyFlag::TcpRequired);

    let flow = ctx.open(&host, port, properties)?;
    tracing::info!(?flow, %host, port, "opened flow");

    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while std::time::Instant::now() < deadline {
        for event in ctx.run_once(Some(Duration::from_millis(200)))? {
            tracing::info!(?event, "context event");

            if let transport_services::ContextEvent::Flow {
                event: FlowOutcome::Connected,
                ..
            } = event
            {
                tracing::info!("connected");
                return Ok(());
            }
        }
    }

    anyhow::bail!("timed out waiting for the flow to connect")
}
