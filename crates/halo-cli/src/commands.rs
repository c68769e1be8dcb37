//! Client subcommands. Each makes at most one call and then returns.

use anyhow::Result;
use halo_core::{instance_names, Proxy, SessionBus};
use std::time::Duration;
use tracing::debug;

fn proxy(bus: &SessionBus, instance: &str, timeout: Option<Duration>) -> Result<Proxy> {
    Ok(Proxy::connect(bus, instance)?.with_timeout(timeout))
}

/// Print every running instance, one per line.
pub fn list(bus: &SessionBus) -> Result<()> {
    for name in instance_names(bus)? {
        println!("{}", name);
    }
    Ok(())
}

pub async fn quit(bus: &SessionBus, instance: &str, timeout: Option<Duration>) -> Result<()> {
    proxy(bus, instance, timeout)?.quit().await?;
    debug!("{} quit", instance);
    Ok(())
}

/// Send `text` as a Request and print the reply when there is one.
pub async fn message(
    bus: &SessionBus,
    instance: &str,
    text: Vec<String>,
    timeout: Option<Duration>,
) -> Result<()> {
    let reply = proxy(bus, instance, timeout)?.request(text).await?;
    if !reply.is_empty() {
        println!("{}", reply);
    }
    Ok(())
}

pub async fn inspector(bus: &SessionBus, instance: &str, timeout: Option<Duration>) -> Result<()> {
    proxy(bus, instance, timeout)?.inspector().await?;
    Ok(())
}

pub async fn toggle(
    bus: &SessionBus,
    instance: &str,
    window: &str,
    timeout: Option<Duration>,
) -> Result<()> {
    proxy(bus, instance, timeout)?.toggle_window(window).await?;
    Ok(())
}
