//! Webhook intake server command: `dispatch serve`.

use anyhow::Result;
use dispatch::config::DispatchConfig;

pub async fn cmd_serve(
    mut config: DispatchConfig,
    bind: Option<String>,
    with_workers: bool,
) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    dispatch::server::start_server(config, with_workers).await
}
