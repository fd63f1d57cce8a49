#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use hermes_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.lanes.is_empty()
        && config.vertical_service.is_none()
        && config.configuration_service.is_none()
    {
        log::warn!(
            "No lanes or services are configured, it's just a program without any functionality :-)"
        );

        return Ok(());
    }

    hermes_server::startup(config).await
}
