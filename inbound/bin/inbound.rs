#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = inbound::config::find_config_file()?;
    let inbound = inbound::config::load(&config_path)?;

    inbound.run().await
}
