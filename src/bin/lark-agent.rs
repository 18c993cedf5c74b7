use agent::{Config, UserAgent};
use anyhow::Result;

const DEFAULT_CONFIG: &str = "/etc/lark/lark.conf";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    lark_log::init();
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = Config::load(&path)?;
    let mut agent = UserAgent::new(config).await?;
    agent.run().await?;
    Ok(())
}
