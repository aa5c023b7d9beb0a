use anyhow::Result;
use logfront::app;

#[tokio::main]
async fn main() -> Result<()> {
	app::start().await
}
