pub mod app;
pub mod config;
pub mod key;
pub mod logging;
pub mod net;
pub mod tunnel;

pub use app::Mode;

pub async fn run(mode: Mode) -> anyhow::Result<()> {
    app::run(mode).await
}
