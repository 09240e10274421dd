use clap::Parser;
use perp_sim::app::SimulatorApp;
use perp_sim::cfg::Config;

#[derive(Parser)]
#[command(name = "perp_sim")]
#[command(about = "REST-compatible perp futures simulator fed by live mark prices")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/sim_cfg.yaml")]
    config: String,
}

#[tokio::main(worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    // 设置日志级别：默认 INFO，关闭 tungstenite 和 reqwest 的 debug 日志
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,tungstenite=info,reqwest=info");
    }
    env_logger::init();

    let args = Args::parse();
    let config = Config::load_config(&args.config).await?;

    let app = SimulatorApp::new(config).await?;
    app.run().await
}
