//! nostrpress: DM 送信キューと NWC を操作するコマンドラインツール

mod config;
mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nostrpress_core::lnurl::{self, HttpClient, LightningAddress};
use nostrpress_core::nwc::NwcClient;
use nostrpress_core::relay::ws::WsTransportFactory;
use nostrpress_core::relay::TransportFactory;
use nostrpress_core::storage::file::FileStore;
use nostrpress_core::storage::KeyValueStore;
use nostrpress_core::{Engine, EngineConfig, Keys};
use tracing_subscriber::EnvFilter;

use crate::http::ReqwestHttpClient;

#[derive(Parser)]
#[command(name = "nostrpress", version, about = "Nostr DM delivery queue and wallet connect worker")]
struct Cli {
    /// TOML 設定ファイル
    #[arg(long)]
    config: Option<PathBuf>,
    /// キューの保存先
    #[arg(long, default_value = "nostrpress-state.json")]
    state: PathBuf,
    /// 設定の relays を上書き（複数指定可）
    #[arg(long = "relay")]
    relays: Vec<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 定期的にキューを処理し続ける（Ctrl-C で終了）
    Run,
    /// キューを1回だけ処理
    Process,
    /// DM をキューに追加
    QueueDm {
        /// 宛先 (npub / hex)
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        message: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// 送信済みログを表示
    Sent,
    /// NWC リクエストを送る (get_info, get_balance, make_invoice ...)
    Nwc {
        method: String,
        /// JSON の params
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Lightning アドレスから請求書を取得（省略時は設定の lightning_address）
    Invoice {
        address: Option<String>,
        /// msats
        #[arg(long)]
        amount: u64,
    },
    /// サイト鍵の表示（未設定なら新しい鍵を生成して表示）
    Keys,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();
    let cli = Cli::parse();
    run(cli).await
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = config::load(cli.config.as_deref())?;
    if !cli.relays.is_empty() {
        config.relays = cli.relays.clone();
    }
    config.validate()?;

    let factory: Arc<dyn TransportFactory> = Arc::new(WsTransportFactory::new(config.connect_timeout()));

    match cli.command {
        Commands::Keys => print_keys(&config)?,
        Commands::Nwc { method, params } => {
            let connection = config.nwc_connection()?.context("nwc_uri is not configured")?;
            let params = serde_json::from_str(&params).context("--params must be JSON")?;
            let client = NwcClient::new(connection, factory)?.with_timeout(config.nwc_timeout());
            let result = client.request(&method, params).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Invoice { address, amount } => {
            let http = ReqwestHttpClient::new(config.connect_timeout())?;
            let address = LightningAddress::parse(&invoice_address(address, &config)?)?;
            let pay = lnurl::resolve(&http, &address).await?;
            let invoice = lnurl::request_invoice(&http, &pay, amount).await?;
            println!("{}", invoice.pr);
            if let Some(verify) = invoice.verify {
                println!("verify: {}", verify);
            }
        }
        command => {
            let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&cli.state));
            let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(config.connect_timeout())?);
            let engine = Engine::new(config, store, factory, Some(http))?;
            run_engine(&engine, command).await?;
        }
    }
    Ok(())
}

async fn run_engine(engine: &Engine, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run => {
            let handle = engine.scheduler().spawn();
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
            handle.shutdown().await;
        }
        Commands::Process => {
            let report = engine.process_queue().await?;
            println!(
                "attempted {}, sent {}, failed {}, skipped {}",
                report.attempted, report.sent, report.failed, report.skipped_cancelled
            );
        }
        Commands::QueueDm { to, subject, message, name } => {
            let item = engine.queue_dm(&to, &subject, &message, &name).await?;
            println!("queued {}", item.id);
        }
        Commands::Sent => {
            for entry in engine.sent_log().await? {
                let name = if entry.display_name.is_empty() { "-" } else { entry.display_name.as_str() };
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    entry.sent_at, entry.event_id, entry.recipient_pubkey, name, entry.subject
                );
            }
        }
        _ => bail!("command does not need the engine"),
    }
    Ok(())
}

/// 引数がなければ設定の lightning_address を使う
fn invoice_address(arg: Option<String>, config: &EngineConfig) -> anyhow::Result<String> {
    arg.or_else(|| config.lightning_address.clone())
        .filter(|a| !a.trim().is_empty())
        .context("no Lightning address given and lightning_address is not configured")
}

fn print_keys(config: &EngineConfig) -> anyhow::Result<()> {
    let keys = match config.site_keys()? {
        Some(keys) => keys,
        None => {
            let keys = Keys::generate()?;
            println!("nsec: {}", keys.secret_key().to_bech32()?);
            keys
        }
    };
    println!("npub: {}", keys.public_key().to_bech32()?);
    println!("hex:  {}", keys.public_key().to_hex());
    Ok(())
}
