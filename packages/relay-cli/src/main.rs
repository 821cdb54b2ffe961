use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use relay_core::chain_adapter::{AdapterRegistry, DefaultChainAdapterFactory};
use relay_core::clock::{Clock, SystemClock};
use relay_core::fetcher::{AttestationFetcher, AttestationSource, HttpAttestationSource};
use relay_core::observer::EmitterObserver;
use relay_core::pipeline::{Pipeline, PipelineSettings};
use relay_core::queue::RelayQueue;
use relay_core::rate_limit::{RateLimiter, ReviewQueue};
use relay_core::reconciler::{BalanceFetcher, CrossChainState, Reconciler, WatchCallback};
use relay_core::relayer::{Relayer, RelayerSettings};
use relay_core::store::{FileStore, KvStore, MemoryStore};
use relay_core::verify::{self, GuardianSetProvider};
use relay_core::{Attestation, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 解析十六进制编码的证明并打印字段
    Decode {
        /// 证明的十六进制编码
        #[arg(short = 'x', long, value_name = "HEX")]
        hex: String,
    },
    /// 使用配置中的守护者集合校验证明
    Verify {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// 证明的十六进制编码
        #[arg(short = 'x', long, value_name = "HEX")]
        hex: String,
    },
    /// 列出等待人工审核的消息
    Reviews {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 批准或拒绝审核中的消息
    Decide {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// 消息 ID
        #[arg(short, long)]
        message_id: String,
        /// 批准
        #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
        approve: bool,
        /// 拒绝
        #[arg(long)]
        reject: bool,
    },
    /// 启动中继器服务
    Start {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig { config } => {
            info!("正在验证配置文件: {:?}", config);
            let config = Config::load(config)?;
            println!("配置文件验证成功!");
            println!("配置内容概要:");
            println!("- 支持的链:");
            for chain in &config.chains {
                println!(
                    "  - {} ({}, 链编号 {}): {} 个发送方, 节点 {}",
                    chain.name,
                    chain.id,
                    chain.id.wire_id(),
                    chain.emitters.len(),
                    chain.rpc_url
                );
            }
            let current = &config.guardians.current;
            println!(
                "- 守护者集合 {}: {} 个公钥, 法定数 {}",
                current.index,
                current.keys.len(),
                current.quorum()
            );
            if let Some(previous) = &config.guardians.previous {
                println!(
                    "- 上一守护者集合 {} 在启动后 {}秒内有效",
                    previous.index, config.guardians.grace_period_secs
                );
            }
            println!("- 证明来源: {}", config.attestation.sources.join(", "));
            println!("- 中继器配置:");
            println!("  - 最大尝试次数: {}", config.relayer.max_attempts);
            println!(
                "  - 重试延迟: {}毫秒..{}毫秒",
                config.relayer.base_delay_ms, config.relayer.max_delay_ms
            );
            println!("  - 单次超时: {}秒", config.relayer.attempt_timeout_secs);
            println!(
                "- 限流: 每 {}秒 {} 条",
                config.rate_limit.window_secs, config.rate_limit.max_per_window
            );
            for watch in &config.watches {
                println!(
                    "- 监视 {}: {} 条链, 策略 {}, 每 {}毫秒",
                    watch.key,
                    watch.chains.len(),
                    watch.strategy,
                    watch.interval_ms
                );
            }
            Ok(())
        }
        Commands::Decode { hex } => {
            let attestation = parse_hex(&hex)?;
            print_attestation(&attestation);
            Ok(())
        }
        Commands::Verify { config, hex } => {
            let config = Config::load(config)?;
            let attestation = parse_hex(&hex)?;
            let now = SystemClock.now_ms();
            print_attestation(&attestation);
            match verify::verify(&attestation, &config.guardian_sets(now), now) {
                Ok(()) => {
                    println!("证明有效");
                    Ok(())
                }
                Err(e) => Err(anyhow!("证明无效: {}", e)),
            }
        }
        Commands::Reviews { config } => {
            let config = Config::load(config)?;
            let reviews = ReviewQueue::new(persistent_store(&config).await?, Arc::new(SystemClock));
            let open = reviews.open().await?;
            if open.is_empty() {
                println!("没有等待审核的消息");
            }
            for entry in open {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            }
            Ok(())
        }
        Commands::Decide {
            config,
            message_id,
            approve,
            reject: _,
        } => {
            let config = Config::load(config)?;
            let reviews = ReviewQueue::new(persistent_store(&config).await?, Arc::new(SystemClock));
            if !reviews.decide(&message_id, approve).await? {
                bail!("消息 {} 的审核已结束", message_id);
            }
            println!("{} {}", message_id, if approve { "已批准" } else { "已拒绝" });
            Ok(())
        }
        Commands::Start { config } => {
            info!("正在启动中继器服务");
            info!("使用配置文件: {:?}", config);
            let config = Config::load(config)?;
            if let Err(e) = start(config).await {
                error!("中继器服务异常退出: {:#}", e);
                return Err(e);
            }
            Ok(())
        }
    }
}

fn parse_hex(input: &str) -> Result<Attestation> {
    let bytes = hex::decode(input.trim().trim_start_matches("0x")).context("证明不是有效的十六进制")?;
    Ok(Attestation::parse(&bytes)?)
}

fn print_attestation(attestation: &Attestation) {
    let body = attestation.body();
    let chain = body
        .emitter_chain_id()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "未知".to_string());
    println!("守护者集合: {}", attestation.guardian_set_index());
    println!("签名数量:   {}", attestation.signatures().len());
    for sig in attestation.signatures() {
        println!("  [{}] {}", sig.guardian_index, hex::encode(sig.signature));
    }
    println!("来源链:     {} ({})", body.emitter_chain, chain);
    println!("发送方:     {}", body.emitter_address);
    println!("序号:       {}", body.sequence);
    println!("载荷哈希:   {}", hex::encode(body.payload_hash));
    println!("摘要:       {}", attestation.digest());
}

async fn open_store(path: Option<&Path>) -> Result<Arc<dyn KvStore>> {
    Ok(match path {
        Some(path) => Arc::new(FileStore::open(path).await?),
        None => Arc::new(MemoryStore::new()),
    })
}

async fn persistent_store(config: &Config) -> Result<Arc<dyn KvStore>> {
    match &config.store_path {
        Some(path) => open_store(Some(path)).await,
        None => bail!("未配置 store_path，审核记录不会保存"),
    }
}

async fn start(config: Config) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(config.store_path.as_deref()).await?;
    if config.store_path.is_none() {
        warn!("未配置 store_path，队列状态仅保存在内存中");
    }

    let adapters = AdapterRegistry::from_config(&config.chains, &DefaultChainAdapterFactory).await?;
    for chain in adapters.chains() {
        if let Some(adapter) = adapters.get(chain) {
            adapter
                .connect()
                .await
                .with_context(|| format!("连接 {} 失败", chain))?;
        }
    }

    let guardians = Arc::new(GuardianSetProvider::new(config.guardian_sets(clock.now_ms())));
    let sources: Vec<Arc<dyn AttestationSource>> = config
        .attestation
        .sources
        .iter()
        .map(|url| Arc::new(HttpAttestationSource::new(url)) as Arc<dyn AttestationSource>)
        .collect();
    let fetcher = Arc::new(AttestationFetcher::new(
        sources,
        guardians,
        clock.clone(),
        config.fetch_config(),
    ));

    let queue = Arc::new(RelayQueue::new(store.clone(), clock.clone(), config.relayer.max_attempts));
    let limiter = Arc::new(RateLimiter::new(store.clone(), clock.clone(), config.rate_limit_config()));
    let reviews = Arc::new(ReviewQueue::new(store.clone(), clock.clone()));
    let relayer = Arc::new(Relayer::new(
        queue.clone(),
        adapters.clone(),
        limiter,
        reviews,
        RelayerSettings {
            backoff: config.backoff_policy(),
            attempt_timeout: Duration::from_secs(config.relayer.attempt_timeout_secs),
            confirm_poll_interval: Duration::from_millis(config.relayer.confirm_poll_interval_ms),
        },
    ));
    let pipeline = Arc::new(Pipeline::new(
        queue.clone(),
        fetcher,
        relayer,
        clock.clone(),
        PipelineSettings {
            tick_interval: Duration::from_millis(config.relayer.tick_interval_ms),
            message_ttl: Duration::from_secs(config.relayer.message_ttl_secs),
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut observers = Vec::new();
    for chain in config.chains.iter().filter(|c| !c.emitters.is_empty()) {
        let Some(adapter) = adapters.get(chain.id) else {
            continue;
        };
        let observer = EmitterObserver::new(
            adapter,
            queue.clone(),
            clock.clone(),
            adapters.chains(),
            chain.emitters.clone(),
        );
        let shutdown = shutdown_rx.clone();
        let chain_id = chain.id;
        observers.push(tokio::spawn(async move {
            if let Err(e) = observer.run(shutdown).await {
                error!("{} 的监听器异常退出: {}", chain_id, e);
            }
        }));
    }

    let mut watches = Vec::new();
    for watch in &config.watches {
        let fetcher = Arc::new(BalanceFetcher::new(adapters.clone(), clock.clone(), watch.token.clone()));
        let reconciler = Arc::new(Reconciler::new(fetcher, clock.clone()));
        let report: WatchCallback<u128> = Arc::new(|state: CrossChainState<u128>| {
            info!(
                key = %state.key,
                value = %state.data,
                chains = state.chain_states.len(),
                last_sync = state.last_sync,
                "状态已对账"
            );
        });
        let handle = reconciler
            .watch_state(
                &watch.key,
                watch.chains.clone(),
                watch.strategy,
                Duration::from_millis(watch.interval_ms),
                report,
            )
            .await;
        watches.push((reconciler, handle));
    }

    let pipeline_task = tokio::spawn(pipeline.run(shutdown_rx));
    info!(
        "中继器初始化成功，开始运行: {} 条链, {} 个监听器, {} 个监视",
        adapters.chains().len(),
        observers.len(),
        watches.len()
    );

    tokio::signal::ctrl_c().await?;
    info!("正在停止中继器服务");
    let _ = shutdown_tx.send(true);
    for (_, handle) in &watches {
        handle.dispose().await;
    }
    pipeline_task.await?;
    for observer in observers {
        observer.await?;
    }
    for chain in adapters.chains() {
        if let Some(adapter) = adapters.get(chain) {
            if let Err(e) = adapter.disconnect().await {
                warn!("断开 {} 失败: {}", chain, e);
            }
        }
    }
    Ok(())
}
