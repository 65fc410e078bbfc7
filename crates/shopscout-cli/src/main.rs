use anyhow::Result;
use clap::{Parser, Subcommand};
use shopscout_core::{CollectionRequest, CountryCode, Lens};
use shopscout_engine::report::export_opportunities;
use shopscout_engine::{build_engine, EngineConfig, FusionRequest};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "shopscout")]
#[command(about = "Product opportunity scouting across marketplaces, analytics and reference markets")]
struct Cli {
    /// Print full JSON responses instead of summaries.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect one keyword in one market through the routing chain.
    Collect {
        keyword: String,
        #[arg(long, default_value = "VN")]
        country: CountryCode,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Collect every fusion source and score cross-source opportunities.
    Fuse {
        keyword: String,
        #[arg(long, value_delimiter = ',', default_value = "VN,TH,MY,SG")]
        countries: Vec<CountryCode>,
        #[arg(long)]
        limit: Option<u32>,
        /// Also write a parquet report under the data directory.
        #[arg(long)]
        parquet: bool,
    },
    Recommend {
        #[arg(long, default_value = "blended")]
        lens: Lens,
        #[arg(long)]
        limit: Option<usize>,
    },
    Quota,
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,shopscout=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Quota) {
        Commands::Collect {
            keyword,
            country,
            limit,
        } => {
            let engine = build_engine(&config).await?;
            let response = engine
                .collect(CollectionRequest::new(keyword, country, limit))
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!(
                    "collect complete: task={} source={} count={} paid={} cost={:.3} simulated={}",
                    response.task_id,
                    response.data_source,
                    response.count,
                    response.paid,
                    response.cost,
                    response.simulated
                );
                for product in &response.products {
                    println!(
                        "  {}  {}  price={}",
                        product.id,
                        product.title_text(),
                        product
                            .price_value()
                            .map(|p| format!("{p:.2}"))
                            .unwrap_or_else(|| "-".into())
                    );
                }
            }
        }
        Commands::Fuse {
            keyword,
            countries,
            limit,
            parquet,
        } => {
            let engine = build_engine(&config).await?;
            let response = engine
                .fuse(FusionRequest {
                    keyword,
                    countries,
                    limit,
                })
                .await?;
            if parquet {
                let dir = config
                    .reports_dir()
                    .join(chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
                let manifest = export_opportunities(&dir, &response.opportunities)?;
                info!(manifest = %manifest.display(), "parquet report written");
                println!("parquet manifest: {}", manifest.display());
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!(
                    "fuse complete: fused={} avg_score={:.1} flagged={} cost={:.3}",
                    response.fused_count,
                    response.avg_fusion_score,
                    response
                        .opportunities
                        .iter()
                        .filter(|o| o.is_opportunity)
                        .count(),
                    response.cost
                );
                for (role, count) in &response.per_source_counts {
                    println!("  {role}: {count} records");
                }
                for item in response.opportunities.iter().take(10) {
                    println!(
                        "  {:>5.1}  {}{}",
                        item.composite_score,
                        item.title,
                        if item.is_opportunity { "  [opportunity]" } else { "" }
                    );
                }
            }
        }
        Commands::Recommend { lens, limit } => {
            let engine = build_engine(&config).await?;
            let ranked = engine.recommend(lens, limit).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&ranked)?);
            } else {
                for (i, item) in ranked.iter().enumerate() {
                    println!(
                        "{:>2}. {:>5.1} {:?}  {}{}  ({})",
                        i + 1,
                        item.score,
                        item.tier,
                        item.title,
                        if item.simulated { "  [simulated]" } else { "" },
                        item.justifications.join("; ")
                    );
                }
            }
        }
        Commands::Quota => {
            let engine = build_engine(&config).await?;
            let quotas = engine.quotas().await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&quotas)?);
            } else {
                for quota in quotas {
                    println!(
                        "{}: {}/{} free remaining, unit_cost={} resets {}",
                        quota.provider,
                        quota.remaining(),
                        quota.monthly_cap,
                        quota.unit_cost,
                        quota.reset_at.format("%Y-%m-%d")
                    );
                }
            }
        }
        Commands::Serve => {
            shopscout_web::serve(&config).await?;
        }
    }

    Ok(())
}
