use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use paddock_core::{parse_race_date, Clock, RaceDate, SystemClock, DATE_FORMAT};
use paddock_sync::{
    build_updater, connect_pool, run_migrations, BackfillReport, DateOutcome, PaddockConfig,
    PgRaceStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "paddock")]
#[command(about = "Paddock race-card ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the admin API (and the startup/scheduled backfill when enabled).
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Scrape one date (default: yesterday).
    Scrape {
        #[arg(long, value_parser = parse_race_date)]
        date: Option<RaceDate>,
    },
    /// Backfill from the last complete date, or only the missing dates of a window.
    Backfill {
        #[arg(long, value_parser = parse_race_date)]
        since: Option<RaceDate>,
        #[arg(long, value_parser = parse_race_date)]
        until: Option<RaceDate>,
        /// List the dates that would be ingested without fetching anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// List dates without races.
    Gaps {
        #[arg(long, value_parser = parse_race_date)]
        from: RaceDate,
        #[arg(long, value_parser = parse_race_date)]
        to: Option<RaceDate>,
    },
    /// Count historical runners whose horse could not be resolved.
    Audit,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paddock=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PaddockConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => paddock_web::serve(config).await?,
        Commands::Migrate => {
            let pool = connect_pool(&config).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Scrape { date } => {
            let pool = connect_pool(&config).await?;
            let updater = build_updater(&config, pool)?;
            let date = date.unwrap_or_else(|| SystemClock.yesterday());
            let commit = updater
                .scrape_date(date)
                .await
                .with_context(|| format!("scraping {}", date.format(DATE_FORMAT)))?;
            println!(
                "scraped {}: races={} races_written={} runners_written={} rejected={} skipped_sections={} cached={}",
                commit.date.format(DATE_FORMAT),
                commit.races_parsed,
                commit.write.races_written,
                commit.write.runners_written,
                commit.write.rejected_runners.len(),
                commit.section_failures.len(),
                commit.from_cache,
            );
        }
        Commands::Backfill {
            since,
            until,
            dry_run,
        } => {
            let pool = connect_pool(&config).await?;
            let updater = build_updater(&config, pool)?;
            let yesterday = SystemClock.yesterday();

            if dry_run {
                let from = match since {
                    Some(since) => since,
                    None => updater
                        .status()
                        .await
                        .last_complete_date
                        .map(paddock_core::next_day)
                        .unwrap_or(config.earliest_date),
                };
                let to = until.unwrap_or(yesterday).min(yesterday);
                if from > to {
                    println!("already up to date");
                    return Ok(());
                }
                let missing = updater.find_gaps(from, to).await?;
                for date in &missing {
                    println!("{}", date.format(DATE_FORMAT));
                }
                println!("{} date(s) would be ingested", missing.len());
                return Ok(());
            }

            let stop = updater.shutdown_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("ctrl-c received, finishing the current date");
                    stop.cancel();
                }
            });

            let report = match since {
                Some(since) => updater.backfill_window(since, until.unwrap_or(yesterday)).await?,
                None if until.is_some() => bail!("--until requires --since"),
                None => updater.run_backfill().await?,
            };
            print_report(&report);
        }
        Commands::Gaps { from, to } => {
            let pool = connect_pool(&config).await?;
            let updater = build_updater(&config, pool)?;
            let to = to.unwrap_or_else(|| SystemClock.yesterday());
            let missing = updater.find_gaps(from, to).await?;
            for date in &missing {
                println!("{}", date.format(DATE_FORMAT));
            }
            println!(
                "{} missing date(s) between {} and {}",
                missing.len(),
                from.format(DATE_FORMAT),
                to.format(DATE_FORMAT)
            );
        }
        Commands::Audit => {
            let pool = connect_pool(&config).await?;
            let store = PgRaceStore::new(pool);
            let unresolved = store.count_unresolved_runners_before(SystemClock.today()).await?;
            println!("historical runners without a horse: {unresolved}");
            if unresolved > 0 {
                bail!("{unresolved} historical runner(s) have no horse identity");
            }
        }
    }

    Ok(())
}

fn print_report(report: &BackfillReport) {
    let Some((from, to)) = report.window else {
        println!("already up to date");
        return;
    };
    println!(
        "backfill {}: {} to {}",
        report.run_id,
        from.format(DATE_FORMAT),
        to.format(DATE_FORMAT)
    );
    for outcome in &report.outcomes {
        match outcome {
            DateOutcome::Committed(commit) => println!(
                "  {} ok races={} runners_written={}",
                commit.date.format(DATE_FORMAT),
                commit.races_parsed,
                commit.write.runners_written
            ),
            DateOutcome::Failed { date, cause, message } => {
                println!("  {} failed ({cause:?}): {message}", date.format(DATE_FORMAT))
            }
        }
    }
    if report.cancelled {
        println!("stopped early on shutdown");
    }
    if !report.incomplete_dates.is_empty() {
        let dates: Vec<String> = report
            .incomplete_dates
            .iter()
            .map(|d| d.format(DATE_FORMAT).to_string())
            .collect();
        println!("still missing: {}", dates.join(", "));
    }
}
