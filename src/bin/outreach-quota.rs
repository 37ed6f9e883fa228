use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use outreach_quota::{
    AccountKey, ClientKey, GuardConfig, Meter, QuotaGuard, clock, init_tracing,
};

/// Operator tool for inspecting and adjusting usage quotas.
#[derive(Parser, Debug)]
#[command(name = "outreach-quota", version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// SQLite usage database (overrides config)
    #[arg(long, value_name = "PATH")]
    sqlite: Option<PathBuf>,

    /// Redis cache URL (overrides config)
    #[arg(long, value_name = "URL")]
    redis: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print today's status payload for an account
    Status {
        #[arg(long)]
        account: String,
    },
    /// Add usage to today's counters
    Record {
        #[arg(long)]
        account: String,
        #[arg(long, value_enum)]
        meter: MeterArg,
        #[arg(long)]
        amount: u64,
    },
    /// List every account's usage for a day
    Usage {
        /// YYYY-MM-DD, defaults to today (UTC)
        #[arg(long)]
        date: Option<String>,
    },
    /// Run the request limiter against a client address
    Admit {
        #[arg(long)]
        client: String,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MeterArg {
    GenerationTokens,
    NewsLookups,
}

impl From<MeterArg> for Meter {
    fn from(arg: MeterArg) -> Self {
        match arg {
            MeterArg::GenerationTokens => Meter::GenerationTokens,
            MeterArg::NewsLookups => Meter::NewsLookups,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let mut config = match args.config.as_deref() {
        Some(path) => GuardConfig::load(path)?,
        None => GuardConfig::default(),
    };
    config.apply_env();
    if let Some(path) = args.sqlite {
        config.store.sqlite_path = Some(path);
    }
    if let Some(url) = args.redis {
        config.cache.redis_url = Some(url);
    }

    let guard = QuotaGuard::from_config(config).await?;

    match args.command {
        Command::Status { account } => {
            let account = AccountKey::parse(&account)?;
            let status = guard.status(&account).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Record {
            account,
            meter,
            amount,
        } => {
            let account = AccountKey::parse(&account)?;
            guard.record_usage(&account, meter.into(), amount).await?;
            let status = guard.status(&account).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Usage { date } => {
            let date = match date {
                Some(raw) => clock::parse_date(&raw)
                    .ok_or_else(|| format!("invalid --date {raw:?}, expected YYYY-MM-DD"))?,
                None => {
                    use outreach_quota::Clock as _;
                    clock::SystemClock.today()
                }
            };
            for record in guard.quota().usage_for_date(date).await? {
                println!(
                    "{}\t{}\tgeneration_tokens={}\tnews_lookups={}",
                    clock::format_date(record.date)?,
                    record.account,
                    record.generation_tokens,
                    record.news_lookups
                );
            }
        }
        Command::Admit { client, count } => {
            let client = ClientKey::parse(&client)?;
            for attempt in 1..=count {
                let decision = guard.admit(&client);
                println!("{attempt}\t{}", serde_json::to_string(&decision)?);
            }
        }
    }
    Ok(())
}
