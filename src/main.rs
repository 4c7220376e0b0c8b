use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use coupon_race::csv::{RaceRecord, read_coupons, write_outcomes};
use coupon_race::{Config, CouponError, CouponService, Isolation, Policy};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Race concurrent callers for a coupon under each contention policy.
#[derive(Debug, Parser)]
#[command(name = "coupon-race", version)]
struct Args {
    /// Policies to race, comma separated; all of them when omitted
    #[arg(long, value_enum, value_delimiter = ',')]
    policy: Vec<Policy>,

    /// Concurrent callers per race
    #[arg(long, default_value_t = 2)]
    contenders: usize,

    /// Csv file with a `code` column to seed coupons from
    #[arg(long)]
    coupons: Option<PathBuf>,

    /// Upper bound on a blocking row lock wait
    #[arg(long, default_value_t = 5000)]
    lock_wait_ms: u64,

    /// Pause between each caller's read and write
    #[arg(long, default_value_t = 10)]
    think_ms: u64,

    /// Isolation for units of work started without an explicit level
    #[arg(long, value_enum, default_value = "repeatable-read")]
    isolation: Isolation,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let codes = match &args.coupons {
        Some(path) => match read_coupons(path) {
            Ok(codes) => codes,
            Err(e) => {
                error!("{e}");
                process::exit(1);
            }
        },
        None => vec!["RACE_COUPON".to_string()],
    };
    if codes.is_empty() {
        warn!("no coupons to race for");
    }

    let config = Config::default()
        .with_lock_wait_timeout(Duration::from_millis(args.lock_wait_ms))
        .with_think_time(Duration::from_millis(args.think_ms))
        .with_default_isolation(args.isolation);
    let service = CouponService::new(config);

    let policies = if args.policy.is_empty() {
        Policy::ALL.to_vec()
    } else {
        args.policy.clone()
    };

    let mut records = Vec::new();
    for policy in policies {
        match race(&service, policy, &codes, args.contenders).await {
            Ok(mut raced) => records.append(&mut raced),
            Err(e) => {
                error!(%policy, "{e}");
                process::exit(1);
            }
        }
    }

    if let Err(e) = write_outcomes(io::stdout().lock(), &records) {
        error!("{e}");
        process::exit(1);
    }
}

async fn race(
    service: &CouponService,
    policy: Policy,
    codes: &[String],
    contenders: usize,
) -> Result<Vec<RaceRecord>, CouponError> {
    service.reset().await?;
    for code in codes {
        service.seed_coupon(code)?;
    }
    let mut users = Vec::with_capacity(contenders);
    for n in 1..=contenders {
        users.push(service.create_user(&format!("user{n}"))?.id);
    }

    let outcomes = service.race(policy, &users).await?;

    let winners = outcomes.iter().filter(|o| o.won()).count();
    if policy.awards_exactly_once() && codes.len() == 1 && winners > 1 {
        warn!(%policy, winners, "coupon awarded more than once");
    }

    Ok(users
        .into_iter()
        .zip(outcomes)
        .enumerate()
        .map(|(contender, (user, outcome))| RaceRecord {
            policy,
            contender,
            user,
            outcome,
        })
        .collect())
}
