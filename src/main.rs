mod auth;
mod caster;
mod config;
mod error;
mod fields;
mod job;
mod parser;
mod platform;
mod processor;
mod retry;
mod runner;
mod scheduler;
mod secrets;
mod sink;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::Config;
use error::Error;
use log::{error, LevelFilter};

#[derive(Parser)]
#[command(version, about = "Backfills ad platform reports into date-partitioned Parquet")]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Backfill {
        #[arg(long, help = "Date should be in the form YYYY-MM-DD or YYYYMMDD", value_parser = validate_date)]
        start_date: NaiveDate,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD or YYYYMMDD", value_parser = validate_date)]
        end_date: NaiveDate,
    },
}

fn validate_date(s: &str) -> Result<NaiveDate, String> {
    let error_message = "Invalid date, expected YYYY-MM-DD or YYYYMMDD";

    let s = s.trim();
    let parts: Vec<&str> = if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        vec![&s[0..4], &s[4..6], &s[6..8]]
    } else {
        s.split('-').collect()
    };

    let parts = parts
        .iter()
        .map(|part| part.parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| error_message)?;

    match parts.as_slice() {
        &[year, month, day] if month <= 12 && day <= 31 => {
            Ok(
                NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                    .ok_or(error_message)?,
            )
        }
        _ => Err(error_message.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.config.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    match &args.command {
        Command::Backfill { start_date, end_date } => {
            match runner::backfill(args.config, start_date, end_date).await {
                Ok(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                Err(err) => {
                    error!("backfill failed: {}", err);
                    std::process::exit(1);
                }
            }
        }
    };

    Ok(())
}
