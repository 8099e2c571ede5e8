//! collections-runner: headless driver for the collections engine.
//!
//! Seeds a deterministic demo portfolio, then runs the daily batch for a
//! number of consecutive days with random client payments in between.
//!
//! Usage:
//!   collections-runner --seed 12345 --days 90 --db collections.db
//!   collections-runner --config data/delinquency_config.json --date 2025-03-01
//!   collections-runner --demo-credits 50 --days 30 --json

use anyhow::{Context, Result};
use chrono::{Duration, Months, NaiveDate, NaiveTime};
use collections_core::{
    config::DelinquencyConfig,
    engine::CollectionsEngine,
    ledger::{level_schedule, Credit, CreditState},
    notifier::LogNotifier,
    orchestrator::RunLog,
    store::CollectionsStore,
    types::round_money,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use rust_decimal::Decimal;
use std::env;

/// Chance that a client pays an open installment on a given day.
const DAILY_PAYMENT_PROBABILITY: f64 = 0.08;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let days = parse_arg(&args, "--days", 60u32);
    let demo_credits = parse_arg(&args, "--demo-credits", 25u32);
    let json = args.iter().any(|a| a == "--json");
    let db = flag_value(&args, "--db").unwrap_or(":memory:");
    let config_path = flag_value(&args, "--config");
    let start = match flag_value(&args, "--date") {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .with_context(|| format!("--date expects YYYY-MM-DD, got {raw}"))?,
        None => chrono::Local::now().date_naive(),
    };

    println!("collections-runner: daily delinquency batch");
    println!("  seed:          {seed}");
    println!("  start date:    {start}");
    println!("  days:          {days}");
    println!("  demo credits:  {demo_credits}");
    println!("  db:            {db}");
    println!("  config:        {}", config_path.unwrap_or("(documented default)"));
    println!();

    let config = match config_path {
        Some(path) => DelinquencyConfig::load(path)?,
        None => DelinquencyConfig::documented_default(),
    };

    let store = if db == ":memory:" {
        CollectionsStore::in_memory()?
    } else {
        CollectionsStore::open(db)?
    };
    let engine = CollectionsEngine::build(store, Box::new(LogNotifier))?;
    let snapshot = engine.publish_configuration(&config, start.and_time(NaiveTime::default()))?;
    log::info!("published configuration v{}", snapshot.version);

    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let credit_ids = seed_portfolio(&engine, &mut rng, demo_credits, start)?;
    log::info!("seeded {} demo credits", credit_ids.len());

    let mut runs = Vec::with_capacity(days as usize);
    for offset in 0..days {
        let today = start + Duration::days(i64::from(offset));
        simulate_payments(&engine, &mut rng, &credit_ids, today)?;
        let run_log = engine.run(today)?;
        if json {
            println!("{}", serde_json::to_string(&run_log)?);
        } else {
            print_run_line(&run_log);
        }
        runs.push(run_log);
    }

    print_summary(&engine, &credit_ids, &runs)?;
    Ok(())
}

/// Open `count` active credits whose schedules started before `start`, so
/// the first runs already see overdue installments.
fn seed_portfolio(
    engine: &CollectionsEngine,
    rng: &mut Pcg64Mcg,
    count: u32,
    start: NaiveDate,
) -> Result<Vec<String>> {
    let mut credit_ids = Vec::with_capacity(count as usize);
    // Roughly three credits per client.
    let clients = (count / 3).max(1);
    for n in 0..count {
        let credit_id = format!("cr-{:04}", n + 1);
        let client_id = format!("cli-{:04}", rng.gen_range(1..=clients));
        let installments: u32 = rng.gen_range(3..=12);
        let principal = Decimal::from(rng.gen_range(20u32..=400) * 5_000);
        let rate = Decimal::new(rng.gen_range(30i64..=90), 2);
        let interest = round_money(principal * rate * Decimal::from(installments) / Decimal::from(12));
        let months_back: u32 = rng.gen_range(0..=3);
        let first_due = start
            .checked_sub_months(Months::new(months_back))
            .unwrap_or(start)
            + Duration::days(rng.gen_range(0..28));
        let request_date = first_due
            .checked_sub_months(Months::new(1))
            .unwrap_or(first_due);

        let schedule = level_schedule(&credit_id, principal, interest, installments, first_due)?;
        let total_payable = principal + interest;
        let credit = Credit {
            credit_id: credit_id.clone(),
            client_id,
            principal_requested: principal,
            principal_approved: principal,
            nominal_rate: rate,
            installment_count: installments,
            installment_amount: schedule.first().map(|i| i.total_amount).unwrap_or_default(),
            total_cost_rate: round_money(rate * Decimal::new(12, 1)),
            total_payable,
            outstanding_balance: total_payable,
            state: CreditState::Active,
            request_date,
            approval_date: Some(request_date),
            close_date: None,
            first_installment_date: first_due,
            initial_risk_score: Decimal::from(rng.gen_range(450u32..=850)),
            guarantor_id: None,
        };
        engine.open_credit(&credit, &schedule)?;
        credit_ids.push(credit_id);
    }
    Ok(credit_ids)
}

/// Clients pay the oldest open installment in full, at random.
fn simulate_payments(
    engine: &CollectionsEngine,
    rng: &mut Pcg64Mcg,
    credit_ids: &[String],
    today: NaiveDate,
) -> Result<()> {
    let paid_at = today.and_hms_opt(8, 30, 0).unwrap_or_default();
    for credit_id in credit_ids {
        let oldest = engine
            .store()
            .installments_for_credit(credit_id)?
            .into_iter()
            .filter(|i| i.state.is_open() && i.due_date <= today + Duration::days(3))
            .min_by_key(|i| i.number);
        let Some(installment) = oldest else { continue };
        if !rng.gen_bool(DAILY_PAYMENT_PROBABILITY) {
            continue;
        }
        let outcome = engine.record_payment(
            &installment.installment_id,
            installment.amount_owed(),
            paid_at,
            Some("transfer"),
        )?;
        log::debug!(
            "{credit_id}: installment #{} paid, {} score points restored",
            installment.number,
            outcome.score_restored
        );
    }
    Ok(())
}

fn print_run_line(r: &RunLog) {
    println!(
        "{} | processed {:>4} | delinquent {:>4} | alerts +{:<3} ~{:<3} -{:<3} | notified {:>3} | \
         penalty {:>12} (+{}) | blocked {:>2} | {}",
        r.as_of,
        r.installments_processed,
        r.installments_with_delinquency,
        r.alerts_generated,
        r.alerts_updated,
        r.alerts_resolved,
        r.notifications_sent,
        r.total_penalty_amount,
        r.total_penalty_applied,
        r.clients_blocked,
        if r.succeeded { "ok" } else { "FAILED" }
    );
}

fn print_summary(engine: &CollectionsEngine, credit_ids: &[String], runs: &[RunLog]) -> Result<()> {
    let store = engine.store();
    let mut by_state = std::collections::BTreeMap::<String, u32>::new();
    let mut outstanding = Decimal::ZERO;
    let mut penalty = Decimal::ZERO;
    for credit_id in credit_ids {
        let credit = store.get_credit(credit_id)?;
        *by_state.entry(credit.state.to_string()).or_default() += 1;
        outstanding += credit.outstanding_balance;
        for inst in store.installments_for_credit(credit_id)? {
            if inst.state.is_open() {
                penalty += inst.penalty_amount;
            }
        }
    }
    let open_alerts = store.open_alerts()?;
    let blocked = store.blocked_clients()?;
    let failed_runs = runs.iter().filter(|r| !r.succeeded).count();
    let notified: u32 = runs.iter().map(|r| r.notifications_sent).sum();

    println!();
    println!("=== PORTFOLIO SUMMARY ===");
    println!("  runs:              {} ({failed_runs} failed)", runs.len());
    println!("  credits:           {}", credit_ids.len());
    for (state, n) in &by_state {
        println!("    {state:<15} {n}");
    }
    println!("  outstanding:       {outstanding}");
    println!("  open penalty:      {penalty}");
    println!("  open alerts:       {}", open_alerts.len());
    println!("  notifications:     {notified}");
    println!("  blocked clients:   {}", blocked.len());
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
