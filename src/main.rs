mod error;
mod gate;
mod limits;
mod models;
mod period;
mod purchase;
mod reconcile;
mod remote;
mod service;
mod settings;
mod storage;

use clap::{Parser, Subcommand};
use error::AppError;
use gate::Gated;
use models::ActionType;
use period::SystemClock;
use remote::http::HttpBackend;
use remote::EntitlementBackend;
use service::{EntitlementService, ServiceOptions, StatusReport, TrialExpiredNotice};
use settings::{
    db_path, ensure_initialized, get_api_token, load_config, set_api_token, AppConfig, BackendKind,
};
use std::sync::Arc;
use std::time::Duration;
use storage::Storage;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "recipe-quota")]
#[command(about = "Trial, add-on and plan credits for recipe imports and AI features")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    SetToken {
        #[arg(long)]
        token: String,
    },
    Status {
        #[arg(long)]
        json: bool,
    },
    Refresh,
    Check {
        action: String,
    },
    Run {
        action: String,
        #[arg(long, default_value_t = 1)]
        quantity: u64,
    },
    Purchase {
        action: String,
        quantity: u64,
    },
    Ledger {
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("RECIPE_QUOTA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn parse_action(input: &str) -> Result<ActionType, AppError> {
    input.parse::<ActionType>().map_err(AppError::Config)
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn open_backend(cfg: &AppConfig) -> Result<Arc<dyn EntitlementBackend>, AppError> {
    match cfg.backend.kind {
        BackendKind::Local => {
            let db = db_path()?;
            let storage = Storage::open(&db, cfg.plan_allowances.clone(), Arc::new(SystemClock))?;
            Ok(Arc::new(storage))
        }
        BackendKind::Http => {
            let base = cfg.backend.base_url.as_deref().ok_or_else(|| {
                AppError::Config("backend.base_url is required for the http backend.".into())
            })?;
            let backend = HttpBackend::new(
                base,
                get_api_token()?,
                Duration::from_secs(cfg.connect_timeout_secs),
                Duration::from_secs(cfg.request_timeout_secs),
            )?;
            Ok(Arc::new(backend))
        }
    }
}

async fn open_session(cfg: &AppConfig) -> Result<EntitlementService, AppError> {
    EntitlementService::sign_in(
        open_backend(cfg)?,
        Arc::new(SystemClock),
        &cfg.user_id,
        ServiceOptions::from_config(cfg),
    )
    .await
}

fn trial_notice_text(notice: &TrialExpiredNotice) -> String {
    let mut text = format!(
        "Your free trial ended on {}.",
        notice.ended_at.format("%Y-%m-%d")
    );
    if notice.downgraded {
        text.push_str(" Your plan is now base, billed monthly.");
    }
    text
}

fn render_status(report: &StatusReport) -> String {
    let mut out = format!(
        "user {}  plan {}{}  subscription {:?}\n",
        report.user_id,
        report.plan_tier.as_label(),
        if report.ai_disabled { " (AI off)" } else { "" },
        report.subscription_status,
    );
    if report.trial_active {
        out.push_str(&format!("trial: {} day(s) left\n", report.trial_days_left));
    } else {
        out.push_str("trial: ended\n");
    }
    if let Some(period) = report.period_start {
        out.push_str(&format!("period since {period}\n"));
    }
    out.push_str("action        used/plan  trial  add-on  status\n");
    for row in &report.actions {
        out.push_str(&format!(
            "{:<12} {:>5}/{:<4} {:>6} {:>7}  {}\n",
            row.action.as_label(),
            row.used_this_period,
            row.plan_allowance,
            row.trial_remaining,
            row.addon_balance,
            if row.blocked { "blocked" } else { "ok" },
        ));
    }
    out
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized recipe-quota config and data directories.");
        }
        Commands::SetToken { token } => {
            if token.trim().is_empty() {
                return Err(AppError::Config("Token must not be empty.".into()));
            }
            set_api_token(token.trim())?;
            println!("API token stored.");
        }
        Commands::Status { json } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let svc = open_session(&cfg).await?;
            let notice = svc.check_trial_expiry().await?;
            let report = svc.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                if let Some(notice) = &notice {
                    println!("{}", trial_notice_text(notice));
                }
                print!("{}", render_status(&report));
            }
            svc.sign_out().await;
        }
        Commands::Refresh => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let svc = open_session(&cfg).await?;
            if svc.refresh_usage().await? {
                let state = svc.state();
                let period = state
                    .reconciled_snapshot
                    .map(|s| s.period_start.to_string())
                    .unwrap_or_else(|| "unknown".into());
                println!("Usage reconciled for the period starting {period}.");
            } else {
                println!("Usage service unreachable; keeping the last known usage.");
            }
            svc.sign_out().await;
        }
        Commands::Check { action } => {
            let action = parse_action(&action)?;
            ensure_initialized()?;
            let cfg = load_config()?;
            let svc = open_session(&cfg).await?;
            let avail = svc.availability(action);
            if svc.is_limit_reached(action) {
                let hint = if avail.ai_blocked {
                    "Upgrade your plan to use AI features.".to_string()
                } else {
                    format!("Buy more {action} credits or wait for your plan to renew.")
                };
                println!("{action}: limit reached. {hint}");
            } else {
                println!(
                    "{action}: available (plan {}, trial {}, add-on {})",
                    avail.plan, avail.trial, avail.addon
                );
            }
            svc.sign_out().await;
        }
        Commands::Run { action, quantity } => {
            let action = parse_action(&action)?;
            ensure_initialized()?;
            let cfg = load_config()?;
            let svc = open_session(&cfg).await?;
            // The metered work itself happens elsewhere; this records the authorized use.
            let gated = svc.perform(action, quantity, || async { Ok(()) }).await?;
            match gated {
                Gated::Completed { authorization, .. } => {
                    println!(
                        "Authorized {} {} (plan {}, trial {}, add-on {}).",
                        authorization.quantity,
                        action,
                        authorization.used_plan,
                        authorization.used_trial,
                        authorization.used_addon
                    );
                    svc.sign_out().await;
                }
                Gated::Denied(denied) => {
                    eprintln!("{denied}. {}", denied.call_to_action());
                    svc.sign_out().await;
                    return Err(AppError::AuthorizationDenied(denied));
                }
            }
        }
        Commands::Purchase { action, quantity } => {
            let action = parse_action(&action)?;
            ensure_initialized()?;
            let cfg = load_config()?;
            let svc = open_session(&cfg).await?;
            let receipt = svc.purchase(action, quantity).await?;
            println!(
                "Added {} {} credit(s). Add-on balance: {}.",
                quantity,
                action,
                receipt.addons.balances.get(action)
            );
            svc.sign_out().await;
        }
        Commands::Ledger { format } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let backend = open_backend(&cfg)?;
            let rows = backend.list_purchases(&cfg.user_id).await?;
            if format.eq_ignore_ascii_case("json") {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if format.eq_ignore_ascii_case("csv") {
                println!("action,quantity,timestamp");
                for r in rows {
                    println!(
                        "{},{},{}",
                        csv_field(r.action_type.as_label()),
                        r.quantity,
                        csv_field(&r.timestamp.to_rfc3339()),
                    );
                }
            } else {
                return Err(AppError::Config(
                    "Unsupported ledger format. Use json or csv".into(),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingCadence, PlanTier, SubscriptionStatus};
    use crate::service::ActionStatus;
    use chrono::{TimeZone, Utc};

    #[test]
    fn parse_action_accepts_known_values() {
        assert_eq!(parse_action("import").expect("import"), ActionType::Import);
        assert_eq!(parse_action("AI_MESSAGE").expect("ai"), ActionType::AiMessage);
    }

    #[test]
    fn parse_action_rejects_unknown_values() {
        let err = parse_action("export").expect_err("expected validation error");
        assert!(err.to_string().contains("Unknown action 'export'"));
    }

    #[test]
    fn csv_field_escapes_special_characters() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("a\"b"), "\"a\"\"b\"");
        assert_eq!(csv_field("a\nb"), "\"a\nb\"");
    }

    #[test]
    fn trial_notice_mentions_downgrade_only_when_it_happened() {
        let ended_at = Utc
            .with_ymd_and_hms(2026, 10, 16, 9, 0, 0)
            .single()
            .expect("valid fixed timestamp");
        let quiet = trial_notice_text(&TrialExpiredNotice {
            ended_at,
            downgraded: false,
        });
        assert_eq!(quiet, "Your free trial ended on 2026-10-16.");
        let loud = trial_notice_text(&TrialExpiredNotice {
            ended_at,
            downgraded: true,
        });
        assert!(loud.ends_with("Your plan is now base, billed monthly."));
    }

    #[test]
    fn render_status_marks_blocked_rows() {
        let report = StatusReport {
            user_id: "u1".into(),
            plan_tier: PlanTier::Base,
            ai_disabled: true,
            subscription_status: SubscriptionStatus::Active,
            billing_cadence: BillingCadence::Monthly,
            trial_active: false,
            trial_days_left: 0,
            trial_ends_at: Utc::now(),
            period_start: None,
            actions: vec![
                ActionStatus {
                    action: ActionType::Import,
                    used_this_period: 1,
                    plan_allowance: 5,
                    trial_remaining: 0,
                    addon_balance: 0,
                    blocked: false,
                },
                ActionStatus {
                    action: ActionType::AiMessage,
                    used_this_period: 0,
                    plan_allowance: 30,
                    trial_remaining: 0,
                    addon_balance: 0,
                    blocked: true,
                },
            ],
        };
        let text = render_status(&report);
        assert!(text.contains("plan base (AI off)"));
        assert!(text.contains("trial: ended"));
        assert!(text.lines().any(|l| l.starts_with("ai_message") && l.ends_with("blocked")));
        assert!(text.lines().any(|l| l.starts_with("import") && l.ends_with("ok")));
    }
}
