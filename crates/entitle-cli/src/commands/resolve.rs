//! Resolve command
//!
//! Resolves the entitlement against the configured endpoint and prints the
//! tier and quotas.

use anyhow::Result;
use entitle_core::{QuotaKind, Quotas, ResolveOutcome};
use serde::Serialize;
use tabled::Tabled;

use super::{Context, FileAuthService, SessionArgs};
use crate::output::{print_info, print_rows_or_json, FieldRow, OutputFormat};

/// Quota row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct QuotaRow {
    #[tabled(rename = "Quota")]
    pub kind: String,
    #[tabled(rename = "Remaining")]
    pub remaining: String,
    #[tabled(rename = "Total")]
    pub total: String,
    #[tabled(rename = "%")]
    pub percent: String,
    #[tabled(rename = "Exceeded")]
    pub exceeded: bool,
}

#[derive(Debug, Serialize)]
struct ResolveReport {
    outcome: String,
    tier: String,
    sku: Option<String>,
    organisations: Option<Vec<String>>,
    quotas: Quotas,
}

pub async fn execute(ctx: &Context, args: SessionArgs, force: bool) -> Result<()> {
    let auth = FileAuthService::load(&args.path())?;
    let service = ctx.service(auth)?;

    print_info("Resolving entitlement...", ctx.quiet || ctx.format == OutputFormat::Json);
    let outcome = if force {
        service.force_resolve().await
    } else {
        service.resolve().await
    };

    // The accountant drops quotas while the extension is not installed
    let quotas = match &outcome {
        ResolveOutcome::Resolved(resolved) => resolved.quotas.clone().unwrap_or_default(),
        _ => service.quotas(),
    };

    let report = ResolveReport {
        outcome: outcome_label(&outcome).to_string(),
        tier: service.tier().to_string(),
        sku: service.sku(),
        organisations: service.organisations(),
        quotas,
    };

    let mut rows = vec![
        FieldRow::new("outcome", &report.outcome),
        FieldRow::new("tier", &report.tier),
        FieldRow::new("sku", report.sku.as_deref().unwrap_or("-")),
        FieldRow::new(
            "organisations",
            report
                .organisations
                .as_ref()
                .map(|o| o.join(", "))
                .unwrap_or_else(|| "-".to_string()),
        ),
    ];
    if let Some(reset) = report.quotas.reset_at() {
        rows.push(FieldRow::new(
            "quota reset",
            reset
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M"),
        ));
    }
    print_rows_or_json(&rows, &report, ctx.format)?;

    if ctx.format == OutputFormat::Table && !report.quotas.is_empty() {
        print_rows_or_json(&quota_rows(&report.quotas), &report.quotas, ctx.format)?;
    }
    Ok(())
}

fn outcome_label(outcome: &ResolveOutcome) -> &'static str {
    match outcome {
        ResolveOutcome::Alternate => "alternate",
        ResolveOutcome::SignedOut => "signed_out",
        ResolveOutcome::AlreadyResolved => "already_resolved",
        ResolveOutcome::Resolved(_) => "resolved",
        ResolveOutcome::Superseded => "superseded",
    }
}

fn quota_rows(quotas: &Quotas) -> Vec<QuotaRow> {
    QuotaKind::ALL
        .iter()
        .filter_map(|kind| {
            quotas.get(*kind).map(|snapshot| QuotaRow {
                kind: kind.to_string(),
                remaining: if snapshot.unlimited {
                    "unlimited".to_string()
                } else {
                    format!("{}", snapshot.remaining)
                },
                total: format!("{}", snapshot.total),
                percent: format!("{:.1}", snapshot.percent_remaining),
                exceeded: snapshot.is_exceeded(),
            })
        })
        .collect()
}
