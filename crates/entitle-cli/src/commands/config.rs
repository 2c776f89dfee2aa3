//! Config commands
//!
//! Commands for inspecting the effective configuration.

use anyhow::Result;
use clap::Subcommand;

use super::Context;
use crate::output::{print_info, print_rows_or_json, FieldRow};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}

pub async fn execute(ctx: &Context, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => show_config(ctx),
        ConfigAction::Path => {
            let path = entitle_core::config::get_config_path()?;
            print_info(&path.display().to_string(), false);
            Ok(())
        }
    }
}

fn show_config(ctx: &Context) -> Result<()> {
    let config = &ctx.config;
    let rows = vec![
        FieldRow::new("provider", config.provider_id()),
        FieldRow::new("entitlement_url", config.resolved_entitlement_url()),
        FieldRow::new("signup_url", &config.signup_url),
        FieldRow::new("usage_url", &config.usage_url),
        FieldRow::new("scopes", format!("{:?}", config.provider_scopes)),
        FieldRow::new("allow_anonymous_access", config.allow_anonymous_access),
        FieldRow::new("disable_ai_features", config.disable_ai_features),
        FieldRow::new("show_all_models", config.show_all_models),
        FieldRow::new("ready_timeout_secs", config.ready_timeout().as_secs()),
        FieldRow::new("state_path", ctx.store.path().display()),
    ];
    print_rows_or_json(&rows, config, ctx.format)
}
