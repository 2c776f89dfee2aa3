//! Sign-up command
//!
//! Runs the free-plan sign-up with sessions from a JSON file.

use anyhow::Result;
use entitle_core::SignUpOutcome;
use serde_json::json;

use super::{Context, FileAuthService, SessionArgs};
use crate::output::{print_error, print_success, OutputFormat};

pub async fn execute(ctx: &Context, args: SessionArgs) -> Result<()> {
    let auth = FileAuthService::load(&args.path())?;
    let service = ctx.service(auth)?;

    let outcome = service.sign_up_free().await?;

    if ctx.format == OutputFormat::Json {
        let value = match outcome {
            SignUpOutcome::Success { subscribed } => json!({
                "success": true,
                "subscribed": subscribed,
                "tier": service.tier(),
            }),
            SignUpOutcome::Failed { code } => json!({ "success": false, "code": code }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match outcome {
        SignUpOutcome::Success { subscribed: true } => {
            print_success("Signed up for the free plan.", ctx.quiet)
        }
        SignUpOutcome::Success { subscribed: false } => {
            print_success("Already signed up for the free plan.", ctx.quiet)
        }
        SignUpOutcome::Failed { code } => {
            print_error(&format!("Sign-up failed (code {}).", code));
            anyhow::bail!("sign-up failed");
        }
    }
    Ok(())
}
