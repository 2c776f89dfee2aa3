//! Setup commands
//!
//! Explicit setup actions applied to the persisted state.

use anyhow::Result;
use clap::Subcommand;

use super::{Context, FileAuthService};
use crate::output::{print_info, print_success};

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum SetupAction {
    /// Accept setup: show chat again
    Accept,

    /// Decline setup: hide chat
    Decline,

    /// Postpone setup for this session
    Later,

    /// Record the extension's install state
    Extension {
        /// Extension is installed
        #[arg(long)]
        installed: bool,

        /// Extension is disabled
        #[arg(long)]
        disabled: bool,

        /// Workspace is untrusted
        #[arg(long)]
        untrusted: bool,
    },
}

pub async fn execute(ctx: &Context, action: SetupAction) -> Result<()> {
    let service = ctx.service(FileAuthService::empty())?;

    let (changed, label) = match action {
        SetupAction::Accept => (service.accept_setup(), "accepted"),
        SetupAction::Decline => (service.decline_setup(), "declined"),
        SetupAction::Later => (service.setup_later(), "postponed"),
        SetupAction::Extension {
            installed,
            disabled,
            untrusted,
        } => (
            service.extension_state_changed(installed, disabled, untrusted),
            "extension state recorded",
        ),
    };

    if changed {
        print_success(&format!("Setup {}.", label), ctx.quiet);
    } else {
        print_info("Nothing to change.", ctx.quiet);
    }
    Ok(())
}
