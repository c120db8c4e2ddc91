//! Berth CLI - sandboxes for your workspace

use anyhow::Context as _;
use clap::Parser;
use log::debug;

use berth::cli::commands::{self, CleanOptions};
use berth::cli::{Args, Context, SubCommand};
use berth::orphan::SystemHost;
use berth::output::{format_output, Report};

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn print_report(ctx: &Context, report: &Report) {
    println!("{}", format_output(report, &ctx.format));
}

fn require_runtime(ctx: &Context) -> anyhow::Result<()> {
    ctx.lifecycle.runtime().available()?;
    Ok(())
}

fn run(args: Args) -> anyhow::Result<i32> {
    let ctx = Context::from_args(&args).context("loading configuration")?;
    debug!("workspace: {}", ctx.workspace.display());

    match &args.command {
        SubCommand::Run { command } => {
            require_runtime(&ctx)?;
            let interrupted = commands::install_interrupt_guard()?;
            let command = command
                .iter()
                .map(|a| berth::runtime::shell_quote(a))
                .collect::<Vec<_>>()
                .join(" ");
            let code = commands::run_session(&ctx, &args, Some(&command))?;
            Ok(commands::exit_code_after_interrupt(&interrupted, code))
        }

        SubCommand::Shell => {
            require_runtime(&ctx)?;
            let interrupted = commands::install_interrupt_guard()?;
            let code = commands::run_session(&ctx, &args, None)?;
            Ok(commands::exit_code_after_interrupt(&interrupted, code))
        }

        SubCommand::Attach { name } => {
            require_runtime(&ctx)?;
            let name = name.as_deref().or(args.container.as_deref());
            Ok(commands::attach(&ctx, name)?)
        }

        SubCommand::List { all } => {
            require_runtime(&ctx)?;
            print_report(&ctx, &commands::list(&ctx, *all)?);
            Ok(0)
        }

        SubCommand::Images { all } => {
            require_runtime(&ctx)?;
            print_report(&ctx, &commands::images(&ctx, *all)?);
            Ok(0)
        }

        SubCommand::Info { session_id } => {
            print_report(&ctx, &commands::session_info(&ctx, session_id)?);
            Ok(0)
        }

        SubCommand::Clean {
            all,
            sessions,
            orphans,
            dry_run,
            force,
        } => {
            let options = CleanOptions {
                all: *all,
                sessions: *sessions,
                orphans: *orphans,
                dry_run: *dry_run,
                force: *force,
            };
            if *all || *orphans || !*sessions {
                require_runtime(&ctx)?;
            }
            let host = SystemHost::new();
            let report = commands::clean(
                &ctx,
                options,
                &host,
                &mut commands::prompt_confirm,
                &mut |line: &str| eprintln!("{}", line),
            )?;
            print_report(&ctx, &Report::Clean(report));
            Ok(0)
        }

        SubCommand::Snapshot { action } => {
            require_runtime(&ctx)?;
            let report = commands::snapshot(
                &ctx,
                args.container.as_deref(),
                action,
                &mut commands::prompt_confirm,
            )?;
            print_report(&ctx, &report);
            Ok(0)
        }
    }
}
