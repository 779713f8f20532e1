use std::{io::Write, process};

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use bootshim::{
    cli::{Cli, Commands, parse_args},
    config::{self, LaunchPlan, TemplateJob},
    constants::{EXIT_LAUNCH_FAILED, EXIT_RENDER_FAILED, EXIT_USAGE},
    env::EnvMap,
    error::RenderError,
    render::{self, Rendered, Renderer},
    supervisor::{self, ExitOutcome, Supervisor},
};

fn main() {
    let args = parse_args();
    init_logging(&args);
    process::exit(execute(args));
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn execute(args: Cli) -> i32 {
    let plan = match load_plan(&args) {
        Ok(plan) => plan,
        Err(err) => {
            error!("{err}");
            return EXIT_USAGE;
        }
    };

    let env = match EnvMap::from_process_with_file(plan.env_file.as_deref()) {
        Ok(env) => env,
        Err(err) => {
            error!("{err}");
            return EXIT_RENDER_FAILED;
        }
    };
    debug!("Environment snapshot holds {} variable(s)", env.len());

    match args.command {
        Commands::Render { stdout, check, .. } => {
            let rendered = match render_all(&plan, &env) {
                Ok(rendered) => rendered,
                Err(err) => {
                    error!("{err}");
                    return EXIT_RENDER_FAILED;
                }
            };

            if check {
                for (job, output) in &rendered {
                    info!(
                        "{} renders cleanly; references [{}], substitutes [{}]",
                        job.source.display(),
                        output.referenced.join(", "),
                        output.substituted.join(", ")
                    );
                }
                info!("{} template(s) render cleanly", rendered.len());
                return 0;
            }

            if stdout {
                let mut out = std::io::stdout().lock();
                for (_, output) in &rendered {
                    if let Err(err) = out.write_all(output.text.as_bytes()) {
                        error!("Failed to write rendered output: {err}");
                        return EXIT_RENDER_FAILED;
                    }
                }
                return 0;
            }

            match publish_all(&rendered) {
                Ok(()) => 0,
                Err(err) => {
                    error!("{err}");
                    EXIT_RENDER_FAILED
                }
            }
        }
        Commands::Run { .. } => {
            let Some(mut spec) = plan.launch.clone() else {
                error!("No command to run; pass one after `--` or set `command` in the config file");
                return EXIT_USAGE;
            };

            if let Err(err) = render_all(&plan, &env).and_then(|rendered| publish_all(&rendered)) {
                error!("{err}; not starting '{}'", spec.program);
                return EXIT_RENDER_FAILED;
            }

            if plan.env_file.is_some() {
                spec.env = Some(env);
            }

            let mut supervisor = Supervisor::new(spec);
            match supervisor.run() {
                Ok(outcome) => {
                    if let ExitOutcome::Signaled(signal) = outcome
                        && plan.propagate_signal
                    {
                        supervisor::reraise(signal);
                    }
                    outcome.exit_code()
                }
                Err(err) if err.is_launch_failure() => EXIT_LAUNCH_FAILED,
                Err(err) => {
                    error!("{err}");
                    1
                }
            }
        }
    }
}

fn load_plan(args: &Cli) -> Result<LaunchPlan, bootshim::error::ConfigError> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Some(config::load_config(path)?)
        }
        None => None,
    };
    config::resolve(file, args.command.overrides())
}

/// Renders every template in memory so nothing is published unless all succeed.
fn render_all<'a>(
    plan: &'a LaunchPlan,
    env: &EnvMap,
) -> Result<Vec<(&'a TemplateJob, Rendered)>, RenderError> {
    let renderer = Renderer::new(plan.render.clone());

    plan.templates
        .iter()
        .map(|job| -> Result<_, RenderError> {
            Ok((job, renderer.render_to_string(&job.source, env)?))
        })
        .collect()
}

fn publish_all(rendered: &[(&TemplateJob, Rendered)]) -> Result<(), RenderError> {
    for (job, output) in rendered {
        render::publish(&job.destination, output.text.as_bytes(), job.mode)?;
        info!(
            "Rendered {} -> {} ({} variable(s))",
            job.source.display(),
            job.destination.display(),
            output.substituted.len()
        );
    }
    Ok(())
}
