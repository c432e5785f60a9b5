use std::process::ExitCode;
use std::sync::Arc;

use sitecap::browser::Browser;
use sitecap::cli::{Cli, Commands};
use sitecap::config::CrawlConfig;
use sitecap::coordinator::CrawlCoordinator;
use sitecap::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    match cli.command {
        Commands::Crawl { opts } => {
            let config = match opts.build_config() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("configuration error: {}", e);
                    return ExitCode::from(9);
                }
            };
            run_crawl(config).await
        }
        Commands::Validate { opts } => match opts.build_config() {
            Ok(config) => match serde_yaml::to_string(&config) {
                Ok(yaml) => {
                    println!("{}", yaml);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("could not render configuration: {}", e);
                    ExitCode::from(9)
                }
            },
            Err(e) => {
                eprintln!("configuration error: {}", e);
                ExitCode::from(9)
            }
        },
    }
}

async fn run_crawl(config: CrawlConfig) -> ExitCode {
    let log_dir = config.collection_dir().join("logs");
    if let Err(e) = logging::init_logging(&log_dir, &config) {
        eprintln!("logging setup failed: {}", e);
        return ExitCode::from(9);
    }

    let restarts_on_error = config.restarts_on_error;
    let browser = match launch_browser(&config).await {
        Ok(browser) => browser,
        Err(e) => {
            tracing::error!(target: "general", fatal = true, "browser launch failed: {}", e);
            return ExitCode::from(if restarts_on_error { 0 } else { 17 });
        }
    };

    let coordinator = match CrawlCoordinator::new(config).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            tracing::error!(target: "general", "crawl setup failed: {}", e);
            return ExitCode::from(9);
        }
    };

    match coordinator.run(browser).await {
        Ok(exit) => ExitCode::from(exit.code(restarts_on_error) as u8),
        Err(e) => {
            tracing::error!(target: "general", "crawl error: {}", e);
            ExitCode::from(9)
        }
    }
}

#[cfg(feature = "browser")]
async fn launch_browser(
    config: &CrawlConfig,
) -> Result<Arc<dyn Browser>, Box<dyn std::error::Error>> {
    let user_agent = match (&config.user_agent, &config.user_agent_suffix) {
        (Some(agent), Some(suffix)) => Some(format!("{} {}", agent, suffix)),
        (Some(agent), None) => Some(agent.clone()),
        (None, _) => None,
    };
    let opts = sitecap::browser::BrowserLaunchOpts {
        headless: config.headless,
        profile: config.profile.clone(),
        user_agent,
        lang: config.lang.clone(),
        mobile_device: config.mobile_device.clone(),
    };
    let browser = sitecap::chrome::ChromeBrowser::launch(&opts).await?;
    Ok(Arc::new(browser))
}

#[cfg(not(feature = "browser"))]
async fn launch_browser(
    _config: &CrawlConfig,
) -> Result<Arc<dyn Browser>, Box<dyn std::error::Error>> {
    Err("browser support not compiled; rebuild with: cargo build --features browser".into())
}
