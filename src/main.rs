use std::path::PathBuf;

use futures::StreamExt;

use curtain_client::config::{Config, SavedCredentials};
use curtain_client::error::{AppError, Result};
use curtain_client::models::Site;
use curtain_client::App;

const USAGE: &str = "Usage: curtain <command>

Commands:
  --sites                       List registered sites
  --add-site <host> [api_key]   Register a backend
  --activate <host>             Route requests to a registered backend
  --remove-site <host>          Remove a backend and its cached datasets
  --login <user> <password>     Obtain credentials from the active backend
  --logout                      Forget stored credentials
  --sync                        Fetch datasets and filter lists into the cache
  --datasets                    List cached datasets
  --filters [category]          List cached filter lists
  --scan <link>                 Fetch the dataset a shared link points at
  --download <id> [dir]         Download a cached dataset's payload";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };

    let config = Config::load()?;
    let app = App::new(&config).await?;
    restore_credentials(&app)?;

    let result = run(&app, &config, command, &args[1..]).await;

    if let Err(e) = &result {
        if e.needs_reauthentication() {
            eprintln!("Session expired. Run: curtain --login <user> <password>");
        }
    }
    persist_credentials(&app)?;
    result
}

async fn run(app: &App, config: &Config, command: &str, rest: &[String]) -> Result<()> {
    match (command, rest) {
        ("--sites", _) => {
            let mut sites = Box::pin(app.sites.list_sites());
            if let Some(sites) = sites.next().await {
                for site in sites? {
                    let marker = if site.active { "*" } else { " " };
                    let synced = site
                        .last_sync
                        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!("{} {}  (last sync: {})", marker, site.hostname, synced);
                }
            }
        }

        ("--add-site", [host, api_key @ ..]) => {
            let mut site = Site::new(host.as_str());
            site.api_key = api_key.first().cloned();
            app.sites.register(site).await?;
            println!("Registered {}", host);
        }

        ("--activate", [host]) => {
            app.switch_site(host).await?;
            SavedCredentials::remove()?;
            println!("Active site: {}", host);
        }

        ("--remove-site", [host]) => {
            app.remove_site(host).await?;
            println!("Removed {}", host);
        }

        ("--login", [user, password]) => {
            app.login(user, password).await?;
            println!("Signed in as {}", user);
        }

        ("--logout", _) => {
            app.credentials.clear();
            SavedCredentials::remove()?;
            println!("Signed out");
        }

        ("--sync", _) => {
            let datasets = app.sync_datasets().await?;
            let filters = app.sync_filter_lists(None).await?;
            println!("Synced {} datasets and {} filter lists", datasets, filters);
        }

        ("--datasets", _) => {
            for dataset in app.repository.get_all_datasets().await? {
                let state = if dataset.enabled { "" } else { " [disabled]" };
                println!(
                    "{}  {}  {}{}",
                    dataset.id,
                    dataset.updated_at.format("%Y-%m-%d"),
                    dataset.description,
                    state
                );
            }
        }

        ("--filters", category) => {
            let lists = match category.first() {
                Some(category) => app.repository.get_filter_lists_by_category(category).await?,
                None => app.repository.get_all_filter_lists().await?,
            };
            for list in lists {
                let default = if list.is_default { " (default)" } else { "" };
                println!("{:>5}  {} / {}{}", list.id, list.category, list.name, default);
            }
        }

        ("--scan", [link]) => match app.open_shared_link(link).await? {
            Some(dataset) => println!(
                "{}  {}\n{}",
                dataset.id,
                dataset.description,
                dataset.frontend_link.unwrap_or_default()
            ),
            None => println!("No dataset id found in {:?}", link),
        },

        ("--download", [id, dir @ ..]) => {
            let dir = dir
                .first()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&config.download_dir));
            let report = |percent: u8| eprint!("\rDownloading... {:>3}%", percent);
            let path = app.download_payload(id, &dir, Some(&report)).await?;
            eprintln!();
            println!("Saved {}", path.display());
        }

        _ => {
            println!("{}", USAGE);
            return Err(AppError::Config(format!("unknown command {:?}", command)));
        }
    }

    Ok(())
}

/// Reinstates tokens saved by a previous run, if they belong to the site
/// that is active now.
fn restore_credentials(app: &App) -> Result<()> {
    if let Some(saved) = SavedCredentials::load()? {
        if saved.site == app.sites.active_hostname() {
            app.credentials.set(saved.credentials);
        }
    }
    Ok(())
}

fn persist_credentials(app: &App) -> Result<()> {
    match app.credentials.current() {
        Some(credentials) => SavedCredentials {
            site: app.sites.active_hostname(),
            credentials,
        }
        .save(),
        None => Ok(()),
    }
}
