use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use log::{error, LevelFilter};

use recite::catalog::Catalog;
use recite::cli::executor::{self, Task};
use recite::cli::{run, Cli, Plan};
use recite::config::Config;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // init logger
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::from_str(&cli.log_level).unwrap_or(LevelFilter::Warn))
        .init();

    let mut config = match Config::load_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    config.apply_env();

    let catalog_path = cli.catalog.clone().unwrap_or_else(|| config.catalog.path.clone());
    let catalog = match Catalog::build(&catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("Failed to load catalog from '{}': {}", catalog_path, e);
            std::process::exit(1);
        }
    };

    let env_ip = std::env::var("IP").ok();
    let plan = Plan::parse(&cli.items, env_ip.as_deref(), cli.quit || cli.silent);

    if plan.hosts.len() > 1 {
        let mut options = vec![
            "--config".to_string(),
            cli.config.clone(),
            "--catalog".to_string(),
            catalog_path,
            "--log-level".to_string(),
            cli.log_level.clone(),
            "-q".to_string(),
        ];
        if cli.silent {
            options.push("-s".to_string());
        }

        let tasks: Vec<Task> = executor::build_tasks(&plan.hosts, &options, |host| plan.child_items(host));
        executor::list_tasks(&tasks);

        let pb = Arc::new(executor::progress_bar(tasks.len()));
        let silent = cli.silent;
        let progress = Arc::clone(&pb);
        let result = executor::execute_tasks(
            cli.parallel,
            cli.max_retry,
            tasks,
            Arc::clone(&pb),
            move |_, task| executor::run_child(task, silent, Arc::clone(&progress)),
        )
        .await;
        pb.finish_with_message("done");

        if let Err(e) = result {
            error!("Fan-out failed: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let session = tokio::task::spawn_blocking(move || run::run_session(&config, catalog, &plan)).await;
    match session {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => std::process::exit(1),
        Ok(Err(e)) => {
            error!("Session failed: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Session aborted: {}", e);
            std::process::exit(1);
        }
    }
}
