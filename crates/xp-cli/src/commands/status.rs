use xp_config::{StoreConfig, XpConfig};
use xp_core::{ExperimentStore, WorkState};

fn store_label(store: &StoreConfig) -> String {
    match store {
        StoreConfig::Memory => "memory".to_string(),
        StoreConfig::Sqlite(sqlite) => format!("sqlite ({})", sqlite.path),
        StoreConfig::Postgres(_) => "postgres".to_string(),
    }
}

pub async fn run(
    store: &dyn ExperimentStore,
    config: &XpConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let counts = xp_worker::status(store).await?;

    println!("XP Status");
    println!("=========");
    println!();

    println!("Study: {}", config.name.as_deref().unwrap_or("unnamed"));
    println!("Store: {}", store_label(&config.store));
    if let Some(hostname) = &config.worker.hostname {
        println!("Worker: {}", hostname);
    }
    println!();

    println!("Experiments:");
    let mut total = 0;
    for state in WorkState::ALL {
        let count = counts.get(&state).copied().unwrap_or(0);
        total += count;
        if count > 0 {
            println!("  {:<22} {}", state.as_str(), count);
        }
    }
    if total == 0 {
        println!("  (none)");
    } else {
        println!("  {:<22} {}", "total", total);
    }

    Ok(())
}
