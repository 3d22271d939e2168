use std::sync::Arc;

use log::*;

mod admin;
mod api_models;
mod config;
mod db;
mod dialog;
mod errors;
mod models;
mod routes;
mod schema;
mod stats;
mod voting;

use crate::config::Settings;
use crate::db::Store;
use crate::dialog::Dialogs;

/**
 * Struct for carrying application state into tide request handlers
 */
#[derive(Clone, Debug)]
pub struct AppState {
    pub store: Store,
    pub settings: Arc<Settings>,
    pub dialogs: Dialogs,
}

impl AppState {
    pub fn new(store: Store, settings: Settings) -> Self {
        AppState {
            store,
            settings: Arc::new(settings),
            dialogs: Dialogs::new(),
        }
    }
}

fn fatal(what: &str, err: errors::Error) -> std::io::Error {
    error!("{}: {}", what, err);
    std::io::Error::new(std::io::ErrorKind::Other, err)
}

#[async_std::main]
async fn main() -> Result<(), std::io::Error> {
    pretty_env_logger::init();

    let settings = Settings::from_env().map_err(|err| fatal("Could not load settings", err))?;
    info!(
        "Starting with {} admin(s), {} database connection(s)",
        settings.admin_ids.len(),
        settings.max_connections
    );

    let store = Store::connect(&settings)
        .await
        .map_err(|err| fatal("Could not initialize pool", err))?;

    let listen_addr = settings.listen_addr.clone();
    let app = routes::build(AppState::new(store, settings));
    info!("Listening on {}", listen_addr);
    app.listen(listen_addr).await?;
    Ok(())
}
