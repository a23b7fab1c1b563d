use std::sync::Arc;

use quiz_room::api;
use quiz_room::config::{Config, LogFormat};
use quiz_room::error::Result;
use quiz_room::quiz::QuizService;
use quiz_room::storage::{JsonFileQuizStore, MemoryStore, QuizStore, UserRecord};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "quiz_room=info,warp=warn";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!(error = %e, "Server failed");
        eprintln!("quiz-room: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.logging.format);

    let store = match &config.storage.users_file {
        Some(path) => {
            let records = UserRecord::load_file(path)?;
            tracing::info!(path = %path.display(), users = records.len(), "Loaded users");
            Arc::new(MemoryStore::with_users(records))
        }
        None => {
            tracing::warn!("USERS_FILE not set, no user can authenticate");
            Arc::new(MemoryStore::new())
        }
    };

    let quizzes: Arc<dyn QuizStore> = match &config.storage.quiz_json_dir {
        Some(dir) => Arc::new(JsonFileQuizStore::new(dir)?),
        None => store.clone(),
    };

    let service = Arc::new(QuizService::new(
        store.clone(),
        store.clone(),
        quizzes,
        store,
    ));

    let routes = api::routes(service, config.public_ws_base());
    let address = config.bind_address();
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Quiz room server listening"
    );

    warp::serve(routes).run(address).await;
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
