use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kimai_aggregator_core::api::{AuthApi, AuthenticatedClient, KimaiApi};
use kimai_aggregator_core::auth::{spawn_session_sync, Credential, CredentialStore, LogoutBus, Session, SessionData};
use kimai_aggregator_core::cache::{CacheAges, CacheManager};
use kimai_aggregator_core::config::Config;
use kimai_aggregator_core::models::ProjectProgress;
use kimai_aggregator_core::queue::{DrainReport, FileStore, OfflineQueue, QueuedOperation};
use kimai_aggregator_core::sync::{SaveOutcome, SyncService};

/// Used when the platform has no cache directory
const FALLBACK_DATA_DIR: &str = "./data";

fn data_dir_or_fallback(dir: Result<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|e| {
        warn!(error = %e, fallback = FALLBACK_DATA_DIR, "No cache directory available");
        PathBuf::from(FALLBACK_DATA_DIR)
    })
}

/// Everything a command needs, wired together once at start-up.
pub struct App {
    pub config: Config,
    credentials: CredentialStore,
    session: Arc<Mutex<Session>>,
    auth: AuthApi,
    sync: Arc<SyncService>,
    kimai: Option<KimaiApi>,
    cache: CacheManager,
    session_task: JoinHandle<()>,
}

impl App {
    /// Create a new application instance. Must run inside the tokio runtime.
    pub fn new(config: Config, kimai_token: Option<String>) -> Result<Self> {
        let data_dir = data_dir_or_fallback(config.data_dir());
        debug!(?data_dir, "Data directory configured");

        let mut session = Session::new(data_dir.clone());
        match session.load() {
            Ok(found) => debug!(found, "Session loaded"),
            Err(e) => warn!(error = %e, "Failed to load session"),
        }

        let credentials = CredentialStore::new();
        session.restore_into(&credentials);
        let logout = LogoutBus::new();

        let auth = AuthApi::new(
            config.auth_url.as_str(),
            credentials.clone(),
            logout.clone(),
            config.request_timeout(),
        )?;

        let backend = AuthenticatedClient::builder(config.api_url.as_str())
            .timeout(config.request_timeout())
            .refresh(auth.refresh_url(), logout.clone())
            .build(credentials.clone())?;

        let storage = FileStore::new(data_dir.join("storage"))
            .context("Failed to open queue storage")?;
        let queue = Arc::new(OfflineQueue::load(storage, config.queue.clone()));
        let sync = Arc::new(SyncService::new(backend, queue));

        // Kimai API tokens do not expire, so this client never refreshes
        let kimai = kimai_token
            .map(|token| {
                AuthenticatedClient::builder(config.kimai_url.as_str())
                    .timeout(config.request_timeout())
                    .build(CredentialStore::with_credential(Credential::new(token, None)))
            })
            .transpose()?
            .map(KimaiApi::new);

        let cache = CacheManager::new(data_dir.join("cache"))?;

        let session = Arc::new(Mutex::new(session));
        let session_task = spawn_session_sync(session.clone(), credentials.clone(), &logout);

        Ok(Self {
            config,
            credentials,
            session,
            auth,
            sync,
            kimai,
            cache,
            session_task,
        })
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated()
    }

    pub fn username(&self) -> Option<String> {
        self.lock_session().username().map(str::to_string)
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn login(&mut self, email: &str, password: &str) -> Result<()> {
        let credential = self
            .auth
            .login(email, password)
            .await
            .context("Login failed")?;
        self.remember_login(email, credential)
    }

    pub async fn register(&mut self, name: &str, email: &str, password: &str) -> Result<()> {
        let credential = self
            .auth
            .register(name, email, password)
            .await
            .context("Registration failed")?;
        self.remember_login(email, credential)
    }

    fn remember_login(&mut self, email: &str, credential: Credential) -> Result<()> {
        {
            let mut session = self.lock_session();
            session.update(SessionData::new(email, credential));
            session.save().context("Failed to save session")?;
        }

        self.config.last_username = Some(email.to_string());
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.auth.logout().await;
        // The session task reacts too, but the process may exit before it runs
        self.lock_session().clear()
    }

    // =========================================================================
    // Kimai data
    // =========================================================================

    /// Fetch the last `days` of Kimai data into the cache and summarize it
    pub async fn pull(&self, days: i64) -> Result<Vec<ProjectProgress>> {
        let kimai = self
            .kimai
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No Kimai API token configured (set KIMAI_API_TOKEN)"))?;

        let end = Local::now().naive_local();
        let begin = end - chrono::Duration::days(days);

        let (projects, activities, timesheets) = tokio::try_join!(
            kimai.fetch_projects(),
            kimai.fetch_activities(),
            kimai.fetch_timesheets(begin, end)
        )?;

        if let Err(e) = self.cache.save_projects(&projects) {
            warn!(error = %e, "Failed to cache projects");
        }
        if let Err(e) = self.cache.save_activities(&activities) {
            warn!(error = %e, "Failed to cache activities");
        }
        if let Err(e) = self.cache.save_timesheets(&timesheets) {
            warn!(error = %e, "Failed to cache timesheets");
        }
        info!(
            projects = projects.len(),
            activities = activities.len(),
            timesheets = timesheets.len(),
            "Kimai data pulled"
        );

        Ok(ProjectProgress::summarize(&projects, &timesheets))
    }

    /// Summarize whatever is cached, without touching the network
    pub fn cached_summary(&self) -> Result<(Vec<ProjectProgress>, CacheAges)> {
        let projects = self.cache.load_projects()?.map(|c| c.data).unwrap_or_default();
        let timesheets = self.cache.load_timesheets()?.map(|c| c.data).unwrap_or_default();
        Ok((
            ProjectProgress::summarize(&projects, &timesheets),
            self.cache.get_cache_ages(),
        ))
    }

    pub fn cached_activity_count(&self) -> Result<usize> {
        Ok(self.cache.load_activities()?.map_or(0, |c| c.data.len()))
    }

    pub fn is_cache_stale(&self) -> bool {
        self.cache.any_stale()
    }

    // =========================================================================
    // Settings and offline queue
    // =========================================================================

    pub async fn save_settings(&self, settings: Value) -> Result<SaveOutcome> {
        Ok(self.sync.save_settings(settings).await?)
    }

    pub async fn save_data(&self, data_type: &str, data: Value) -> Result<SaveOutcome> {
        Ok(self.sync.save_data(data_type, data).await?)
    }

    pub fn queued(&self) -> Vec<QueuedOperation> {
        self.sync.queue().operations()
    }

    pub async fn flush_queue(&self) -> DrainReport {
        self.sync.flush().await
    }

    /// Flush periodically until every queued operation is sent or dropped
    pub async fn drain_queue(&self, every: Duration) {
        let flusher = self.sync.clone().spawn_periodic_flush(every);
        while !self.sync.queue().is_empty() {
            tokio::time::sleep(every).await;
        }
        flusher.abort();
    }

    pub fn remove_queued(&self, id: &str) -> bool {
        self.sync.queue().remove(id)
    }

    pub fn clear_queue(&self) {
        self.sync.queue().clear();
    }

    /// Persist the latest credential (a refresh may have happened) and stop
    /// the session task.
    pub fn shutdown(self) {
        self.session_task.abort();
        if let Some(credential) = self.credentials.current() {
            let mut session = self.lock_session();
            session.update_credential(credential);
            if let Err(e) = session.save() {
                warn!(error = %e, "Failed to save session on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_falls_back_to_local_directory() {
        let dir = data_dir_or_fallback(Err(anyhow::anyhow!("Could not find cache directory")));
        assert_eq!(dir, PathBuf::from("./data"));

        let dir = data_dir_or_fallback(Ok(PathBuf::from("/var/cache/kimai-aggregator")));
        assert_eq!(dir, PathBuf::from("/var/cache/kimai-aggregator"));
    }
}
