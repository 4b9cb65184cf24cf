use std::sync::Arc;
use std::time::Duration;

use session_coordinator::{
    AuthPhase, Coordinator, Credentials, GuardDecision, HttpBackend, RouteGuard, SessionEvent,
};
use tracing::{info, warn};

use crate::assets::{AssetClient, render_tree};
use crate::config::Settings;
use crate::error::{CliError, Result};

pub struct CommandExecutor {
    coordinator: Arc<Coordinator>,
    assets: AssetClient,
    credentials: Option<Credentials>,
}

impl CommandExecutor {
    pub fn new(settings: Settings) -> Result<Self> {
        let backend = Arc::new(HttpBackend::new(settings.backend)?);
        let coordinator = Arc::new(Coordinator::new(
            settings.coordinator,
            backend.clone(),
            backend,
        ));
        let assets = AssetClient::new(Arc::clone(&coordinator), settings.asset_path);
        let credentials = match (settings.username, settings.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        };

        Ok(Self {
            coordinator,
            assets,
            credentials,
        })
    }

    /// Restore the session, signing in with the configured credentials if needed.
    pub async fn connect(&self) -> Result<()> {
        if self.coordinator.start().await == AuthPhase::Authenticated {
            return Ok(());
        }

        let credentials = self.credentials.as_ref().ok_or(CliError::NotSignedIn)?;
        self.coordinator.sign_in(credentials).await?;
        Ok(())
    }

    fn require_session(&self) -> Result<()> {
        match RouteGuard::new().decide(&self.coordinator.current_session()) {
            GuardDecision::Allow => Ok(()),
            GuardDecision::Wait | GuardDecision::RedirectToAuth => Err(CliError::NotSignedIn),
        }
    }

    pub async fn whoami(&self) -> Result<()> {
        self.require_session()?;
        let session = self.coordinator.current_session();
        let Some(principal) = session.principal.as_deref() else {
            return Err(CliError::NotSignedIn);
        };

        println!("{}", principal.display_name());
        if !principal.roles().is_empty() {
            let roles: Vec<&str> = principal.roles().iter().map(String::as_str).collect();
            println!("roles: {}", roles.join(", "));
        }
        if let Some(valid_until) = session.valid_until {
            println!("session valid until: {}", valid_until.to_rfc3339());
        }
        Ok(())
    }

    pub async fn tree(&self, filter: Option<&str>, json: bool) -> Result<()> {
        self.require_session()?;
        let mut roots = self.assets.hierarchy().await?;
        if let Some(term) = filter {
            roots = roots.iter().filter_map(|root| root.filter(term)).collect();
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&roots)?);
        } else if roots.is_empty() {
            println!("(no assets)");
        } else {
            print!("{}", render_tree(&roots));
        }
        Ok(())
    }

    pub async fn add(&self, name: &str, parent: &str) -> Result<()> {
        self.require_session()?;
        let message = self.assets.add(name, parent).await?;
        println!("{}", non_empty_or(message, "Asset added"));
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.require_session()?;
        let message = self.assets.remove(name).await?;
        println!("{}", non_empty_or(message, "Asset removed"));
        Ok(())
    }

    /// Poll the hierarchy until Ctrl-C, keeping the session alive.
    pub async fn watch(&self, interval: Duration) -> Result<()> {
        self.watch_until(interval, tokio::signal::ctrl_c()).await
    }

    /// Poll the hierarchy until `stop` completes, including mid-fetch.
    async fn watch_until<S: Future>(&self, interval: Duration, stop: S) -> Result<()> {
        self.require_session()?;
        let _events = self.coordinator.subscribe(|event, _| match event {
            SessionEvent::Renewed(identity) => {
                info!(user = %identity.display_name(), "Session renewed")
            }
            SessionEvent::Cleared { reason } => {
                warn!(reason = %reason.describe(), "Session ended")
            }
            _ => {}
        });

        let mut sessions = self.coordinator.watch();
        let mut ticker = tokio::time::interval(interval);
        info!(?interval, "Watching asset hierarchy (Ctrl-C to stop)");

        let mut stop = std::pin::pin!(stop);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("Interrupted");
                    return Ok(());
                }
                changed = sessions.changed() => {
                    if changed.is_err() || !sessions.borrow_and_update().is_authenticated() {
                        return Err(CliError::NotSignedIn);
                    }
                }
                _ = ticker.tick() => {
                    let fetched = tokio::select! {
                        biased;
                        _ = &mut stop => {
                            info!("Interrupted");
                            return Ok(());
                        }
                        fetched = self.assets.hierarchy() => fetched,
                    };
                    match fetched {
                        Ok(roots) => {
                            let count: usize = roots.iter().map(|r| r.count()).sum();
                            info!(roots = roots.len(), assets = count, "Hierarchy fetched");
                        }
                        Err(CliError::Send(e)) if e.is_session_lost() => return Err(e.into()),
                        Err(e) => warn!(error = %e, "Failed to fetch hierarchy"),
                    }
                }
            }
        }
    }

    /// End the session. The cookie jar dies with the process, so the
    /// server-side session is ended too.
    pub async fn close(&self) {
        if self.coordinator.current_session().is_authenticated() {
            self.coordinator.logout().await;
        } else {
            self.coordinator.shutdown();
        }
    }
}

fn non_empty_or(message: String, fallback: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        fallback.to_string()
    } else {
        message.to_string()
    }
}
