//! Application state shared across request handlers.

use std::sync::Arc;

use crate::api::auth::AuthGate;
use crate::db::Database;
use crate::notify::Notifier;
use crate::reconcile::LifecycleIngest;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Database,
    notifier: Arc<dyn Notifier>,
    auth: AuthGate,
    ingest: LifecycleIngest,
}

impl AppState {
    /// Create a new application state.
    pub fn new(db: Database, notifier: Arc<dyn Notifier>, auth: AuthGate) -> Self {
        let ingest = LifecycleIngest::new(db.fleet_cache(), db.queue());
        Self {
            inner: Arc::new(AppStateInner {
                db,
                notifier,
                auth,
                ingest,
            }),
        }
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn notifier(&self) -> &dyn Notifier {
        self.inner.notifier.as_ref()
    }

    pub fn auth(&self) -> &AuthGate {
        &self.inner.auth
    }

    /// Lifecycle notification intake.
    pub fn ingest(&self) -> &LifecycleIngest {
        &self.inner.ingest
    }
}
