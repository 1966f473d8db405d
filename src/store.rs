use std::{future::Future, pin::Pin, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    domain::{App, Deployment, DomainError},
    state::{JsonSnapshotStore, StoreError},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Record store seam used by the HTTP layer.
///
/// Every call observes the backing store as it is at call time; callers get
/// plain values back and must call again to see later changes.
pub trait AppStore: Send + Sync + 'static {
    /// Fails with `AppNameConflict` when the name is already taken.
    fn create(&self, app: App) -> BoxFuture<'_, Result<App, StoreError>>;

    fn find_by_name(&self, name: String) -> BoxFuture<'_, Result<App, StoreError>>;

    /// Apps in creation order.
    fn list(&self) -> BoxFuture<'_, Result<Vec<App>, StoreError>>;

    fn delete(&self, name: String) -> BoxFuture<'_, Result<(), StoreError>>;

    fn record_deployment(&self, deployment: Deployment) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Forgets the recorded deployment of `app_name`, if any. The app stays.
    fn clear_deployment(&self, app_name: String) -> BoxFuture<'_, Result<(), StoreError>>;

    fn find_deployment(&self, app_name: String) -> BoxFuture<'_, Result<Deployment, StoreError>>;
}

/// [`AppStore`] over a process-local [`JsonSnapshotStore`].
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Mutex<JsonSnapshotStore>>,
}

impl LocalStore {
    pub fn new(store: JsonSnapshotStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn shared(&self) -> Arc<Mutex<JsonSnapshotStore>> {
        self.inner.clone()
    }
}

fn missing_app(name: String) -> StoreError {
    DomainError::MissingApp { name }.into()
}

impl AppStore for LocalStore {
    fn create(&self, app: App) -> BoxFuture<'_, Result<App, StoreError>> {
        Box::pin(async move { self.inner.lock().await.create_app(app) })
    }

    fn find_by_name(&self, name: String) -> BoxFuture<'_, Result<App, StoreError>> {
        Box::pin(async move {
            let store = self.inner.lock().await;
            store.get_app(&name).ok_or_else(|| missing_app(name))
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<App>, StoreError>> {
        Box::pin(async move { Ok(self.inner.lock().await.list_apps()) })
    }

    fn delete(&self, name: String) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let deleted = self.inner.lock().await.delete_app(&name)?;
            if !deleted {
                return Err(missing_app(name));
            }
            Ok(())
        })
    }

    fn record_deployment(&self, deployment: Deployment) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.inner.lock().await.record_deployment(deployment) })
    }

    fn clear_deployment(&self, app_name: String) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.inner.lock().await.clear_deployment(&app_name)?;
            Ok(())
        })
    }

    fn find_deployment(&self, app_name: String) -> BoxFuture<'_, Result<Deployment, StoreError>> {
        Box::pin(async move {
            let store = self.inner.lock().await;
            store
                .get_deployment(&app_name)
                .ok_or_else(|| missing_app(app_name))
        })
    }
}
