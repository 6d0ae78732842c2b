//! The site registry.
//!
//! Tracks the sites known to the Router together with their liveness. Sites are never removed:
//! deregistering a site only marks it as [`SiteStatus::Deregistered`], so the identity history
//! stays append-only. A site that registers again with the same declared identity after having
//! been deregistered gets a fresh [`SiteId`].
//!
//! Operations are serialized per site. The registry never calls into the other components.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    common::SiteId,
    error::{CoordinationError, CoordinationResult},
    storage::{RowGuard, Table},
};

/// The liveness status of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteStatus {
    /// The site has been seen recently.
    Active,
    /// The site has not been seen for longer than the staleness threshold. Envelopes addressed
    /// to it still queue up, but it cannot initiate runs.
    Unreachable,
    /// The site left the Router for good.
    Deregistered,
}

/// A registered site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Site {
    pub id: SiteId,
    pub name: String,
    pub description: String,
    /// The stable identity the site declared when registering.
    pub declared_identity: String,
    pub status: SiteStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Site {
    pub fn is_deregistered(&self) -> bool {
        self.status == SiteStatus::Deregistered
    }

    /// Records activity of the site, reviving it if it was unreachable.
    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        if self.status == SiteStatus::Unreachable {
            info!(site_id = %self.id, "site is reachable again");
            self.status = SiteStatus::Active;
        }
    }
}

/// The registry of all the sites known to the Router.
#[derive(Debug, Default)]
pub struct SiteRegistry {
    sites: Table<SiteId, Site>,
    /// The latest site registered under each declared identity.
    identities: Mutex<HashMap<String, SiteId>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new site in [`SiteStatus::Active`] status.
    ///
    /// # Errors
    /// Fails with a conflict if a site with the same declared identity is registered and not
    /// deregistered.
    pub async fn register(
        &self,
        name: &str,
        description: &str,
        declared_identity: &str,
    ) -> CoordinationResult<Site> {
        let name = name.trim();
        let declared_identity = declared_identity.trim();
        if name.is_empty() {
            return Err(CoordinationError::validation("site name must not be empty"));
        }
        if declared_identity.is_empty() {
            return Err(CoordinationError::validation(
                "declared identity must not be empty",
            ));
        }

        let mut identities = self.identities.lock().await;
        if let Some(existing) = identities.get(declared_identity) {
            if let Some(site) = self.sites.lock(existing).await {
                if !site.is_deregistered() {
                    return Err(CoordinationError::conflict(format!(
                        "identity {} is already registered as site {}",
                        declared_identity, site.id
                    )));
                }
            }
        }

        let now = Utc::now();
        let site = Site {
            id: SiteId::new(),
            name: name.to_string(),
            description: description.to_string(),
            declared_identity: declared_identity.to_string(),
            status: SiteStatus::Active,
            registered_at: now,
            last_seen: now,
        };
        self.sites.insert(site.id, site.clone()).await;
        identities.insert(declared_identity.to_string(), site.id);

        info!(site_id = %site.id, name = %site.name, "site registered");
        Ok(site)
    }

    /// Renames a site.
    pub async fn update(
        &self,
        id: SiteId,
        name: &str,
        description: &str,
    ) -> CoordinationResult<Site> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoordinationError::validation("site name must not be empty"));
        }
        let mut site = self.lock_live(id).await?;
        site.name = name.to_string();
        site.description = description.to_string();
        Ok(site.clone())
    }

    /// Records a heartbeat of the site and returns its new last-seen timestamp.
    ///
    /// # Errors
    /// Fails if the site is unknown or deregistered.
    pub async fn heartbeat(&self, id: SiteId) -> CoordinationResult<DateTime<Utc>> {
        let mut site = self.lock_live(id).await?;
        site.touch(Utc::now());
        debug!(site_id = %id, "heartbeat");
        Ok(site.last_seen)
    }

    /// Marks the site as deregistered.
    ///
    /// Whether the site is still engaged in a run is the caller's business; the registry only
    /// checks that the site is known.
    ///
    /// # Errors
    /// Fails if the site is unknown or already deregistered.
    pub async fn deregister(&self, id: SiteId) -> CoordinationResult<()> {
        let mut site = self.lock_live(id).await?;
        site.status = SiteStatus::Deregistered;
        info!(site_id = %id, "site deregistered");
        Ok(())
    }

    /// Moves an active site to [`SiteStatus::Unreachable`] and returns its new status.
    ///
    /// Marking an unreachable site again has no effect.
    ///
    /// # Errors
    /// Fails if the site is unknown or deregistered.
    pub async fn mark_unreachable(&self, id: SiteId) -> CoordinationResult<SiteStatus> {
        let mut site = self.lock_live(id).await?;
        if site.status == SiteStatus::Active {
            site.status = SiteStatus::Unreachable;
            info!(site_id = %id, last_seen = %site.last_seen, "site marked unreachable");
        }
        Ok(site.status)
    }

    /// Marks every active site that has not been seen since `now - threshold` as unreachable
    /// and returns their ids.
    pub async fn sweep_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<SiteId> {
        let cutoff = now - threshold;
        let mut marked = Vec::new();
        for id in self.sites.keys().await {
            if let Some(mut site) = self.sites.lock(&id).await {
                if site.status == SiteStatus::Active && site.last_seen < cutoff {
                    site.status = SiteStatus::Unreachable;
                    marked.push(id);
                }
            }
        }
        marked
    }

    /// Returns the site with the given id, whatever its status.
    pub async fn site(&self, id: SiteId) -> CoordinationResult<Site> {
        self.sites
            .get(&id)
            .await
            .ok_or(CoordinationError::UnknownSite(id))
    }

    /// Returns the latest site registered under the given identity.
    pub async fn lookup(&self, declared_identity: &str) -> CoordinationResult<Site> {
        let id = self
            .identities
            .lock()
            .await
            .get(declared_identity.trim())
            .copied()
            .ok_or_else(|| CoordinationError::UnknownIdentity(declared_identity.to_string()))?;
        self.site(id).await
    }

    /// Returns the site if it is known and not deregistered.
    pub async fn live_site(&self, id: SiteId) -> CoordinationResult<Site> {
        self.lock_live(id).await.map(|site| site.clone())
    }

    /// Returns the status of a site, if it is known.
    pub async fn status(&self, id: SiteId) -> Option<SiteStatus> {
        self.sites.lock(&id).await.map(|site| site.status)
    }

    /// Records activity of a site that polled its mailbox.
    pub(crate) async fn touch(&self, id: SiteId) -> CoordinationResult<()> {
        self.lock_live(id).await?.touch(Utc::now());
        Ok(())
    }

    async fn lock_live(&self, id: SiteId) -> CoordinationResult<RowGuard<Site>> {
        match self.sites.lock(&id).await {
            Some(site) if !site.is_deregistered() => Ok(site),
            _ => Err(CoordinationError::UnknownSite(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register() {
        let registry = SiteRegistry::new();
        let site = registry.register("H1", "hospital", "uid-1").await.unwrap();
        assert_eq!(site.status, SiteStatus::Active);
        assert_eq!(registry.site(site.id).await.unwrap(), site);
        assert_eq!(registry.lookup("uid-1").await.unwrap().id, site.id);
    }

    #[tokio::test]
    async fn test_register_rejects_blank_fields() {
        let registry = SiteRegistry::new();
        let err = registry.register(" ", "", "uid-1").await.unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));
        let err = registry.register("H1", "", "").await.unwrap_err();
        assert!(matches!(err, CoordinationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_register_duplicate_identity() {
        let registry = SiteRegistry::new();
        let first = registry.register("H1", "", "uid-1").await.unwrap();

        let err = registry.register("H1 again", "", "uid-1").await.unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict(_)));

        // an unreachable site still holds its identity
        registry.mark_unreachable(first.id).await.unwrap();
        let err = registry.register("H1 again", "", "uid-1").await.unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_reregister_after_deregistration() {
        let registry = SiteRegistry::new();
        let first = registry.register("H1", "", "uid-1").await.unwrap();
        registry.deregister(first.id).await.unwrap();

        let second = registry.register("H1", "", "uid-1").await.unwrap();
        assert_ne!(first.id, second.id);
        // the old identity is kept, marked as deregistered
        assert_eq!(
            registry.site(first.id).await.unwrap().status,
            SiteStatus::Deregistered
        );
        assert_eq!(registry.lookup("uid-1").await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let registry = SiteRegistry::new();
        let site = registry.register("H1", "", "uid-1").await.unwrap();
        let last_seen = registry.heartbeat(site.id).await.unwrap();
        assert!(last_seen >= site.last_seen);

        let err = registry.heartbeat(SiteId::new()).await.unwrap_err();
        assert!(matches!(err, CoordinationError::UnknownSite(_)));

        registry.deregister(site.id).await.unwrap();
        let err = registry.heartbeat(site.id).await.unwrap_err();
        assert_eq!(err, CoordinationError::UnknownSite(site.id));
    }

    #[tokio::test]
    async fn test_heartbeat_revives_unreachable_site() {
        let registry = SiteRegistry::new();
        let site = registry.register("H1", "", "uid-1").await.unwrap();
        assert_eq!(
            registry.mark_unreachable(site.id).await.unwrap(),
            SiteStatus::Unreachable
        );
        // marking twice is harmless
        assert_eq!(
            registry.mark_unreachable(site.id).await.unwrap(),
            SiteStatus::Unreachable
        );

        registry.heartbeat(site.id).await.unwrap();
        assert_eq!(registry.status(site.id).await, Some(SiteStatus::Active));
    }

    #[tokio::test]
    async fn test_deregister_twice() {
        let registry = SiteRegistry::new();
        let site = registry.register("H1", "", "uid-1").await.unwrap();
        registry.deregister(site.id).await.unwrap();
        let err = registry.deregister(site.id).await.unwrap_err();
        assert!(matches!(err, CoordinationError::UnknownSite(_)));
        let err = registry.mark_unreachable(site.id).await.unwrap_err();
        assert!(matches!(err, CoordinationError::UnknownSite(_)));
    }

    #[tokio::test]
    async fn test_update() {
        let registry = SiteRegistry::new();
        let site = registry.register("H1", "", "uid-1").await.unwrap();
        let updated = registry.update(site.id, "Hospital 1", "north").await.unwrap();
        assert_eq!(updated.name, "Hospital 1");
        assert_eq!(updated.description, "north");
        assert!(registry.update(site.id, "", "").await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let registry = SiteRegistry::new();
        let stale = registry.register("H1", "", "uid-1").await.unwrap();
        let gone = registry.register("H2", "", "uid-2").await.unwrap();
        registry.deregister(gone.id).await.unwrap();

        // nothing is stale yet
        let marked = registry.sweep_stale(Utc::now(), Duration::seconds(60)).await;
        assert!(marked.is_empty());

        let later = Utc::now() + Duration::seconds(120);
        let marked = registry.sweep_stale(later, Duration::seconds(60)).await;
        assert_eq!(marked, vec![stale.id]);
        assert_eq!(
            registry.status(stale.id).await,
            Some(SiteStatus::Unreachable)
        );
        assert_eq!(
            registry.status(gone.id).await,
            Some(SiteStatus::Deregistered)
        );
    }
}
